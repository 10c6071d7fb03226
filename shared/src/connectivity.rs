use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(self) -> bool {
        self == Connectivity::Online
    }
}

impl From<bool> for Connectivity {
    fn from(online: bool) -> Self {
        if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }
}

/// Publishes the platform's connectivity signal to any number of observers.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<Connectivity>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Record a platform change. Repeated reports of the same state do not
    /// wake observers.
    pub fn set(&self, state: Connectivity) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!(?state, "connectivity changed");
        }
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn observers_see_changes_once() {
        let monitor = ConnectivityMonitor::new(Connectivity::Offline);
        let mut rx = monitor.subscribe();

        monitor.set(Connectivity::Offline);
        assert!(!rx.has_changed().unwrap());

        monitor.set(Connectivity::Online);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Connectivity::Online);
        assert!(monitor.current().is_online());
    }

    #[test]
    fn from_bool() {
        assert_eq!(Connectivity::from(true), Connectivity::Online);
        assert_eq!(Connectivity::from(false), Connectivity::Offline);
    }
}
