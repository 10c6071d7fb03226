use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::model::{Coordinate, GeoTag, LocationSource};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LocationError {
    #[error("location service unavailable")]
    Unavailable,

    #[error("location request timed out after {0:?}")]
    Timeout(Duration),

    #[error("location permission denied")]
    PermissionDenied,

    #[error("device returned an invalid fix: lat={lat}, lon={lon}")]
    InvalidFix { lat: f64, lon: f64 },
}

/// Raw fix as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: Option<f64>,
}

/// Device location service. Dropping the returned future cancels the request.
#[async_trait::async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_position(&self) -> Result<PositionFix, LocationError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    pub timeout_ms: u64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl LocationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Turns device fixes or manual placement into canonical geotags.
///
/// Resolution never blocks submission: every failure is returned as a value
/// and the report is queued without a location.
#[derive(Clone, Default)]
pub struct LocationResolver {
    provider: Option<Arc<dyn LocationProvider>>,
}

impl LocationResolver {
    pub fn new(provider: Arc<dyn LocationProvider>) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    /// A resolver on a platform without a location service.
    pub fn unavailable() -> Self {
        Self { provider: None }
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    #[instrument(skip(self))]
    pub async fn resolve_current(&self, timeout: Duration) -> Result<GeoTag, LocationError> {
        let provider = self.provider.as_ref().ok_or(LocationError::Unavailable)?;

        let fix = match tokio::time::timeout(timeout, provider.current_position()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("location request timed out");
                return Err(LocationError::Timeout(timeout));
            }
        };

        let coordinate = Coordinate::new(fix.latitude, fix.longitude).map_err(|_| {
            LocationError::InvalidFix {
                lat: fix.latitude,
                lon: fix.longitude,
            }
        })?;
        let accuracy_m = fix.accuracy_m.filter(|a| a.is_finite() && *a >= 0.0);

        info!(accuracy_m = ?accuracy_m, "device location resolved");
        Ok(GeoTag {
            coordinate,
            source: LocationSource::Device { accuracy_m },
        })
    }

    pub fn set_manual(&self, coordinate: Coordinate) -> GeoTag {
        GeoTag {
            coordinate,
            source: LocationSource::Manual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    struct FixedProvider(Result<PositionFix, LocationError>);

    #[async_trait::async_trait]
    impl LocationProvider for FixedProvider {
        async fn current_position(&self) -> Result<PositionFix, LocationError> {
            self.0.clone()
        }
    }

    struct HangingProvider;

    #[async_trait::async_trait]
    impl LocationProvider for HangingProvider {
        async fn current_position(&self) -> Result<PositionFix, LocationError> {
            std::future::pending().await
        }
    }

    fn fix(latitude: f64, longitude: f64) -> PositionFix {
        PositionFix {
            latitude,
            longitude,
            accuracy_m: Some(8.5),
        }
    }

    #[tokio::test]
    async fn device_fix_is_canonicalized() {
        let resolver = LocationResolver::new(Arc::new(FixedProvider(Ok(fix(19.076_000_01, 72.8777)))));
        let tag = resolver.resolve_current(Duration::from_secs(1)).await.unwrap();
        assert_eq!(tag.coordinate, Coordinate::new(19.076, 72.8777).unwrap());
        assert_eq!(tag.source, LocationSource::Device { accuracy_m: Some(8.5) });
    }

    #[tokio::test]
    async fn out_of_range_fix_is_invalid() {
        let resolver = LocationResolver::new(Arc::new(FixedProvider(Ok(fix(123.0, 0.0)))));
        assert_matches!(
            resolver.resolve_current(Duration::from_secs(1)).await,
            Err(LocationError::InvalidFix { .. })
        );
    }

    #[tokio::test]
    async fn provider_errors_pass_through() {
        let resolver =
            LocationResolver::new(Arc::new(FixedProvider(Err(LocationError::PermissionDenied))));
        assert_eq!(
            resolver.resolve_current(Duration::from_secs(1)).await,
            Err(LocationError::PermissionDenied)
        );
        assert_eq!(
            LocationResolver::unavailable()
                .resolve_current(Duration::from_secs(1))
                .await,
            Err(LocationError::Unavailable)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        let resolver = LocationResolver::new(Arc::new(HangingProvider));
        let timeout = Duration::from_secs(10);
        assert_eq!(
            resolver.resolve_current(timeout).await,
            Err(LocationError::Timeout(timeout))
        );
    }

    #[test]
    fn manual_placement_always_succeeds() {
        let tag = LocationResolver::unavailable().set_manual(Coordinate::new(-33.86, 151.21).unwrap());
        assert_eq!(tag.source, LocationSource::Manual);
    }
}
