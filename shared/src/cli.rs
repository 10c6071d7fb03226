use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use coastal_report::config::ReportingConfig;
use coastal_report::connectivity::Connectivity;
use coastal_report::crypto::{CryptoProvider, SealingKey};
use coastal_report::feed::FeedFilter;
use coastal_report::model::{HazardType, ReportDraft, ReportId, UnixTimeMs};
use coastal_report::service::ReportingService;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use zeroize::Zeroize;

const KEY_ENV: &str = "REPORT_QUEUE_KEY";

#[derive(Parser, Debug)]
#[command(name = "report-queue")]
#[command(about = "Inspect and drain the offline coastal hazard report queue")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./report-queue.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pending reports in queue order.
    List,
    /// Dashboard aggregates.
    Stats,
    /// Located pending reports as GeoJSON.
    Feed {
        /// Only this hazard type (label or wire name).
        #[arg(long)]
        hazard: Option<String>,
        /// Only reports created within the last N hours.
        #[arg(long)]
        within_hours: Option<u64>,
    },
    /// Rows that could not be decoded on open.
    Quarantined,
    /// Give a failed report a fresh retry budget.
    Retry { id: String },
    /// Cancel a queued report and delete its media.
    Discard { id: String },
    /// Run one drain cycle against the configured endpoint.
    Drain,
}

/// Queue entry as printed by `list`. Contact details stay out of terminal
/// output.
#[derive(Serialize)]
struct PendingRow<'a> {
    id: &'a str,
    status: &'static str,
    hazard_type: &'static str,
    created_at: UnixTimeMs,
    attempts: u32,
    next_attempt_at: Option<UnixTimeMs>,
    last_error: Option<&'a str>,
    media: usize,
    located: bool,
}

impl<'a> From<&'a ReportDraft> for PendingRow<'a> {
    fn from(draft: &'a ReportDraft) -> Self {
        Self {
            id: draft.id.as_str(),
            status: draft.status.name(),
            hazard_type: draft.hazard_type.wire_name(),
            created_at: draft.created_at,
            attempts: draft.attempts,
            next_attempt_at: draft.next_attempt_at,
            last_error: draft.last_error.as_deref(),
            media: draft.media.len(),
            located: draft.location.is_some(),
        }
    }
}

pub async fn dispatch(args: Args) -> Result<()> {
    let cfg = load_config(args.config.as_deref())?;
    init_logging(&args, &cfg)?;

    let mut builder = ReportingService::builder(cfg);
    if let Some(sealer) = sealer_from_env()? {
        builder = builder.sealer(sealer);
    }
    let service = builder.build().await.context("opening report queue")?;

    match &args.cmd {
        Command::List => {
            let pending = service.pending().await;
            let rows: Vec<PendingRow<'_>> = pending.iter().map(PendingRow::from).collect();
            print_json(&rows)
        }
        Command::Stats => {
            #[derive(Serialize)]
            struct Stats {
                queue: coastal_report::queue::QueueStats,
                metrics: coastal_report::queue::MetricsSnapshot,
            }
            print_json(&Stats {
                queue: service.stats().await,
                metrics: service.metrics(),
            })
        }
        Command::Feed {
            hazard,
            within_hours,
        } => {
            let mut filter = match within_hours {
                Some(hours) => FeedFilter::recent(UnixTimeMs::now(), hours.saturating_mul(3_600_000)),
                None => FeedFilter::default(),
            };
            if let Some(raw) = hazard {
                let hazard_type: HazardType = raw
                    .parse()
                    .map_err(|e| anyhow!("invalid hazard type '{raw}': {e}"))?;
                filter = filter.with_hazard_type(hazard_type);
            }
            print_json(&service.feed_filtered(&filter).await)
        }
        Command::Quarantined => print_json(&service.quarantined().await),
        Command::Retry { id } => {
            let draft = service.retry(&parse_id(id)?).await?;
            print_json(&PendingRow::from(&draft))
        }
        Command::Discard { id } => {
            let draft = service.discard(&parse_id(id)?).await?;
            info!(report_id = %draft.id, "discarded");
            Ok(())
        }
        Command::Drain => {
            service.set_connectivity(Connectivity::Online);
            let report = service.drain_now().await?;
            print_json(&report)
        }
    }
}

fn load_config(user: Option<&Path>) -> Result<ReportingConfig> {
    let path = match user {
        Some(p) => p.to_path_buf(),
        None => {
            let default = PathBuf::from("report-queue.toml");
            if !default.exists() {
                return Ok(ReportingConfig::default());
            }
            default
        }
    };
    ReportingConfig::load(&path).with_context(|| format!("loading config: {}", path.display()))
}

fn sealer_from_env() -> Result<Option<Arc<dyn CryptoProvider>>> {
    let Ok(raw) = std::env::var(KEY_ENV) else {
        return Ok(None);
    };
    let mut bytes = hex::decode(raw.trim()).with_context(|| format!("{KEY_ENV} is not valid hex"))?;
    let key = SealingKey::from_bytes(&bytes);
    bytes.zeroize();
    let sealer: Arc<dyn CryptoProvider> = Arc::new(key.context("building sealing key")?);
    Ok(Some(sealer))
}

fn parse_id(raw: &str) -> Result<ReportId> {
    ReportId::new(raw).map_err(|e| anyhow!("invalid report id '{raw}': {e}"))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_logging(args: &Args, cfg: &ReportingConfig) -> Result<()> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so command output stays parseable.
    let layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(())
}
