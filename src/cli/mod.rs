//! Command-line interface for mmv-export.
//!
//! `run` exports a small set of demo metrics until interrupted, `dump`
//! decodes a segment file, `check-config` validates configuration.

use crate::codec::{MetricValue, TimeScale, Unit, ValueKind};
use crate::core::config::{default_config_path, ConfigBuilder};
use crate::core::types::Semantics;
use crate::core::{Config, MmvError, Result};
use crate::publisher::{PublisherOptions, SnapshotPublisher};
use crate::registry::{Metric, MetricRegistry, MetricSpec};
use crate::segment::{SegmentOptions, SegmentReader, SegmentWriter};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Export in-process metrics through a PCP MMV shared memory segment
#[derive(Parser, Debug)]
#[command(name = "mmv-export")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (default: ~/.config/mmv-export/config.yaml)
    #[arg(short, long, global = true, env = "MMV_EXPORT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for segment files
    #[arg(long, global = true, env = "MMV_EXPORT_SEGMENT_DIR")]
    pub segment_dir: Option<PathBuf>,

    /// Segment file name
    #[arg(long, global = true, env = "MMV_EXPORT_NAME")]
    pub name: Option<String>,

    /// Cluster identifier (0-4095)
    #[arg(long, global = true, env = "MMV_EXPORT_CLUSTER_ID", allow_negative_numbers = true)]
    pub cluster_id: Option<i64>,

    /// Registry poll interval in milliseconds
    #[arg(long, global = true, env = "MMV_EXPORT_POLL_MS")]
    pub poll_interval_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long, global = true, env = "MMV_EXPORT_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Publish demo metrics until interrupted
    Run {
        /// Stop after this many seconds
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Decode a segment file
    Dump {
        /// Segment file (default: the configured segment)
        path: Option<PathBuf>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
        /// Give up after this many torn reads
        #[arg(long, default_value_t = 100)]
        attempts: u32,
    },
    /// Validate configuration and exit
    CheckConfig,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Load configuration with proper precedence:
    /// 1. CLI arguments (highest priority)
    /// 2. Config file
    /// 3. Defaults (lowest priority)
    pub async fn load_config(&self) -> Result<Config> {
        let mut builder = ConfigBuilder::new();

        let config_path = match &self.config {
            Some(path) => Some(path.clone()),
            None => default_config_path().filter(|path| path.exists()),
        };

        if let Some(path) = config_path {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    builder = builder.from_yaml(&content)?;
                    tracing::debug!("Loaded configuration from: {:?}", path);
                },
                Err(e) => {
                    return Err(MmvError::config(format!(
                        "Failed to read config file {:?}: {}",
                        path, e
                    )));
                },
            }
        }

        self.build_config_from_args(builder)
    }

    fn build_config_from_args(&self, mut builder: ConfigBuilder) -> Result<Config> {
        if let Some(dir) = &self.segment_dir {
            builder = builder.segment_dir(dir.clone());
        }
        if let Some(name) = &self.name {
            builder = builder.segment_name(name.clone());
        }
        if let Some(cluster) = self.cluster_id {
            builder = builder.cluster_id(cluster);
        }
        if let Some(ms) = self.poll_interval_ms {
            builder = builder.poll_interval(Duration::from_millis(ms));
        }

        builder.debug(self.debug).build()
    }

    /// Initialize logging based on configuration.
    pub fn init_logging(&self, config: &Config) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let env_log_level = std::env::var("MMV_EXPORT_LOG_LEVEL").ok();
        let log_level = if self.debug {
            "debug"
        } else {
            env_log_level.as_deref().unwrap_or(config.logging.level.as_str())
        };

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(config.logging.with_target || self.debug)
            .with_writer(std::io::stderr)
            .compact();

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| MmvError::config(format!("Failed to initialize logging: {}", e)))?;

        Ok(())
    }
}

/// Execute the parsed command.
pub async fn execute(cli: Cli) -> Result<()> {
    let config = cli.load_config().await?;
    cli.init_logging(&config)?;

    match &cli.command {
        Command::CheckConfig => {
            println!("Configuration is valid!");
            println!("  Segment: {}", config.segment.path().display());
            println!("  Cluster id: {}", config.segment.cluster_id);
            println!("  Poll interval: {:?}", config.publisher.poll_interval);
            println!("  Id strategy: {:?}", config.identifiers.strategy);
            Ok(())
        },
        Command::Dump { path, json, attempts } => {
            let path = path.clone().unwrap_or_else(|| config.segment.path());
            dump(path, *json, *attempts)
        },
        Command::Run { duration_secs } => run(config, duration_secs.map(Duration::from_secs)).await,
    }
}

fn dump(path: PathBuf, json: bool, attempts: u32) -> Result<()> {
    let snapshot = SegmentReader::new(path).with_max_attempts(attempts).read()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", snapshot);
    }
    Ok(())
}

/// Metrics the demo exporter keeps updating
struct DemoMetrics {
    ticks: Arc<Metric>,
    uptime: Arc<Metric>,
    queue_depth: [Arc<Metric>; 2],
    state: Arc<Metric>,
}

fn register_demo_metrics(registry: &MetricRegistry) -> Result<DemoMetrics> {
    let ticks = registry.register(MetricSpec::counter("demo.ticks").help("Publisher demo ticks", ""))?;
    let uptime = registry.register(
        MetricSpec::gauge("demo.uptime")
            .unit(Unit::time(TimeScale::Second))
            .help("Seconds since the exporter started", ""),
    )?;
    let queue = |name: &str| {
        registry.register(
            MetricSpec::new(format!("queue[{}].depth", name), ValueKind::U32)
                .semantics(Semantics::Instant)
                .unit(Unit::count())
                .help("Items waiting in the queue", ""),
        )
    };
    let queue_depth = [queue("inbound")?, queue("outbound")?];
    registry.describe_domain("queue", "Work queues", "One instance per work queue")?;
    let state = registry.register(MetricSpec::text("demo.state").initial(MetricValue::Text("starting".into())))?;

    Ok(DemoMetrics {
        ticks,
        uptime,
        queue_depth,
        state,
    })
}

async fn run(config: Config, duration: Option<Duration>) -> Result<()> {
    let registry = Arc::new(MetricRegistry::new());
    let demo = register_demo_metrics(&registry)?;
    if config.publisher.require_frozen_registry {
        registry.freeze();
    }

    let writer = Arc::new(SegmentWriter::new(SegmentOptions::from_config(&config)?));
    let publisher = SnapshotPublisher::new(
        Arc::clone(&registry),
        Arc::clone(&writer),
        PublisherOptions::from(&config.publisher),
    );
    publisher.start().await?;
    demo.state.set_text("running")?;

    tracing::info!(path = %config.segment.path().display(), "Exporting demo metrics");

    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                demo.ticks.inc(1)?;
                demo.uptime.set_f64(started.elapsed().as_secs_f64())?;
                let tick = started.elapsed().as_millis() as u32;
                demo.queue_depth[0].set(MetricValue::U32(tick % 17))?;
                demo.queue_depth[1].set(MetricValue::U32(tick % 5))?;

                if duration.is_some_and(|limit| started.elapsed() >= limit) {
                    break;
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Received shutdown signal, stopping...");
                break;
            }
        }
    }

    demo.state.set_text("stopping")?;
    let stats = writer.stats();
    tracing::info!(
        rebuilds = stats.rebuilds,
        value_writes = stats.value_writes,
        dropped = stats.dropped_updates,
        "Exporter finished"
    );
    publisher.shutdown().await
}
