//! Metricshed binary.
//!
//! A one-shot query tool over an archive tree: enumerate metric names
//! matching a pattern, or fetch and print aligned time series for target
//! patterns.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use metricshed_core::{
    ArchiveCache, CacheRefresher, Clock, FetchScheduler, FsBackend, MetricEnumerator,
    ServiceConfig, Shutdown, SystemClock,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Archive root directory (overrides configuration)
    #[arg(short = 'A', long)]
    archive_root: Option<PathBuf>,

    /// Log filter, e.g. "metricshed_core=debug"
    #[arg(long)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enumerate metric names matching a dot-separated glob pattern
    Find {
        pattern: String,
        /// Window start specification (epoch, HH:MM_YYYYMMDD, or relative)
        #[arg(long, default_value = "")]
        from: String,
        /// Window end specification
        #[arg(long, default_value = "")]
        until: String,
    },
    /// Fetch aligned time series for the given target patterns
    Fetch {
        targets: Vec<String>,
        #[arg(long, default_value = "")]
        from: String,
        #[arg(long, default_value = "")]
        until: String,
        /// Cap on returned points per series
        #[arg(long)]
        max_points: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder().parse_lossy(cli.log_filter.as_deref().unwrap_or("info")),
        )
        .with_target(true)
        .init();

    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    if let Some(root) = cli.archive_root {
        config.archives.root = root;
    }
    info!(root = %config.archives.root.display(), "metricshed starting up");

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.trigger();
            }
        });
    }

    let backend = Arc::new(FsBackend::new());
    let clock = Arc::new(SystemClock);
    let cache = Arc::new(ArchiveCache::new());
    let refresher = Arc::new(CacheRefresher::new(
        Arc::clone(&cache),
        backend.clone(),
        clock.clone(),
        config.refresh_config(),
        shutdown.clone(),
    ));
    let enumerator = MetricEnumerator::new(Arc::clone(&cache), Arc::clone(&refresher));
    let scheduler = FetchScheduler::new(cache, backend, config.fetch_config(), shutdown);

    let now = clock.now();
    match cli.command {
        Commands::Find {
            pattern,
            from,
            until,
        } => {
            let t_start = if from.is_empty() {
                0
            } else {
                metricshed_core::parse_timespec(&from, now).0
            };
            let t_end = if until.is_empty() {
                i64::MAX
            } else {
                metricshed_core::parse_timespec(&until, now).0
            };
            for metric in enumerator.enumerate(&pattern, t_start, t_end).await {
                println!("{}", metric);
            }
        }
        Commands::Fetch {
            targets,
            from,
            until,
            max_points,
        } => {
            let query = scheduler
                .gather_targets(
                    &enumerator,
                    &targets,
                    &from,
                    &until,
                    max_points.unwrap_or(config.fetch.max_points),
                    now,
                )
                .await?;
            let (series, descs) = scheduler
                .fetch_all_series(&query.targets, query.t_start, query.t_end, query.t_step)
                .await;
            for (i, target) in query.targets.iter().enumerate() {
                match descs[i] {
                    Some(desc) => println!("# {} {:?}/{:?}", target, desc.value_type, desc.semantics),
                    None => println!("# {} (unresolved)", target),
                }
                let s = &series[i];
                for slot in 0..s.len() {
                    println!("{} {} {}", target, s.when(slot), s.get(slot));
                }
            }
        }
    }

    Ok(())
}
