//! txoflow Indexer binary.
//!
//! Entry point for the indexer service of one topic.

use std::ffi::OsString;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use txoflow_indexer::config::{
    normalize_args, redis_url, DEFAULT_BATCH_SIZE, DEFAULT_START_HEIGHT,
};
use txoflow_indexer::error::{EXIT_CONFIG, EXIT_FATAL, EXIT_OK};
use txoflow_indexer::store::redis::DEFAULT_COMMAND_TIMEOUT;
use txoflow_indexer::{
    CacheConfig, IndexerConfig, IndexerError, IndexerService, RedisCache, RedisStore,
};

/// Folds a topic's event log into token state.
#[derive(Parser, Debug)]
#[command(name = "index", version, about)]
struct Cli {
    /// Topic (token id) to index.
    #[arg(long, short = 't', env = "TOPIC")]
    topic: String,

    /// Height the log starts at.
    #[arg(long, short = 's', default_value_t = DEFAULT_START_HEIGHT)]
    start: u64,

    /// Log verbosity (0 info, 1 debug, 2 trace).
    #[arg(long, short = 'v', default_value_t = 0)]
    verbose: u8,

    /// Log entries folded per commit.
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Durable store address.
    #[arg(long, env = "REDISDB", default_value = "localhost:6379")]
    redis_db: String,

    /// Cache address.
    #[arg(long, env = "REDISCACHE", default_value = "localhost:6379")]
    redis_cache: String,

    /// Operation to perform (defaults to `run`).
    #[command(subcommand)]
    command: Option<Command>,
}

/// Indexer operations.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Follow the log and keep state current.
    Run,
    /// Replay the whole log and replace all state.
    Rebuild,
    /// Rewrite the cache from durable state.
    RebuildCache,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = match parse_cli(std::env::args_os()) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_CONFIG)
            } else {
                ExitCode::from(EXIT_OK)
            };
        }
    };

    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            error!("{:#}", e);
            let code = e
                .downcast_ref::<IndexerError>()
                .map_or(EXIT_FATAL, IndexerError::exit_code);
            ExitCode::from(code)
        }
    }
}

/// Parses the command line, also accepting single-dash long options.
fn parse_cli<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let command = Cli::command();
    let long_names: Vec<&str> = command
        .get_arguments()
        .filter_map(clap::Arg::get_long)
        .collect();
    Cli::try_parse_from(normalize_args(args, &long_names))
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("info,txoflow_indexer={0},txoflow_sdk={0}", level).into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = IndexerConfig::new(cli.topic.as_str())
        .with_start_height(cli.start)
        .with_batch_size(cli.batch_size);
    config.validate().map_err(IndexerError::from)?;
    let db_url = redis_url(&cli.redis_db).map_err(IndexerError::from)?;
    let cache_url = redis_url(&cli.redis_cache).map_err(IndexerError::from)?;

    info!("Starting txoflow indexer");
    info!("Topic: {}", config.topic);
    info!("Start height: {}", config.start_height);
    info!("Durable store: {}", cli.redis_db);
    info!("Cache: {}", cli.redis_cache);

    let store = RedisStore::connect(&db_url, DEFAULT_COMMAND_TIMEOUT)
        .await
        .context("connecting to durable store")?;
    let cache = RedisCache::new(CacheConfig::new(cache_url)).context("creating cache pool")?;
    let service = Arc::new(
        IndexerService::new(config, Arc::new(store), Arc::new(cache))
            .map_err(IndexerError::from)?,
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let stopper = Arc::clone(&service);
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("Shutting down indexer");
                stopper.stop();
            });
            service.run().await?;
        }
        Command::Rebuild => {
            let checkpoint = service.rebuild().await?;
            info!(
                seq = checkpoint.last_seq,
                height = checkpoint.last_height,
                "rebuild complete"
            );
        }
        Command::RebuildCache => {
            let holders = service.rebuild_cache().await?;
            info!(holders, "cache rebuild complete");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_go_style_args() {
        let cli = parse_cli(["index", "-t=abc", "-s=811302", "-v=1", "-batch-size=50"])
            .expect("parse");
        assert_eq!(cli.topic, "abc");
        assert_eq!(cli.start, 811_302);
        assert_eq!(cli.verbose, 1);
        assert_eq!(cli.batch_size, 50);
        assert_eq!(cli.command, None);
    }

    #[test]
    fn test_parse_subcommand() {
        let cli = parse_cli(["index", "--topic", "abc", "-v", "0", "rebuild-cache"]).expect("parse");
        assert_eq!(cli.verbose, 0);
        assert_eq!(cli.command, Some(Command::RebuildCache));
    }
}
