//! txoflow Listener binary.
//!
//! Entry point for the chain listener of one topic.

use std::ffi::OsString;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use txoflow_indexer::config::{
    normalize_args, redis_url, DEFAULT_BATCH_SIZE, DEFAULT_START_HEIGHT,
};
use txoflow_indexer::error::{EXIT_CONFIG, EXIT_FATAL, EXIT_OK};
use txoflow_indexer::store::redis::DEFAULT_COMMAND_TIMEOUT;
use txoflow_indexer::RedisStore;
use txoflow_listener::config::DEFAULT_INDEXER_ID;
use txoflow_listener::{ListenerConfig, ListenerError, ListenerService};
use txoflow_sdk::{ChainClientConfig, HttpChainSource};

/// Follows the chain and appends a topic's events to the durable log.
#[derive(Parser, Debug)]
#[command(name = "listener", version, about)]
struct Cli {
    /// Indexer id.
    #[arg(long, short = 'i', default_value = DEFAULT_INDEXER_ID)]
    id: String,

    /// Topic (token id) to follow.
    #[arg(long, short = 't', env = "TOPIC")]
    topic: String,

    /// Height to start from when no progress is recorded.
    #[arg(long, short = 's', default_value_t = DEFAULT_START_HEIGHT)]
    start: u64,

    /// Log verbosity (0 info, 1 debug, 2 trace).
    #[arg(long, short = 'v', default_value_t = 0)]
    verbose: u8,

    /// Maximum transactions fetched concurrently in lite mode.
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Upstream chain data service address.
    #[arg(long, env = "JUNGLEBUS")]
    junglebus: String,

    /// Transaction broadcast service address. Accepted but unused.
    #[arg(long, env = "ARC")]
    arc: Option<String>,

    /// Durable store address.
    #[arg(long, env = "REDISDB", default_value = "localhost:6379")]
    redis_db: String,
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
                .downcast_ref::<ListenerError>()
                .map_or(EXIT_FATAL, ListenerError::exit_code);
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
            format!(
                "info,txoflow_listener={0},txoflow_indexer={0},txoflow_sdk={0}",
                level
            )
            .into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Adds a scheme to a bare host address.
fn service_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.contains("://") {
        address.to_string()
    } else {
        format!("https://{}", address)
    }
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
    let config = ListenerConfig::new(cli.topic.as_str())
        .with_indexer_id(cli.id.as_str())
        .with_start_height(cli.start)
        .with_batch_size(cli.batch_size);
    config.validate().map_err(ListenerError::from)?;
    let db_url = redis_url(&cli.redis_db).map_err(ListenerError::from)?;
    let client = ChainClientConfig::new(service_url(&cli.junglebus));

    info!("Starting txoflow listener");
    info!("Indexer: {}", config.indexer_id);
    info!("Topic: {}", config.topic);
    info!("Start height: {}", config.start_height);
    info!("Chain service: {}", client.base_url);
    info!("Durable store: {}", cli.redis_db);
    if let Some(arc) = &cli.arc {
        info!("Broadcast service: {} (unused)", arc);
    }

    let source = HttpChainSource::new(client.clone()).map_err(ListenerError::from)?;
    let store = RedisStore::connect(&db_url, DEFAULT_COMMAND_TIMEOUT)
        .await
        .map_err(ListenerError::from)
        .context("connecting to durable store")?;
    let service = Arc::new(ListenerService::new(
        config,
        client,
        Arc::new(source),
        Arc::new(store),
    )?);

    let stopper = Arc::clone(&service);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down listener");
        stopper.stop();
    });

    service.run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_url() {
        assert_eq!(
            service_url("junglebus.gorillapool.io"),
            "https://junglebus.gorillapool.io"
        );
        assert_eq!(service_url("http://localhost:8080/"), "http://localhost:8080");
    }

    const TOPIC: &str = "22826aa9edbd03832bd1024866dab85d6abeade94eb011e5a3c3a59f5abdbe26";

    #[test]
    fn test_parse_process_manager_args() {
        let line = format!("listener -id=bsv21 -t={} -s=811302 -v=0", TOPIC);
        let cli = parse_cli(
            line.split_whitespace()
                .chain(["--junglebus", "junglebus.gorillapool.io"]),
        )
        .expect("parse");

        assert_eq!(cli.id, "bsv21");
        assert_eq!(cli.topic, TOPIC);
        assert_eq!(cli.start, 811_302);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_parse_long_and_short_forms() {
        let cli = parse_cli([
            "listener",
            "--id",
            "fungibles",
            "-t",
            "abc",
            "--verbose=2",
            "--junglebus",
            "localhost:8080",
        ])
        .expect("parse");
        assert_eq!(cli.id, "fungibles");
        assert_eq!(cli.topic, "abc");
        assert_eq!(cli.verbose, 2);

        let cli = parse_cli(["listener", "-i=x", "-t", "abc", "-v", "1", "--junglebus", "h"])
            .expect("parse");
        assert_eq!(cli.id, "x");
        assert_eq!(cli.verbose, 1);
    }

    #[test]
    fn test_parse_rejects_bad_verbosity() {
        let err = parse_cli(["listener", "-t", "abc", "-v=high", "--junglebus", "h"])
            .expect_err("not a number");
        assert!(err.use_stderr());
    }
}
