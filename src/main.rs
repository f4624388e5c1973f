use clap::Parser;
use pg_logical_stream::{Config, Error, LogSink, PgSource, Replicator, Result};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-logical-stream")]
#[command(about = "Stream PostgreSQL logical replication changes from a temporary slot", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-logical-stream");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(Error::Config(e.to_string()));
        }
    };
    config.validate()?;

    info!(
        postgres_host = %config.postgres.host,
        postgres_port = %config.postgres.port,
        postgres_database = %config.postgres.database,
        slot = %config.replication.slot_name,
        plugin = %config.replication.plugin,
        "Configuration summary"
    );

    let source = PgSource::new(config.postgres.clone());
    let mut replicator = Replicator::new(source, config.replication.clone());

    let start = replicator.start(LogSink).await?;
    info!(start = %start, "Streaming changes. Press ENTER or Ctrl+C to stop");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    tokio::select! {
        _ = stdin.next_line() => info!("Stop requested"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = replicator.stream_finished() => info!("Replication stream exited"),
    }

    let summary = replicator.stop().await?;
    info!(
        start = %summary.start,
        flushed = %summary.flushed,
        records = summary.records,
        "Shutdown complete"
    );

    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_logical_stream=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_logical_stream=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
