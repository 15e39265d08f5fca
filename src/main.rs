use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pg_watch::watcher::NoopWatcher;
use pg_watch::{Config, Result, Runner};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-watch")]
#[command(about = "PostgreSQL change-data-capture runtime", long_about = None)]
#[command(version)]
struct Args {
    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the slots described in a YAML configuration file.
    Start {
        #[arg(help = "Path to the configuration file")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("starting pg-watch v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Start { config } => {
            let config = match Config::from_file(&config) {
                Ok(config) => config,
                Err(e) => {
                    error!("failed to load configuration: {e}");
                    eprintln!("\nDatabase settings come from the config file's `database`");
                    eprintln!("section or from PG_HOST / PG_PORT / PG_DATABASE / PG_USERNAME /");
                    eprintln!("PG_PASSWORD environment variables.");
                    eprintln!("See pg-watch.example.yaml for a full example.");
                    std::process::exit(1);
                }
            };

            info!(
                host = %config.database.host,
                port = config.database.port,
                database = %config.database.database,
                slots = config.slots.len(),
                "configuration loaded"
            );

            let mut runner = Runner::new(config);
            // The built-in watcher: slots configured with `watcher: log`
            // get their events traced by the LoggingWatcher wrapper and
            // otherwise discarded, which makes the binary a change tailer.
            runner.register("log", || NoopWatcher);

            match runner.start().await {
                Ok(()) => {
                    info!("shut down cleanly");
                    Ok(())
                }
                Err(e) => {
                    error!("runner failed: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_watch=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_watch=info,warn"))
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
