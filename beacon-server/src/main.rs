mod config;
use clap::{Parser, Subcommand};
use config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod server;
use server::{run_once, run_server};

#[derive(Parser)]
#[command(name = "beacon")]
#[command(about = "Advertises stored content to the content-routing network")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,

        /// Run a single advertisement tick, then exit
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=info,beacon_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config, once } => {
            tracing::info!("Starting Beacon server with config: {}", config);

            let cfg = match Config::from_file(&config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            tracing::info!(
                "Bind: {}, Database: {}, Indexer: {}, Batch width: {}",
                cfg.bind_addr,
                cfg.database_path.display(),
                cfg.advertisement.indexer_url,
                cfg.advertisement.batch_width
            );

            if once {
                match run_once(cfg).await {
                    Ok(report) => {
                        tracing::info!(
                            "Tick finished: {} published, {} republished, {} up to date, {} failed",
                            report.published,
                            report.republished,
                            report.up_to_date,
                            report.failed
                        );
                    }
                    Err(e) => {
                        tracing::error!("Advertisement tick failed: {}", e);
                        std::process::exit(1);
                    }
                }
                return;
            }

            if let Err(e) = run_server(cfg).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
    }
}
