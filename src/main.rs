use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cip_relay::config::Config;
use cip_relay::App;

/// Industrial event-log ingestion and syslog relay pipeline.
#[derive(Parser)]
#[command(name = "cip-relay", version)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "config/config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    match App::start(config).await {
        Ok(app) => {
            app.run().await;
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("start-up failed: {err}");
            ExitCode::FAILURE
        }
    }
}
