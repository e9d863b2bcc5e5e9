use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;
mod websocket;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "taskloom")]
#[command(about = "Taskloom - step graph workflow engine", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "TASKLOOM_CONFIG", default_value = "taskloom.toml")]
    config: PathBuf,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "TASKLOOM_PORT")]
    port: Option<u16>,

    /// Host to bind to (overrides the config file)
    #[arg(long, env = "TASKLOOM_HOST")]
    host: Option<String>,

    /// Directory file-export steps write into (overrides the config file)
    #[arg(short, long, env = "TASKLOOM_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, env = "TASKLOOM_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "taskloom=info,tower_http=debug".into());
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }

    tracing::info!("Starting Taskloom");

    let mut config = ServerConfig::load(&args.config)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(dir) = args.output_dir {
        config.export.output_dir = dir;
    }

    tracing::info!("Export directory: {}", config.export.output_dir.display());

    api::serve(config).await?;

    Ok(())
}
