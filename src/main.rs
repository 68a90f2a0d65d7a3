use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tracing::{error, info};

use clockwise::{chat, constants, dashboard, gemini::GeminiClient, web_server};

// Define the command-line interface structure using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

// Define the available subcommands
#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Engage in a plain text chat session in the terminal.
    Chat,
    /// Start the web chat UI with tool calling.
    Serve {
        #[arg(long, default_value_t = 9900, help = "Port for the web server.")]
        port: u16,
    },
    /// Start the live stock-index dashboard.
    Dashboard {
        #[arg(long, default_value_t = 9901, help = "Port for the dashboard server.")]
        port: u16,
        #[arg(long, default_value_t = 10, help = "Polling interval in seconds.")]
        interval: u64,
    },
}

fn build_client() -> Result<GeminiClient> {
    let api_key = constants::require_api_key()?;
    Ok(GeminiClient::new(
        constants::GEMINI_BASE_URL.clone(),
        constants::GEMINI_MODEL.clone(),
        api_key,
    ))
}

// The main entry point of the application, using tokio's async runtime
#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for environment variables like API keys)
    dotenvy::dotenv().ok();

    // Initialize tracing (logging) subscriber
    // Reads log level from RUST_LOG environment variable (e.g., RUST_LOG=info,clockwise=debug)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Parse command-line arguments
    let cli = Cli::parse();

    info!("Clockwise starting with command: {:?}", cli.command);

    match cli.command {
        Commands::Chat => {
            let client = build_client()?;
            chat::run_cli_chat(&client)
                .await
                .context("Chat session failed")?;
            info!("Chat session finished.");
        }
        Commands::Serve { port } => {
            let client = build_client()?;

            let mut server_handle =
                tokio::spawn(async move { web_server::start_web_server(port, client).await });

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Ctrl-C received, shutting down web server...");
                }
                res = &mut server_handle => {
                    match res {
                        Ok(Ok(())) => info!("Web server task completed unexpectedly."),
                        Ok(Err(e)) => error!("Web server failed: {:?}", e),
                        Err(e) if e.is_panic() => error!("Web server task panicked: {:?}", e),
                        Err(e) => error!("Web server task failed: {:?}", e),
                    }
                }
            }

            if !server_handle.is_finished() {
                server_handle.abort();
            }
            info!("Shutdown complete.");
        }
        Commands::Dashboard { port, interval } => {
            let quote_url = constants::SENSEX_QUOTE_URL.clone();

            let mut server_handle = tokio::spawn(async move {
                dashboard::start_dashboard(port, quote_url, Duration::from_secs(interval)).await
            });

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Ctrl-C received, shutting down dashboard...");
                }
                res = &mut server_handle => {
                    match res {
                        Ok(Ok(())) => info!("Dashboard task completed unexpectedly."),
                        Ok(Err(e)) => error!("Dashboard failed: {:?}", e),
                        Err(e) if e.is_panic() => error!("Dashboard task panicked: {:?}", e),
                        Err(e) => error!("Dashboard task failed: {:?}", e),
                    }
                }
            }

            if !server_handle.is_finished() {
                server_handle.abort();
            }
            info!("Shutdown complete.");
        }
    }

    Ok(())
}
