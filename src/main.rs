//! CLI for groupfeed
//!
//! Subcommands:
//! - `listen`: subscribe to the group feed and print every payload
//! - `config`: print the resolved configuration

use std::time::Duration;

use clap::Parser;
use groupfeed::config::{Settings, load_config};
use groupfeed::utils::logging;
use groupfeed::{ConnectionOptions, GroupChange, HandlerResult, RealtimeSubscriber};
use serde_json::Value;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "groupfeed")]
enum Command {
    /// Subscribe to the group feed and print payloads as JSON lines
    Listen {
        /// Endpoint URL, overriding `websocket.url` from configuration
        #[arg(long)]
        url: Option<String>,
        /// Delay before reconnecting after a dropped connection; 0 disables
        #[arg(long)]
        reconnect_delay_ms: Option<u64>,
    },
    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&settings.log.level);

    let result = match cmd {
        Command::Listen {
            url,
            reconnect_delay_ms,
        } => run_listen(&settings, url, reconnect_delay_ms).await,
        Command::Config => print_config(&settings),
    };

    if let Err(e) = result {
        error!("groupfeed failed: {}", e);
        std::process::exit(1);
    }
}

async fn run_listen(
    settings: &Settings,
    url: Option<String>,
    reconnect_delay_ms: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = RealtimeSubscriber::new(settings.subscriber_config());
    let options = ConnectionOptions {
        url,
        reconnect_delay: reconnect_delay_ms.map(Duration::from_millis),
    };

    let handle = subscriber.create_connection(print_payload, options)?;
    info!("Listening on {} (Ctrl-C to stop)", handle.url());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handle.deactivate().await;
    Ok(())
}

fn print_payload(payload: Value) -> HandlerResult {
    if let Some(change) = GroupChange::from_payload(&payload) {
        info!("study group {} {:?}", change.id, change.kind);
    }
    println!("{}", serde_json::to_string(&payload)?);
    Ok(())
}

fn print_config(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(settings)?);
    Ok(())
}
