//! Chat Bridge
//!
//! Runs the bridge against a console host: lines typed on stdin play the
//! role of assistant messages (`message_received`), `/bridge ...` lines are
//! administrative commands, and messages the external process injects are
//! printed to stdout.

use async_trait::async_trait;
use chat_bridge::command::{self, AdminCommand};
use chat_bridge::settings::{BridgeSettings, JsonFileSettings, SettingsStore};
use chat_bridge::transport::DefaultTransportFactory;
use chat_bridge::{controller, BridgeHandle, ChatHost, Config, MessageData};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// Host that prints injected messages
struct ConsoleHost;

#[async_trait]
impl ChatHost for ConsoleHost {
    async fn send_message(&self, content: String) -> anyhow::Result<()> {
        println!("\nUser (via bridge): {}", content);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; stdout is the chat
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Load configuration
    let config = Config::from_env();
    info!("Configuration loaded: {:?}", config);

    // Stored settings override the environment
    let store = JsonFileSettings::new(&config.settings_path);
    let bridge_config = if store.path().exists() {
        match store.load() {
            Ok(settings) => {
                info!(path = %store.path().display(), "Loaded bridge settings");
                settings.apply_to(&config.bridge)
            }
            Err(e) => {
                warn!(path = %store.path().display(), error = %e, "Failed to load settings, using environment");
                config.bridge.clone()
            }
        }
    } else {
        config.bridge.clone()
    };
    bridge_config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid bridge configuration: {}", e))?;

    let handle = controller::spawn_with_factory(
        bridge_config,
        Arc::new(ConsoleHost),
        Arc::new(DefaultTransportFactory),
        config.log_capacity,
    );
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Status indicator
    let mut status = handle.subscribe_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            println!("[bridge: {}]", current);
        }
    });
    println!("Chat bridge started. Type a message to forward it, or '/bridge [on|off|status|log|port <n>|mode <client|server|http>|connect|disconnect]'.");

    tokio::select! {
        result = console_loop(&handle, &store) => result?,
        _ = shutdown_signal() => {}
    }

    handle.shutdown().await?;
    info!("Bridge shutdown complete");
    Ok(())
}

async fn console_loop(handle: &BridgeHandle, store: &JsonFileSettings) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("exit") {
            break;
        }

        if !command::is_command(line) {
            handle.message_received(MessageData::new(line))?;
            continue;
        }

        let parsed = match command::parse(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };
        let persist = matches!(
            parsed,
            AdminCommand::Toggle
                | AdminCommand::On
                | AdminCommand::Off
                | AdminCommand::Port(_)
                | AdminCommand::Mode(_)
        );

        match command::execute(handle, parsed).await {
            Ok(reply) => println!("{}", reply),
            Err(e) => println!("Error executing command: {}", e),
        }

        if persist {
            let settings = BridgeSettings::from_config(&handle.snapshot().await?.config);
            if let Err(e) = store.save(&settings) {
                warn!(error = %e, "Failed to save bridge settings");
            }
        }
    }
    Ok(())
}

/// Handle graceful shutdown signals (Ctrl+C, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}
