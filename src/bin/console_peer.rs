//! Console peer
//!
//! The external-process side of the bridge: listens for the bridge on the
//! configured port, prints every `bot_response` it receives and sends each
//! stdin line back as a `send_message` envelope. Run the bridge in client
//! mode against it.

use chat_bridge::codec::{self, EnvelopeKind};
use chat_bridge::error::SendFailure;
use chat_bridge::transport::{
    NoticeSender, ServerSocketTransport, Transport, TransportEvent,
};
use chat_bridge::{Config, Envelope, TransportMode};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

fn prompt() {
    print!("\nYou: ");
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::from_env().bridge;
    config.transport_mode = TransportMode::ServerSocket;

    let (notice_tx, mut notices) = mpsc::unbounded_channel();
    let mut transport = ServerSocketTransport::new(config.clone(), NoticeSender::new(1, notice_tx));
    transport
        .connect()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start server: {}", e))?;

    println!("WebSocket server started on port {}", config.port);
    println!("Chat started! Type 'exit' to quit.");
    prompt();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.eq_ignore_ascii_case("exit") {
                    break;
                }
                if !line.is_empty() {
                    match transport.send(&Envelope::send_message(line)).await {
                        Ok(()) => {}
                        Err(SendFailure::NotConnected) => println!("No clients connected"),
                        Err(e) => error!(error = %e, "Failed to send message"),
                    }
                }
                prompt();
            }
            Some(notice) = notices.recv() => match notice.event {
                TransportEvent::Received(raw) => match codec::decode(&raw) {
                    Ok(envelope) if envelope.kind() == EnvelopeKind::BotResponse => {
                        println!("\nBot: {}", envelope.content);
                        prompt();
                    }
                    Ok(envelope) => warn!(kind = %envelope.kind, "Ignoring envelope"),
                    Err(e) => warn!(error = %e, "Invalid frame received"),
                },
                TransportEvent::Opened => info!("Client connected"),
                TransportEvent::PeerLeft => info!("Client disconnected"),
                TransportEvent::Closed(reason) => {
                    error!(reason = %reason, "Server stopped");
                    break;
                }
                TransportEvent::Failed(reason) | TransportEvent::SendFailed(reason) => {
                    error!(reason = %reason, "Transport error");
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    transport.close().await;
    println!("\nChat ended");
    Ok(())
}
