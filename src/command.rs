//! Administrative commands
//!
//! Text command surface for the UI shell, modelled on a chat slash command:
//! `/bridge` toggles, `/bridge on|off` sets explicitly, and a few
//! subcommands edit the port/mode or inspect state.

use crate::config::TransportMode;
use crate::controller::BridgeHandle;
use crate::error::BridgeResult;
use thiserror::Error;

/// Command prefix
pub const COMMAND_PREFIX: &str = "/bridge";

/// Default number of log entries shown by `/bridge log`
pub const DEFAULT_LOG_LINES: usize = 20;

/// Parsed administrative command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// Flip the enable flag
    Toggle,
    /// Enable
    On,
    /// Disable
    Off,
    /// Change the port
    Port(u16),
    /// Change the transport mode
    Mode(TransportMode),
    /// Reconnect now
    Connect,
    /// Close the connection without retrying
    Disconnect,
    /// Show state
    Status,
    /// Show the most recent log entries
    Log(usize),
}

/// Errors parsing a command line
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The line does not start with the command prefix
    #[error("Not a bridge command")]
    NotACommand,
    /// Unknown subcommand
    #[error("Unknown subcommand: {0}")]
    UnknownSubcommand(String),
    /// Subcommand argument missing or invalid
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Whether `line` is addressed to the bridge
pub fn is_command(line: &str) -> bool {
    let line = line.trim_start();
    line == COMMAND_PREFIX || line.starts_with(&format!("{} ", COMMAND_PREFIX))
}

/// Parse a command line
pub fn parse(line: &str) -> Result<AdminCommand, CommandError> {
    if !is_command(line) {
        return Err(CommandError::NotACommand);
    }
    let mut args = line.split_whitespace().skip(1);
    let Some(sub) = args.next() else {
        return Ok(AdminCommand::Toggle);
    };
    let arg = args.next();

    match sub.to_ascii_lowercase().as_str() {
        "on" => Ok(AdminCommand::On),
        "off" => Ok(AdminCommand::Off),
        "toggle" => Ok(AdminCommand::Toggle),
        "connect" => Ok(AdminCommand::Connect),
        "disconnect" => Ok(AdminCommand::Disconnect),
        "status" => Ok(AdminCommand::Status),
        "port" => {
            let raw = arg.ok_or_else(|| CommandError::InvalidArgument("port is required".into()))?;
            match raw.parse::<u16>() {
                Ok(port) if port != 0 => Ok(AdminCommand::Port(port)),
                _ => Err(CommandError::InvalidArgument(format!(
                    "port must be between 1 and 65535, got {}",
                    raw
                ))),
            }
        }
        "mode" => {
            let raw = arg.ok_or_else(|| CommandError::InvalidArgument("mode is required".into()))?;
            raw.parse::<TransportMode>()
                .map(AdminCommand::Mode)
                .map_err(|e| CommandError::InvalidArgument(e.to_string()))
        }
        "log" => match arg {
            None => Ok(AdminCommand::Log(DEFAULT_LOG_LINES)),
            Some(raw) => raw
                .parse::<usize>()
                .map(AdminCommand::Log)
                .map_err(|_| CommandError::InvalidArgument(format!("not a count: {}", raw))),
        },
        other => Err(CommandError::UnknownSubcommand(other.to_string())),
    }
}

/// Run a command against the controller; returns the reply to show the user
pub async fn execute(handle: &BridgeHandle, command: AdminCommand) -> BridgeResult<String> {
    match command {
        AdminCommand::Toggle => {
            let enabled = handle.snapshot().await?.enabled;
            if enabled {
                handle.disable()?;
                Ok("Bridge disabled".to_string())
            } else {
                handle.enable()?;
                Ok("Bridge enabled - Connecting...".to_string())
            }
        }
        AdminCommand::On => {
            handle.enable()?;
            Ok("Bridge enabled - Connecting...".to_string())
        }
        AdminCommand::Off => {
            handle.disable()?;
            Ok("Bridge disabled".to_string())
        }
        AdminCommand::Port(port) => {
            let mut config = handle.snapshot().await?.config;
            config.port = port;
            handle.reconfigure(config)?;
            Ok(format!("Bridge port set to {}", port))
        }
        AdminCommand::Mode(mode) => {
            let mut config = handle.snapshot().await?.config;
            config.transport_mode = mode;
            handle.reconfigure(config)?;
            Ok(format!("Bridge mode set to {}", mode))
        }
        AdminCommand::Connect => {
            handle.connect()?;
            Ok("Connecting...".to_string())
        }
        AdminCommand::Disconnect => {
            handle.disconnect()?;
            Ok("Disconnected".to_string())
        }
        AdminCommand::Status => {
            let snapshot = handle.snapshot().await?;
            let connection = snapshot
                .connection
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string());
            Ok(format!(
                "Bridge {} | status: {} | mode: {} | endpoint: {} | transport: {} | retries: {}",
                if snapshot.enabled { "enabled" } else { "disabled" },
                snapshot.status,
                snapshot.config.transport_mode,
                snapshot.config.endpoint(),
                connection,
                snapshot.retries_scheduled,
            ))
        }
        AdminCommand::Log(limit) => {
            let entries = handle.recent_activity(limit).await?;
            if entries.is_empty() {
                return Ok("No activity".to_string());
            }
            let lines: Vec<String> = entries
                .iter()
                .map(|e| {
                    format!(
                        "[{}] {:?}: {}",
                        e.timestamp.format("%H:%M:%S"),
                        e.category,
                        e.message
                    )
                })
                .collect();
            Ok(lines.join("\n"))
        }
    }
}
