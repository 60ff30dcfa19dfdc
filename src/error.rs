//! Error types for the bridge
//!
//! Each failure class has its own enum so the controller can decide, per class,
//! whether to retry, log, or report back to the caller. None of them is ever
//! allowed to take the bridge down.

use thiserror::Error;

/// Errors establishing a transport
///
/// These feed the reconnection path and are never surfaced as fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The endpoint refused the connection or could not be reached
    #[error("Endpoint unreachable at {endpoint}: {reason}")]
    Unreachable {
        /// Endpoint that was dialled or bound
        endpoint: String,
        /// Underlying I/O or handshake error
        reason: String,
    },

    /// The handshake did not complete within the configured timeout
    #[error("Connect to {0} timed out after {1} seconds")]
    Timeout(String, u64),

    /// The transport could not be built from the configuration
    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),

    /// A newer attempt or a disable superseded this one
    #[error("Connect attempt cancelled")]
    Cancelled,
}

/// Errors sending a frame
///
/// Caller-visible as a failure result; a send failure never closes the
/// connection on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    /// Send attempted while the transport is not connected
    #[error("Transport is not connected")]
    NotConnected,

    /// The transport accepted the frame but the write failed
    #[error("Transport send error: {0}")]
    Transport(String),
}

/// Errors decoding an inbound frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload is not valid JSON
    #[error("Malformed JSON: {0}")]
    MalformedJson(String),

    /// The payload is JSON but lacks a string `type` or `content`
    #[error("Unrecognized envelope shape: {0}")]
    UnrecognizedShape(String),
}

/// Crate-level error type
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Transport could not be established
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Frame could not be sent
    #[error("Send failure: {0}")]
    Send(#[from] SendFailure),

    /// Inbound frame could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The host's message injection action rejected a message
    #[error("Host action failed: {0}")]
    HostAction(String),

    /// Configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The controller task is gone
    #[error("Bridge controller is not running")]
    ControllerStopped,

    /// Settings could not be loaded or saved
    #[error("Settings error: {0}")]
    Settings(#[from] crate::settings::SettingsError),
}

/// Result alias used across the crate
pub type BridgeResult<T> = Result<T, BridgeError>;
