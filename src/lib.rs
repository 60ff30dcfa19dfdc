//! Chat Bridge Library
//!
//! Relays conversational events between a host chat application and an
//! external process over a websocket (client or server role) or HTTP.
//! The binaries are in `src/main.rs` and `src/bin/`.

pub mod activity;
pub mod codec;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod settings;
pub mod supervisor;
pub mod transport;

pub use codec::{decode, encode, Envelope};
pub use config::{BridgeConfig, Config, TransportMode};
pub use controller::{BridgeHandle, BridgeStatus, ChatHost, MessageData};
pub use error::{BridgeError, BridgeResult};
