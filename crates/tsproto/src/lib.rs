pub mod client;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod handshake;
pub mod transport;
pub mod types;
pub mod wire;

// Re-export primary public API
pub use crate::client::{Connection, HandshakeKeys, Stats};
pub use crate::config::ConnectionOptions;
pub use crate::handshake::SessionState;
pub use crate::types::{Error, ErrorKind, Event, Result, TextMessageMode};
