use std::fmt;

/// Errors returned by tsproto operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation timed out")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("rejected by server: {0}")]
    Rejected(String),
    #[error("connection closed")]
    Closed,
}

/// Coarse classification of an [`Error`], as surfaced in events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Protocol,
    Crypto,
    Rejected,
    Closed,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) | Error::Io(_) => ErrorKind::Transport,
            Error::Timeout => ErrorKind::Timeout,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Crypto(_) => ErrorKind::Crypto,
            Error::Rejected(_) => ErrorKind::Rejected,
            Error::Closed => ErrorKind::Closed,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Crypto => "crypto",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Closed => "closed",
        };
        f.write_str(s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Target of a text message, matching the wire `targetmode` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextMessageMode {
    Private = 1,
    Channel = 2,
    Server = 3,
    /// Pokes arrive via their own notification but share the message surface.
    Poke = 4,
}

impl TextMessageMode {
    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Private),
            2 => Some(Self::Channel),
            3 => Some(Self::Server),
            _ => None,
        }
    }
}

/// Events emitted by a [`crate::client::Connection`] on its event channel.
#[derive(Clone, Debug)]
pub enum Event {
    /// Handshake completed; carries the virtual server name.
    Connected { server_name: String },
    /// Session ended. `reason` is "timeout", "kicked", "banned", or a
    /// server-supplied message.
    Disconnected { reason: String },
    /// Non-fatal condition the caller should know about, e.g. the
    /// license-derivation fallback.
    Warning { detail: String },
    Error { kind: ErrorKind, detail: String },
    TextMessage {
        mode: TextMessageMode,
        text: String,
        invoker_name: String,
        invoker_id: u16,
    },
    /// Incoming voice-class payload. Transport only, never decoded.
    Audio { from: u16, codec: u8, payload: Vec<u8> },
}
