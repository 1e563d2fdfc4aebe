use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Options for a single TS3 connection.
///
/// If both `relay_url` and `relay_token` are set the engine reaches the
/// server through the WebSocket relay; otherwise it opens a UDP socket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionOptions {
    pub host: String,

    /// TS3 voice port. Default 9987.
    #[serde(default = "default_port")]
    pub port: u16,

    pub nickname: String,

    /// Channel to join after authentication, by path.
    #[serde(default)]
    pub default_channel: Option<String>,

    #[serde(default)]
    pub server_password: Option<String>,

    /// Client hardware identifier sent in `clientinit`.
    #[serde(default)]
    pub hwid: Option<String>,

    /// Relay upgrade URL, e.g. `ws://relay:9988/`.
    #[serde(default)]
    pub relay_url: Option<String>,

    #[serde(default)]
    pub relay_token: Option<String>,

    /// Abort the handshake when license derivation fails instead of
    /// falling back to random key material.
    #[serde(default)]
    pub strict_license: bool,

    /// Bound on the whole handshake. Default 15 s.
    #[serde(skip, default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Session is dead after this much server silence. Default 30 s.
    #[serde(skip, default = "default_idle_timeout")]
    pub idle_timeout: Duration,

    /// Heartbeat interval. Default 1 s.
    #[serde(skip, default = "default_ping_interval")]
    pub ping_interval: Duration,

    /// Give up on an unacked command after this long. Default 30 s.
    #[serde(skip, default = "default_resend_timeout")]
    pub resend_timeout: Duration,
}

fn default_port() -> u16 {
    9987
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_resend_timeout() -> Duration {
    Duration::from_secs(30)
}

impl ConnectionOptions {
    pub fn new(host: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            nickname: nickname.into(),
            default_channel: None,
            server_password: None,
            hwid: None,
            relay_url: None,
            relay_token: None,
            strict_license: false,
            connect_timeout: default_connect_timeout(),
            idle_timeout: default_idle_timeout(),
            ping_interval: default_ping_interval(),
            resend_timeout: default_resend_timeout(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_default_channel(mut self, channel: impl Into<String>) -> Self {
        self.default_channel = Some(channel.into());
        self
    }

    pub fn with_server_password(mut self, password: impl Into<String>) -> Self {
        self.server_password = Some(password.into());
        self
    }

    pub fn with_hwid(mut self, hwid: impl Into<String>) -> Self {
        self.hwid = Some(hwid.into());
        self
    }

    pub fn with_relay(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.relay_url = Some(url.into());
        self.relay_token = Some(token.into());
        self
    }

    pub fn with_strict_license(mut self, strict: bool) -> Self {
        self.strict_license = strict;
        self
    }

    pub fn with_connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn with_idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    pub fn with_ping_interval(mut self, d: Duration) -> Self {
        self.ping_interval = d;
        self
    }

    pub fn with_resend_timeout(mut self, d: Duration) -> Self {
        self.resend_timeout = d;
        self
    }

    /// Whether the relay transport is fully configured.
    pub fn uses_relay(&self) -> bool {
        self.relay_url.is_some() && self.relay_token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = ConnectionOptions::new("ts.example.org", "Bot");
        assert_eq!(opts.port, 9987);
        assert_eq!(opts.connect_timeout, Duration::from_secs(15));
        assert_eq!(opts.idle_timeout, Duration::from_secs(30));
        assert!(!opts.uses_relay());
    }

    #[test]
    fn relay_requires_both_parts() {
        let mut opts = ConnectionOptions::new("ts.example.org", "Bot");
        opts.relay_url = Some("ws://relay:9988/".into());
        assert!(!opts.uses_relay());
        opts.relay_token = Some("secret".into());
        assert!(opts.uses_relay());
    }

    #[test]
    fn deserialize_minimal() {
        let opts: ConnectionOptions =
            serde_json::from_str(r#"{"host":"ts.example.org","nickname":"Bot"}"#).unwrap();
        assert_eq!(opts.port, 9987);
        assert!(!opts.strict_license);
    }
}
