//! Datagram transports.
//!
//! The engine sends and receives whole datagrams; reliability and
//! ordering live above this layer. Two implementations: a plain UDP
//! socket, and a WebSocket stream through the relay where each binary
//! message carries one datagram.

use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::types::{Error, Result};

/// Largest datagram we ever expect from a TS3 server.
const RECV_BUFFER_SIZE: usize = 2048;

#[async_trait::async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Send one whole datagram.
    async fn send(&self, datagram: &[u8]) -> Result<()>;

    /// Receive one whole datagram.
    async fn recv(&self) -> Result<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// Direct UDP
// ---------------------------------------------------------------------------

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect((host, port))
            .await
            .map_err(|e| Error::Transport(format!("udp connect {}:{}: {}", host, port, e)))?;
        Ok(Self { socket })
    }
}

#[async_trait::async_trait]
impl DatagramTransport for UdpTransport {
    async fn send(&self, datagram: &[u8]) -> Result<()> {
        self.socket.send(datagram).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }
}

// ---------------------------------------------------------------------------
// Relay WebSocket
// ---------------------------------------------------------------------------

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct RelayTransport {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

impl RelayTransport {
    /// Upgrade against the relay, pinning the target host/port in the
    /// query string.
    pub async fn connect(relay_url: &str, token: &str, host: &str, port: u16) -> Result<Self> {
        let mut url = Url::parse(relay_url)
            .map_err(|e| Error::Transport(format!("relay url {}: {}", relay_url, e)))?;
        url.query_pairs_mut()
            .append_pair("token", token)
            .append_pair("host", host)
            .append_pair("port", &port.to_string());

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Transport(format!("relay upgrade: {}", e)))?;
        let (sink, stream) = ws.split();
        Ok(Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        })
    }
}

#[async_trait::async_trait]
impl DatagramTransport for RelayTransport {
    async fn send(&self, datagram: &[u8]) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::Binary(datagram.to_vec()))
            .await
            .map_err(|e| Error::Transport(format!("relay send: {}", e)))
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(data),
                // Pings are answered by the websocket layer; text frames
                // are not part of the relay contract.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_))) => continue,
                Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Err(Error::Closed),
                Some(Err(e)) => return Err(Error::Transport(format!("relay recv: {}", e))),
            }
        }
    }
}

/// Pick the transport for the given options.
pub async fn open(options: &crate::config::ConnectionOptions) -> Result<Arc<dyn DatagramTransport>> {
    if let (Some(url), Some(token)) = (&options.relay_url, &options.relay_token) {
        let relay = RelayTransport::connect(url, token, &options.host, options.port).await?;
        Ok(Arc::new(relay))
    } else {
        let udp = UdpTransport::connect(&options.host, options.port).await?;
        Ok(Arc::new(udp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_transport_loopback() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();

        let transport = UdpTransport::connect("127.0.0.1", echo_addr.port())
            .await
            .unwrap();
        transport.send(b"ping me").await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = echo.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping me");

        echo.send_to(b"pong", from).await.unwrap();
        let received = transport.recv().await.unwrap();
        assert_eq!(received, b"pong");
    }
}
