//! The TS3 client engine.
//!
//! One [`Connection`] drives a complete protocol session: the five-step
//! init exchange, key agreement, per-packet encryption, command
//! acknowledgement with retransmission, the 1 s heartbeat, and the
//! high-level control surface. Events are delivered on an mpsc channel
//! handed out by [`Connection::connect`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::commands::Command;
use crate::config::ConnectionOptions;
use crate::crypto::keys::{EphemeralKey, OmegaKey};
use crate::crypto::{self, license, puzzle, SessionCrypto};
use crate::handshake::{Init0, Init1, Init2, Init3, Init4, SessionState};
use crate::transport::{self, DatagramTransport};
use crate::types::{Error, ErrorKind, Event, Result, TextMessageMode};
use crate::wire::{
    self, Defragmenter, Header, IncomingGeneration, PacketIdCounter, PacketType,
    FLAG_NEWPROTOCOL, FLAG_UNENCRYPTED, MAX_C2S_PAYLOAD, PACKET_TYPE_COUNT,
};

const EVENT_CHANNEL_SIZE: usize = 64;
const RESEND_TICK: Duration = Duration::from_millis(100);
const RESEND_BACKOFF_START: Duration = Duration::from_millis(200);
const RESEND_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Per-connection handshake secrets. Defaults to fresh randomness; fixing
/// them makes a session byte-reproducible, which the protocol tests use.
#[derive(Clone, Copy)]
pub struct HandshakeKeys {
    /// Client nonce sent base64 in `clientinitiv`.
    pub alpha: [u8; crypto::ALPHA_SIZE],
    /// Seed of the ephemeral Ed25519 keypair.
    pub ed_seed: [u8; 32],
}

impl HandshakeKeys {
    pub fn random() -> Self {
        let mut alpha = [0u8; crypto::ALPHA_SIZE];
        let mut ed_seed = [0u8; 32];
        OsRng.fill_bytes(&mut alpha);
        OsRng.fill_bytes(&mut ed_seed);
        Self { alpha, ed_seed }
    }
}

/// Connection statistics snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    /// Compressed command frames received and dropped as unsupported.
    pub compressed_dropped: u64,
}

// ---------------------------------------------------------------------------
// Packet codec: counters, crypto state, fragment assembly
// ---------------------------------------------------------------------------

enum PacketCrypto {
    /// Fixed key material used until `clientek` is on the wire.
    Fake,
    Session(SessionCrypto),
}

/// What one inbound datagram decoded to.
enum Inbound {
    /// MAC failure; the datagram leaves no trace.
    Dropped,
    Packet {
        header: Header,
        payload: Vec<u8>,
    },
    /// Command-class frame: always acked, payload present once the
    /// fragment group is complete.
    CommandFrame {
        header: Header,
        complete: Option<Vec<u8>>,
    },
    /// Quicklz-compressed command frame; this client does not speak
    /// quicklz, so the frame is acked, counted, and dropped.
    Compressed { header: Header },
}

struct Codec {
    crypto: PacketCrypto,
    client_id: u16,
    out_counters: [PacketIdCounter; PACKET_TYPE_COUNT],
    in_generations: [IncomingGeneration; PACKET_TYPE_COUNT],
    defrag_command: Defragmenter,
    defrag_command_low: Defragmenter,
    /// Highest delivered id per command class, for replay suppression.
    last_command_ids: [Option<u16>; 2],
}

impl Codec {
    fn new() -> Self {
        Self {
            crypto: PacketCrypto::Fake,
            client_id: 0,
            out_counters: Default::default(),
            in_generations: Default::default(),
            defrag_command: Defragmenter::default(),
            defrag_command_low: Defragmenter::default(),
            last_command_ids: [None; 2],
        }
    }

    /// Frame, encrypt, and serialize one outgoing packet. Returns the
    /// assigned packet id and the datagram.
    fn encode(&mut self, packet_type: PacketType, flags: u8, payload: &[u8]) -> (u16, Vec<u8>) {
        if packet_type == PacketType::Init {
            let mut datagram = wire::init_header_c2s().encode();
            datagram.extend_from_slice(payload);
            return (wire::INIT_PACKET_ID, datagram);
        }

        let (packet_id, generation) = self.out_counters[packet_type as usize].next();
        let mut header = Header {
            mac: [0u8; wire::MAC_SIZE],
            packet_id,
            client_id: Some(self.client_id),
            packet_type,
            flags,
        };

        if flags & FLAG_UNENCRYPTED != 0 {
            header.mac = match &self.crypto {
                PacketCrypto::Fake => wire::INIT_MAC,
                PacketCrypto::Session(session) => *session.shared_mac(),
            };
            let mut datagram = header.encode();
            datagram.extend_from_slice(payload);
            return (packet_id, datagram);
        }

        let (key, nonce) = match &self.crypto {
            PacketCrypto::Fake => (crypto::FAKE_KEY, crypto::FAKE_NONCE),
            PacketCrypto::Session(session) => {
                session.key_nonce(true, packet_type as u8, packet_id, generation)
            }
        };
        let meta = header.meta();
        let (ciphertext, tag) = crypto::eax::encrypt(&key, &nonce, &meta, payload);
        header.mac.copy_from_slice(&tag[..wire::MAC_SIZE]);

        let mut datagram = header.encode();
        datagram.extend_from_slice(&ciphertext);
        (packet_id, datagram)
    }

    /// Voice frame: the packet id doubles as the voice sequence number at
    /// the front of the payload.
    fn encode_voice(&mut self, codec: u8, data: &[u8]) -> (u16, Vec<u8>) {
        let (packet_id, generation) = self.out_counters[PacketType::Voice as usize].next();
        let mut payload = Vec::with_capacity(3 + data.len());
        payload.extend_from_slice(&packet_id.to_be_bytes());
        payload.push(codec);
        payload.extend_from_slice(data);

        let mut header = Header {
            mac: [0u8; wire::MAC_SIZE],
            packet_id,
            client_id: Some(self.client_id),
            packet_type: PacketType::Voice,
            flags: 0,
        };
        let (key, nonce) = match &self.crypto {
            PacketCrypto::Fake => (crypto::FAKE_KEY, crypto::FAKE_NONCE),
            PacketCrypto::Session(session) => {
                session.key_nonce(true, PacketType::Voice as u8, packet_id, generation)
            }
        };
        let meta = header.meta();
        let (ciphertext, tag) = crypto::eax::encrypt(&key, &nonce, &meta, &payload);
        header.mac.copy_from_slice(&tag[..wire::MAC_SIZE]);

        let mut datagram = header.encode();
        datagram.extend_from_slice(&ciphertext);
        (packet_id, datagram)
    }

    /// Decode one server→client datagram. Undecodable headers and MAC
    /// failures drop silently; only fragment-stream violations error.
    fn decode(&mut self, datagram: &[u8]) -> Result<Inbound> {
        let (header, wire_payload) = match Header::decode_s2c(datagram) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!("dropping undecodable datagram: {}", e);
                return Ok(Inbound::Dropped);
            }
        };

        if header.packet_type == PacketType::Init || header.flags & FLAG_UNENCRYPTED != 0 {
            return Ok(Inbound::Packet {
                header,
                payload: wire_payload.to_vec(),
            });
        }

        let type_idx = header.packet_type as usize;
        let generation = self.in_generations[type_idx].peek(header.packet_id);
        let (key, nonce) = match &self.crypto {
            PacketCrypto::Fake => (crypto::FAKE_KEY, crypto::FAKE_NONCE),
            PacketCrypto::Session(session) => session.key_nonce(
                false,
                header.packet_type as u8,
                header.packet_id,
                generation,
            ),
        };
        let meta = &datagram[wire::MAC_SIZE..wire::S2C_HEADER_SIZE];
        let Some(payload) = crypto::eax::decrypt(&key, &nonce, meta, wire_payload, &header.mac)
        else {
            tracing::debug!(
                "dropping {:?} packet {} with bad MAC",
                header.packet_type,
                header.packet_id
            );
            return Ok(Inbound::Dropped);
        };
        self.in_generations[type_idx].commit(header.packet_id);

        if header.packet_type.is_command() {
            if header.flags & wire::FLAG_COMPRESSED != 0 {
                return Ok(Inbound::Compressed { header });
            }
            let idx = (header.packet_type == PacketType::CommandLow) as usize;
            if let Some(last) = self.last_command_ids[idx] {
                let delta = header.packet_id.wrapping_sub(last);
                if delta == 0 || delta > 0x8000 {
                    // Retransmission of a frame we already delivered: our
                    // ack was lost. Ack again, deliver nothing.
                    return Ok(Inbound::CommandFrame {
                        header,
                        complete: None,
                    });
                }
            }
            self.last_command_ids[idx] = Some(header.packet_id);

            let defrag = match header.packet_type {
                PacketType::Command => &mut self.defrag_command,
                _ => &mut self.defrag_command_low,
            };
            let complete = defrag.push(header.packet_id, header.flags, &payload)?;
            return Ok(Inbound::CommandFrame { header, complete });
        }

        Ok(Inbound::Packet { header, payload })
    }
}

// ---------------------------------------------------------------------------
// Connection internals
// ---------------------------------------------------------------------------

/// What the server has told us about itself.
struct ServerView {
    state: SessionState,
    own_client_id: u16,
    current_channel: u64,
    server_name: String,
    channels: HashMap<u64, String>,
    clients: HashMap<u16, String>,
}

struct OutstandingSend {
    datagram: Vec<u8>,
    first_sent: Instant,
    next_resend: Instant,
    attempts: u32,
}

struct Counters {
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    tx_packets: AtomicU64,
    compressed_dropped: AtomicU64,
}

struct Inner {
    options: ConnectionOptions,
    transport: Arc<dyn DatagramTransport>,
    codec: Mutex<Codec>,
    view: Mutex<ServerView>,
    outstanding: Mutex<HashMap<(u8, u16), OutstandingSend>>,
    last_incoming: Mutex<Instant>,
    counters: Counters,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

/// A live TS3 session. Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connect and authenticate. Resolves once the session is
    /// `Authenticated`, or fails with `Timeout` after the configured
    /// connect timeout.
    pub async fn connect(
        options: ConnectionOptions,
    ) -> Result<(Connection, mpsc::Receiver<Event>)> {
        Self::connect_with_keys(options, HandshakeKeys::random()).await
    }

    /// [`Connection::connect`] with caller-supplied handshake secrets.
    pub async fn connect_with_keys(
        options: ConnectionOptions,
        keys: HandshakeKeys,
    ) -> Result<(Connection, mpsc::Receiver<Event>)> {
        let transport = transport::open(&options).await?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let inner = Arc::new(Inner {
            transport,
            codec: Mutex::new(Codec::new()),
            view: Mutex::new(ServerView {
                state: SessionState::Init0Sent,
                own_client_id: 0,
                current_channel: 0,
                server_name: String::new(),
                channels: HashMap::new(),
                clients: HashMap::new(),
            }),
            outstanding: Mutex::new(HashMap::new()),
            last_incoming: Mutex::new(Instant::now()),
            counters: Counters {
                rx_bytes: AtomicU64::new(0),
                tx_bytes: AtomicU64::new(0),
                rx_packets: AtomicU64::new(0),
                tx_packets: AtomicU64::new(0),
                compressed_dropped: AtomicU64::new(0),
            },
            events: events_tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            options,
        });

        let connect_timeout = inner.options.connect_timeout;
        match timeout(connect_timeout, run_handshake(&inner, keys)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                inner.cancel.cancel();
                return Err(e);
            }
            Err(_) => {
                inner.cancel.cancel();
                return Err(Error::Timeout);
            }
        }

        tokio::spawn(recv_loop(inner.clone()));
        tokio::spawn(ping_loop(inner.clone()));
        tokio::spawn(resend_loop(inner.clone()));
        tokio::spawn(idle_loop(inner.clone()));

        let server_name = inner.view.lock().await.server_name.clone();
        inner.emit(Event::Connected { server_name }).await;

        Ok((Connection { inner }, events_rx))
    }

    /// Graceful teardown: best-effort `clientdisconnect`, then cancel all
    /// session tasks. Idempotent.
    pub async fn disconnect(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let goodbye = Command::new("clientdisconnect")
            .arg("reasonid", "8")
            .arg("reasonmsg", "leaving");
        let datagram = {
            let mut codec = self.inner.codec.lock().await;
            codec
                .encode(PacketType::Command, FLAG_NEWPROTOCOL, goodbye.serialize().as_bytes())
                .1
        };
        // The goodbye may or may not make it; nobody waits for its ack.
        let _ = self.inner.transport.send(&datagram).await;

        self.inner.cancel.cancel();
        self.inner.view.lock().await.state = SessionState::Disconnected;
        self.inner
            .emit(Event::Disconnected {
                reason: "requested".into(),
            })
            .await;
    }

    /// Case-insensitive channel lookup; sends `clientmove` when the name
    /// is known. Returns whether it was.
    pub async fn move_to_channel(&self, name: &str) -> Result<bool> {
        let (own_id, target) = {
            let view = self.inner.view.lock().await;
            let target = view
                .channels
                .iter()
                .find(|(_, n)| n.eq_ignore_ascii_case(name))
                .map(|(id, _)| *id);
            (view.own_client_id, target)
        };
        let Some(channel_id) = target else {
            return Ok(false);
        };
        let cmd = Command::new("clientmove")
            .arg("clid", own_id.to_string())
            .arg("cid", channel_id.to_string());
        self.inner.send_command(cmd).await?;
        Ok(true)
    }

    pub async fn send_channel_message(&self, text: &str) -> Result<()> {
        self.send_text_message(TextMessageMode::Channel, None, text).await
    }

    pub async fn send_server_message(&self, text: &str) -> Result<()> {
        self.send_text_message(TextMessageMode::Server, None, text).await
    }

    pub async fn send_private_message(&self, client_id: u16, text: &str) -> Result<()> {
        self.send_text_message(TextMessageMode::Private, Some(client_id), text)
            .await
    }

    /// Fire-and-forget text message; delivery is the ack layer's problem.
    pub async fn send_text_message(
        &self,
        mode: TextMessageMode,
        target: Option<u16>,
        text: &str,
    ) -> Result<()> {
        let mut cmd = Command::new("sendtextmessage")
            .arg("targetmode", (mode as u8).to_string())
            .arg("msg", text);
        if let Some(target) = target {
            cmd = cmd.arg("target", target.to_string());
        }
        self.inner.send_command(cmd).await
    }

    pub async fn update_description(&self, text: &str) -> Result<()> {
        let own_id = self.inner.view.lock().await.own_client_id;
        let cmd = Command::new("clientedit")
            .arg("clid", own_id.to_string())
            .arg("client_description", text);
        self.inner.send_command(cmd).await
    }

    /// Transmit one voice-class frame. Never acked, never retried.
    pub async fn send_audio(&self, codec: u8, payload: &[u8]) -> Result<()> {
        let datagram = {
            let mut wire_codec = self.inner.codec.lock().await;
            wire_codec.encode_voice(codec, payload).1
        };
        self.inner.send_raw(&datagram).await
    }

    pub async fn state(&self) -> SessionState {
        self.inner.view.lock().await.state
    }

    pub async fn own_client_id(&self) -> u16 {
        self.inner.view.lock().await.own_client_id
    }

    pub async fn current_channel(&self) -> u64 {
        self.inner.view.lock().await.current_channel
    }

    pub async fn server_name(&self) -> String {
        self.inner.view.lock().await.server_name.clone()
    }

    pub async fn channels(&self) -> HashMap<u64, String> {
        self.inner.view.lock().await.channels.clone()
    }

    pub async fn clients(&self) -> HashMap<u16, String> {
        self.inner.view.lock().await.clients.clone()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            rx_bytes: self.inner.counters.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.inner.counters.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.inner.counters.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.inner.counters.tx_packets.load(Ordering::Relaxed),
            compressed_dropped: self.inner.counters.compressed_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    async fn emit(&self, event: Event) {
        let _ = self.events.send(event).await;
    }

    async fn send_raw(&self, datagram: &[u8]) -> Result<()> {
        self.transport.send(datagram).await?;
        self.counters
            .tx_bytes
            .fetch_add(datagram.len() as u64, Ordering::Relaxed);
        self.counters.tx_packets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn send_packet(&self, packet_type: PacketType, flags: u8, payload: &[u8]) -> Result<u16> {
        let (id, datagram) = {
            let mut codec = self.codec.lock().await;
            codec.encode(packet_type, flags, payload)
        };
        self.send_raw(&datagram).await?;
        Ok(id)
    }

    /// Serialize, fragment, encrypt, and track a command for
    /// retransmission until acked.
    async fn send_command(&self, cmd: Command) -> Result<()> {
        let line = cmd.serialize();
        let chunks = wire::fragment(line.as_bytes(), MAX_C2S_PAYLOAD);

        for (chunk, frag_flag) in chunks {
            let (id, datagram) = {
                let mut codec = self.codec.lock().await;
                codec.encode(PacketType::Command, FLAG_NEWPROTOCOL | frag_flag, &chunk)
            };
            let now = Instant::now();
            self.outstanding.lock().await.insert(
                (PacketType::Command as u8, id),
                OutstandingSend {
                    datagram: datagram.clone(),
                    first_sent: now,
                    next_resend: now + RESEND_BACKOFF_START,
                    attempts: 0,
                },
            );
            self.send_raw(&datagram).await?;
        }
        Ok(())
    }

    async fn send_ack(&self, ack_type: PacketType, acked_id: u16) -> Result<()> {
        self.send_packet(ack_type, 0, &acked_id.to_be_bytes()).await?;
        Ok(())
    }

    async fn complete_ack(&self, command_type: PacketType, payload: &[u8]) {
        if payload.len() < 2 {
            return;
        }
        let acked = u16::from_be_bytes([payload[0], payload[1]]);
        self.outstanding
            .lock()
            .await
            .remove(&(command_type as u8, acked));
    }

    /// Terminal teardown shared by all failure paths. Emits at most once.
    async fn shutdown(&self, reason: &str, error: Option<Error>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.view.lock().await.state = SessionState::Disconnected;
        if let Some(error) = error {
            self.emit(Event::Error {
                kind: error.kind(),
                detail: error.to_string(),
            })
            .await;
        }
        self.emit(Event::Disconnected {
            reason: reason.into(),
        })
        .await;
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

async fn run_handshake(inner: &Arc<Inner>, keys: HandshakeKeys) -> Result<()> {
    let mut random0 = [0u8; 4];
    OsRng.fill_bytes(&mut random0);

    let init0 = Init0 {
        timestamp: unix_now(),
        random0,
    };
    inner
        .send_packet(PacketType::Init, FLAG_UNENCRYPTED, &init0.encode())
        .await?;

    // Init1: the server echoes our nonce.
    let init1 = loop {
        let payload = recv_init_payload(inner).await?;
        if payload.first() == Some(&0x01) {
            break Init1::parse(&payload)?;
        }
    };
    if init1.random0_r != random0 {
        return Err(Error::Protocol("init1 nonce mismatch".into()));
    }

    inner.view.lock().await.state = SessionState::Init2Sent;
    let init2 = Init2 {
        random1: init1.random1,
        random0_r: init1.random0_r,
    };
    inner
        .send_packet(PacketType::Init, FLAG_UNENCRYPTED, &init2.encode())
        .await?;

    // Init3: the puzzle. Duplicate Init1 resends are ignored.
    let init3 = loop {
        let payload = recv_init_payload(inner).await?;
        match payload.first() {
            Some(&0x03) => break Init3::parse(&payload)?,
            Some(&0x01) => continue,
            _ => continue,
        }
    };

    let (x, n, level) = (init3.x, init3.n, init3.level);
    let y = tokio::task::spawn_blocking(move || puzzle::solve(&x, &n, level))
        .await
        .map_err(|e| Error::Crypto(format!("puzzle worker: {}", e)))??;

    let omega = OmegaKey::generate();
    let initiv = Command::new("clientinitiv")
        .arg("alpha", BASE64.encode(keys.alpha))
        .arg("omega", BASE64.encode(omega.public_der()?))
        .arg("ot", "1")
        .flag("ip");
    let init4 = Init4::from_puzzle(&init3, y, &initiv.serialize());
    inner.view.lock().await.state = SessionState::Init4Sent;
    inner
        .send_packet(PacketType::Init, FLAG_UNENCRYPTED, &init4.encode())
        .await?;

    // The server now speaks fake-key-encrypted commands.
    let ivexpand = wait_for_command(inner, "initivexpand2").await?;

    let license_blob = BASE64
        .decode(ivexpand.get("l").unwrap_or_default())
        .map_err(|e| Error::Protocol(format!("initivexpand2 license: {}", e)))?;
    let beta = BASE64
        .decode(ivexpand.get("beta").unwrap_or_default())
        .map_err(|e| Error::Protocol(format!("initivexpand2 beta: {}", e)))?;
    if ivexpand.get("omega").is_none() {
        tracing::debug!("initivexpand2 carries no omega; proof not checked");
    }

    let strict = inner.options.strict_license;
    let server_key = match tokio::task::spawn_blocking(move || {
        license::derive_server_key(&license_blob)
    })
    .await
    .map_err(|e| Error::Crypto(format!("license worker: {}", e)))?
    {
        Ok(key) => key,
        Err(e) if strict => return Err(e),
        Err(e) => {
            // Known server misbehavior: carry on with garbage so the
            // handshake fails uniformly at the clientek proof.
            inner
                .emit(Event::Warning {
                    detail: format!("license derivation failed ({}), using random key material", e),
                })
                .await;
            let mut fallback = [0u8; 32];
            OsRng.fill_bytes(&mut fallback);
            fallback
        }
    };

    let ephemeral = EphemeralKey::from_seed(keys.ed_seed);
    let shared_secret = ephemeral.shared_secret(&server_key);
    let session = SessionCrypto::new(&shared_secret, &keys.alpha, &beta)?;
    let proof = ephemeral.sign(session.shared_iv());

    let clientek = Command::new("clientek")
        .arg("ek", BASE64.encode(ephemeral.public_bytes()))
        .arg("proof", BASE64.encode(proof));
    inner.send_command(clientek).await?;

    // Everything after clientek runs on the session schedule.
    inner.codec.lock().await.crypto = PacketCrypto::Session(session);
    inner.view.lock().await.state = SessionState::Authenticating;

    let mut clientinit = Command::new("clientinit")
        .arg("client_nickname", inner.options.nickname.clone())
        .arg("client_version", "3.6.2 [Build: 1695202006]")
        .arg("client_platform", "Linux")
        .arg("client_input_hardware", "1")
        .arg("client_output_hardware", "1");
    if let Some(channel) = &inner.options.default_channel {
        clientinit = clientinit.arg("client_default_channel", channel.clone());
    }
    if let Some(password) = &inner.options.server_password {
        clientinit = clientinit.arg("client_server_password", password.clone());
    }
    if let Some(hwid) = &inner.options.hwid {
        clientinit = clientinit.arg("hwid", hwid.clone());
    }
    inner.send_command(clientinit).await?;

    let initserver = wait_for_command(inner, "initserver").await?;
    let own_id: u16 = initserver
        .get_parsed("aclid")
        .ok_or_else(|| Error::Protocol("initserver without aclid".into()))?;
    {
        let mut view = inner.view.lock().await;
        view.own_client_id = own_id;
        view.server_name = initserver.get("virtualserver_name").unwrap_or_default().to_string();
        view.current_channel = initserver.get_parsed("channelid").unwrap_or(0);
        view.state = SessionState::Authenticated;
    }
    inner.codec.lock().await.client_id = own_id;

    for category in ["textchannel", "textprivate", "server"] {
        let register = Command::new("servernotifyregister")
            .arg("event", category)
            .arg("id", "0");
        inner.send_command(register).await?;
    }
    inner.send_command(Command::new("clientlist")).await?;
    inner.send_command(Command::new("channellist")).await?;

    Ok(())
}

/// Receive until an init packet arrives, returning its payload.
async fn recv_init_payload(inner: &Arc<Inner>) -> Result<Vec<u8>> {
    loop {
        let datagram = inner.transport.recv().await?;
        inner.note_received(datagram.len()).await;
        let decoded = inner.codec.lock().await.decode(&datagram)?;
        if let Inbound::Packet { header, payload } = decoded {
            if header.packet_type == PacketType::Init {
                return Ok(payload);
            }
        }
    }
}

/// Receive until the named command arrives, acking command frames and
/// consuming acks along the way.
async fn wait_for_command(inner: &Arc<Inner>, name: &str) -> Result<Command> {
    loop {
        let datagram = inner.transport.recv().await?;
        inner.note_received(datagram.len()).await;
        let decoded = inner.codec.lock().await.decode(&datagram)?;
        match decoded {
            Inbound::CommandFrame { header, complete } => {
                if let Some(ack_type) = header.packet_type.ack_type() {
                    inner.send_ack(ack_type, header.packet_id).await?;
                }
                let Some(payload) = complete else { continue };
                let line = String::from_utf8(payload)
                    .map_err(|_| Error::Protocol("command is not UTF-8".into()))?;
                let cmd = Command::parse(&line)?;
                if cmd.name == name {
                    return Ok(cmd);
                }
                if cmd.name == "error" {
                    if let Some(id) = cmd.get("id") {
                        if id != "0" {
                            let msg = cmd.get("msg").unwrap_or("unknown error").to_string();
                            return Err(Error::Rejected(msg));
                        }
                    }
                }
                tracing::debug!("ignoring {} while waiting for {}", cmd.name, name);
            }
            Inbound::Packet { header, payload } => match header.packet_type {
                PacketType::Ack => inner.complete_ack(PacketType::Command, &payload).await,
                PacketType::AckLow => inner.complete_ack(PacketType::CommandLow, &payload).await,
                PacketType::Ping => {
                    inner
                        .send_packet(
                            PacketType::Pong,
                            FLAG_UNENCRYPTED,
                            &header.packet_id.to_be_bytes(),
                        )
                        .await?;
                }
                _ => {}
            },
            Inbound::Compressed { header } => {
                inner.counters.compressed_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("dropping compressed command packet {}", header.packet_id);
                if let Some(ack_type) = header.packet_type.ack_type() {
                    inner.send_ack(ack_type, header.packet_id).await?;
                }
            }
            Inbound::Dropped => {}
        }
    }
}

impl Inner {
    async fn note_received(&self, len: usize) {
        *self.last_incoming.lock().await = Instant::now();
        self.counters.rx_bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.counters.rx_packets.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Session loops
// ---------------------------------------------------------------------------

async fn recv_loop(inner: Arc<Inner>) {
    loop {
        let datagram = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            result = inner.transport.recv() => match result {
                Ok(datagram) => datagram,
                Err(Error::Closed) => {
                    inner.shutdown("connection closed", Some(Error::Closed)).await;
                    break;
                }
                Err(e) => {
                    inner.shutdown("transport failure", Some(e)).await;
                    break;
                }
            },
        };

        if let Err(e) = handle_datagram(&inner, &datagram).await {
            match e.kind() {
                // Malformed traffic and broken fragment streams are
                // protocol violations, not survivable noise.
                ErrorKind::Protocol => {
                    inner.shutdown("protocol violation", Some(e)).await;
                    break;
                }
                _ => {
                    inner.shutdown("transport failure", Some(e)).await;
                    break;
                }
            }
        }
    }
}

async fn handle_datagram(inner: &Arc<Inner>, datagram: &[u8]) -> Result<()> {
    inner.note_received(datagram.len()).await;
    let decoded = inner.codec.lock().await.decode(datagram)?;

    match decoded {
        Inbound::Dropped => {}
        Inbound::CommandFrame { header, complete } => {
            if let Some(ack_type) = header.packet_type.ack_type() {
                inner.send_ack(ack_type, header.packet_id).await?;
            }
            if let Some(payload) = complete {
                let line = String::from_utf8(payload)
                    .map_err(|_| Error::Protocol("command is not UTF-8".into()))?;
                match Command::parse(&line) {
                    Ok(cmd) => handle_command(inner, cmd).await,
                    Err(e) => {
                        // A single garbled notification is surfaced but
                        // does not end the session.
                        inner
                            .emit(Event::Error {
                                kind: ErrorKind::Protocol,
                                detail: e.to_string(),
                            })
                            .await;
                    }
                }
            }
        }
        Inbound::Packet { header, payload } => match header.packet_type {
            PacketType::Ping => {
                inner
                    .send_packet(
                        PacketType::Pong,
                        FLAG_UNENCRYPTED,
                        &header.packet_id.to_be_bytes(),
                    )
                    .await?;
            }
            PacketType::Pong => {}
            PacketType::Ack => inner.complete_ack(PacketType::Command, &payload).await,
            PacketType::AckLow => inner.complete_ack(PacketType::CommandLow, &payload).await,
            PacketType::Voice => {
                if payload.len() >= 5 {
                    let from = u16::from_be_bytes([payload[2], payload[3]]);
                    inner
                        .emit(Event::Audio {
                            from,
                            codec: payload[4],
                            payload: payload[5..].to_vec(),
                        })
                        .await;
                }
            }
            PacketType::VoiceWhisper => {
                tracing::debug!("dropping whisper packet ({} bytes)", payload.len());
            }
            PacketType::Init => {}
            // Command frames only land here when a server marks them
            // UNENCRYPTED, which the protocol does not allow.
            PacketType::Command | PacketType::CommandLow => {
                tracing::debug!("dropping unencrypted command packet");
            }
        },
        Inbound::Compressed { header } => {
            inner.counters.compressed_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("dropping compressed command packet {}", header.packet_id);
            if let Some(ack_type) = header.packet_type.ack_type() {
                inner.send_ack(ack_type, header.packet_id).await?;
            }
        }
    }
    Ok(())
}

async fn handle_command(inner: &Arc<Inner>, cmd: Command) {
    match cmd.name.as_str() {
        "notifytextmessage" => {
            let mode = cmd
                .get_parsed::<u8>("targetmode")
                .and_then(TextMessageMode::from_wire)
                .unwrap_or(TextMessageMode::Server);
            inner
                .emit(Event::TextMessage {
                    mode,
                    text: cmd.get("msg").unwrap_or_default().to_string(),
                    invoker_name: cmd.get("invokername").unwrap_or_default().to_string(),
                    invoker_id: cmd.get_parsed("invokerid").unwrap_or(0),
                })
                .await;
        }
        "notifyclientpoke" => {
            inner
                .emit(Event::TextMessage {
                    mode: TextMessageMode::Poke,
                    text: cmd.get("msg").unwrap_or_default().to_string(),
                    invoker_name: cmd.get("invokername").unwrap_or_default().to_string(),
                    invoker_id: cmd.get_parsed("invokerid").unwrap_or(0),
                })
                .await;
        }
        "notifycliententerview" => {
            let mut view = inner.view.lock().await;
            for item in &cmd.items {
                let clid = find_parsed::<u16>(item, "clid");
                let nickname = find(item, "client_nickname");
                if let (Some(clid), Some(nickname)) = (clid, nickname) {
                    view.clients.insert(clid, nickname.to_string());
                }
            }
        }
        "notifyclientleftview" => {
            let own_id = inner.view.lock().await.own_client_id;
            for item in &cmd.items {
                let Some(clid) = find_parsed::<u16>(item, "clid") else { continue };
                if clid == own_id {
                    let reason = match find_parsed::<u32>(item, "reasonid") {
                        Some(5) => "kicked".to_string(),
                        Some(6) => "banned".to_string(),
                        _ => find(item, "reasonmsg").unwrap_or("left").to_string(),
                    };
                    inner.shutdown(&reason, None).await;
                    return;
                }
                inner.view.lock().await.clients.remove(&clid);
            }
        }
        "notifyclientmoved" => {
            let mut view = inner.view.lock().await;
            let clid = cmd.get_parsed::<u16>("clid");
            let target = cmd.get_parsed::<u64>("ctid");
            if let (Some(clid), Some(target)) = (clid, target) {
                if clid == view.own_client_id {
                    view.current_channel = target;
                }
            }
        }
        "channellist" | "notifychannelcreated" | "notifychanneledited" => {
            let mut view = inner.view.lock().await;
            for item in &cmd.items {
                let cid = find_parsed::<u64>(item, "cid");
                let name = find(item, "channel_name");
                if let (Some(cid), Some(name)) = (cid, name) {
                    view.channels.insert(cid, name.to_string());
                }
            }
        }
        "notifychanneldeleted" => {
            let mut view = inner.view.lock().await;
            for item in &cmd.items {
                if let Some(cid) = find_parsed::<u64>(item, "cid") {
                    view.channels.remove(&cid);
                }
            }
        }
        "notifyserveredited" => {
            if let Some(name) = cmd.get("virtualserver_name") {
                inner.view.lock().await.server_name = name.to_string();
            }
        }
        "clientlist" => {
            let mut view = inner.view.lock().await;
            for item in &cmd.items {
                let clid = find_parsed::<u16>(item, "clid");
                let nickname = find(item, "client_nickname");
                if let (Some(clid), Some(nickname)) = (clid, nickname) {
                    view.clients.insert(clid, nickname.to_string());
                }
            }
        }
        "channellistfinished" => {}
        "error" => {
            if let Some(id) = cmd.get("id") {
                if id != "0" {
                    inner
                        .emit(Event::Error {
                            kind: ErrorKind::Rejected,
                            detail: cmd.get("msg").unwrap_or("unknown error").to_string(),
                        })
                        .await;
                }
            }
        }
        "initserver" | "initivexpand2" => {
            tracing::debug!("ignoring duplicate handshake command {}", cmd.name);
        }
        other => {
            tracing::debug!("ignoring unknown notification {}", other);
        }
    }
}

fn find<'a>(item: &'a [(String, String)], key: &str) -> Option<&'a str> {
    item.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn find_parsed<T: std::str::FromStr>(item: &[(String, String)], key: &str) -> Option<T> {
    find(item, key)?.parse().ok()
}

async fn ping_loop(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(inner.options.ping_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = interval.tick() => {
                if inner.send_packet(PacketType::Ping, FLAG_UNENCRYPTED, &[]).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn resend_loop(inner: Arc<Inner>) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(RESEND_TICK) => {}
        }

        let now = Instant::now();
        let mut to_resend = Vec::new();
        let mut expired = false;
        {
            let mut outstanding = inner.outstanding.lock().await;
            for send in outstanding.values_mut() {
                if now < send.next_resend {
                    continue;
                }
                if now.duration_since(send.first_sent) > inner.options.resend_timeout {
                    expired = true;
                    break;
                }
                send.attempts += 1;
                let backoff = RESEND_BACKOFF_START
                    .saturating_mul(1u32 << send.attempts.min(16))
                    .min(RESEND_BACKOFF_MAX);
                send.next_resend = now + backoff;
                to_resend.push(send.datagram.clone());
            }
        }

        if expired {
            inner.shutdown("timeout", Some(Error::Timeout)).await;
            break;
        }
        for datagram in to_resend {
            if let Err(e) = inner.send_raw(&datagram).await {
                tracing::debug!("retransmit failed: {}", e);
            }
        }
    }
}

async fn idle_loop(inner: Arc<Inner>) {
    let tick = (inner.options.idle_timeout / 4).max(Duration::from_millis(50));
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(tick) => {}
        }
        let idle = inner.last_incoming.lock().await.elapsed();
        if idle > inner.options.idle_timeout {
            inner.shutdown("timeout", Some(Error::Timeout)).await;
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> SessionCrypto {
        SessionCrypto::new(&[7u8; 32], &[1u8; 10], &[2u8; 16]).unwrap()
    }

    /// Build a server→client packet the way a real server would.
    fn server_packet(
        session: &SessionCrypto,
        packet_type: PacketType,
        packet_id: u16,
        flags: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut header = Header {
            mac: [0u8; 8],
            packet_id,
            client_id: None,
            packet_type,
            flags,
        };
        let (key, nonce) = session.key_nonce(false, packet_type as u8, packet_id, 0);
        let (ciphertext, tag) = crypto::eax::encrypt(&key, &nonce, &header.meta(), payload);
        header.mac.copy_from_slice(&tag[..8]);
        let mut datagram = header.encode();
        datagram.extend_from_slice(&ciphertext);
        datagram
    }

    #[test]
    fn codec_roundtrips_server_command() {
        let session = session_pair();
        let mut codec = Codec::new();
        codec.crypto = PacketCrypto::Session(session.clone());

        let datagram = server_packet(&session, PacketType::Command, 0, 0, b"notifyserveredited");
        match codec.decode(&datagram).unwrap() {
            Inbound::CommandFrame { header, complete } => {
                assert_eq!(header.packet_id, 0);
                assert_eq!(complete.as_deref(), Some(&b"notifyserveredited"[..]));
            }
            _ => panic!("expected command frame"),
        }
    }

    #[test]
    fn codec_drops_corrupted_packet_silently() {
        let session = session_pair();
        let mut codec = Codec::new();
        codec.crypto = PacketCrypto::Session(session.clone());

        let mut datagram = server_packet(&session, PacketType::Command, 0, 0, b"payload");
        let last = datagram.len() - 1;
        datagram[last] ^= 0x01;
        assert!(matches!(codec.decode(&datagram).unwrap(), Inbound::Dropped));

        // The untouched original still decrypts: no counter advanced.
        let datagram = server_packet(&session, PacketType::Command, 0, 0, b"payload");
        assert!(matches!(
            codec.decode(&datagram).unwrap(),
            Inbound::CommandFrame { .. }
        ));
    }

    #[test]
    fn codec_reassembles_fragmented_command() {
        let session = session_pair();
        let mut codec = Codec::new();
        codec.crypto = PacketCrypto::Session(session.clone());

        let first = server_packet(&session, PacketType::Command, 0, wire::FLAG_FRAGMENTED, b"clientlist clid=1 ");
        let second = {
            let mut header = Header {
                mac: [0u8; 8],
                packet_id: 1,
                client_id: None,
                packet_type: PacketType::Command,
                flags: 0,
            };
            let (key, nonce) = session.key_nonce(false, PacketType::Command as u8, 1, 0);
            let (ciphertext, tag) =
                crypto::eax::encrypt(&key, &nonce, &header.meta(), b"client_nickname=Bot");
            header.mac.copy_from_slice(&tag[..8]);
            let mut datagram = header.encode();
            datagram.extend_from_slice(&ciphertext);
            datagram
        };

        match codec.decode(&first).unwrap() {
            Inbound::CommandFrame { complete, .. } => assert!(complete.is_none()),
            _ => panic!(),
        }
        match codec.decode(&second).unwrap() {
            Inbound::CommandFrame { complete, .. } => {
                assert_eq!(
                    complete.as_deref(),
                    Some(&b"clientlist clid=1 client_nickname=Bot"[..])
                );
            }
            _ => panic!(),
        }
    }

    #[test]
    fn codec_suppresses_replayed_command_frame() {
        let session = session_pair();
        let mut codec = Codec::new();
        codec.crypto = PacketCrypto::Session(session.clone());

        let datagram = server_packet(&session, PacketType::Command, 0, 0, b"channellistfinished");
        match codec.decode(&datagram).unwrap() {
            Inbound::CommandFrame { complete, .. } => assert!(complete.is_some()),
            _ => panic!(),
        }
        // Same frame again: still acked (a frame is returned), but the
        // payload is not delivered a second time.
        match codec.decode(&datagram).unwrap() {
            Inbound::CommandFrame { complete, header } => {
                assert!(complete.is_none());
                assert_eq!(header.packet_id, 0);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn codec_init_packets_bypass_crypto() {
        let mut codec = Codec::new();
        let (id, datagram) = codec.encode(PacketType::Init, FLAG_UNENCRYPTED, &[0xAB; 21]);
        assert_eq!(id, wire::INIT_PACKET_ID);
        assert_eq!(&datagram[..8], b"TS3INIT1");
        assert_eq!(&datagram[13..], &[0xAB; 21]);
    }

    #[test]
    fn codec_command_ids_advance() {
        let mut codec = Codec::new();
        let (id0, _) = codec.encode(PacketType::Command, FLAG_NEWPROTOCOL, b"a");
        let (id1, _) = codec.encode(PacketType::Command, FLAG_NEWPROTOCOL, b"b");
        let (ping_id, _) = codec.encode(PacketType::Ping, FLAG_UNENCRYPTED, &[]);
        assert_eq!((id0, id1), (0, 1));
        // Per-type counters are independent.
        assert_eq!(ping_id, 0);
    }

    #[test]
    fn handshake_keys_random_are_distinct() {
        let a = HandshakeKeys::random();
        let b = HandshakeKeys::random();
        assert_ne!(a.ed_seed, b.ed_seed);
    }
}
