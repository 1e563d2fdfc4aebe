//! Wire framing for the TS3 UDP protocol.
//!
//! Client→server headers are 13 bytes, server→client 11 bytes:
//!
//! `MAC(8) | packet id(u16 BE) | client id(u16 BE, C2S only) | type/flags(u8)`
//!
//! The low nibble of the last byte is the packet type, the high nibble the
//! flag bits. Init packets replace the MAC with the literal `TS3INIT1`.

use crate::types::Error;

pub const MAC_SIZE: usize = 8;
pub const C2S_HEADER_SIZE: usize = 13;
pub const S2C_HEADER_SIZE: usize = 11;

/// Largest datagram the engine emits; larger commands are fragmented.
pub const MAX_PACKET_SIZE: usize = 500;
pub const MAX_C2S_PAYLOAD: usize = MAX_PACKET_SIZE - C2S_HEADER_SIZE;

/// Guard on the fragment assembly buffer.
pub const MAX_FRAGMENT_BUFFER: usize = 1024 * 1024;

pub const FLAG_UNENCRYPTED: u8 = 0x80;
pub const FLAG_COMPRESSED: u8 = 0x40;
pub const FLAG_NEWPROTOCOL: u8 = 0x20;
pub const FLAG_FRAGMENTED: u8 = 0x10;

/// MAC field of init packets, before any key material exists.
pub const INIT_MAC: [u8; MAC_SIZE] = *b"TS3INIT1";
/// Fixed packet id of init packets.
pub const INIT_PACKET_ID: u16 = 0x0065;

// ---------------------------------------------------------------------------
// Packet types
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Voice = 0,
    VoiceWhisper = 1,
    Command = 2,
    CommandLow = 3,
    Ping = 4,
    Pong = 5,
    Ack = 6,
    AckLow = 7,
    Init = 8,
}

pub const PACKET_TYPE_COUNT: usize = 9;

impl TryFrom<u8> for PacketType {
    type Error = Error;
    fn try_from(v: u8) -> Result<Self, Error> {
        match v {
            0 => Ok(Self::Voice),
            1 => Ok(Self::VoiceWhisper),
            2 => Ok(Self::Command),
            3 => Ok(Self::CommandLow),
            4 => Ok(Self::Ping),
            5 => Ok(Self::Pong),
            6 => Ok(Self::Ack),
            7 => Ok(Self::AckLow),
            8 => Ok(Self::Init),
            _ => Err(Error::Protocol(format!("unrecognized packet type {}", v))),
        }
    }
}

impl PacketType {
    /// Command-class packets require acknowledgement and may fragment.
    pub fn is_command(self) -> bool {
        matches!(self, Self::Command | Self::CommandLow)
    }

    /// The ack type answering this packet type, if any.
    pub fn ack_type(self) -> Option<PacketType> {
        match self {
            Self::Command => Some(Self::Ack),
            Self::CommandLow => Some(Self::AckLow),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// A decoded packet header, direction-agnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub mac: [u8; MAC_SIZE],
    pub packet_id: u16,
    /// Present only on client→server packets.
    pub client_id: Option<u16>,
    pub packet_type: PacketType,
    pub flags: u8,
}

impl Header {
    pub fn type_byte(&self) -> u8 {
        (self.packet_type as u8) | self.flags
    }

    /// Header length on the wire for this direction.
    pub fn len(&self) -> usize {
        if self.client_id.is_some() {
            C2S_HEADER_SIZE
        } else {
            S2C_HEADER_SIZE
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.mac);
        out.extend_from_slice(&self.packet_id.to_be_bytes());
        if let Some(client_id) = self.client_id {
            out.extend_from_slice(&client_id.to_be_bytes());
        }
        out.push(self.type_byte());
        out
    }

    /// The post-MAC header bytes, used as EAX associated data.
    pub fn meta(&self) -> Vec<u8> {
        self.encode()[MAC_SIZE..].to_vec()
    }

    fn decode(data: &[u8], c2s: bool) -> Result<(Self, &[u8]), Error> {
        let header_len = if c2s { C2S_HEADER_SIZE } else { S2C_HEADER_SIZE };
        if data.len() < header_len {
            return Err(Error::Protocol(format!("short packet ({} bytes)", data.len())));
        }
        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&data[..MAC_SIZE]);
        let packet_id = u16::from_be_bytes([data[8], data[9]]);
        let (client_id, type_at) = if c2s {
            (Some(u16::from_be_bytes([data[10], data[11]])), 12)
        } else {
            (None, 10)
        };
        let type_byte = data[type_at];
        let packet_type = PacketType::try_from(type_byte & 0x0F)?;
        Ok((
            Self {
                mac,
                packet_id,
                client_id,
                packet_type,
                flags: type_byte & 0xF0,
            },
            &data[header_len..],
        ))
    }

    /// Decode a server→client datagram into header and payload.
    pub fn decode_s2c(data: &[u8]) -> Result<(Self, &[u8]), Error> {
        Self::decode(data, false)
    }

    /// Decode a client→server datagram into header and payload.
    pub fn decode_c2s(data: &[u8]) -> Result<(Self, &[u8]), Error> {
        Self::decode(data, true)
    }
}

/// Build the header of a client→server init packet.
pub fn init_header_c2s() -> Header {
    Header {
        mac: INIT_MAC,
        packet_id: INIT_PACKET_ID,
        client_id: Some(0),
        packet_type: PacketType::Init,
        flags: FLAG_UNENCRYPTED,
    }
}

// ---------------------------------------------------------------------------
// Packet id counters
// ---------------------------------------------------------------------------

/// Outgoing packet id assignment for one packet type.
///
/// Ids are monotone 16-bit counters; the generation increments on wrap and
/// feeds the per-packet key derivation.
#[derive(Clone, Copy, Debug, Default)]
pub struct PacketIdCounter {
    next_id: u16,
    generation: u32,
}

impl PacketIdCounter {
    /// Take the next (id, generation) pair.
    pub fn next(&mut self) -> (u16, u32) {
        let id = self.next_id;
        let generation = self.generation;
        let (next, wrapped) = self.next_id.overflowing_add(1);
        self.next_id = next;
        if wrapped {
            self.generation = self.generation.wrapping_add(1);
        }
        (id, generation)
    }
}

/// Incoming id watermark for one packet type.
///
/// Packets of one type are processed in arrival order, so a received id
/// below the watermark means the 16-bit counter wrapped.
#[derive(Clone, Copy, Debug, Default)]
pub struct IncomingGeneration {
    last_id: Option<u16>,
    generation: u32,
}

impl IncomingGeneration {
    /// Generation a received id would belong to. Does not advance the
    /// watermark, so a packet that fails its MAC leaves no trace.
    pub fn peek(&self, id: u16) -> u32 {
        match self.last_id {
            Some(last) if id < last => self.generation.wrapping_add(1),
            _ => self.generation,
        }
    }

    /// Advance the watermark past a successfully authenticated id.
    pub fn commit(&mut self, id: u16) {
        self.generation = self.peek(id);
        self.last_id = Some(id);
    }
}

// ---------------------------------------------------------------------------
// Fragment assembly
// ---------------------------------------------------------------------------

/// Reassembles fragmented command payloads for one packet type.
///
/// Frames carrying [`FLAG_FRAGMENTED`] accumulate; the first frame without
/// the flag completes the message. Fragments must arrive with consecutive
/// packet ids; a gap means a second fragmented message was interleaved,
/// which the protocol forbids.
#[derive(Debug, Default)]
pub struct Defragmenter {
    buffer: Vec<u8>,
    assembling: bool,
    expected_id: u16,
}

impl Defragmenter {
    /// Feed one decrypted frame. Returns the completed payload, or `None`
    /// while assembly is still in progress.
    pub fn push(&mut self, packet_id: u16, flags: u8, payload: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let fragmented = flags & FLAG_FRAGMENTED != 0;

        if self.assembling && packet_id != self.expected_id {
            self.reset();
            return Err(Error::Protocol(
                "interleaved fragmented command streams".into(),
            ));
        }

        if !self.assembling && !fragmented {
            // Whole message in one frame, the common case.
            return Ok(Some(payload.to_vec()));
        }

        if self.buffer.len() + payload.len() > MAX_FRAGMENT_BUFFER {
            self.reset();
            return Err(Error::Protocol("fragment buffer overflow".into()));
        }
        self.buffer.extend_from_slice(payload);
        self.assembling = true;
        self.expected_id = packet_id.wrapping_add(1);

        if fragmented {
            return Ok(None);
        }
        let complete = std::mem::take(&mut self.buffer);
        self.assembling = false;
        Ok(Some(complete))
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.assembling = false;
    }
}

/// Split a command payload into fragment-sized chunks with their flags.
/// All but the last chunk carry [`FLAG_FRAGMENTED`].
pub fn fragment(payload: &[u8], max_chunk: usize) -> Vec<(Vec<u8>, u8)> {
    if payload.len() <= max_chunk {
        return vec![(payload.to_vec(), 0)];
    }
    let mut chunks: Vec<(Vec<u8>, u8)> = payload
        .chunks(max_chunk)
        .map(|c| (c.to_vec(), FLAG_FRAGMENTED))
        .collect();
    if let Some(last) = chunks.last_mut() {
        last.1 = 0;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_c2s() {
        let header = Header {
            mac: [0xAA; 8],
            packet_id: 0x1234,
            client_id: Some(42),
            packet_type: PacketType::Command,
            flags: FLAG_NEWPROTOCOL,
        };
        let mut bytes = header.encode();
        assert_eq!(bytes.len(), C2S_HEADER_SIZE);
        bytes.extend_from_slice(b"payload");
        let (decoded, payload) = Header::decode_c2s(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn header_roundtrip_s2c() {
        let header = Header {
            mac: [3; 8],
            packet_id: 7,
            client_id: None,
            packet_type: PacketType::Ack,
            flags: 0,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), S2C_HEADER_SIZE);
        let (decoded, payload) = Header::decode_s2c(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert!(payload.is_empty());
    }

    #[test]
    fn meta_is_post_mac_header() {
        let header = Header {
            mac: [0; 8],
            packet_id: 0x0102,
            client_id: Some(0x0304),
            packet_type: PacketType::Command,
            flags: FLAG_NEWPROTOCOL,
        };
        assert_eq!(header.meta(), vec![0x01, 0x02, 0x03, 0x04, 0x22]);
    }

    #[test]
    fn init_header_layout() {
        let bytes = init_header_c2s().encode();
        assert_eq!(&bytes[..8], b"TS3INIT1");
        assert_eq!(&bytes[8..10], &[0x00, 0x65]);
        assert_eq!(&bytes[10..12], &[0x00, 0x00]);
        assert_eq!(bytes[12], 0x88);
    }

    #[test]
    fn short_packet_rejected() {
        assert!(Header::decode_s2c(&[0u8; 5]).is_err());
        assert!(Header::decode_c2s(&[0u8; 12]).is_err());
    }

    #[test]
    fn packet_ids_monotone_with_generation() {
        let mut counter = PacketIdCounter::default();
        let (id, generation) = counter.next();
        assert_eq!((id, generation), (0, 0));

        let mut last = 0u16;
        for _ in 0..100 {
            let (id, generation) = counter.next();
            assert_eq!(id, last.wrapping_add(1));
            assert_eq!(generation, 0);
            last = id;
        }

        counter.next_id = u16::MAX;
        let (id, generation) = counter.next();
        assert_eq!((id, generation), (u16::MAX, 0));
        let (id, generation) = counter.next();
        assert_eq!((id, generation), (0, 1));
    }

    #[test]
    fn incoming_generation_tracks_wrap() {
        let mut incoming = IncomingGeneration::default();
        assert_eq!(incoming.peek(0xFFFE), 0);
        incoming.commit(0xFFFE);
        incoming.commit(0xFFFF);
        assert_eq!(incoming.peek(0x0000), 1);
        incoming.commit(0x0000);
        assert_eq!(incoming.peek(0x0001), 1);
    }

    #[test]
    fn incoming_generation_peek_is_pure() {
        let incoming = IncomingGeneration::default();
        assert_eq!(incoming.peek(5), 0);
        assert_eq!(incoming.peek(5), 0);
    }

    #[test]
    fn defragment_single_frame() {
        let mut defrag = Defragmenter::default();
        let out = defrag.push(5, 0, b"whole").unwrap();
        assert_eq!(out.as_deref(), Some(&b"whole"[..]));
    }

    #[test]
    fn defragment_multi_frame() {
        let mut defrag = Defragmenter::default();
        assert!(defrag.push(10, FLAG_FRAGMENTED, b"one").unwrap().is_none());
        assert!(defrag.push(11, FLAG_FRAGMENTED, b"two").unwrap().is_none());
        let out = defrag.push(12, 0, b"three").unwrap();
        assert_eq!(out.as_deref(), Some(&b"onetwothree"[..]));
    }

    #[test]
    fn defragment_wrapping_ids() {
        let mut defrag = Defragmenter::default();
        assert!(defrag.push(0xFFFF, FLAG_FRAGMENTED, b"a").unwrap().is_none());
        let out = defrag.push(0x0000, 0, b"b").unwrap();
        assert_eq!(out.as_deref(), Some(&b"ab"[..]));
    }

    #[test]
    fn defragment_rejects_interleaved_stream() {
        let mut defrag = Defragmenter::default();
        assert!(defrag.push(1, FLAG_FRAGMENTED, b"a").unwrap().is_none());
        // A frame with a non-consecutive id can only belong to a second
        // fragmented message of the same type.
        assert!(defrag.push(5, FLAG_FRAGMENTED, b"x").is_err());
    }

    #[test]
    fn defragment_buffer_guard() {
        let mut defrag = Defragmenter::default();
        let chunk = vec![0u8; MAX_FRAGMENT_BUFFER / 2 + 1];
        assert!(defrag.push(0, FLAG_FRAGMENTED, &chunk).unwrap().is_none());
        assert!(defrag.push(1, FLAG_FRAGMENTED, &chunk).is_err());
    }

    #[test]
    fn fragment_splits_and_flags() {
        let payload = vec![7u8; 1000];
        let chunks = fragment(&payload, 400);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].1, FLAG_FRAGMENTED);
        assert_eq!(chunks[1].1, FLAG_FRAGMENTED);
        assert_eq!(chunks[2].1, 0);
        let total: Vec<u8> = chunks.iter().flat_map(|(c, _)| c.clone()).collect();
        assert_eq!(total, payload);
    }

    #[test]
    fn fragment_small_payload_passthrough() {
        let chunks = fragment(b"small", 400);
        assert_eq!(chunks, vec![(b"small".to_vec(), 0)]);
    }
}
