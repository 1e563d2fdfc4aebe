//! Handshake init packets and session state machine.
//!
//! The five-step init exchange rides in `Init` packets (literal
//! `TS3INIT1` MAC, fixed packet id). Client→server payloads open with the
//! 4-byte client version offset; server→client payloads open directly
//! with the step tag.

use crate::types::Error;

/// Seconds between the epoch the protocol counts client builds from
/// (2013-01-01 00:00:00 UTC) and this client's build timestamp.
pub const CLIENT_VERSION_OFFSET: u32 = 321_840_000;

pub const INIT0_SIZE: usize = 21;
pub const INIT1_SIZE: usize = 21;
pub const INIT2_SIZE: usize = 25;
pub const INIT3_SIZE: usize = 233;

/// Connection lifecycle. The first three states name the last init step
/// sent; `Authenticating` covers `clientek`/`clientinit` up to
/// `initserver`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init0Sent,
    Init2Sent,
    Init4Sent,
    Authenticating,
    Authenticated,
    Disconnected,
}

fn check_step(payload: &[u8], at: usize, step: u8, size: usize) -> Result<(), Error> {
    if payload.len() != size {
        return Err(Error::Protocol(format!(
            "init step {} payload must be {} bytes, got {}",
            step,
            size,
            payload.len()
        )));
    }
    if payload[at] != step {
        return Err(Error::Protocol(format!(
            "expected init step {}, got {}",
            step, payload[at]
        )));
    }
    Ok(())
}

/// Step 0 (C→S): announce ourselves with a timestamp and a 4-byte nonce.
/// Eight reserved zero bytes pad the payload to 21 bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Init0 {
    pub timestamp: u32,
    pub random0: [u8; 4],
}

impl Init0 {
    pub fn encode(&self) -> [u8; INIT0_SIZE] {
        let mut out = [0u8; INIT0_SIZE];
        out[..4].copy_from_slice(&CLIENT_VERSION_OFFSET.to_be_bytes());
        out[4] = 0x00;
        out[5..9].copy_from_slice(&self.timestamp.to_be_bytes());
        out[9..13].copy_from_slice(&self.random0);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        check_step(payload, 4, 0x00, INIT0_SIZE)?;
        Ok(Self {
            timestamp: u32::from_be_bytes(payload[5..9].try_into().unwrap()),
            random0: payload[9..13].try_into().unwrap(),
        })
    }
}

/// Step 1 (S→C): the server's 16-byte nonce plus our nonce echoed back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Init1 {
    pub random1: [u8; 16],
    pub random0_r: [u8; 4],
}

impl Init1 {
    pub fn encode(&self) -> [u8; INIT1_SIZE] {
        let mut out = [0u8; INIT1_SIZE];
        out[0] = 0x01;
        out[1..17].copy_from_slice(&self.random1);
        out[17..21].copy_from_slice(&self.random0_r);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        check_step(payload, 0, 0x01, INIT1_SIZE)?;
        Ok(Self {
            random1: payload[1..17].try_into().unwrap(),
            random0_r: payload[17..21].try_into().unwrap(),
        })
    }
}

/// Step 2 (C→S): echo both nonces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Init2 {
    pub random1: [u8; 16],
    pub random0_r: [u8; 4],
}

impl Init2 {
    pub fn encode(&self) -> [u8; INIT2_SIZE] {
        let mut out = [0u8; INIT2_SIZE];
        out[..4].copy_from_slice(&CLIENT_VERSION_OFFSET.to_be_bytes());
        out[4] = 0x02;
        out[5..21].copy_from_slice(&self.random1);
        out[21..25].copy_from_slice(&self.random0_r);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        check_step(payload, 4, 0x02, INIT2_SIZE)?;
        Ok(Self {
            random1: payload[5..21].try_into().unwrap(),
            random0_r: payload[21..25].try_into().unwrap(),
        })
    }
}

/// Step 3 (S→C): the squaring puzzle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Init3 {
    pub x: [u8; 64],
    pub n: [u8; 64],
    pub level: u32,
    pub random2: [u8; 100],
}

impl Init3 {
    pub fn encode(&self) -> [u8; INIT3_SIZE] {
        let mut out = [0u8; INIT3_SIZE];
        out[0] = 0x03;
        out[1..65].copy_from_slice(&self.x);
        out[65..129].copy_from_slice(&self.n);
        out[129..133].copy_from_slice(&self.level.to_be_bytes());
        out[133..233].copy_from_slice(&self.random2);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        check_step(payload, 0, 0x03, INIT3_SIZE)?;
        Ok(Self {
            x: payload[1..65].try_into().unwrap(),
            n: payload[65..129].try_into().unwrap(),
            level: u32::from_be_bytes(payload[129..133].try_into().unwrap()),
            random2: payload[133..233].try_into().unwrap(),
        })
    }
}

/// Step 4 (C→S): the echoed puzzle, its solution, and the opening
/// `clientinitiv` command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Init4 {
    pub x: [u8; 64],
    pub n: [u8; 64],
    pub level: u32,
    pub random2: [u8; 100],
    pub y: [u8; 64],
    pub command: Vec<u8>,
}

impl Init4 {
    pub fn from_puzzle(init3: &Init3, y: [u8; 64], command: &str) -> Self {
        Self {
            x: init3.x,
            n: init3.n,
            level: init3.level,
            random2: init3.random2,
            y,
            command: command.as_bytes().to_vec(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(301 + self.command.len());
        out.extend_from_slice(&CLIENT_VERSION_OFFSET.to_be_bytes());
        out.push(0x04);
        out.extend_from_slice(&self.x);
        out.extend_from_slice(&self.n);
        out.extend_from_slice(&self.level.to_be_bytes());
        out.extend_from_slice(&self.random2);
        out.extend_from_slice(&self.y);
        out.extend_from_slice(&self.command);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        const FIXED: usize = 4 + 1 + 64 + 64 + 4 + 100 + 64;
        if payload.len() < FIXED {
            return Err(Error::Protocol(format!(
                "init step 4 payload too short ({} bytes)",
                payload.len()
            )));
        }
        if payload[4] != 0x04 {
            return Err(Error::Protocol(format!(
                "expected init step 4, got {}",
                payload[4]
            )));
        }
        Ok(Self {
            x: payload[5..69].try_into().unwrap(),
            n: payload[69..133].try_into().unwrap(),
            level: u32::from_be_bytes(payload[133..137].try_into().unwrap()),
            random2: payload[137..237].try_into().unwrap(),
            y: payload[237..301].try_into().unwrap(),
            command: payload[301..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init0_roundtrip() {
        let init0 = Init0 {
            timestamp: 1_700_000_000,
            random0: [1, 2, 3, 4],
        };
        let bytes = init0.encode();
        assert_eq!(bytes.len(), 21);
        assert_eq!(&bytes[..4], &CLIENT_VERSION_OFFSET.to_be_bytes());
        assert_eq!(bytes[4], 0x00);
        assert_eq!(&bytes[13..], &[0u8; 8]);
        assert_eq!(Init0::parse(&bytes).unwrap(), init0);
    }

    #[test]
    fn init1_roundtrip() {
        let init1 = Init1 {
            random1: [7u8; 16],
            random0_r: [9, 8, 7, 6],
        };
        assert_eq!(Init1::parse(&init1.encode()).unwrap(), init1);
    }

    #[test]
    fn init2_roundtrip() {
        let init2 = Init2 {
            random1: [0x55u8; 16],
            random0_r: [1, 1, 2, 2],
        };
        assert_eq!(Init2::parse(&init2.encode()).unwrap(), init2);
    }

    #[test]
    fn init3_roundtrip() {
        let init3 = Init3 {
            x: [0x11u8; 64],
            n: [0x22u8; 64],
            level: 10_000,
            random2: [0x33u8; 100],
        };
        assert_eq!(Init3::parse(&init3.encode()).unwrap(), init3);
    }

    #[test]
    fn init4_roundtrip() {
        let init3 = Init3 {
            x: [0x11u8; 64],
            n: [0x22u8; 64],
            level: 42,
            random2: [0x33u8; 100],
        };
        let init4 = Init4::from_puzzle(&init3, [0x44u8; 64], "clientinitiv alpha=AAAA ot=1 ip");
        let parsed = Init4::parse(&init4.encode()).unwrap();
        assert_eq!(parsed, init4);
        assert_eq!(parsed.level, 42);
    }

    #[test]
    fn wrong_step_rejected() {
        let init1 = Init1 {
            random1: [0u8; 16],
            random0_r: [0u8; 4],
        };
        let mut bytes = init1.encode();
        bytes[0] = 0x02;
        assert!(Init1::parse(&bytes).is_err());
    }

    #[test]
    fn wrong_length_rejected() {
        assert!(Init1::parse(&[0x01; 20]).is_err());
        assert!(Init3::parse(&[0x03; 232]).is_err());
        assert!(Init4::parse(&[0x04; 100]).is_err());
    }
}
