//! Cryptographic primitives for the TS3 session layer.
//!
//! - EAX over AES-128 with truncated tags (packet encryption)
//! - Ed25519 point arithmetic for license derivation and key agreement
//! - the modular-squaring connection puzzle
//! - the per-packet key schedule derived from the shared IV

pub mod eax;
pub mod keys;
pub mod license;
pub mod puzzle;

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::types::Error;

/// Key and nonce used for command packets during the handshake, before
/// any key agreement has happened.
pub const FAKE_KEY: [u8; 16] = *b"c:\\windows\\syste";
pub const FAKE_NONCE: [u8; 16] = *b"m\\firewall32.cpl";

/// Client nonce length mixed into the shared IV at offset 0.
pub const ALPHA_SIZE: usize = 10;
/// Maximum server nonce length, mixed in at offset 10.
pub const BETA_MAX_SIZE: usize = 54;

/// Ed25519 scalar clamping per RFC 8032.
pub(crate) fn clamp_scalar_bytes(bytes: &mut [u8; 32]) {
    bytes[0] &= 0xF8;
    bytes[31] &= 0x3F;
    bytes[31] |= 0x40;
}

/// Immutable per-session key material: the 64-byte shared IV feeding the
/// per-packet KDF, and the 8-byte shared MAC stamped on unencrypted
/// packets.
#[derive(Clone)]
pub struct SessionCrypto {
    shared_iv: [u8; 64],
    shared_mac: [u8; 8],
}

impl SessionCrypto {
    /// Combine the DH shared secret with both handshake nonces.
    pub fn new(shared_secret: &[u8; 32], alpha: &[u8; ALPHA_SIZE], beta: &[u8]) -> Result<Self, Error> {
        if beta.len() > BETA_MAX_SIZE {
            return Err(Error::Protocol(format!("beta too long ({} bytes)", beta.len())));
        }
        let mut shared_iv: [u8; 64] = Sha512::digest(shared_secret).into();
        for (i, b) in alpha.iter().enumerate() {
            shared_iv[i] ^= b;
        }
        for (i, b) in beta.iter().enumerate() {
            shared_iv[ALPHA_SIZE + i] ^= b;
        }

        let digest = Sha1::digest(shared_iv);
        let mut shared_mac = [0u8; 8];
        shared_mac.copy_from_slice(&digest[..8]);

        Ok(Self { shared_iv, shared_mac })
    }

    pub fn shared_iv(&self) -> &[u8; 64] {
        &self.shared_iv
    }

    pub fn shared_mac(&self) -> &[u8; 8] {
        &self.shared_mac
    }

    /// Per-packet key schedule.
    ///
    /// A 70-byte buffer — direction tag, packet type, generation (BE),
    /// shared IV — is hashed with SHA-256; the first half keys AES, the
    /// second half is the EAX nonce. The packet id is folded into the
    /// first two key bytes so consecutive packets never share a key.
    pub fn key_nonce(
        &self,
        c2s: bool,
        packet_type: u8,
        packet_id: u16,
        generation: u32,
    ) -> ([u8; 16], [u8; 16]) {
        let mut input = [0u8; 70];
        input[0] = if c2s { 0x31 } else { 0x30 };
        input[1] = packet_type;
        input[2..6].copy_from_slice(&generation.to_be_bytes());
        input[6..70].copy_from_slice(&self.shared_iv);

        let hash: [u8; 32] = Sha256::digest(input).into();
        let mut key: [u8; 16] = hash[..16].try_into().unwrap();
        let nonce: [u8; 16] = hash[16..].try_into().unwrap();
        key[0] ^= (packet_id >> 8) as u8;
        key[1] ^= packet_id as u8;
        (key, nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_key_material() {
        assert_eq!(&FAKE_KEY, b"c:\\windows\\syste");
        assert_eq!(&FAKE_NONCE, b"m\\firewall32.cpl");
    }

    #[test]
    fn shared_iv_mixes_nonces_at_offsets() {
        let secret = [0x42u8; 32];
        let alpha = [0xFFu8; ALPHA_SIZE];
        let beta = [0xAAu8; 20];
        let session = SessionCrypto::new(&secret, &alpha, &beta).unwrap();

        let base: [u8; 64] = Sha512::digest(secret).into();
        for i in 0..ALPHA_SIZE {
            assert_eq!(session.shared_iv[i], base[i] ^ 0xFF);
        }
        for i in 0..beta.len() {
            assert_eq!(session.shared_iv[ALPHA_SIZE + i], base[ALPHA_SIZE + i] ^ 0xAA);
        }
        for i in ALPHA_SIZE + beta.len()..64 {
            assert_eq!(session.shared_iv[i], base[i]);
        }
    }

    #[test]
    fn shared_mac_is_sha1_prefix() {
        let session = SessionCrypto::new(&[1u8; 32], &[0u8; ALPHA_SIZE], &[]).unwrap();
        let digest = Sha1::digest(session.shared_iv);
        assert_eq!(session.shared_mac(), &digest[..8]);
    }

    #[test]
    fn oversized_beta_rejected() {
        let beta = [0u8; BETA_MAX_SIZE + 1];
        assert!(SessionCrypto::new(&[0u8; 32], &[0u8; ALPHA_SIZE], &beta).is_err());
    }

    #[test]
    fn key_schedule_separates_packets() {
        let session = SessionCrypto::new(&[9u8; 32], &[1u8; ALPHA_SIZE], &[2u8; 10]).unwrap();

        let (k1, n1) = session.key_nonce(true, 2, 0, 0);
        let (k2, _) = session.key_nonce(true, 2, 1, 0);
        let (k3, _) = session.key_nonce(false, 2, 0, 0);
        let (k4, n4) = session.key_nonce(true, 2, 0, 1);
        let (k5, _) = session.key_nonce(true, 3, 0, 0);

        assert_ne!(k1, k2); // packet id folded in
        assert_ne!(k1, k3); // direction tag
        assert_ne!((k1, n1), (k4, n4)); // generation
        assert_ne!(k1, k5); // packet type

        // Deterministic for identical inputs.
        assert_eq!(session.key_nonce(true, 2, 0, 0), (k1, n1));
    }

    #[test]
    fn key_id_fold_touches_first_two_bytes_only() {
        let session = SessionCrypto::new(&[9u8; 32], &[1u8; ALPHA_SIZE], &[]).unwrap();
        let (base, _) = session.key_nonce(true, 2, 0, 0);
        let (folded, _) = session.key_nonce(true, 2, 0x1234, 0);
        assert_eq!(folded[0], base[0] ^ 0x12);
        assert_eq!(folded[1], base[1] ^ 0x34);
        assert_eq!(&folded[2..], &base[2..]);
    }
}
