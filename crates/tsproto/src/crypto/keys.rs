//! Session key material: the ephemeral Ed25519 keypair for the modern
//! handshake leg and the P-256 keypair for the historical `omega` field.

use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::Scalar;
use ed25519_dalek::{Signer, SigningKey};
use p256::pkcs8::EncodePublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};

use crate::types::Error;

use super::clamp_scalar_bytes;

/// Ephemeral Ed25519 keypair, used both for DH over the Ed25519 curve and
/// to sign the derived shared IV.
pub struct EphemeralKey {
    signing: SigningKey,
}

impl EphemeralKey {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Compressed Ed25519 public key, sent as `ek` in `clientek`.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// The clamped private scalar, per RFC 8032 key expansion.
    fn dh_scalar(&self) -> Scalar {
        let hash: [u8; 64] = Sha512::digest(self.signing.to_bytes()).into();
        let mut scalar_bytes: [u8; 32] = hash[..32].try_into().unwrap();
        clamp_scalar_bytes(&mut scalar_bytes);
        Scalar::from_bytes_mod_order(scalar_bytes)
    }

    /// DH over the Ed25519 curve: the compressed product of the peer's
    /// point and our clamped scalar. This is not X25519; both the curve
    /// and the output encoding stay in Edwards form.
    ///
    /// An invalid peer point yields random bytes instead of an error, so
    /// the handshake fails uniformly at the `clientek` proof.
    pub fn shared_secret(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        match CompressedEdwardsY(*peer_public).decompress() {
            Some(point) => (self.dh_scalar() * point).compress().to_bytes(),
            None => {
                tracing::warn!("peer key is not a curve point, key agreement will not converge");
                let mut fallback = [0u8; 32];
                OsRng.fill_bytes(&mut fallback);
                fallback
            }
        }
    }
}

/// P-256 keypair for the `omega` handshake field, exported as DER.
pub struct OmegaKey {
    secret: p256::SecretKey,
}

impl OmegaKey {
    pub fn generate() -> Self {
        Self {
            secret: p256::SecretKey::random(&mut OsRng),
        }
    }

    /// DER-encoded public key, base64'd into `clientinitiv`.
    pub fn public_der(&self) -> Result<Vec<u8>, Error> {
        let der = self
            .secret
            .public_key()
            .to_public_key_der()
            .map_err(|e| Error::Crypto(format!("omega DER export: {}", e)))?;
        Ok(der.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curve25519_dalek::constants::ED25519_BASEPOINT_POINT;
    use ed25519_dalek::{Signature, Verifier};

    #[test]
    fn dh_is_commutative() {
        let a = EphemeralKey::from_seed([1u8; 32]);
        let b = EphemeralKey::from_seed([2u8; 32]);

        // a·B == b·A only holds for points in the prime-order group, which
        // both public keys are by construction.
        let ab = a.shared_secret(&b.public_bytes());
        let ba = b.shared_secret(&a.public_bytes());
        assert_eq!(ab, ba);
    }

    #[test]
    fn dh_is_deterministic_for_fixed_seed() {
        let key = EphemeralKey::from_seed([7u8; 32]);
        let peer = ED25519_BASEPOINT_POINT.compress().to_bytes();
        assert_eq!(key.shared_secret(&peer), key.shared_secret(&peer));
    }

    #[test]
    fn invalid_peer_point_falls_back_to_random() {
        let key = EphemeralKey::from_seed([3u8; 32]);
        let s1 = key.shared_secret(&[0xFF; 32]);
        let s2 = key.shared_secret(&[0xFF; 32]);
        // Random fallback: almost surely different between calls.
        assert_ne!(s1, s2);
    }

    #[test]
    fn signatures_verify_under_public_key() {
        let key = EphemeralKey::from_seed([9u8; 32]);
        let message = [0x5Au8; 64];
        let sig = key.sign(&message);

        let verifying = ed25519_dalek::VerifyingKey::from_bytes(&key.public_bytes()).unwrap();
        assert!(verifying
            .verify(&message, &Signature::from_bytes(&sig))
            .is_ok());
    }

    #[test]
    fn omega_exports_spki_der() {
        let omega = OmegaKey::generate();
        let der = omega.public_der().unwrap();
        // SubjectPublicKeyInfo for P-256: SEQUENCE, 91 bytes total.
        assert_eq!(der[0], 0x30);
        assert_eq!(der.len(), 91);
    }
}
