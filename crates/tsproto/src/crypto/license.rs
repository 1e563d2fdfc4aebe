//! Server key derivation from the license chain.
//!
//! The license blob is a version byte followed by up to 8 blocks. Each
//! block contributes `k·Q` to a running Ed25519 point that starts at the
//! fixed root key, where `Q` is the block's embedded public key and `k`
//! a scalar hashed from the block body. The final compressed point is the
//! server's long-term public key for this session.

use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::{EdwardsPoint, Scalar};
use sha2::{Digest, Sha512};

use crate::types::Error;

use super::clamp_scalar_bytes;

/// Root of the license chain; every derivation starts from this point.
pub const ROOT_KEY: [u8; 32] = [
    0xcd, 0x0d, 0xe2, 0xae, 0xd4, 0x63, 0x45, 0x50, 0x9a, 0x7e, 0x3c, 0xfd, 0x8f, 0x68, 0xb3,
    0xdc, 0x75, 0x55, 0xb2, 0x9d, 0xcc, 0xec, 0x73, 0xcd, 0x18, 0x75, 0x0f, 0x99, 0x38, 0x12,
    0x40, 0x8a,
];

const MAX_BLOCKS: usize = 8;
const KEY_SIZE: usize = 32;
const TYPE_OFFSET: usize = 33;
/// Fixed-size blocks (type 32) span exactly this many bytes.
const FIXED_BLOCK_SIZE: usize = 42;

/// Derive the server's Ed25519 public key from a license blob.
pub fn derive_server_key(license: &[u8]) -> Result<[u8; 32], Error> {
    if license.is_empty() {
        return Err(Error::Protocol("empty license".into()));
    }

    let mut point = CompressedEdwardsY(ROOT_KEY)
        .decompress()
        .ok_or_else(|| Error::Crypto("license root key is not a curve point".into()))?;

    let mut rest = &license[1..];
    let mut blocks = 0;
    while !rest.is_empty() && blocks < MAX_BLOCKS {
        let (block, advance) = next_block(rest)?;
        rest = &rest[advance..];
        blocks += 1;

        let scalar = block_scalar(&block.body);
        match CompressedEdwardsY(block.public_key).decompress() {
            Some(q) => point += block_term(&scalar, &q),
            None => {
                tracing::debug!("license block {} public key not on curve, skipped", blocks);
            }
        }
    }

    Ok(point.compress().to_bytes())
}

struct Block<'a> {
    public_key: [u8; 32],
    /// Everything after the public key, hashed into the block scalar.
    body: &'a [u8],
}

fn next_block(data: &[u8]) -> Result<(Block<'_>, usize), Error> {
    if data.len() <= TYPE_OFFSET {
        return Err(Error::Protocol("truncated license block".into()));
    }
    let block_type = data[TYPE_OFFSET];
    let end = if block_type == 32 {
        if data.len() < FIXED_BLOCK_SIZE {
            return Err(Error::Protocol("truncated license block".into()));
        }
        FIXED_BLOCK_SIZE
    } else {
        // Variable-size blocks run to their NUL terminator, inclusive.
        data[TYPE_OFFSET + 1..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| TYPE_OFFSET + 1 + p + 1)
            .ok_or_else(|| Error::Protocol("license block missing terminator".into()))?
    };

    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&data[..KEY_SIZE]);
    Ok((
        Block {
            public_key,
            body: &data[KEY_SIZE..end],
        },
        end,
    ))
}

fn block_scalar(body: &[u8]) -> Scalar {
    let hash: [u8; 64] = Sha512::digest(body).into();
    let mut scalar_bytes: [u8; 32] = hash[..32].try_into().unwrap();
    clamp_scalar_bytes(&mut scalar_bytes);
    let scalar = Scalar::from_bytes_mod_order(scalar_bytes);
    if scalar == Scalar::ZERO {
        Scalar::ONE
    } else {
        scalar
    }
}

fn block_term(k: &Scalar, q: &EdwardsPoint) -> EdwardsPoint {
    k * q
}

#[cfg(test)]
mod tests {
    use super::*;
    use curve25519_dalek::constants::ED25519_BASEPOINT_POINT;

    /// Build a type-32 block: key, one filler byte, the type tag, then
    /// padding up to the fixed 42-byte size.
    fn fixed_block(public_key: &[u8; 32], fill: u8) -> Vec<u8> {
        let mut block = public_key.to_vec();
        block.push(fill); // offset 32
        block.push(32); // type tag at offset 33
        block.extend_from_slice(&[fill; FIXED_BLOCK_SIZE - 34]);
        block
    }

    fn expected_term(block: &[u8]) -> EdwardsPoint {
        block_scalar(&block[32..]) * ED25519_BASEPOINT_POINT
    }

    #[test]
    fn single_block_chain() {
        let basepoint = ED25519_BASEPOINT_POINT.compress().to_bytes();
        let block = fixed_block(&basepoint, 0x11);
        let mut license = vec![0x01];
        license.extend_from_slice(&block);

        let derived = derive_server_key(&license).unwrap();
        let expected =
            (CompressedEdwardsY(ROOT_KEY).decompress().unwrap() + expected_term(&block))
                .compress()
                .to_bytes();
        assert_eq!(derived, expected);
    }

    #[test]
    fn two_block_chain_accumulates() {
        let basepoint = ED25519_BASEPOINT_POINT.compress().to_bytes();
        let block_a = fixed_block(&basepoint, 0x11);
        let block_b = fixed_block(&basepoint, 0x22);
        let mut license = vec![0x01];
        license.extend_from_slice(&block_a);
        license.extend_from_slice(&block_b);

        let derived = derive_server_key(&license).unwrap();
        let expected = (CompressedEdwardsY(ROOT_KEY).decompress().unwrap()
            + expected_term(&block_a)
            + expected_term(&block_b))
        .compress()
        .to_bytes();
        assert_eq!(derived, expected);
    }

    #[test]
    fn variable_block_runs_to_nul() {
        let basepoint = ED25519_BASEPOINT_POINT.compress().to_bytes();
        let mut block = basepoint.to_vec();
        block.push(0x00); // filler
        block.push(2); // variable-size type
        block.extend_from_slice(b"issuer string");
        block.push(0);

        let mut license = vec![0x01];
        license.extend_from_slice(&block);
        let derived = derive_server_key(&license).unwrap();

        let expected = (CompressedEdwardsY(ROOT_KEY).decompress().unwrap()
            + block_scalar(&block[32..]) * ED25519_BASEPOINT_POINT)
            .compress()
            .to_bytes();
        assert_eq!(derived, expected);
    }

    #[test]
    fn invalid_block_key_is_skipped() {
        // All-0xFF is not a valid compressed point.
        let block = fixed_block(&[0xFF; 32], 0x33);
        let mut license = vec![0x01];
        license.extend_from_slice(&block);

        let derived = derive_server_key(&license).unwrap();
        assert_eq!(derived, ROOT_KEY);
    }

    #[test]
    fn truncated_block_is_an_error() {
        let mut license = vec![0x01];
        license.extend_from_slice(&[0u8; 20]);
        assert!(derive_server_key(&license).is_err());

        assert!(derive_server_key(&[]).is_err());
    }

    #[test]
    fn missing_terminator_is_an_error() {
        let basepoint = ED25519_BASEPOINT_POINT.compress().to_bytes();
        let mut block = basepoint.to_vec();
        block.push(0x01);
        block.push(2);
        block.extend_from_slice(b"no terminator here");
        let mut license = vec![0x01];
        license.extend_from_slice(&block);
        assert!(derive_server_key(&license).is_err());
    }
}
