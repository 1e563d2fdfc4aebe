//! EAX mode over AES-128.
//!
//! MAC is OMAC1 (CMAC, NIST SP 800-38B) under the same key, the stream
//! layer is AES-CTR. Per message three OMAC invocations are combined:
//! `tag = OMAC_0(nonce) ^ OMAC_1(header) ^ OMAC_2(ciphertext)`, with
//! `OMAC_0(nonce)` doubling as the initial CTR counter. The protocol
//! truncates the tag to 8 bytes.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use subtle::ConstantTimeEq;

pub const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 16;
/// On-wire tag length after truncation.
pub const MAC_LEN: usize = 8;

/// GF(2^128) doubling with the 0x87 reduction polynomial.
fn dbl(block: &mut [u8; BLOCK_SIZE]) {
    let mut carry = 0u8;
    for byte in block.iter_mut().rev() {
        let next_carry = *byte >> 7;
        *byte = (*byte << 1) | carry;
        carry = next_carry;
    }
    if carry != 0 {
        block[BLOCK_SIZE - 1] ^= 0x87;
    }
}

fn xor_in_place(dst: &mut [u8; BLOCK_SIZE], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// CMAC subkeys K1 (full last block) and K2 (padded last block).
fn subkeys(cipher: &Aes128) -> ([u8; BLOCK_SIZE], [u8; BLOCK_SIZE]) {
    let mut l = [0u8; BLOCK_SIZE];
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut l));
    let mut k1 = l;
    dbl(&mut k1);
    let mut k2 = k1;
    dbl(&mut k2);
    (k1, k2)
}

fn cmac_with_cipher(cipher: &Aes128, data: &[u8]) -> [u8; BLOCK_SIZE] {
    let (k1, k2) = subkeys(cipher);

    let n_blocks = data.len().div_ceil(BLOCK_SIZE).max(1);
    let mut state = [0u8; BLOCK_SIZE];

    for i in 0..n_blocks - 1 {
        xor_in_place(&mut state, &data[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE]);
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut state));
    }

    let rest = &data[(n_blocks - 1) * BLOCK_SIZE..];
    let mut last = [0u8; BLOCK_SIZE];
    if rest.len() == BLOCK_SIZE {
        last.copy_from_slice(rest);
        xor_in_place(&mut last, &k1);
    } else {
        last[..rest.len()].copy_from_slice(rest);
        last[rest.len()] = 0x80;
        xor_in_place(&mut last, &k2);
    }
    xor_in_place(&mut state, &last);
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut state));
    state
}

/// OMAC1 (CMAC) under AES-128.
pub fn cmac(key: &[u8; KEY_SIZE], data: &[u8]) -> [u8; BLOCK_SIZE] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    cmac_with_cipher(&cipher, data)
}

/// EAX's tweaked OMAC: CMAC over a zero block ending in the tweak value,
/// followed by the data.
fn omac_t(cipher: &Aes128, tweak: u8, data: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut message = Vec::with_capacity(BLOCK_SIZE + data.len());
    message.extend_from_slice(&[0u8; BLOCK_SIZE - 1]);
    message.push(tweak);
    message.extend_from_slice(data);
    cmac_with_cipher(cipher, &message)
}

/// AES-CTR keystream application, counter incremented big-endian over the
/// whole block.
fn ctr_xor(cipher: &Aes128, counter: &[u8; BLOCK_SIZE], data: &mut [u8]) {
    let mut ctr = *counter;
    for chunk in data.chunks_mut(BLOCK_SIZE) {
        let mut keystream = ctr;
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut keystream));
        for (d, k) in chunk.iter_mut().zip(keystream.iter()) {
            *d ^= k;
        }
        for byte in ctr.iter_mut().rev() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                break;
            }
        }
    }
}

/// Encrypt and authenticate. Returns the ciphertext and the full 16-byte
/// tag; callers truncate to [`MAC_LEN`] for the wire.
pub fn encrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    header: &[u8],
    plaintext: &[u8],
) -> (Vec<u8>, [u8; BLOCK_SIZE]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));

    let n = omac_t(&cipher, 0, nonce);
    let h = omac_t(&cipher, 1, header);

    let mut ciphertext = plaintext.to_vec();
    ctr_xor(&cipher, &n, &mut ciphertext);

    let c = omac_t(&cipher, 2, &ciphertext);
    let mut tag = n;
    xor_in_place(&mut tag, &h);
    xor_in_place(&mut tag, &c);
    (ciphertext, tag)
}

/// Verify the (possibly truncated) tag and decrypt. A tag mismatch yields
/// `None`; callers drop the packet without further reaction.
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    header: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Option<Vec<u8>> {
    if tag.is_empty() || tag.len() > BLOCK_SIZE {
        return None;
    }
    let cipher = Aes128::new(GenericArray::from_slice(key));

    let n = omac_t(&cipher, 0, nonce);
    let h = omac_t(&cipher, 1, header);
    let c = omac_t(&cipher, 2, ciphertext);
    let mut expected = n;
    xor_in_place(&mut expected, &h);
    xor_in_place(&mut expected, &c);

    if expected[..tag.len()].ct_eq(tag).unwrap_u8() != 1 {
        return None;
    }

    let mut plaintext = ciphertext.to_vec();
    ctr_xor(&cipher, &n, &mut plaintext);
    Some(plaintext)
}
