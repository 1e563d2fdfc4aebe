//! The connection puzzle: repeated modular squaring.
//!
//! The server hands out 512-bit `x` and `n` and a squaring count; the
//! client answers `y = x^(2^level) mod n`. All values are unsigned
//! big-endian. Arithmetic is fixed-width (8 × u64 limbs, little-endian
//! limb order) with a widening schoolbook square and a shift-subtract
//! reduction, so no bignum allocation happens on the hot path.

use crate::types::Error;

/// Refuse puzzles above this squaring count; a hostile server could
/// otherwise pin a core for hours.
pub const LEVEL_CAP: u32 = 10_000_000;

const LIMBS: usize = 8;

type U512 = [u64; LIMBS];
type U1024 = [u64; LIMBS * 2];

fn from_be_bytes(bytes: &[u8; 64]) -> U512 {
    let mut out = [0u64; LIMBS];
    for (i, chunk) in bytes.chunks_exact(8).enumerate() {
        out[LIMBS - 1 - i] = u64::from_be_bytes(chunk.try_into().unwrap());
    }
    out
}

fn to_be_bytes(limbs: &U512) -> [u8; 64] {
    let mut out = [0u8; 64];
    for i in 0..LIMBS {
        out[i * 8..(i + 1) * 8].copy_from_slice(&limbs[LIMBS - 1 - i].to_be_bytes());
    }
    out
}

fn is_zero(limbs: &U512) -> bool {
    limbs.iter().all(|&l| l == 0)
}

fn is_one(limbs: &U512) -> bool {
    limbs[0] == 1 && limbs[1..].iter().all(|&l| l == 0)
}

/// Schoolbook multiply into a double-width result.
fn mul(a: &U512, b: &U512) -> U1024 {
    let mut out = [0u64; LIMBS * 2];
    for i in 0..LIMBS {
        let mut carry: u128 = 0;
        for j in 0..LIMBS {
            let cur = out[i + j] as u128 + (a[i] as u128) * (b[j] as u128) + carry;
            out[i + j] = cur as u64;
            carry = cur >> 64;
        }
        out[i + LIMBS] = carry as u64;
    }
    out
}

// The remainder needs one limb of headroom for the shift-before-compare.
type Rem = [u64; LIMBS + 1];

fn rem_shl1(r: &mut Rem) {
    let mut carry = 0u64;
    for limb in r.iter_mut() {
        let next = *limb >> 63;
        *limb = (*limb << 1) | carry;
        carry = next;
    }
}

fn rem_geq(r: &Rem, n: &U512) -> bool {
    if r[LIMBS] != 0 {
        return true;
    }
    for i in (0..LIMBS).rev() {
        if r[i] != n[i] {
            return r[i] > n[i];
        }
    }
    true
}

fn rem_sub(r: &mut Rem, n: &U512) {
    let mut borrow = 0u64;
    for i in 0..LIMBS {
        let (d1, b1) = r[i].overflowing_sub(n[i]);
        let (d2, b2) = d1.overflowing_sub(borrow);
        r[i] = d2;
        borrow = (b1 | b2) as u64;
    }
    r[LIMBS] = r[LIMBS].wrapping_sub(borrow);
}

/// Reduce a double-width value mod `n` by binary long division.
fn reduce(value: &U1024, n: &U512) -> U512 {
    let mut rem: Rem = [0u64; LIMBS + 1];
    for bit in (0..LIMBS * 2 * 64).rev() {
        rem_shl1(&mut rem);
        rem[0] |= (value[bit / 64] >> (bit % 64)) & 1;
        if rem_geq(&rem, n) {
            rem_sub(&mut rem, n);
        }
    }
    rem[..LIMBS].try_into().unwrap()
}

fn widen(value: &U512) -> U1024 {
    let mut out = [0u64; LIMBS * 2];
    out[..LIMBS].copy_from_slice(value);
    out
}

/// Compute `y = x^(2^level) mod n`.
///
/// Rejects `level` above [`LEVEL_CAP`] and a modulus of 0 or 1 without
/// doing any work.
pub fn solve(x: &[u8; 64], n: &[u8; 64], level: u32) -> Result<[u8; 64], Error> {
    if level > LEVEL_CAP {
        return Err(Error::Protocol(format!(
            "puzzle level {} exceeds cap {}",
            level, LEVEL_CAP
        )));
    }
    let n = from_be_bytes(n);
    if is_zero(&n) || is_one(&n) {
        return Err(Error::Protocol("puzzle modulus not invertible".into()));
    }

    let mut y = reduce(&widen(&from_be_bytes(x)), &n);
    for _ in 0..level {
        y = reduce(&mul(&y, &y), &n);
    }
    Ok(to_be_bytes(&y))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes64_from_u128(v: u128) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[48..].copy_from_slice(&v.to_be_bytes());
        out
    }

    fn u128_from_bytes64(bytes: &[u8; 64]) -> u128 {
        assert!(bytes[..48].iter().all(|&b| b == 0));
        u128::from_be_bytes(bytes[48..].try_into().unwrap())
    }

    /// Reference computation for moduli small enough to square in u128.
    fn reference(x: u64, n: u64, level: u32) -> u128 {
        let n = n as u128;
        let mut y = (x as u128) % n;
        for _ in 0..level {
            y = (y * y) % n;
        }
        y
    }

    #[test]
    fn matches_reference_small() {
        for (x, n, level) in [
            (7u64, 11u64, 5u32),
            (2, 0xFFFF_FFFB, 64),
            (123_456_789, 987_654_321, 100),
            (0xDEAD_BEEF, 0x1_0000_0001 >> 1, 17),
        ] {
            let y = solve(
                &bytes64_from_u128(x as u128),
                &bytes64_from_u128(n as u128),
                level,
            )
            .unwrap();
            assert_eq!(u128_from_bytes64(&y), reference(x, n, level), "x={} n={}", x, n);
        }
    }

    #[test]
    fn level_zero_reduces_only() {
        let y = solve(&bytes64_from_u128(100), &bytes64_from_u128(7), 0).unwrap();
        assert_eq!(u128_from_bytes64(&y), 100 % 7);
    }

    #[test]
    fn full_width_n_minus_one_squares_to_one() {
        // (n-1)^2 = n^2 - 2n + 1 ≡ 1 (mod n), for any odd 512-bit n.
        let mut n = [0xA5u8; 64];
        n[63] |= 1;
        let mut x = n;
        x[63] -= 1; // n is odd, so no borrow
        let y = solve(&x, &n, 1).unwrap();
        let mut one = [0u8; 64];
        one[63] = 1;
        assert_eq!(y, one);
    }

    #[test]
    fn rejects_level_over_cap() {
        let x = bytes64_from_u128(2);
        let n = bytes64_from_u128(13);
        assert!(matches!(
            solve(&x, &n, LEVEL_CAP + 1),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn rejects_degenerate_modulus() {
        let x = bytes64_from_u128(2);
        assert!(solve(&x, &bytes64_from_u128(0), 1).is_err());
        assert!(solve(&x, &bytes64_from_u128(1), 1).is_err());
    }
}
