//! 160-bit ring identifiers.
//!
//! Identifiers are SHA-1 digests treated as big-endian integers modulo
//! 2^160. Interval checks wrap around the ring; `(a, a]` denotes the whole
//! ring, which is what makes a single-node ring own every key.

use sha1::{Digest, Sha1};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingId([u8; 20]);

impl RingId {
    /// `MakeKey`: SHA-1 of arbitrary bytes.
    pub fn hash(bytes: &[u8]) -> Self {
        let digest = Sha1::digest(bytes);
        Self(digest.into())
    }

    /// Identifier of a virtual node: SHA-1 of `addr#index`.
    pub fn vnode(addr: &str, index: usize) -> Self {
        Self::hash(format!("{}#{}", addr, index).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(self) -> [u8; 20] {
        self.0
    }

    /// `(self + 2^exp) mod 2^160`, the i-th finger target.
    pub fn add_pow2(self, exp: u8) -> Self {
        debug_assert!(exp < 160);
        let mut out = self.0;
        let mut index = 19 - (exp as usize) / 8;
        let mut carry = 1u16 << (exp % 8);
        loop {
            let sum = out[index] as u16 + carry;
            out[index] = sum as u8;
            carry = sum >> 8;
            if carry == 0 || index == 0 {
                break;
            }
            index -= 1;
        }
        Self(out)
    }

    /// Ring distance `(to - self) mod 2^160`.
    pub fn distance_to(self, to: RingId) -> [u8; 20] {
        let mut out = [0u8; 20];
        let mut borrow = 0i16;
        for i in (0..20).rev() {
            let diff = to.0[i] as i16 - self.0[i] as i16 - borrow;
            if diff < 0 {
                out[i] = (diff + 256) as u8;
                borrow = 1;
            } else {
                out[i] = diff as u8;
                borrow = 0;
            }
        }
        out
    }

    /// Membership in the half-open ring interval `(from, to]`.
    pub fn in_open_closed(self, from: RingId, to: RingId) -> bool {
        if from == to {
            return true;
        }
        if from < to {
            from < self && self <= to
        } else {
            self > from || self <= to
        }
    }

    /// Membership in the open ring interval `(from, to)`.
    pub fn in_open_open(self, from: RingId, to: RingId) -> bool {
        if from == to {
            return self != from;
        }
        if from < to {
            from < self && self < to
        } else {
            self > from || self < to
        }
    }
}

impl std::fmt::Debug for RingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for RingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short prefix is enough to identify a node in logs.
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
