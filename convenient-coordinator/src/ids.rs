//! Task id generation
//!
//! Ids are a process-wide sequence rendered as unpadded RFC 4648 base32 of
//! the big-endian 64-bit value, so they sort lexicographically in issue order.

use crate::model::BuildTaskId;
use std::sync::atomic::{AtomicU64, Ordering};

const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Encode a value as 13 base32 characters.
pub fn encode_base32(value: u64) -> String {
    let bytes = value.to_be_bytes();
    let mut out = String::with_capacity(13);
    let mut buffer: u32 = 0;
    let mut bits = 0;

    for byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(char::from(ALPHABET[((buffer >> bits) & 0x1f) as usize]));
        }
    }
    if bits > 0 {
        out.push(char::from(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize]));
    }
    out
}

/// Monotonic task id source
#[derive(Debug)]
pub struct TaskIdSequence {
    next: AtomicU64,
}

impl TaskIdSequence {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> BuildTaskId {
        BuildTaskId::new(encode_base32(self.next.fetch_add(1, Ordering::Relaxed)))
    }
}

impl Default for TaskIdSequence {
    fn default() -> Self {
        Self::starting_at(1)
    }
}
