//! Task identifier generation.
//!
//! Identifiers are the store's primary key, so they come from the OS CSPRNG
//! and are sampled without modulo bias: bytes at or above the largest
//! multiple of the alphabet size are re-drawn, which keeps every symbol
//! equally likely. Uniqueness against existing rows is the caller's job
//! (`plugins::tasks::unique_task_id` regenerates on collision).

use rand::RngCore;
use rand::rngs::OsRng;

pub const TASK_ID_LEN: usize = 8;

const ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";
// Largest multiple of 36 that fits in a byte.
const REJECTION_BOUND: u8 = 252;

/// Produce one fixed-length lowercase alphanumeric identifier.
pub fn random_task_id() -> String {
    let mut out = String::with_capacity(TASK_ID_LEN);
    let mut buf = [0u8; 32];
    while out.len() < TASK_ID_LEN {
        OsRng.fill_bytes(&mut buf);
        for byte in buf {
            if byte >= REJECTION_BOUND {
                continue;
            }
            out.push(ALPHABET[(byte % 36) as usize] as char);
            if out.len() == TASK_ID_LEN {
                break;
            }
        }
    }
    out
}

/// True when `s` could be a task id or a prefix of one. Gate on this before
/// interpolating user input into a LIKE pattern.
pub fn is_valid_id_prefix(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= TASK_ID_LEN
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}
