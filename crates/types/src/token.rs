//! Record ID token generation.
//!
//! Record ids are opaque 15-character tokens over the URL-safe alphabet
//! `[A-Za-z0-9_-]` (64 symbols, so 15 characters carry 90 bits of
//! entropy). Ids are globally unique per collection in practice; the
//! engine never retries on collision because the probability is
//! negligible at any realistic record count.

use rand::Rng;

/// URL-safe token alphabet (64 symbols).
const ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Length of a record id.
pub const RECORD_ID_LEN: usize = 15;

/// Generates a random token of `len` characters from the URL-safe alphabet.
pub fn new_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char).collect()
}

/// Generates a new 15-character record id.
pub fn new_record_id() -> String {
    new_token(RECORD_ID_LEN)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_record_id_length_and_alphabet() {
        for _ in 0..100 {
            let id = new_record_id();
            assert_eq!(id.len(), RECORD_ID_LEN);
            assert!(id.bytes().all(|b| ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_ids_do_not_collide_in_practice() {
        let ids: HashSet<String> = (0..10_000).map(|_| new_record_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_custom_length() {
        assert_eq!(new_token(32).len(), 32);
        assert_eq!(new_token(0).len(), 0);
    }
}
