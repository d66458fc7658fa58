//! Random key generation for stored files.

use rand::Rng;

const KEY_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ1234567890";
const KEY_LEN: usize = 10;

/// Produce a 10-character random printable key.
pub fn generate_key() -> String {
    let mut rng = rand::thread_rng();
    (0..KEY_LEN)
        .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_have_fixed_length_and_alphabet() {
        for _ in 0..100 {
            let key = generate_key();
            assert_eq!(key.len(), 10);
            assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn keys_are_not_repeated() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
    }
}
