use blake3::Hasher;
use rand::rngs::OsRng;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

/// Encodes raw bytes into hexadecimal representation.
pub fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter() {
        output.push(nibble(byte >> 4));
        output.push(nibble(byte & 0x0f));
    }
    output
}

/// Generates an opaque identifier from entropy and context.
pub fn generate_id(context: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(context.as_bytes());
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_le_bytes();
    hasher.update(&now);
    let mut entropy = [0u8; 16];
    OsRng.fill_bytes(&mut entropy);
    hasher.update(&entropy);
    encode_hex(&hasher.finalize().as_bytes()[..16])
}

fn nibble(value: u8) -> char {
    match value {
        0..=9 => char::from(b'0' + value),
        10..=15 => char::from(b'a' + (value - 10)),
        _ => '0',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generation_differs() {
        let first = generate_id("message");
        let second = generate_id("message");
        assert_ne!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn hex_encoding() {
        assert_eq!(encode_hex(&[0x00, 0xff, 0x0a]), "00ff0a");
    }
}
