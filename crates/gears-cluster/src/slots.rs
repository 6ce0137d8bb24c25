//! Hash slot mapping

/// Number of hash slots the keyspace is divided into
pub const SLOT_COUNT: u16 = 16384;

/// CRC16-XMODEM as used for cluster key hashing
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Hash slot of a key
///
/// When the key contains a non-empty `{...}` section only that section is
/// hashed, so related keys can be forced onto the same shard.
pub fn key_hash_slot(key: &str) -> u16 {
    let bytes = key.as_bytes();
    let hashed = match bytes.iter().position(|&b| b == b'{') {
        Some(open) => match bytes[open + 1..].iter().position(|&b| b == b'}') {
            Some(len) if len > 0 => &bytes[open + 1..open + 1 + len],
            _ => bytes,
        },
        None => bytes,
    };
    crc16(hashed) & (SLOT_COUNT - 1)
}
