//! Frame masking: XOR arithmetic and key generation

/// Apply a WebSocket mask in place
///
/// XORs the data with the repeating 4-byte key. Masking is an involution,
/// so the same call both masks and unmasks. Processes eight bytes per
/// iteration by widening the key to a u64.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    if data.is_empty() {
        return;
    }

    let mask_u64 = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let word = u64::from_ne_bytes(chunk.try_into().unwrap()) ^ mask_u64;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }

    let offset = data.len() & !7;
    for (i, byte) in data[offset..].iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Generate a random 4-byte mask key for an outgoing frame
#[inline]
pub fn generate_mask() -> [u8; 4] {
    fastrand::u32(..).to_ne_bytes()
}
