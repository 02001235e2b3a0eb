//! Payload masking per [RFC 6455 Section 5.3](https://datatracker.ietf.org/doc/html/rfc6455#section-5.3).
//!
//! Masking XORs payload byte `i` with `key[i % 4]`. The transform is an
//! involution: applying it twice with the same key restores the input, so a
//! single routine serves both masking and unmasking.

/// Mask or unmask `buf` in place with a 4-byte key.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    // Process whole 4-byte blocks as u32 XORs, then finish the tail
    // byte-by-byte. The key is byte-aligned with the buffer start, so no
    // rotation is needed.
    let mask_u32 = u32::from_ne_bytes(mask);

    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in chunks.by_ref() {
        let word = u32::from_ne_bytes(chunk.try_into().expect("4-byte chunk"));
        chunk.copy_from_slice(&(word ^ mask_u32).to_ne_bytes());
    }
    for (byte, key) in chunks.into_remainder().iter_mut().zip(mask.iter()) {
        *byte ^= key;
    }
}
