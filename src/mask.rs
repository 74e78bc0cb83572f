//! WebSocket frame masking
//!
//! The XOR transform is its own inverse, so the same routines mask outbound
//! client frames and unmask frames in the parser. Keys come from `fastrand`
//! unless the `secure-mask` feature asks for the OS CSPRNG via `getrandom`.

/// XOR `data` with the repeating 4-byte `mask`
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
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ mask_u64;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    // 8 is a multiple of 4, so the tail starts at key index 0
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Apply `mask` to a slice that starts `offset` bytes into the payload
///
/// Lets a payload that arrives in several reads be unmasked piecewise.
#[inline]
pub fn apply_mask_offset(data: &mut [u8], mask: [u8; 4], offset: usize) {
    let offset = offset & 3;
    if offset == 0 {
        apply_mask(data, mask);
        return;
    }

    let rotated_mask = [
        mask[offset],
        mask[(offset + 1) & 3],
        mask[(offset + 2) & 3],
        mask[(offset + 3) & 3],
    ];
    apply_mask(data, rotated_mask);
}

/// Generate a fresh masking key for one client frame
#[inline]
pub fn generate_mask() -> [u8; 4] {
    generate_mask_inner()
}

#[cfg(feature = "secure-mask")]
#[inline]
fn generate_mask_inner() -> [u8; 4] {
    let mut buf = [0u8; 4];
    match getrandom::getrandom(&mut buf) {
        Ok(()) => buf,
        Err(e) => {
            tracing::warn!(error = %e, "OS random source failed, masking with fastrand");
            fastrand::u32(..).to_ne_bytes()
        }
    }
}

#[cfg(not(feature = "secure-mask"))]
#[inline]
fn generate_mask_inner() -> [u8; 4] {
    fastrand::u32(..).to_ne_bytes()
}
