//! Software ECC for raw NAND pages.
//!
//! SmartMedia-style Hamming code: each 256-byte chunk of page data is
//! protected by 3 ECC bytes (16 line-parity bits over the byte index,
//! 6 column-parity bits over the bit index). The code corrects any single
//! flipped bit per chunk and detects wider damage as uncorrectable.
//!
//! ECC bytes are stored bit-inverted so that a fully erased page (all
//! 0xFF, including its spare) verifies clean without special-casing.
//! Chunks shorter than 256 bytes are treated as padded with 0xFF; erased
//! bytes contribute no parity, so the padding needs no materialization.

use thiserror::Error;

/// Bytes of page data covered by one ECC unit.
pub const ECC_CHUNK: usize = 256;

/// ECC bytes produced per chunk.
pub const ECC_BYTES_PER_CHUNK: usize = 3;

/// ECC verification failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EccError {
    /// More flipped bits than the code can repair.
    #[error("flip bits beyond ECC correction capability")]
    Uncorrectable,

    /// Stored ECC length does not match the data length.
    #[error("ECC length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Stored ECC size for `data_len` bytes of page data.
#[must_use]
pub fn ecc_size(data_len: usize) -> usize {
    data_len.div_ceil(ECC_CHUNK) * ECC_BYTES_PER_CHUNK
}

fn chunk_ecc(chunk: &[u8]) -> [u8; ECC_BYTES_PER_CHUNK] {
    debug_assert!(chunk.len() <= ECC_CHUNK);
    let mut lp: u16 = 0;
    let mut cp: u8 = 0;
    for (i, &b) in chunk.iter().enumerate() {
        if b.count_ones() & 1 == 1 {
            for k in 0..8 {
                lp ^= 1 << (2 * k + ((i >> k) & 1));
            }
        }
        for j in 0..8 {
            if (b >> j) & 1 == 1 {
                for k in 0..3 {
                    cp ^= 1 << (2 * k + ((j >> k) & 1));
                }
            }
        }
    }
    // Inverted storage form; the two unused bits of the third byte end
    // up clear so an erased spare still compares clean under the mask.
    [
        !(lp & 0xFF) as u8,
        !(lp >> 8) as u8,
        !((cp << 2) | 0x03),
    ]
}

/// Compute the stored-form ECC for a full page of data.
#[must_use]
pub fn ecc_compute(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ecc_size(data.len()));
    for chunk in data.chunks(ECC_CHUNK) {
        out.extend_from_slice(&chunk_ecc(chunk));
    }
    out
}

fn correct_chunk(
    chunk: &mut [u8],
    stored: &[u8],
    computed: &[u8; ECC_BYTES_PER_CHUNK],
) -> Result<u32, EccError> {
    let d0 = stored[0] ^ computed[0];
    let d1 = stored[1] ^ computed[1];
    let d2 = (stored[2] ^ computed[2]) & 0xFC;
    if d0 == 0 && d1 == 0 && d2 == 0 {
        return Ok(0);
    }

    // A single flipped data bit leaves exactly one bit set in every
    // parity pair; the odd members spell out the byte and bit address.
    let line_pairs_ok = ((d0 ^ (d0 >> 1)) & 0x55) == 0x55 && ((d1 ^ (d1 >> 1)) & 0x55) == 0x55;
    let col_pairs_ok = ((d2 ^ (d2 >> 1)) & 0x54) == 0x54;
    if line_pairs_ok && col_pairs_ok {
        let mut byte = 0_usize;
        for k in 0..4 {
            byte |= usize::from((d0 >> (2 * k + 1)) & 1) << k;
        }
        for k in 0..4 {
            byte |= usize::from((d1 >> (2 * k + 1)) & 1) << (k + 4);
        }
        let mut bit = 0_u32;
        for k in 0..3 {
            bit |= u32::from((d2 >> (2 * k + 3)) & 1) << k;
        }
        if byte >= chunk.len() {
            // Address lands in the 0xFF padding tail, which cannot flip.
            return Err(EccError::Uncorrectable);
        }
        chunk[byte] ^= 1 << bit;
        return Ok(1);
    }

    // Exactly one differing bit means the stored ECC itself flipped; the
    // data is intact.
    if u32::from(d0.count_ones() + d1.count_ones() + d2.count_ones()) == 1 {
        return Ok(1);
    }

    Err(EccError::Uncorrectable)
}

/// Verify `data` against its stored-form ECC, repairing in place.
///
/// Returns the number of bits corrected (0 for a clean read).
pub fn ecc_correct(data: &mut [u8], stored: &[u8]) -> Result<u32, EccError> {
    let expected = ecc_size(data.len());
    if stored.len() != expected {
        return Err(EccError::LengthMismatch {
            expected,
            actual: stored.len(),
        });
    }

    let mut corrected = 0_u32;
    for (idx, chunk) in data.chunks_mut(ECC_CHUNK).enumerate() {
        let computed = chunk_ecc(chunk);
        let stored_chunk = &stored[idx * ECC_BYTES_PER_CHUNK..(idx + 1) * ECC_BYTES_PER_CHUNK];
        corrected += correct_chunk(chunk, stored_chunk, &computed)?;
    }
    Ok(corrected)
}
