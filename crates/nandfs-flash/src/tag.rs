//! Per-page spare/tag metadata record.
//!
//! The tag travels in the spare region (placed by the device's data
//! layout table, or by the driver in driver-managed layout mode). Its
//! wire form is 9 bytes with a trailing seal byte; a page whose tag
//! bytes are all 0xFF has never been programmed. Beyond validity and
//! sequencing the fields are opaque to this layer — the index layer
//! interprets parent/serial links.

use nandfs_types::{PageId, ParseError, Serial, ERASED_BYTE};

/// Packed wire size of a tag.
pub const TAG_BYTES: usize = 9;

/// Maximum `data_len` the packed form can carry (11 bits).
pub const TAG_DATA_LEN_MAX: u16 = 0x07FF;

const FLAG_VALID: u8 = 0x01;

/// Logical view of one page's spare metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    /// Page holds committed data.
    pub valid: bool,
    /// Block timestamp/sequence, used by the index layer to order block
    /// generations.
    pub block_ts: u8,
    /// Parent serial link (index-layer meaning).
    pub parent: Serial,
    /// Serial link (index-layer meaning).
    pub serial: Serial,
    /// Logical page number within the logical block.
    pub page_id: PageId,
    /// Bytes of page data in use.
    pub data_len: u16,
}

impl Tag {
    /// Pack into the 9-byte wire form.
    ///
    /// `data_len` above [`TAG_DATA_LEN_MAX`] cannot be represented.
    pub fn pack(&self) -> Result<[u8; TAG_BYTES], ParseError> {
        if self.data_len > TAG_DATA_LEN_MAX {
            return Err(ParseError::InvalidField {
                field: "data_len",
                reason: "exceeds 11-bit packed range",
            });
        }
        let page_id = u8::try_from(self.page_id.0).map_err(|_| ParseError::InvalidField {
            field: "page_id",
            reason: "exceeds one byte",
        })?;

        let mut raw = [0_u8; TAG_BYTES];
        raw[0] = (if self.valid { FLAG_VALID } else { 0 }) | (((self.data_len >> 8) as u8) << 1);
        raw[1] = self.block_ts;
        raw[2..4].copy_from_slice(&self.parent.0.to_le_bytes());
        raw[4..6].copy_from_slice(&self.serial.0.to_le_bytes());
        raw[6] = page_id;
        raw[7] = (self.data_len & 0xFF) as u8;
        raw[8] = seal_of(&raw[..TAG_BYTES - 1]);
        Ok(raw)
    }

    /// Unpack from the wire form.
    ///
    /// Returns `Ok(None)` for an erased (all-0xFF) tag. A seal mismatch
    /// is the spare-metadata-loss case and surfaces as a parse error for
    /// the device layer to classify.
    pub fn unpack(raw: &[u8]) -> Result<Option<Self>, ParseError> {
        if raw.len() < TAG_BYTES {
            return Err(ParseError::InsufficientData {
                needed: TAG_BYTES,
                actual: raw.len(),
            });
        }
        let raw = &raw[..TAG_BYTES];
        if raw.iter().all(|&b| b == ERASED_BYTE) {
            return Ok(None);
        }
        if raw[8] != seal_of(&raw[..TAG_BYTES - 1]) {
            return Err(ParseError::InvalidField {
                field: "seal",
                reason: "tag seal mismatch",
            });
        }

        let data_len = u16::from(raw[7]) | (u16::from((raw[0] >> 1) & 0x07) << 8);
        Ok(Some(Self {
            valid: raw[0] & FLAG_VALID != 0,
            block_ts: raw[1],
            parent: Serial(u16::from_le_bytes([raw[2], raw[3]])),
            serial: Serial(u16::from_le_bytes([raw[4], raw[5]])),
            page_id: PageId(u32::from(raw[6])),
            data_len,
        }))
    }
}

/// Complement of the XOR of the sealed bytes. A packed tag always has
/// raw[0] <= 0x0F, so a sealed tag cannot alias the erased all-0xFF form.
fn seal_of(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0_u8, |acc, &b| acc ^ b)
}
