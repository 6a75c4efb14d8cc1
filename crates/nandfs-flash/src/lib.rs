#![forbid(unsafe_code)]
//! Flash driver contract and on-flash policy for nandfs.
//!
//! This crate defines the boundary between the filesystem and a physical
//! (or simulated) flash driver:
//!
//! - [`FlashOps`]: the operation set a driver implements, with
//!   [`IoError`]-based per-call outcomes.
//! - [`StorageAttr`]: immutable chip geometry plus the spare-area layout
//!   tables, validated once at mount.
//! - [`EccMode`] × [`LayoutMode`]: who computes ECC and who owns the
//!   physical packing of the spare region.
//! - Software ECC ([`ecc_compute`], [`ecc_correct`]) for drivers without
//!   hardware correction.
//! - [`Tag`]: the packed per-page spare metadata record.

pub mod attr;
pub mod ecc;
pub mod ops;
pub mod tag;

pub use attr::{EccMode, Layout, LayoutMode, StorageAttr};
pub use ecc::{ecc_compute, ecc_correct, ecc_size, EccError, ECC_BYTES_PER_CHUNK, ECC_CHUNK};
pub use ops::{FlashOps, IoError, IoResult, OpsCaps};
pub use tag::{Tag, TAG_BYTES};
