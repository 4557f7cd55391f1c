//! Firmware image formats.

pub mod itl;

pub use itl::{FirmwareImage, ImageInfo, Variant};
