//! ITL firmware image format.
//!
//! ITL validator firmware files start with a fixed 128-byte header followed
//! by the RAM-stage bootstrap and the main firmware payload.
//!
//! ## Layout
//!
//! ```text
//! +-----------------+---------------------+----------------------+
//! |  Header (128B)  | RAM stage (ram_size)|  Main stage (rest)   |
//! +-----------------+---------------------+----------------------+
//!
//! Header fields:
//!   [0..3)    "ITL" tag
//!   [5]       device variant (0x09 = NV9, 0x0A = NV10)
//!   [6]       main-stage handshake byte
//!   [7..11)   RAM stage size, big-endian u32
//!   [68..72)  baud rate override, big-endian u32 (0 = default)
//! ```

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use log::debug;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Size of the image header block.
pub const HEADER_SIZE: usize = 128;

/// Tag expected at the start of every image.
pub const IMAGE_TAG: [u8; 3] = *b"ITL";

/// Offset of the device variant byte.
pub const VARIANT_OFFSET: usize = 5;

/// Offset of the main-stage handshake byte.
pub const HANDSHAKE_OFFSET: usize = 6;

/// Offset of the big-endian RAM stage size.
pub const RAM_SIZE_OFFSET: usize = 7;

/// Offset of the big-endian baud rate override.
pub const BAUD_OFFSET: usize = 68;

/// Transfer baud rate used when the image does not override it.
pub const DEFAULT_TRANSFER_BAUD: u32 = 38400;

/// Device variant encoded in header byte 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Variant {
    /// NV9 (tag 0x09).
    Nv9,
    /// NV10 (tag 0x0A).
    Nv10,
    /// Any other device; honours the baud override field.
    Other(u8),
}

impl From<u8> for Variant {
    fn from(value: u8) -> Self {
        match value {
            0x09 => Self::Nv9,
            0x0A => Self::Nv10,
            v => Self::Other(v),
        }
    }
}

impl Variant {
    /// Raw tag byte.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Nv9 => 0x09,
            Self::Nv10 => 0x0A,
            Self::Other(v) => v,
        }
    }

    /// NV9 and NV10 always transfer at the default baud rate.
    pub fn uses_fixed_baud(self) -> bool {
        matches!(self, Self::Nv9 | Self::Nv10)
    }
}

/// Fields extracted from an image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ImageInfo {
    /// Device variant.
    pub variant: Variant,
    /// RAM stage size in bytes.
    pub ram_stage_size: u32,
    /// Baud rate override (0 = use default).
    pub override_baud: u32,
}

impl ImageInfo {
    /// Baud rate to use for the RAM and main stage transfers.
    pub fn resolve_baud(&self) -> u32 {
        if self.variant.uses_fixed_baud() || self.override_baud == 0 {
            DEFAULT_TRANSFER_BAUD
        } else {
            self.override_baud
        }
    }
}

/// Read the RAM stage size straight from raw header bytes.
///
/// Returns `None` if `header` is too short to hold the field.
pub fn ram_stage_size_from_header(header: &[u8]) -> Option<u32> {
    header
        .get(RAM_SIZE_OFFSET..RAM_SIZE_OFFSET + 4)
        .map(BigEndian::read_u32)
}

/// Parse the header fields of a raw image.
///
/// Does not validate that the declared sizes fit the buffer; use
/// [`FirmwareImage::from_bytes`] for that.
pub fn parse_header(data: &[u8]) -> Result<ImageInfo> {
    if data.len() < HEADER_SIZE {
        return Err(Error::InvalidFileType(format!(
            "image too small for header ({} < {HEADER_SIZE} bytes)",
            data.len()
        )));
    }

    if data[..IMAGE_TAG.len()] != IMAGE_TAG {
        return Err(Error::InvalidFileType(format!(
            "bad tag {:02X?}, expected \"ITL\"",
            &data[..IMAGE_TAG.len()]
        )));
    }

    let variant = Variant::from(data[VARIANT_OFFSET]);
    let ram_stage_size = BigEndian::read_u32(&data[RAM_SIZE_OFFSET..RAM_SIZE_OFFSET + 4]);
    let override_baud = BigEndian::read_u32(&data[BAUD_OFFSET..BAUD_OFFSET + 4]);

    Ok(ImageInfo {
        variant,
        ram_stage_size,
        override_baud,
    })
}

/// A validated firmware image.
pub struct FirmwareImage {
    info: ImageInfo,
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Load an image from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading firmware from: {}", path.display());

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound(path.to_path_buf()));
            },
            Err(e) => {
                return Err(Error::FileError(format!(
                    "cannot open {}: {e}",
                    path.display()
                )));
            },
        };

        let expected = file
            .metadata()
            .map_err(|e| Error::FileError(format!("cannot stat {}: {e}", path.display())))?
            .len();

        let mut data = Vec::new();
        BufReader::new(file)
            .read_to_end(&mut data)
            .map_err(|e| Error::FileError(format!("cannot read {}: {e}", path.display())))?;

        if data.len() as u64 != expected {
            return Err(Error::FileError(format!(
                "short read on {}: {} of {expected} bytes",
                path.display(),
                data.len()
            )));
        }

        Self::from_bytes(data)
    }

    /// Validate raw image bytes.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let info = parse_header(&data)?;

        let main_start = HEADER_SIZE
            .checked_add(info.ram_stage_size as usize)
            .filter(|&start| start < data.len())
            .ok_or_else(|| {
                Error::InvalidFileType(format!(
                    "RAM stage of {} bytes leaves no main stage in a {}-byte image",
                    info.ram_stage_size,
                    data.len()
                ))
            })?;

        debug!(
            "Image {:?}: {} bytes, RAM stage {} bytes, main stage {} bytes, baud override {}",
            info.variant,
            data.len(),
            info.ram_stage_size,
            data.len() - main_start,
            info.override_baud
        );

        Ok(Self { info, data })
    }

    /// Parsed header fields.
    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    /// Whole image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Total image length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false for a validated image.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The 128-byte header block.
    pub fn header(&self) -> &[u8] {
        &self.data[..HEADER_SIZE]
    }

    /// Byte sent as the first main-stage handshake step.
    pub fn handshake_byte(&self) -> u8 {
        self.data[HANDSHAKE_OFFSET]
    }

    /// Offset of the first main-stage byte.
    pub fn main_stage_offset(&self) -> usize {
        HEADER_SIZE + self.info.ram_stage_size as usize
    }

    /// RAM stage payload.
    pub fn ram_stage(&self) -> &[u8] {
        &self.data[HEADER_SIZE..self.main_stage_offset()]
    }

    /// Main stage payload.
    pub fn main_stage(&self) -> &[u8] {
        &self.data[self.main_stage_offset()..]
    }

    /// Bounds-checked slice of the image.
    pub fn span(&self, offset: usize, len: usize) -> Result<&[u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or_else(|| {
                Error::InvalidFileType(format!(
                    "span {offset}+{len} out of bounds (image size {})",
                    self.data.len()
                ))
            })
    }
}

impl std::fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("info", &self.info)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Build a synthetic image for tests.
#[cfg(test)]
pub(crate) fn test_image(variant: u8, ram_size: u32, main_size: usize, baud: u32) -> Vec<u8> {
    let mut data = vec![0u8; HEADER_SIZE];
    data[..3].copy_from_slice(&IMAGE_TAG);
    data[VARIANT_OFFSET] = variant;
    data[HANDSHAKE_OFFSET] = 0x5A;
    BigEndian::write_u32(&mut data[RAM_SIZE_OFFSET..RAM_SIZE_OFFSET + 4], ram_size);
    BigEndian::write_u32(&mut data[BAUD_OFFSET..BAUD_OFFSET + 4], baud);
    for i in 0..ram_size as usize + main_size {
        #[allow(clippy::cast_possible_truncation)]
        data.push((i * 7 + 3) as u8);
    }
    data
}
