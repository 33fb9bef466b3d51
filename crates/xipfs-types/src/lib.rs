#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Smallest NVM unit that can be reset to the erase state in one operation.
pub const PAGE_SIZE: usize = 4096;

/// Smallest NVM unit that can be programmed in one operation.
pub const WRITE_BLOCK_SIZE: usize = 4;

/// The byte value every NVM byte takes after an erase. Programming only
/// clears bits.
pub const ERASE_BYTE: u8 = 0xFF;

/// One write block worth of erased bytes, as a native-endian word.
pub const ERASE_WORD: u32 = 0xFFFF_FFFF;

/// Maximum length of a stored path, terminator included.
pub const PATH_MAX: usize = 64;

/// Number of slots in a file record's append-only size history.
pub const FILESIZE_SLOTS: usize = 86;

/// Sentinel validating a mount structure handed in from outside.
pub const XIPFS_MAGIC: u32 = 0xF9D3_B6CB;

/// Capacity of the driver's open-handle table.
pub const MAX_OPEN_FILES: usize = 16;

/// Maximum number of arguments passed to an executable.
pub const EXEC_ARGC_MAX: usize = 64;

/// Index of a flash page within the NVM device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageNumber(pub u32);

impl PageNumber {
    /// Byte offset of the first byte of this page.
    #[must_use]
    pub fn base(self) -> usize {
        self.0 as usize * PAGE_SIZE
    }
}

/// Byte offset of a file record relative to the mount base.
///
/// Records are addressed by offset rather than pointer so that the terminal
/// self-loop is a plain equality test and images stay relocatable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordOffset(pub u32);

impl RecordOffset {
    /// The value an erased `next` field decodes to: no record here.
    pub const ERASED: Self = Self(ERASE_WORD);

    #[must_use]
    pub fn is_erased(self) -> bool {
        self.0 == ERASE_WORD
    }

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u32) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], LayoutError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(LayoutError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(LayoutError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

/// Read a native-endian word; on-NVM fields use the host MCU's endianness.
#[inline]
pub fn read_ne_u32(data: &[u8], offset: usize) -> Result<u32, LayoutError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn write_ne_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), LayoutError> {
    ensure_slice(data, offset, 4)?;
    data[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    Ok(())
}

/// Round `bytes` up to a whole number of pages, never below one page.
#[must_use]
pub fn pages_for(bytes: usize) -> usize {
    if bytes == 0 {
        1
    } else {
        bytes.div_ceil(PAGE_SIZE)
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RecordOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_erased() {
            write!(f, "<erased>")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}
