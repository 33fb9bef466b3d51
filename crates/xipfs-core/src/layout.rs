//! On-NVM file record layout.
//!
//! A record sits at the start of its page-aligned run. All multi-byte
//! fields are stored in the host's native endianness.
//!
//! ```text
//! +-- run start (page aligned) ------------------------------+
//! | next      u32    offset of the next record, mount-relative|
//! | path      [u8; 64]  NUL-terminated full path              |
//! | reserved  u32    bytes reserved, multiple of PAGE_SIZE    |
//! | size      [u32; 86] append-only size history              |
//! | exec      u32    0 = data, 1 = executable                 |
//! | payload   ...    up to reserved - 420 bytes               |
//! +-----------------------------------------------------------+
//! ```

use xipfs_error::{Result, XipfsError};
use xipfs_types::{ERASE_BYTE, FILESIZE_SLOTS, PATH_MAX, RecordOffset, write_ne_u32};

pub const NEXT_OFFSET: usize = 0;
pub const PATH_OFFSET: usize = 4;
pub const RESERVED_OFFSET: usize = PATH_OFFSET + PATH_MAX;
pub const SIZE_OFFSET: usize = RESERVED_OFFSET + 4;
pub const EXEC_OFFSET: usize = SIZE_OFFSET + 4 * FILESIZE_SLOTS;

/// Size of the record header; the payload begins right after it.
pub const HEADER_SIZE: usize = EXEC_OFFSET + 4;

/// A fully materialized record header, as staged for a new file.
///
/// The size history is not part of this type: a freshly written header
/// leaves every size slot in the erase state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub next: RecordOffset,
    pub path: [u8; PATH_MAX],
    pub reserved: u32,
    pub exec: u32,
}

impl RecordHeader {
    /// Build a header for `path`. Fails if the path does not fit the
    /// fixed-capacity field with its terminator.
    pub fn new(next: RecordOffset, path: &str, reserved: u32, exec: u32) -> Result<Self> {
        let bytes = path.as_bytes();
        if bytes.len() >= PATH_MAX {
            return Err(XipfsError::PathTooLong);
        }
        let mut field = [0_u8; PATH_MAX];
        field[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            next,
            path: field,
            reserved,
            exec,
        })
    }

    /// Serialize into header bytes with the size history erased.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [ERASE_BYTE; HEADER_SIZE];
        // The helpers cannot fail on a fixed-size buffer.
        let _ = write_ne_u32(&mut out, NEXT_OFFSET, self.next.0);
        out[PATH_OFFSET..PATH_OFFSET + PATH_MAX].copy_from_slice(&self.path);
        let _ = write_ne_u32(&mut out, RESERVED_OFFSET, self.reserved);
        let _ = write_ne_u32(&mut out, EXEC_OFFSET, self.exec);
        out
    }
}

/// Decode a NUL-terminated path field.
pub fn path_str(field: &[u8]) -> Result<&str> {
    let end = field
        .iter()
        .position(|b| *b == 0)
        .ok_or(XipfsError::PathTooLong)?;
    std::str::from_utf8(&field[..end]).map_err(|_| XipfsError::BadPathCharacter)
}
