//! Per-file operations: structural validation, the append-only size
//! history, bounded payload access, rename and erase.

use tracing::{debug, trace};

use crate::layout::{
    EXEC_OFFSET, HEADER_SIZE, NEXT_OFFSET, PATH_OFFSET, RESERVED_OFFSET, SIZE_OFFSET, path_str,
};
use crate::volume::Volume;
use xipfs_error::{Result, XipfsError};
use xipfs_nvm::{Nvm, flash};
use xipfs_types::{ERASE_BYTE, ERASE_WORD, FILESIZE_SLOTS, PAGE_SIZE, PATH_MAX, RecordOffset};

/// True for the characters a stored path may contain.
fn path_char_ok(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'/' || c == b'.' || c == b'-' || c == b'_'
}

/// Validate a candidate path: non-empty, legal charset, short enough to
/// store with its terminator.
pub fn path_check(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(XipfsError::EmptyPath);
    }
    if path.len() >= PATH_MAX {
        return Err(XipfsError::PathTooLong);
    }
    if !path.bytes().all(path_char_ok) {
        return Err(XipfsError::BadPathCharacter);
    }
    Ok(())
}

impl<N: Nvm> Volume<N> {
    /// Structural validation of a record reached by traversal.
    ///
    /// A record must sit page-aligned inside the mount, link to a
    /// page-aligned successor exactly `reserved` bytes above it (or to
    /// itself, the full-file-system sentinel), store a valid path and a
    /// boolean exec flag.
    pub fn record_check(&self, rec: RecordOffset) -> Result<()> {
        let abs = self.mount.abs(rec);
        if !flash::page_aligned(abs) {
            return Err(XipfsError::Misaligned { offset: abs as u64 });
        }
        if !self.mount.contains(abs, HEADER_SIZE) {
            return Err(XipfsError::OutsideNvm { offset: abs as u64 });
        }

        let next = RecordOffset(self.word(abs + NEXT_OFFSET)?);
        if next.is_erased() {
            return Err(XipfsError::BadLink { offset: abs as u64 });
        }
        if next != rec {
            let next_abs = self.mount.abs(next);
            if !flash::page_aligned(next_abs) {
                return Err(XipfsError::Misaligned {
                    offset: next_abs as u64,
                });
            }
            if !self.mount.contains(next_abs, 1) {
                return Err(XipfsError::OutsideNvm {
                    offset: next_abs as u64,
                });
            }
            if rec.0 >= next.0 {
                return Err(XipfsError::BadLink { offset: abs as u64 });
            }
            let reserved = self.word(abs + RESERVED_OFFSET)?;
            if rec.0.checked_add(reserved) != Some(next.0) {
                return Err(XipfsError::BadLink { offset: abs as u64 });
            }
        }

        let path_field = &self.nvm.as_bytes()[abs + PATH_OFFSET..abs + PATH_OFFSET + PATH_MAX];
        path_check(path_str(path_field)?)?;

        let exec = self.word(abs + EXEC_OFFSET)?;
        if exec != 0 && exec != 1 {
            return Err(XipfsError::BadExecFlag);
        }

        Ok(())
    }

    /// The stored full path of a record.
    pub fn record_path(&self, rec: RecordOffset) -> Result<String> {
        let abs = self.mount.abs(rec);
        let field = &self.nvm.as_bytes()[abs + PATH_OFFSET..abs + PATH_OFFSET + PATH_MAX];
        Ok(path_str(field)?.to_owned())
    }

    /// Bytes reserved for the record, header included.
    pub fn record_reserved(&self, rec: RecordOffset) -> Result<u32> {
        self.word(self.mount.abs(rec) + RESERVED_OFFSET)
    }

    /// The record's raw exec flag.
    pub fn record_exec(&self, rec: RecordOffset) -> Result<u32> {
        self.word(self.mount.abs(rec) + EXEC_OFFSET)
    }

    pub(crate) fn record_next(&self, rec: RecordOffset) -> Result<RecordOffset> {
        Ok(RecordOffset(self.word(self.mount.abs(rec) + NEXT_OFFSET)?))
    }

    /// The largest position a read or write may reach.
    pub fn max_pos(&self, rec: RecordOffset) -> Result<u32> {
        let reserved = self.record_reserved(rec)?;
        reserved
            .checked_sub(HEADER_SIZE as u32)
            .ok_or(XipfsError::BadLink {
                offset: self.mount.abs(rec) as u64,
            })
    }

    /// Current size: the last value before the first erased slot of the
    /// size history, or 0 when the whole history is erased.
    pub fn file_size(&self, rec: RecordOffset) -> Result<u32> {
        let abs = self.mount.abs(rec);
        let mut last = 0;
        for slot in 0..FILESIZE_SLOTS {
            let value = self.word(abs + SIZE_OFFSET + 4 * slot)?;
            if value == ERASE_WORD {
                return Ok(last);
            }
            last = value;
        }
        Ok(last)
    }

    /// Append `size` to the size history.
    ///
    /// Writes the first erased slot; with the header page untouched this
    /// absorbs [`FILESIZE_SLOTS`] size changes per header erase. Once the
    /// history is exhausted the header page is re-staged with the history
    /// reset to the erase state and `size` in slot 0.
    pub fn set_size(&mut self, rec: RecordOffset, size: u32) -> Result<()> {
        self.record_check(rec)?;
        let abs = self.mount.abs(rec);

        let slot = (0..FILESIZE_SLOTS)
            .find(|slot| match self.word(abs + SIZE_OFFSET + 4 * slot) {
                Ok(value) => value == ERASE_WORD,
                Err(_) => false,
            });

        match slot {
            Some(slot) => {
                self.buffer_write(abs + SIZE_OFFSET + 4 * slot, &size.to_ne_bytes())?;
            }
            None => {
                // History exhausted: restart it. The staged rewrite costs
                // one header-page erase and keeps the size exact.
                trace!(target: "xipfs::file", event = "size_history_reset", record = %rec);
                let mut reset = [ERASE_BYTE; 4 * FILESIZE_SLOTS];
                reset[..4].copy_from_slice(&size.to_ne_bytes());
                self.buffer_write(abs + SIZE_OFFSET, &reset)?;
            }
        }

        self.flush()
    }

    /// Read `dest.len()` payload bytes starting at `pos`.
    pub fn file_read_at(&mut self, rec: RecordOffset, pos: u32, dest: &mut [u8]) -> Result<()> {
        let max = self.max_pos(rec)?;
        let end = (pos as usize)
            .checked_add(dest.len())
            .ok_or(XipfsError::OffsetBeyondEnd)?;
        if end > max as usize {
            return Err(XipfsError::OffsetBeyondEnd);
        }
        let abs = self.mount.abs(rec) + HEADER_SIZE + pos as usize;
        self.buffer_read(abs, dest)
    }

    /// Stage `src` into the payload starting at `pos`.
    pub fn file_write_at(&mut self, rec: RecordOffset, pos: u32, src: &[u8]) -> Result<()> {
        let max = self.max_pos(rec)?;
        let end = (pos as usize)
            .checked_add(src.len())
            .ok_or(XipfsError::OffsetBeyondEnd)?;
        if end > max as usize {
            return Err(XipfsError::OffsetBeyondEnd);
        }
        let abs = self.mount.abs(rec) + HEADER_SIZE + pos as usize;
        self.buffer_write(abs, src)
    }

    /// Overwrite the record's path field in place.
    ///
    /// Safe against the program-only-clears-bits constraint because the
    /// buffer commit erases the page before reprogramming it.
    pub fn rename_record(&mut self, rec: RecordOffset, to_path: &str) -> Result<()> {
        self.record_check(rec)?;
        path_check(to_path)?;

        let mut field = [0_u8; PATH_MAX];
        field[..to_path.len()].copy_from_slice(to_path.as_bytes());
        self.buffer_write(self.mount.abs(rec) + PATH_OFFSET, &field)?;
        self.flush()?;
        debug!(target: "xipfs::file", event = "renamed", record = %rec, to = to_path);
        Ok(())
    }

    /// Erase every page of the record's run.
    pub fn erase_record(&mut self, rec: RecordOffset) -> Result<()> {
        self.record_check(rec)?;
        let abs = self.mount.abs(rec);
        let pages = self.record_reserved(rec)? as usize / PAGE_SIZE;
        let first = flash::page_of(abs);
        for i in 0..pages {
            flash::erase_page(&mut self.nvm, xipfs_types::PageNumber(first.0 + i as u32))?;
        }
        Ok(())
    }
}
