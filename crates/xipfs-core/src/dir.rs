//! The file directory: a singly linked list of contiguous records over
//! NVM. Covers traversal, free-page accounting, allocation, deletion
//! with consolidation, bulk rename-by-prefix, format, and the mount-time
//! consistency check.

use tracing::{debug, info, trace};

use crate::file::path_check;
use crate::layout::{HEADER_SIZE, NEXT_OFFSET, RecordHeader};
use crate::volume::Volume;
use xipfs_error::{Result, XipfsError};
use xipfs_nvm::{Nvm, flash};
use xipfs_types::{ERASE_WORD, PAGE_SIZE, PATH_MAX, PageNumber, RecordOffset, pages_for};

impl<N: Nvm> Volume<N> {
    /// The record at the mount base, or `None` when the file system is
    /// empty (the head's `next` field is still in the erase state).
    pub fn head(&self) -> Result<Option<RecordOffset>> {
        let head = RecordOffset(0);
        if self.record_next(head)?.is_erased() {
            return Ok(None);
        }
        self.record_check(head)?;
        Ok(Some(head))
    }

    /// The successor of `rec`, or `None` at the end of the list: either
    /// `rec` links to itself (file system full) or the space above it is
    /// still erased.
    pub fn next_of(&self, rec: RecordOffset) -> Result<Option<RecordOffset>> {
        self.record_check(rec)?;

        let next = self.record_next(rec)?;
        if next == rec {
            return Ok(None);
        }
        if self.record_next(next)?.is_erased() {
            return Ok(None);
        }
        self.record_check(next)?;
        Ok(Some(next))
    }

    /// The last record in the list, or `None` when empty. O(#files).
    pub fn tail(&self) -> Result<Option<RecordOffset>> {
        let Some(mut rec) = self.head()? else {
            return Ok(None);
        };
        while let Some(next) = self.next_of(rec)? {
            rec = next;
        }
        Ok(Some(rec))
    }

    /// Where the next file would begin. Fails with `Full` when the tail
    /// is the self-loop terminal.
    pub fn tail_next(&self) -> Result<RecordOffset> {
        let Some(tail) = self.tail()? else {
            return Ok(RecordOffset(0));
        };
        let next = self.record_next(tail)?;
        if next == tail {
            return Err(XipfsError::Full);
        }
        Ok(next)
    }

    /// Number of pages not covered by any record run.
    pub fn free_pages(&self) -> Result<u32> {
        let Some(_) = self.head()? else {
            return Ok(self.mount.page_count());
        };
        let tail = self.tail()?.expect("non-empty list has a tail");
        let used = (tail.0 + self.record_reserved(tail)?) / PAGE_SIZE as u32;
        Ok(self.mount.page_count() - used)
    }

    /// Iterate the list front to back.
    pub fn files(&self) -> Files<'_, N> {
        Files {
            vol: self,
            state: FilesState::Start,
        }
    }

    /// Allocate a record for `path` at the current tail position.
    ///
    /// `size` is the requested payload reservation in bytes; at least one
    /// page is always reserved. When the reservation consumes the last
    /// free pages exactly, the new record becomes the self-loop terminal.
    pub fn new_file(&mut self, path: &str, size: u32, exec: u32) -> Result<RecordOffset> {
        path_check(path)?;
        if exec != 0 && exec != 1 {
            return Err(XipfsError::BadExecFlag);
        }

        let rec = self.tail_next()?;
        let free_pages = self.free_pages()?;

        let reserved_pages = pages_for(size as usize) as u32;
        let reserved = reserved_pages
            .checked_mul(PAGE_SIZE as u32)
            .ok_or(XipfsError::NoSpace)?;

        let next = if reserved_pages < free_pages {
            rec.checked_add(reserved).ok_or(XipfsError::NoSpace)?
        } else if reserved_pages == free_pages {
            rec
        } else {
            return Err(XipfsError::NoSpace);
        };

        let header = RecordHeader::new(next, path, reserved, exec)?;
        self.buffer_write(self.mount.abs(rec), &header.encode())?;
        self.flush()?;

        debug!(
            target: "xipfs::dir",
            event = "file_created",
            path,
            record = %rec,
            reserved,
            exec
        );
        Ok(rec)
    }

    /// Remove `rec` and consolidate: erase its run, then shift every
    /// successor down by the freed reservation, one file at a time.
    ///
    /// Each successor's header is patched before its pages move, so the
    /// list stays traversable at every step; an interrupted consolidation
    /// can be completed by running it again. Returns the reserved size of
    /// the removed record, the displacement of everything above it.
    pub fn remove(&mut self, rec: RecordOffset) -> Result<u32> {
        self.flush()?;

        let removed_reserved = self.record_reserved(rec)?;
        let mut next = self.next_of(rec)?;
        self.erase_record(rec)?;

        let mut dst_abs = self.mount.abs(rec);
        while let Some(src) = next {
            next = self.next_of(src)?;
            let src_abs = self.mount.abs(src);
            let reserved = self.record_reserved(src)?;
            let pages = reserved as usize / PAGE_SIZE;

            // Patch the link first: the shifted record points one
            // reservation above its new home. The freed pages always end
            // up past the new tail, so the self-loop terminal never
            // survives a consolidation.
            let mut header = [0_u8; HEADER_SIZE];
            header.copy_from_slice(&self.nvm.as_bytes()[src_abs..src_abs + HEADER_SIZE]);
            let dst_rel = self.mount.rel(dst_abs);
            let patched_next = dst_rel
                .checked_add(reserved)
                .ok_or(XipfsError::OutsideNvm {
                    offset: dst_abs as u64,
                })?;
            header[NEXT_OFFSET..NEXT_OFFSET + 4].copy_from_slice(&patched_next.0.to_ne_bytes());

            flash::write_unaligned(&mut self.nvm, dst_abs, &header)?;

            // Rest of the first page, then release the source page.
            let mut first_page = [0_u8; PAGE_SIZE];
            first_page.copy_from_slice(&self.nvm.as_bytes()[src_abs..src_abs + PAGE_SIZE]);
            flash::write_unaligned(
                &mut self.nvm,
                dst_abs + HEADER_SIZE,
                &first_page[HEADER_SIZE..],
            )?;
            flash::erase_page(&mut self.nvm, flash::page_of(src_abs))?;

            let mut dst_page = dst_abs + PAGE_SIZE;
            let mut src_page = src_abs + PAGE_SIZE;
            for _ in 1..pages {
                let page = flash::page_of(src_page);
                if !flash::is_erased_page(&self.nvm, page) {
                    let mut copy = [0_u8; PAGE_SIZE];
                    copy.copy_from_slice(&self.nvm.as_bytes()[src_page..src_page + PAGE_SIZE]);
                    flash::write_unaligned(&mut self.nvm, dst_page, &copy)?;
                    flash::erase_page(&mut self.nvm, page)?;
                }
                dst_page += PAGE_SIZE;
                src_page += PAGE_SIZE;
            }

            trace!(
                target: "xipfs::dir",
                event = "record_shifted",
                from = %src,
                to = %dst_rel,
                pages
            );
            dst_abs += reserved as usize;
        }

        debug!(
            target: "xipfs::dir",
            event = "file_removed",
            record = %rec,
            reserved = removed_reserved
        );
        Ok(removed_reserved)
    }

    /// Rewrite the path of every record whose path starts with `from` so
    /// it starts with `to` instead. Returns the number of records
    /// renamed.
    ///
    /// A pre-scan verifies that every produced path fits the fixed path
    /// field, so the operation either applies to all matching records or
    /// to none; names are never truncated.
    pub fn rename_all(&mut self, from: &str, to: &str) -> Result<usize> {
        path_check(from)?;
        path_check(to)?;

        let mut planned = Vec::new();
        for rec in self.files() {
            let rec = rec?;
            let path = self.record_path(rec)?;
            if let Some(suffix) = path.strip_prefix(from) {
                let new_path = format!("{to}{suffix}");
                if new_path.len() >= PATH_MAX {
                    return Err(XipfsError::PathTooLong);
                }
                planned.push((rec, new_path));
            }
        }

        let count = planned.len();
        for (rec, new_path) in planned {
            self.rename_record(rec, &new_path)?;
        }

        debug!(target: "xipfs::dir", event = "renamed_by_prefix", from, to, count);
        Ok(count)
    }

    /// Erase every page of the mount range.
    pub fn format(&mut self) -> Result<()> {
        // Whatever the buffer staged is part of what format destroys.
        self.buf.reset();

        let first = flash::page_of(self.mount.base());
        for i in 0..self.mount.page_count() {
            flash::erase_page(&mut self.nvm, PageNumber(first.0 + i))?;
        }
        info!(
            target: "xipfs::dir",
            event = "formatted",
            pages = self.mount.page_count()
        );
        Ok(())
    }

    /// Mount-time consistency check: the list must traverse to its tail
    /// and every word past `tail_next` must be in the erase state.
    pub fn verify(&self) -> Result<()> {
        let start = match self.tail_next() {
            Ok(rec) => self.mount.abs(rec),
            // A full file system reserves every page; nothing to scan.
            Err(XipfsError::Full) => return Ok(()),
            Err(other) => return Err(other),
        };

        let bytes = self.nvm.as_bytes();
        let mut abs = start;
        while abs < self.mount.end() {
            let word = u32::from_ne_bytes([
                bytes[abs],
                bytes[abs + 1],
                bytes[abs + 2],
                bytes[abs + 3],
            ]);
            if word != ERASE_WORD {
                return Err(XipfsError::TailNotErased { offset: abs as u64 });
            }
            abs += 4;
        }
        Ok(())
    }
}

enum FilesState {
    Start,
    At(RecordOffset),
    Done,
}

/// Iterator over the records of a volume, front to back.
///
/// A traversal error is yielded once and ends the iteration.
pub struct Files<'a, N: Nvm> {
    vol: &'a Volume<N>,
    state: FilesState,
}

impl<N: Nvm> Iterator for Files<'_, N> {
    type Item = Result<RecordOffset>;

    fn next(&mut self) -> Option<Self::Item> {
        let step = match self.state {
            FilesState::Start => self.vol.head(),
            FilesState::At(rec) => self.vol.next_of(rec),
            FilesState::Done => return None,
        };
        match step {
            Ok(Some(rec)) => {
                self.state = FilesState::At(rec);
                Some(Ok(rec))
            }
            Ok(None) => {
                self.state = FilesState::Done;
                None
            }
            Err(err) => {
                self.state = FilesState::Done;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::Mount;
    use xipfs_nvm::RamNvm;
    use xipfs_types::ERASE_BYTE;

    fn volume(pages: u32) -> Volume<RamNvm> {
        Volume::new(RamNvm::new(pages), Mount::new(0, pages)).expect("volume")
    }

    fn paths(vol: &Volume<RamNvm>) -> Vec<String> {
        vol.files()
            .map(|rec| vol.record_path(rec.expect("record")).expect("path"))
            .collect()
    }

    #[test]
    fn an_empty_volume_has_no_head_and_all_pages_free() {
        let vol = volume(10);
        assert!(vol.head().expect("head").is_none());
        assert_eq!(vol.free_pages().expect("free"), 10);
        assert_eq!(vol.tail_next().expect("tail next"), RecordOffset(0));
        vol.verify().expect("verify");
    }

    #[test]
    fn records_chain_contiguously() {
        let mut vol = volume(10);
        let a = vol.new_file("/a", 0, 0).expect("a");
        let b = vol.new_file("/b", PAGE_SIZE as u32 + 1, 0).expect("b");
        let c = vol.new_file("/c", 0, 0).expect("c");

        assert_eq!(a, RecordOffset(0));
        assert_eq!(b, RecordOffset(PAGE_SIZE as u32));
        assert_eq!(c, RecordOffset(3 * PAGE_SIZE as u32));
        assert_eq!(vol.free_pages().expect("free"), 6);
        assert_eq!(paths(&vol), ["/a", "/b", "/c"]);
        vol.verify().expect("verify");
    }

    #[test]
    fn zero_byte_request_reserves_one_page() {
        let mut vol = volume(4);
        let rec = vol.new_file("/zero", 0, 0).expect("new file");
        assert_eq!(vol.record_reserved(rec).expect("reserved"), PAGE_SIZE as u32);

        let two = vol.new_file("/two", PAGE_SIZE as u32 + 1, 0).expect("new file");
        assert_eq!(
            vol.record_reserved(two).expect("reserved"),
            2 * PAGE_SIZE as u32
        );
    }

    #[test]
    fn exact_fit_sets_the_self_loop_terminal() {
        let mut vol = volume(2);
        vol.new_file("/x", 0, 0).expect("x");
        let y = vol.new_file("/y", 0, 0).expect("y");

        assert_eq!(vol.record_next(y).expect("next"), y);
        assert!(matches!(vol.tail_next(), Err(XipfsError::Full)));
        assert!(matches!(
            vol.new_file("/z", 0, 0),
            Err(XipfsError::Full)
        ));
        assert_eq!(paths(&vol), ["/x", "/y"]);
        vol.verify().expect("full volume still verifies");
    }

    #[test]
    fn oversized_request_fails_and_leaves_nvm_unchanged() {
        let mut vol = volume(3);
        vol.new_file("/a", 0, 0).expect("a");
        let before = vol.nvm().as_bytes().to_vec();

        assert!(matches!(
            vol.new_file("/big", 3 * PAGE_SIZE as u32, 0),
            Err(XipfsError::NoSpace)
        ));
        assert_eq!(vol.nvm().as_bytes(), &before[..]);
    }

    #[test]
    fn remove_consolidates_and_preserves_payloads() {
        let mut vol = volume(10);
        let a = vol.new_file("/a", 1000, 0).expect("a");
        let b = vol.new_file("/b", 1000, 0).expect("b");
        vol.new_file("/c", 1000, 0).expect("c");

        let body = vec![b'A'; 100];
        vol.file_write_at(b, 0, &body).expect("write /b");
        vol.flush().expect("flush");

        let displacement = vol.remove(a).expect("remove /a");
        assert_eq!(displacement, PAGE_SIZE as u32);

        // /b now lives where /a was, /c behind it; data intact.
        assert_eq!(paths(&vol), ["/b", "/c"]);
        let b_new = RecordOffset(0);
        assert_eq!(vol.record_path(b_new).expect("path"), "/b");
        let mut back = vec![0_u8; body.len()];
        vol.file_read_at(b_new, 0, &mut back).expect("read");
        assert_eq!(back, body);

        assert_eq!(vol.free_pages().expect("free"), 8);
        vol.verify().expect("verify");
    }

    #[test]
    fn remove_shifts_multi_page_files_completely() {
        let mut vol = volume(8);
        let a = vol.new_file("/a", 0, 0).expect("a");
        let big = vol.new_file("/big", 3 * PAGE_SIZE as u32, 0).expect("big");

        // Straddle all three pages of /big's payload.
        let max = vol.max_pos(big).expect("max") as usize;
        let body: Vec<u8> = (0..max).map(|i| (i % 251) as u8).collect();
        vol.file_write_at(big, 0, &body).expect("write");
        vol.flush().expect("flush");

        vol.remove(a).expect("remove /a");

        let big_new = RecordOffset(0);
        assert_eq!(vol.record_path(big_new).expect("path"), "/big");
        let mut back = vec![0_u8; max];
        vol.file_read_at(big_new, 0, &mut back).expect("read");
        assert_eq!(back, body);
        vol.verify().expect("verify");
    }

    #[test]
    fn removing_the_terminal_record_frees_its_pages() {
        let mut vol = volume(2);
        vol.new_file("/x", 0, 0).expect("x");
        let y = vol.new_file("/y", 0, 0).expect("y");

        vol.remove(y).expect("remove tail");
        assert_eq!(paths(&vol), ["/x"]);
        assert_eq!(vol.free_pages().expect("free"), 1);
        vol.verify().expect("verify");
        // Capacity is back.
        vol.new_file("/z", 0, 0).expect("z fits again");
    }

    #[test]
    fn removing_before_a_terminal_record_clears_the_self_loop() {
        let mut vol = volume(2);
        let x = vol.new_file("/x", 0, 0).expect("x");
        vol.new_file("/y", 0, 0).expect("y");

        vol.remove(x).expect("remove /x");
        assert_eq!(paths(&vol), ["/y"]);
        let y_new = RecordOffset(0);
        // The shifted record is an ordinary tail again, not a self-loop.
        assert_eq!(
            vol.record_next(y_new).expect("next"),
            RecordOffset(PAGE_SIZE as u32)
        );
        assert_eq!(vol.free_pages().expect("free"), 1);
        vol.verify().expect("verify");
    }

    #[test]
    fn rename_all_rewrites_matching_prefixes_atomically() {
        let mut vol = volume(10);
        vol.new_file("/d/one", 0, 0).expect("one");
        vol.new_file("/d/two", 0, 0).expect("two");
        vol.new_file("/other", 0, 0).expect("other");

        let count = vol.rename_all("/d/", "/e/").expect("rename all");
        assert_eq!(count, 2);
        assert_eq!(paths(&vol), ["/e/one", "/e/two", "/other"]);
    }

    #[test]
    fn rename_all_rejects_overflowing_names_before_mutating() {
        let mut vol = volume(10);
        vol.new_file("/d/one", 0, 0).expect("one");
        let long = format!("/{}/", "p".repeat(PATH_MAX - 8));

        assert!(matches!(
            vol.rename_all("/d/", &long),
            Err(XipfsError::PathTooLong)
        ));
        assert_eq!(paths(&vol), ["/d/one"]);
    }

    #[test]
    fn format_erases_the_whole_mount() {
        let mut vol = volume(4);
        vol.new_file("/a", 0, 0).expect("a");
        vol.format().expect("format");

        assert!(vol.head().expect("head").is_none());
        assert!(vol.nvm().as_bytes().iter().all(|b| *b == ERASE_BYTE));
        vol.verify().expect("verify");
    }

    #[test]
    fn verify_rejects_dirt_past_the_tail() {
        let mut vol = volume(4);
        vol.new_file("/a", 0, 0).expect("a");

        let abs = 2 * PAGE_SIZE + 16;
        flash::write_unaligned(&mut vol.nvm, abs, &[0]).expect("dirty");
        assert!(matches!(
            vol.verify(),
            Err(XipfsError::TailNotErased { .. })
        ));
    }
}
