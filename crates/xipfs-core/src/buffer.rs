//! Single-page staging buffer for read-modify-write access to NVM.
//!
//! Any byte written to a page goes through this buffer: the page is
//! loaded, mutated in RAM, and committed by erase-then-program when the
//! buffer is flushed. At most one page is staged at any time; touching a
//! different page flushes the current one first, so writes to page A all
//! become durable no later than the first write to page B.

use tracing::trace;

use xipfs_error::Result;
use xipfs_nvm::{Nvm, flash};
use xipfs_types::{PAGE_SIZE, PageNumber};

pub struct PageBuffer {
    page: Option<PageNumber>,
    buf: Box<[u8; PAGE_SIZE]>,
}

impl std::fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuffer")
            .field("page", &self.page)
            .finish()
    }
}

impl Default for PageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PageBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            page: None,
            buf: Box::new([0_u8; PAGE_SIZE]),
        }
    }

    /// Discard the staged page without writing it back. Used by format,
    /// where the staged contents are being destroyed anyway.
    pub fn reset(&mut self) {
        self.page = None;
    }

    fn load(&mut self, nvm: &dyn Nvm, page: PageNumber) {
        let base = page.base();
        self.buf
            .copy_from_slice(&nvm.as_bytes()[base..base + PAGE_SIZE]);
        self.page = Some(page);
        trace!(target: "xipfs::buffer", event = "page_loaded", page = page.0);
    }

    fn dirty(&self, nvm: &dyn Nvm) -> bool {
        match self.page {
            Some(page) => {
                let base = page.base();
                self.buf.as_slice() != &nvm.as_bytes()[base..base + PAGE_SIZE]
            }
            None => false,
        }
    }

    /// Commit the staged page if any byte differs from NVM: erase the
    /// target page, re-program its full contents, and mark the buffer
    /// empty. A clean buffer stays loaded.
    pub fn flush(&mut self, nvm: &mut dyn Nvm) -> Result<()> {
        if !self.dirty(nvm) {
            return Ok(());
        }
        let page = self.page.expect("dirty buffer holds a page");

        flash::erase_page(nvm, page)?;
        flash::write_unaligned(nvm, page.base(), self.buf.as_slice())?;

        trace!(target: "xipfs::buffer", event = "page_flushed", page = page.0);
        self.page = None;
        Ok(())
    }

    fn stage(&mut self, nvm: &mut dyn Nvm, page: PageNumber) -> Result<()> {
        match self.page {
            Some(staged) if staged == page => Ok(()),
            Some(_) => {
                self.flush(nvm)?;
                self.load(nvm, page);
                Ok(())
            }
            None => {
                self.load(nvm, page);
                Ok(())
            }
        }
    }

    /// Read `dest.len()` bytes starting at device offset `src`, seeing
    /// staged but not yet flushed modifications.
    pub fn read(&mut self, nvm: &mut dyn Nvm, src: usize, dest: &mut [u8]) -> Result<()> {
        let mut pos = src;
        let mut done = 0;
        while done < dest.len() {
            let page = flash::page_of(pos);
            let in_page = pos % PAGE_SIZE;
            let n = (PAGE_SIZE - in_page).min(dest.len() - done);
            self.stage(nvm, page)?;
            dest[done..done + n].copy_from_slice(&self.buf[in_page..in_page + n]);
            pos += n;
            done += n;
        }
        Ok(())
    }

    /// Stage `src` at device offset `dest` without committing it.
    pub fn write(&mut self, nvm: &mut dyn Nvm, dest: usize, src: &[u8]) -> Result<()> {
        let mut pos = dest;
        let mut done = 0;
        while done < src.len() {
            let page = flash::page_of(pos);
            let in_page = pos % PAGE_SIZE;
            let n = (PAGE_SIZE - in_page).min(src.len() - done);
            self.stage(nvm, page)?;
            self.buf[in_page..in_page + n].copy_from_slice(&src[done..done + n]);
            pos += n;
            done += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xipfs_nvm::RamNvm;
    use xipfs_types::ERASE_BYTE;

    #[test]
    fn writes_are_invisible_on_nvm_until_flush() {
        let mut nvm = RamNvm::new(2);
        let mut buf = PageBuffer::new();

        buf.write(&mut nvm, 10, b"staged").expect("write");
        assert_eq!(nvm.as_bytes()[10], ERASE_BYTE);

        let mut back = [0_u8; 6];
        buf.read(&mut nvm, 10, &mut back).expect("read");
        assert_eq!(&back, b"staged");

        buf.flush(&mut nvm).expect("flush");
        assert_eq!(&nvm.as_bytes()[10..16], b"staged");
    }

    #[test]
    fn touching_another_page_flushes_the_first() {
        let mut nvm = RamNvm::new(2);
        let mut buf = PageBuffer::new();

        buf.write(&mut nvm, 0, &[0xAA]).expect("write page 0");
        buf.write(&mut nvm, PAGE_SIZE, &[0xBB]).expect("write page 1");

        // Page 0 became durable when page 1 was staged.
        assert_eq!(nvm.as_bytes()[0], 0xAA);
        assert_eq!(nvm.as_bytes()[PAGE_SIZE], ERASE_BYTE);

        buf.flush(&mut nvm).expect("flush");
        assert_eq!(nvm.as_bytes()[PAGE_SIZE], 0xBB);
    }

    #[test]
    fn a_write_spanning_pages_stages_both_in_order() {
        let mut nvm = RamNvm::new(2);
        let mut buf = PageBuffer::new();

        let data = vec![0x42_u8; 8];
        buf.write(&mut nvm, PAGE_SIZE - 4, &data).expect("write");
        // First half was flushed when the second page was staged.
        assert_eq!(&nvm.as_bytes()[PAGE_SIZE - 4..PAGE_SIZE], &data[..4]);
        buf.flush(&mut nvm).expect("flush");
        assert_eq!(&nvm.as_bytes()[PAGE_SIZE..PAGE_SIZE + 4], &data[4..]);
    }

    #[test]
    fn clean_flush_costs_nothing() {
        let mut nvm = RamNvm::new(1);
        let mut buf = PageBuffer::new();

        let mut byte = [0_u8; 1];
        buf.read(&mut nvm, 0, &mut byte).expect("read");
        buf.flush(&mut nvm).expect("flush");
        // Rewriting the value already on NVM leaves the page clean.
        buf.write(&mut nvm, 0, &[ERASE_BYTE]).expect("write");
        buf.flush(&mut nvm).expect("flush");
    }

    #[test]
    fn flush_commits_by_erase_then_program() {
        let mut nvm = RamNvm::new(1);
        let mut buf = PageBuffer::new();

        // Program 0x00, then rewrite to 0xA5. Bits must go back up, which
        // only works because flush erases the page before programming.
        buf.write(&mut nvm, 0, &[0x00]).expect("write");
        buf.flush(&mut nvm).expect("flush");
        buf.write(&mut nvm, 0, &[0xA5]).expect("write");
        buf.flush(&mut nvm).expect("flush");
        assert_eq!(nvm.as_bytes()[0], 0xA5);
    }
}
