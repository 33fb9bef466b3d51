//! The volume context: one NVM device, one page buffer, one mount.
//!
//! Everything that was ambient state in a typical embedded port (the
//! staging buffer, the error slot, the mount description) hangs off this
//! object and is passed explicitly.

use crate::buffer::PageBuffer;
use crate::mount::Mount;
use xipfs_error::{Result, XipfsError};
use xipfs_nvm::Nvm;
use xipfs_types::read_ne_u32;

pub struct Volume<N: Nvm> {
    pub(crate) nvm: N,
    pub(crate) buf: PageBuffer,
    pub(crate) mount: Mount,
}

impl<N: Nvm> std::fmt::Debug for Volume<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("mount", &self.mount)
            .field("buf", &self.buf)
            .finish()
    }
}

impl<N: Nvm> Volume<N> {
    /// Bind a device to a mount description after validating it.
    pub fn new(nvm: N, mount: Mount) -> Result<Self> {
        mount.check(&nvm)?;
        Ok(Self {
            nvm,
            buf: PageBuffer::new(),
            mount,
        })
    }

    #[must_use]
    pub fn mount(&self) -> &Mount {
        &self.mount
    }

    #[must_use]
    pub fn nvm(&self) -> &N {
        &self.nvm
    }

    /// Tear the volume down, flushing pending state back to the device.
    pub fn unmount(mut self) -> Result<N> {
        self.buf.flush(&mut self.nvm)?;
        self.nvm.sync()?;
        Ok(self.nvm)
    }

    /// Commit the page buffer.
    pub fn flush(&mut self) -> Result<()> {
        self.buf.flush(&mut self.nvm)
    }

    /// Commit the page buffer and the device's write-through state.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.nvm.sync()
    }

    /// Direct (execute-in-place) read of a native-endian word.
    pub(crate) fn word(&self, abs: usize) -> Result<u32> {
        read_ne_u32(self.nvm.as_bytes(), abs).map_err(|_| XipfsError::OutsideNvm {
            offset: abs as u64,
        })
    }

    pub(crate) fn buffer_read(&mut self, src: usize, dest: &mut [u8]) -> Result<()> {
        if !self.mount.contains(src, dest.len()) {
            return Err(XipfsError::OutsideNvm { offset: src as u64 });
        }
        self.buf.read(&mut self.nvm, src, dest)
    }

    pub(crate) fn buffer_write(&mut self, dest: usize, src: &[u8]) -> Result<()> {
        if !self.mount.contains(dest, src.len()) {
            return Err(XipfsError::OutsideNvm { offset: dest as u64 });
        }
        self.buf.write(&mut self.nvm, dest, src)
    }
}
