#![forbid(unsafe_code)]
//! Execution support for files carrying the exec bit.
//!
//! An executable file starts with a CRT0 relocation stub whose first
//! instruction sits at payload offset 0, followed by a metadata header
//! and the binary's sections. The file system never interprets any of
//! this: it prepares an [`ExecContext`] — binary base, free RAM and NVM
//! ranges, a stack slab, argc/argv and the syscall-dispatch table — and
//! hands control to a [`BinaryLauncher`]. The actual branch into the
//! image is platform work (a thumb-mode jump on the target MCU) and
//! lives behind that trait.

use tracing::debug;

use xipfs_error::{Result, XipfsError};
use xipfs_types::{EXEC_ARGC_MAX, read_ne_u32};

/// Number of entries in the syscall-dispatch table.
pub const SYSCALL_TABLE_MAX: usize = 2;

/// Free RAM handed to the binary, in bytes.
pub const FREE_RAM_SIZE: usize = 512;

/// Stack slab handed to the binary, in bytes.
pub const EXEC_STACK_SIZE: usize = 1024;

/// Fixed indices into the syscall-dispatch table. The binary addresses
/// services by index; the indices are part of the binary contract and
/// never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SyscallIndex {
    Exit = 0,
    Printf = 1,
}

impl SyscallIndex {
    pub fn from_raw(index: usize) -> Result<Self> {
        match index {
            0 => Ok(Self::Exit),
            1 => Ok(Self::Printf),
            _ => Err(XipfsError::InvalidArgument),
        }
    }
}

/// Host-provided services reachable from a running binary.
pub trait SyscallHost {
    fn exit(&mut self, status: i32);
    fn printf(&mut self, message: &str);
}

/// The dispatch table installed into every execution context.
///
/// On the MCU this is an index-to-function-pointer array; here the
/// entries dispatch into a host trait object with the same fixed
/// indices.
pub struct SyscallTable<'h> {
    host: &'h mut dyn SyscallHost,
}

impl<'h> SyscallTable<'h> {
    pub fn new(host: &'h mut dyn SyscallHost) -> Self {
        Self { host }
    }

    pub fn exit(&mut self, status: i32) {
        self.host.exit(status);
    }

    pub fn printf(&mut self, message: &str) {
        self.host.printf(message);
    }
}

impl std::fmt::Debug for SyscallTable<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallTable")
            .field("entries", &SYSCALL_TABLE_MAX)
            .finish()
    }
}

/// Memory layout the CRT0 needs to relocate and start the binary.
/// All addresses are device offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crt0Context {
    /// First byte of the binary in NVM.
    pub bin_base: usize,
    /// Free NVM directly behind the binary image.
    pub nvm_start: usize,
    /// End of the file's reserved run.
    pub nvm_end: usize,
}

/// Everything a binary receives on launch.
pub struct ExecContext<'h> {
    pub crt0: Crt0Context,
    /// Zeroed free-RAM slab; the CRT0 copies initialized data here.
    pub ram: Vec<u8>,
    /// Zeroed stack slab.
    pub stack: Vec<u8>,
    /// argv; argc is the length. Capped at [`EXEC_ARGC_MAX`].
    pub args: Vec<String>,
    pub syscalls: SyscallTable<'h>,
}

impl<'h> ExecContext<'h> {
    pub fn new(crt0: Crt0Context, argv: &[&str], host: &'h mut dyn SyscallHost) -> Self {
        let args = argv
            .iter()
            .take(EXEC_ARGC_MAX)
            .map(|arg| (*arg).to_owned())
            .collect();
        Self {
            crt0,
            ram: vec![0_u8; FREE_RAM_SIZE],
            stack: vec![0_u8; EXEC_STACK_SIZE],
            args,
            syscalls: SyscallTable::new(host),
        }
    }

    #[must_use]
    pub fn argc(&self) -> usize {
        self.args.len()
    }
}

impl std::fmt::Debug for ExecContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("crt0", &self.crt0)
            .field("argc", &self.args.len())
            .finish()
    }
}

/// The platform seam that transfers control into the image.
///
/// `image` is the file's payload as mapped in NVM, CRT0 stub first.
/// Returns the binary's exit status.
pub trait BinaryLauncher {
    fn launch(&mut self, image: &[u8], ctx: &mut ExecContext<'_>) -> Result<i32>;
}

/// The CRT0 metadata header a host toolchain embeds after the stub.
///
/// Six section words followed by the patch-info table: a count and one
/// pointer offset per entry needing relocation. Native endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crt0Header {
    /// Entry-point offset within the image (thumb address on target).
    pub entry_point: u32,
    /// `.rom` section size in bytes.
    pub rom_size: u32,
    /// `.rom.ram` (ROM-copied-to-RAM) section size in bytes.
    pub rom_ram_size: u32,
    /// `.ram` section size in bytes.
    pub ram_size: u32,
    /// `.got` section size in bytes.
    pub got_size: u32,
    /// End offset of the ROM+RAM image.
    pub rom_ram_end: u32,
    /// Pointer offsets needing relocation.
    pub patch_offsets: Vec<u32>,
}

impl Crt0Header {
    /// Serialized size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        7 * 4 + self.patch_offsets.len() * 4
    }

    /// Parse a header found at `offset` within the image.
    pub fn parse_at(image: &[u8], offset: usize) -> Result<Self> {
        let word = |field: usize| -> Result<u32> {
            read_ne_u32(image, offset + 4 * field).map_err(|_| XipfsError::InvalidArgument)
        };

        let entry_point = word(0)?;
        let rom_size = word(1)?;
        let rom_ram_size = word(2)?;
        let ram_size = word(3)?;
        let got_size = word(4)?;
        let rom_ram_end = word(5)?;
        let patch_count = word(6)? as usize;

        let mut patch_offsets = Vec::with_capacity(patch_count.min(1024));
        for entry in 0..patch_count {
            patch_offsets.push(word(7 + entry)?);
        }

        Ok(Self {
            entry_point,
            rom_size,
            rom_ram_size,
            ram_size,
            got_size,
            rom_ram_end,
            patch_offsets,
        })
    }

    /// Serialize the header for embedding into an image.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        for word in [
            self.entry_point,
            self.rom_size,
            self.rom_ram_size,
            self.ram_size,
            self.got_size,
            self.rom_ram_end,
            self.patch_offsets.len() as u32,
        ] {
            out.extend_from_slice(&word.to_ne_bytes());
        }
        for patch in &self.patch_offsets {
            out.extend_from_slice(&patch.to_ne_bytes());
        }
        out
    }

    /// Sanity-check the header against the image it came from.
    pub fn validate(&self, image_len: usize) -> Result<()> {
        let rom_end = self
            .rom_size
            .checked_add(self.rom_ram_size)
            .ok_or(XipfsError::InvalidArgument)?;
        if self.entry_point >= rom_end {
            return Err(XipfsError::InvalidArgument);
        }
        if self.rom_ram_end as usize > image_len {
            return Err(XipfsError::InvalidArgument);
        }
        for patch in &self.patch_offsets {
            if *patch as usize >= image_len {
                return Err(XipfsError::InvalidArgument);
            }
        }
        Ok(())
    }
}

/// A launcher wrapper that parses and validates the CRT0 metadata
/// header before delegating the control transfer.
pub struct CheckedLauncher<L> {
    inner: L,
    metadata_offset: usize,
}

impl<L: BinaryLauncher> CheckedLauncher<L> {
    pub fn new(inner: L, metadata_offset: usize) -> Self {
        Self {
            inner,
            metadata_offset,
        }
    }
}

impl<L: BinaryLauncher> BinaryLauncher for CheckedLauncher<L> {
    fn launch(&mut self, image: &[u8], ctx: &mut ExecContext<'_>) -> Result<i32> {
        let header = Crt0Header::parse_at(image, self.metadata_offset)?;
        header.validate(image.len())?;
        debug!(
            target: "xipfs::exec",
            event = "image_validated",
            entry_point = header.entry_point,
            patches = header.patch_offsets.len()
        );
        self.inner.launch(image, ctx)
    }
}
