#![forbid(unsafe_code)]
//! xipfs public API facade.
//!
//! Re-exports the driver surface, the volume core, the NVM devices and
//! the execution seam through one crate. Downstream consumers (CLI,
//! firmware glue, harnesses) depend on this.

pub use xipfs_core::{Mount, PageBuffer, PathKind, ResolvedPath, Volume, HEADER_SIZE};
pub use xipfs_driver::{
    Dir, DirEntry, Fd, FileKind, FileStat, OpenFlags, VfsStat, Whence, Xipfs, INFO_FILE_NAME,
};
pub use xipfs_error::{Result, XipfsError};
pub use xipfs_exec::{
    BinaryLauncher, CheckedLauncher, Crt0Context, Crt0Header, ExecContext, SyscallHost,
    SyscallIndex, SyscallTable,
};
pub use xipfs_nvm::{flash, FileNvm, Nvm, RamNvm};
pub use xipfs_types::{
    PageNumber, RecordOffset, ERASE_BYTE, ERASE_WORD, FILESIZE_SLOTS, MAX_OPEN_FILES, PAGE_SIZE,
    PATH_MAX, XIPFS_MAGIC,
};
