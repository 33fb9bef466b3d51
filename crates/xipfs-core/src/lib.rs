#![forbid(unsafe_code)]
//! Core of the execute-in-place file system.
//!
//! Files live contiguously in NVM as aligned runs of erase pages, strung
//! together by a singly linked list whose links are offsets from the mount
//! base. The modules here cover the on-NVM record layout, the single-page
//! staging buffer, the file directory (allocation, deletion with
//! consolidation, bulk rename, format), per-file operations including the
//! append-only size history, and the flat-list path classifier.

mod buffer;
mod dir;
mod file;
mod layout;
mod mount;
mod path;
mod volume;

pub use buffer::PageBuffer;
pub use dir::Files;
pub use file::path_check;
pub use layout::{
    EXEC_OFFSET, HEADER_SIZE, NEXT_OFFSET, PATH_OFFSET, RESERVED_OFFSET, RecordHeader, SIZE_OFFSET,
};
pub use mount::Mount;
pub use path::{PathKind, ResolvedPath};
pub use volume::Volume;
