#![forbid(unsafe_code)]
//! The POSIX-shaped driver over an xipfs volume.
//!
//! One non-reentrant mutex serializes every public operation; callers on
//! a multi-threaded host go through it implicitly. The driver owns the
//! fixed-capacity open-handle table, rebinds handles displaced by
//! consolidation, and exposes the virtual `.xipfs_infos` file.

use bitflags::bitflags;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use xipfs_core::{HEADER_SIZE, Mount, PathKind, ResolvedPath, Volume};
use xipfs_error::{Result, XipfsError};
use xipfs_exec::{BinaryLauncher, Crt0Context, ExecContext, SyscallHost};
use xipfs_nvm::Nvm;
use xipfs_types::{MAX_OPEN_FILES, PAGE_SIZE, PATH_MAX, RecordOffset};

/// Basename of the virtual file exposing the mount structure. Opening
/// it in any directory yields a read-only in-memory view.
pub const INFO_FILE_NAME: &str = ".xipfs_infos";

bitflags! {
    /// Supported subset of the POSIX open(2) flag space.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0;
        const WRONLY = 1 << 0;
        const RDWR   = 1 << 1;
        const CREAT  = 1 << 6;
        const EXCL   = 1 << 7;
        const APPEND = 1 << 10;
    }
}

impl OpenFlags {
    #[must_use]
    pub fn writable(self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR)
    }
}

/// An index into the driver's open-handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fd(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Regular,
    Directory,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FileStat {
    pub ino: u64,
    pub kind: FileKind,
    pub nlink: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct VfsStat {
    pub bsize: u32,
    pub frsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub namemax: u32,
}

/// An open directory stream.
#[derive(Debug, Clone)]
pub struct Dir {
    dirname: String,
    cursor: Option<RecordOffset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    /// Entry name relative to the directory; subdirectories carry a
    /// trailing slash.
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    File(RecordOffset),
    Info,
}

#[derive(Debug, Clone, Copy)]
struct Handle {
    target: Target,
    pos: i64,
}

struct State<N: Nvm> {
    vol: Volume<N>,
    handles: [Option<Handle>; MAX_OPEN_FILES],
}

/// A mounted xipfs file system.
pub struct Xipfs<N: Nvm> {
    state: Mutex<State<N>>,
}

/// Final path component; `/` for the root itself.
fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.rfind('/') {
        Some(i) => &trimmed[i + 1..],
        None => trimmed,
    }
}

/// Append a trailing slash to a directory path that lacks one.
fn with_trailing_slash(path: &str) -> Result<String> {
    if path.ends_with('/') {
        return Ok(path.to_owned());
    }
    if path.len() + 1 >= PATH_MAX {
        return Err(XipfsError::PathTooLong);
    }
    Ok(format!("{path}/"))
}

fn check_name(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(XipfsError::NotFound);
    }
    if path.len() >= PATH_MAX {
        return Err(XipfsError::PathTooLong);
    }
    Ok(())
}

impl<N: Nvm> State<N> {
    fn tracked(&self, fd: Fd) -> Result<Handle> {
        self.handles
            .get(fd.0)
            .copied()
            .flatten()
            .ok_or(XipfsError::BadHandle)
    }

    fn track(&mut self, handle: Handle) -> Result<Fd> {
        for (i, slot) in self.handles.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(handle);
                return Ok(Fd(i));
            }
        }
        Err(XipfsError::TooManyOpenFiles)
    }

    /// Remove a record with the page buffer flushed, then rebind every
    /// open handle displaced by the consolidation and invalidate the
    /// ones that pointed at the removed file. Returns the displacement.
    fn sync_remove(&mut self, rec: RecordOffset) -> Result<u32> {
        self.vol.flush()?;
        let reserved = self.vol.remove(rec)?;
        for slot in &mut self.handles {
            if let Some(handle) = slot {
                if let Target::File(off) = handle.target {
                    if off == rec {
                        *slot = None;
                    } else if off > rec {
                        handle.target = Target::File(RecordOffset(off.0 - reserved));
                    }
                }
            }
        }
        Ok(reserved)
    }

    /// Drop the empty-directory sentinel of the parent when a real
    /// entry materializes inside it.
    fn absorb_parent_sentinel(&mut self, rp: &ResolvedPath) -> Result<()> {
        if rp.dirname == "/" {
            return Ok(());
        }
        if let Some(witness) = rp.witness {
            if self.vol.record_path(witness)? == rp.dirname {
                self.sync_remove(witness)?;
            }
        }
        Ok(())
    }

    /// Re-create an empty-directory sentinel when the removed entry was
    /// the parent directory's only tracker.
    fn preserve_parent(&mut self, rp: &ResolvedPath, removed: usize) -> Result<()> {
        if rp.parent_trackers == removed && rp.dirname != "/" {
            self.vol.new_file(&rp.dirname, PAGE_SIZE as u32, 0)?;
        }
        Ok(())
    }

    fn mount0(&self) -> Result<()> {
        self.vol.verify()
    }

    fn format0(&mut self) -> Result<()> {
        self.vol.format()?;
        for slot in &mut self.handles {
            if matches!(
                slot,
                Some(Handle {
                    target: Target::File(_),
                    ..
                })
            ) {
                *slot = None;
            }
        }
        Ok(())
    }

    fn new_file0(&mut self, path: &str, size: u32, exec: u32) -> Result<()> {
        check_name(path)?;
        if path == "/" {
            return Err(XipfsError::IsDirectory);
        }
        if exec != 0 && exec != 1 {
            return Err(XipfsError::InvalidArgument);
        }

        let rp = self.vol.classify(path)?;
        match rp.kind {
            PathKind::ExistsAsFile => return Err(XipfsError::Exists),
            PathKind::ExistsAsEmptyDir | PathKind::ExistsAsNonemptyDir => {
                return Err(XipfsError::IsDirectory);
            }
            PathKind::InvalidNotDirs => return Err(XipfsError::NotDirectory),
            PathKind::InvalidNotFound => return Err(XipfsError::NotFound),
            PathKind::Creatable => {}
        }
        if rp.ends_with_slash() {
            return Err(XipfsError::IsDirectory);
        }

        self.absorb_parent_sentinel(&rp)?;
        self.vol
            .new_file(path, size, exec)
            .map_err(XipfsError::into_quota)?;
        Ok(())
    }

    fn open0(&mut self, path: &str, flags: OpenFlags) -> Result<Fd> {
        check_name(path)?;

        if basename(path) == INFO_FILE_NAME {
            if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                return Err(XipfsError::Exists);
            }
            if flags.writable() || flags.contains(OpenFlags::APPEND) {
                return Err(XipfsError::AccessDenied);
            }
            return self.track(Handle {
                target: Target::Info,
                pos: 0,
            });
        }

        let rp = self.vol.classify(path)?;
        let rec = match rp.kind {
            PathKind::ExistsAsFile => {
                if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                    return Err(XipfsError::Exists);
                }
                rp.witness.expect("existing file has a witness")
            }
            PathKind::ExistsAsEmptyDir | PathKind::ExistsAsNonemptyDir => {
                return Err(XipfsError::IsDirectory);
            }
            PathKind::InvalidNotDirs => return Err(XipfsError::NotDirectory),
            PathKind::InvalidNotFound => return Err(XipfsError::NotFound),
            PathKind::Creatable => {
                if !flags.contains(OpenFlags::CREAT) {
                    return Err(XipfsError::NotFound);
                }
                if rp.ends_with_slash() {
                    return Err(XipfsError::IsDirectory);
                }
                self.absorb_parent_sentinel(&rp)?;
                self.vol
                    .new_file(path, 0, 0)
                    .map_err(XipfsError::into_quota)?
            }
        };

        let pos = if flags.contains(OpenFlags::APPEND) {
            i64::from(self.vol.file_size(rec)?)
        } else {
            0
        };
        self.track(Handle {
            target: Target::File(rec),
            pos,
        })
    }

    fn close0(&mut self, fd: Fd) -> Result<()> {
        let handle = self.tracked(fd)?;
        if let Target::File(rec) = handle.target {
            let size = i64::from(self.vol.file_size(rec)?);
            if size < handle.pos {
                self.vol.set_size(rec, handle.pos as u32)?;
            }
            self.vol.flush()?;
        }
        self.handles[fd.0] = None;
        Ok(())
    }

    fn read0(&mut self, fd: Fd, dest: &mut [u8]) -> Result<usize> {
        let mut handle = self.tracked(fd)?;

        let n = match handle.target {
            Target::Info => {
                let info = self.vol.mount().info_bytes();
                let pos = handle.pos.clamp(0, info.len() as i64) as usize;
                let n = dest.len().min(info.len() - pos);
                dest[..n].copy_from_slice(&info[pos..pos + n]);
                n
            }
            Target::File(rec) => {
                let size = i64::from(self.vol.file_size(rec)?);
                if handle.pos >= size {
                    0
                } else {
                    let n = dest.len().min((size - handle.pos) as usize);
                    self.vol.file_read_at(rec, handle.pos as u32, &mut dest[..n])?;
                    n
                }
            }
        };

        handle.pos += n as i64;
        self.handles[fd.0] = Some(handle);
        Ok(n)
    }

    fn write0(&mut self, fd: Fd, src: &[u8]) -> Result<usize> {
        let mut handle = self.tracked(fd)?;
        let Target::File(rec) = handle.target else {
            // The virtual info file is never writable.
            return Err(XipfsError::BadHandle);
        };

        let max = i64::from(self.vol.max_pos(rec)?);
        if handle.pos >= max {
            return Ok(0);
        }
        let n = src.len().min((max - handle.pos) as usize);
        self.vol.file_write_at(rec, handle.pos as u32, &src[..n])?;

        handle.pos += n as i64;
        self.handles[fd.0] = Some(handle);
        Ok(n)
    }

    fn lseek0(&mut self, fd: Fd, off: i64, whence: Whence) -> Result<i64> {
        let mut handle = self.tracked(fd)?;

        let (max, size) = match handle.target {
            Target::Info => (Mount::INFO_LEN as i64, Mount::INFO_LEN as i64),
            Target::File(rec) => (
                i64::from(self.vol.max_pos(rec)?),
                i64::from(self.vol.file_size(rec)?),
            ),
        };

        let new_pos = match whence {
            Whence::Set => off,
            Whence::Cur => handle.pos.checked_add(off).ok_or(XipfsError::InvalidArgument)?,
            Whence::End => handle
                .pos
                .max(size)
                .checked_add(off)
                .ok_or(XipfsError::InvalidArgument)?,
        };
        if new_pos < 0 || new_pos > max {
            return Err(XipfsError::InvalidArgument);
        }

        // Seeking back below a pending grow commits the grown size.
        if let Target::File(rec) = handle.target {
            if handle.pos > size && new_pos < handle.pos {
                self.vol.set_size(rec, handle.pos as u32)?;
            }
        }

        handle.pos = new_pos;
        self.handles[fd.0] = Some(handle);
        Ok(new_pos)
    }

    fn fsync0(&mut self, fd: Fd) -> Result<()> {
        let handle = self.tracked(fd)?;
        let Target::File(rec) = handle.target else {
            return Ok(());
        };
        let size = i64::from(self.vol.file_size(rec)?);
        if handle.pos > size {
            self.vol.set_size(rec, handle.pos as u32)?;
        }
        self.vol.sync()
    }

    fn fstat0(&self, fd: Fd) -> Result<FileStat> {
        let handle = self.tracked(fd)?;
        let Target::File(rec) = handle.target else {
            // The virtual info file has no stat identity.
            return Err(XipfsError::BadHandle);
        };

        let size = i64::from(self.vol.file_size(rec)?).max(handle.pos);
        let reserved = self.vol.record_reserved(rec)?;
        Ok(FileStat {
            ino: self.vol.mount().abs(rec) as u64,
            kind: FileKind::Regular,
            nlink: 1,
            size: size as u64,
            blksize: PAGE_SIZE as u32,
            blocks: u64::from(reserved) / PAGE_SIZE as u64,
        })
    }

    fn stat0(&self, path: &str) -> Result<FileStat> {
        check_name(path)?;

        let rp = self.vol.classify(path)?;
        let (kind, size) = match rp.kind {
            PathKind::ExistsAsFile => {
                let witness = rp.witness.expect("existing file has a witness");
                (FileKind::Regular, self.vol.file_size(witness)?)
            }
            PathKind::ExistsAsEmptyDir | PathKind::ExistsAsNonemptyDir => (FileKind::Directory, 0),
            PathKind::InvalidNotDirs => return Err(XipfsError::NotDirectory),
            PathKind::InvalidNotFound | PathKind::Creatable => {
                return Err(XipfsError::NotFound);
            }
        };

        let witness = rp.witness.expect("existing path has a witness");
        let reserved = self.vol.record_reserved(witness)?;
        Ok(FileStat {
            ino: self.vol.mount().abs(witness) as u64,
            kind,
            nlink: 1,
            size: u64::from(size),
            blksize: PAGE_SIZE as u32,
            blocks: u64::from(reserved) / PAGE_SIZE as u64,
        })
    }

    fn statvfs0(&self) -> Result<VfsStat> {
        let free = self.vol.free_pages()?;
        Ok(VfsStat {
            bsize: PAGE_SIZE as u32,
            frsize: PAGE_SIZE as u32,
            blocks: u64::from(self.vol.mount().page_count()),
            bfree: u64::from(free),
            bavail: u64::from(free),
            namemax: PATH_MAX as u32,
        })
    }

    fn unlink0(&mut self, path: &str) -> Result<()> {
        check_name(path)?;
        if path == "/" {
            return Err(XipfsError::IsDirectory);
        }

        let rp = self.vol.classify(path)?;
        match rp.kind {
            PathKind::ExistsAsFile => {}
            PathKind::ExistsAsEmptyDir | PathKind::ExistsAsNonemptyDir => {
                return Err(XipfsError::IsDirectory);
            }
            PathKind::InvalidNotDirs => return Err(XipfsError::NotDirectory),
            PathKind::InvalidNotFound | PathKind::Creatable => {
                return Err(XipfsError::NotFound);
            }
        }

        self.sync_remove(rp.witness.expect("existing file has a witness"))?;
        self.preserve_parent(&rp, 1)?;
        Ok(())
    }

    fn mkdir0(&mut self, path: &str) -> Result<()> {
        check_name(path)?;
        if path == "/" {
            return Err(XipfsError::Exists);
        }

        let rp = self.vol.classify(path)?;
        match rp.kind {
            PathKind::ExistsAsFile
            | PathKind::ExistsAsEmptyDir
            | PathKind::ExistsAsNonemptyDir => return Err(XipfsError::Exists),
            PathKind::InvalidNotDirs => return Err(XipfsError::NotDirectory),
            PathKind::InvalidNotFound => return Err(XipfsError::NotFound),
            PathKind::Creatable => {}
        }

        let dirpath = with_trailing_slash(rp.path())?;
        self.absorb_parent_sentinel(&rp)?;
        self.vol
            .new_file(&dirpath, PAGE_SIZE as u32, 0)
            .map_err(XipfsError::into_quota)?;
        Ok(())
    }

    fn rmdir0(&mut self, path: &str) -> Result<()> {
        check_name(path)?;
        if path == "/" {
            return Err(XipfsError::Busy);
        }
        if path.ends_with('.') {
            return Err(XipfsError::InvalidArgument);
        }

        let rp = self.vol.classify(path)?;
        match rp.kind {
            PathKind::ExistsAsFile | PathKind::InvalidNotDirs => {
                return Err(XipfsError::NotDirectory);
            }
            PathKind::ExistsAsEmptyDir => {}
            PathKind::ExistsAsNonemptyDir => return Err(XipfsError::NotEmpty),
            PathKind::InvalidNotFound | PathKind::Creatable => {
                return Err(XipfsError::NotFound);
            }
        }

        self.sync_remove(rp.witness.expect("existing dir has a witness"))?;
        self.preserve_parent(&rp, 1)?;
        Ok(())
    }

    fn rename0(&mut self, from: &str, to: &str) -> Result<()> {
        check_name(from)?;
        check_name(to)?;

        let mut resolved = self.vol.classify_many(&[from, to])?;
        let to_rp = resolved.pop().expect("two resolved paths");
        let from_rp = resolved.pop().expect("two resolved paths");

        // Kept current across the removals below so the final sentinel
        // bookkeeping never touches a stale offset.
        let mut to_witness = to_rp.witness;

        let renamed = match from_rp.kind {
            PathKind::ExistsAsFile => {
                let src = from_rp.witness.expect("file witness");
                match to_rp.kind {
                    PathKind::ExistsAsFile => {
                        let dst = to_rp.witness.expect("file witness");
                        if src == dst {
                            return Ok(());
                        }
                        // POSIX replace: drop the target, then take its
                        // name; the source record may have shifted.
                        let displacement = self.sync_remove(dst)?;
                        to_witness = None;
                        let src = if src > dst {
                            RecordOffset(src.0 - displacement)
                        } else {
                            src
                        };
                        self.vol.rename_record(src, to_rp.path())?;
                        1
                    }
                    PathKind::ExistsAsEmptyDir | PathKind::ExistsAsNonemptyDir => {
                        return Err(XipfsError::IsDirectory);
                    }
                    PathKind::InvalidNotDirs => return Err(XipfsError::NotDirectory),
                    PathKind::InvalidNotFound => return Err(XipfsError::NotFound),
                    PathKind::Creatable => {
                        if to_rp.ends_with_slash() {
                            return Err(XipfsError::NotDirectory);
                        }
                        self.vol.rename_record(src, to_rp.path())?;
                        1
                    }
                }
            }
            PathKind::ExistsAsEmptyDir => {
                let src = from_rp.witness.expect("dir witness");
                match to_rp.kind {
                    PathKind::ExistsAsFile => return Err(XipfsError::NotDirectory),
                    PathKind::ExistsAsEmptyDir => {
                        let dst = to_rp.witness.expect("dir witness");
                        if src == dst {
                            return Ok(());
                        }
                        // The target sentinel already carries the name;
                        // the source sentinel simply goes away.
                        let displacement = self.sync_remove(src)?;
                        if let Some(w) = to_witness {
                            if w > src {
                                to_witness = Some(RecordOffset(w.0 - displacement));
                            }
                        }
                        1
                    }
                    PathKind::ExistsAsNonemptyDir => return Err(XipfsError::NotEmpty),
                    PathKind::InvalidNotDirs => return Err(XipfsError::NotDirectory),
                    PathKind::InvalidNotFound => return Err(XipfsError::NotFound),
                    PathKind::Creatable => {
                        let target = with_trailing_slash(to_rp.path())?;
                        if target.starts_with(from_rp.path()) {
                            return Err(XipfsError::InvalidArgument);
                        }
                        self.vol.rename_record(src, &target)?;
                        1
                    }
                }
            }
            PathKind::ExistsAsNonemptyDir => match to_rp.kind {
                PathKind::ExistsAsFile => return Err(XipfsError::NotDirectory),
                PathKind::ExistsAsEmptyDir => {
                    if to_rp.path().starts_with(from_rp.path()) {
                        return Err(XipfsError::InvalidArgument);
                    }
                    let count = self.vol.rename_all(from_rp.path(), to_rp.path())?;
                    // The moved-in entries supersede the target's
                    // empty-dir sentinel.
                    let dst = to_rp.witness.expect("dir witness");
                    self.sync_remove(dst)?;
                    to_witness = None;
                    count
                }
                PathKind::ExistsAsNonemptyDir => return Err(XipfsError::NotEmpty),
                PathKind::InvalidNotDirs => return Err(XipfsError::NotDirectory),
                PathKind::InvalidNotFound => return Err(XipfsError::NotFound),
                PathKind::Creatable => {
                    let target = with_trailing_slash(to_rp.path())?;
                    if target.starts_with(from_rp.path()) {
                        return Err(XipfsError::InvalidArgument);
                    }
                    self.vol.rename_all(from_rp.path(), &target)?
                }
            },
            PathKind::InvalidNotDirs => return Err(XipfsError::NotDirectory),
            PathKind::InvalidNotFound | PathKind::Creatable => {
                return Err(XipfsError::NotFound);
            }
        };

        if from_rp.dirname != to_rp.dirname {
            self.preserve_parent(&from_rp, renamed)?;
        }

        if let Some(witness) = to_witness {
            if self.vol.record_path(witness)? == to_rp.dirname {
                self.sync_remove(witness)?;
            }
        }

        Ok(())
    }

    fn opendir0(&self, path: &str) -> Result<Dir> {
        check_name(path)?;

        if self.vol.head()?.is_none() {
            if path == "/" {
                return Ok(Dir {
                    dirname: "/".to_owned(),
                    cursor: None,
                });
            }
            return Err(XipfsError::NotFound);
        }

        if path == "/" {
            return Ok(Dir {
                dirname: "/".to_owned(),
                cursor: self.vol.head()?,
            });
        }

        let rp = self.vol.classify(path)?;
        match rp.kind {
            PathKind::ExistsAsFile | PathKind::InvalidNotDirs => Err(XipfsError::NotDirectory),
            PathKind::ExistsAsEmptyDir | PathKind::ExistsAsNonemptyDir => Ok(Dir {
                dirname: rp.path().to_owned(),
                cursor: self.vol.head()?,
            }),
            PathKind::InvalidNotFound | PathKind::Creatable => Err(XipfsError::NotFound),
        }
    }

    /// Whether an earlier record in the list already produced `entry`
    /// for this directory.
    fn entry_already_listed(&self, dirname: &str, entry: &str, upto: RecordOffset) -> Result<bool> {
        for rec in self.vol.files() {
            let rec = rec?;
            if rec == upto {
                break;
            }
            let path = self.vol.record_path(rec)?;
            if let Some(rest) = path.strip_prefix(dirname) {
                if rest.is_empty() {
                    continue;
                }
                let candidate = match rest.find('/') {
                    Some(i) => &rest[..=i],
                    None => rest,
                };
                if candidate == entry {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn readdir0(&self, dir: &mut Dir) -> Result<Option<DirEntry>> {
        while let Some(rec) = dir.cursor {
            self.vol.record_check(rec)?;
            let path = self.vol.record_path(rec)?;
            dir.cursor = self.vol.next_of(rec)?;

            let Some(rest) = path.strip_prefix(&dir.dirname) else {
                continue;
            };
            if rest.is_empty() {
                // The directory's own sentinel is not an entry.
                continue;
            }
            let entry = match rest.find('/') {
                Some(i) => &rest[..=i],
                None => rest,
            };
            if !self.entry_already_listed(&dir.dirname, entry, rec)? {
                return Ok(Some(DirEntry {
                    name: entry.to_owned(),
                }));
            }
        }
        Ok(None)
    }

    fn execv0(
        &mut self,
        path: &str,
        argv: &[&str],
        launcher: &mut dyn BinaryLauncher,
        host: &mut dyn SyscallHost,
    ) -> Result<i32> {
        check_name(path)?;
        if path == "/" {
            return Err(XipfsError::IsDirectory);
        }

        let rp = self.vol.classify(path)?;
        match rp.kind {
            PathKind::ExistsAsFile => {}
            PathKind::ExistsAsEmptyDir | PathKind::ExistsAsNonemptyDir => {
                return Err(XipfsError::IsDirectory);
            }
            PathKind::InvalidNotDirs => return Err(XipfsError::NotDirectory),
            PathKind::InvalidNotFound | PathKind::Creatable => {
                return Err(XipfsError::NotFound);
            }
        }

        let rec = rp.witness.expect("existing file has a witness");
        match self.vol.record_exec(rec)? {
            0 => return Err(XipfsError::AccessDenied),
            1 => {}
            _ => return Err(XipfsError::InvalidArgument),
        }

        // The binary executes in place; the image must be current.
        self.vol.flush()?;

        let size = self.vol.file_size(rec)? as usize;
        let reserved = self.vol.record_reserved(rec)? as usize;
        let abs = self.vol.mount().abs(rec);
        let bin_base = abs + HEADER_SIZE;
        let nvm_end = abs + reserved;

        let crt0 = Crt0Context {
            bin_base,
            nvm_start: bin_base + size,
            nvm_end,
        };
        let mut ctx = ExecContext::new(crt0, argv, host);
        let image = &self.vol.nvm().as_bytes()[bin_base..nvm_end];

        debug!(
            target: "xipfs::driver",
            event = "exec",
            path,
            argc = ctx.argc(),
            image_len = image.len()
        );
        launcher.launch(image, &mut ctx)
    }
}

impl<N: Nvm> Xipfs<N> {
    /// Bind a device and mount description. The description is
    /// validated here; list consistency is checked by [`Xipfs::mount`].
    pub fn new(nvm: N, mount: Mount) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(State {
                vol: Volume::new(nvm, mount)?,
                handles: [None; MAX_OPEN_FILES],
            }),
        })
    }

    /// Mount-time consistency check: the record list must traverse and
    /// everything past it must be erased.
    pub fn mount(&self) -> Result<()> {
        self.state
            .lock()
            .mount0()
            .inspect_err(|e| debug!(target: "xipfs::driver", op = "mount", error = %e))
    }

    /// Erase the whole mount range and invalidate open file handles.
    pub fn format(&self) -> Result<()> {
        self.state
            .lock()
            .format0()
            .inspect_err(|e| debug!(target: "xipfs::driver", op = "format", error = %e))
    }

    /// Create a file with an explicit reservation and exec flag.
    pub fn new_file(&self, path: &str, size: u32, exec: u32) -> Result<()> {
        self.state
            .lock()
            .new_file0(path, size, exec)
            .inspect_err(|e| debug!(target: "xipfs::driver", op = "new_file", path, error = %e))
    }

    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<Fd> {
        self.state
            .lock()
            .open0(path, flags)
            .inspect_err(|e| debug!(target: "xipfs::driver", op = "open", path, error = %e))
    }

    pub fn close(&self, fd: Fd) -> Result<()> {
        self.state.lock().close0(fd)
    }

    pub fn read(&self, fd: Fd, dest: &mut [u8]) -> Result<usize> {
        self.state.lock().read0(fd, dest)
    }

    pub fn write(&self, fd: Fd, src: &[u8]) -> Result<usize> {
        self.state.lock().write0(fd, src)
    }

    pub fn lseek(&self, fd: Fd, off: i64, whence: Whence) -> Result<i64> {
        self.state.lock().lseek0(fd, off, whence)
    }

    pub fn fsync(&self, fd: Fd) -> Result<()> {
        self.state.lock().fsync0(fd)
    }

    pub fn fstat(&self, fd: Fd) -> Result<FileStat> {
        self.state.lock().fstat0(fd)
    }

    pub fn stat(&self, path: &str) -> Result<FileStat> {
        self.state
            .lock()
            .stat0(path)
            .inspect_err(|e| debug!(target: "xipfs::driver", op = "stat", path, error = %e))
    }

    pub fn statvfs(&self, _path: &str) -> Result<VfsStat> {
        self.state.lock().statvfs0()
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        self.state
            .lock()
            .unlink0(path)
            .inspect_err(|e| debug!(target: "xipfs::driver", op = "unlink", path, error = %e))
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        self.state
            .lock()
            .mkdir0(path)
            .inspect_err(|e| debug!(target: "xipfs::driver", op = "mkdir", path, error = %e))
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        self.state
            .lock()
            .rmdir0(path)
            .inspect_err(|e| debug!(target: "xipfs::driver", op = "rmdir", path, error = %e))
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.state
            .lock()
            .rename0(from, to)
            .inspect_err(|e| debug!(target: "xipfs::driver", op = "rename", from, to, error = %e))
    }

    pub fn opendir(&self, path: &str) -> Result<Dir> {
        self.state
            .lock()
            .opendir0(path)
            .inspect_err(|e| debug!(target: "xipfs::driver", op = "opendir", path, error = %e))
    }

    pub fn readdir(&self, dir: &mut Dir) -> Result<Option<DirEntry>> {
        self.state.lock().readdir0(dir)
    }

    /// Directory streams hold no driver state; this exists for API
    /// symmetry with opendir.
    pub fn closedir(&self, _dir: Dir) -> Result<()> {
        Ok(())
    }

    /// Run an executable file. The driver prepares the execution
    /// context and hands control to the launcher; the global lock is
    /// held for the duration of the program.
    pub fn execv(
        &self,
        path: &str,
        argv: &[&str],
        launcher: &mut dyn BinaryLauncher,
        host: &mut dyn SyscallHost,
    ) -> Result<i32> {
        self.state
            .lock()
            .execv0(path, argv, launcher, host)
            .inspect_err(|e| debug!(target: "xipfs::driver", op = "execv", path, error = %e))
    }

    /// Flush staged state through to the device.
    pub fn sync(&self) -> Result<()> {
        self.state.lock().vol.sync()
    }

    /// Flush and hand the device back.
    pub fn unmount(self) -> Result<N> {
        self.state.into_inner().vol.unmount()
    }
}
