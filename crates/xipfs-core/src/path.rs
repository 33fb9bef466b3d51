//! Path classification over the flat file list.
//!
//! The list stores full paths only, so whether a textual name denotes a
//! file, an empty directory, a non-empty directory, an unreachable path
//! or a creatable slot has to be decided by comparing it against every
//! stored path. The decision procedure compares character by character,
//! finds the index of the first difference, and applies a fixed set of
//! predicates over the characters around that index. One list traversal
//! classifies any number of query paths.

use crate::volume::Volume;
use xipfs_error::{Result, XipfsError};
use xipfs_nvm::Nvm;
use xipfs_types::{PATH_MAX, RecordOffset};

use crate::layout::PATH_OFFSET;

/// What a queried path turned out to denote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// Not present, but every parent directory exists.
    Creatable,
    ExistsAsFile,
    ExistsAsEmptyDir,
    ExistsAsNonemptyDir,
    /// Some prefix component is a file, not a directory.
    InvalidNotDirs,
    /// A parent directory does not exist.
    InvalidNotFound,
}

/// A classified path plus the evidence that produced the decision.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    buf: [u8; PATH_MAX],
    len: usize,
    /// Index of the last slash that is not the trailing one.
    pub last_slash: usize,
    /// Directory component, trailing slash included.
    pub dirname: String,
    /// Final component, without slashes.
    pub basename: String,
    /// How many stored records track the parent directory prefix.
    pub parent_trackers: usize,
    /// The stored record that established the decision.
    pub witness: Option<RecordOffset>,
    pub kind: PathKind,
}

impl ResolvedPath {
    /// The queried path, normalized with a trailing slash when it was
    /// identified as a directory.
    #[must_use]
    pub fn path(&self) -> &str {
        // The buffer holds the validated ASCII input.
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }

    #[must_use]
    pub fn ends_with_slash(&self) -> bool {
        self.len > 0 && self.buf[self.len - 1] == b'/'
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.len == 1 && self.buf[0] == b'/'
    }

    fn init(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(XipfsError::EmptyPath);
        }
        if !path.starts_with('/') {
            return Err(XipfsError::InvalidArgument);
        }
        if path.len() >= PATH_MAX {
            return Err(XipfsError::PathTooLong);
        }

        let bytes = path.as_bytes();
        let mut buf = [0_u8; PATH_MAX];
        buf[..bytes.len()].copy_from_slice(bytes);

        let mut last_slash = 0;
        for (i, pair) in bytes.windows(2).enumerate() {
            if pair[0] == b'/' && pair[1] != 0 {
                last_slash = i;
            }
        }

        let dirname = if path == "/" {
            "/".to_owned()
        } else {
            path[..=last_slash].to_owned()
        };
        let basename = if path == "/" {
            "/".to_owned()
        } else {
            let tail = &path[last_slash + 1..];
            tail.trim_end_matches('/').to_owned()
        };

        Ok(Self {
            buf,
            len: bytes.len(),
            last_slash,
            dirname,
            basename,
            parent_trackers: 0,
            witness: None,
            kind: PathKind::InvalidNotFound,
        })
    }

    fn append_slash(&mut self) -> Result<()> {
        if self.ends_with_slash() {
            return Ok(());
        }
        if self.len == PATH_MAX - 1 {
            return Err(XipfsError::PathTooLong);
        }
        self.buf[self.len] = b'/';
        self.len += 1;
        Ok(())
    }
}

/// Index of the first differing character, or of the shared terminator.
fn first_difference(stored: &[u8; PATH_MAX], query: &[u8; PATH_MAX]) -> usize {
    let mut i = 0;
    while i < PATH_MAX {
        if stored[i] != query[i] || stored[i] == 0 {
            break;
        }
        i += 1;
    }
    i
}

fn neither_slash_nor_nul(c: u8) -> bool {
    c != b'/' && c != 0
}

/// Both paths end at `i` and neither final component is a directory:
/// the stored path is exactly the query.
fn exists_as_file(stored: &[u8; PATH_MAX], query: &[u8; PATH_MAX], i: usize) -> bool {
    i > 0
        && neither_slash_nor_nul(stored[i - 1])
        && stored[i] == 0
        && neither_slash_nor_nul(query[i - 1])
        && query[i] == 0
}

/// The stored path is the query itself with a trailing slash (either
/// written by the caller or implied).
fn exists_as_empty_dir(stored: &[u8; PATH_MAX], query: &[u8; PATH_MAX], i: usize) -> bool {
    let c0 = i > 0
        && stored[i - 1] == b'/'
        && stored[i] == 0
        && query[i - 1] == b'/'
        && query[i] == 0;
    let c1 = i > 0
        && i < PATH_MAX - 1
        && neither_slash_nor_nul(stored[i - 1])
        && stored[i] == b'/'
        && stored[i + 1] == 0
        && neither_slash_nor_nul(query[i - 1])
        && query[i] == 0;
    c0 || c1
}

/// The stored path continues below the query with at least one more
/// component: the query is a directory with content.
fn exists_as_nonempty_dir(stored: &[u8; PATH_MAX], query: &[u8; PATH_MAX], i: usize) -> bool {
    let c0 = i > 0
        && stored[i - 1] == b'/'
        && neither_slash_nor_nul(stored[i])
        && query[i - 1] == b'/'
        && query[i] == 0;
    let c1 = i > 0
        && i < PATH_MAX - 1
        && neither_slash_nor_nul(stored[i - 1])
        && stored[i] == b'/'
        && neither_slash_nor_nul(stored[i + 1])
        && neither_slash_nor_nul(query[i - 1])
        && query[i] == 0;
    c0 || c1
}

/// The stored path ends where the query continues with `/…`: a prefix
/// component of the query is an existing file.
fn invalid_because_not_dirs(stored: &[u8; PATH_MAX], query: &[u8; PATH_MAX], i: usize) -> bool {
    i > 0
        && i < PATH_MAX - 1
        && neither_slash_nor_nul(stored[i - 1])
        && stored[i] == 0
        && neither_slash_nor_nul(query[i - 1])
        && query[i] == b'/'
        && query[i + 1] != 0
        && query[i + 1] != b'/'
}

/// The stored path proves every component of the query's dirname exists.
fn creatable(stored: &[u8; PATH_MAX], query: &[u8; PATH_MAX], dirname_len: usize) -> bool {
    stored[..dirname_len] == query[..dirname_len]
}

impl<N: Nvm> Volume<N> {
    /// Classify one path against the current file list.
    pub fn classify(&self, path: &str) -> Result<ResolvedPath> {
        let mut many = self.classify_many(&[path])?;
        Ok(many.remove(0))
    }

    /// Classify several paths in a single list traversal.
    pub fn classify_many(&self, paths: &[&str]) -> Result<Vec<ResolvedPath>> {
        let mut resolved = paths
            .iter()
            .map(|path| ResolvedPath::init(path))
            .collect::<Result<Vec<_>>>()?;
        let mut undecided: Vec<bool> = vec![true; resolved.len()];

        let mut any_file = false;
        for rec in self.files() {
            let rec = rec?;
            any_file = true;

            let abs = self.mount.abs(rec) + PATH_OFFSET;
            let mut stored = [0_u8; PATH_MAX];
            stored.copy_from_slice(&self.nvm.as_bytes()[abs..abs + PATH_MAX]);

            for (rp, open) in resolved.iter_mut().zip(undecided.iter_mut()) {
                if stored[..rp.last_slash] == rp.buf[..rp.last_slash] {
                    rp.parent_trackers += 1;
                }
                if !*open {
                    continue;
                }

                let i = first_difference(&stored, &rp.buf);
                if i == PATH_MAX {
                    return Err(XipfsError::PathTooLong);
                }

                if exists_as_file(&stored, &rp.buf, i) {
                    rp.kind = PathKind::ExistsAsFile;
                    rp.witness = Some(rec);
                    *open = false;
                } else if exists_as_empty_dir(&stored, &rp.buf, i) {
                    rp.append_slash()?;
                    rp.kind = PathKind::ExistsAsEmptyDir;
                    rp.witness = Some(rec);
                    *open = false;
                } else if exists_as_nonempty_dir(&stored, &rp.buf, i) {
                    rp.append_slash()?;
                    rp.kind = PathKind::ExistsAsNonemptyDir;
                    rp.witness = Some(rec);
                    *open = false;
                } else if invalid_because_not_dirs(&stored, &rp.buf, i) {
                    rp.kind = PathKind::InvalidNotDirs;
                    rp.witness = Some(rec);
                    *open = false;
                } else if creatable(&stored, &rp.buf, rp.last_slash + 1) {
                    // A later record may still prove the path exists;
                    // keep looking, but remember the parent witness.
                    rp.kind = PathKind::Creatable;
                    rp.witness = Some(rec);
                }
            }
        }

        if !any_file {
            // No witness exists. Only the root is known to be present,
            // so exactly the paths whose parent is the root are
            // creatable.
            for rp in &mut resolved {
                if rp.last_slash == 0 && !rp.is_root() {
                    rp.kind = PathKind::Creatable;
                    rp.witness = None;
                }
            }
        }

        Ok(resolved)
    }
}
