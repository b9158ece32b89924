//! Path tokenizing and resolution.
//!
//! Paths are tokenized over plain `&str` rather than a NUL-terminated
//! `CStr`, since this crate's paths never cross a user/kernel boundary and
//! there's no byte buffer to tokenize in place. Resolution itself follows
//! a two-pass dir-then-basename split.

use std::sync::Arc;

use crate::directory;
use crate::error::{FsError, FsResult};
use crate::inode::{FileType, Inode};
use crate::param::{NAME_MAX, ROOT_DIR_SECTOR};
use crate::FileSystem;

/// Iterates the `/`-separated components of a path, rejecting any component
/// longer than `NAME_MAX` as soon as it's reached.
pub struct Components<'a> {
    rest: &'a str,
}

impl<'a> Iterator for Components<'a> {
    type Item = FsResult<&'a str>;

    fn next(&mut self) -> Option<Self::Item> {
        let trimmed = self.rest.trim_start_matches('/');
        if trimmed.is_empty() {
            self.rest = trimmed;
            return None;
        }
        let end = trimmed.find('/').unwrap_or(trimmed.len());
        let (name, rest) = trimmed.split_at(end);
        self.rest = rest;
        if name.len() > NAME_MAX {
            Some(Err(FsError::InvalidName))
        } else {
            Some(Ok(name))
        }
    }
}

pub fn components(path: &str) -> Components<'_> {
    Components { rest: path }
}

/// The final component of `path`, or `""` if `path` is empty or names only
/// directories (e.g. `"a/b/"` or `"/"`).
pub fn basename(path: &str) -> FsResult<&str> {
    let mut last = "";
    for component in components(path) {
        last = component?;
    }
    Ok(last)
}

/// Resolves every component but the last, starting at the root for an
/// absolute path and at `cwd` for a relative one. Returns the open, already
/// reopened directory inode the caller is responsible for closing.
pub fn resolve_parent_dir(fs: &FileSystem, cwd: Option<&Arc<Inode>>, path: &str) -> FsResult<Arc<Inode>> {
    let base = basename(path)?;
    let dir_part = &path[..path.len() - base.len()];

    let mut current = if path.starts_with('/') || cwd.is_none() {
        fs.inodes().open(ROOT_DIR_SECTOR)
    } else {
        cwd.unwrap().reopen()
    };

    for component in components(dir_part) {
        let name = component?;
        let next_sector = match directory::lookup(&current, fs.cache(), name) {
            Ok(sector) => sector,
            Err(e) => {
                fs.inodes().close(&current, fs.cache(), fs.freemap());
                return Err(e);
            }
        };
        let next = fs.inodes().open(next_sector);
        if next.file_type(fs.cache()) != FileType::Directory {
            fs.inodes().close(&current, fs.cache(), fs.freemap());
            fs.inodes().close(&next, fs.cache(), fs.freemap());
            return Err(FsError::NotFound);
        }
        fs.inodes().close(&current, fs.cache(), fs.freemap());
        current = next;
    }
    Ok(current)
}

/// Resolves the full path to an inode. Equivalent to resolving the parent
/// directory and then looking up the basename inside it, except for the
/// empty path (which names `cwd`, or the root if there is none) and `"/"`
/// (which always names the root).
pub fn resolve(fs: &FileSystem, cwd: Option<&Arc<Inode>>, path: &str) -> FsResult<Arc<Inode>> {
    let base = basename(path)?;
    if base.is_empty() {
        return Ok(match cwd {
            Some(cwd) if !path.starts_with('/') => cwd.reopen(),
            _ => fs.inodes().open(ROOT_DIR_SECTOR),
        });
    }

    let parent = resolve_parent_dir(fs, cwd, path)?;
    let sector = match directory::lookup(&parent, fs.cache(), base) {
        Ok(sector) => sector,
        Err(e) => {
            fs.inodes().close(&parent, fs.cache(), fs.freemap());
            return Err(e);
        }
    };
    fs.inodes().close(&parent, fs.cache(), fs.freemap());
    Ok(fs.inodes().open(sector))
}

/// Resolves `path` to its parent directory, already open, and hands back
/// its basename too, for callers that are about to add or remove an entry
/// in that directory (`create`, `mkdir`, `remove`).
pub fn resolve_parent_and_name<'a>(
    fs: &FileSystem,
    cwd: Option<&Arc<Inode>>,
    path: &'a str,
) -> FsResult<(Arc<Inode>, &'a str)> {
    let base = basename(path)?;
    if base.is_empty() {
        return Err(FsError::InvalidName);
    }
    let parent = resolve_parent_dir(fs, cwd, path)?;
    Ok((parent, base))
}

pub(crate) fn close(fs: &FileSystem, inode: &Arc<Inode>) {
    fs.inodes().close(inode, fs.cache(), fs.freemap());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_splits_and_rejects_long_names() {
        let parts: FsResult<Vec<&str>> = components("/a/bb/ccc").collect();
        assert_eq!(parts.unwrap(), vec!["a", "bb", "ccc"]);

        let too_long = "x".repeat(NAME_MAX + 1);
        let path = format!("/{}", too_long);
        let parts: FsResult<Vec<&str>> = components(&path).collect();
        assert_eq!(parts, Err(FsError::InvalidName));
    }

    #[test]
    fn basename_of_various_paths() {
        assert_eq!(basename("/a/b/c").unwrap(), "c");
        assert_eq!(basename("c").unwrap(), "c");
        assert_eq!(basename("/").unwrap(), "");
        assert_eq!(basename("").unwrap(), "");
        assert_eq!(basename("/a/b/").unwrap(), "b");
    }

    use proptest::prelude::*;

    proptest! {
        /// Invariant 7 (path resolution is pure): resolving the same path
        /// against the same, unchanging file-system state twice yields the
        /// same inumber both times, regardless of how many unrelated
        /// top-level directories exist alongside the one being resolved.
        #[test]
        fn resolving_a_path_twice_is_pure(
            sibling_count in 0usize..6,
            target_idx in 0usize..6,
        ) {
            use crate::device::MemDevice;
            use crate::process::Process;
            use crate::FileSystem;

            let fs = FileSystem::format(Box::new(MemDevice::new(512))).unwrap();
            let proc = Process::new();
            let target_idx = target_idx % (sibling_count + 1);

            let mut names = Vec::new();
            for i in 0..=sibling_count {
                let name = format!("/d{}", i);
                proc.mkdir(&fs, &name).unwrap();
                names.push(name);
            }

            let target = &names[target_idx];
            let first = resolve(&fs, None, target).unwrap();
            let first_inumber = first.inumber();
            close(&fs, &first);

            let second = resolve(&fs, None, target).unwrap();
            let second_inumber = second.inumber();
            close(&fs, &second);

            prop_assert_eq!(first_inumber, second_inumber);
        }
    }
}
