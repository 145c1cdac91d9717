use crate::dirent::Dirent;
use crate::index::Indices;
use crate::types::ROOT_INODE;
use crate::{Error, Result};

/// Resolves a slash-separated path to a dirent, starting from `base` (the
/// root for absolute paths).
///
/// `.` is a no-op, `..` moves to the parent (the root is its own parent),
/// empty segments are ignored, and names match byte for byte.
pub(crate) fn resolve(indices: &Indices, path: &str, base: u64) -> Result<Dirent> {
    let mut cur = if path.starts_with('/') { ROOT_INODE } else { base };
    let mut last: Option<Dirent> = None;

    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if let Some(dirent) = &last {
            if !dirent.is_dir() {
                return Err(Error::NotADirectory(path.to_string()));
            }
        }
        match segment {
            "." => {}
            ".." => {
                cur = indices
                    .parent_of(cur)
                    .ok_or_else(|| Error::NotFound(path.to_string()))?;
                last = None;
            }
            name => {
                let dirent = indices
                    .lookup(cur, name)
                    .ok_or_else(|| Error::NotFound(path.to_string()))?;
                cur = dirent.inode;
                last = Some(dirent.clone());
            }
        }
    }

    match last {
        Some(dirent) => Ok(dirent),
        // The path named a directory we are already standing in ("/", ".",
        // a ".." chain); synthesize its own entry.
        None => indices
            .dirent_for_dir(cur)
            .ok_or_else(|| Error::NotFound(path.to_string())),
    }
}
