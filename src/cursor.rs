use crate::dirent::Dirent;
use crate::filesystem::Bcachefs;
use crate::resolve::resolve;
use crate::types::ROOT_INODE;
use crate::walk::Walk;
use crate::{Error, Result};

/// A stateful navigation handle over one open image: a current directory and
/// its normalized path. Cursors on the same image are independent.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    fs: &'a Bcachefs,
    inode: u64,
    path: String,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(fs: &'a Bcachefs) -> Self {
        Cursor {
            fs,
            inode: ROOT_INODE,
            path: "/".to_string(),
        }
    }

    /// The normalized absolute path of the current directory.
    pub fn pwd(&self) -> &str {
        &self.path
    }

    pub fn current_inode(&self) -> u64 {
        self.inode
    }

    /// Changes the current directory. On failure the cursor is untouched;
    /// on success both state fields are replaced together.
    pub fn cd(&mut self, path: &str) -> Result<()> {
        let dirent = resolve(self.fs.indices(), path, self.inode)?;
        if !dirent.is_dir() {
            return Err(Error::NotADirectory(path.to_string()));
        }
        let new_path = self
            .fs
            .indices()
            .path_of_dir(dirent.inode)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        self.inode = dirent.inode;
        self.path = new_path;
        Ok(())
    }

    /// Direct children of the current directory, in discovery order.
    pub fn ls(&self) -> Vec<Dirent> {
        self.fs.indices().children(self.inode).to_vec()
    }

    /// Direct children of a directory addressed relative to the cursor.
    pub fn ls_path(&self, path: &str) -> Result<Vec<Dirent>> {
        let dirent = self.find_dirent(path)?;
        if !dirent.is_dir() {
            return Err(Error::NotADirectory(path.to_string()));
        }
        Ok(self.fs.indices().children(dirent.inode).to_vec())
    }

    /// Resolves a path relative to the cursor without changing its state.
    pub fn find_dirent(&self, path: &str) -> Result<Dirent> {
        resolve(self.fs.indices(), path, self.inode)
    }

    /// Pre-order walk rooted at the current directory.
    pub fn walk(&self) -> Walk<'a> {
        Walk::new(self.fs.indices(), self.path.clone(), self.inode)
    }

    /// Pre-order walk rooted at a directory addressed relative to the cursor.
    pub fn walk_path(&self, path: &str) -> Result<Walk<'a>> {
        let dirent = self.find_dirent(path)?;
        if !dirent.is_dir() {
            return Err(Error::NotADirectory(path.to_string()));
        }
        let start = self
            .fs
            .indices()
            .path_of_dir(dirent.inode)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        Ok(Walk::new(self.fs.indices(), start, dirent.inode))
    }

    pub fn iter(&self) -> std::slice::Iter<'a, Dirent> {
        self.fs.indices().children(self.inode).iter()
    }
}

impl<'a, 'c> IntoIterator for &'c Cursor<'a> {
    type Item = &'a Dirent;
    type IntoIter = std::slice::Iter<'a, Dirent>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
