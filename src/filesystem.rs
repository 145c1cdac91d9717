use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use memmap2::Mmap;
use tracing::{debug, trace};

use crate::btree::Geometry;
use crate::cursor::Cursor;
use crate::dirent::Dirent;
use crate::file::File;
use crate::index::Indices;
use crate::resolve::resolve;
use crate::types::{find_btree_roots, Inode, Superblock, ROOT_INODE};
use crate::walk::Walk;
use crate::{Error, Result};

/// An open bcachefs image.
///
/// Opening parses the superblock, walks the inode, dirent and extent btrees
/// once, and keeps the resulting indices for the lifetime of the handle;
/// everything afterwards is served from them plus positioned reads against
/// the memory-mapped image. The indices are immutable, so `Bcachefs` is
/// `Clone + Send + Sync` and cheap to hand to worker threads; independent
/// worker processes just open the same path again.
///
/// # Example
///
/// ```no_run
/// use std::io::Read;
/// use bcachefs_rs::Bcachefs;
///
/// let fs = Bcachefs::open("image.img").unwrap();
/// let mut file = fs.open_file("dir/subdir/file2").unwrap();
/// let mut content = Vec::new();
/// file.read_to_end(&mut content).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct Bcachefs {
    mmap: Arc<Mmap>,
    superblock: Arc<Superblock>,
    indices: Arc<Indices>,
    path: PathBuf,
}

impl Bcachefs {
    /// Opens an image read-only and builds the in-memory indices.
    ///
    /// # Errors
    ///
    /// Fails with `CorruptImage`, `UnsupportedVersion` or `TruncatedImage`
    /// if the image cannot be decoded; nothing partially-open is returned.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;

        let superblock = Superblock::read(&mmap)?;
        let geom = Geometry::from_superblock(&superblock);
        let roots = find_btree_roots(&mmap, &superblock)?;
        let indices = Indices::build(&mmap, geom, roots)?;

        debug!(
            path = %path.display(),
            version = superblock.version,
            block_bytes = geom.block_bytes,
            node_bytes = geom.btree_node_bytes,
            "opened bcachefs image"
        );

        Ok(Bcachefs {
            mmap: Arc::new(mmap),
            superblock: Arc::new(superblock),
            indices: Arc::new(indices),
            path: path.to_path_buf(),
        })
    }

    /// Closes the image. Open [`File`] handles keep the backing mmap alive
    /// until the last of them is dropped.
    pub fn close(self) {}

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the backing image in bytes.
    pub fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub(crate) fn indices(&self) -> &Indices {
        &self.indices
    }

    /// Full paths of all regular files, in depth-first discovery order.
    /// The order is deterministic for a given image but not sorted.
    pub fn namelist(&self) -> &[String] {
        self.indices.namelist()
    }

    /// Inode metadata by number, if the image has such an inode.
    pub fn inode(&self, inum: u64) -> Option<Inode> {
        self.indices.inode(inum).copied()
    }

    /// Resolves a path to its directory entry. `"/"` always resolves to the
    /// synthetic root entry.
    pub fn find_dirent(&self, path: &str) -> Result<Dirent> {
        resolve(&self.indices, path, ROOT_INODE)
    }

    /// Direct children of a directory, in discovery order.
    pub fn ls(&self, path: &str) -> Result<Vec<Dirent>> {
        let dirent = self.find_dirent(path)?;
        if !dirent.is_dir() {
            return Err(Error::NotADirectory(path.to_string()));
        }
        Ok(self.indices.children(dirent.inode).to_vec())
    }

    pub fn ls_root(&self) -> Vec<Dirent> {
        self.indices.children(ROOT_INODE).to_vec()
    }

    /// Lazy pre-order walk of the directory tree rooted at `path`.
    pub fn walk(&self, path: &str) -> Result<Walk<'_>> {
        let dirent = self.find_dirent(path)?;
        if !dirent.is_dir() {
            return Err(Error::NotADirectory(path.to_string()));
        }
        let start = self
            .indices
            .path_of_dir(dirent.inode)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        Ok(Walk::new(&self.indices, start, dirent.inode))
    }

    /// Opens a regular file by path.
    pub fn open_file(&self, path: &str) -> Result<File> {
        let dirent = self.find_dirent(path)?;
        if dirent.is_dir() {
            return Err(Error::IsADirectory(path.to_string()));
        }
        self.open_file_inode(dirent.inode)
    }

    /// Opens a regular file by inode number.
    pub fn open_file_inode(&self, inum: u64) -> Result<File> {
        let inode = self
            .indices
            .inode(inum)
            .ok_or_else(|| Error::NotFound(format!("inode {inum}")))?;
        if inode.is_dir() {
            return Err(Error::IsADirectory(format!("inode {inum}")));
        }
        if inode.is_symlink() {
            return Err(Error::Unsupported("reading symlinks".to_string()));
        }
        trace!(inum, size = inode.size(), "opening file");
        Ok(File::new(
            Arc::clone(&self.mmap),
            self.indices.extents(inum).to_vec(),
            inum,
            inode.size(),
        ))
    }

    /// Reads a whole file by path.
    pub fn read_file(&self, path: &str) -> Result<Bytes> {
        read_all(self.open_file(path)?)
    }

    /// Reads a whole file by inode number.
    pub fn read_file_inode(&self, inum: u64) -> Result<Bytes> {
        read_all(self.open_file_inode(inum)?)
    }

    /// A cursor positioned at the root directory.
    pub fn cd(&self) -> Cursor<'_> {
        Cursor::new(self)
    }

    /// A cursor positioned at `path`.
    pub fn cd_path(&self, path: &str) -> Result<Cursor<'_>> {
        let mut cursor = self.cd();
        cursor.cd(path)?;
        Ok(cursor)
    }
}

fn read_all(file: File) -> Result<Bytes> {
    let mut buf = vec![0u8; file.size() as usize];
    file.read_at(&mut buf, 0);
    Ok(Bytes::from(buf))
}
