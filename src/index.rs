use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::btree::{
    decode_dirent_record, decode_extent_record, decode_inode_record, BtreeIter, Geometry, Record,
};
use crate::dirent::Dirent;
use crate::types::{BtreeId, BtreeRoots, Inode, ROOT_INODE};
use crate::{Error, Result};

/// A contiguous run of file bytes and where they live in the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Extent {
    pub logical: u64,
    pub physical: u64,
    pub len: u64,
}

#[derive(Debug, Default)]
struct DirEntries {
    order: Vec<Dirent>,
    by_name: HashMap<String, usize>,
}

/// Directory chains deeper than this only occur in corrupt images.
const MAX_TREE_DEPTH: usize = 512;

/// The three read-only indices built once at open time, plus the namelist
/// derived from them. Never mutated afterwards.
#[derive(Debug)]
pub(crate) struct Indices {
    inodes: HashMap<u64, Inode>,
    children: HashMap<u64, DirEntries>,
    /// Directory inode -> (parent directory inode, name under the parent).
    dir_names: HashMap<u64, (u64, String)>,
    extents: HashMap<u64, Vec<Extent>>,
    namelist: Vec<String>,
}

impl Indices {
    /// Runs the three btree passes and assembles the indices. Any failure
    /// discards everything; there is no partially-usable result.
    pub fn build(image: &[u8], geom: Geometry, roots: BtreeRoots) -> Result<Indices> {
        let mut inodes = HashMap::new();
        for record in BtreeIter::new(image, geom, roots.get(BtreeId::Inodes), decode_inode_record)? {
            if let Record::Inode { inum, inode } = record? {
                inodes.insert(inum, Inode::new(inum, inode.size, inode.mode));
            }
        }

        let mut children: HashMap<u64, DirEntries> = HashMap::new();
        let mut dir_names = HashMap::new();
        for record in BtreeIter::new(image, geom, roots.get(BtreeId::Dirents), decode_dirent_record)? {
            if let Record::Dirent(dirent) = record? {
                if dirent.is_dir() {
                    dir_names.insert(dirent.inode, (dirent.parent_inode, dirent.name.clone()));
                }
                let entries = children.entry(dirent.parent_inode).or_default();
                match entries.by_name.entry(dirent.name.clone()) {
                    Entry::Occupied(slot) => entries.order[*slot.get()] = dirent,
                    Entry::Vacant(slot) => {
                        slot.insert(entries.order.len());
                        entries.order.push(dirent);
                    }
                }
            }
        }

        let mut extents: HashMap<u64, Vec<Extent>> = HashMap::new();
        for record in BtreeIter::new(image, geom, roots.get(BtreeId::Extents), decode_extent_record)? {
            if let Record::Extent(extent) = record? {
                extents.entry(extent.inode).or_default().push(Extent {
                    logical: extent.logical,
                    physical: extent.physical,
                    len: extent.len,
                });
            }
        }

        for (inum, list) in &mut extents {
            list.sort_by_key(|e| e.logical);
            for pair in list.windows(2) {
                if pair[0].logical + pair[0].len > pair[1].logical {
                    return Err(Error::CorruptImage(format!(
                        "overlapping extents for inode {inum}"
                    )));
                }
            }
            for extent in list.iter() {
                if extent.physical + extent.len > image.len() as u64 {
                    return Err(Error::TruncatedImage {
                        expected: extent.physical + extent.len,
                        actual: image.len() as u64,
                    });
                }
            }
        }

        // Every non-root parent must itself be known as a directory.
        for &parent in children.keys() {
            if parent == ROOT_INODE {
                continue;
            }
            if !dir_names.contains_key(&parent) {
                return Err(Error::CorruptImage(format!(
                    "dirents under unknown directory inode {parent}"
                )));
            }
            if let Some(inode) = inodes.get(&parent) {
                if !inode.is_dir() {
                    return Err(Error::CorruptImage(format!(
                        "dirents under non-directory inode {parent}"
                    )));
                }
            }
        }

        let namelist = build_namelist(&children)?;

        debug!(
            inodes = inodes.len(),
            directories = children.len(),
            extents = extents.len(),
            files = namelist.len(),
            "indices built"
        );

        Ok(Indices {
            inodes,
            children,
            dir_names,
            extents,
            namelist,
        })
    }

    pub fn inode(&self, inum: u64) -> Option<&Inode> {
        self.inodes.get(&inum)
    }

    /// Direct children of a directory, in discovery order.
    pub fn children(&self, dir: u64) -> &[Dirent] {
        self.children.get(&dir).map_or(&[], |e| &e.order)
    }

    pub fn lookup(&self, dir: u64, name: &str) -> Option<&Dirent> {
        let entries = self.children.get(&dir)?;
        entries.by_name.get(name).map(|&i| &entries.order[i])
    }

    /// Parent directory of a directory inode; the root is its own parent.
    pub fn parent_of(&self, dir: u64) -> Option<u64> {
        if dir == ROOT_INODE {
            return Some(ROOT_INODE);
        }
        self.dir_names.get(&dir).map(|&(parent, _)| parent)
    }

    /// The dirent naming a directory inode, synthetic for the root.
    pub fn dirent_for_dir(&self, dir: u64) -> Option<Dirent> {
        if dir == ROOT_INODE {
            return Some(Dirent::root());
        }
        let (parent, name) = self.dir_names.get(&dir)?;
        self.lookup(*parent, name).cloned()
    }

    /// Absolute, normalized path of a directory inode.
    pub fn path_of_dir(&self, dir: u64) -> Option<String> {
        let mut segments = Vec::new();
        let mut cur = dir;
        for _ in 0..=self.dir_names.len() {
            if cur == ROOT_INODE {
                segments.reverse();
                return Some(format!("/{}", segments.join("/")));
            }
            let (parent, name) = self.dir_names.get(&cur)?;
            segments.push(name.as_str());
            cur = *parent;
        }
        None
    }

    pub fn extents(&self, inum: u64) -> &[Extent] {
        self.extents.get(&inum).map_or(&[], |e| e.as_slice())
    }

    /// Full paths of all regular files, in depth-first discovery order.
    pub fn namelist(&self) -> &[String] {
        &self.namelist
    }
}

fn build_namelist(children: &HashMap<u64, DirEntries>) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut visited = HashSet::from([ROOT_INODE]);
    namelist_dfs(children, ROOT_INODE, "", 0, &mut visited, &mut out)?;
    Ok(out)
}

fn namelist_dfs(
    children: &HashMap<u64, DirEntries>,
    dir: u64,
    prefix: &str,
    depth: usize,
    visited: &mut HashSet<u64>,
    out: &mut Vec<String>,
) -> Result<()> {
    if depth > MAX_TREE_DEPTH {
        return Err(Error::CorruptImage("directory tree too deep".to_string()));
    }
    let Some(entries) = children.get(&dir) else {
        return Ok(());
    };
    for dirent in &entries.order {
        let path = if prefix.is_empty() {
            dirent.name.clone()
        } else {
            format!("{prefix}/{}", dirent.name)
        };
        if dirent.is_file() {
            out.push(path);
        } else if dirent.is_dir() {
            if !visited.insert(dirent.inode) {
                return Err(Error::CorruptImage(format!(
                    "directory inode {} linked twice",
                    dirent.inode
                )));
            }
            namelist_dfs(children, dirent.inode, &path, depth + 1, visited, out)?;
        }
    }
    Ok(())
}
