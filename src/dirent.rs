use std::fmt;

use crate::types::ROOT_INODE;
use crate::{Error, Result};

/// Directory entry file types, the DT_* constants of the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirentType {
    Unknown = 0,
    Fifo = 1,
    CharacterDevice = 2,
    Directory = 4,
    BlockDevice = 6,
    RegularFile = 8,
    Symlink = 10,
    Socket = 12,
}

impl DirentType {
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory)
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::RegularFile)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, Self::Symlink)
    }
}

impl TryFrom<u8> for DirentType {
    type Error = Error;

    fn try_from(x: u8) -> Result<Self> {
        use DirentType::*;
        match x {
            0 => Ok(Unknown),
            1 => Ok(Fifo),
            2 => Ok(CharacterDevice),
            4 => Ok(Directory),
            6 => Ok(BlockDevice),
            8 => Ok(RegularFile),
            10 => Ok(Symlink),
            12 => Ok(Socket),
            x => Err(Error::CorruptImage(format!("invalid dirent type: {x}"))),
        }
    }
}

/// A named link from a parent directory inode to a child inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub parent_inode: u64,
    pub inode: u64,
    pub kind: DirentType,
    pub name: String,
}

impl Dirent {
    /// The synthetic root entry: the root directory is its own dirent, named
    /// "/", with parent inode 0.
    pub fn root() -> Dirent {
        Dirent {
            parent_inode: 0,
            inode: ROOT_INODE,
            kind: DirentType::Directory,
            name: "/".to_string(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }
}

impl fmt::Display for Dirent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Decodes a dirent value: child inode, type byte, then the NUL-padded name.
pub(crate) fn parse_dirent_value(parent_inode: u64, value: &[u8]) -> Result<Dirent> {
    const FIXED: usize = 9;
    if value.len() < FIXED {
        return Err(Error::CorruptImage("dirent value too short".to_string()));
    }
    let inode = u64::from_le_bytes(value[..8].try_into().unwrap());
    let kind = DirentType::try_from(value[8])?;

    let name_bytes = &value[FIXED..];
    let name_end = name_bytes
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |i| i + 1);
    let name = String::from_utf8_lossy(&name_bytes[..name_end]).into_owned();
    if name.is_empty() {
        return Err(Error::CorruptImage("empty dirent name".to_string()));
    }

    Ok(Dirent {
        parent_inode,
        inode,
        kind,
        name,
    })
}
