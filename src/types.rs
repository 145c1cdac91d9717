use std::io::Cursor;

use binrw::BinRead;
use rustix::fs::FileType;

use crate::traits::ReadCursorExt;
use crate::{Error, Result};

pub const SECTOR_SIZE: u64 = 512;
/// The superblock lives at sector 8 of the image.
pub const SUPERBLOCK_OFFSET: u64 = 8 * SECTOR_SIZE;
pub const SUPERBLOCK_BYTES: u64 = 752;

pub const BCACHE_MAGIC: [u8; 16] = [
    0xc6, 0x85, 0x73, 0xf6, 0x4e, 0x1a, 0x45, 0xca, 0x82, 0x65, 0xf5, 0x7f, 0x48, 0xba, 0x6d, 0x81,
];

pub const METADATA_VERSION_MIN: u16 = 9;
pub const METADATA_VERSION_MAX: u16 = 26;

/// Inode number of the root directory.
pub const ROOT_INODE: u64 = 4096;

/// Every btree node's magic is the first 8 bytes of the superblock uuid
/// xored with this constant.
pub const BSET_MAGIC_XOR: u64 = 0x90135c78b99e07f5;

pub const BTREE_NODE_HEADER_BYTES: usize = 136;
pub const BSET_HEADER_BYTES: usize = 24;
pub const BKEY_BYTES: usize = 40;
pub const BKEY_U64S: u8 = 5;
pub const CSUM_BYTES: usize = 16;

pub const KEY_FORMAT_LOCAL_BTREE: u8 = 0;
pub const KEY_FORMAT_CURRENT: u8 = 1;

pub const KEY_TYPE_DELETED: u8 = 0;
pub const KEY_TYPE_WHITEOUT: u8 = 1;
pub const KEY_TYPE_HASH_WHITEOUT: u8 = 4;
pub const KEY_TYPE_EXTENT: u8 = 6;
pub const KEY_TYPE_INODE: u8 = 8;
pub const KEY_TYPE_DIRENT: u8 = 10;
pub const KEY_TYPE_INLINE_DATA: u8 = 17;
pub const KEY_TYPE_BTREE_PTR_V2: u8 = 18;

pub const SB_FIELD_CLEAN: u32 = 6;
pub const JSET_ENTRY_BTREE_ROOT: u8 = 1;

/// Inode values carry a varint field count in bits 24..31 of bi_flags and
/// the new-varint marker in bit 31.
pub const INODE_FLAG_NEW_VARINT: u32 = 1 << 31;
pub const INODE_NR_FIELDS_SHIFT: u32 = 24;
pub const INODE_NR_FIELDS_MASK: u32 = 0x7f;

/// Number of leading varint fields (the four 96-bit timestamps, two varints
/// each) stored before bi_size in an inode value.
const INODE_FIELDS_BEFORE_SIZE: usize = 8;

#[derive(Debug, Clone, Copy)]
pub enum BtreeId {
    Extents = 0,
    Inodes = 1,
    Dirents = 2,
}

#[repr(C)]
#[derive(Debug, Clone, BinRead)]
#[br(little)]
pub struct Superblock {
    pub csum: [u8; 16],
    pub version: u16,
    pub version_min: u16,
    pub pad: [u8; 4],
    pub magic: [u8; 16],
    pub uuid: [u8; 16],
    pub user_uuid: [u8; 16],
    pub label: [u8; 32],
    pub offset: u64,
    pub seq: u64,
    pub block_size: u16,
    pub dev_idx: u8,
    pub nr_devices: u8,
    pub u64s: u32,
    pub time_base_lo: u64,
    pub time_base_hi: u32,
    pub time_precision: u32,
    pub flags: [u64; 8],
    pub features: [u64; 2],
    pub compat: [u64; 2],
    pub layout: [u8; 512],
}

impl Superblock {
    /// Parses and validates the superblock header. Nothing drawn from the
    /// header is trusted before magic, version and bounds have been checked.
    pub fn read(image: &[u8]) -> Result<Self> {
        let header_end = SUPERBLOCK_OFFSET + SUPERBLOCK_BYTES;
        if (image.len() as u64) < header_end {
            return Err(Error::TruncatedImage {
                expected: header_end,
                actual: image.len() as u64,
            });
        }

        let mut cursor = image
            .read_cursor(SUPERBLOCK_OFFSET as usize)
            .ok_or_else(|| Error::CorruptImage("superblock out of range".to_string()))?;
        let sb = Superblock::read_le(&mut cursor)?;

        if sb.magic != BCACHE_MAGIC {
            return Err(Error::CorruptImage(format!(
                "invalid magic: {:02x?}",
                sb.magic
            )));
        }
        if !(METADATA_VERSION_MIN..=METADATA_VERSION_MAX).contains(&sb.version) {
            return Err(Error::UnsupportedVersion(sb.version));
        }
        if sb.block_size == 0 {
            return Err(Error::CorruptImage("zero block size".to_string()));
        }
        if sb.btree_node_bytes() == 0 {
            return Err(Error::CorruptImage("zero btree node size".to_string()));
        }

        let fields_end = header_end + u64::from(sb.u64s) * 8;
        if (image.len() as u64) < fields_end {
            return Err(Error::TruncatedImage {
                expected: fields_end,
                actual: image.len() as u64,
            });
        }

        Ok(sb)
    }

    pub fn block_bytes(&self) -> u64 {
        u64::from(self.block_size) * SECTOR_SIZE
    }

    /// Btree node size in bytes, stored in bits 12..28 of flags[0] as a
    /// sector count.
    pub fn btree_node_bytes(&self) -> u64 {
        flag_bits(self.flags[0], 12, 28) * SECTOR_SIZE
    }

    /// Expected magic of every btree node in this filesystem.
    pub fn bset_magic(&self) -> u64 {
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&self.uuid[..8]);
        u64::from_le_bytes(seed) ^ BSET_MAGIC_XOR
    }
}

/// Extracts bits [first, last) of a superblock flag word.
pub fn flag_bits(field: u64, first: u32, last: u32) -> u64 {
    field << (64 - last) >> (64 - last + first)
}

#[derive(Debug, Clone, Copy, Default, BinRead)]
#[br(little)]
pub struct Bpos {
    pub snapshot: u32,
    pub offset: u64,
    pub inode: u64,
}

/// Unpacked 40-byte key, KEY_FORMAT_CURRENT.
#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
pub struct BkeyRaw {
    pub u64s: u8,
    pub format: u8,
    pub key_type: u8,
    pub pad: u8,
    pub version_lo: u64,
    pub version_hi: u32,
    pub size: u32,
    pub p: Bpos,
}

/// Per-node packing descriptor for KEY_FORMAT_LOCAL_BTREE keys.
#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
pub struct BkeyFormat {
    pub key_u64s: u8,
    pub nr_fields: u8,
    pub bits_per_field: [u8; 6],
    pub field_offset: [u64; 6],
}

pub const BKEY_FIELD_INODE: usize = 0;
pub const BKEY_FIELD_OFFSET: usize = 1;
pub const BKEY_FIELD_SNAPSHOT: usize = 2;
pub const BKEY_FIELD_SIZE: usize = 3;

#[derive(Debug, Clone, BinRead)]
#[br(little)]
pub struct BtreeNodeHeader {
    pub csum: [u8; 16],
    pub magic: u64,
    pub flags: u64,
    pub min_key: Bpos,
    pub max_key: Bpos,
    pub ptr: u64,
    pub format: BkeyFormat,
}

#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
pub struct BsetHeader {
    pub seq: u64,
    pub journal_seq: u64,
    pub flags: u32,
    pub version: u16,
    pub u64s: u16,
}

#[derive(Debug, Clone, BinRead)]
#[br(little)]
pub struct BtreePtrV2 {
    pub mem_ptr: u64,
    pub seq: u64,
    pub sectors_written: u16,
    pub flags: u16,
    pub min_key: Bpos,
}

pub const BTREE_PTR_V2_BYTES: usize = 40;

/// One extent pointer, a 64-bit little-endian bitfield:
/// type:1 cached:1 unused:1 reservation:1 offset:44 dev:8 gen:8.
#[derive(Debug, Clone, Copy)]
pub struct ExtentPtr(pub u64);

impl ExtentPtr {
    pub fn cached(self) -> bool {
        self.0 >> 1 & 1 != 0
    }

    pub fn unused(self) -> bool {
        self.0 >> 2 & 1 != 0
    }

    pub fn offset_sectors(self) -> u64 {
        self.0 << 16 >> 20
    }

    pub fn byte_offset(self) -> u64 {
        self.offset_sectors() * SECTOR_SIZE
    }
}

/// Location of a btree node inside the image.
#[derive(Debug, Clone, Copy)]
pub struct NodeRef {
    pub byte_offset: u64,
    pub byte_len: u64,
}

impl NodeRef {
    fn from_ptr(ptr: &BtreePtrV2, extent_ptr: ExtentPtr) -> Self {
        NodeRef {
            byte_offset: extent_ptr.byte_offset(),
            byte_len: u64::from(ptr.sectors_written) * SECTOR_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BtreeRoots {
    pub extents: NodeRef,
    pub inodes: NodeRef,
    pub dirents: NodeRef,
}

impl BtreeRoots {
    pub fn get(&self, id: BtreeId) -> NodeRef {
        match id {
            BtreeId::Extents => self.extents,
            BtreeId::Inodes => self.inodes,
            BtreeId::Dirents => self.dirents,
        }
    }
}

/// Walks the superblock's variable field region looking for the clean
/// section, and pulls the three btree roots out of its journal entries.
pub fn find_btree_roots(image: &[u8], sb: &Superblock) -> Result<BtreeRoots> {
    let region_start = (SUPERBLOCK_OFFSET + SUPERBLOCK_BYTES) as usize;
    let region = image
        .get_at(region_start, sb.u64s as usize * 8)
        .ok_or_else(|| Error::TruncatedImage {
            expected: region_start as u64 + u64::from(sb.u64s) * 8,
            actual: image.len() as u64,
        })?;

    let mut off = 0usize;
    while off + 8 <= region.len() {
        let u64s = u32::from_le_bytes(region[off..off + 4].try_into().unwrap());
        let field_type = u32::from_le_bytes(region[off + 4..off + 8].try_into().unwrap());
        if u64s == 0 {
            return Err(Error::CorruptImage("zero-length superblock field".to_string()));
        }
        let field_len = u64s as usize * 8;
        let field = region
            .get_at(off, field_len)
            .ok_or_else(|| Error::CorruptImage("superblock field overruns region".to_string()))?;
        if field_type == SB_FIELD_CLEAN {
            return roots_from_clean_field(field);
        }
        off += field_len;
    }

    Err(Error::CorruptImage(
        "no clean section; image was not shut down cleanly".to_string(),
    ))
}

/// The clean section is a 24-byte header followed by journal-set entries;
/// entries of type btree_root hold a key whose value is the root pointer.
fn roots_from_clean_field(field: &[u8]) -> Result<BtreeRoots> {
    const CLEAN_HEADER_BYTES: usize = 24;
    const JSET_ENTRY_HEADER_BYTES: usize = 8;

    let mut extents = None;
    let mut inodes = None;
    let mut dirents = None;

    let mut off = CLEAN_HEADER_BYTES;
    while off + JSET_ENTRY_HEADER_BYTES <= field.len() {
        let u64s = u16::from_le_bytes(field[off..off + 2].try_into().unwrap());
        let btree_id = field[off + 2];
        let entry_type = field[off + 4];
        // jset entry u64s counts the payload only.
        let entry_len = (usize::from(u64s) + 1) * 8;
        let entry = field
            .get_at(off, entry_len)
            .ok_or_else(|| Error::CorruptImage("journal entry overruns clean section".to_string()))?;

        if entry_type == JSET_ENTRY_BTREE_ROOT && u64s > 0 {
            let node = root_ptr_from_entry(&entry[JSET_ENTRY_HEADER_BYTES..])?;
            match btree_id {
                0 => extents = Some(node),
                1 => inodes = Some(node),
                2 => dirents = Some(node),
                _ => {}
            }
        }
        off += entry_len;
    }

    match (extents, inodes, dirents) {
        (Some(extents), Some(inodes), Some(dirents)) => Ok(BtreeRoots {
            extents,
            inodes,
            dirents,
        }),
        _ => Err(Error::CorruptImage("missing btree root".to_string())),
    }
}

fn root_ptr_from_entry(payload: &[u8]) -> Result<NodeRef> {
    let key = payload
        .get_at(0, BKEY_BYTES)
        .ok_or_else(|| Error::CorruptImage("btree root entry too short".to_string()))?;
    let bkey = BkeyRaw::read_le(&mut Cursor::new(key))?;
    if bkey.u64s < BKEY_U64S {
        return Err(Error::CorruptImage("btree root key too short".to_string()));
    }

    let value = payload
        .get_at(BKEY_BYTES, usize::from(bkey.u64s) * 8 - BKEY_BYTES)
        .ok_or_else(|| Error::CorruptImage("btree root value out of range".to_string()))?;
    parse_btree_ptr(value)
}

/// Decodes a btree_ptr_v2 value: fixed header plus one or more extent
/// pointers, the first usable one locating the node.
pub fn parse_btree_ptr(value: &[u8]) -> Result<NodeRef> {
    if value.len() < BTREE_PTR_V2_BYTES + 8 {
        return Err(Error::CorruptImage("btree ptr value too short".to_string()));
    }
    let ptr = BtreePtrV2::read_le(&mut Cursor::new(&value[..BTREE_PTR_V2_BYTES]))?;

    let mut off = BTREE_PTR_V2_BYTES;
    while off + 8 <= value.len() {
        let extent_ptr = ExtentPtr(u64::from_le_bytes(value[off..off + 8].try_into().unwrap()));
        if !extent_ptr.unused() {
            return Ok(NodeRef::from_ptr(&ptr, extent_ptr));
        }
        off += 8;
    }
    Err(Error::CorruptImage("btree ptr has no usable pointer".to_string()))
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileMode: u16 {
        const READ = 0o400;
        const WRITE = 0o200;
        const EXEC = 0o100;
        const READ_GROUP = 0o040;
        const WRITE_GROUP = 0o020;
        const EXEC_GROUP = 0o010;
        const READ_OTHER = 0o004;
        const WRITE_OTHER = 0o002;
        const EXEC_OTHER = 0o001;
        const DIR = 0o040000;
        const CHAR_DEVICE = 0o020000;
        const BLOCK_DEVICE = 0o060000;
        const NAMED_PIPE = 0o010000;
        const SOCKET = 0o140000;
        const SYMLINK = 0o120000;
        const REGULAR = 0o100000;
        const SETUID = 0o004000;
        const SETGID = 0o002000;
        const STICKY = 0o001000;
    }
}

/// Inode metadata as recorded in the inodes btree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    inum: u64,
    size: u64,
    mode: u16,
}

impl Inode {
    pub(crate) fn new(inum: u64, size: u64, mode: u16) -> Self {
        Inode { inum, size, mode }
    }

    pub fn inum(&self) -> u64 {
        self.inum
    }

    /// Declared byte size. The extent map may cover up to one addressing
    /// unit more than this; reads are clamped to it.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mode(&self) -> FileMode {
        FileMode::from_bits_truncate(self.mode)
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_raw_mode(u32::from(self.mode))
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.file_type(), FileType::Directory)
    }

    pub fn is_file(&self) -> bool {
        matches!(self.file_type(), FileType::RegularFile)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.file_type(), FileType::Symlink)
    }
}

/// Decoded fixed part of an inode value, plus the fields this reader needs
/// from the varint-packed tail.
#[derive(Debug, Clone, Copy)]
pub struct InodeUnpacked {
    pub mode: u16,
    pub size: u64,
    pub sectors: u64,
}

/// Unpacks an inode value: hash_seed, flags and mode, then varint fields in
/// field order. Fields past the stored count read as zero.
pub fn inode_unpack(value: &[u8]) -> Result<InodeUnpacked> {
    const FIXED: usize = 14;
    if value.len() < FIXED {
        return Err(Error::CorruptImage("inode value too short".to_string()));
    }
    let flags = u32::from_le_bytes(value[8..12].try_into().unwrap());
    let mode = u16::from_le_bytes(value[12..14].try_into().unwrap());

    if flags & INODE_FLAG_NEW_VARINT == 0 {
        return Err(Error::Unsupported("pre-varint inode encoding".to_string()));
    }
    let nr_fields = (flags >> INODE_NR_FIELDS_SHIFT & INODE_NR_FIELDS_MASK) as usize;

    let mut fields = [0u64; 16];
    let mut off = FIXED;
    for field in fields.iter_mut().take(nr_fields.min(16)) {
        let (v, len) = varint_decode(&value[off..])?;
        *field = v;
        off += len;
    }

    Ok(InodeUnpacked {
        mode,
        size: fields[INODE_FIELDS_BEFORE_SIZE],
        sectors: fields[INODE_FIELDS_BEFORE_SIZE + 1],
    })
}

/// bcachefs varint: the count of trailing one bits in the first byte gives
/// the encoded length minus one; 0xff escapes to a raw little-endian u64.
pub fn varint_decode(bytes: &[u8]) -> Result<(u64, usize)> {
    let first = *bytes
        .first()
        .ok_or_else(|| Error::CorruptImage("varint out of range".to_string()))?;
    if first == 0xff {
        let raw = bytes
            .get_at(1, 8)
            .ok_or_else(|| Error::CorruptImage("varint out of range".to_string()))?;
        return Ok((u64::from_le_bytes(raw.try_into().unwrap()), 9));
    }
    let len = first.trailing_ones() as usize + 1;
    let raw = bytes
        .get_at(0, len)
        .ok_or_else(|| Error::CorruptImage("varint out of range".to_string()))?;
    let mut word = [0u8; 8];
    word[..len].copy_from_slice(raw);
    Ok((u64::from_le_bytes(word) >> len, len))
}
