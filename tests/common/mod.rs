//! Synthetic image builder: writes minimal but format-correct bcachefs
//! images to temp files for the integration tests.

#![allow(dead_code)]

use std::io::Write;

use bcachefs_rs::types::{
    BCACHE_MAGIC, BSET_MAGIC_XOR, KEY_FORMAT_CURRENT, KEY_FORMAT_LOCAL_BTREE,
    KEY_TYPE_BTREE_PTR_V2, KEY_TYPE_DELETED, KEY_TYPE_DIRENT, KEY_TYPE_EXTENT, KEY_TYPE_INLINE_DATA,
    KEY_TYPE_INODE, KEY_TYPE_WHITEOUT, INODE_FLAG_NEW_VARINT, INODE_NR_FIELDS_SHIFT,
    JSET_ENTRY_BTREE_ROOT, SB_FIELD_CLEAN,
};
use tempfile::NamedTempFile;

pub const FILE1_CONTENT: &[u8] = b"File content 1\n";
pub const FILE2_CONTENT: &[u8] = b"File content 2\n";

pub mod ino {
    pub const ROOT: u64 = 4096;
    pub const FILE1: u64 = 4097;
    pub const DIR: u64 = 4098;
    pub const SUBDIR: u64 = 4099;
    pub const FILE2: u64 = 4100;
    pub const BIG: u64 = 4101;
    pub const LINK: u64 = 4102;
    pub const EMPTY: u64 = 4103;
}

pub const DT_DIR: u8 = 4;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;

const S_IFDIR: u16 = 0o040000;
const S_IFREG: u16 = 0o100000;
const S_IFLNK: u16 = 0o120000;

const SECTOR: u64 = 512;
/// Fixture geometry: 512-byte blocks, 4096-byte btree nodes.
const BLOCK: usize = 512;
const NODE_SECTORS: u64 = 8;
const VERSION: u16 = 20;

const UUID: [u8; 16] = *b"bcachefs-fixture";

const EXTENTS_NODE: u64 = 8192;
const INODES_NODE: u64 = 12288;
const DIRENTS_NODE: u64 = 16384;
const DIRENTS_LEAF2: u64 = 20480;
const DIRENTS_INTERIOR: u64 = 24576;
const DATA_A: u64 = 28672;
const DATA_B: u64 = 29184;

/// big.bin: 512 data bytes, a 512-byte hole, 512 more data bytes.
pub const BIG_SIZE: u64 = 1536;

pub fn big_data_a() -> Vec<u8> {
    (0..512).map(|i| (i % 251) as u8).collect()
}

pub fn big_data_b() -> Vec<u8> {
    (0..512).map(|i| (i * 7 % 251) as u8).collect()
}

pub fn big_file_content() -> Vec<u8> {
    let mut content = big_data_a();
    content.extend(std::iter::repeat(0u8).take(512));
    content.extend(big_data_b());
    content
}

pub fn write_image(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp image");
    file.write_all(bytes).expect("write temp image");
    file.flush().expect("flush temp image");
    file
}

pub fn basic_image() -> NamedTempFile {
    write_image(&basic_image_bytes())
}

/// Same tree as `basic_image`, but the dirents btree is two levels deep,
/// its leaves use packed keys, and the second leaf carries two bsets.
pub fn packed_image() -> NamedTempFile {
    write_image(&packed_image_bytes())
}

pub fn basic_image_bytes() -> Vec<u8> {
    let dirents_node = btree_node(current_format(), &[&dirent_keys_all()]);
    assemble(&[
        (0, 0, EXTENTS_NODE, extents_node()),
        (1, 0, INODES_NODE, inodes_node()),
        (2, 0, DIRENTS_NODE, dirents_node),
    ])
}

pub fn packed_image_bytes() -> Vec<u8> {
    let leaf1 = btree_node(packed_format(), &[&root_dirent_keys_packed()]);
    let leaf2 = btree_node(
        packed_format(),
        &[
            &[packed_key(
                KEY_TYPE_DIRENT,
                ino::DIR,
                100,
                &dirent_value(ino::SUBDIR, DT_DIR, "subdir"),
            )],
            &[packed_key(
                KEY_TYPE_DIRENT,
                ino::SUBDIR,
                100,
                &dirent_value(ino::FILE2, DT_REG, "file2"),
            )],
        ],
    );
    let interior = btree_node(
        current_format(),
        &[&[
            unpacked_key(
                KEY_TYPE_BTREE_PTR_V2,
                ino::ROOT,
                510,
                0,
                &btree_ptr_value(DIRENTS_NODE, leaf1.len() as u64),
            ),
            unpacked_key(
                KEY_TYPE_BTREE_PTR_V2,
                ino::SUBDIR,
                100,
                0,
                &btree_ptr_value(DIRENTS_LEAF2, leaf2.len() as u64),
            ),
        ]],
    );

    assemble_with_extra_nodes(
        &[
            (0, 0, EXTENTS_NODE, extents_node()),
            (1, 0, INODES_NODE, inodes_node()),
            (2, 1, DIRENTS_INTERIOR, interior),
        ],
        &[(DIRENTS_NODE, leaf1), (DIRENTS_LEAF2, leaf2)],
    )
}

/// Superblock claiming a clean section but carrying none.
pub fn no_clean_image_bytes() -> Vec<u8> {
    let mut image = vec![0u8; 4096];
    image.extend(superblock(VERSION, BCACHE_MAGIC, &[]));
    pad_to_sector(&mut image);
    image
}

pub fn bad_magic_image_bytes() -> Vec<u8> {
    let mut image = basic_image_bytes();
    image[4096 + 24] ^= 0xff;
    image
}

pub fn bad_version_image_bytes() -> Vec<u8> {
    let mut image = basic_image_bytes();
    image[4096 + 16..4096 + 18].copy_from_slice(&99u16.to_le_bytes());
    image
}

pub fn truncated_image_bytes() -> Vec<u8> {
    let mut image = basic_image_bytes();
    image.truncate(5000);
    image
}

fn extents_node() -> Vec<u8> {
    let keys = vec![
        unpacked_key(KEY_TYPE_INLINE_DATA, ino::FILE1, 1, 1, FILE1_CONTENT),
        unpacked_key(KEY_TYPE_INLINE_DATA, ino::FILE2, 1, 1, FILE2_CONTENT),
        unpacked_key(KEY_TYPE_EXTENT, ino::BIG, 1, 1, &extent_value(DATA_A / SECTOR)),
        unpacked_key(KEY_TYPE_EXTENT, ino::BIG, 3, 1, &extent_value(DATA_B / SECTOR)),
    ];
    btree_node(current_format(), &[&keys])
}

fn inodes_node() -> Vec<u8> {
    let keys = vec![
        unpacked_key(KEY_TYPE_INODE, ino::ROOT, 0, 0, &inode_value(S_IFDIR | 0o755, 0)),
        unpacked_key(
            KEY_TYPE_INODE,
            ino::FILE1,
            0,
            0,
            &inode_value(S_IFREG | 0o644, FILE1_CONTENT.len() as u64),
        ),
        unpacked_key(KEY_TYPE_INODE, ino::DIR, 0, 0, &inode_value(S_IFDIR | 0o755, 0)),
        unpacked_key(KEY_TYPE_INODE, ino::SUBDIR, 0, 0, &inode_value(S_IFDIR | 0o755, 0)),
        unpacked_key(
            KEY_TYPE_INODE,
            ino::FILE2,
            0,
            0,
            &inode_value(S_IFREG | 0o644, FILE2_CONTENT.len() as u64),
        ),
        unpacked_key(KEY_TYPE_INODE, ino::BIG, 0, 0, &inode_value(S_IFREG | 0o644, BIG_SIZE)),
        unpacked_key(KEY_TYPE_INODE, ino::LINK, 0, 0, &inode_value(S_IFLNK | 0o777, 0)),
        unpacked_key(KEY_TYPE_INODE, ino::EMPTY, 0, 0, &inode_value(S_IFREG | 0o644, 0)),
        // A deleted record; must never surface.
        unpacked_key(KEY_TYPE_DELETED, 4104, 0, 0, &[]),
    ];
    btree_node(current_format(), &[&keys])
}

/// Root-directory entries, hash-ordered. Discovery order of "/" is therefore
/// big.bin, file1, dir, link, empty.
fn dirent_keys_all() -> Vec<Vec<u8>> {
    let mut keys = root_dirent_keys_unpacked();
    keys.push(unpacked_key(
        KEY_TYPE_DIRENT,
        ino::DIR,
        100,
        0,
        &dirent_value(ino::SUBDIR, DT_DIR, "subdir"),
    ));
    keys.push(unpacked_key(
        KEY_TYPE_DIRENT,
        ino::SUBDIR,
        100,
        0,
        &dirent_value(ino::FILE2, DT_REG, "file2"),
    ));
    keys
}

fn root_dirent_keys_unpacked() -> Vec<Vec<u8>> {
    vec![
        unpacked_key(KEY_TYPE_DIRENT, ino::ROOT, 77, 0, &dirent_value(ino::BIG, DT_REG, "big.bin")),
        unpacked_key(
            KEY_TYPE_DIRENT,
            ino::ROOT,
            201,
            0,
            &dirent_value(ino::FILE1, DT_REG, "file1"),
        ),
        // Whiteout between live entries; must be skipped.
        unpacked_key(KEY_TYPE_WHITEOUT, ino::ROOT, 300, 0, &[]),
        unpacked_key(KEY_TYPE_DIRENT, ino::ROOT, 405, 0, &dirent_value(ino::DIR, DT_DIR, "dir")),
        unpacked_key(
            KEY_TYPE_DIRENT,
            ino::ROOT,
            500,
            0,
            &dirent_value(ino::LINK, DT_LNK, "link"),
        ),
        unpacked_key(
            KEY_TYPE_DIRENT,
            ino::ROOT,
            510,
            0,
            &dirent_value(ino::EMPTY, DT_REG, "empty"),
        ),
    ]
}

fn root_dirent_keys_packed() -> Vec<Vec<u8>> {
    vec![
        packed_key(KEY_TYPE_DIRENT, ino::ROOT, 77, &dirent_value(ino::BIG, DT_REG, "big.bin")),
        packed_key(KEY_TYPE_DIRENT, ino::ROOT, 201, &dirent_value(ino::FILE1, DT_REG, "file1")),
        packed_key(KEY_TYPE_WHITEOUT, ino::ROOT, 300, &[]),
        packed_key(KEY_TYPE_DIRENT, ino::ROOT, 405, &dirent_value(ino::DIR, DT_DIR, "dir")),
        packed_key(KEY_TYPE_DIRENT, ino::ROOT, 500, &dirent_value(ino::LINK, DT_LNK, "link")),
        packed_key(KEY_TYPE_DIRENT, ino::ROOT, 510, &dirent_value(ino::EMPTY, DT_REG, "empty")),
    ]
}

fn assemble(roots: &[(u8, u8, u64, Vec<u8>)]) -> Vec<u8> {
    assemble_with_extra_nodes(roots, &[])
}

fn assemble_with_extra_nodes(
    roots: &[(u8, u8, u64, Vec<u8>)],
    extra: &[(u64, Vec<u8>)],
) -> Vec<u8> {
    let root_meta: Vec<(u8, u8, u64, u64)> = roots
        .iter()
        .map(|(id, level, off, node)| (*id, *level, *off, node.len() as u64))
        .collect();
    let field = clean_field(&root_meta);
    let sb = superblock(VERSION, BCACHE_MAGIC, &field);

    let mut image = vec![0u8; 4096];
    image.extend(sb);

    let mut regions: Vec<(u64, &[u8])> = roots
        .iter()
        .map(|(_, _, off, node)| (*off, node.as_slice()))
        .collect();
    for (off, node) in extra {
        regions.push((*off, node.as_slice()));
    }
    let data_a = big_data_a();
    let data_b = big_data_b();
    regions.push((DATA_A, &data_a));
    regions.push((DATA_B, &data_b));
    regions.sort_by_key(|(off, _)| *off);

    for (off, bytes) in regions {
        let off = off as usize;
        assert!(off >= image.len(), "fixture regions overlap");
        image.resize(off, 0);
        image.extend_from_slice(bytes);
    }
    pad_to_sector(&mut image);
    image
}

fn pad_to_sector(image: &mut Vec<u8>) {
    while image.len() % SECTOR as usize != 0 {
        image.push(0);
    }
}

fn superblock(version: u16, magic: [u8; 16], fields: &[u8]) -> Vec<u8> {
    assert_eq!(fields.len() % 8, 0);
    let mut sb = Vec::with_capacity(752 + fields.len());
    sb.extend_from_slice(&[0u8; 16]); // csum
    sb.extend_from_slice(&version.to_le_bytes());
    sb.extend_from_slice(&version.to_le_bytes()); // version_min
    sb.extend_from_slice(&[0u8; 4]);
    sb.extend_from_slice(&magic);
    sb.extend_from_slice(&UUID);
    sb.extend_from_slice(&UUID); // user_uuid
    sb.extend_from_slice(&[0u8; 32]); // label
    sb.extend_from_slice(&8u64.to_le_bytes()); // offset (sector of this sb)
    sb.extend_from_slice(&0u64.to_le_bytes()); // seq
    sb.extend_from_slice(&1u16.to_le_bytes()); // block_size in sectors
    sb.push(0); // dev_idx
    sb.push(1); // nr_devices
    sb.extend_from_slice(&((fields.len() / 8) as u32).to_le_bytes());
    sb.extend_from_slice(&0u64.to_le_bytes()); // time_base_lo
    sb.extend_from_slice(&0u32.to_le_bytes()); // time_base_hi
    sb.extend_from_slice(&1u32.to_le_bytes()); // time_precision
    sb.extend_from_slice(&(NODE_SECTORS << 12).to_le_bytes()); // flags[0]: btree node size
    for _ in 0..7 {
        sb.extend_from_slice(&0u64.to_le_bytes());
    }
    sb.extend_from_slice(&[0u8; 16]); // features
    sb.extend_from_slice(&[0u8; 16]); // compat
    sb.extend_from_slice(&[0u8; 512]); // layout
    assert_eq!(sb.len(), 752);
    sb.extend_from_slice(fields);
    sb
}

fn clean_field(roots: &[(u8, u8, u64, u64)]) -> Vec<u8> {
    let mut entries = Vec::new();
    for &(btree_id, level, node_off, node_len) in roots {
        let key = unpacked_key(
            KEY_TYPE_BTREE_PTR_V2,
            0,
            0,
            0,
            &btree_ptr_value(node_off, node_len),
        );
        entries.extend_from_slice(&((key.len() / 8) as u16).to_le_bytes());
        entries.push(btree_id);
        entries.push(level);
        entries.push(JSET_ENTRY_BTREE_ROOT);
        entries.extend_from_slice(&[0u8; 3]);
        entries.extend_from_slice(&key);
    }

    let mut field = Vec::with_capacity(24 + entries.len());
    field.extend_from_slice(&(((24 + entries.len()) / 8) as u32).to_le_bytes());
    field.extend_from_slice(&SB_FIELD_CLEAN.to_le_bytes());
    field.extend_from_slice(&0u32.to_le_bytes()); // flags
    field.extend_from_slice(&0u16.to_le_bytes()); // read_clock
    field.extend_from_slice(&0u16.to_le_bytes()); // write_clock
    field.extend_from_slice(&0u64.to_le_bytes()); // journal_seq
    field.extend_from_slice(&entries);
    field
}

/// A node holding one or more bsets; later bsets start at the next block
/// boundary behind a checksum, exactly as the reader walks them.
fn btree_node(format: [u8; 56], bsets: &[&[Vec<u8>]]) -> Vec<u8> {
    let mut node = Vec::new();
    node.extend_from_slice(&[0u8; 16]); // csum
    node.extend_from_slice(&bset_magic().to_le_bytes());
    node.extend_from_slice(&0u64.to_le_bytes()); // flags
    node.extend_from_slice(&[0u8; 20]); // min_key
    node.extend_from_slice(&[0u8; 20]); // max_key
    node.extend_from_slice(&0u64.to_le_bytes()); // _ptr
    node.extend_from_slice(&format);
    assert_eq!(node.len(), 136);

    for (i, keys) in bsets.iter().enumerate() {
        if i > 0 {
            let len = node.len();
            node.resize(len + (BLOCK - len % BLOCK), 0);
            node.extend_from_slice(&[0u8; 16]); // bset csum
        }
        let keys_bytes: usize = keys.iter().map(Vec::len).sum();
        assert_eq!(keys_bytes % 8, 0);
        node.extend_from_slice(&0u64.to_le_bytes()); // seq
        node.extend_from_slice(&0u64.to_le_bytes()); // journal_seq
        node.extend_from_slice(&0u32.to_le_bytes()); // flags
        node.extend_from_slice(&0u16.to_le_bytes()); // version
        node.extend_from_slice(&((keys_bytes / 8) as u16).to_le_bytes());
        for key in keys.iter() {
            node.extend_from_slice(key);
        }
    }

    pad_to_sector(&mut node);
    assert!(node.len() as u64 <= NODE_SECTORS * SECTOR, "fixture node too large");
    node
}

fn bset_magic() -> u64 {
    u64::from_le_bytes(UUID[..8].try_into().unwrap()) ^ BSET_MAGIC_XOR
}

fn current_format() -> [u8; 56] {
    let mut format = [0u8; 56];
    format[0] = 5; // key_u64s
    format[1] = 6; // nr_fields
    format
}

/// Packed keys: 3 u64s, inode and offset stored as full words at the end of
/// the key area.
fn packed_format() -> [u8; 56] {
    let mut format = [0u8; 56];
    format[0] = 3;
    format[1] = 6;
    format[2] = 64; // inode bits
    format[3] = 64; // offset bits
    format
}

fn unpacked_key(key_type: u8, inode: u64, offset: u64, size: u32, value: &[u8]) -> Vec<u8> {
    let value = padded(value);
    let u64s = 5 + value.len() / 8;
    let mut key = Vec::with_capacity(u64s * 8);
    key.push(u64s as u8);
    key.push(KEY_FORMAT_CURRENT);
    key.push(key_type);
    key.push(0);
    key.extend_from_slice(&0u64.to_le_bytes()); // version lo
    key.extend_from_slice(&0u32.to_le_bytes()); // version hi
    key.extend_from_slice(&size.to_le_bytes());
    key.extend_from_slice(&0u32.to_le_bytes()); // snapshot
    key.extend_from_slice(&offset.to_le_bytes());
    key.extend_from_slice(&inode.to_le_bytes());
    key.extend_from_slice(&value);
    key
}

fn packed_key(key_type: u8, inode: u64, offset: u64, value: &[u8]) -> Vec<u8> {
    let value = padded(value);
    let u64s = 3 + value.len() / 8;
    let mut key = vec![0u8; 24];
    key[0] = u64s as u8;
    key[1] = KEY_FORMAT_LOCAL_BTREE;
    key[2] = key_type;
    key[8..16].copy_from_slice(&offset.to_le_bytes());
    key[16..24].copy_from_slice(&inode.to_le_bytes());
    key.extend_from_slice(&value);
    key
}

fn padded(value: &[u8]) -> Vec<u8> {
    let mut value = value.to_vec();
    while value.len() % 8 != 0 {
        value.push(0);
    }
    value
}

fn dirent_value(child: u64, d_type: u8, name: &str) -> Vec<u8> {
    let mut value = Vec::with_capacity(9 + name.len());
    value.extend_from_slice(&child.to_le_bytes());
    value.push(d_type);
    value.extend_from_slice(name.as_bytes());
    value
}

fn inode_value(mode: u16, size: u64) -> Vec<u8> {
    let nr_fields = 9u32; // eight timestamp varints, then bi_size
    let flags = INODE_FLAG_NEW_VARINT | nr_fields << INODE_NR_FIELDS_SHIFT;
    let mut value = Vec::new();
    value.extend_from_slice(&0u64.to_le_bytes()); // hash_seed
    value.extend_from_slice(&flags.to_le_bytes());
    value.extend_from_slice(&mode.to_le_bytes());
    for _ in 0..8 {
        value.extend_from_slice(&varint_encode(0));
    }
    value.extend_from_slice(&varint_encode(size));
    value
}

fn extent_value(ptr_sectors: u64) -> Vec<u8> {
    ((ptr_sectors << 4) | 1).to_le_bytes().to_vec()
}

fn btree_ptr_value(node_off: u64, node_len: u64) -> Vec<u8> {
    assert_eq!(node_off % SECTOR, 0);
    assert_eq!(node_len % SECTOR, 0);
    let mut value = Vec::with_capacity(48);
    value.extend_from_slice(&0u64.to_le_bytes()); // mem_ptr
    value.extend_from_slice(&0u64.to_le_bytes()); // seq
    value.extend_from_slice(&((node_len / SECTOR) as u16).to_le_bytes());
    value.extend_from_slice(&0u16.to_le_bytes()); // flags
    value.extend_from_slice(&[0u8; 20]); // min_key
    value.extend_from_slice(&((node_off / SECTOR) << 4 | 1).to_le_bytes());
    value
}

fn varint_encode(v: u64) -> Vec<u8> {
    let bits = 64 - (v | 1).leading_zeros();
    let len = bits.div_ceil(7) as usize;
    if len >= 9 {
        let mut out = vec![0xff];
        out.extend_from_slice(&v.to_le_bytes());
        return out;
    }
    let word = (v << len) | ((1 << (len - 1)) - 1);
    word.to_le_bytes()[..len].to_vec()
}
