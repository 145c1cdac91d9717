use std::io::Cursor;

use binrw::BinRead;
use tracing::trace;

use crate::dirent::{parse_dirent_value, Dirent};
use crate::traits::ReadCursorExt;
use crate::types::*;
use crate::{Error, Result};

/// Node-walking parameters derived from the superblock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub block_bytes: u64,
    pub btree_node_bytes: u64,
    pub bset_magic: u64,
}

impl Geometry {
    pub fn from_superblock(sb: &Superblock) -> Self {
        Geometry {
            block_bytes: sb.block_bytes(),
            btree_node_bytes: sb.btree_node_bytes(),
            bset_magic: sb.bset_magic(),
        }
    }
}

/// A key unpacked from either on-disk format.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BkeyDecoded {
    pub inode: u64,
    pub offset: u64,
    pub snapshot: u32,
    pub size: u32,
    pub key_type: u8,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ExtentRec {
    pub inode: u64,
    /// Byte offset within the file.
    pub logical: u64,
    /// Byte offset within the image.
    pub physical: u64,
    pub len: u64,
}

/// One record out of a btree traversal.
#[derive(Debug, Clone)]
pub(crate) enum Record {
    Inode { inum: u64, inode: InodeUnpacked },
    Dirent(Dirent),
    Extent(ExtentRec),
}

/// Context handed to record decoders alongside the raw value bytes.
pub(crate) struct ValueCtx {
    /// Absolute image byte offset of the value bytes, so inline payloads can
    /// be addressed like any other extent.
    pub image_offset: u64,
}

/// Decodes one (key, value) pair into a record, or `None` for key types the
/// tree's consumer does not care about.
pub(crate) type RecordDecoder = fn(&BkeyDecoded, &[u8], &ValueCtx) -> Result<Option<Record>>;

pub(crate) fn decode_inode_record(
    key: &BkeyDecoded,
    value: &[u8],
    _ctx: &ValueCtx,
) -> Result<Option<Record>> {
    if key.key_type != KEY_TYPE_INODE {
        return Ok(None);
    }
    let inode = inode_unpack(value)?;
    Ok(Some(Record::Inode {
        inum: key.inode,
        inode,
    }))
}

pub(crate) fn decode_dirent_record(
    key: &BkeyDecoded,
    value: &[u8],
    _ctx: &ValueCtx,
) -> Result<Option<Record>> {
    if key.key_type != KEY_TYPE_DIRENT {
        return Ok(None);
    }
    parse_dirent_value(key.inode, value).map(|d| Some(Record::Dirent(d)))
}

pub(crate) fn decode_extent_record(
    key: &BkeyDecoded,
    value: &[u8],
    ctx: &ValueCtx,
) -> Result<Option<Record>> {
    if !matches!(key.key_type, KEY_TYPE_EXTENT | KEY_TYPE_INLINE_DATA) {
        return Ok(None);
    }

    // The key's offset field is the extent's end, in sectors.
    let logical_end = key.offset;
    let sectors = u64::from(key.size);
    if logical_end < sectors {
        return Err(Error::CorruptImage("extent ends before it starts".to_string()));
    }
    let logical = (logical_end - sectors) * SECTOR_SIZE;

    match key.key_type {
        KEY_TYPE_EXTENT => {
            if value.len() < 8 {
                return Err(Error::CorruptImage("extent value too short".to_string()));
            }
            let ptr = ExtentPtr(u64::from_le_bytes(value[..8].try_into().unwrap()));
            Ok(Some(Record::Extent(ExtentRec {
                inode: key.inode,
                logical,
                physical: ptr.byte_offset(),
                len: sectors * SECTOR_SIZE,
            })))
        }
        KEY_TYPE_INLINE_DATA => Ok(Some(Record::Extent(ExtentRec {
            inode: key.inode,
            logical,
            physical: ctx.image_offset,
            len: value.len() as u64,
        }))),
        _ => Ok(None),
    }
}

/// Lazy, in-key-order traversal of one btree: walks a node's bsets record by
/// record and descends depth-first into child pointers as they appear. A
/// fresh iterator restarts from the root.
pub(crate) struct BtreeIter<'a> {
    image: &'a [u8],
    geom: Geometry,
    decode: RecordDecoder,
    stack: Vec<NodeCursor<'a>>,
    failed: bool,
}

/// Btrees are at most 8 levels deep; anything deeper means a pointer cycle.
const MAX_DEPTH: usize = 16;

struct NodeCursor<'a> {
    node: &'a [u8],
    image_offset: u64,
    format: BkeyFormat,
    /// Current position and end of the current bset's key region, relative
    /// to the node start.
    pos: usize,
    keys_end: usize,
    last_key: Option<(u64, u64, u32)>,
}

impl<'a> BtreeIter<'a> {
    pub fn new(
        image: &'a [u8],
        geom: Geometry,
        root: NodeRef,
        decode: RecordDecoder,
    ) -> Result<Self> {
        let root = NodeCursor::open(image, &geom, root)?;
        Ok(BtreeIter {
            image,
            geom,
            decode,
            stack: vec![root],
            failed: false,
        })
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            let (key, value_range, node, node_offset) = {
                let Some(cursor) = self.stack.last_mut() else {
                    return Ok(None);
                };
                match cursor.next_key(&self.geom)? {
                    Some((key, range)) => (key, range, cursor.node, cursor.image_offset),
                    None => {
                        self.stack.pop();
                        continue;
                    }
                }
            };

            if matches!(
                key.key_type,
                KEY_TYPE_DELETED | KEY_TYPE_WHITEOUT | KEY_TYPE_HASH_WHITEOUT
            ) {
                continue;
            }

            let value = &node[value_range.clone()];
            if key.key_type == KEY_TYPE_BTREE_PTR_V2 {
                if self.stack.len() >= MAX_DEPTH {
                    return Err(Error::CorruptImage("btree deeper than allowed".to_string()));
                }
                let child = parse_btree_ptr(value)?;
                let child = NodeCursor::open(self.image, &self.geom, child)?;
                self.stack.push(child);
                continue;
            }

            let ctx = ValueCtx {
                image_offset: node_offset + value_range.start as u64,
            };
            if let Some(record) = (self.decode)(&key, value, &ctx)? {
                return Ok(Some(record));
            }
        }
    }
}

impl Iterator for BtreeIter<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

impl<'a> NodeCursor<'a> {
    fn open(image: &'a [u8], geom: &Geometry, node_ref: NodeRef) -> Result<Self> {
        if node_ref.byte_len == 0 {
            return Err(Error::CorruptImage("empty btree node".to_string()));
        }
        if node_ref.byte_len > geom.btree_node_bytes {
            return Err(Error::CorruptImage("btree node larger than declared".to_string()));
        }
        let node = image
            .get_at(node_ref.byte_offset as usize, node_ref.byte_len as usize)
            .ok_or(Error::TruncatedImage {
                expected: node_ref.byte_offset + node_ref.byte_len,
                actual: image.len() as u64,
            })?;

        if node.len() < BTREE_NODE_HEADER_BYTES + BSET_HEADER_BYTES {
            return Err(Error::CorruptImage("btree node too small".to_string()));
        }
        let header = BtreeNodeHeader::read_le(&mut Cursor::new(node))?;
        if header.magic != geom.bset_magic {
            return Err(Error::CorruptImage(format!(
                "bad btree node magic: {:#x}",
                header.magic
            )));
        }

        trace!(
            offset = node_ref.byte_offset,
            len = node_ref.byte_len,
            "entering btree node"
        );

        let mut cursor = NodeCursor {
            node,
            image_offset: node_ref.byte_offset,
            format: header.format,
            pos: 0,
            keys_end: BTREE_NODE_HEADER_BYTES,
            last_key: None,
        };
        cursor.enter_bset(BTREE_NODE_HEADER_BYTES)?;
        Ok(cursor)
    }

    /// Reads the bset header at `start` and positions the cursor on its
    /// first key. An empty bset leaves pos == keys_end.
    fn enter_bset(&mut self, start: usize) -> Result<()> {
        let header_bytes = self
            .node
            .get_at(start, BSET_HEADER_BYTES)
            .ok_or_else(|| Error::CorruptImage("bset header out of range".to_string()))?;
        let header = BsetHeader::read_le(&mut Cursor::new(header_bytes))?;

        let keys_start = start + BSET_HEADER_BYTES;
        let keys_len = usize::from(header.u64s) * 8;
        if self.node.get_at(keys_start, keys_len).is_none() {
            return Err(Error::CorruptImage("bset keys out of range".to_string()));
        }
        self.pos = keys_start;
        self.keys_end = keys_start + keys_len;
        self.last_key = None;
        Ok(())
    }

    /// Moves to the next non-empty bset, which starts at the next block
    /// boundary after the current one, behind a checksum.
    fn next_bset(&mut self, geom: &Geometry) -> Result<bool> {
        let block = geom.block_bytes as usize;
        let mut end = self.keys_end;
        loop {
            let aligned = end + (block - end % block);
            let start = aligned + CSUM_BYTES;
            if start + BSET_HEADER_BYTES > self.node.len() {
                return Ok(false);
            }
            self.enter_bset(start)?;
            if self.pos < self.keys_end {
                return Ok(true);
            }
            end = self.keys_end;
        }
    }

    fn next_key(&mut self, geom: &Geometry) -> Result<Option<(BkeyDecoded, std::ops::Range<usize>)>> {
        loop {
            if self.pos >= self.keys_end {
                if !self.next_bset(geom)? {
                    return Ok(None);
                }
                continue;
            }

            let key_area_start = self.pos;
            let header = self
                .node
                .get_at(key_area_start, 3)
                .ok_or_else(|| Error::CorruptImage("bkey header out of range".to_string()))?;
            let u64s = usize::from(header[0]);
            let format = header[1] & 0x7f;
            let key_type = header[2];
            if u64s == 0 {
                return Err(Error::CorruptImage("zero-length bkey".to_string()));
            }
            let total = u64s * 8;
            if key_area_start + total > self.keys_end {
                return Err(Error::CorruptImage("bkey overruns bset".to_string()));
            }

            let (key, key_u64s) = match format {
                KEY_FORMAT_CURRENT => {
                    if total < BKEY_BYTES {
                        return Err(Error::CorruptImage("unpacked bkey too short".to_string()));
                    }
                    let raw = BkeyRaw::read_le(&mut Cursor::new(
                        &self.node[key_area_start..key_area_start + BKEY_BYTES],
                    ))?;
                    (
                        BkeyDecoded {
                            inode: raw.p.inode,
                            offset: raw.p.offset,
                            snapshot: raw.p.snapshot,
                            size: raw.size,
                            key_type,
                        },
                        usize::from(BKEY_U64S),
                    )
                }
                KEY_FORMAT_LOCAL_BTREE => {
                    let key_u64s = usize::from(self.format.key_u64s);
                    if key_u64s * 8 > total || key_u64s == 0 {
                        return Err(Error::CorruptImage("packed bkey too short".to_string()));
                    }
                    let area = &self.node[key_area_start..key_area_start + key_u64s * 8];
                    (unpack_key(area, &self.format, key_type)?, key_u64s)
                }
                other => {
                    return Err(Error::CorruptImage(format!("unknown bkey format: {other}")));
                }
            };

            self.pos = key_area_start + total;

            // Keys must be strictly ordered within a bset.
            let pos_tuple = (key.inode, key.offset, key.snapshot);
            if let Some(last) = self.last_key {
                if pos_tuple <= last {
                    return Err(Error::CorruptImage("bkeys out of order".to_string()));
                }
            }
            self.last_key = Some(pos_tuple);

            let value_range = key_area_start + key_u64s * 8..key_area_start + total;
            return Ok(Some((key, value_range)));
        }
    }
}

/// Unpacks a KEY_FORMAT_LOCAL_BTREE key against the node's format: present
/// fields sit back to front at the end of the key area, each an offset plus
/// a little-endian remainder of bits_per_field bits.
fn unpack_key(area: &[u8], format: &BkeyFormat, key_type: u8) -> Result<BkeyDecoded> {
    let mut key = BkeyDecoded {
        key_type,
        ..BkeyDecoded::default()
    };
    let mut end = area.len();
    for i in 0..6 {
        let bits = usize::from(format.bits_per_field[i]);
        let base = format.field_offset[i];
        if base == 0 && bits == 0 {
            continue;
        }
        if bits % 8 != 0 {
            return Err(Error::CorruptImage(format!(
                "unsupported key packing: {bits} bits"
            )));
        }
        let bytes = bits / 8;
        end = end
            .checked_sub(bytes)
            .ok_or_else(|| Error::CorruptImage("packed key fields overrun key".to_string()))?;
        let mut word = [0u8; 8];
        word[..bytes].copy_from_slice(&area[end..end + bytes]);
        let value = base.wrapping_add(u64::from_le_bytes(word));

        match i {
            BKEY_FIELD_INODE => key.inode = value,
            BKEY_FIELD_OFFSET => key.offset = value,
            BKEY_FIELD_SNAPSHOT => key.snapshot = value as u32,
            BKEY_FIELD_SIZE => key.size = value as u32,
            _ => {}
        }
    }
    Ok(key)
}
