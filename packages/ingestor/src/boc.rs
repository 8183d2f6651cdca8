//! Bag of Cells
//!
//! Serialization of cell trees in the `serialized_boc#b5ee9c72` format. Cells in
//! a bag may only reference cells that come after them, which is what makes a
//! deserialized graph acyclic; a backward or self reference is rejected.

use std::sync::Arc;

use base64ct::{Base64, Encoding};
use crc::{Crc, CRC_32_ISCSI};

use crate::cell::{Cell, DecodeError, MAX_CELL_REFS};

/// Magic prefix of a serialized bag of cells
pub const BOC_MAGIC: [u8; 4] = [0xb5, 0xee, 0x9c, 0x72];

const FLAG_HAS_INDEX: u8 = 0x80;
const FLAG_HAS_CRC: u8 = 0x40;
const SIZE_MASK: u8 = 0x07;

/// Every serialized cell carries at least its two descriptor bytes
const MIN_CELL_BYTES: usize = 2;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

struct ByteCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.bytes.len());
        let end = end.ok_or_else(|| {
            DecodeError::InvalidBoc(format!(
                "truncated: wanted {len} bytes at offset {}, have {}",
                self.pos,
                self.bytes.len()
            ))
        })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_be(&mut self, len: usize) -> Result<usize, DecodeError> {
        Ok(self
            .take(len)?
            .iter()
            .fold(0usize, |acc, byte| (acc << 8) | usize::from(*byte)))
    }
}

struct RawCell<'a> {
    data: &'a [u8],
    bit_len: usize,
    refs: Vec<usize>,
}

/// Deserialize every root of a bag of cells
pub fn deserialize(bytes: &[u8]) -> Result<Vec<Arc<Cell>>, DecodeError> {
    let mut cursor = ByteCursor { bytes, pos: 0 };

    if cursor.take(4)? != BOC_MAGIC {
        return Err(DecodeError::InvalidBoc("bad magic".to_string()));
    }
    let flags = cursor.byte()?;
    let size = usize::from(flags & SIZE_MASK);
    if size == 0 || size > 4 {
        return Err(DecodeError::InvalidBoc(format!("invalid reference size {size}")));
    }
    let offset_size = usize::from(cursor.byte()?);
    if offset_size == 0 || offset_size > 8 {
        return Err(DecodeError::InvalidBoc(format!("invalid offset size {offset_size}")));
    }

    let cell_count = cursor.read_be(size)?;
    let root_count = cursor.read_be(size)?;
    let _absent = cursor.read_be(size)?;
    let total_size = cursor.read_be(offset_size)?;

    if root_count > cell_count {
        return Err(DecodeError::InvalidBoc(format!(
            "{root_count} roots for {cell_count} cells"
        )));
    }
    if total_size > bytes.len() || cell_count > total_size / MIN_CELL_BYTES {
        return Err(DecodeError::InvalidBoc(format!(
            "{cell_count} cells cannot fit in {total_size} bytes of a {} byte bag",
            bytes.len()
        )));
    }

    let mut roots = Vec::with_capacity(root_count);
    for _ in 0..root_count {
        let root = cursor.read_be(size)?;
        if root >= cell_count {
            return Err(DecodeError::InvalidBoc(format!("root index {root} out of range")));
        }
        roots.push(root);
    }
    if flags & FLAG_HAS_INDEX != 0 {
        cursor.take(cell_count * offset_size)?;
    }

    let mut data = ByteCursor {
        bytes: cursor.take(total_size)?,
        pos: 0,
    };
    if flags & FLAG_HAS_CRC != 0 {
        let signed = &bytes[..cursor.pos];
        let trailer = cursor.take(4)?;
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = CRC32C.checksum(signed);
        if stored != actual {
            return Err(DecodeError::InvalidBoc(format!(
                "crc32c mismatch: stored {stored:08x}, computed {actual:08x}"
            )));
        }
    }

    let mut raw_cells = Vec::with_capacity(cell_count);
    for index in 0..cell_count {
        raw_cells.push(read_raw_cell(&mut data, index, cell_count, size)?);
    }

    // children always sit after their parents, so build back to front
    let mut built: Vec<Option<Arc<Cell>>> = vec![None; cell_count];
    for (index, raw) in raw_cells.iter().enumerate().rev() {
        let refs = raw
            .refs
            .iter()
            .map(|child| {
                built[*child]
                    .clone()
                    .ok_or_else(|| DecodeError::InvalidBoc(format!("cell {child} missing")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let cell = Cell::from_parts(raw.data.to_vec(), raw.bit_len, refs)?;
        built[index] = Some(Arc::new(cell));
    }

    roots
        .into_iter()
        .map(|root| {
            built[root]
                .clone()
                .ok_or_else(|| DecodeError::InvalidBoc(format!("root {root} missing")))
        })
        .collect()
}

fn read_raw_cell<'a>(
    data: &mut ByteCursor<'a>,
    index: usize,
    cell_count: usize,
    size: usize,
) -> Result<RawCell<'a>, DecodeError> {
    let d1 = data.byte()?;
    let d2 = data.byte()?;
    let ref_count = usize::from(d1 & 0x07);
    if ref_count > MAX_CELL_REFS {
        return Err(DecodeError::InvalidBoc(format!("cell {index} has {ref_count} references")));
    }
    if d1 & 0x08 != 0 {
        return Err(DecodeError::InvalidBoc(format!("cell {index} is exotic")));
    }
    if d1 & 0x10 != 0 {
        return Err(DecodeError::InvalidBoc(format!("cell {index} carries stored hashes")));
    }

    let byte_len = usize::from(d2).div_ceil(2);
    let bytes = data.take(byte_len)?;
    let bit_len = if d2 % 2 == 0 {
        byte_len * 8
    } else {
        // the last byte ends with a completion tag: a one bit followed by zeros
        let last = bytes[byte_len - 1];
        if last == 0 {
            return Err(DecodeError::InvalidBoc(format!("cell {index} lacks a completion tag")));
        }
        byte_len * 8 - last.trailing_zeros() as usize - 1
    };

    let mut refs = Vec::with_capacity(ref_count);
    for _ in 0..ref_count {
        let child = data.read_be(size)?;
        if child <= index || child >= cell_count {
            return Err(DecodeError::InvalidBoc(format!(
                "reference from cell {index} to cell {child} does not point forward"
            )));
        }
        refs.push(child);
    }

    Ok(RawCell {
        data: bytes,
        bit_len,
        refs,
    })
}

/// Deserialize a bag of cells that must hold exactly one root
pub fn deserialize_single(bytes: &[u8]) -> Result<Arc<Cell>, DecodeError> {
    let mut roots = deserialize(bytes)?;
    if roots.len() != 1 {
        return Err(DecodeError::InvalidBoc(format!(
            "expected one root, found {}",
            roots.len()
        )));
    }
    Ok(roots.remove(0))
}

/// Serialize a cell tree with a single root, without index, crc or deduplication
pub fn serialize(root: &Cell) -> Vec<u8> {
    let mut order: Vec<(&Cell, Vec<usize>)> = Vec::new();
    collect(root, &mut order);

    let size = bytes_for(order.len());
    let mut cells = Vec::new();
    for (cell, refs) in &order {
        let bit_len = cell.bit_len();
        cells.push(refs.len() as u8);
        cells.push(((bit_len / 8) + bit_len.div_ceil(8)) as u8);
        let mut data = cell.data().to_vec();
        if bit_len % 8 != 0 {
            if let Some(last) = data.last_mut() {
                *last |= 0x80 >> (bit_len % 8);
            }
        }
        cells.extend_from_slice(&data);
        for child in refs {
            write_be(&mut cells, *child, size);
        }
    }
    let offset_size = bytes_for(cells.len());

    let mut out = Vec::with_capacity(cells.len() + 16);
    out.extend_from_slice(&BOC_MAGIC);
    out.push(size as u8);
    out.push(offset_size as u8);
    write_be(&mut out, order.len(), size);
    write_be(&mut out, 1, size);
    write_be(&mut out, 0, size);
    write_be(&mut out, cells.len(), offset_size);
    write_be(&mut out, 0, size);
    out.extend_from_slice(&cells);
    out
}

fn collect<'a>(cell: &'a Cell, order: &mut Vec<(&'a Cell, Vec<usize>)>) -> usize {
    let index = order.len();
    order.push((cell, Vec::new()));
    let refs = cell.refs().iter().map(|child| collect(child, order)).collect();
    order[index].1 = refs;
    index
}

fn bytes_for(value: usize) -> usize {
    let mut len = 1;
    while len < 8 && value >> (len * 8) != 0 {
        len += 1;
    }
    len
}

fn write_be(out: &mut Vec<u8>, value: usize, len: usize) {
    for shift in (0..len).rev() {
        out.push((value >> (shift * 8)) as u8);
    }
}

/// Decode a base64 (standard alphabet) bag of cells with one root
pub fn from_base64(encoded: &str) -> Result<Arc<Cell>, DecodeError> {
    let bytes = Base64::decode_vec(encoded.trim())
        .map_err(|e| DecodeError::InvalidBoc(format!("base64: {e}")))?;
    deserialize_single(&bytes)
}

pub fn to_base64(root: &Cell) -> String {
    Base64::encode_string(&serialize(root))
}
