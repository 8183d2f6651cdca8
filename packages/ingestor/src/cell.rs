//! Cells and Cell Readers
//!
//! A cell is the base wire unit of TON messages: up to 1023 data bits plus up to
//! four references to child cells. `CellBuilder` assembles cells, `CellReader`
//! walks one cell front to back and hands out readers for its children.

use std::collections::HashSet;
use std::sync::Arc;

use alloy::primitives::U256;
use thiserror::Error;

use crate::address::MsgAddress;

/// Maximum number of data bits in a single cell
pub const MAX_CELL_BITS: usize = 1023;

/// Maximum number of child references in a single cell
pub const MAX_CELL_REFS: usize = 4;

/// Upper bound on the number of cells a chained string may span.
/// Matches the maximum cell depth accepted by the network.
pub const MAX_CHAIN_CELLS: usize = 1024;

/// Width of the byte-length prefix of a `VarUInteger 16` amount
pub const AMOUNT_LEN_BITS: usize = 4;

/// Largest byte length an amount can declare
pub const MAX_AMOUNT_BYTES: usize = 15;

/// Errors raised while building or reading cells
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Not enough bits: needed {needed}, {remaining} remaining")]
    NotEnoughBits { needed: usize, remaining: usize },

    #[error("No child reference left to read")]
    NotEnoughRefs,

    #[error("Invalid integer width: {0} bits")]
    InvalidBitWidth(usize),

    #[error("Unsupported address tag: {0:#04b}")]
    UnsupportedAddress(u8),

    #[error("Anycast addresses are not supported")]
    AnycastAddress,

    #[error("Invalid address string: {0}")]
    InvalidAddress(String),

    #[error("String segment is not byte aligned ({0} bits)")]
    MisalignedString(usize),

    #[error("String is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("String chain exceeds {0} cells")]
    ChainTooLong(usize),

    #[error("String chain revisits a cell")]
    ChainCycle,

    #[error("Cell overflow: {0}")]
    CellOverflow(String),

    #[error("Invalid bag of cells: {0}")]
    InvalidBoc(String),

    #[error("Unsupported message layout: {0}")]
    UnsupportedMessage(&'static str),
}

/// An immutable cell: a bit string plus ordered child cells
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cell {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Arc<Cell>>,
}

impl Cell {
    /// Build a cell from raw parts, checking the size limits.
    ///
    /// Bits past `bit_len` in the last data byte are cleared.
    pub fn from_parts(
        mut data: Vec<u8>,
        bit_len: usize,
        refs: Vec<Arc<Cell>>,
    ) -> Result<Self, DecodeError> {
        if bit_len > MAX_CELL_BITS {
            return Err(DecodeError::CellOverflow(format!(
                "{bit_len} bits exceeds the {MAX_CELL_BITS} bit limit"
            )));
        }
        if refs.len() > MAX_CELL_REFS {
            return Err(DecodeError::CellOverflow(format!(
                "{} references exceeds the {MAX_CELL_REFS} reference limit",
                refs.len()
            )));
        }
        let byte_len = bit_len.div_ceil(8);
        if data.len() < byte_len {
            return Err(DecodeError::CellOverflow(format!(
                "{} data bytes cannot hold {bit_len} bits",
                data.len()
            )));
        }
        data.truncate(byte_len);
        if bit_len % 8 != 0 {
            if let Some(last) = data.last_mut() {
                *last &= 0xffu8 << (8 - bit_len % 8);
            }
        }
        Ok(Self { data, bit_len, refs })
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// Data bytes; the last byte is zero-padded when `bit_len` is not byte aligned
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn refs(&self) -> &[Arc<Cell>] {
        &self.refs
    }

    /// Start reading this cell from its first bit
    pub fn reader(&self) -> CellReader<'_> {
        CellReader::new(self)
    }

    fn bit_at(&self, index: usize) -> bool {
        (self.data[index / 8] >> (7 - index % 8)) & 1 == 1
    }
}

/// Incremental cell constructor
#[derive(Debug, Clone, Default)]
pub struct CellBuilder {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Arc<Cell>>,
}

impl CellBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of data bits that can still be stored
    pub fn remaining_bits(&self) -> usize {
        MAX_CELL_BITS - self.bit_len
    }

    fn ensure_capacity(&self, bits: usize) -> Result<(), DecodeError> {
        if bits > self.remaining_bits() {
            return Err(DecodeError::CellOverflow(format!(
                "cannot store {bits} bits, {} remaining",
                self.remaining_bits()
            )));
        }
        Ok(())
    }

    pub fn store_bit(&mut self, bit: bool) -> Result<&mut Self, DecodeError> {
        self.ensure_capacity(1)?;
        if self.bit_len % 8 == 0 {
            self.data.push(0);
        }
        if bit {
            let index = self.bit_len / 8;
            self.data[index] |= 0x80 >> (self.bit_len % 8);
        }
        self.bit_len += 1;
        Ok(self)
    }

    /// Store `value` as a big-endian unsigned integer of `bits` width (1..=64)
    pub fn store_uint(&mut self, value: u64, bits: usize) -> Result<&mut Self, DecodeError> {
        if bits == 0 || bits > 64 {
            return Err(DecodeError::InvalidBitWidth(bits));
        }
        if bits < 64 && value >> bits != 0 {
            return Err(DecodeError::CellOverflow(format!(
                "{value} does not fit in {bits} bits"
            )));
        }
        self.ensure_capacity(bits)?;
        for shift in (0..bits).rev() {
            self.store_bit((value >> shift) & 1 == 1)?;
        }
        Ok(self)
    }

    /// Store `value` in two's complement using `bits` width (1..=64)
    pub fn store_int(&mut self, value: i64, bits: usize) -> Result<&mut Self, DecodeError> {
        if bits == 0 || bits > 64 {
            return Err(DecodeError::InvalidBitWidth(bits));
        }
        if bits < 64 {
            let min = -(1i64 << (bits - 1));
            let max = (1i64 << (bits - 1)) - 1;
            if value < min || value > max {
                return Err(DecodeError::CellOverflow(format!(
                    "{value} does not fit in {bits} signed bits"
                )));
            }
            let mask = (1u64 << bits) - 1;
            return self.store_uint(value as u64 & mask, bits);
        }
        self.store_uint(value as u64, bits)
    }

    pub fn store_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self, DecodeError> {
        self.ensure_capacity(bytes.len() * 8)?;
        for byte in bytes {
            self.store_uint(u64::from(*byte), 8)?;
        }
        Ok(self)
    }

    /// Store an amount as `VarUInteger 16`
    pub fn store_amount(&mut self, amount: U256) -> Result<&mut Self, DecodeError> {
        let len = amount.bit_len().div_ceil(8);
        if len > MAX_AMOUNT_BYTES {
            return Err(DecodeError::CellOverflow(format!(
                "amount {amount} needs {len} bytes, at most {MAX_AMOUNT_BYTES} allowed"
            )));
        }
        self.store_uint(len as u64, AMOUNT_LEN_BITS)?;
        let bytes = amount.to_be_bytes::<32>();
        self.store_bytes(&bytes[32 - len..])
    }

    pub fn store_address(&mut self, address: &MsgAddress) -> Result<&mut Self, DecodeError> {
        match address {
            MsgAddress::None => self.store_uint(0b00, 2),
            MsgAddress::Std { workchain, hash } => {
                self.store_uint(0b10, 2)?;
                // no anycast
                self.store_bit(false)?;
                self.store_int(i64::from(*workchain), 8)?;
                self.store_bytes(hash)
            }
        }
    }

    pub fn store_ref(&mut self, cell: Arc<Cell>) -> Result<&mut Self, DecodeError> {
        if self.refs.len() >= MAX_CELL_REFS {
            return Err(DecodeError::CellOverflow(format!(
                "cell already holds {MAX_CELL_REFS} references"
            )));
        }
        self.refs.push(cell);
        Ok(self)
    }

    /// Store a presence bit followed by the reference when present
    pub fn store_maybe_ref(&mut self, cell: Option<Arc<Cell>>) -> Result<&mut Self, DecodeError> {
        match cell {
            Some(cell) => {
                self.store_bit(true)?;
                self.store_ref(cell)
            }
            None => self.store_bit(false),
        }
    }

    pub fn build(&self) -> Cell {
        Cell {
            data: self.data.clone(),
            bit_len: self.bit_len,
            refs: self.refs.clone(),
        }
    }
}

/// Sequential reader over one cell.
///
/// Holds a bit offset into the payload and the index of the next unread child
/// reference. A failed read leaves the cursor where it was.
#[derive(Debug, Clone)]
pub struct CellReader<'a> {
    cell: &'a Cell,
    bit_pos: usize,
    ref_pos: usize,
}

impl<'a> CellReader<'a> {
    pub fn new(cell: &'a Cell) -> Self {
        Self {
            cell,
            bit_pos: 0,
            ref_pos: 0,
        }
    }

    /// The cell this reader is bound to
    pub fn cell(&self) -> &'a Cell {
        self.cell
    }

    pub fn remaining_bits(&self) -> usize {
        self.cell.bit_len - self.bit_pos
    }

    pub fn remaining_refs(&self) -> usize {
        self.cell.refs.len() - self.ref_pos
    }

    fn ensure_bits(&self, needed: usize) -> Result<(), DecodeError> {
        let remaining = self.remaining_bits();
        if needed > remaining {
            return Err(DecodeError::NotEnoughBits { needed, remaining });
        }
        Ok(())
    }

    pub fn read_bit(&mut self) -> Result<bool, DecodeError> {
        self.ensure_bits(1)?;
        let bit = self.cell.bit_at(self.bit_pos);
        self.bit_pos += 1;
        Ok(bit)
    }

    pub fn skip_bits(&mut self, bits: usize) -> Result<(), DecodeError> {
        self.ensure_bits(bits)?;
        self.bit_pos += bits;
        Ok(())
    }

    /// Read a big-endian unsigned integer of `bits` width (1..=64)
    pub fn read_uint(&mut self, bits: usize) -> Result<u64, DecodeError> {
        if bits == 0 || bits > 64 {
            return Err(DecodeError::InvalidBitWidth(bits));
        }
        self.ensure_bits(bits)?;
        let mut value = 0u64;
        for offset in 0..bits {
            let bit = self.cell.bit_at(self.bit_pos + offset);
            value = (value << 1) | u64::from(bit);
        }
        self.bit_pos += bits;
        Ok(value)
    }

    /// Read a two's complement integer of `bits` width (1..=64)
    pub fn read_int(&mut self, bits: usize) -> Result<i64, DecodeError> {
        let raw = self.read_uint(bits)?;
        if bits == 64 {
            return Ok(raw as i64);
        }
        let shift = 64 - bits;
        Ok(((raw << shift) as i64) >> shift)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        self.ensure_bits(len * 8)?;
        if self.bit_pos % 8 == 0 {
            let start = self.bit_pos / 8;
            self.bit_pos += len * 8;
            return Ok(self.cell.data[start..start + len].to_vec());
        }
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            bytes.push(self.read_uint(8)? as u8);
        }
        Ok(bytes)
    }

    /// Read a `VarUInteger 16` amount: a 4-bit byte length, then that many bytes
    pub fn read_amount(&mut self) -> Result<U256, DecodeError> {
        let mut lookahead = self.clone();
        let len = lookahead.read_uint(AMOUNT_LEN_BITS)? as usize;
        let bytes = lookahead.read_bytes(len)?;
        *self = lookahead;
        Ok(U256::from_be_slice(&bytes))
    }

    /// Read a `MsgAddress`. Only `addr_none` and `addr_std` without anycast are accepted.
    pub fn read_address(&mut self) -> Result<MsgAddress, DecodeError> {
        let mut lookahead = self.clone();
        let address = match lookahead.read_uint(2)? {
            0b00 => MsgAddress::None,
            0b10 => {
                if lookahead.read_bit()? {
                    return Err(DecodeError::AnycastAddress);
                }
                let workchain = lookahead.read_int(8)? as i8;
                lookahead.ensure_bits(256)?;
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&lookahead.read_bytes(32)?);
                MsgAddress::Std { workchain, hash }
            }
            tag => return Err(DecodeError::UnsupportedAddress(tag as u8)),
        };
        *self = lookahead;
        Ok(address)
    }

    /// Reader over the next unconsumed child cell
    pub fn read_ref(&mut self) -> Result<CellReader<'a>, DecodeError> {
        let cell: &'a Cell = self.cell;
        let child = cell.refs.get(self.ref_pos).ok_or(DecodeError::NotEnoughRefs)?;
        self.ref_pos += 1;
        Ok(CellReader::new(child.as_ref()))
    }

    /// Shared handle to the next unconsumed child cell
    pub fn read_ref_cell(&mut self) -> Result<Arc<Cell>, DecodeError> {
        let child = self
            .cell
            .refs
            .get(self.ref_pos)
            .cloned()
            .ok_or(DecodeError::NotEnoughRefs)?;
        self.ref_pos += 1;
        Ok(child)
    }

    /// Read a presence flag and, when set, the next child cell.
    ///
    /// Fails if the flag is set but every child has already been consumed.
    pub fn read_optional_ref(&mut self) -> Result<Option<CellReader<'a>>, DecodeError> {
        let mut lookahead = self.clone();
        if !lookahead.read_bit()? {
            *self = lookahead;
            return Ok(None);
        }
        let child = lookahead.read_ref()?;
        *self = lookahead;
        Ok(Some(child))
    }

    /// Read snake-encoded text: the remaining bytes of this cell followed by
    /// the bytes of each continuation cell found in the first remaining reference.
    ///
    /// The chain is bounded by [`MAX_CHAIN_CELLS`] and may not revisit a cell.
    /// Bytes are joined before UTF-8 validation, so a character may straddle cells.
    /// Trees from [`crate::boc::deserialize`] are acyclic already, since it only accepts forward references.
    pub fn read_chained_string(&mut self) -> Result<String, DecodeError> {
        let mut bytes = self.read_segment()?;
        let mut visited: HashSet<*const Cell> = HashSet::new();
        visited.insert(self.cell as *const Cell);

        let mut cells = 1;
        let mut next = self.next_segment()?;
        while let Some(mut segment) = next {
            cells += 1;
            if cells > MAX_CHAIN_CELLS {
                return Err(DecodeError::ChainTooLong(MAX_CHAIN_CELLS));
            }
            if !visited.insert(segment.cell as *const Cell) {
                return Err(DecodeError::ChainCycle);
            }
            bytes.extend(segment.read_segment()?);
            next = segment.next_segment()?;
        }

        String::from_utf8(bytes).map_err(|e| DecodeError::InvalidUtf8(e.to_string()))
    }

    fn read_segment(&mut self) -> Result<Vec<u8>, DecodeError> {
        let bits = self.remaining_bits();
        if bits % 8 != 0 {
            return Err(DecodeError::MisalignedString(bits));
        }
        self.read_bytes(bits / 8)
    }

    fn next_segment(&mut self) -> Result<Option<CellReader<'a>>, DecodeError> {
        if self.remaining_refs() == 0 {
            return Ok(None);
        }
        self.read_ref().map(Some)
    }

    /// Copy the unread bits and references into a standalone cell
    pub fn to_cell(&self) -> Result<Cell, DecodeError> {
        let mut rest = self.clone();
        let mut builder = CellBuilder::new();
        while rest.remaining_bits() > 0 {
            builder.store_bit(rest.read_bit()?)?;
        }
        while rest.remaining_refs() > 0 {
            builder.store_ref(rest.read_ref_cell()?)?;
        }
        Ok(builder.build())
    }
}
