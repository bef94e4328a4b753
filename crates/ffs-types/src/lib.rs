#![forbid(unsafe_code)]
//! Shared value types: block and inode numbers, block sizes, and the map
//! geometry (`D` direct slots, `K` indirection levels, fan-out `F`) that the
//! on-disk pointer layout depends on.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// On-disk width of one block pointer (inode table slot or indirect entry).
pub const POINTER_SIZE: u32 = 4;

/// Largest direct slot count accepted by [`MapGeometry::validate`].
pub const MAX_DIRECT_SLOTS: u32 = 64;

/// Largest indirection depth accepted by [`MapGeometry::validate`].
pub const MAX_INDIRECT_LEVELS: u32 = 4;

/// Physical block address. Block 0 is reserved and never holds file data
/// or an indirect block, so a zero pointer always means "unallocated".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// File-relative logical block number (`byte_offset / block_size`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogicalBlock(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Allocation group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Validated block size (must be a power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [1024, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(1024..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Convert a file byte offset to its logical block (truncating).
    #[must_use]
    pub fn byte_to_block(self, byte_offset: u64) -> LogicalBlock {
        LogicalBlock(byte_offset >> u64::from(self.shift()))
    }

    /// Byte offset of a logical block within its file.
    #[must_use]
    pub fn block_to_byte(self, block: LogicalBlock) -> Option<u64> {
        block.0.checked_mul(u64::from(self.0))
    }

    /// Offset of `byte_offset` within its block.
    #[must_use]
    pub fn offset_in_block(self, byte_offset: u64) -> u32 {
        #[expect(clippy::cast_possible_truncation)]
        let within = (byte_offset & u64::from(self.0 - 1)) as u32;
        within
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

/// Addressing constants of one filesystem instance.
///
/// The inode carries `direct_slots` direct pointers followed by
/// `indirect_levels` root pointers; root slot `i` (1-indexed) holds a
/// level-`i` indirect block. Every indirect block is an array of
/// `fan_out()` little-endian pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MapGeometry {
    /// Block size in bytes.
    pub block_size: u32,
    /// Number of direct slots (`D`).
    pub direct_slots: u32,
    /// Number of indirection levels (`K`).
    pub indirect_levels: u32,
}

impl MapGeometry {
    /// Build and validate a geometry.
    pub fn new(block_size: u32, direct_slots: u32, indirect_levels: u32) -> Result<Self, ParseError> {
        let geometry = Self {
            block_size,
            direct_slots,
            indirect_levels,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Check the invariants every consumer of the geometry relies on.
    ///
    /// Deserialized geometries bypass [`MapGeometry::new`], so mount paths
    /// call this once before using one.
    pub fn validate(&self) -> Result<(), ParseError> {
        BlockSize::new(self.block_size)?;
        if self.direct_slots == 0 || self.direct_slots > MAX_DIRECT_SLOTS {
            return Err(ParseError::InvalidField {
                field: "direct_slots",
                reason: "must be in 1..=64",
            });
        }
        if self.indirect_levels == 0 || self.indirect_levels > MAX_INDIRECT_LEVELS {
            return Err(ParseError::InvalidField {
                field: "indirect_levels",
                reason: "must be in 1..=4",
            });
        }
        let mut total = u64::from(self.direct_slots);
        let mut capacity = 1_u64;
        for _ in 0..self.indirect_levels {
            capacity = capacity
                .checked_mul(self.fan_out())
                .ok_or(ParseError::IntegerConversion {
                    field: "level_capacity",
                })?;
            total = total.checked_add(capacity).ok_or(ParseError::IntegerConversion {
                field: "max_blocks",
            })?;
        }
        Ok(())
    }

    /// Pointers per indirect block (`F`).
    #[must_use]
    pub fn fan_out(&self) -> u64 {
        u64::from(self.block_size / POINTER_SIZE)
    }

    /// Number of data blocks reachable through one level-`level` root (`F^level`).
    #[must_use]
    pub fn level_capacity(&self, level: u32) -> u64 {
        self.fan_out().saturating_pow(level)
    }

    /// Number of addressable logical blocks: `D + F + F^2 + ... + F^K`.
    #[must_use]
    pub fn max_blocks(&self) -> u64 {
        (1..=self.indirect_levels).fold(u64::from(self.direct_slots), |acc, level| {
            acc.saturating_add(self.level_capacity(level))
        })
    }

    /// Total slots in the inode pointer table (`D + K`).
    #[must_use]
    pub fn table_slots(&self) -> usize {
        (self.direct_slots + self.indirect_levels) as usize
    }

    /// Encoded length of the inode pointer table in bytes.
    #[must_use]
    pub fn table_len_bytes(&self) -> usize {
        self.table_slots() * POINTER_SIZE as usize
    }

    /// Maximum file size in bytes this geometry can map.
    #[must_use]
    pub fn max_file_size(&self) -> u64 {
        self.max_blocks().saturating_mul(u64::from(self.block_size))
    }
}

impl Default for MapGeometry {
    fn default() -> Self {
        Self {
            block_size: 4096,
            direct_slots: 12,
            indirect_levels: 3,
        }
    }
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    let actual = data.len().saturating_sub(offset);
    let Some(dst) = data.get_mut(offset..offset.saturating_add(4)) else {
        return Err(ParseError::InsufficientData {
            needed: 4,
            offset,
            actual,
        });
    };
    dst.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Subtract a block count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, count: u64) -> Option<Self> {
        self.0.checked_sub(count).map(Self)
    }

    /// Narrow to the on-disk pointer width, returning
    /// `ParseError::IntegerConversion` on overflow.
    pub fn to_u32(self) -> Result<u32, ParseError> {
        u32::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "block_number",
        })
    }

    /// Decode an on-disk pointer; zero means "unallocated".
    #[must_use]
    pub fn from_pointer(raw: u32) -> Option<Self> {
        (raw != 0).then_some(Self(u64::from(raw)))
    }
}

impl LogicalBlock {
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

/// Compute the allocation group containing `block`.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // group count is u32
pub fn block_to_group(
    block: BlockNumber,
    blocks_per_group: u32,
    first_data_block: u32,
) -> GroupNumber {
    let adjusted = block.0.saturating_sub(u64::from(first_data_block));
    GroupNumber((adjusted / u64::from(blocks_per_group)) as u32)
}

/// Compute the first block of a given allocation group.
pub fn group_first_block(
    group: GroupNumber,
    blocks_per_group: u32,
    first_data_block: u32,
) -> Option<BlockNumber> {
    let offset = u64::from(group.0).checked_mul(u64::from(blocks_per_group))?;
    offset
        .checked_add(u64::from(first_data_block))
        .map(BlockNumber)
}
