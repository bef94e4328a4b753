//! Typed view over an indirect block: a dense array of little-endian `u32`
//! block pointers where 0 means "unallocated".

use ffs_error::{FfsError, Result};
use ffs_types::{BlockNumber, POINTER_SIZE, read_le_u32, write_le_u32};

#[derive(Debug)]
pub struct IndirectBlock<B> {
    block: BlockNumber,
    bytes: B,
    device_blocks: u64,
}

impl<B: AsRef<[u8]>> IndirectBlock<B> {
    /// View `bytes` (the contents of `block`). Pointers at or beyond
    /// `device_blocks` are reported as corruption.
    pub fn new(block: BlockNumber, bytes: B, device_blocks: u64) -> Self {
        Self {
            block,
            bytes,
            device_blocks,
        }
    }

    /// Number of pointer entries (`F`).
    #[must_use]
    pub fn fan_out(&self) -> u32 {
        #[expect(clippy::cast_possible_truncation)]
        let entries = (self.bytes.as_ref().len() / POINTER_SIZE as usize) as u32;
        entries
    }

    fn raw(&self, index: u32) -> Result<u32> {
        if index >= self.fan_out() {
            return Err(FfsError::InvalidArgument(format!(
                "indirect entry {index} out of range (F={})",
                self.fan_out()
            )));
        }
        read_le_u32(self.bytes.as_ref(), index as usize * POINTER_SIZE as usize)
            .map_err(|e| FfsError::Format(e.to_string()))
    }

    /// Entry `index`, validated against the device size.
    pub fn get(&self, index: u32) -> Result<Option<BlockNumber>> {
        let Some(child) = BlockNumber::from_pointer(self.raw(index)?) else {
            return Ok(None);
        };
        if child.0 >= self.device_blocks {
            return Err(FfsError::Corruption {
                block: self.block.0,
                detail: format!(
                    "entry {index} points at block {} past end of device ({})",
                    child.0, self.device_blocks
                ),
            });
        }
        Ok(Some(child))
    }

    /// Nearest non-zero entry before `index`, if any.
    #[must_use]
    pub fn prev_nonzero(&self, index: u32) -> Option<BlockNumber> {
        (0..index.min(self.fan_out()))
            .rev()
            .find_map(|i| self.raw(i).ok().and_then(BlockNumber::from_pointer))
    }

    /// How many entries starting at `index` map to consecutive physical
    /// blocks beginning with `first`, capped at `max`.
    pub fn contiguous_from(&self, index: u32, first: BlockNumber, max: u64) -> Result<u64> {
        let mut len = 0_u64;
        let mut expected = first;
        let mut i = index;
        while len < max && i < self.fan_out() {
            if self.get(i)? != Some(expected) {
                break;
            }
            len += 1;
            i += 1;
            let Some(next) = expected.checked_add(1) else {
                break;
            };
            expected = next;
        }
        Ok(len)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> IndirectBlock<B> {
    /// Store `child` (or clear the entry) at `index`.
    pub fn set(&mut self, index: u32, child: Option<BlockNumber>) -> Result<()> {
        if index >= self.fan_out() {
            return Err(FfsError::InvalidArgument(format!(
                "indirect entry {index} out of range (F={})",
                self.fan_out()
            )));
        }
        let raw = match child {
            Some(block) => block
                .to_u32()
                .map_err(|e| FfsError::InvalidGeometry(e.to_string()))?,
            None => 0,
        };
        write_le_u32(self.bytes.as_mut(), index as usize * POINTER_SIZE as usize, raw)
            .map_err(|e| FfsError::Format(e.to_string()))
    }
}
