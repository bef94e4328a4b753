#![forbid(unsafe_code)]
//! In-memory inode state used by the block mapper.
//!
//! An [`Inode`] owns the block-pointer table (`D` direct slots followed by
//! `K` indirect roots), the dirty flag, and the allocation hints the
//! locality policy reads. [`SharedInode`] adds the per-inode lock that
//! serializes allocating resolutions.

use ffs_error::{FfsError, Result};
use ffs_types::{BlockNumber, InodeNumber, MapGeometry, POINTER_SIZE, read_le_u32, write_le_u32};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Pointer-table state that a failed resolution must restore exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeSnapshot {
    pointers: Vec<Option<BlockNumber>>,
    dirty: bool,
    last_alloc: Option<BlockNumber>,
    blocks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    ino: InodeNumber,
    geometry: MapGeometry,
    pointers: Vec<Option<BlockNumber>>,
    dirty: bool,
    /// Most recently allocated block (data or indirect).
    last_alloc: Option<BlockNumber>,
    /// Region of the containing directory, used for the first block.
    home: Option<BlockNumber>,
    /// Blocks charged to this inode, indirect blocks included.
    blocks: u64,
    size: u64,
}

impl Inode {
    /// Empty inode: every slot unallocated.
    pub fn new(ino: InodeNumber, geometry: MapGeometry) -> Result<Self> {
        geometry
            .validate()
            .map_err(|e| FfsError::InvalidGeometry(e.to_string()))?;
        Ok(Self {
            ino,
            geometry,
            pointers: vec![None; geometry.table_slots()],
            dirty: false,
            last_alloc: None,
            home: None,
            blocks: 0,
            size: 0,
        })
    }

    /// Rebuild an inode from its encoded pointer table.
    pub fn from_pointer_table(ino: InodeNumber, geometry: MapGeometry, table: &[u8]) -> Result<Self> {
        let mut inode = Self::new(ino, geometry)?;
        if table.len() != geometry.table_len_bytes() {
            return Err(FfsError::Format(format!(
                "pointer table is {} bytes, expected {}",
                table.len(),
                geometry.table_len_bytes()
            )));
        }
        for (idx, slot) in inode.pointers.iter_mut().enumerate() {
            let raw = read_le_u32(table, idx * POINTER_SIZE as usize)
                .map_err(|e| FfsError::Format(e.to_string()))?;
            *slot = BlockNumber::from_pointer(raw);
        }
        inode.blocks = inode.pointers.iter().flatten().count() as u64;
        Ok(inode)
    }

    #[must_use]
    pub fn with_home(mut self, home: BlockNumber) -> Self {
        self.home = Some(home);
        self
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    #[must_use]
    pub fn geometry(&self) -> &MapGeometry {
        &self.geometry
    }

    /// The whole table, direct slots first.
    #[must_use]
    pub fn pointers(&self) -> &[Option<BlockNumber>] {
        &self.pointers
    }

    /// Direct slot `slot`; `None` when unallocated or out of range.
    #[must_use]
    pub fn direct(&self, slot: u32) -> Option<BlockNumber> {
        if slot >= self.geometry.direct_slots {
            return None;
        }
        self.pointers.get(slot as usize).copied().flatten()
    }

    pub fn set_direct(&mut self, slot: u32, block: Option<BlockNumber>) -> Result<()> {
        if slot >= self.geometry.direct_slots {
            return Err(FfsError::InvalidArgument(format!(
                "direct slot {slot} out of range (D={})",
                self.geometry.direct_slots
            )));
        }
        self.pointers[slot as usize] = block;
        Ok(())
    }

    /// Root of the level-`level` indirect tree (1-indexed).
    #[must_use]
    pub fn root(&self, level: u32) -> Option<BlockNumber> {
        self.root_index(level)
            .ok()
            .and_then(|idx| self.pointers[idx])
    }

    pub fn set_root(&mut self, level: u32, block: Option<BlockNumber>) -> Result<()> {
        let idx = self.root_index(level)?;
        self.pointers[idx] = block;
        Ok(())
    }

    fn root_index(&self, level: u32) -> Result<usize> {
        if level == 0 || level > self.geometry.indirect_levels {
            return Err(FfsError::InvalidArgument(format!(
                "indirect level {level} out of range (K={})",
                self.geometry.indirect_levels
            )));
        }
        Ok((self.geometry.direct_slots + level - 1) as usize)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Called once the table has been written back.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    #[must_use]
    pub fn last_alloc(&self) -> Option<BlockNumber> {
        self.last_alloc
    }

    #[must_use]
    pub fn home(&self) -> Option<BlockNumber> {
        self.home
    }

    /// Charge a freshly linked block to this inode.
    pub fn note_allocated(&mut self, block: BlockNumber) {
        self.last_alloc = Some(block);
        self.blocks += 1;
    }

    #[must_use]
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Recount after loading a table whose tree was walked elsewhere.
    pub fn set_blocks(&mut self, blocks: u64) {
        self.blocks = blocks;
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_size(&mut self, size: u64) {
        if size != self.size {
            self.size = size;
            self.dirty = true;
        }
    }

    /// Encode the pointer table as `D + K` little-endian `u32` values.
    pub fn encode_pointer_table(&self) -> Result<Vec<u8>> {
        let mut out = vec![0_u8; self.geometry.table_len_bytes()];
        for (idx, slot) in self.pointers.iter().enumerate() {
            let raw = match slot {
                Some(block) => block.to_u32().map_err(|e| FfsError::Format(e.to_string()))?,
                None => 0,
            };
            write_le_u32(&mut out, idx * POINTER_SIZE as usize, raw)
                .map_err(|e| FfsError::Format(e.to_string()))?;
        }
        Ok(out)
    }

    #[must_use]
    pub fn snapshot(&self) -> InodeSnapshot {
        InodeSnapshot {
            pointers: self.pointers.clone(),
            dirty: self.dirty,
            last_alloc: self.last_alloc,
            blocks: self.blocks,
        }
    }

    pub fn restore(&mut self, snapshot: InodeSnapshot) {
        self.pointers = snapshot.pointers;
        self.dirty = snapshot.dirty;
        self.last_alloc = snapshot.last_alloc;
        self.blocks = snapshot.blocks;
    }
}

/// An inode behind its per-inode lock.
///
/// Lookups of mapped blocks share the read lock; any resolution that may
/// allocate holds the write lock for its whole walk.
#[derive(Debug)]
pub struct SharedInode {
    ino: InodeNumber,
    inner: RwLock<Inode>,
}

impl SharedInode {
    #[must_use]
    pub fn new(inode: Inode) -> Self {
        Self {
            ino: inode.ino(),
            inner: RwLock::new(inode),
        }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Inode> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Inode> {
        self.inner.write()
    }

    #[must_use]
    pub fn into_inner(self) -> Inode {
        self.inner.into_inner()
    }
}
