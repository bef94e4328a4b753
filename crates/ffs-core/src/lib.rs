#![forbid(unsafe_code)]
//! Mounted volume: one device, its buffer cache, its block allocator and
//! the block mapper, plus a byte-granular file read/write path on top.

use ffs_alloc::{AllocationContext, BitmapAllocator, BlockAllocator};
use ffs_block::{
    BlockDevice, BufferCache, ByteBlockDevice, CacheStats, Durability, FileByteDevice,
    MemoryByteDevice, WriteBackCache,
};
use ffs_bmap::{FillPolicy, Materializer, ResolveFlags};
use ffs_error::{FfsError, Result};
use ffs_inode::{Inode, SharedInode};
use ffs_types::{BlockNumber, BlockSize, InodeNumber, LogicalBlock, MapGeometry, ParseError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ── Mount options ───────────────────────────────────────────────────────────

/// Options fixed for the lifetime of a mount.
///
/// Every field has a default, so a configuration file only needs to name
/// what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Block size, direct slots and indirection depth of every inode.
    pub geometry: MapGeometry,
    /// Allocation group size in blocks.
    pub blocks_per_group: u32,
    /// Clean blocks kept in memory.
    pub cache_capacity_blocks: usize,
    /// How parents are written after a new pointer is stored in them.
    pub metadata_durability: Durability,
    /// Reject every mutation with `ReadOnly`.
    pub read_only: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            geometry: MapGeometry::default(),
            blocks_per_group: 8192,
            cache_capacity_blocks: 256,
            metadata_durability: Durability::Synchronous,
            read_only: false,
        }
    }
}

impl MountOptions {
    pub fn validate(&self) -> Result<()> {
        self.geometry.validate().map_err(|e| parse_error_to_ffs(&e))?;
        if self.blocks_per_group == 0 {
            return Err(FfsError::InvalidGeometry(
                "blocks_per_group must be > 0".to_owned(),
            ));
        }
        if self.cache_capacity_blocks == 0 {
            return Err(FfsError::InvalidArgument(
                "cache_capacity_blocks must be > 0".to_owned(),
            ));
        }
        if self.metadata_durability == Durability::None {
            return Err(FfsError::InvalidArgument(
                "metadata_durability must be synchronous or delayed".to_owned(),
            ));
        }
        Ok(())
    }
}

fn parse_error_to_ffs(err: &ParseError) -> FfsError {
    FfsError::InvalidGeometry(err.to_string())
}

/// Counters reported by [`Volume::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub cache: CacheStats,
}

// ── Volume ──────────────────────────────────────────────────────────────────

/// A mounted block device.
///
/// Allocation state lives in memory only: every mount starts with all
/// data blocks free. Files survive a remount through
/// [`export_inode`](Self::export_inode) and
/// [`import_inode`](Self::import_inode), which reserves the imported tree.
pub struct Volume<D: BlockDevice> {
    options: MountOptions,
    block_size: BlockSize,
    cache: WriteBackCache<D>,
    ctx: AllocationContext,
    alloc: BitmapAllocator,
}

impl<D: BlockDevice> std::fmt::Debug for Volume<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("options", &self.options)
            .field("total_blocks", &self.ctx.total_blocks())
            .field("free_blocks", &self.alloc.free_count())
            .finish_non_exhaustive()
    }
}

impl<D: BlockDevice> Volume<D> {
    /// Mount `dev`. The device block size must match the geometry.
    pub fn open(dev: D, options: MountOptions) -> Result<Self> {
        options.validate()?;
        if dev.block_size() != options.geometry.block_size {
            return Err(FfsError::InvalidGeometry(format!(
                "device block size {} does not match geometry block size {}",
                dev.block_size(),
                options.geometry.block_size
            )));
        }
        let block_size =
            BlockSize::new(options.geometry.block_size).map_err(|e| parse_error_to_ffs(&e))?;
        let ctx = AllocationContext::new(dev.block_count(), options.blocks_per_group)?;
        let alloc = BitmapAllocator::new(&ctx);
        let cache = WriteBackCache::new(dev, options.cache_capacity_blocks)?;
        info!(
            target: "ffs::core",
            event = "mount",
            block_size = options.geometry.block_size,
            blocks = ctx.total_blocks(),
            groups = ctx.group_count(),
            direct_slots = options.geometry.direct_slots,
            indirect_levels = options.geometry.indirect_levels,
            read_only = options.read_only
        );
        Ok(Self {
            options,
            block_size,
            cache,
            ctx,
            alloc,
        })
    }

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    #[must_use]
    pub fn cache(&self) -> &WriteBackCache<D> {
        &self.cache
    }

    #[must_use]
    pub fn context(&self) -> &AllocationContext {
        &self.ctx
    }

    #[must_use]
    pub fn allocator(&self) -> &BitmapAllocator {
        &self.alloc
    }

    /// Block mapper bound to this volume's cache and allocator.
    pub fn materializer(&self) -> Result<Materializer<'_>> {
        Materializer::new(self.options.geometry, &self.cache, &self.alloc, &self.ctx)
    }

    /// New empty inode, optionally placed near `home`.
    pub fn create_inode(
        &self,
        ino: InodeNumber,
        home: Option<BlockNumber>,
    ) -> Result<Arc<SharedInode>> {
        let inode = Inode::new(ino, self.options.geometry)?;
        let inode = match home {
            Some(home) => inode.with_home(home),
            None => inode,
        };
        Ok(Arc::new(SharedInode::new(inode)))
    }

    /// Flush the volume, then encode `inode`'s pointer table for the caller
    /// to store. The inode is clean afterwards: every block the table
    /// reaches is on the device.
    pub fn export_inode(&self, inode: &SharedInode) -> Result<Vec<u8>> {
        let mut guard = inode.write();
        let table = guard.encode_pointer_table()?;
        self.flush()?;
        guard.clear_dirty();
        drop(guard);
        debug!(target: "ffs::core", event = "inode_export", ino = inode.ino().0);
        Ok(table)
    }

    /// Load an inode from a table written by
    /// [`export_inode`](Self::export_inode). Every block its tree reaches is
    /// reserved in the allocator, so later writes never reuse them.
    pub fn import_inode(
        &self,
        ino: InodeNumber,
        table: &[u8],
        size: u64,
    ) -> Result<Arc<SharedInode>> {
        let geometry = self.options.geometry;
        if size > geometry.max_file_size() {
            return Err(FfsError::InvalidArgument(format!(
                "size {size} exceeds the maximum file size {}",
                geometry.max_file_size()
            )));
        }
        let mut inode = Inode::from_pointer_table(ino, geometry, table)?;
        let blocks = self.materializer()?.mapped_blocks(&inode)?;
        self.reserve_tree(ino, &blocks)?;

        inode.set_blocks(blocks.len() as u64);
        inode.set_size(size);
        inode.clear_dirty();
        info!(
            target: "ffs::core",
            event = "inode_import",
            ino = ino.0,
            blocks = blocks.len(),
            size
        );
        Ok(Arc::new(SharedInode::new(inode)))
    }

    /// Reserve `blocks` for `ino`, undoing every reservation if one of them
    /// is already in use.
    fn reserve_tree(&self, ino: InodeNumber, blocks: &[BlockNumber]) -> Result<()> {
        for (done, &block) in blocks.iter().enumerate() {
            let conflict = if self.alloc.is_allocated(&self.ctx, block) {
                Some(FfsError::Corruption {
                    block: block.0,
                    detail: format!("inode {ino} reaches a block that is already in use"),
                })
            } else {
                self.alloc.reserve(&self.ctx, block).err()
            };
            if let Some(err) = conflict {
                for &taken in &blocks[..done] {
                    if let Err(free_err) = self.alloc.free(&self.ctx, taken) {
                        warn!(
                            target: "ffs::core",
                            event = "reserve_undo_failed",
                            block = taken.0,
                            error = %free_err
                        );
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Write `data` at byte `offset`, allocating blocks as needed, and grow
    /// the file to cover it. Data blocks are released as delayed writes;
    /// call [`flush`](Self::flush) to make them durable.
    pub fn write(&self, inode: &SharedInode, offset: u64, data: &[u8]) -> Result<usize> {
        if self.options.read_only {
            return Err(FfsError::ReadOnly);
        }
        let end = u64::try_from(data.len())
            .ok()
            .and_then(|len| offset.checked_add(len))
            .ok_or_else(|| FfsError::InvalidArgument("write range overflows".to_owned()))?;

        let mapper = self.materializer()?;
        let bs = self.block_size.get();
        let mut written = 0_usize;
        let mut pos = offset;
        while pos < end {
            let lbn = self.block_size.byte_to_block(pos);
            let in_block = self.block_size.offset_in_block(pos);
            #[expect(clippy::cast_possible_truncation)]
            let chunk = (end - pos).min(u64::from(bs - in_block)) as u32;
            let fill = if in_block == 0 && chunk == bs {
                FillPolicy::Overwrite
            } else {
                FillPolicy::ZeroFill
            };
            let flags = ResolveFlags::allocate()
                .with_fill(fill)
                .with_metadata(self.options.metadata_durability);

            let mut handle = mapper.resolve_shared(inode, lbn, chunk, flags)?;
            let start = in_block as usize;
            let len = chunk as usize;
            handle.buffer.as_mut_slice()[start..start + len]
                .copy_from_slice(&data[written..written + len]);
            self.cache.release(handle.into_buffer(), Durability::Delayed)?;

            written += len;
            pos += u64::from(chunk);
            let mut guard = inode.write();
            if guard.size() < pos {
                guard.set_size(pos);
            }
        }
        debug!(
            target: "ffs::core",
            event = "write",
            ino = inode.ino().0,
            offset,
            len = written
        );
        Ok(written)
    }

    /// Read up to `len` bytes at `offset`. Holes read as zeros; the result
    /// stops at the file size.
    pub fn read(&self, inode: &SharedInode, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mapper = self.materializer()?;
        let guard = inode.read();
        let size = guard.size();
        if offset >= size {
            return Ok(Vec::new());
        }
        let want = u64::try_from(len).unwrap_or(u64::MAX);
        let end = offset.saturating_add(want).min(size);
        let bs = self.block_size.get();

        let mut out = Vec::with_capacity(usize::try_from(end - offset).unwrap_or(0));
        let mut pos = offset;
        while pos < end {
            let lbn = self.block_size.byte_to_block(pos);
            let in_block = self.block_size.offset_in_block(pos) as usize;
            #[expect(clippy::cast_possible_truncation)]
            let chunk = (end - pos).min(u64::from(bs) - in_block as u64) as usize;
            match mapper.lookup(&guard, lbn)? {
                Some(block) => {
                    let bytes = self.cache.peek(block)?;
                    out.extend_from_slice(&bytes[in_block..in_block + chunk]);
                }
                None => out.resize(out.len() + chunk, 0),
            }
            pos += chunk as u64;
        }
        drop(guard);
        Ok(out)
    }

    /// Physical block of `lbn`, `None` for a hole.
    pub fn map(&self, inode: &SharedInode, lbn: LogicalBlock) -> Result<Option<BlockNumber>> {
        self.materializer()?.lookup(&inode.read(), lbn)
    }

    /// Write back every delayed block and sync the device.
    pub fn flush(&self) -> Result<usize> {
        if self.options.read_only {
            return Ok(0);
        }
        let written = self.cache.flush()?;
        debug!(target: "ffs::core", event = "volume_flush", written);
        Ok(written)
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.alloc.free_count()
    }

    #[must_use]
    pub fn stats(&self) -> VolumeStats {
        VolumeStats {
            total_blocks: self.ctx.total_blocks(),
            free_blocks: self.free_blocks(),
            cache: self.cache.stats(),
        }
    }
}

impl Volume<ByteBlockDevice<FileByteDevice>> {
    /// Mount an existing image file.
    pub fn open_file(path: impl AsRef<Path>, options: MountOptions) -> Result<Self> {
        let file = FileByteDevice::open(path.as_ref())?;
        if !options.read_only && !file.is_writable() {
            return Err(FfsError::PermissionDenied);
        }
        let dev = ByteBlockDevice::new(file, options.geometry.block_size)?;
        Self::open(dev, options)
    }

    /// Create (or truncate) an image file of `blocks` blocks and mount it.
    pub fn create_file(path: impl AsRef<Path>, blocks: u64, options: MountOptions) -> Result<Self> {
        let len = blocks
            .checked_mul(u64::from(options.geometry.block_size))
            .ok_or_else(|| FfsError::InvalidArgument(format!("{blocks} blocks overflow")))?;
        let file = FileByteDevice::create(path.as_ref(), len)?;
        let dev = ByteBlockDevice::new(file, options.geometry.block_size)?;
        Self::open(dev, options)
    }
}

impl Volume<ByteBlockDevice<MemoryByteDevice>> {
    /// Volume over a zeroed in-memory device of `blocks` blocks.
    pub fn in_memory(blocks: u64, options: MountOptions) -> Result<Self> {
        let len = blocks
            .checked_mul(u64::from(options.geometry.block_size))
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| FfsError::InvalidArgument(format!("{blocks} blocks overflow")))?;
        let dev = ByteBlockDevice::new(MemoryByteDevice::new(len), options.geometry.block_size)?;
        Self::open(dev, options)
    }
}
