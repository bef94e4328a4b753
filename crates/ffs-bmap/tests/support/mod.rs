#![allow(dead_code)]

use ffs_alloc::{AllocHint, AllocationContext, BitmapAllocator, BlockAllocator};
use ffs_block::{
    BlockBuf, BlockDevice, BufferCache, ByteBlockDevice, MemoryByteDevice, WriteBackCache,
};
use ffs_bmap::{IndirectBlock, Materializer};
use ffs_error::{FfsError, Result};
use ffs_inode::Inode;
use ffs_types::{BlockNumber, InodeNumber, MapGeometry};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

pub const BLOCK_SIZE: u32 = 1024;
/// Fill byte for blocks nobody has written since the image was created.
pub const GARBAGE: u8 = 0xEE;

// ── Devices ─────────────────────────────────────────────────────────────────

/// Memory device that logs writes and fails every write (or sync) once its
/// budget is spent, emulating a crash or a dying disk.
#[derive(Debug)]
pub struct FaultyDevice {
    inner: ByteBlockDevice<MemoryByteDevice>,
    budget: Mutex<Option<usize>>,
    sync_budget: Mutex<Option<usize>>,
    writes: Mutex<Vec<BlockNumber>>,
}

impl FaultyDevice {
    pub fn new(blocks: u64) -> Self {
        let inner = ByteBlockDevice::new(
            MemoryByteDevice::new((blocks * u64::from(BLOCK_SIZE)) as usize),
            BLOCK_SIZE,
        )
        .expect("device");
        Self {
            inner,
            budget: Mutex::new(None),
            sync_budget: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Same as [`new`](Self::new) but every block starts as garbage.
    pub fn with_garbage(blocks: u64) -> Self {
        let dev = Self::new(blocks);
        let junk = vec![GARBAGE; BLOCK_SIZE as usize];
        for block in 0..blocks {
            dev.inner
                .write_block(BlockNumber(block), &junk)
                .expect("fill");
        }
        dev
    }

    /// Allow `writes` more writes, then fail. `None` lifts the limit.
    pub fn set_budget(&self, writes: Option<usize>) {
        *self.budget.lock() = writes;
    }

    /// Allow `syncs` more syncs, then fail them. Writes still land.
    pub fn set_sync_budget(&self, syncs: Option<usize>) {
        *self.sync_budget.lock() = syncs;
    }

    pub fn writes(&self) -> Vec<BlockNumber> {
        self.writes.lock().clone()
    }

    /// Durable contents of `block`, bypassing any cache.
    pub fn durable(&self, block: BlockNumber) -> Vec<u8> {
        self.inner.read_block(block).expect("read").into_inner()
    }
}

impl BlockDevice for FaultyDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        self.inner.read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let mut budget = self.budget.lock();
        if let Some(left) = budget.as_mut() {
            if *left == 0 {
                return Err(FfsError::Io(std::io::Error::other("injected write failure")));
            }
            *left -= 1;
        }
        drop(budget);
        self.inner.write_block(block, data)?;
        self.writes.lock().push(block);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        let mut budget = self.sync_budget.lock();
        if let Some(left) = budget.as_mut() {
            if *left == 0 {
                return Err(FfsError::Io(std::io::Error::other("injected sync failure")));
            }
            *left -= 1;
        }
        drop(budget);
        self.inner.sync()
    }
}

// ── Allocators ──────────────────────────────────────────────────────────────

/// Bitmap allocator that runs out of space after a set number of
/// allocations.
#[derive(Debug)]
pub struct QuotaAllocator {
    inner: BitmapAllocator,
    quota: Mutex<Option<usize>>,
}

impl QuotaAllocator {
    pub fn new(ctx: &AllocationContext) -> Self {
        Self {
            inner: BitmapAllocator::new(ctx),
            quota: Mutex::new(None),
        }
    }

    pub fn set_quota(&self, allocations: Option<usize>) {
        *self.quota.lock() = allocations;
    }

    pub fn bitmap(&self) -> &BitmapAllocator {
        &self.inner
    }
}

impl BlockAllocator for QuotaAllocator {
    fn allocate(&self, ctx: &AllocationContext, hint: &AllocHint) -> Result<BlockNumber> {
        let mut quota = self.quota.lock();
        if let Some(left) = quota.as_mut() {
            if *left == 0 {
                return Err(FfsError::NoSpace);
            }
            *left -= 1;
        }
        drop(quota);
        self.inner.allocate(ctx, hint)
    }

    fn free(&self, ctx: &AllocationContext, block: BlockNumber) -> Result<()> {
        self.inner.free(ctx, block)
    }
}

/// Allocator that hands out exactly the hinted block when it is free, and
/// otherwise the lowest free block at or after the hinted group.
#[derive(Debug)]
pub struct ExactHintAllocator {
    free: Mutex<BTreeSet<u64>>,
    hints: Mutex<Vec<AllocHint>>,
}

impl ExactHintAllocator {
    pub fn new(ctx: &AllocationContext) -> Self {
        Self {
            free: Mutex::new((u64::from(ctx.first_data_block())..ctx.total_blocks()).collect()),
            hints: Mutex::new(Vec::new()),
        }
    }

    pub fn hints(&self) -> Vec<AllocHint> {
        self.hints.lock().clone()
    }
}

impl BlockAllocator for ExactHintAllocator {
    fn allocate(&self, ctx: &AllocationContext, hint: &AllocHint) -> Result<BlockNumber> {
        self.hints.lock().push(*hint);
        let start = match (hint.goal_block, hint.goal_group) {
            (Some(goal), _) => goal.0,
            (None, Some(group)) => ctx.group_block_to_absolute(group, 0).0,
            (None, None) => 0,
        };
        let mut free = self.free.lock();
        let pick = free
            .range(start..)
            .next()
            .or_else(|| free.iter().next())
            .copied()
            .ok_or(FfsError::NoSpace)?;
        free.remove(&pick);
        Ok(BlockNumber(pick))
    }

    fn free(&self, _ctx: &AllocationContext, block: BlockNumber) -> Result<()> {
        if self.free.lock().insert(block.0) {
            Ok(())
        } else {
            Err(FfsError::Corruption {
                block: block.0,
                detail: "double free".to_owned(),
            })
        }
    }
}

// ── Mount fixture ───────────────────────────────────────────────────────────

pub struct Mount<A> {
    pub dev: Arc<FaultyDevice>,
    pub cache: WriteBackCache<Arc<FaultyDevice>>,
    pub ctx: AllocationContext,
    pub alloc: A,
    pub geometry: MapGeometry,
}

impl<A: BlockAllocator> Mount<A> {
    pub fn with(
        dev: FaultyDevice,
        geometry: MapGeometry,
        blocks_per_group: u32,
        make_alloc: impl FnOnce(&AllocationContext) -> A,
    ) -> Self {
        let dev = Arc::new(dev);
        let ctx = AllocationContext::new(dev.block_count(), blocks_per_group).expect("ctx");
        let alloc = make_alloc(&ctx);
        Self {
            cache: WriteBackCache::new(Arc::clone(&dev), 128).expect("cache"),
            dev,
            ctx,
            alloc,
            geometry,
        }
    }

    pub fn mapper(&self) -> Materializer<'_> {
        Materializer::new(self.geometry, &self.cache, &self.alloc, &self.ctx).expect("mapper")
    }

    pub fn inode(&self, ino: u64) -> Inode {
        Inode::new(InodeNumber(ino), self.geometry).expect("inode")
    }
}

impl Mount<QuotaAllocator> {
    pub fn quota(blocks: u64, geometry: MapGeometry) -> Self {
        Self::with(FaultyDevice::new(blocks), geometry, 256, QuotaAllocator::new)
    }
}

pub fn geometry(direct: u32, levels: u32) -> MapGeometry {
    MapGeometry::new(BLOCK_SIZE, direct, levels).expect("geometry")
}

// ── Tree walking ────────────────────────────────────────────────────────────

/// Every block reachable from `inode`: indirect blocks and data blocks,
/// read through `read`. Fails on a pointer past the device end.
pub fn reachable(
    inode: &Inode,
    block_count: u64,
    read: &dyn Fn(BlockNumber) -> Vec<u8>,
) -> Result<Vec<(BlockNumber, u32)>> {
    let geo = *inode.geometry();
    let mut out = Vec::new();
    for slot in 0..geo.direct_slots {
        if let Some(block) = inode.direct(slot) {
            check_in_range(block, block_count)?;
            out.push((block, 0));
        }
    }
    for level in 1..=geo.indirect_levels {
        if let Some(root) = inode.root(level) {
            check_in_range(root, block_count)?;
            walk(root, level, block_count, read, &mut out)?;
        }
    }
    Ok(out)
}

fn walk(
    block: BlockNumber,
    level: u32,
    block_count: u64,
    read: &dyn Fn(BlockNumber) -> Vec<u8>,
    out: &mut Vec<(BlockNumber, u32)>,
) -> Result<()> {
    out.push((block, level));
    let bytes = read(block);
    let view = IndirectBlock::new(block, bytes.as_slice(), block_count);
    for entry in 0..view.fan_out() {
        if let Some(child) = view.get(entry)? {
            if level == 1 {
                out.push((child, 0));
            } else {
                walk(child, level - 1, block_count, read, out)?;
            }
        }
    }
    Ok(())
}

fn check_in_range(block: BlockNumber, block_count: u64) -> Result<()> {
    if block.0 == 0 || block.0 >= block_count {
        return Err(FfsError::Corruption {
            block: block.0,
            detail: "inode pointer out of range".to_owned(),
        });
    }
    Ok(())
}

/// Reachable blocks as seen through the cache, sorted.
pub fn cached_tree(cache: &dyn BufferCache, inode: &Inode) -> Vec<BlockNumber> {
    let read = |block: BlockNumber| cache.peek(block).expect("peek");
    let mut blocks: Vec<_> = reachable(inode, cache.block_count(), &read)
        .expect("walk")
        .into_iter()
        .map(|(block, _)| block)
        .collect();
    blocks.sort_unstable();
    blocks
}
