//! Walking and extending the indirection chain of one inode.
//!
//! ## Write ordering
//!
//! A pointer is only ever stored after the block it names is initialized
//! on disk:
//!
//! 1. allocate the block near the preferred location;
//! 2. acquire it zero-filled and release it synchronously;
//! 3. store the pointer in the parent (inode slot or indirect entry) and
//!    release the parent with the caller's metadata durability.
//!
//! New data blocks follow the same order under [`FillPolicy::ZeroFill`].
//! Under [`FillPolicy::Overwrite`] the data pointer is linked at once and
//! making the new contents durable is up to the caller.
//!
//! ## Failure
//!
//! Every block allocated by one call is recorded. If the call fails with an
//! I/O error, blocks that are already linked stay (a retry resumes from the
//! linked prefix) and only unlinked ones are freed. Any other failure
//! unwinds completely: the first link this call made into pre-existing
//! structure is cleared, every allocation is freed in reverse order, and
//! the inode's mapping state is restored.

use crate::decompose::{BlockPath, decompose};
use crate::indirect::IndirectBlock;
use crate::pref::preference;
use ffs_alloc::{AllocHint, AllocationContext, BlockAllocator};
use ffs_block::{AcquireMode, Buffer, BufferCache, Durability};
use ffs_error::{FfsError, Result};
use ffs_inode::{Inode, InodeSnapshot, SharedInode};
use ffs_types::{BlockNumber, LogicalBlock, MapGeometry};
use tracing::{debug, trace, warn};

/// How the returned data block is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FillPolicy {
    /// New blocks are zeroed; existing blocks are read.
    ZeroFill,
    /// The caller rewrites the whole block: nothing is read or zeroed.
    Overwrite,
}

/// Options for [`Materializer::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveFlags {
    /// Fill holes instead of failing with `HoleNotAllocated`.
    pub may_allocate: bool,
    pub fill: FillPolicy,
    /// Durability for parents after a new pointer is stored in them.
    /// Must be `Synchronous` or `Delayed`.
    pub metadata: Durability,
    /// Stop at the level-1 indirect block and return it instead of the
    /// data block.
    pub metadata_only: bool,
}

impl ResolveFlags {
    /// Map an existing block; never allocates.
    #[must_use]
    pub const fn lookup() -> Self {
        Self {
            may_allocate: false,
            fill: FillPolicy::ZeroFill,
            metadata: Durability::Synchronous,
            metadata_only: false,
        }
    }

    /// Map or allocate, zero-filling new blocks.
    #[must_use]
    pub const fn allocate() -> Self {
        Self {
            may_allocate: true,
            ..Self::lookup()
        }
    }

    #[must_use]
    pub const fn with_fill(mut self, fill: FillPolicy) -> Self {
        self.fill = fill;
        self
    }

    #[must_use]
    pub const fn with_metadata(mut self, metadata: Durability) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub const fn metadata_only(mut self) -> Self {
        self.metadata_only = true;
        self
    }
}

impl Default for ResolveFlags {
    fn default() -> Self {
        Self::allocate()
    }
}

/// A resolved block and its checked-out buffer.
#[derive(Debug)]
pub struct BlockHandle {
    pub lbn: LogicalBlock,
    /// Data block, or the level-1 indirect block for metadata-only calls.
    pub block: BlockNumber,
    /// Whether this call allocated `block`.
    pub allocated: bool,
    /// For metadata-only calls: the entry of `block` holding the data
    /// pointer.
    pub entry: Option<u32>,
    pub buffer: Buffer,
}

impl BlockHandle {
    #[must_use]
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}

/// A run of logically consecutive blocks that are physically contiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRun {
    pub lbn: LogicalBlock,
    pub block: BlockNumber,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Inode,
    Parent { block: BlockNumber, entry: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Allocation {
    block: BlockNumber,
    linked: bool,
}

/// Allocations made by one resolution, oldest first.
#[derive(Debug, Default)]
struct Rollback {
    allocations: Vec<Allocation>,
    /// First link made into structure that existed before the call.
    outermost: Option<Link>,
}

impl Rollback {
    fn allocated(&mut self, block: BlockNumber) {
        self.allocations.push(Allocation {
            block,
            linked: false,
        });
    }

    fn linked(&mut self, block: BlockNumber, link: Link) {
        if let Some(entry) = self.allocations.iter_mut().rev().find(|a| a.block == block) {
            entry.linked = true;
        }
        self.outermost.get_or_insert(link);
    }
}

/// Resolves logical blocks of inodes on one mounted filesystem.
pub struct Materializer<'a> {
    geometry: MapGeometry,
    cache: &'a dyn BufferCache,
    allocator: &'a dyn BlockAllocator,
    ctx: &'a AllocationContext,
}

impl std::fmt::Debug for Materializer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer")
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}

impl<'a> Materializer<'a> {
    pub fn new(
        geometry: MapGeometry,
        cache: &'a dyn BufferCache,
        allocator: &'a dyn BlockAllocator,
        ctx: &'a AllocationContext,
    ) -> Result<Self> {
        geometry
            .validate()
            .map_err(|e| FfsError::InvalidGeometry(e.to_string()))?;
        if cache.block_size() != geometry.block_size {
            return Err(FfsError::InvalidGeometry(format!(
                "cache block size {} does not match geometry block size {}",
                cache.block_size(),
                geometry.block_size
            )));
        }
        Ok(Self {
            geometry,
            cache,
            allocator,
            ctx,
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &MapGeometry {
        &self.geometry
    }

    // ── Read-only lookup ────────────────────────────────────────────────────

    /// Physical block of `lbn`, or `None` for a hole. Never allocates.
    pub fn lookup(&self, inode: &Inode, lbn: LogicalBlock) -> Result<Option<BlockNumber>> {
        self.check_inode(inode)?;
        match decompose(&self.geometry, lbn)? {
            BlockPath::Direct { slot } => self.checked_slot(inode.direct(slot)),
            path @ BlockPath::Indirect { .. } => {
                let Some((leaf, bytes)) = self.find_leaf(inode, &path)? else {
                    return Ok(None);
                };
                let entry = path.offsets()[path.offsets().len() - 1];
                IndirectBlock::new(leaf, bytes.as_slice(), self.cache.block_count()).get(entry)
            }
        }
    }

    /// Every block `inode` reaches, indirect blocks included. Never
    /// allocates; pointers past the device end are corruption.
    pub fn mapped_blocks(&self, inode: &Inode) -> Result<Vec<BlockNumber>> {
        self.check_inode(inode)?;
        let mut out = Vec::new();
        for slot in 0..self.geometry.direct_slots {
            if let Some(block) = self.checked_slot(inode.direct(slot))? {
                out.push(block);
            }
        }
        let mut pending = Vec::new();
        for level in 1..=self.geometry.indirect_levels {
            if let Some(root) = self.checked_slot(inode.root(level))? {
                pending.push((root, level));
            }
        }

        let device_blocks = self.cache.block_count();
        while let Some((block, level)) = pending.pop() {
            out.push(block);
            let bytes = self.cache.peek(block)?;
            let view = IndirectBlock::new(block, bytes.as_slice(), device_blocks);
            for entry in 0..view.fan_out() {
                match view.get(entry)? {
                    Some(child) if level == 1 => out.push(child),
                    Some(child) => pending.push((child, level - 1)),
                    None => {}
                }
            }
        }
        Ok(out)
    }

    /// The block of `lbn` plus how many of the following LBNs (up to
    /// `max_run` in total) are mapped to the next physical blocks. Runs stop
    /// at the end of the pointer array that holds `lbn`.
    pub fn lookup_run(
        &self,
        inode: &Inode,
        lbn: LogicalBlock,
        max_run: u64,
    ) -> Result<Option<BlockRun>> {
        if max_run == 0 {
            return Err(FfsError::InvalidArgument("max_run must be > 0".to_owned()));
        }
        self.check_inode(inode)?;
        match decompose(&self.geometry, lbn)? {
            BlockPath::Direct { slot } => {
                let Some(first) = self.checked_slot(inode.direct(slot))? else {
                    return Ok(None);
                };
                let mut len = 1_u64;
                let mut next = slot + 1;
                while len < max_run && next < self.geometry.direct_slots {
                    if inode.direct(next) != first.checked_add(len) {
                        break;
                    }
                    len += 1;
                    next += 1;
                }
                Ok(Some(BlockRun {
                    lbn,
                    block: first,
                    len,
                }))
            }
            path @ BlockPath::Indirect { .. } => {
                let Some((leaf, bytes)) = self.find_leaf(inode, &path)? else {
                    return Ok(None);
                };
                let entry = path.offsets()[path.offsets().len() - 1];
                let view = IndirectBlock::new(leaf, bytes.as_slice(), self.cache.block_count());
                let Some(first) = view.get(entry)? else {
                    return Ok(None);
                };
                let len = view.contiguous_from(entry, first, max_run)?;
                Ok(Some(BlockRun {
                    lbn,
                    block: first,
                    len,
                }))
            }
        }
    }

    /// Walk from the root of `path` to its level-1 block without taking
    /// leases. `None` when a pointer on the way is zero.
    fn find_leaf(&self, inode: &Inode, path: &BlockPath) -> Result<Option<(BlockNumber, Vec<u8>)>> {
        let Some(mut current) = self.checked_slot(inode.root(path.level()))? else {
            return Ok(None);
        };
        let offsets = path.offsets();
        for &entry in &offsets[..offsets.len() - 1] {
            let bytes = self.cache.peek(current)?;
            let view = IndirectBlock::new(current, bytes.as_slice(), self.cache.block_count());
            let Some(child) = view.get(entry)? else {
                return Ok(None);
            };
            current = child;
        }
        let bytes = self.cache.peek(current)?;
        Ok(Some((current, bytes)))
    }

    // ── Resolution ──────────────────────────────────────────────────────────

    /// Resolve `lbn` of `inode`, filling holes when `flags.may_allocate`.
    ///
    /// `size` is the number of bytes the caller will write into the block
    /// (`1..=block_size`). `Overwrite` for less than a whole block is
    /// treated as `ZeroFill`.
    pub fn resolve(
        &self,
        inode: &mut Inode,
        lbn: LogicalBlock,
        size: u32,
        flags: ResolveFlags,
    ) -> Result<BlockHandle> {
        let flags = self.check_request(inode, size, flags)?;
        let path = decompose(&self.geometry, lbn)?;

        let snapshot = inode.snapshot();
        let mut undo = Rollback::default();
        let result = match path {
            BlockPath::Direct { slot } => self.resolve_direct(inode, lbn, slot, flags, &mut undo),
            BlockPath::Indirect { .. } => self.resolve_indirect(inode, lbn, &path, flags, &mut undo),
        };
        match result {
            Ok(handle) => {
                if handle.allocated || !undo.allocations.is_empty() {
                    debug!(
                        target: "ffs::bmap",
                        event = "resolve_allocated",
                        ino = inode.ino().0,
                        lbn = lbn.0,
                        block = handle.block.0,
                        new_blocks = undo.allocations.len()
                    );
                }
                Ok(handle)
            }
            Err(err) => {
                if !undo.allocations.is_empty() {
                    self.unwind(inode, snapshot, undo, &err);
                }
                Err(err)
            }
        }
    }

    /// Resolve through the inode lock: mapped blocks under the read lock,
    /// holes under the write lock.
    pub fn resolve_shared(
        &self,
        inode: &SharedInode,
        lbn: LogicalBlock,
        size: u32,
        flags: ResolveFlags,
    ) -> Result<BlockHandle> {
        if !flags.metadata_only {
            let guard = inode.read();
            let flags = self.check_request(&guard, size, flags)?;
            if let Some(block) = self.lookup(&guard, lbn)? {
                drop(guard);
                trace!(target: "ffs::bmap", event = "resolve_hit", lbn = lbn.0, block = block.0);
                return self.data_handle(lbn, block, flags.fill, false);
            }
            if !flags.may_allocate {
                return Err(FfsError::HoleNotAllocated { lbn: lbn.0 });
            }
        }
        let mut guard = inode.write();
        self.resolve(&mut guard, lbn, size, flags)
    }

    fn check_inode(&self, inode: &Inode) -> Result<()> {
        if *inode.geometry() != self.geometry {
            return Err(FfsError::InvalidArgument(format!(
                "inode {} geometry does not match the mount",
                inode.ino()
            )));
        }
        Ok(())
    }

    fn check_request(&self, inode: &Inode, size: u32, flags: ResolveFlags) -> Result<ResolveFlags> {
        self.check_inode(inode)?;
        if size == 0 || size > self.geometry.block_size {
            return Err(FfsError::InvalidArgument(format!(
                "size {size} outside 1..={}",
                self.geometry.block_size
            )));
        }
        if flags.metadata == Durability::None {
            return Err(FfsError::InvalidArgument(
                "metadata durability must be synchronous or delayed".to_owned(),
            ));
        }
        let mut flags = flags;
        if flags.fill == FillPolicy::Overwrite && size < self.geometry.block_size {
            flags.fill = FillPolicy::ZeroFill;
        }
        Ok(flags)
    }

    fn resolve_direct(
        &self,
        inode: &mut Inode,
        lbn: LogicalBlock,
        slot: u32,
        flags: ResolveFlags,
        undo: &mut Rollback,
    ) -> Result<BlockHandle> {
        if flags.metadata_only {
            return Err(FfsError::InvalidArgument(format!(
                "logical block {lbn} is direct and has no indirect block"
            )));
        }
        if let Some(block) = self.checked_slot(inode.direct(slot))? {
            trace!(target: "ffs::bmap", event = "resolve_hit", lbn = lbn.0, block = block.0);
            return self.data_handle(lbn, block, flags.fill, false);
        }
        if !flags.may_allocate {
            return Err(FfsError::HoleNotAllocated { lbn: lbn.0 });
        }

        let sibling = (0..slot).rev().find_map(|s| inode.direct(s));
        let hint = preference(self.ctx, inode, lbn, 0, sibling);
        let block = self.allocate(&hint, undo)?;
        self.init_data(block, flags.fill)?;

        inode.set_direct(slot, Some(block))?;
        self.note_linked(inode, block, Link::Inode, undo);
        self.data_handle(lbn, block, flags.fill, true)
    }

    fn resolve_indirect(
        &self,
        inode: &mut Inode,
        lbn: LogicalBlock,
        path: &BlockPath,
        flags: ResolveFlags,
        undo: &mut Rollback,
    ) -> Result<BlockHandle> {
        let top = path.level();
        let mut parent = match self.checked_slot(inode.root(top))? {
            Some(root) => root,
            None => {
                if !flags.may_allocate {
                    return Err(FfsError::HoleNotAllocated { lbn: lbn.0 });
                }
                let hint = preference(self.ctx, inode, lbn, top, None);
                let root = self.allocate(&hint, undo)?;
                self.write_zeroed(root)?;
                inode.set_root(top, Some(root))?;
                self.note_linked(inode, root, Link::Inode, undo);
                root
            }
        };

        for (depth, &entry) in path.offsets().iter().enumerate() {
            #[expect(clippy::cast_possible_truncation)]
            let level = top - depth as u32;
            let leaf = level == 1;

            let mut buf = self.cache.acquire(parent, AcquireMode::ReadExisting)?;
            if leaf && flags.metadata_only {
                return Ok(BlockHandle {
                    lbn,
                    block: parent,
                    allocated: undo.allocations.iter().any(|a| a.block == parent),
                    entry: Some(entry),
                    buffer: buf,
                });
            }

            let device_blocks = self.cache.block_count();
            let (existing, sibling) = {
                let view = IndirectBlock::new(parent, buf.as_slice(), device_blocks);
                (view.get(entry)?, view.prev_nonzero(entry))
            };
            if let Some(child) = existing {
                drop(buf);
                if leaf {
                    trace!(target: "ffs::bmap", event = "resolve_hit", lbn = lbn.0, block = child.0);
                    return self.data_handle(lbn, child, flags.fill, false);
                }
                parent = child;
                continue;
            }
            if !flags.may_allocate {
                return Err(FfsError::HoleNotAllocated { lbn: lbn.0 });
            }

            let child_level = level - 1;
            let hint = preference(
                self.ctx,
                inode,
                lbn,
                child_level,
                sibling.filter(|_| leaf),
            );
            let child = self.allocate(&hint, undo)?;
            if leaf {
                self.init_data(child, flags.fill)?;
            } else {
                self.write_zeroed(child)?;
            }

            IndirectBlock::new(parent, buf.as_mut_slice(), device_blocks).set(entry, Some(child))?;
            let link = Link::Parent { block: parent, entry };
            if let Err(err) = self.cache.release(buf, flags.metadata) {
                if self.link_survived(parent, entry, child) {
                    self.note_linked(inode, child, link, undo);
                }
                return Err(err);
            }
            self.note_linked(inode, child, link, undo);

            if leaf {
                return self.data_handle(lbn, child, flags.fill, true);
            }
            parent = child;
        }

        // Every path ends at a level-1 block.
        Err(FfsError::InvalidArgument(format!(
            "logical block {lbn} has an empty indirection path"
        )))
    }

    // ── Steps ───────────────────────────────────────────────────────────────

    fn allocate(&self, hint: &AllocHint, undo: &mut Rollback) -> Result<BlockNumber> {
        let block = self.allocator.allocate(self.ctx, hint)?;
        if block.0 == 0 || block.0 >= self.cache.block_count() || block.to_u32().is_err() {
            if let Err(err) = self.allocator.free(self.ctx, block) {
                warn!(target: "ffs::bmap", event = "free_failed", block = block.0, error = %err);
            }
            return Err(FfsError::InvalidGeometry(format!(
                "allocator returned block {} which cannot be stored in a pointer",
                block.0
            )));
        }
        undo.allocated(block);
        debug!(
            target: "ffs::bmap",
            event = "block_allocated",
            block = block.0,
            goal = hint.goal_block.map(|b| b.0)
        );
        Ok(block)
    }

    /// Zero `block` on disk before anything may point at it.
    fn write_zeroed(&self, block: BlockNumber) -> Result<()> {
        let buf = self.cache.acquire(block, AcquireMode::AllocateZeroed)?;
        self.cache.release(buf, Durability::Synchronous)
    }

    fn init_data(&self, block: BlockNumber, fill: FillPolicy) -> Result<()> {
        match fill {
            FillPolicy::ZeroFill => self.write_zeroed(block),
            FillPolicy::Overwrite => Ok(()),
        }
    }

    fn note_linked(&self, inode: &mut Inode, block: BlockNumber, link: Link, undo: &mut Rollback) {
        inode.note_allocated(block);
        inode.mark_dirty();
        undo.linked(block, link);
        trace!(
            target: "ffs::bmap",
            event = "block_linked",
            ino = inode.ino().0,
            block = block.0,
            parent = match link {
                Link::Inode => None,
                Link::Parent { block, .. } => Some(block.0),
            }
        );
    }

    /// After a failed parent write: whether `parent` may still point at
    /// `child`. The write can reach the device before the failure is
    /// reported. An unreadable or corrupt parent counts as linked, so the
    /// child is kept rather than freed.
    fn link_survived(&self, parent: BlockNumber, entry: u32, child: BlockNumber) -> bool {
        let linked = match self.cache.peek(parent) {
            Ok(bytes) => {
                let view = IndirectBlock::new(parent, bytes.as_slice(), self.cache.block_count());
                match view.get(entry) {
                    Ok(Some(found)) => found == child,
                    Ok(None) => false,
                    Err(_) => true,
                }
            }
            Err(_) => true,
        };
        if linked {
            warn!(
                target: "ffs::bmap",
                event = "parent_write_failed_linked",
                parent = parent.0,
                entry,
                child = child.0
            );
        }
        linked
    }

    fn data_handle(
        &self,
        lbn: LogicalBlock,
        block: BlockNumber,
        fill: FillPolicy,
        allocated: bool,
    ) -> Result<BlockHandle> {
        let mode = match fill {
            FillPolicy::ZeroFill => AcquireMode::ReadExisting,
            FillPolicy::Overwrite => AcquireMode::AllocateUninitialized,
        };
        let buffer = self.cache.acquire(block, mode)?;
        Ok(BlockHandle {
            lbn,
            block,
            allocated,
            entry: None,
            buffer,
        })
    }

    /// Validate a pointer taken from the inode table.
    fn checked_slot(&self, slot: Option<BlockNumber>) -> Result<Option<BlockNumber>> {
        match slot {
            Some(block) if block.0 >= self.cache.block_count() => Err(FfsError::Corruption {
                block: block.0,
                detail: format!(
                    "inode pointer past end of device ({})",
                    self.cache.block_count()
                ),
            }),
            other => Ok(other),
        }
    }

    // ── Rollback ────────────────────────────────────────────────────────────

    fn unwind(
        &self,
        inode: &mut Inode,
        snapshot: InodeSnapshot,
        undo: Rollback,
        err: &FfsError,
    ) {
        let full = !matches!(err, FfsError::Io(_));
        let mut detached = full;
        if full {
            if let Some(Link::Parent { block, entry }) = undo.outermost {
                if let Err(clear_err) = self.clear_entry(block, entry) {
                    warn!(
                        target: "ffs::bmap",
                        event = "rollback_unlink_failed",
                        parent = block.0,
                        entry,
                        error = %clear_err
                    );
                    detached = false;
                }
            }
        }

        let mut freed = 0_usize;
        for alloc in undo.allocations.iter().rev() {
            if alloc.linked && !detached {
                continue;
            }
            match self.allocator.free(self.ctx, alloc.block) {
                Ok(()) => freed += 1,
                Err(free_err) => warn!(
                    target: "ffs::bmap",
                    event = "free_failed",
                    block = alloc.block.0,
                    error = %free_err
                ),
            }
        }
        if detached {
            inode.restore(snapshot);
        }

        warn!(
            target: "ffs::bmap",
            event = "resolve_rollback",
            ino = inode.ino().0,
            full = detached,
            allocated = undo.allocations.len(),
            freed,
            error = %err
        );
    }

    fn clear_entry(&self, parent: BlockNumber, entry: u32) -> Result<()> {
        let mut buf = self.cache.acquire(parent, AcquireMode::ReadExisting)?;
        IndirectBlock::new(parent, buf.as_mut_slice(), self.cache.block_count()).set(entry, None)?;
        self.cache.release(buf, Durability::Synchronous)
    }
}
