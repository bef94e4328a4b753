#![forbid(unsafe_code)]
//! Physical block allocation.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap** — raw bit manipulation on per-group block bitmaps.
//! 2. **AllocationContext** — mount-scoped group geometry plus the
//!    filesystem-wide rotor used to spread new files across groups.
//! 3. **BlockAllocator** — the single-block contract the mapper depends on,
//!    with [`BitmapAllocator`] as the in-memory, goal-directed implementation.
//!
//! Block 0 lies before the first data block and is never handed out, so a
//! zero pointer can always mean "unallocated".

use ffs_error::{FfsError, Result};
use ffs_types::{BlockNumber, GroupNumber};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, trace};

/// Groups probed on each side of the goal group before a full scan.
const NEARBY_GROUPS: u32 = 8;

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let mut free: u32 = bitmap
        .iter()
        .take(full_bytes)
        .map(|byte| byte.count_zeros())
        .sum();
    let remainder = count % 8;
    if remainder > 0 {
        if let Some(&byte) = bitmap.get(full_bytes) {
            for bit in 0..remainder {
                free += u32::from((byte >> bit) & 1 == 0);
            }
        }
    }
    free
}

/// Find the first free bit in the first `count` bits of `bitmap`, scanning
/// forward from `start` and wrapping around to the beginning.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    let start = start.min(count);
    (start..count)
        .chain(0..start)
        .find(|&idx| !bitmap_get(bitmap, idx))
}

// ── Allocation hint ─────────────────────────────────────────────────────────

/// Advisory placement for one allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocHint {
    /// Preferred group when no goal block is known.
    pub goal_group: Option<GroupNumber>,
    /// Preferred block; the search starts here within its group.
    pub goal_block: Option<BlockNumber>,
}

impl AllocHint {
    #[must_use]
    pub fn near(block: BlockNumber) -> Self {
        Self {
            goal_group: None,
            goal_block: Some(block),
        }
    }

    #[must_use]
    pub fn in_group(group: GroupNumber) -> Self {
        Self {
            goal_group: Some(group),
            goal_block: None,
        }
    }
}

// ── Allocation context ──────────────────────────────────────────────────────

/// Mount-scoped allocation state shared by every inode of one filesystem.
///
/// Groups start at `first_data_block` and hold `blocks_per_group` blocks each;
/// the last group may be shorter.
#[derive(Debug)]
pub struct AllocationContext {
    total_blocks: u64,
    blocks_per_group: u32,
    first_data_block: u32,
    group_count: u32,
    rotor: AtomicU32,
}

impl AllocationContext {
    /// Context for a device of `total_blocks` blocks. Block 0 is reserved.
    pub fn new(total_blocks: u64, blocks_per_group: u32) -> Result<Self> {
        Self::with_first_data_block(total_blocks, blocks_per_group, 1)
    }

    pub fn with_first_data_block(
        total_blocks: u64,
        blocks_per_group: u32,
        first_data_block: u32,
    ) -> Result<Self> {
        if blocks_per_group == 0 {
            return Err(FfsError::InvalidGeometry(
                "blocks_per_group must be > 0".to_owned(),
            ));
        }
        if first_data_block == 0 {
            return Err(FfsError::InvalidGeometry(
                "first_data_block must be > 0 (block 0 is reserved)".to_owned(),
            ));
        }
        let data_blocks = total_blocks.saturating_sub(u64::from(first_data_block));
        if data_blocks == 0 {
            return Err(FfsError::InvalidGeometry(format!(
                "device of {total_blocks} blocks has no data blocks"
            )));
        }
        let group_count = u32::try_from(data_blocks.div_ceil(u64::from(blocks_per_group)))
            .map_err(|_| FfsError::InvalidGeometry("group count exceeds u32".to_owned()))?;
        Ok(Self {
            total_blocks,
            blocks_per_group,
            first_data_block,
            group_count,
            rotor: AtomicU32::new(0),
        })
    }

    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    #[must_use]
    pub fn blocks_per_group(&self) -> u32 {
        self.blocks_per_group
    }

    #[must_use]
    pub fn first_data_block(&self) -> u32 {
        self.first_data_block
    }

    #[must_use]
    pub fn group_count(&self) -> u32 {
        self.group_count
    }

    /// Number of blocks in a specific group (last group may be shorter).
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        let group_start = u64::from(self.first_data_block)
            + u64::from(group.0) * u64::from(self.blocks_per_group);
        let remaining = self.total_blocks.saturating_sub(group_start);
        if remaining >= u64::from(self.blocks_per_group) {
            self.blocks_per_group
        } else {
            remaining as u32
        }
    }

    /// Absolute block number for a relative block within a group.
    #[must_use]
    pub fn group_block_to_absolute(&self, group: GroupNumber, rel_block: u32) -> BlockNumber {
        BlockNumber(
            u64::from(self.first_data_block)
                + u64::from(group.0) * u64::from(self.blocks_per_group)
                + u64::from(rel_block),
        )
    }

    /// Convert an absolute block to (group, relative block).
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn absolute_to_group_block(&self, block: BlockNumber) -> (GroupNumber, u32) {
        let rel = block.0.saturating_sub(u64::from(self.first_data_block));
        let group = (rel / u64::from(self.blocks_per_group)) as u32;
        let offset = (rel % u64::from(self.blocks_per_group)) as u32;
        (GroupNumber(group), offset)
    }

    /// Whether `block` is an allocatable data block of this filesystem.
    #[must_use]
    pub fn contains(&self, block: BlockNumber) -> bool {
        block.0 >= u64::from(self.first_data_block) && block.0 < self.total_blocks
    }

    /// Group currently under the rotor.
    #[must_use]
    pub fn rotor(&self) -> GroupNumber {
        GroupNumber(self.rotor.load(Ordering::Relaxed) % self.group_count)
    }

    /// Take the group under the rotor and move the rotor to the next group.
    pub fn advance_rotor(&self) -> GroupNumber {
        let count = self.group_count;
        let previous = self
            .rotor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some((current + 1) % count)
            })
            .unwrap_or_else(|current| current);
        GroupNumber(previous % count)
    }

    /// First block of the group under the rotor.
    #[must_use]
    pub fn default_goal(&self) -> BlockNumber {
        self.group_block_to_absolute(self.rotor(), 0)
    }
}

// ── Allocator contract ──────────────────────────────────────────────────────

/// Single-block allocation as seen by the block mapper.
pub trait BlockAllocator: Send + Sync {
    /// Return one free block, preferably near `hint`. Fails with `NoSpace`
    /// when the filesystem is full. The hint is advisory.
    fn allocate(&self, ctx: &AllocationContext, hint: &AllocHint) -> Result<BlockNumber>;

    /// Return `block` to the free pool.
    fn free(&self, ctx: &AllocationContext, block: BlockNumber) -> Result<()>;
}

impl<T: BlockAllocator + ?Sized> BlockAllocator for Arc<T> {
    fn allocate(&self, ctx: &AllocationContext, hint: &AllocHint) -> Result<BlockNumber> {
        (**self).allocate(ctx, hint)
    }

    fn free(&self, ctx: &AllocationContext, block: BlockNumber) -> Result<()> {
        (**self).free(ctx, block)
    }
}

// ── Bitmap allocator ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct GroupBitmap {
    bits: Vec<u8>,
    len: u32,
    free: u32,
}

/// In-memory bitmap allocator with one bitmap per group.
#[derive(Debug)]
pub struct BitmapAllocator {
    groups: Mutex<Vec<GroupBitmap>>,
}

impl BitmapAllocator {
    /// All data blocks of `ctx` start out free.
    #[must_use]
    pub fn new(ctx: &AllocationContext) -> Self {
        let groups = (0..ctx.group_count())
            .map(|g| {
                let len = ctx.blocks_in_group(GroupNumber(g));
                GroupBitmap {
                    bits: vec![0_u8; len.div_ceil(8) as usize],
                    len,
                    free: len,
                }
            })
            .collect();
        Self {
            groups: Mutex::new(groups),
        }
    }

    /// Mark a block in use without going through the search, e.g. for
    /// blocks already referenced by an existing image.
    pub fn reserve(&self, ctx: &AllocationContext, block: BlockNumber) -> Result<()> {
        let (group, rel) = locate(ctx, block)?;
        let mut groups = self.groups.lock();
        let gs = &mut groups[group.0 as usize];
        if !bitmap_get(&gs.bits, rel) {
            bitmap_set(&mut gs.bits, rel);
            gs.free -= 1;
        }
        drop(groups);
        Ok(())
    }

    #[must_use]
    pub fn is_allocated(&self, ctx: &AllocationContext, block: BlockNumber) -> bool {
        let Ok((group, rel)) = locate(ctx, block) else {
            return false;
        };
        bitmap_get(&self.groups.lock()[group.0 as usize].bits, rel)
    }

    /// Free blocks across all groups.
    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.groups
            .lock()
            .iter()
            .map(|gs| u64::from(gs.free))
            .sum()
    }

    /// Free blocks in one group, recounted from its bitmap.
    #[must_use]
    pub fn group_free(&self, group: GroupNumber) -> Option<u32> {
        self.groups
            .lock()
            .get(group.0 as usize)
            .map(|gs| bitmap_count_free(&gs.bits, gs.len))
    }

    /// Every allocated block, in ascending order.
    #[must_use]
    pub fn allocated_blocks(&self, ctx: &AllocationContext) -> Vec<BlockNumber> {
        let groups = self.groups.lock();
        let mut out = Vec::new();
        for (g, gs) in groups.iter().enumerate() {
            #[expect(clippy::cast_possible_truncation)]
            let group = GroupNumber(g as u32);
            out.extend(
                (0..gs.len)
                    .filter(|&rel| bitmap_get(&gs.bits, rel))
                    .map(|rel| ctx.group_block_to_absolute(group, rel)),
            );
        }
        out
    }

    fn try_alloc_in_group(
        ctx: &AllocationContext,
        groups: &mut [GroupBitmap],
        group: GroupNumber,
        hint: &AllocHint,
    ) -> Option<BlockNumber> {
        let gs = groups.get_mut(group.0 as usize)?;
        if gs.free == 0 {
            return None;
        }
        let start = hint.goal_block.map_or(0, |goal| {
            let (g, off) = ctx.absolute_to_group_block(goal);
            if g == group && ctx.contains(goal) { off } else { 0 }
        });
        let rel = bitmap_find_free(&gs.bits, gs.len, start)?;
        bitmap_set(&mut gs.bits, rel);
        gs.free -= 1;
        Some(ctx.group_block_to_absolute(group, rel))
    }
}

impl BlockAllocator for BitmapAllocator {
    /// Strategy:
    /// 1. The goal group (from the goal block, else the hint's group, else
    ///    the rotor), starting at the goal block.
    /// 2. Groups within [`NEARBY_GROUPS`] of the goal.
    /// 3. Every remaining group.
    fn allocate(&self, ctx: &AllocationContext, hint: &AllocHint) -> Result<BlockNumber> {
        let goal_group = hint
            .goal_block
            .filter(|&b| ctx.contains(b))
            .map(|b| ctx.absolute_to_group_block(b).0)
            .or(hint.goal_group)
            .filter(|g| g.0 < ctx.group_count())
            .unwrap_or_else(|| ctx.rotor());

        let mut groups = self.groups.lock();
        let mut found = Self::try_alloc_in_group(ctx, &mut groups, goal_group, hint);

        if found.is_none() {
            'nearby: for delta in 1..=NEARBY_GROUPS {
                for dir in [1_i64, -1_i64] {
                    let g = i64::from(goal_group.0) + dir * i64::from(delta);
                    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    if g >= 0 && (g as u32) < ctx.group_count() {
                        found = Self::try_alloc_in_group(ctx, &mut groups, GroupNumber(g as u32), hint);
                        if found.is_some() {
                            break 'nearby;
                        }
                    }
                }
            }
        }

        if found.is_none() {
            found = (0..ctx.group_count())
                .map(GroupNumber)
                .filter(|&g| g != goal_group)
                .find_map(|g| Self::try_alloc_in_group(ctx, &mut groups, g, hint));
        }
        drop(groups);

        let Some(block) = found else {
            debug!(
                target: "ffs::alloc",
                event = "alloc_no_space",
                goal_group = goal_group.0
            );
            return Err(FfsError::NoSpace);
        };
        trace!(
            target: "ffs::alloc",
            event = "block_alloc",
            block = block.0,
            goal_block = hint.goal_block.map(|b| b.0),
            goal_group = goal_group.0,
            hinted = hint.goal_block.is_some_and(|goal| goal == block)
        );
        Ok(block)
    }

    fn free(&self, ctx: &AllocationContext, block: BlockNumber) -> Result<()> {
        let (group, rel) = locate(ctx, block)?;
        let mut groups = self.groups.lock();
        let gs = &mut groups[group.0 as usize];
        if !bitmap_get(&gs.bits, rel) {
            return Err(FfsError::Corruption {
                block: block.0,
                detail: "double-free: block already free in bitmap".into(),
            });
        }
        bitmap_clear(&mut gs.bits, rel);
        gs.free += 1;
        drop(groups);
        trace!(target: "ffs::alloc", event = "block_free", block = block.0);
        Ok(())
    }
}

fn locate(ctx: &AllocationContext, block: BlockNumber) -> Result<(GroupNumber, u32)> {
    if !ctx.contains(block) {
        return Err(FfsError::Corruption {
            block: block.0,
            detail: format!(
                "block outside data area [{}, {})",
                ctx.first_data_block(),
                ctx.total_blocks()
            ),
        });
    }
    Ok(ctx.absolute_to_group_block(block))
}

// ── Tests ───────────────────────────────────────────────────────────────────
