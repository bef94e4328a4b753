//! Locality policy for new blocks.

use ffs_alloc::{AllocHint, AllocationContext};
use ffs_inode::Inode;
use ffs_types::{BlockNumber, LogicalBlock};
use tracing::trace;

/// Preferred placement for the block about to be linked at `level`
/// (0 = data block, `n` = level-`n` indirect block) on the path of `lbn`.
///
/// `sibling` is the nearest preceding non-zero pointer in the array the new
/// block will be linked into. In order:
///
/// 1. A data block with a sibling goes right after the sibling.
/// 2. Otherwise the block goes right after the inode's most recently
///    allocated block, so indirect blocks sit next to the data they index.
/// 3. The first block of a file starts at the inode's home region, or at
///    the group under the mount's rotor (which then moves on).
///
/// The result is advisory.
#[must_use]
pub fn preference(
    ctx: &AllocationContext,
    inode: &Inode,
    lbn: LogicalBlock,
    level: u32,
    sibling: Option<BlockNumber>,
) -> AllocHint {
    let after = |block: BlockNumber| block.checked_add(1).filter(|next| ctx.contains(*next));

    let hint = if let Some(next) = sibling.filter(|_| level == 0).and_then(after) {
        AllocHint::near(next)
    } else if let Some(next) = inode.last_alloc().and_then(after) {
        AllocHint::near(next)
    } else if let Some(home) = inode.home().filter(|home| ctx.contains(*home)) {
        AllocHint::near(home)
    } else {
        AllocHint::in_group(ctx.advance_rotor())
    };

    trace!(
        target: "ffs::bmap",
        event = "preference",
        ino = inode.ino().0,
        lbn = lbn.0,
        level,
        goal_block = hint.goal_block.map(|b| b.0),
        goal_group = hint.goal_group.map(|g| g.0)
    );
    hint
}
