#![forbid(unsafe_code)]

mod support;

use ffs_alloc::BlockAllocator;
use ffs_block::{BufferCache, Durability};
use ffs_bmap::{IndirectBlock, ResolveFlags};
use ffs_error::FfsError;
use ffs_types::LogicalBlock;
use support::{BLOCK_SIZE, Mount, QuotaAllocator, cached_tree, geometry, reachable};

/// First LBN under the triple-indirect root for D=12, F=256.
const TRIPLE: u64 = 12 + 256 + 256 * 256;
/// First and second level-1 blocks under the double-indirect root.
const DOUBLE_A: u64 = 12 + 256;
const DOUBLE_B: u64 = DOUBLE_A + 256;

fn allocated(m: &Mount<QuotaAllocator>) -> Vec<ffs_types::BlockNumber> {
    m.alloc.bitmap().allocated_blocks(&m.ctx)
}

#[test]
fn no_space_at_any_level_leaves_nothing_behind() {
    // Root, level 2, level 1 and the data block.
    for quota in 0..4 {
        let m = Mount::quota(1024, geometry(12, 3));
        let mut inode = m.inode(5);
        let before = inode.snapshot();
        let free = m.alloc.bitmap().free_count();
        m.alloc.set_quota(Some(quota));

        let err = m
            .mapper()
            .resolve(&mut inode, LogicalBlock(TRIPLE), BLOCK_SIZE, ResolveFlags::allocate())
            .expect_err("quota");
        assert!(matches!(err, FfsError::NoSpace), "quota {quota}: {err}");

        assert_eq!(inode.snapshot(), before, "quota {quota}");
        assert!(!inode.is_dirty(), "quota {quota}");
        assert_eq!(m.alloc.bitmap().free_count(), free, "quota {quota}");
        assert!(allocated(&m).is_empty(), "quota {quota}");
    }
}

#[test]
fn no_space_clears_the_link_into_existing_structure() {
    for metadata in [Durability::Synchronous, Durability::Delayed] {
        let flags = ResolveFlags::allocate().with_metadata(metadata);
        // Level-1 block allocated and linked, then the data block fails.
        let m = Mount::quota(1024, geometry(12, 2));
        let mapper = m.mapper();
        let mut inode = m.inode(5);
        drop(
            mapper
                .resolve(&mut inode, LogicalBlock(DOUBLE_A), BLOCK_SIZE, flags)
                .expect("first"),
        );
        let root = inode.root(2).expect("root");
        let before = inode.snapshot();
        let owned = allocated(&m);

        m.alloc.set_quota(Some(1));
        let err = mapper
            .resolve(&mut inode, LogicalBlock(DOUBLE_B), BLOCK_SIZE, flags)
            .expect_err("quota");
        assert!(matches!(err, FfsError::NoSpace));

        assert_eq!(inode.snapshot(), before, "{metadata:?}");
        assert_eq!(allocated(&m), owned, "{metadata:?}");

        let cached = m.cache.peek(root).expect("peek");
        let view = IndirectBlock::new(root, cached.as_slice(), m.cache.block_count());
        assert_eq!(view.get(1).expect("entry"), None, "{metadata:?}");
        assert!(view.get(0).expect("entry").is_some(), "{metadata:?}");

        // The clear reached the disk regardless of the metadata mode.
        let durable = m.dev.durable(root);
        let view = IndirectBlock::new(root, durable.as_slice(), m.cache.block_count());
        assert_eq!(view.get(1).expect("entry"), None, "{metadata:?}");

        // Space comes back: the retry succeeds and reuses the same shape.
        m.alloc.set_quota(None);
        let handle = mapper
            .resolve(&mut inode, LogicalBlock(DOUBLE_B), BLOCK_SIZE, flags)
            .expect("retry");
        assert!(handle.allocated);
        drop(handle);
        assert_eq!(allocated(&m), cached_tree(&m.cache, &inode));
    }
}

#[test]
fn io_failure_keeps_linked_prefix_and_retry_resumes() {
    // Zero root, zero level 1, link root, zero data, link level 1.
    const WRITES: usize = 5;
    for budget in 0..WRITES {
        let m = Mount::quota(1024, geometry(12, 2));
        let mapper = m.mapper();
        let mut inode = m.inode(9);

        m.dev.set_budget(Some(budget));
        let err = mapper
            .resolve(&mut inode, LogicalBlock(DOUBLE_A), BLOCK_SIZE, ResolveFlags::allocate())
            .expect_err("write failure");
        assert!(matches!(err, FfsError::Io(_)), "budget {budget}: {err}");
        assert!(err.is_retryable());

        // Nothing leaked and nothing dangles.
        assert_eq!(allocated(&m), cached_tree(&m.cache, &inode), "budget {budget}");
        assert_eq!(
            mapper.lookup(&inode, LogicalBlock(DOUBLE_A)).expect("lookup"),
            None
        );

        m.dev.set_budget(None);
        let block = mapper
            .resolve(&mut inode, LogicalBlock(DOUBLE_A), BLOCK_SIZE, ResolveFlags::allocate())
            .expect("retry")
            .block;
        assert_eq!(
            mapper.lookup(&inode, LogicalBlock(DOUBLE_A)).expect("lookup"),
            Some(block)
        );
        let tree = cached_tree(&m.cache, &inode);
        assert_eq!(tree.len(), 3, "budget {budget}");
        assert_eq!(allocated(&m), tree, "budget {budget}");
    }
}

/// Blocks reachable from `inode` on the device itself, sorted.
fn durable_tree(
    m: &Mount<QuotaAllocator>,
    inode: &ffs_inode::Inode,
) -> Vec<ffs_types::BlockNumber> {
    let read = |block: ffs_types::BlockNumber| m.dev.durable(block);
    let mut blocks: Vec<_> = reachable(inode, m.cache.block_count(), &read)
        .expect("walk")
        .into_iter()
        .map(|(block, _)| block)
        .collect();
    blocks.sort_unstable();
    blocks
}

#[test]
fn failed_parent_sync_keeps_the_child_it_points_at() {
    let m = Mount::quota(256, geometry(12, 1));
    let mapper = m.mapper();
    let mut inode = m.inode(4);
    drop(
        mapper
            .resolve(&mut inode, LogicalBlock(12), BLOCK_SIZE, ResolveFlags::allocate())
            .expect("first"),
    );
    let root = inode.root(1).expect("root");

    // Zeroing the data block syncs; the parent's sync then fails after
    // its write has already landed.
    m.dev.set_sync_budget(Some(1));
    let err = mapper
        .resolve(&mut inode, LogicalBlock(13), BLOCK_SIZE, ResolveFlags::allocate())
        .expect_err("sync failure");
    assert!(matches!(err, FfsError::Io(_)), "{err}");
    m.dev.set_sync_budget(None);

    let durable = m.dev.durable(root);
    let child = IndirectBlock::new(root, durable.as_slice(), m.cache.block_count())
        .get(1)
        .expect("entry")
        .expect("pointer reached the disk");
    assert!(m.alloc.bitmap().is_allocated(&m.ctx, child));
    assert_eq!(m.cache.peek(root).expect("peek"), durable);
    assert_eq!(
        mapper.lookup(&inode, LogicalBlock(13)).expect("lookup"),
        Some(child)
    );
    assert_eq!(allocated(&m), cached_tree(&m.cache, &inode));
    assert_eq!(allocated(&m), durable_tree(&m, &inode));

    let handle = mapper
        .resolve(&mut inode, LogicalBlock(13), BLOCK_SIZE, ResolveFlags::allocate())
        .expect("retry");
    assert_eq!(handle.block, child);
    assert!(!handle.allocated);
}

#[test]
fn failed_unlink_keeps_the_linked_block() {
    let m = Mount::quota(1024, geometry(12, 2));
    let mapper = m.mapper();
    let mut inode = m.inode(6);
    drop(
        mapper
            .resolve(&mut inode, LogicalBlock(DOUBLE_A), BLOCK_SIZE, ResolveFlags::allocate())
            .expect("first"),
    );
    let root = inode.root(2).expect("root");
    let owned = allocated(&m);

    // Zero the new level-1 block and link it into the root; clearing that
    // link is the third write and fails.
    m.alloc.set_quota(Some(1));
    m.dev.set_budget(Some(2));
    let err = mapper
        .resolve(&mut inode, LogicalBlock(DOUBLE_B), BLOCK_SIZE, ResolveFlags::allocate())
        .expect_err("quota");
    assert!(matches!(err, FfsError::NoSpace), "{err}");
    m.dev.set_budget(None);

    let durable = m.dev.durable(root);
    let level1 = IndirectBlock::new(root, durable.as_slice(), m.cache.block_count())
        .get(1)
        .expect("entry")
        .expect("link stays on disk");
    assert!(!owned.contains(&level1));
    assert!(m.alloc.bitmap().is_allocated(&m.ctx, level1));
    assert_eq!(m.cache.peek(root).expect("peek"), durable);
    assert_eq!(allocated(&m), cached_tree(&m.cache, &inode));
    assert_eq!(allocated(&m), durable_tree(&m, &inode));
    assert_eq!(
        mapper.lookup(&inode, LogicalBlock(DOUBLE_B)).expect("lookup"),
        None
    );

    // The kept level-1 block is reused; only the data block is new.
    m.alloc.set_quota(None);
    let handle = mapper
        .resolve(&mut inode, LogicalBlock(DOUBLE_B), BLOCK_SIZE, ResolveFlags::allocate())
        .expect("retry");
    assert!(handle.allocated);
    drop(handle);
    assert_eq!(allocated(&m).len(), owned.len() + 2);
    assert_eq!(allocated(&m), cached_tree(&m.cache, &inode));
}

#[test]
fn rejected_allocator_answer_is_returned() {
    struct ZeroAllocator(QuotaAllocator);

    impl BlockAllocator for ZeroAllocator {
        fn allocate(
            &self,
            _ctx: &ffs_alloc::AllocationContext,
            _hint: &ffs_alloc::AllocHint,
        ) -> ffs_error::Result<ffs_types::BlockNumber> {
            Ok(ffs_types::BlockNumber(0))
        }

        fn free(
            &self,
            ctx: &ffs_alloc::AllocationContext,
            block: ffs_types::BlockNumber,
        ) -> ffs_error::Result<()> {
            self.0.free(ctx, block)
        }
    }

    let m = Mount::with(
        support::FaultyDevice::new(256),
        geometry(12, 1),
        256,
        |ctx| ZeroAllocator(QuotaAllocator::new(ctx)),
    );
    let mut inode = m.inode(3);
    let err = m
        .mapper()
        .resolve(&mut inode, LogicalBlock(0), BLOCK_SIZE, ResolveFlags::allocate())
        .expect_err("block zero");
    assert!(matches!(err, FfsError::InvalidGeometry(_)));
    assert_eq!(inode.direct(0), None);
}
