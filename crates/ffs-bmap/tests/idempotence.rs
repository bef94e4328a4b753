#![forbid(unsafe_code)]

mod support;

use ffs_bmap::{FillPolicy, ResolveFlags};
use ffs_types::LogicalBlock;
use proptest::prelude::*;
use support::{BLOCK_SIZE, Mount, cached_tree, geometry};

/// Covers direct, single and double indirect LBNs for D=12, F=256.
const MAX_LBN: u64 = 12 + 256 + 256 * 256;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn second_resolve_allocates_nothing(
        lbns in prop::collection::vec(0..MAX_LBN, 1..24),
        overwrite in any::<bool>(),
    ) {
        let m = Mount::quota(1024, geometry(12, 2));
        let mapper = m.mapper();
        let mut inode = m.inode(8);
        let fill = if overwrite { FillPolicy::Overwrite } else { FillPolicy::ZeroFill };
        let flags = ResolveFlags::allocate().with_fill(fill);

        let first: Vec<_> = lbns
            .iter()
            .map(|&lbn| {
                mapper
                    .resolve(&mut inode, LogicalBlock(lbn), BLOCK_SIZE, flags)
                    .expect("first")
                    .block
            })
            .collect();
        let allocated = m.alloc.bitmap().allocated_blocks(&m.ctx);
        prop_assert_eq!(&allocated, &cached_tree(&m.cache, &inode));
        let snapshot = inode.snapshot();

        for (&lbn, &block) in lbns.iter().zip(&first) {
            let again = mapper
                .resolve(&mut inode, LogicalBlock(lbn), BLOCK_SIZE, flags)
                .expect("again");
            prop_assert_eq!(again.block, block);
            prop_assert!(!again.allocated);
        }
        prop_assert_eq!(m.alloc.bitmap().allocated_blocks(&m.ctx), allocated);
        prop_assert_eq!(inode.snapshot(), snapshot);
    }
}
