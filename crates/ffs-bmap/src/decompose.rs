//! Logical block number to indirection path.
//!
//! LBNs `0..D` live in the inode's direct slots. The next `F` LBNs hang off
//! the level-1 root, the next `F^2` off the level-2 root, and so on up to
//! level `K`. Within a level-`L` tree the remaining index is written in
//! base `F` with `L` digits, most significant digit first: the first offset
//! selects the entry in the root, the last one the entry in the level-1
//! block that holds the data pointer.

use ffs_error::{FfsError, Result};
use ffs_types::{LogicalBlock, MAX_INDIRECT_LEVELS, MapGeometry};

/// Where a logical block's pointer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockPath {
    /// Direct slot `slot` of the inode table.
    Direct { slot: u32 },
    /// Under the level-`level` root; `offsets[..level]` are the entry
    /// indices from the root down to the level-1 block.
    Indirect {
        level: u32,
        offsets: [u32; MAX_INDIRECT_LEVELS as usize],
    },
}

impl BlockPath {
    /// Indirection depth: 0 for a direct slot.
    #[must_use]
    pub fn level(&self) -> u32 {
        match self {
            Self::Direct { .. } => 0,
            Self::Indirect { level, .. } => *level,
        }
    }

    /// Entry indices from the root down to the level-1 block.
    #[must_use]
    pub fn offsets(&self) -> &[u32] {
        match self {
            Self::Direct { .. } => &[],
            Self::Indirect { level, offsets } => &offsets[..*level as usize],
        }
    }
}

/// Decompose `lbn` into its indirection path.
///
/// Fails with `AddressOverflow` when `lbn` lies past the last level.
pub fn decompose(geometry: &MapGeometry, lbn: LogicalBlock) -> Result<BlockPath> {
    let direct = u64::from(geometry.direct_slots);
    if lbn.0 < direct {
        #[expect(clippy::cast_possible_truncation)]
        let slot = lbn.0 as u32;
        return Ok(BlockPath::Direct { slot });
    }

    let fan_out = geometry.fan_out();
    let mut remaining = lbn.0 - direct;
    for level in 1..=geometry.indirect_levels {
        let capacity = geometry.level_capacity(level);
        if remaining < capacity {
            let mut offsets = [0_u32; MAX_INDIRECT_LEVELS as usize];
            let mut index = remaining;
            for slot in offsets[..level as usize].iter_mut().rev() {
                #[expect(clippy::cast_possible_truncation)]
                let digit = (index % fan_out) as u32;
                *slot = digit;
                index /= fan_out;
            }
            return Ok(BlockPath::Indirect { level, offsets });
        }
        remaining -= capacity;
    }

    Err(FfsError::AddressOverflow {
        lbn: lbn.0,
        max: geometry.max_blocks(),
    })
}

/// Inverse of [`decompose`].
pub fn compose(geometry: &MapGeometry, path: &BlockPath) -> Result<LogicalBlock> {
    match *path {
        BlockPath::Direct { slot } => {
            if slot >= geometry.direct_slots {
                return Err(FfsError::InvalidArgument(format!(
                    "direct slot {slot} out of range (D={})",
                    geometry.direct_slots
                )));
            }
            Ok(LogicalBlock(u64::from(slot)))
        }
        BlockPath::Indirect { level, .. } => {
            if level == 0 || level > geometry.indirect_levels {
                return Err(FfsError::InvalidArgument(format!(
                    "indirect level {level} out of range (K={})",
                    geometry.indirect_levels
                )));
            }
            let fan_out = geometry.fan_out();
            let base = (1..level).fold(u64::from(geometry.direct_slots), |acc, l| {
                acc + geometry.level_capacity(l)
            });
            let mut index = 0_u64;
            for &offset in path.offsets() {
                if u64::from(offset) >= fan_out {
                    return Err(FfsError::InvalidArgument(format!(
                        "offset {offset} out of range (F={fan_out})"
                    )));
                }
                index = index * fan_out + u64::from(offset);
            }
            Ok(LogicalBlock(base + index))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ext2_1k() -> MapGeometry {
        MapGeometry::new(1024, 12, 1).expect("geometry")
    }

    #[test]
    fn direct_range() {
        let geo = ext2_1k();
        assert_eq!(
            decompose(&geo, LogicalBlock(0)).expect("lbn 0"),
            BlockPath::Direct { slot: 0 }
        );
        assert_eq!(
            decompose(&geo, LogicalBlock(11)).expect("lbn 11"),
            BlockPath::Direct { slot: 11 }
        );
    }

    #[test]
    fn single_indirect_boundaries() {
        let geo = ext2_1k();
        let first = decompose(&geo, LogicalBlock(12)).expect("lbn 12");
        assert_eq!(first.level(), 1);
        assert_eq!(first.offsets(), &[0]);

        let last = decompose(&geo, LogicalBlock(267)).expect("lbn 267");
        assert_eq!(last.offsets(), &[255]);

        let err = decompose(&geo, LogicalBlock(268)).expect_err("past end");
        assert!(matches!(err, FfsError::AddressOverflow { lbn: 268, max: 268 }));
    }

    #[test]
    fn deeper_levels_use_most_significant_offset_first() {
        let geo = MapGeometry::new(1024, 12, 3).expect("geometry");
        // First double-indirect block.
        let path = decompose(&geo, LogicalBlock(12 + 256)).expect("double");
        assert_eq!(path.level(), 2);
        assert_eq!(path.offsets(), &[0, 0]);

        // 12 + 256 + 256*3 + 7 → root entry 3, leaf entry 7.
        let path = decompose(&geo, LogicalBlock(12 + 256 + 3 * 256 + 7)).expect("double");
        assert_eq!(path.offsets(), &[3, 7]);

        // Last addressable block.
        let max = geo.max_blocks();
        let path = decompose(&geo, LogicalBlock(max - 1)).expect("last");
        assert_eq!(path.level(), 3);
        assert_eq!(path.offsets(), &[255, 255, 255]);
        assert!(decompose(&geo, LogicalBlock(max)).is_err());
    }

    #[test]
    fn compose_rejects_bad_paths() {
        let geo = ext2_1k();
        assert!(compose(&geo, &BlockPath::Direct { slot: 12 }).is_err());
        let bad_level = BlockPath::Indirect {
            level: 2,
            offsets: [0; 4],
        };
        assert!(compose(&geo, &bad_level).is_err());
        let bad_offset = BlockPath::Indirect {
            level: 1,
            offsets: [256, 0, 0, 0],
        };
        assert!(compose(&geo, &bad_offset).is_err());
    }

    fn geometries() -> impl Strategy<Value = MapGeometry> {
        (10_u32..=16, 1_u32..=64, 1_u32..=4).prop_map(|(shift, direct, levels)| {
            MapGeometry::new(1 << shift, direct, levels).expect("valid geometry")
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn decompose_compose_agree(geo in geometries(), raw in any::<u64>()) {
            let lbn = LogicalBlock(raw % geo.max_blocks());
            let path = decompose(&geo, lbn).expect("in range");
            prop_assert_eq!(compose(&geo, &path).expect("compose"), lbn);
            let fan_out = geo.fan_out();
            for &offset in path.offsets() {
                prop_assert!(u64::from(offset) < fan_out);
            }
            match path {
                BlockPath::Direct { slot } => prop_assert!(slot < geo.direct_slots),
                BlockPath::Indirect { level, .. } => {
                    prop_assert!(level >= 1 && level <= geo.indirect_levels);
                }
            }
        }

        #[test]
        fn out_of_range_always_overflows(geo in geometries(), extra in 0_u64..1_000_000) {
            let lbn = LogicalBlock(geo.max_blocks().saturating_add(extra));
            let is_overflow = matches!(
                decompose(&geo, lbn),
                Err(FfsError::AddressOverflow { .. })
            );
            prop_assert!(is_overflow);
        }
    }
}
