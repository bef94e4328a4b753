#![forbid(unsafe_code)]
//! Public facade over the block-mapping crates.
//!
//! Downstream code (the CLI, embedders) depends on this crate only. It
//! re-exports the mounted [`Volume`] and its options together with the
//! lower layers for callers that drive the mapper directly.

pub use ffs_core::{MountOptions, Volume, VolumeStats};

pub use ffs_alloc::{AllocHint, AllocationContext, BitmapAllocator, BlockAllocator};
pub use ffs_block::{
    AcquireMode, BlockDevice, Buffer, BufferCache, ByteBlockDevice, ByteDevice, CacheStats,
    Durability, FileByteDevice, MemoryByteDevice, WriteBackCache,
};
pub use ffs_bmap::{
    BlockHandle, BlockPath, BlockRun, FillPolicy, IndirectBlock, Materializer, ResolveFlags,
    compose, decompose, preference,
};
pub use ffs_error::{FfsError, Result};
pub use ffs_inode::{Inode, SharedInode};
pub use ffs_types::{BlockNumber, BlockSize, InodeNumber, LogicalBlock, MapGeometry};
