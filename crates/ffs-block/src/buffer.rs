//! Scoped buffer cache.
//!
//! A [`Buffer`] is the only writable in-memory copy of its block while it
//! is checked out. Callers hand it back through [`BufferCache::release`]
//! and pick the consistency guarantee at the call site:
//!
//! - [`Durability::Synchronous`] returns only after the device write and a
//!   device sync completed.
//! - [`Durability::Delayed`] keeps the new contents in memory; later reads
//!   see them, the device sees them at the next [`WriteBackCache::flush`].
//! - [`Durability::None`] discards any modification.
//!
//! Dropping a buffer without releasing it behaves like `Durability::None`.

use crate::BlockDevice;
use crate::arc::ArcResidency;
use ffs_error::{FfsError, Result};
use ffs_types::BlockNumber;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// How a block is materialized when it is checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquireMode {
    /// Current contents: pending delayed write, cached copy, or device read.
    ReadExisting,
    /// All zeros, without touching the device.
    AllocateZeroed,
    /// Unspecified contents, without touching the device. The caller must
    /// overwrite the whole block before releasing it with a write.
    AllocateUninitialized,
}

/// Write guarantee requested when a buffer is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    Synchronous,
    Delayed,
    None,
}

type LeaseSet = Arc<Mutex<HashSet<BlockNumber>>>;

#[derive(Debug)]
struct Lease {
    block: BlockNumber,
    leases: LeaseSet,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.leases.lock().remove(&self.block);
    }
}

/// A checked-out block.
#[derive(Debug)]
pub struct Buffer {
    block: BlockNumber,
    bytes: Vec<u8>,
    lease: Option<Lease>,
}

impl Buffer {
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Scoped, read-or-allocate access to fixed-size blocks.
pub trait BufferCache: Send + Sync {
    /// Block size in bytes; every buffer has exactly this length.
    fn block_size(&self) -> u32;

    /// Number of addressable blocks.
    fn block_count(&self) -> u64;

    /// Check out `block`. Fails with `BufferBusy` while another buffer for
    /// the same block is outstanding.
    fn acquire(&self, block: BlockNumber, mode: AcquireMode) -> Result<Buffer>;

    /// Copy of the current contents of `block` without taking a lease.
    /// Sees delayed writes. Used by lookups that never modify the block.
    fn peek(&self, block: BlockNumber) -> Result<Vec<u8>>;

    /// Hand `buffer` back with the requested write guarantee.
    fn release(&self, buffer: Buffer, durability: Durability) -> Result<()>;
}

/// Counters exported by [`WriteBackCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sync_writes: u64,
    pub delayed_writes: u64,
    pub flushed_blocks: u64,
    pub flushes: u64,
}

#[derive(Debug)]
struct CacheState {
    clean: ArcResidency,
    dirty: BTreeMap<BlockNumber, Vec<u8>>,
    stats: CacheStats,
}

/// Write-back buffer cache over a [`BlockDevice`].
///
/// Clean blocks are kept under ARC replacement; delayed writes stay pinned
/// in a dirty map until [`flush`](Self::flush).
#[derive(Debug)]
pub struct WriteBackCache<D: BlockDevice> {
    dev: D,
    state: Mutex<CacheState>,
    leases: LeaseSet,
}

impl<D: BlockDevice> WriteBackCache<D> {
    pub fn new(dev: D, capacity_blocks: usize) -> Result<Self> {
        if capacity_blocks == 0 {
            return Err(FfsError::Format(
                "WriteBackCache capacity_blocks must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            dev,
            state: Mutex::new(CacheState {
                clean: ArcResidency::new(capacity_blocks),
                dirty: BTreeMap::new(),
                stats: CacheStats::default(),
            }),
            leases: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    /// Blocks holding delayed writes, in block order.
    #[must_use]
    pub fn dirty_blocks(&self) -> Vec<BlockNumber> {
        self.state.lock().dirty.keys().copied().collect()
    }

    #[must_use]
    pub fn is_checked_out(&self, block: BlockNumber) -> bool {
        self.leases.lock().contains(&block)
    }

    /// Write every delayed block back in block order, then sync the device.
    ///
    /// On a write failure the failed block and everything after it stay
    /// dirty; the blocks already written are clean.
    pub fn flush(&self) -> Result<usize> {
        let pending = std::mem::take(&mut self.state.lock().dirty);
        let mut written = 0_usize;
        let mut remaining = pending.into_iter();
        while let Some((block, bytes)) = remaining.next() {
            if let Err(err) = self.dev.write_block(block, &bytes) {
                warn!(
                    target: "ffs::block",
                    event = "flush_write_failed",
                    block = block.0,
                    written,
                    error = %err
                );
                let mut state = self.state.lock();
                state.dirty.entry(block).or_insert(bytes);
                for (rest_block, rest) in remaining {
                    state.dirty.entry(rest_block).or_insert(rest);
                }
                drop(state);
                return Err(err);
            }
            let mut state = self.state.lock();
            state.clean.insert(block, bytes);
            state.stats.flushed_blocks += 1;
            drop(state);
            written += 1;
        }
        self.dev.sync()?;
        self.state.lock().stats.flushes += 1;
        debug!(target: "ffs::block", event = "flush", written);
        Ok(written)
    }

    fn check_range(&self, block: BlockNumber) -> Result<()> {
        if block.0 >= self.dev.block_count() {
            return Err(FfsError::Corruption {
                block: block.0,
                detail: format!("block beyond device end ({})", self.dev.block_count()),
            });
        }
        Ok(())
    }

    fn checkout(&self, block: BlockNumber) -> Result<Lease> {
        self.check_range(block)?;
        let mut leases = self.leases.lock();
        if !leases.insert(block) {
            return Err(FfsError::BufferBusy { block: block.0 });
        }
        drop(leases);
        Ok(Lease {
            block,
            leases: Arc::clone(&self.leases),
        })
    }

    /// Current contents: pending delayed write, then clean copy, then device.
    fn load(&self, block: BlockNumber) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        let cached = match state.dirty.get(&block) {
            Some(bytes) => Some(bytes.clone()),
            None => state.clean.get(block).map(<[u8]>::to_vec),
        };
        if cached.is_some() {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        drop(state);
        if let Some(bytes) = cached {
            return Ok(bytes);
        }
        let bytes = self.dev.read_block(block)?.into_inner();
        self.state.lock().clean.insert(block, bytes.clone());
        Ok(bytes)
    }

    fn block_len(&self) -> usize {
        self.dev.block_size() as usize
    }
}

impl<D: BlockDevice> BufferCache for WriteBackCache<D> {
    fn block_size(&self) -> u32 {
        self.dev.block_size()
    }

    fn block_count(&self) -> u64 {
        self.dev.block_count()
    }

    fn acquire(&self, block: BlockNumber, mode: AcquireMode) -> Result<Buffer> {
        let lease = self.checkout(block)?;
        let bytes = match mode {
            AcquireMode::AllocateZeroed => vec![0_u8; self.block_len()],
            AcquireMode::AllocateUninitialized => {
                let mut state = self.state.lock();
                let stale = match state.dirty.get(&block) {
                    Some(bytes) => Some(bytes.clone()),
                    None => state.clean.get(block).map(<[u8]>::to_vec),
                };
                drop(state);
                stale.unwrap_or_else(|| vec![0_u8; self.block_len()])
            }
            AcquireMode::ReadExisting => self.load(block)?,
        };
        trace!(target: "ffs::block", event = "buffer_acquire", block = block.0, ?mode);
        Ok(Buffer {
            block,
            bytes,
            lease: Some(lease),
        })
    }

    fn peek(&self, block: BlockNumber) -> Result<Vec<u8>> {
        self.check_range(block)?;
        self.load(block)
    }

    fn release(&self, buffer: Buffer, durability: Durability) -> Result<()> {
        let Buffer {
            block,
            bytes,
            lease,
        } = buffer;
        if bytes.len() != self.block_len() {
            return Err(FfsError::Format(format!(
                "buffer for block {} has {} bytes, expected {}",
                block.0,
                bytes.len(),
                self.block_len()
            )));
        }
        match durability {
            Durability::Synchronous => {
                self.dev.write_block(block, &bytes)?;
                // The device now holds these bytes whether or not the sync
                // lands, so the cache must hold them too.
                let mut state = self.state.lock();
                state.dirty.remove(&block);
                state.clean.insert(block, bytes);
                state.stats.sync_writes += 1;
                drop(state);
                self.dev.sync()?;
                debug!(target: "ffs::block", event = "release_sync", block = block.0);
            }
            Durability::Delayed => {
                let mut state = self.state.lock();
                state.clean.invalidate(block);
                state.dirty.insert(block, bytes);
                state.stats.delayed_writes += 1;
                drop(state);
                trace!(target: "ffs::block", event = "release_delayed", block = block.0);
            }
            Durability::None => {}
        }
        drop(lease);
        Ok(())
    }
}
