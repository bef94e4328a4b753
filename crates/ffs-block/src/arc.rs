//! Adaptive Replacement Cache residency for clean blocks.
//!
//! Dirty (delayed-write) blocks never live here; [`crate::WriteBackCache`]
//! keeps them pinned in its own map until they are flushed.

use ffs_types::BlockNumber;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    /// Seen once recently (T1).
    Recent,
    /// Seen at least twice (T2).
    Frequent,
    /// Evicted from `Recent`; key only (B1).
    RecentGhost,
    /// Evicted from `Frequent`; key only (B2).
    FrequentGhost,
}

#[derive(Debug)]
pub(crate) struct ArcResidency {
    capacity: usize,
    /// Adaptive target size for the `Recent` tier.
    target_recent: usize,
    recent: VecDeque<BlockNumber>,
    frequent: VecDeque<BlockNumber>,
    recent_ghosts: VecDeque<BlockNumber>,
    frequent_ghosts: VecDeque<BlockNumber>,
    tiers: HashMap<BlockNumber, Tier>,
    data: HashMap<BlockNumber, Vec<u8>>,
}

impl ArcResidency {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            target_recent: 0,
            recent: VecDeque::new(),
            frequent: VecDeque::new(),
            recent_ghosts: VecDeque::new(),
            frequent_ghosts: VecDeque::new(),
            tiers: HashMap::new(),
            data: HashMap::new(),
        }
    }

    pub(crate) fn resident_len(&self) -> usize {
        self.data.len()
    }

    /// Look up a resident block, promoting it to the frequent tier.
    pub(crate) fn get(&mut self, block: BlockNumber) -> Option<&[u8]> {
        match self.tiers.get(&block).copied() {
            Some(Tier::Recent) => {
                unlink(&mut self.recent, block);
                self.frequent.push_back(block);
                self.tiers.insert(block, Tier::Frequent);
            }
            Some(Tier::Frequent) => {
                unlink(&mut self.frequent, block);
                self.frequent.push_back(block);
            }
            Some(Tier::RecentGhost | Tier::FrequentGhost) | None => return None,
        }
        self.data.get(&block).map(Vec::as_slice)
    }

    /// Make `bytes` the resident clean copy of `block`.
    pub(crate) fn insert(&mut self, block: BlockNumber, bytes: Vec<u8>) {
        match self.tiers.get(&block).copied() {
            Some(Tier::Recent | Tier::Frequent) => {
                self.data.insert(block, bytes);
                let _ = self.get(block);
                return;
            }
            Some(Tier::RecentGhost) => {
                let step = (self.frequent_ghosts.len() / self.recent_ghosts.len().max(1)).max(1);
                self.target_recent = (self.target_recent + step).min(self.capacity);
                unlink(&mut self.recent_ghosts, block);
                self.make_room(false);
                self.frequent.push_back(block);
                self.tiers.insert(block, Tier::Frequent);
            }
            Some(Tier::FrequentGhost) => {
                let step = (self.recent_ghosts.len() / self.frequent_ghosts.len().max(1)).max(1);
                self.target_recent = self.target_recent.saturating_sub(step);
                unlink(&mut self.frequent_ghosts, block);
                self.make_room(true);
                self.frequent.push_back(block);
                self.tiers.insert(block, Tier::Frequent);
            }
            None => {
                let l1 = self.recent.len() + self.recent_ghosts.len();
                let total = l1 + self.frequent.len() + self.frequent_ghosts.len();
                if l1 >= self.capacity {
                    if self.recent.len() < self.capacity {
                        if let Some(old) = self.recent_ghosts.pop_front() {
                            self.tiers.remove(&old);
                        }
                        self.make_room(false);
                    } else if let Some(victim) = self.recent.pop_front() {
                        self.tiers.remove(&victim);
                        self.data.remove(&victim);
                    }
                } else if total >= self.capacity {
                    if total >= self.capacity.saturating_mul(2) {
                        if let Some(old) = self.frequent_ghosts.pop_front() {
                            self.tiers.remove(&old);
                        }
                    }
                    self.make_room(false);
                }
                self.recent.push_back(block);
                self.tiers.insert(block, Tier::Recent);
            }
        }
        self.data.insert(block, bytes);
    }

    /// Forget any resident copy of `block` (it is being shadowed or rewritten).
    pub(crate) fn invalidate(&mut self, block: BlockNumber) {
        match self.tiers.remove(&block) {
            Some(Tier::Recent) => unlink(&mut self.recent, block),
            Some(Tier::Frequent) => unlink(&mut self.frequent, block),
            Some(Tier::RecentGhost) => unlink(&mut self.recent_ghosts, block),
            Some(Tier::FrequentGhost) => unlink(&mut self.frequent_ghosts, block),
            None => {}
        }
        self.data.remove(&block);
    }

    /// Evict one resident block into a ghost list if the cache is full.
    fn make_room(&mut self, incoming_was_frequent_ghost: bool) {
        if self.recent.len() + self.frequent.len() < self.capacity {
            return;
        }
        let recent_len = self.recent.len();
        let take_recent = recent_len >= 1
            && (recent_len > self.target_recent
                || (incoming_was_frequent_ghost && recent_len == self.target_recent)
                || self.frequent.is_empty());
        if take_recent {
            if let Some(victim) = self.recent.pop_front() {
                self.data.remove(&victim);
                self.recent_ghosts.push_back(victim);
                self.tiers.insert(victim, Tier::RecentGhost);
            }
        } else if let Some(victim) = self.frequent.pop_front() {
            self.data.remove(&victim);
            self.frequent_ghosts.push_back(victim);
            self.tiers.insert(victim, Tier::FrequentGhost);
        }
    }
}

fn unlink(list: &mut VecDeque<BlockNumber>, block: BlockNumber) {
    if let Some(pos) = list.iter().position(|k| *k == block) {
        let _ = list.remove(pos);
    }
}
