use std::sync::{atomic::Ordering, Arc};

use cache_padded::CachePadded;

use crate::{device::BlockId, util::index_list::IndexList};

use super::{BufferDesc, EvictionPolicy};

/// One independently locked partition of the cache.
///
/// The list runs from most recently used (front) to least recently used (back).
/// Everything reachable from here, including the reference counts and tags of the
/// member descriptors, is only touched while the shard's mutex is held.
pub(super) struct Shard {
    pub lru: IndexList<CachePadded<BufferDesc>>,
    policy: EvictionPolicy,
    /// `Timestamp` policy: the eligible member with the oldest tick.
    victim: Option<usize>,
}

impl Shard {
    pub fn new(descriptors: Arc<[CachePadded<BufferDesc>]>, policy: EvictionPolicy) -> Self {
        Self {
            lru: IndexList::new(descriptors),
            policy,
            victim: None,
        }
    }

    fn desc(&self, slot: usize) -> &BufferDesc {
        &self.lru.links()[slot]
    }

    pub fn find(&self, block: BlockId) -> Option<usize> {
        self.lru.iter().find(|&slot| self.desc(slot).tag() == Some(block))
    }

    /// The buffer this shard would give up next, if any has no references.
    pub fn eligible(&self) -> Option<usize> {
        match self.policy {
            EvictionPolicy::Lru => self
                .lru
                .iter()
                .rev()
                .find(|&slot| self.desc(slot).refcnt() == 0),
            EvictionPolicy::Timestamp => self.victim,
        }
    }

    /// Take one more reference on a member.
    pub fn get(&mut self, slot: usize) {
        if self.desc(slot).refcnt.fetch_add(1, Ordering::Relaxed) == 0 {
            self.lost_eligible(slot);
        }
    }

    /// Drop one reference on a member. Returns the remaining count, or `None` if
    /// there was nothing to drop.
    pub fn put(&mut self, slot: usize) -> Option<u32> {
        let desc = self.desc(slot);
        let count = desc.refcnt().checked_sub(1)?;
        desc.refcnt.store(count, Ordering::Relaxed);
        Some(count)
    }

    /// Record that a member's last reference went away through a release.
    pub fn touch(&mut self, slot: usize, tick: u64) {
        self.lru.move_to_front(slot);
        self.desc(slot).last_used.store(tick, Ordering::Relaxed);
        self.gained_eligible(slot);
    }

    /// Rebind an unreferenced member to `block`, handing the single reference to
    /// the caller.
    pub fn recycle(&mut self, slot: usize, block: BlockId) {
        let desc = self.desc(slot);
        debug_assert_eq!(desc.refcnt(), 0, "recycling a referenced buffer");
        desc.set_tag(block);
        desc.valid.store(false, Ordering::Relaxed);
        desc.refcnt.store(1, Ordering::Relaxed);
        self.lost_eligible(slot);
    }

    /// Unlink a member so it can be adopted by another shard.
    pub fn detach(&mut self, slot: usize) {
        self.lru.remove(slot);
        self.lost_eligible(slot);
    }

    /// Link a buffer detached from another shard at the most recently used end.
    pub fn adopt(&mut self, slot: usize) {
        self.lru.push_front(slot);
    }

    pub fn gained_eligible(&mut self, slot: usize) {
        if self.policy != EvictionPolicy::Timestamp {
            return;
        }
        let tick = self.desc(slot).last_used.load(Ordering::Relaxed);
        let older = match self.victim {
            None => true,
            Some(v) => tick < self.desc(v).last_used.load(Ordering::Relaxed),
        };
        if older {
            self.victim = Some(slot);
        }
    }

    fn lost_eligible(&mut self, slot: usize) {
        if self.victim == Some(slot) {
            self.rescan();
        }
    }

    /// Recompute the oldest eligible member from scratch. Ties go to the member
    /// nearest the least recently used end.
    pub fn rescan(&mut self) {
        if self.policy != EvictionPolicy::Timestamp {
            return;
        }
        let mut best: Option<(usize, u64)> = None;
        for slot in self.lru.iter().rev() {
            let desc = self.desc(slot);
            if desc.refcnt() != 0 {
                continue;
            }
            let tick = desc.last_used.load(Ordering::Relaxed);
            if best.map_or(true, |(_, t)| tick < t) {
                best = Some((slot, tick));
            }
        }
        self.victim = best.map(|(slot, _)| slot);
    }
}
