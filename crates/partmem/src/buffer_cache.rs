//! Partitioned Buffer Cache
//!
//! Cached copies of disk blocks, split into shards by block number so lookups of
//! unrelated blocks do not contend on one lock. Each shard keeps its own LRU list.
//! When a shard has no unreferenced buffer left it scavenges one from another
//! shard, probing them with `try_lock` so two shards stealing from each other can
//! never deadlock.
//!
//! Only one thread at a time may use a buffer. [`BufferCache::read`] and
//! [`BufferCache::acquire`] return a [`Buf`] holding the buffer's sleep lock, which
//! stays held across device I/O until the `Buf` is released.

use std::{
    fmt,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use cache_padded::CachePadded;
use nonmax::NonMaxUsize;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    device::{BlockDevice, BlockId, Device, Transfer},
    fatal::{fatal, Fatal},
    sync::SleepLock,
    util::index_list::{AtomicLinks, Link},
    ErrorKind, Result,
};

use self::shard::Shard;

mod shard;
#[cfg(test)]
mod tests;

/// Default block size in bytes.
pub const BSIZE: usize = 1024;
/// Default number of buffers.
pub const NBUF: usize = 30;
/// Default number of shards.
pub const NSHARD: usize = 13;

/// How a shard picks the unreferenced buffer to give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// The unreferenced buffer nearest the least recently used end of the list.
    #[default]
    Lru,
    /// The unreferenced buffer with the oldest release tick, tracked per shard and
    /// rescanned whenever the tracked buffer is taken.
    Timestamp,
}

pub struct BufferCache {
    device: Device,
    block_size: usize,
    descriptors: Arc<[CachePadded<BufferDesc>]>,
    shards: Box<[CachePadded<Mutex<Shard>>]>,
    clock: AtomicU64,
    stats: Stats,
}

impl BufferCache {
    /// Return a locked buffer with the contents of the indicated block.
    ///
    /// On a device error the buffer is released again and stays invalid, so the
    /// next reader retries the transfer.
    pub fn read(&self, dev: u32, blockno: u32) -> Result<Buf<'_>> {
        let mut buf = self.acquire(dev, blockno);
        if !buf.is_valid() {
            let block = buf.block;
            self.device.transfer(block, Transfer::Read(buf.data_mut()))?;
            buf.desc().valid.store(true, Ordering::Release);
        }
        Ok(buf)
    }

    /// Return the locked buffer for a block without loading it.
    ///
    /// Sleeps until no other thread holds the buffer. Acquiring a block the calling
    /// thread already holds never returns.
    pub fn acquire(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let block = BlockId::new(dev, blockno);
        let slot = self.lookup(block);
        self.descriptors[slot].content.lock();
        Buf {
            cache: self,
            slot,
            block,
        }
    }

    /// Write the buffer's contents to disk. The calling thread must hold it.
    pub fn write(&self, buf: &Buf<'_>) -> Result<()> {
        self.check_owner(buf);
        let desc = buf.desc();
        if !desc.content.holding() {
            fatal(Fatal::WriteNotHeld(buf.block));
        }
        // Safety: the calling thread holds the content lock.
        let data = unsafe { &(&*desc.content.data_ptr())[..] };
        self.device.transfer(buf.block, Transfer::Write(data))
    }

    /// Release a locked buffer and drop its reference. The buffer becomes the most
    /// recently used one of its shard once nobody references it.
    pub fn release(&self, buf: Buf<'_>) {
        self.check_owner(&buf);
        let buf = ManuallyDrop::new(buf);
        if !buf.desc().content.unlock() {
            fatal(Fatal::ReleaseNotHeld(buf.block));
        }
        self.put(buf.slot, buf.block);
    }

    /// Keep the buffer resident after it is released, without holding its lock.
    pub fn pin(&self, buf: &Buf<'_>) -> PinnedBuf<'_> {
        self.check_owner(buf);
        self.shard_of(buf.block).lock().get(buf.slot);
        PinnedBuf {
            cache: self,
            slot: buf.slot,
            block: buf.block,
        }
    }

    /// Give up a pin. Equivalent to dropping it.
    pub fn unpin(&self, pinned: PinnedBuf<'_>) {
        if !ptr::eq(pinned.cache, self) {
            fatal(Fatal::ForeignBuffer(pinned.block));
        }
        drop(pinned);
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn capacity(&self) -> usize {
        self.descriptors.len()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn shard_index(&self, block: BlockId) -> usize {
        block.blockno as usize % self.shards.len()
    }

    fn shard_of(&self, block: BlockId) -> &Mutex<Shard> {
        &self.shards[self.shard_index(block)]
    }

    fn check_owner(&self, buf: &Buf<'_>) {
        if !ptr::eq(buf.cache, self) {
            fatal(Fatal::ForeignBuffer(buf.block));
        }
    }

    /// Find the slot caching `block`, or bind one to it. Either way the caller
    /// comes away with one reference on the slot.
    fn lookup(&self, block: BlockId) -> usize {
        let home = self.shard_index(block);
        let mut shard = self.shards[home].lock();

        if let Some(slot) = shard.find(block) {
            shard.get(slot);
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return slot;
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        if let Some(slot) = shard.eligible() {
            shard.recycle(slot, block);
            self.stats.recycled.fetch_add(1, Ordering::Relaxed);
            return slot;
        }

        // Scavenge from the other shards, skipping any that are busy. Blocking here
        // while holding our own shard could deadlock against a thread doing the same
        // in the other direction.
        let count = self.shards.len();
        for step in 1..count {
            let id = (home + step) % count;
            let mut donor = match self.shards[id].try_lock() {
                Some(donor) => donor,
                None => continue,
            };
            if let Some(slot) = donor.eligible() {
                donor.detach(slot);
                shard.adopt(slot);
                shard.recycle(slot, block);
                drop(donor);

                debug!(
                    "bget: moved buffer {} from shard {} to shard {} for {}",
                    slot, id, home, block
                );
                self.stats.migrated.fetch_add(1, Ordering::Relaxed);
                return slot;
            }
        }

        drop(shard);
        fatal(Fatal::NoBuffers)
    }

    /// Drop one reference taken by [`lookup`](Self::lookup) or [`pin`](Self::pin).
    fn put(&self, slot: usize, block: BlockId) {
        let mut shard = self.shard_of(block).lock();
        match shard.put(slot) {
            Some(0) => {
                let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
                shard.touch(slot, tick);
            }
            Some(_) => {}
            None => {
                drop(shard);
                fatal(Fatal::UnpinUnderflow(block))
            }
        }
    }

    fn unpin_slot(&self, slot: usize, block: BlockId) {
        let mut shard = self.shard_of(block).lock();
        match shard.put(slot) {
            Some(0) => shard.gained_eligible(slot),
            Some(_) => {}
            None => {
                drop(shard);
                fatal(Fatal::UnpinUnderflow(block))
            }
        }
    }
}

impl fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferCache")
            .field("capacity", &self.capacity())
            .field("shards", &self.shard_count())
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

pub struct BufferCacheBuilder {
    device: Device,
    buffers: usize,
    shards: usize,
    policy: EvictionPolicy,
}

impl BufferCacheBuilder {
    pub fn new<D>(device: D) -> Self
    where
        D: BlockDevice + Send + Sync + 'static,
    {
        Self {
            device: Arc::new(device),
            buffers: NBUF,
            shards: NSHARD,
            policy: EvictionPolicy::default(),
        }
    }

    pub fn buffers(mut self, buffers: usize) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    pub fn eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Result<BufferCache> {
        if self.buffers == 0 {
            return Err(ErrorKind::InvalidConfig("buffer cache needs at least one buffer").into());
        }
        if self.shards == 0 {
            return Err(ErrorKind::InvalidConfig("buffer cache needs at least one shard").into());
        }
        let block_size = self.device.block_size();
        if block_size == 0 {
            return Err(ErrorKind::InvalidConfig("device reports a zero block size").into());
        }

        let descriptors: Arc<[CachePadded<BufferDesc>]> = (0..self.buffers)
            .map(|_| CachePadded::new(BufferDesc::new(block_size)))
            .collect();

        // Deal the buffers out round-robin.
        let shards: Box<[_]> = (0..self.shards)
            .map(|id| {
                let mut shard = Shard::new(descriptors.clone(), self.policy);
                for slot in (id..self.buffers).step_by(self.shards) {
                    shard.adopt(slot);
                }
                shard.rescan();
                CachePadded::new(Mutex::new(shard))
            })
            .collect();

        Ok(BufferCache {
            device: self.device,
            block_size,
            descriptors,
            shards,
            clock: AtomicU64::new(0),
            stats: Stats::default(),
        })
    }
}

/// A locked, referenced buffer.
///
/// Handing a `Buf` to another thread does not hand over the lock: any use from a
/// thread other than the one that acquired it is fatal. Dropping a `Buf` on the
/// thread that holds it releases it.
pub struct Buf<'a> {
    cache: &'a BufferCache,
    slot: usize,
    block: BlockId,
}

impl<'a> Buf<'a> {
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// The cache slot backing this buffer.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn is_valid(&self) -> bool {
        self.desc().valid.load(Ordering::Acquire)
    }

    pub fn data(&self) -> &[u8] {
        let desc = self.desc();
        if !desc.content.holding() {
            fatal(Fatal::AccessNotHeld(self.block));
        }
        // Safety: the calling thread holds the content lock, and the returned
        // borrow ends before this `Buf` can be released.
        unsafe { &(&*desc.content.data_ptr())[..] }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let desc = self.desc();
        if !desc.content.holding() {
            fatal(Fatal::AccessNotHeld(self.block));
        }
        // Safety: as for `data`, and `&mut self` makes the borrow unique.
        unsafe { &mut (&mut *desc.content.data_ptr())[..] }
    }

    fn desc(&self) -> &'a BufferDesc {
        &self.cache.descriptors[self.slot]
    }
}

impl<'a> Deref for Buf<'a> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl<'a> DerefMut for Buf<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl<'a> Drop for Buf<'a> {
    fn drop(&mut self) {
        if self.desc().content.unlock() {
            self.cache.put(self.slot, self.block);
        } else {
            warn!(
                "buffer {} dropped by a thread that does not hold it, reference leaked",
                self.block
            );
        }
    }
}

impl<'a> fmt::Debug for Buf<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf")
            .field("block", &self.block)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

/// A reference that keeps a buffer from being recycled. Dropping it unpins.
#[must_use = "dropping a pin unpins the buffer immediately"]
pub struct PinnedBuf<'a> {
    cache: &'a BufferCache,
    slot: usize,
    block: BlockId,
}

impl<'a> PinnedBuf<'a> {
    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl<'a> Drop for PinnedBuf<'a> {
    fn drop(&mut self) {
        self.cache.unpin_slot(self.slot, self.block);
    }
}

impl<'a> fmt::Debug for PinnedBuf<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBuf")
            .field("block", &self.block)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found the block already cached.
    pub hits: u64,
    /// Lookups that had to bind a buffer.
    pub misses: u64,
    /// Misses served from the block's own shard.
    pub recycled: u64,
    /// Misses served by moving a buffer over from another shard.
    pub migrated: u64,
}

#[derive(Debug, Default)]
struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
    recycled: AtomicU64,
    migrated: AtomicU64,
}

impl Stats {
    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            migrated: self.migrated.load(Ordering::Relaxed),
        }
    }
}

const UNBOUND: u64 = u64::MAX;

/// Per-slot state. The tag, reference count, tick and list links belong to the
/// shard currently holding the slot and change only under its lock; `valid` and
/// the payload belong to the holder of `content`.
pub(crate) struct BufferDesc {
    links: AtomicLinks,
    dev: AtomicU64,
    blockno: AtomicU32,
    refcnt: AtomicU32,
    last_used: AtomicU64,
    valid: AtomicBool,
    content: SleepLock<Box<[u8]>>,
}

impl BufferDesc {
    fn new(block_size: usize) -> Self {
        Self {
            links: AtomicLinks::default(),
            dev: AtomicU64::new(UNBOUND),
            blockno: AtomicU32::new(0),
            refcnt: AtomicU32::new(0),
            last_used: AtomicU64::new(0),
            valid: AtomicBool::new(false),
            content: SleepLock::new(vec![0; block_size].into_boxed_slice()),
        }
    }

    fn tag(&self) -> Option<BlockId> {
        let dev = self.dev.load(Ordering::Relaxed);
        if dev == UNBOUND {
            return None;
        }
        Some(BlockId::new(dev as u32, self.blockno.load(Ordering::Relaxed)))
    }

    fn set_tag(&self, block: BlockId) {
        self.dev.store(block.dev.into(), Ordering::Relaxed);
        self.blockno.store(block.blockno, Ordering::Relaxed);
    }

    fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Relaxed)
    }
}

impl Link for BufferDesc {
    fn next(&self) -> Option<NonMaxUsize> {
        self.links.next()
    }

    fn prev(&self) -> Option<NonMaxUsize> {
        self.links.prev()
    }

    fn set_next(&self, next: Option<NonMaxUsize>) {
        self.links.set_next(next)
    }

    fn set_prev(&self, prev: Option<NonMaxUsize>) {
        self.links.set_prev(prev)
    }
}

impl<L> Link for CachePadded<L>
where
    L: Link,
{
    fn next(&self) -> Option<NonMaxUsize> {
        self.deref().next()
    }

    fn prev(&self) -> Option<NonMaxUsize> {
        self.deref().prev()
    }

    fn set_next(&self, next: Option<NonMaxUsize>) {
        self.deref().set_next(next)
    }

    fn set_prev(&self, prev: Option<NonMaxUsize>) {
        self.deref().set_prev(prev);
    }
}
