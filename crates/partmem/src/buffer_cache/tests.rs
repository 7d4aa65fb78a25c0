use std::{
    collections::BTreeSet,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::Duration,
};

use crate::{
    device::{self, BlockId, MemDisk, TracingDevice},
    util::{assert_send, assert_send_sync},
    ErrorKind,
};

use super::{Buf, BufferCache, BufferCacheBuilder, EvictionPolicy, PinnedBuf, BSIZE, NBUF, NSHARD};

const BLOCK: usize = 64;

fn cache_with(buffers: usize, shards: usize, policy: EvictionPolicy) -> (Arc<MemDisk>, BufferCache) {
    let disk = Arc::new(MemDisk::new(BLOCK));
    let cache = BufferCacheBuilder::new(TracingDevice::new(disk.clone(), "test"))
        .buffers(buffers)
        .shards(shards)
        .eviction_policy(policy)
        .build()
        .unwrap();
    (disk, cache)
}

fn cache(buffers: usize, shards: usize) -> (Arc<MemDisk>, BufferCache) {
    cache_with(buffers, shards, EvictionPolicy::Lru)
}

fn members(cache: &BufferCache, shard: usize) -> Vec<usize> {
    cache.shards[shard].lock().lru.iter().collect()
}

fn refcnt(cache: &BufferCache, slot: usize) -> u32 {
    cache.descriptors[slot].refcnt()
}

/// Every slot is on exactly one list, and each list reads the same both ways.
fn assert_lists_consistent(cache: &BufferCache) {
    let mut seen = BTreeSet::new();
    for id in 0..cache.shard_count() {
        let shard = cache.shards[id].lock();
        let forward: Vec<_> = shard.lru.iter().collect();
        let mut backward: Vec<_> = shard.lru.iter().rev().collect();
        backward.reverse();
        assert_eq!(forward, backward, "shard {} links disagree", id);
        assert_eq!(forward.len(), shard.lru.iter().len());
        for slot in forward {
            assert!(seen.insert(slot), "slot {} on two lists", slot);
        }
    }
    assert_eq!(seen.len(), cache.capacity());
}

#[test]
fn send_sync() {
    assert_send_sync::<BufferCache>();
    assert_send::<Buf<'static>>();
    assert_send::<PinnedBuf<'static>>();
}

#[test]
fn builder_rejects_empty_configs() {
    let disk = Arc::new(MemDisk::new(BLOCK));
    let err = BufferCacheBuilder::new(disk.clone())
        .buffers(0)
        .build()
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidConfig(_)));

    let err = BufferCacheBuilder::new(disk).shards(0).build().unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidConfig(_)));

    let err = BufferCacheBuilder::new(MemDisk::new(0)).build().unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidConfig(_)));
}

#[test]
fn buffers_are_dealt_round_robin() {
    let (_, cache) = cache(7, 3);
    assert_eq!(cache.block_size(), BLOCK);
    let mut all: Vec<_> = (0..3).flat_map(|id| members(&cache, id)).collect();
    all.sort_unstable();
    assert_eq!(all, (0..7).collect::<Vec<_>>());
    assert!(members(&cache, 0).iter().all(|slot| slot % 3 == 0));
    assert!(members(&cache, 2).iter().all(|slot| slot % 3 == 2));
    assert_lists_consistent(&cache);
}

#[test]
fn defaults() {
    let cache = BufferCacheBuilder::new(device::memory(BSIZE)).build().unwrap();
    assert_eq!(cache.capacity(), NBUF);
    assert_eq!(cache.shard_count(), NSHARD);
    assert_eq!(cache.block_size(), BSIZE);

    let buf = cache.read(1, 0).unwrap();
    assert_eq!(buf.len(), BSIZE);
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn read_loads_once() {
    let (disk, cache) = cache(4, 2);
    let mut contents = vec![0u8; BLOCK];
    contents[0] = 42;
    disk.set_block(BlockId::new(1, 9), &contents);

    let buf = cache.read(1, 9).unwrap();
    assert!(buf.is_valid());
    assert_eq!(buf[0], 42);
    cache.release(buf);

    let buf = cache.read(1, 9).unwrap();
    assert_eq!(buf[0], 42);
    drop(buf);

    assert_eq!(disk.reads(), 1);
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));
}

#[test]
fn acquire_does_not_load() {
    let (disk, cache) = cache(2, 1);
    let buf = cache.acquire(0, 3);
    assert!(!buf.is_valid());
    cache.release(buf);
    assert_eq!(disk.reads(), 0);
}

#[test]
fn same_block_on_different_devices_is_distinct() {
    let (disk, cache) = cache(4, 2);
    let a = cache.read(1, 4).unwrap();
    let b = cache.read(2, 4).unwrap();
    assert_ne!(a.slot(), b.slot());
    assert_eq!(disk.reads(), 2);
}

#[test]
fn write_reaches_the_disk() {
    let (disk, cache) = cache(4, 2);
    let mut buf = cache.read(0, 17).unwrap();
    buf.fill(7);
    cache.write(&buf).unwrap();
    cache.release(buf);

    assert_eq!(disk.writes(), 1);
    assert_eq!(disk.block(BlockId::new(0, 17)), Some(vec![7; BLOCK]));
}

#[test]
fn failed_read_leaves_buffer_invalid_and_unlocked() {
    let (disk, cache) = cache(2, 1);
    disk.set_faulty(true);
    let err = cache.read(0, 1).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::IoError(_)));

    disk.set_faulty(false);
    let buf = cache.read(0, 1).unwrap();
    assert!(buf.is_valid());
    assert_eq!(refcnt(&cache, buf.slot()), 1);
    assert_eq!(disk.reads(), 1);
}

#[test]
fn write_without_lock_is_fatal_and_skips_the_device() {
    let (disk, cache) = cache(2, 1);
    let buf = cache.read(0, 5).unwrap();

    let result = thread::scope(|s| s.spawn(|| cache.write(&buf)).join());
    let panic = result.unwrap_err();
    let message = panic.downcast_ref::<String>().unwrap();
    assert!(message.contains("bwrite"), "{}", message);

    assert_eq!(disk.writes(), 0);
    cache.release(buf);
}

#[test]
fn buffer_from_another_cache_is_fatal() {
    let (_, first) = cache(2, 1);
    let (other_disk, other) = cache(2, 1);
    let buf = first.read(0, 5).unwrap();

    let result = panic::catch_unwind(AssertUnwindSafe(|| other.write(&buf)));
    let payload = result.unwrap_err();
    let message = payload.downcast_ref::<String>().unwrap();
    assert!(message.contains("different cache"), "{}", message);
    assert_eq!(other_disk.writes(), 0);

    let pinned = first.pin(&buf);
    let result = panic::catch_unwind(AssertUnwindSafe(|| other.unpin(pinned)));
    assert!(result.is_err());
    // The pin was dropped on its own cache while unwinding.
    assert_eq!(refcnt(&first, buf.slot()), 1);
    first.release(buf);
}

#[test]
fn release_from_another_thread_is_fatal() {
    let (_, cache) = cache(2, 1);
    let buf = cache.read(0, 5).unwrap();
    let slot = buf.slot();

    let result = thread::scope(|s| s.spawn(|| cache.release(buf)).join());
    let panic = result.unwrap_err();
    let message = panic.downcast_ref::<String>().unwrap();
    assert!(message.contains("brelse"), "{}", message);

    // The lock stays with the thread that took it.
    assert!(cache.descriptors[slot].content.holding());
    assert!(cache.descriptors[slot].content.unlock());
}

#[test]
fn data_access_from_another_thread_is_fatal() {
    let (_, cache) = cache(2, 1);
    let buf = cache.read(0, 5).unwrap();

    let result = thread::scope(|s| s.spawn(|| buf.data()[0]).join());
    assert!(result.is_err());
    cache.release(buf);
}

#[test]
fn dropping_a_foreign_buffer_leaks_instead_of_panicking() {
    let (_, cache) = cache(2, 1);
    let buf = cache.read(0, 5).unwrap();
    let slot = buf.slot();

    thread::scope(|s| s.spawn(move || drop(buf)).join()).unwrap();

    assert_eq!(refcnt(&cache, slot), 1);
    assert!(cache.descriptors[slot].content.is_locked());
}

#[test]
fn release_makes_buffer_most_recent() {
    let (_, cache) = cache(3, 1);
    let bufs: Vec<_> = (0..3).map(|b| cache.read(0, b).unwrap()).collect();
    let slots: Vec<_> = bufs.iter().map(Buf::slot).collect();

    for buf in bufs {
        let slot = buf.slot();
        cache.release(buf);
        assert_eq!(members(&cache, 0)[0], slot);
    }

    // Oldest release sits at the least recently used end and is reused first.
    assert_eq!(*members(&cache, 0).last().unwrap(), slots[0]);
    let buf = cache.read(0, 3).unwrap();
    assert_eq!(buf.slot(), slots[0]);
    assert_lists_consistent(&cache);
}

#[test]
fn eviction_skips_referenced_buffers() {
    let (_, cache) = cache(2, 1);
    let held = cache.read(0, 0).unwrap();

    for blockno in 1..10 {
        let buf = cache.read(0, blockno).unwrap();
        assert_ne!(buf.slot(), held.slot());
        cache.release(buf);
    }
    assert_eq!(held.block(), BlockId::new(0, 0));
}

#[test]
fn waiter_shares_the_buffer_and_counts_a_reference() {
    let (_, cache) = cache(4, 2);
    let buf = cache.read(0, 8).unwrap();
    let slot = buf.slot();

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            let buf = cache.acquire(0, 8);
            let slot = buf.slot();
            cache.release(buf);
            slot
        });

        while refcnt(&cache, slot) != 2 {
            thread::sleep(Duration::from_millis(1));
        }
        cache.release(buf);

        assert_eq!(waiter.join().unwrap(), slot);
    });

    assert_eq!(refcnt(&cache, slot), 0);
    assert_eq!(cache.stats().hits, 1);
}

#[test]
fn pinned_buffer_survives_release() {
    let (_, cache) = cache(2, 1);
    let buf = cache.read(0, 5).unwrap();
    let pinned = cache.pin(&buf);
    let pinned_slot = pinned.slot();
    cache.release(buf);
    assert_eq!(refcnt(&cache, pinned_slot), 1);

    let buf = cache.read(0, 6).unwrap();
    let other = buf.slot();
    cache.release(buf);

    // Only the unpinned buffer can be recycled.
    let buf = cache.read(0, 7).unwrap();
    assert_eq!(buf.slot(), other);
    cache.release(buf);

    cache.unpin(pinned);
    assert_eq!(refcnt(&cache, pinned_slot), 0);
    let buf = cache.read(0, 8).unwrap();
    assert_eq!(buf.slot(), pinned_slot);
}

#[test]
fn pinned_block_is_still_cached() {
    let (disk, cache) = cache(2, 1);
    let buf = cache.read(3, 11).unwrap();
    let pinned = cache.pin(&buf);
    cache.release(buf);

    let buf = cache.read(3, 11).unwrap();
    assert_eq!(buf.slot(), pinned.slot());
    assert_eq!(pinned.block(), BlockId::new(3, 11));
    assert_eq!(disk.reads(), 1);
}

#[test]
fn exhausted_shard_borrows_from_another() {
    // Shard 0 gets slots {0, 2, 4}, shard 1 gets {1, 3, 5}.
    let (_, cache) = cache(6, 2);
    let held: Vec<_> = [0, 2, 4].iter().map(|&b| cache.read(0, b).unwrap()).collect();
    assert!(held.iter().all(|buf| buf.slot() % 2 == 0));

    let buf = cache.read(0, 6).unwrap();
    assert_eq!(buf.slot() % 2, 1);
    assert_eq!(members(&cache, 0)[0], buf.slot());
    assert_eq!(members(&cache, 0).len(), 4);
    assert_eq!(members(&cache, 1).len(), 2);
    assert_eq!(cache.stats().migrated, 1);
    assert_lists_consistent(&cache);

    // The migrated buffer is released into its new shard.
    let slot = buf.slot();
    cache.release(buf);
    assert_eq!(members(&cache, 0)[0], slot);
    assert_lists_consistent(&cache);
}

#[test]
fn migration_takes_the_donors_least_recent_buffer() {
    let (_, cache) = cache(4, 2);
    // Touch shard 1's buffers so their order is known.
    let first = cache.read(0, 1).unwrap();
    let first_slot = first.slot();
    cache.release(first);
    let second = cache.read(0, 3).unwrap();
    cache.release(second);

    let _a = cache.read(0, 0).unwrap();
    let _b = cache.read(0, 2).unwrap();
    let stolen = cache.read(0, 4).unwrap();
    assert_eq!(stolen.slot(), first_slot);
}

#[test]
#[should_panic(expected = "bget: no buffers")]
fn fully_pinned_cache_is_fatal() {
    let (_, cache) = cache(2, 2);
    let _a = cache.read(0, 0).unwrap();
    let _b = cache.read(0, 1).unwrap();
    let _c = cache.read(0, 2);
}

#[test]
fn timestamp_policy_picks_oldest_release() {
    let (_, cache) = cache_with(3, 1, EvictionPolicy::Timestamp);
    let bufs: Vec<_> = (0..3).map(|b| cache.read(0, b).unwrap()).collect();
    let slots: Vec<_> = bufs.iter().map(Buf::slot).collect();

    let mut bufs = bufs.into_iter().map(Some).collect::<Vec<_>>();
    for i in [1, 0, 2] {
        cache.release(bufs[i].take().unwrap());
    }

    let a = cache.read(0, 10).unwrap();
    assert_eq!(a.slot(), slots[1]);
    let b = cache.read(0, 11).unwrap();
    assert_eq!(b.slot(), slots[0]);
    let c = cache.read(0, 12).unwrap();
    assert_eq!(c.slot(), slots[2]);
}

#[test]
fn timestamp_policy_rescans_when_victim_is_reused() {
    let (_, cache) = cache_with(3, 1, EvictionPolicy::Timestamp);
    for b in 0..3 {
        let buf = cache.read(0, b).unwrap();
        cache.release(buf);
    }
    let victim = cache.shards[0].lock().eligible().unwrap();

    // A hit on the tracked buffer makes it ineligible; the next oldest takes over.
    let hit = cache.read(0, 0).unwrap();
    assert_eq!(hit.slot(), victim);
    let next = cache.shards[0].lock().eligible().unwrap();
    assert_ne!(next, victim);

    let buf = cache.read(0, 20).unwrap();
    assert_eq!(buf.slot(), next);
}

#[test]
fn timestamp_policy_migrates() {
    let (_, cache) = cache_with(4, 2, EvictionPolicy::Timestamp);
    let _a = cache.read(0, 0).unwrap();
    let _b = cache.read(0, 2).unwrap();
    let c = cache.read(0, 4).unwrap();
    assert_eq!(c.slot() % 2, 1);
    assert_eq!(cache.stats().migrated, 1);
    assert_lists_consistent(&cache);

    let d = cache.read(0, 6).unwrap();
    assert_eq!(d.slot() % 2, 1);
    assert_ne!(d.slot(), c.slot());
    assert!(cache.shards[1].lock().eligible().is_none());
}
