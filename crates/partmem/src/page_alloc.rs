//! Physical page allocator with per-CPU free lists.
//!
//! Every owner (CPU) has its own free list and lock, so the common path never
//! touches a shared lock. An owner that runs dry steals a small batch from the
//! first other owner whose lock is free at that moment. Busy owners are skipped
//! rather than waited on.
//!
//! A free page stores the frame index of the next free page of the same list in
//! its first word. Freed pages are filled with [`FREE_FILL`] and handed-out pages
//! with [`ALLOC_FILL`], so stale accesses show up as a recognisable pattern.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use bytemuck::{bytes_of, pod_read_unaligned};
use cache_padded::CachePadded;
use nonmax::NonMaxUsize;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    fatal::{fatal, Fatal},
    util::{AllocError, SyncUnsafeCell},
    ErrorKind, Result,
};

pub use self::cpu::{CpuId, FixedCpu, ThreadCpu};

mod cpu;

pub const PAGE_SIZE: usize = 4096;
/// Default number of owners.
pub const NCPU: usize = 8;
/// Pattern written over a page when it is freed.
pub const FREE_FILL: u8 = 0x01;
/// Pattern written over a page when it is handed out.
pub const ALLOC_FILL: u8 = 0x05;

const RUN_END: u64 = u64::MAX;
const LINK: usize = std::mem::size_of::<u64>();

type Frame = [u8; PAGE_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    fn round_up(self) -> Self {
        let size = PAGE_SIZE as u64;
        PhysAddr(self.0.div_ceil(size) * size)
    }

    fn round_down(self) -> Self {
        PhysAddr(self.0 - self.0 % PAGE_SIZE as u64)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Exclusive ownership of one physical page, tied to the allocator that handed
/// it out.
#[must_use = "a page that is dropped without being freed is leaked"]
#[derive(Debug, PartialEq, Eq)]
pub struct Page {
    addr: PhysAddr,
    pool: u64,
}

impl Page {
    pub fn addr(&self) -> PhysAddr {
        self.addr
    }

    pub fn into_addr(self) -> PhysAddr {
        self.addr
    }
}

/// How the managed range is spread over the owners at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialDistribution {
    /// Every page starts on one owner's list, as when the boot CPU frees the range.
    Owner(usize),
    /// Page `i` of the range starts on owner `i % owners`.
    Striped,
}

impl Default for InitialDistribution {
    fn default() -> Self {
        InitialDistribution::Owner(0)
    }
}

struct FreeList {
    head: Option<NonMaxUsize>,
    len: usize,
}

static NEXT_POOL: AtomicU64 = AtomicU64::new(0);

pub struct PageAllocator<C = ThreadCpu> {
    id: u64,
    start: PhysAddr,
    end: PhysAddr,
    frames: Box<[SyncUnsafeCell<Frame>]>,
    owners: Box<[CachePadded<Mutex<FreeList>>]>,
    steal_batch: usize,
    cpu: C,
    stats: Stats,
}

impl<C> PageAllocator<C>
where
    C: CpuId,
{
    /// Allocate one page from the calling CPU's list, stealing from another CPU if
    /// it is empty.
    pub fn allocate(&self) -> std::result::Result<Page, AllocError> {
        self.allocate_on(self.current_owner())
    }

    /// Return a page to the calling CPU's list.
    pub fn free(&self, page: Page) {
        self.free_on(self.current_owner(), page)
    }

    fn current_owner(&self) -> usize {
        self.cpu.current() % self.owners.len()
    }
}

impl<C> PageAllocator<C> {
    pub fn allocate_on(&self, owner: usize) -> std::result::Result<Page, AllocError> {
        self.check_owner(owner);
        let mut local = self.owners[owner].lock();

        let index = match self.pop(&mut local) {
            Some(index) => index,
            None => {
                self.steal(owner, &mut local);
                match self.pop(&mut local) {
                    Some(index) => index,
                    None => {
                        drop(local);
                        self.stats.failures.fetch_add(1, Ordering::Relaxed);
                        return Err(AllocError);
                    }
                }
            }
        };
        drop(local);

        // Safety: the frame just left the free lists, so this thread is its only
        // user.
        unsafe { (&mut *self.frame(index)).fill(ALLOC_FILL) };
        self.stats.allocations.fetch_add(1, Ordering::Relaxed);

        Ok(Page {
            addr: self.addr_of(index),
            pool: self.id,
        })
    }

    pub fn free_on(&self, owner: usize, page: Page) {
        self.check_owner(owner);
        let index = self.index_of(&page);

        // Safety: the caller handed us the only `Page` for this frame.
        unsafe { (&mut *self.frame(index)).fill(FREE_FILL) };

        let mut list = self.owners[owner].lock();
        self.push(&mut list, index);
        drop(list);
        self.stats.frees.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_bytes<'a>(&'a self, page: &'a Page) -> &'a [u8] {
        let index = self.index_of(page);
        // Safety: `page` is the only handle to the frame and it is borrowed.
        unsafe { &*self.frame(index) }
    }

    pub fn page_bytes_mut<'a>(&'a self, page: &'a mut Page) -> &'a mut [u8] {
        let index = self.index_of(page);
        // Safety: `page` is the only handle to the frame and it is borrowed mutably.
        unsafe { &mut *self.frame(index) }
    }

    /// Take ownership of the page at `addr` on behalf of this allocator.
    ///
    /// # Safety
    /// Nothing else may access or own the page for as long as the returned `Page`
    /// (or anything it is freed into) exists. Usually `addr` comes from
    /// [`Page::into_addr`] on a page this allocator handed out.
    pub unsafe fn page_at(&self, addr: PhysAddr) -> Page {
        Page {
            addr,
            pool: self.id,
        }
    }

    /// Managed range, `[start, end)`, after rounding to page boundaries.
    pub fn range(&self) -> (PhysAddr, PhysAddr) {
        (self.start, self.end)
    }

    pub fn owners(&self) -> usize {
        self.owners.len()
    }

    pub fn total_pages(&self) -> usize {
        self.frames.len()
    }

    pub fn free_pages(&self) -> usize {
        (0..self.owners.len()).map(|o| self.free_pages_on(o)).sum()
    }

    pub fn free_pages_on(&self, owner: usize) -> usize {
        self.check_owner(owner);
        self.owners[owner].lock().len
    }

    pub fn stats(&self) -> AllocStats {
        self.stats.snapshot()
    }

    /// Refill `local` from the first other owner that is idle and has pages.
    fn steal(&self, owner: usize, local: &mut FreeList) {
        let count = self.owners.len();
        for step in 1..count {
            let id = (owner + step) % count;
            let mut remote = match self.owners[id].try_lock() {
                Some(remote) => remote,
                None => continue,
            };
            if remote.len == 0 {
                continue;
            }

            let mut moved = 0;
            while moved < self.steal_batch {
                match self.pop(&mut remote) {
                    Some(index) => self.push(local, index),
                    None => break,
                }
                moved += 1;
            }
            drop(remote);

            debug!("kalloc: cpu {} took {} pages from cpu {}", owner, moved, id);
            self.stats.steals.fetch_add(1, Ordering::Relaxed);
            self.stats.stolen.fetch_add(moved as u64, Ordering::Relaxed);
            return;
        }
    }

    fn pop(&self, list: &mut FreeList) -> Option<usize> {
        let head = list.head?.get();
        list.head = self.next_of(head).and_then(NonMaxUsize::new);
        list.len -= 1;
        Some(head)
    }

    fn push(&self, list: &mut FreeList, index: usize) {
        self.set_next(index, list.head.map(|n| n.get()));
        list.head = NonMaxUsize::new(index);
        list.len += 1;
    }

    /// Read the run link of a free frame. The caller holds the lock of the list the
    /// frame is on.
    fn next_of(&self, index: usize) -> Option<usize> {
        // Safety: free frames are only touched under their list's lock.
        let frame = unsafe { &*self.frame(index) };
        match pod_read_unaligned::<u64>(&frame[..LINK]) {
            RUN_END => None,
            next => Some(next as usize),
        }
    }

    fn set_next(&self, index: usize, next: Option<usize>) {
        let link = next.map_or(RUN_END, |n| n as u64);
        // Safety: as for `next_of`.
        let frame = unsafe { &mut *self.frame(index) };
        frame[..LINK].copy_from_slice(bytes_of(&link));
    }

    fn frame(&self, index: usize) -> *mut Frame {
        self.frames[index].get()
    }

    fn addr_of(&self, index: usize) -> PhysAddr {
        PhysAddr(self.start.0 + (index * PAGE_SIZE) as u64)
    }

    /// The frame backing `page`. A page from another allocator, or anything that
    /// is not the start of a managed page, is fatal.
    fn index_of(&self, page: &Page) -> usize {
        let addr = page.addr;
        if page.pool != self.id {
            fatal(Fatal::ForeignPage(addr));
        }
        if !addr.is_page_aligned() {
            fatal(Fatal::MisalignedPage(addr));
        }
        if addr < self.start || addr >= self.end {
            fatal(Fatal::PageOutOfRange(addr));
        }
        ((addr.0 - self.start.0) / PAGE_SIZE as u64) as usize
    }

    fn check_owner(&self, owner: usize) {
        if owner >= self.owners.len() {
            fatal(Fatal::OwnerOutOfRange {
                owner,
                owners: self.owners.len(),
            });
        }
    }
}

impl<C> fmt::Debug for PageAllocator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageAllocator")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("owners", &self.owners.len())
            .finish_non_exhaustive()
    }
}

pub struct PageAllocatorBuilder<C = ThreadCpu> {
    start: PhysAddr,
    end: PhysAddr,
    owners: usize,
    distribution: InitialDistribution,
    steal_batch: usize,
    cpu: C,
}

impl PageAllocatorBuilder<ThreadCpu> {
    /// Manage the pages that fit entirely inside `[start, end)`.
    pub fn new(start: PhysAddr, end: PhysAddr) -> Self {
        Self {
            start,
            end,
            owners: NCPU,
            distribution: InitialDistribution::default(),
            steal_batch: 2,
            cpu: ThreadCpu,
        }
    }
}

impl<C> PageAllocatorBuilder<C>
where
    C: CpuId,
{
    pub fn owners(mut self, owners: usize) -> Self {
        self.owners = owners;
        self
    }

    pub fn distribution(mut self, distribution: InitialDistribution) -> Self {
        self.distribution = distribution;
        self
    }

    /// How many pages a CPU takes from another when its own list is empty.
    pub fn steal_batch(mut self, steal_batch: usize) -> Self {
        self.steal_batch = steal_batch;
        self
    }

    pub fn cpu<D>(self, cpu: D) -> PageAllocatorBuilder<D>
    where
        D: CpuId,
    {
        PageAllocatorBuilder {
            start: self.start,
            end: self.end,
            owners: self.owners,
            distribution: self.distribution,
            steal_batch: self.steal_batch,
            cpu,
        }
    }

    pub fn build(self) -> Result<PageAllocator<C>> {
        if self.owners == 0 {
            return Err(ErrorKind::InvalidConfig("page allocator needs at least one owner").into());
        }
        if self.steal_batch == 0 {
            return Err(ErrorKind::InvalidConfig("steal batch must be at least one page").into());
        }
        if let InitialDistribution::Owner(owner) = self.distribution {
            if owner >= self.owners {
                return Err(ErrorKind::InvalidConfig("initial owner out of range").into());
            }
        }

        let start = self.start.round_up();
        let end = self.end.round_down();
        if end <= start {
            return Err(ErrorKind::InvalidConfig("page range holds no whole page").into());
        }
        let pages = ((end.0 - start.0) / PAGE_SIZE as u64) as usize;

        let frames: Box<[_]> = (0..pages)
            .map(|_| SyncUnsafeCell::new([FREE_FILL; PAGE_SIZE]))
            .collect();
        let owners: Box<[_]> = (0..self.owners)
            .map(|_| {
                CachePadded::new(Mutex::new(FreeList {
                    head: None,
                    len: 0,
                }))
            })
            .collect();

        let alloc = PageAllocator {
            id: NEXT_POOL.fetch_add(1, Ordering::Relaxed),
            start,
            end,
            frames,
            owners,
            steal_batch: self.steal_batch,
            cpu: self.cpu,
            stats: Stats::default(),
        };

        for index in 0..pages {
            let owner = match self.distribution {
                InitialDistribution::Owner(owner) => owner,
                InitialDistribution::Striped => index % self.owners,
            };
            let mut list = alloc.owners[owner].lock();
            alloc.push(&mut list, index);
        }

        Ok(alloc)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    pub allocations: u64,
    pub frees: u64,
    /// Times a CPU refilled its list from another.
    pub steals: u64,
    /// Pages moved by those refills.
    pub stolen: u64,
    /// Allocations that found every list empty.
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Stats {
    allocations: AtomicU64,
    frees: AtomicU64,
    steals: AtomicU64,
    stolen: AtomicU64,
    failures: AtomicU64,
}

impl Stats {
    fn snapshot(&self) -> AllocStats {
        AllocStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            stolen: self.stolen.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
