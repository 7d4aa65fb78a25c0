use crate::util::thread_id::ThreadId;

/// Reports which owner (CPU) the caller runs on.
///
/// The allocator reads the id once per call and reduces it modulo its owner
/// count. An implementation that can be migrated mid-call should keep the id
/// stable until it returns, e.g. by disabling preemption around the read; a stale
/// id is only a locality loss, never a correctness problem.
pub trait CpuId {
    fn current(&self) -> usize;
}

/// Treats every thread as its own CPU. Threads are numbered in the order they
/// first touch the allocator (or any other user of the thread registry).
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadCpu;

impl CpuId for ThreadCpu {
    fn current(&self) -> usize {
        (ThreadId::current().as_u64().get() - 1) as usize
    }
}

/// Always the same CPU.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedCpu(pub usize);

impl CpuId for FixedCpu {
    fn current(&self) -> usize {
        self.0
    }
}
