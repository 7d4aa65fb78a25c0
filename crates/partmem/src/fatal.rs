//! Unrecoverable invariant violations.
//!
//! These are programmer errors or configuration overloads that the kernel cannot
//! continue from. They are kept apart from [`crate::Error`] and [`crate::AllocError`]
//! on purpose: nothing here is ever returned to a caller.

use thiserror::Error;
use tracing::error;

use crate::{device::BlockId, page_alloc::PhysAddr};

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Fatal {
    #[error("bwrite: buffer {0} not locked by caller")]
    WriteNotHeld(BlockId),
    #[error("brelse: buffer {0} not locked by caller")]
    ReleaseNotHeld(BlockId),
    #[error("buffer {0} accessed without holding its lock")]
    AccessNotHeld(BlockId),
    #[error("bunpin: buffer {0} has no references")]
    UnpinUnderflow(BlockId),
    #[error("buffer {0} used on a different cache")]
    ForeignBuffer(BlockId),
    #[error("bget: no buffers")]
    NoBuffers,
    #[error("kfree: page {0} not aligned")]
    MisalignedPage(PhysAddr),
    #[error("kfree: page {0} outside managed range")]
    PageOutOfRange(PhysAddr),
    #[error("kfree: page {0} belongs to another allocator")]
    ForeignPage(PhysAddr),
    #[error("kalloc: owner {owner} out of range ({owners} owners)")]
    OwnerOutOfRange { owner: usize, owners: usize },
}

/// Halt on an invariant violation.
#[cold]
#[track_caller]
pub(crate) fn fatal(reason: Fatal) -> ! {
    error!("fatal: {}", reason);
    panic!("{}", reason)
}
