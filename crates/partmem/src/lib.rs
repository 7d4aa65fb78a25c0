#![forbid(unsafe_op_in_unsafe_fn)]

use std::{io, result, sync::Arc};

use thiserror::Error;

pub mod buffer_cache;
pub mod device;
mod fatal;
pub mod page_alloc;
pub mod sync;
mod util;

pub use self::{
    buffer_cache::{Buf, BufferCache, BufferCacheBuilder, EvictionPolicy, PinnedBuf},
    device::{BlockDevice, BlockId, Transfer},
    fatal::Fatal,
    page_alloc::{Page, PageAllocator, PageAllocatorBuilder, PhysAddr},
    util::AllocError,
};

#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error {
    // Use `Arc` here because concurrent code may need to share error values. Don't
    // expose this to public code.
    kind: Arc<ErrorKind>,
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// A builder was given parameters it cannot construct a pool from.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A device transfer was issued with a buffer that is not exactly one block.
    #[error("transfer of {actual} bytes on a device with {expected} byte blocks")]
    BlockSizeMismatch { expected: usize, actual: usize },
    /// An unexpected I/O error occurred.
    #[error("unexpected io error occurred: {0:?}")]
    IoError(#[from] io::Error),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    #[inline]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    #[inline]
    fn from(error: E) -> Self {
        Error {
            kind: Arc::new(error.into()),
        }
    }
}

impl From<io::ErrorKind> for ErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        io::Error::from(kind).into()
    }
}
