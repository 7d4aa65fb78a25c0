use std::cell::UnsafeCell;

use thiserror::Error;

pub mod index_list;
pub mod thread_id;

/// The pool has nothing left to hand out. Callers decide whether to retry,
/// reclaim, or report out-of-memory.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("allocation failed")]
pub struct AllocError;

#[repr(transparent)]
#[derive(Debug, Default)]
pub struct SyncUnsafeCell<T: ?Sized>(UnsafeCell<T>);

impl<T> SyncUnsafeCell<T> {
    pub fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }
}

impl<T> SyncUnsafeCell<T>
where
    T: ?Sized,
{
    pub fn get(&self) -> *mut T {
        self.0.get()
    }
}

unsafe impl<T: ?Sized + Send> Sync for SyncUnsafeCell<T> {}

#[cfg(test)]
pub fn assert_send_sync<T: ?Sized + Send + Sync>() {}
#[cfg(test)]
pub fn assert_send<T: ?Sized + Send>() {}
