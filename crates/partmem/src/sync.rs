//! Locks that may be held for a long time.
//!
//! Short critical sections over partition metadata use `parking_lot::Mutex`
//! directly; its `try_lock` is what the cross-partition probes rely on. A
//! [`SleepLock`] is for the opposite case: it may be held across device I/O, so
//! waiters park on a condition variable instead of spinning, and the lock
//! remembers which thread holds it so misuse can be detected.

use std::fmt;

use parking_lot::{Condvar, Mutex};

use crate::util::{thread_id::ThreadId, SyncUnsafeCell};


pub struct SleepLock<T: ?Sized> {
    holder: Mutex<Option<ThreadId>>,
    released: Condvar,
    data: SyncUnsafeCell<T>,
}

impl<T> SleepLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            holder: Mutex::new(None),
            released: Condvar::new(),
            data: SyncUnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// Block until the lock is free, then take it for the calling thread.
    ///
    /// Taking a lock the caller already holds never returns.
    pub fn lock(&self) {
        let me = ThreadId::current();
        let mut holder = self.holder.lock();
        while holder.is_some() {
            self.released.wait(&mut holder);
        }
        *holder = Some(me);
    }

    pub fn try_lock(&self) -> bool {
        let mut holder = self.holder.lock();
        if holder.is_some() {
            return false;
        }
        *holder = Some(ThreadId::current());
        true
    }

    /// Release the lock. Returns `false`, leaving the lock untouched, if the
    /// calling thread is not the holder.
    #[must_use]
    pub fn unlock(&self) -> bool {
        let mut holder = self.holder.lock();
        if *holder != Some(ThreadId::current()) {
            return false;
        }
        *holder = None;
        drop(holder);
        self.released.notify_one();
        true
    }

    pub fn is_locked(&self) -> bool {
        self.holder.lock().is_some()
    }

    pub fn holding(&self) -> bool {
        *self.holder.lock() == Some(ThreadId::current())
    }

    /// Raw access to the protected value. Dereferencing is only sound while the
    /// calling thread holds the lock.
    pub fn data_ptr(&self) -> *mut T {
        self.data.get()
    }
}

impl<T: ?Sized> fmt::Debug for SleepLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SleepLock")
            .field("holder", &*self.holder.lock())
            .finish_non_exhaustive()
    }
}
