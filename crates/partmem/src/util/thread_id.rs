use std::{
    cell::Cell,
    num::NonZeroU64,
    sync::atomic::{AtomicU64, Ordering},
};

/// A small, dense identifier for the calling thread. Ids are handed out in the
/// order threads first ask for one, starting at 1, and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    pub fn current() -> ThreadId {
        thread_local! {
            static ID: Cell<Option<NonZeroU64>> = Cell::new(None);
        }
        ID.with(|id| {
            let v = id.get().unwrap_or_else(|| {
                let v = new_id();
                id.set(Some(v));
                v
            });
            ThreadId(v)
        })
    }

    pub fn as_u64(&self) -> NonZeroU64 {
        self.0
    }
}

fn new_id() -> NonZeroU64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    NonZeroU64::new(id).expect("thread id counter overflow")
}
