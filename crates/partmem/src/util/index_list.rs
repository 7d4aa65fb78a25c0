//! A doubly linked list threaded through a shared slot arena.
//!
//! The list itself only owns its head, tail and length. The `prev`/`next` links of
//! every slot live in the arena (`links`), which may be shared by many lists; a
//! slot must be a member of at most one of them at a time. Moving a slot from one
//! list to another is `remove` on the first followed by `push_front` on the
//! second.

use std::{
    iter::FusedIterator,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use nonmax::NonMaxUsize;


pub struct IndexList<L> {
    head: Option<NonMaxUsize>,
    tail: Option<NonMaxUsize>,
    len: usize,
    links: Arc<[L]>,
}

impl<L> IndexList<L>
where
    L: Link,
{
    pub fn new(links: Arc<[L]>) -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            links,
        }
    }

    pub fn push_front(&mut self, index: usize) {
        let link = &self.links[index];
        link.set_prev(None);
        link.set_next(self.head);

        if let Some(next) = self.head {
            self.links[next.get()].set_prev(NonMaxUsize::new(index));
        } else {
            self.tail = NonMaxUsize::new(index);
        }
        self.head = NonMaxUsize::new(index);
        self.len += 1;
    }

    /// Unlink `index`, which must currently be a member of this list.
    pub fn remove(&mut self, index: usize) {
        debug_assert!(self.len > 0, "remove from empty list");

        let link = &self.links[index];
        let next = link.next();
        let prev = link.prev();

        if let Some(next) = next {
            self.links[next.get()].set_prev(prev);
        } else {
            self.tail = prev;
        }

        if let Some(prev) = prev {
            self.links[prev.get()].set_next(next);
        } else {
            self.head = next;
        }

        link.set_next(None);
        link.set_prev(None);
        self.len -= 1;
    }

    pub fn move_to_front(&mut self, index: usize) {
        if self.first() == Some(index) {
            return;
        }
        self.remove(index);
        self.push_front(index);
    }

    pub fn first(&self) -> Option<usize> {
        self.head.map(|v| v.get())
    }

    pub fn links(&self) -> &Arc<[L]> {
        &self.links
    }

    /// Iterate over member indices from front to back.
    pub fn iter(&self) -> Iter<'_, L> {
        Iter {
            front: self.head,
            back: self.tail,
            remaining: self.len,
            links: &self.links,
        }
    }
}

pub trait Link {
    fn next(&self) -> Option<NonMaxUsize>;
    fn prev(&self) -> Option<NonMaxUsize>;
    fn set_next(&self, next: Option<NonMaxUsize>);
    fn set_prev(&self, prev: Option<NonMaxUsize>);
}

/// Links that may be shared between threads. Every access must be ordered by the
/// lock of whichever list currently owns the slot, so relaxed ordering suffices.
#[derive(Debug)]
pub struct AtomicLinks {
    next: AtomicUsize,
    prev: AtomicUsize,
}

const NIL: usize = usize::MAX;

impl Default for AtomicLinks {
    fn default() -> Self {
        Self {
            next: AtomicUsize::new(NIL),
            prev: AtomicUsize::new(NIL),
        }
    }
}

impl Link for AtomicLinks {
    fn next(&self) -> Option<NonMaxUsize> {
        NonMaxUsize::new(self.next.load(Ordering::Relaxed))
    }

    fn prev(&self) -> Option<NonMaxUsize> {
        NonMaxUsize::new(self.prev.load(Ordering::Relaxed))
    }

    fn set_next(&self, next: Option<NonMaxUsize>) {
        self.next
            .store(next.map_or(NIL, |n| n.get()), Ordering::Relaxed);
    }

    fn set_prev(&self, prev: Option<NonMaxUsize>) {
        self.prev
            .store(prev.map_or(NIL, |n| n.get()), Ordering::Relaxed);
    }
}

pub struct Iter<'a, L> {
    front: Option<NonMaxUsize>,
    back: Option<NonMaxUsize>,
    remaining: usize,
    links: &'a [L],
}

impl<'a, L> Iterator for Iter<'a, L>
where
    L: Link,
{
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let front = self.front?.get();
        self.front = self.links[front].next();
        self.remaining -= 1;
        Some(front)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, L> DoubleEndedIterator for Iter<'a, L>
where
    L: Link,
{
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let back = self.back?.get();
        self.back = self.links[back].prev();
        self.remaining -= 1;
        Some(back)
    }
}

impl<'a, L> ExactSizeIterator for Iter<'a, L> where L: Link {}

impl<'a, L> FusedIterator for Iter<'a, L> where L: Link {}
