//! Ropes: ordered sequences of segments behaving as one byte string.
//!
//! A [`Rope`] is an owned (head, tail) pair handed to the cache by a
//! writer; the cache takes ownership when a verb consumes it. A
//! [`RopeReader`] is a read-only snapshot produced by an entry read; it
//! can be drained segment by segment without copying and without
//! mutating the source chain.

use crate::hash::murmur64a;
use crate::seg::Seg;
use std::ptr::NonNull;

/// An owned chain of segments identified by its head and tail.
pub struct Rope {
    head: NonNull<Seg>,
    tail: NonNull<Seg>,
}

// A rope is exclusively owned until a cache verb consumes it.
unsafe impl Send for Rope {}

impl Rope {
    /// Build a rope from an existing chain. `tail` must be reachable
    /// from `head` through `next` links.
    pub fn new(head: NonNull<Seg>, tail: NonNull<Seg>) -> Self {
        Rope { head, tail }
    }

    /// A rope of one segment.
    pub fn single(seg: NonNull<Seg>) -> Self {
        Rope { head: seg, tail: seg }
    }

    /// Allocate a single-segment rope holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::single(Seg::copy_from(bytes))
    }

    /// First segment of the chain.
    pub fn head(&self) -> NonNull<Seg> {
        self.head
    }

    /// Last segment of the chain.
    pub fn tail(&self) -> NonNull<Seg> {
        self.tail
    }

    /// Total payload size, head through tail.
    pub fn size(&self) -> usize {
        let mut size = 0;
        let mut seg = self.head.as_ptr();
        loop {
            size += unsafe { (*seg).len() };
            if seg == self.tail.as_ptr() {
                return size;
            }
            seg = unsafe { (*seg).next() };
            if seg.is_null() {
                return size;
            }
        }
    }

    /// Free the chain. Used on paths where the rope was never published.
    pub(crate) fn discard(self) {
        unsafe { Seg::free_chain(self.head.as_ptr()) };
    }
}

/// A read-only rope snapshot.
///
/// The snapshot stays internally consistent up to its tail even while
/// the source entry is appended to concurrently. It is valid until the
/// reading worker checkpoints its reclamation domain; callers must
/// finish draining before then.
pub struct RopeReader {
    head: *const Seg,
    tail: *const Seg,
}

impl RopeReader {
    pub(crate) fn new(head: *const Seg, tail: *const Seg) -> Self {
        RopeReader { head, tail }
    }

    /// A snapshot of nothing.
    pub fn empty() -> Self {
        RopeReader {
            head: std::ptr::null(),
            tail: std::ptr::null(),
        }
    }

    /// Total payload size of the snapshot.
    pub fn size(&self) -> usize {
        let mut size = 0;
        self.walk(|data| size += data.len());
        size
    }

    /// Running MurmurHash64A over every segment, seeded with `seed`.
    /// This is the version token handed to `gets` clients.
    pub fn hash(&self, seed: u64) -> u64 {
        let mut hash = seed;
        self.walk(|data| hash = murmur64a(data, hash));
        hash
    }

    fn walk<F: FnMut(&[u8])>(&self, mut visit: F) {
        let mut seg = self.head;
        while !seg.is_null() {
            let r = unsafe { &*seg };
            assert!(r.valid(), "reading freed segment");
            visit(r.data());
            if seg == self.tail {
                break;
            }
            seg = r.next();
        }
    }

    /// Detach and return the head segment's payload, advancing toward
    /// the tail. Returns `None` once the snapshot is drained.
    pub fn pop(&mut self) -> Option<&[u8]> {
        if self.head.is_null() {
            return None;
        }
        let seg = self.head;
        if self.head == self.tail {
            self.head = std::ptr::null();
            self.tail = std::ptr::null();
        } else {
            self.head = unsafe { (*seg).next() };
        }
        let r = unsafe { &*seg };
        assert!(r.valid(), "reading freed segment");
        Some(r.data())
    }

    /// Copy the remaining snapshot into one contiguous buffer.
    pub fn copy_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        self.walk(|data| out.extend_from_slice(data));
        out
    }
}
