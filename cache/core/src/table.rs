//! Lock-free open-addressed hash table.
//!
//! The table maps heap-allocated keys to heap-allocated values through
//! fixed-capacity bucket arrays sized to a power of two. Each bucket is
//! a pair of atomic slots: the key pointer and a tagged value pointer
//! whose low bit is the *shared* flag — set when the value is also held
//! by another table during migration and must not be freed on eviction
//! from this one.
//!
//! A key pointer written into a bucket is never overwritten by a
//! different key within the same table; keys are only cleared by
//! [`BucketRef::reset`] (the migrator, on the drained old table) or by
//! whole-table teardown.
//!
//! Probing consumes `lg2size` bits of the key hash per hop and rehashes
//! with an incremented seed once the bits run out, so probe sequences
//! are effectively random beyond the first hop. A probe visits at most
//! `capacity` candidates.

use crate::sync::{AtomicPtr, AtomicUsize, Ordering};
use crate::tagged::{AtomicTaggedPtr, TaggedPtr};
use std::mem::align_of;
use std::ptr::NonNull;
use std::sync::Arc;

/// Low bit of a value slot: the value is co-owned by another table.
pub const SHARED_FLAG: usize = 1;

/// Key, value, and ownership hooks for an [`OpenTable`].
///
/// The table stores raw `Key`/`Value` pointers allocated with `Box`;
/// lookups go through the borrowed `Probe` form. Values evicted while
/// unshared are handed to `release_value` (typically a deferred free
/// through the reclamation domain), and `release_key` likewise for keys
/// relinquished by the migrator.
pub trait TableShape: Send + Sync {
    /// Owned key type stored in buckets.
    type Key;
    /// Borrowed lookup form of a key.
    type Probe: ?Sized;
    /// Value type stored in buckets.
    type Value;

    /// Borrow the probe form of a stored key.
    fn probe<'a>(&self, key: &'a Self::Key) -> &'a Self::Probe;

    /// Whether `probe` identifies `key`.
    fn eq(&self, probe: &Self::Probe, key: &Self::Key) -> bool;

    /// Hash `probe` under `seed`. Distinct seeds must produce
    /// independent hashes; the table rehashes with incrementing seeds
    /// as the probe sequence consumes bits.
    fn hash(&self, probe: &Self::Probe, seed: u32) -> u64;

    /// Release a key no longer reachable from any table.
    ///
    /// # Safety
    ///
    /// `key` was allocated with `Box` and the caller transfers
    /// ownership.
    unsafe fn release_key(&self, key: *mut Self::Key);

    /// Release a value evicted without the shared flag.
    ///
    /// # Safety
    ///
    /// `value` was allocated with `Box` and the caller transfers
    /// ownership.
    unsafe fn release_value(&self, value: *mut Self::Value);
}

struct Bucket<S: TableShape> {
    key: AtomicPtr<S::Key>,
    value: AtomicTaggedPtr<S::Value>,
}

impl<S: TableShape> Bucket<S> {
    fn new() -> Self {
        Bucket {
            key: AtomicPtr::new(std::ptr::null_mut()),
            value: AtomicTaggedPtr::null(),
        }
    }
}

/// Result of [`OpenTable::add`].
pub enum AddOutcome<K, V> {
    /// The value was installed.
    Added {
        /// The bucket's key: the caller's own key if the bucket was
        /// empty, otherwise the key already claimed there.
        key: NonNull<K>,
    },
    /// The bucket already holds a value.
    Exists {
        /// The bucket's key.
        key: NonNull<K>,
        /// The value observed in the bucket.
        value: Option<NonNull<V>>,
    },
    /// No bucket could be claimed.
    Full,
}

/// A lock-free open-addressed hash table.
pub struct OpenTable<S: TableShape> {
    shape: Arc<S>,
    lg2size: u32,
    buckets: Box<[Bucket<S>]>,
    /// Buckets holding a key.
    usage: AtomicUsize,
    /// Buckets holding a value.
    values: AtomicUsize,
}

unsafe impl<S: TableShape> Send for OpenTable<S> {}
unsafe impl<S: TableShape> Sync for OpenTable<S> {}

impl<S: TableShape> OpenTable<S> {
    /// Allocate a table with `2^lg2size` buckets.
    pub fn new(shape: Arc<S>, lg2size: u32) -> Self {
        assert!(
            align_of::<S::Value>() >= 2,
            "value alignment cannot carry the shared flag"
        );
        assert!(lg2size >= 1 && lg2size < usize::BITS, "bad table size");
        let buckets = (0..1usize << lg2size).map(|_| Bucket::new()).collect();
        OpenTable {
            shape,
            lg2size,
            buckets,
            usage: AtomicUsize::new(0),
            values: AtomicUsize::new(0),
        }
    }

    /// Log2 of the bucket count.
    pub fn lg2size(&self) -> u32 {
        self.lg2size
    }

    /// Total bucket count.
    pub fn capacity(&self) -> usize {
        1 << self.lg2size
    }

    fn mask(&self) -> usize {
        self.capacity() - 1
    }

    /// Number of buckets that have ever claimed a key.
    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    /// Number of buckets currently holding a value.
    pub fn values(&self) -> usize {
        self.values.load(Ordering::Relaxed)
    }

    /// Visit candidate buckets for `probe` (empty or key-matching)
    /// until `action` returns true or the probe budget is spent.
    fn for_each_candidate<'a, F>(&'a self, probe: &S::Probe, mut action: F) -> bool
    where
        F: FnMut(&'a Bucket<S>) -> bool,
    {
        let mut seed = 0u32;
        let mut hash = self.shape.hash(probe, seed);
        seed += 1;
        let mut bits = u64::BITS;
        let mut index = 0usize;
        for _ in 0..self.capacity() {
            if bits < self.lg2size {
                hash = self.shape.hash(probe, seed);
                seed += 1;
                bits = u64::BITS;
            }
            index = index.wrapping_add(hash as usize) & self.mask();
            let bucket = &self.buckets[index];
            let key = bucket.key.load(Ordering::Acquire);
            let candidate = match unsafe { key.as_ref() } {
                None => true,
                Some(stored) => self.shape.eq(probe, stored),
            };
            if candidate && action(bucket) {
                return true;
            }
            hash >>= self.lg2size;
            bits -= self.lg2size;
        }
        false
    }

    fn find_bucket(&self, probe: &S::Probe) -> Option<&Bucket<S>> {
        let mut found = None;
        self.for_each_candidate(probe, |bucket| {
            match unsafe { bucket.key.load(Ordering::Acquire).as_ref() } {
                // an empty candidate ends the probe: the key is absent
                None => true,
                Some(stored) if self.shape.eq(probe, stored) => {
                    found = Some(bucket);
                    true
                }
                Some(_) => false,
            }
        });
        found
    }

    /// Install `key` in an empty bucket, or recognize a bucket already
    /// keyed by an equal key. Returns the bucket's key on success.
    fn claim_key(&self, bucket: &Bucket<S>, key: NonNull<S::Key>) -> Option<NonNull<S::Key>> {
        let mut cur = bucket.key.load(Ordering::Acquire);
        while cur.is_null() {
            match bucket.key.compare_exchange_weak(
                cur,
                key.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.usage.fetch_add(1, Ordering::Relaxed);
                    return Some(key);
                }
                Err(observed) => cur = observed,
            }
        }
        let stored = unsafe { &*cur };
        let probe = self.shape.probe(unsafe { key.as_ref() });
        if self.shape.eq(probe, stored) {
            Some(unsafe { NonNull::new_unchecked(cur) })
        } else {
            None
        }
    }

    fn allocate_bucket(&self, key: NonNull<S::Key>) -> Option<(&Bucket<S>, NonNull<S::Key>)> {
        let key_ref = unsafe { &*key.as_ptr() };
        let mut found = None;
        self.for_each_candidate(self.shape.probe(key_ref), |bucket| {
            match self.claim_key(bucket, key) {
                Some(cur) => {
                    found = Some((bucket, cur));
                    true
                }
                None => false,
            }
        });
        found
    }

    fn changed_value(&self, old: TaggedPtr<S::Value>) {
        if old.is_null() {
            self.values.fetch_add(1, Ordering::Relaxed);
        } else if !old.has(SHARED_FLAG) {
            unsafe { self.shape.release_value(old.ptr()) };
        }
    }

    fn set_impl(
        &self,
        key: NonNull<S::Key>,
        value: TaggedPtr<S::Value>,
    ) -> Option<NonNull<S::Key>> {
        let (bucket, cur_key) = self.allocate_bucket(key)?;
        let previous = bucket.value.swap(value, Ordering::AcqRel);
        self.changed_value(previous);
        Some(cur_key)
    }

    fn add_impl(
        &self,
        key: NonNull<S::Key>,
        value: TaggedPtr<S::Value>,
    ) -> AddOutcome<S::Key, S::Value> {
        let Some((bucket, cur_key)) = self.allocate_bucket(key) else {
            return AddOutcome::Full;
        };
        match bucket
            .value
            .compare_exchange(TaggedPtr::null(), value, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(previous) => {
                self.changed_value(previous);
                AddOutcome::Added { key: cur_key }
            }
            Err(observed) => AddOutcome::Exists {
                key: cur_key,
                value: NonNull::new(observed.ptr()),
            },
        }
    }

    /// Look up `probe`. Returns the value pointer stripped of the
    /// shared flag.
    pub fn find(&self, probe: &S::Probe) -> Option<NonNull<S::Value>> {
        let bucket = self.find_bucket(probe)?;
        NonNull::new(bucket.value.load(Ordering::Acquire).ptr())
    }

    /// Install `(key, value)`, replacing any existing value. Returns
    /// the bucket's key, or `None` when the table is full (the caller
    /// keeps ownership of both pointers in that case, and of `key`
    /// whenever the returned key differs from it).
    pub fn set(&self, key: NonNull<S::Key>, value: NonNull<S::Value>) -> Option<NonNull<S::Key>> {
        self.set_impl(key, TaggedPtr::from_ptr(value.as_ptr()))
    }

    /// As [`OpenTable::set`], marking the value co-owned by another
    /// table.
    pub fn set_shared(
        &self,
        key: NonNull<S::Key>,
        value: NonNull<S::Value>,
    ) -> Option<NonNull<S::Key>> {
        self.set_impl(key, TaggedPtr::new(value.as_ptr(), SHARED_FLAG))
    }

    /// Install `(key, value)` only when the bucket holds no value.
    pub fn add(
        &self,
        key: NonNull<S::Key>,
        value: NonNull<S::Value>,
    ) -> AddOutcome<S::Key, S::Value> {
        self.add_impl(key, TaggedPtr::from_ptr(value.as_ptr()))
    }

    /// As [`OpenTable::add`], marking the value co-owned by another
    /// table.
    pub fn add_shared(
        &self,
        key: NonNull<S::Key>,
        value: NonNull<S::Value>,
    ) -> AddOutcome<S::Key, S::Value> {
        self.add_impl(key, TaggedPtr::new(value.as_ptr(), SHARED_FLAG))
    }

    /// Swap in `value` only when the key exists with a value. The
    /// caller keeps ownership of `value` on `false`.
    pub fn replace(&self, probe: &S::Probe, value: NonNull<S::Value>) -> bool {
        let Some(bucket) = self.find_bucket(probe) else {
            return false;
        };
        let mut previous = bucket.value.load(Ordering::Acquire);
        loop {
            if previous.is_null() {
                return false;
            }
            match bucket.value.compare_exchange_weak(
                previous,
                TaggedPtr::from_ptr(value.as_ptr()),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(old) => {
                    self.changed_value(old);
                    return true;
                }
                Err(observed) => previous = observed,
            }
        }
    }

    /// Clear the value slot for `probe`. The key stays claimed.
    pub fn remove(&self, probe: &S::Probe) -> bool {
        let Some(bucket) = self.find_bucket(probe) else {
            return false;
        };
        let old = bucket.value.swap(TaggedPtr::null(), Ordering::AcqRel);
        if old.is_null() {
            return false;
        }
        self.values.fetch_sub(1, Ordering::Relaxed);
        if !old.has(SHARED_FLAG) {
            unsafe { self.shape.release_value(old.ptr()) };
        }
        true
    }

    /// Take exclusive ownership of a `(key, value)` pair that was
    /// published into this table with the shared flag.
    ///
    /// Called by the migrator, on the *new* table, for every bucket of
    /// the drained old table. If the pair is still present here, the
    /// shared flag is stripped (sole ownership transfers to this
    /// table); whatever is no longer present is released.
    pub fn exclusive(&self, key: NonNull<S::Key>, value: Option<NonNull<S::Value>>) {
        let key_ref = unsafe { &*key.as_ptr() };
        let Some(bucket) = self.find_bucket(self.shape.probe(key_ref)) else {
            unsafe {
                self.shape.release_key(key.as_ptr());
                if let Some(v) = value {
                    self.shape.release_value(v.as_ptr());
                }
            }
            return;
        };

        if bucket.key.load(Ordering::Acquire) != key.as_ptr() {
            unsafe { self.shape.release_key(key.as_ptr()) };
        }

        let Some(v) = value else { return };
        let shared = TaggedPtr::new(v.as_ptr(), SHARED_FLAG);
        if bucket
            .value
            .compare_exchange(
                shared,
                TaggedPtr::from_ptr(v.as_ptr()),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // replaced or removed since migration copied it
            unsafe { self.shape.release_value(v.as_ptr()) };
        }
    }

    /// Iterate the buckets currently holding a key.
    pub fn buckets(&self) -> Buckets<'_, S> {
        Buckets {
            table: self,
            index: 0,
        }
    }
}

impl<S: TableShape> Drop for OpenTable<S> {
    fn drop(&mut self) {
        // teardown owns the table exclusively; surviving pairs are
        // freed in place (the migrator resets drained buckets first)
        for bucket in self.buckets.iter() {
            let key = bucket.key.load(Ordering::Relaxed);
            if !key.is_null() {
                drop(unsafe { Box::from_raw(key) });
            }
            let value = bucket.value.load(Ordering::Relaxed).ptr();
            if !value.is_null() {
                drop(unsafe { Box::from_raw(value) });
            }
        }
    }
}

/// Iterator over occupied buckets. See [`OpenTable::buckets`].
pub struct Buckets<'a, S: TableShape> {
    table: &'a OpenTable<S>,
    index: usize,
}

impl<'a, S: TableShape> Iterator for Buckets<'a, S> {
    type Item = BucketRef<'a, S>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.table.capacity() {
            let bucket = &self.table.buckets[self.index];
            self.index += 1;
            if let Some(key) = NonNull::new(bucket.key.load(Ordering::Acquire)) {
                return Some(BucketRef { bucket, key });
            }
        }
        None
    }
}

/// A view of one occupied bucket.
pub struct BucketRef<'a, S: TableShape> {
    bucket: &'a Bucket<S>,
    key: NonNull<S::Key>,
}

impl<S: TableShape> BucketRef<'_, S> {
    /// The bucket's key as observed when the iterator yielded it.
    pub fn key(&self) -> NonNull<S::Key> {
        self.key
    }

    /// The bucket's current value, stripped of the shared flag.
    pub fn value(&self) -> Option<NonNull<S::Value>> {
        NonNull::new(self.bucket.value.load(Ordering::Acquire).ptr())
    }

    /// Clear both slots without releasing anything. Only the migrator
    /// calls this, on old-table buckets whose pointers have been handed
    /// to [`OpenTable::exclusive`].
    pub fn reset(&self) {
        self.bucket.key.store(std::ptr::null_mut(), Ordering::Relaxed);
        self.bucket.value.store(TaggedPtr::null(), Ordering::Relaxed);
    }
}
