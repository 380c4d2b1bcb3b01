//! Cache entries.
//!
//! An entry is the value record stored in a table bucket: client flags,
//! an absolute expiration time, the (head, tail) pair of its current
//! value rope, access/modify timestamps, and a multi-version successor
//! slot. An entry's identity is stable for its lifetime; its contents
//! mutate through rope concatenation, integer replacement, or CAS.
//!
//! # The (head, tail) pair
//!
//! The value rope is identified by two pointer words that must change
//! together when the whole rope is replaced (`incr`/`decr`/`cas`), so
//! both live in one 128-bit atomic. Concatenation also goes through the
//! pair: `append` swaps the tail and then links the previous tail to the
//! new chain, so a reader that snapshots in between sees the chain
//! terminated at the previous tail — still internally consistent.
//!
//! # The multi-version chain
//!
//! While the cache migrates between tables, two tables may hold the same
//! entry pointer. Writers thread updates through the entry's successor
//! slot instead of the bucket: a real successor supersedes this entry's
//! contents, and a tombstone flag on a null successor means deleted.
//! Whichever table a reader reached, [`Entry::newest`] is the truth.

use crate::clock::{unix_now, Timestamp};
use crate::error::ValueError;
use crate::reclaim::{Domain, Unshared};
use crate::rope::{Rope, RopeReader};
use crate::seg::Seg;
use crate::sync::{spin_loop, AtomicU32, Ordering};
use crate::tagged::{AtomicTaggedPtr, TaggedPtr};
use portable_atomic::AtomicU128;
use std::cell::Cell;
use std::ptr::NonNull;

/// Tombstone flag on the successor pointer: deleted, forbid replace.
const DEL_FLAG: usize = 1;

/// Access timestamps are sampled to reduce write traffic on hot reads.
const UPDATE_ATIME_EVERY: u32 = 8;

thread_local! {
    static READS: Cell<u32> = const { Cell::new(0) };
}

fn pack(head: *mut Seg, tail: *mut Seg) -> u128 {
    (head as usize as u128) | ((tail as usize as u128) << 64)
}

fn unpack(pair: u128) -> (*mut Seg, *mut Seg) {
    (
        pair as u64 as usize as *mut Seg,
        (pair >> 64) as u64 as usize as *mut Seg,
    )
}

/// A multi-version cache entry.
#[repr(C)]
pub struct Entry {
    flags: AtomicU32,
    exptime: AtomicU32,
    data: AtomicU128,
    atime: Timestamp,
    mtime: Timestamp,
    succ: AtomicTaggedPtr<Entry>,
}

impl Entry {
    /// Build an entry owning `value`.
    pub fn new(flags: u32, exptime: u32, value: Rope) -> Self {
        Entry {
            flags: AtomicU32::new(flags),
            exptime: AtomicU32::new(exptime),
            data: AtomicU128::new(pack(value.head().as_ptr(), value.tail().as_ptr())),
            atime: Timestamp::now(),
            mtime: Timestamp::now(),
            succ: AtomicTaggedPtr::null(),
        }
    }

    /// Opaque client flags.
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    /// Absolute expiration time in unix seconds; 0 means never.
    pub fn exptime(&self) -> u32 {
        self.exptime.load(Ordering::Relaxed)
    }

    /// Last access time in unix seconds (sampled).
    pub fn atime(&self) -> u32 {
        self.atime.get()
    }

    /// Last modification time in unix seconds.
    pub fn mtime(&self) -> u32 {
        self.mtime.get()
    }

    /// Whether the entry has an expiration in the past.
    pub fn expired(&self) -> bool {
        let exptime = self.exptime();
        exptime != 0 && exptime <= unix_now()
    }

    /// Set the expiration time.
    pub fn touch(&self, exptime: u32) {
        self.exptime.store(exptime, Ordering::Relaxed);
        self.mtime.update();
    }

    /// Snapshot the current value for reading. Every Nth call restamps
    /// the access time.
    pub fn read(&self) -> RopeReader {
        let (head, _) = unpack(self.data.load(Ordering::Acquire));
        let reads = READS.get();
        READS.set(reads.wrapping_add(1));
        if reads % UPDATE_ATIME_EVERY == 0 {
            self.atime.update();
        }
        let tail = unsafe { Seg::tail(NonNull::new_unchecked(head)) };
        RopeReader::new(head, tail.as_ptr())
    }

    /// Total size of the current chain in bytes. O(segments).
    pub fn size(&self) -> usize {
        let (head, _) = unpack(self.data.load(Ordering::Acquire));
        let mut size = 0;
        let mut seg = head as *const Seg;
        while !seg.is_null() {
            let r = unsafe { &*seg };
            size += r.len();
            seg = r.next();
        }
        size
    }

    /// Concatenate `suffix` after the current value.
    pub fn append(&self, suffix: Rope) {
        let mut cur = self.data.load(Ordering::Acquire);
        loop {
            let (head, tail) = unpack(cur);
            let next = pack(head, suffix.tail().as_ptr());
            match self
                .data
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // the previous tail is ours alone to link; readers
                    // that snapshot before this see the chain end there
                    unsafe { (*tail).set_next(suffix.head().as_ptr()) };
                    break;
                }
                Err(observed) => {
                    cur = observed;
                    spin_loop();
                }
            }
        }
        self.mtime.update();
    }

    /// Concatenate `prefix` before the current value.
    pub fn prepend(&self, prefix: Rope) {
        let mut cur = self.data.load(Ordering::Acquire);
        loop {
            let (head, tail) = unpack(cur);
            unsafe { prefix.tail().as_ref().set_next(head) };
            let next = pack(prefix.head().as_ptr(), tail);
            match self
                .data
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => {
                    // undo the tentative link before retrying
                    unsafe { prefix.tail().as_ref().set_next(std::ptr::null_mut()) };
                    cur = observed;
                    spin_loop();
                }
            }
        }
        self.mtime.update();
    }

    fn replace_value<F: Fn(u64) -> u64>(
        &self,
        domain: &Domain,
        op: F,
    ) -> Result<u64, ValueError> {
        loop {
            let cur = self.data.load(Ordering::Acquire);
            let (head, tail) = unpack(cur);
            let value = op(parse_decimal(head, tail)?);
            let mut digits = itoa::Buffer::new();
            let seg = Seg::copy_from(digits.format(value).as_bytes());
            let next = pack(seg.as_ptr(), seg.as_ptr());
            match self
                .data
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let old = Unshared(head);
                    domain.defer(move || {
                        let old = old;
                        unsafe { Seg::free_chain(old.0) }
                    });
                    self.mtime.update();
                    return Ok(value);
                }
                Err(_) => {
                    // lost the race: drop our unpublished rope, reparse
                    unsafe { Seg::free_chain(seg.as_ptr()) };
                    spin_loop();
                }
            }
        }
    }

    /// Parse the value as an unsigned decimal integer and add `delta`.
    pub fn incr(&self, domain: &Domain, delta: u64) -> Result<u64, ValueError> {
        self.replace_value(domain, |v| v.wrapping_add(delta))
    }

    /// Parse the value as an unsigned decimal integer and subtract
    /// `delta`, flooring at zero.
    pub fn decr(&self, domain: &Domain, delta: u64) -> Result<u64, ValueError> {
        self.replace_value(domain, |v| v.saturating_sub(delta))
    }

    /// Compare-and-swap the value.
    ///
    /// `version` must equal the hash of the current contents seeded with
    /// the current flags (the token `gets` handed out). On success the
    /// entry adopts `value`, `flags`, and `exptime`; on mismatch the
    /// entry is untouched and `value` is discarded.
    pub fn cas(
        &self,
        domain: &Domain,
        flags: u32,
        exptime: u32,
        version: u64,
        value: Rope,
    ) -> bool {
        let cur = self.data.load(Ordering::Acquire);
        let (head, tail) = unpack(cur);
        let snapshot = RopeReader::new(head, tail);
        let seed = self.flags() as u64;
        if snapshot.hash(seed) != version {
            value.discard();
            return false;
        }
        let next = pack(value.head().as_ptr(), value.tail().as_ptr());
        match self
            .data
            .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.flags.store(flags, Ordering::Relaxed);
                self.exptime.store(exptime, Ordering::Relaxed);
                self.mtime.update();
                let old = Unshared(head);
                domain.defer(move || {
                    let old = old;
                    unsafe { Seg::free_chain(old.0) }
                });
                true
            }
            Err(_) => {
                value.discard();
                false
            }
        }
    }

    /// The newest entry in the multi-version chain, or `None` when the
    /// chain ends in a tombstone.
    pub fn newest(&self) -> Option<&Entry> {
        let mut cur = self;
        loop {
            let succ = cur.succ.load(Ordering::Acquire);
            match unsafe { succ.ptr().as_ref() } {
                Some(next) => cur = next,
                None => {
                    return if succ.has(DEL_FLAG) { None } else { Some(cur) };
                }
            }
        }
    }

    /// The immediate successor, if any.
    pub fn newer(&self) -> Option<&Entry> {
        unsafe { self.succ.load(Ordering::Acquire).ptr().as_ref() }
    }

    /// Unconditionally install `e` at the chain tail, clearing any
    /// tombstone.
    ///
    /// # Safety
    ///
    /// `e` must be heap-allocated and unpublished; the chain takes
    /// ownership.
    pub unsafe fn mv_set(&self, e: NonNull<Entry>) {
        let mut cur = self;
        let mut expected = TaggedPtr::null();
        loop {
            match cur.succ.compare_exchange_weak(
                expected,
                TaggedPtr::from_ptr(e.as_ptr()),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => match unsafe { observed.ptr().as_ref() } {
                    Some(next) => {
                        cur = next;
                        expected = TaggedPtr::null();
                    }
                    // retry against the observed tombstone state
                    None => expected = observed,
                },
            }
        }
    }

    /// Install `e` only if the chain tail is a tombstone (the key was
    /// deleted). Fails when the tail entry is live.
    ///
    /// # Safety
    ///
    /// As for [`Entry::mv_set`]; on `false` the caller keeps ownership
    /// of `e`.
    pub unsafe fn mv_add(&self, e: NonNull<Entry>) -> bool {
        let mut cur = self;
        let tombstone = TaggedPtr::new(std::ptr::null_mut(), DEL_FLAG);
        loop {
            match cur.succ.compare_exchange(
                tombstone,
                TaggedPtr::from_ptr(e.as_ptr()),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => match unsafe { observed.ptr().as_ref() } {
                    Some(next) => cur = next,
                    None => {
                        if !observed.has(DEL_FLAG) {
                            return false;
                        }
                        // raced with another add clearing the tombstone
                        spin_loop();
                    }
                },
            }
        }
    }

    /// Install `e` only if the chain tail is live. Fails on a
    /// tombstone.
    ///
    /// # Safety
    ///
    /// As for [`Entry::mv_set`]; on `false` the caller keeps ownership
    /// of `e`.
    pub unsafe fn mv_replace(&self, e: NonNull<Entry>) -> bool {
        let mut cur = self;
        loop {
            match cur.succ.compare_exchange(
                TaggedPtr::null(),
                TaggedPtr::from_ptr(e.as_ptr()),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => match unsafe { observed.ptr().as_ref() } {
                    Some(next) => cur = next,
                    None => return false, // tombstoned: nothing to replace
                },
            }
        }
    }

    /// Tombstone the chain tail. Fails when already tombstoned.
    pub fn mv_del(&self) -> bool {
        let mut cur = self;
        loop {
            match cur.succ.compare_exchange(
                TaggedPtr::null(),
                TaggedPtr::new(std::ptr::null_mut(), DEL_FLAG),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => match unsafe { observed.ptr().as_ref() } {
                    Some(next) => cur = next,
                    None => return false, // already deleted
                },
            }
        }
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        let (head, _) = unpack(self.data.load(Ordering::Relaxed));
        unsafe { Seg::free_chain(head) };

        // free the successor chain iteratively; each node's slot is
        // cleared first so its own drop does not recurse
        let mut cur = self.succ.load(Ordering::Relaxed).ptr();
        while !cur.is_null() {
            let next = unsafe { (*cur).succ.load(Ordering::Relaxed).ptr() };
            unsafe { (*cur).succ.store(TaggedPtr::null(), Ordering::Relaxed) };
            drop(unsafe { Box::from_raw(cur) });
            cur = next;
        }
    }
}

fn parse_decimal(head: *const Seg, tail: *const Seg) -> Result<u64, ValueError> {
    #[derive(PartialEq)]
    enum State {
        Leading,
        Digits,
        Trailing,
    }
    let mut state = State::Leading;
    let mut value: u64 = 0;
    let mut seg = head;
    while !seg.is_null() {
        let r = unsafe { &*seg };
        for &byte in r.data() {
            match byte {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    if state == State::Digits {
                        state = State::Trailing;
                    }
                }
                b'0'..=b'9' => {
                    if state == State::Trailing {
                        return Err(ValueError::NotANumber);
                    }
                    state = State::Digits;
                    value = value.wrapping_mul(10).wrapping_add((byte - b'0') as u64);
                }
                _ => return Err(ValueError::NotANumber),
            }
        }
        if seg == tail {
            break;
        }
        seg = r.next();
    }
    Ok(value)
}
