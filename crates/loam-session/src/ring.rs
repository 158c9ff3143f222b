//! Lock-free version ring shared between all session participants.
//!
//! The ring is a circular list of [`VersionEntry`] slots living in the mapped
//! lock file. Entries from `old_pos` to `put_pos` (following `next`) are
//! live; the remaining arc is free. Each slot's `count` word combines a
//! reference count of the readers bound to that snapshot and a single "free"
//! bit indicating that the slot holds no valid data.
//!
//! The usage pattern:
//!
//! - Readers pin a live slot for the duration of a read transaction by
//!   incrementing `count`. A non-zero count also means the file regions the
//!   snapshot references must stay intact.
//! - Only the writer (serialized by the write mutex) allocates new slots and
//!   scans from `old_pos` for unreferenced slots to free. There is therefore
//!   no race between freeing and allocating.
//! - Readers never modify version data, only `count`, and only through the
//!   atomic step operations below.
//!
//! There is a race between a reader incrementing the count and the writer
//! setting the free bit. Both mutate optimistically and inspect the
//! pre-image: a reader that observes the free bit set undoes its increment
//! and backs off; a reclaimer that observes a non-zero count undoes its
//! own. The two parties use disjoint step sizes so the pre-image always
//! identifies the collision: readers step the count by 2, the reclaimer
//! steps the free bit by 1.
//!
//! Memory ordering:
//!
//! 1. A successful pin is an *acquire* on `count`; publishing a slot clears
//!    the free bit with a *release* store. This makes the slot's
//!    `version`/`top_ref`/`file_size` visible to the pinning reader.
//! 2. Unpin is a *release* on `count`; the reclaim probe is an *acquire*.
//!    No read through a pinned snapshot can be reordered past the slot
//!    becoming reusable.
//! 3. `put_pos` is written with *release* and read with *acquire*; it
//!    serializes handoff of the head between writers and guards the
//!    `entry_count` field.

use std::mem;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Number of ring slots a freshly initialized lock file carries.
pub const RING_INITIAL_ENTRIES: u32 = 32;

/// Number of slots added per ring expansion.
pub const RING_GROW_ENTRIES: u32 = 32;

// ---------------------------------------------------------------------------
// Atomic step operations
// ---------------------------------------------------------------------------

/// Optimistically pin: add 2 with acquire, undo and fail if the pre-image
/// had the free bit set. Readers must only ever step `count` by 2.
fn pin_if_live(count: &AtomicU32) -> bool {
    let prev = count.fetch_add(2, Ordering::Acquire);
    if prev & 1 != 0 {
        count.fetch_sub(2, Ordering::Relaxed);
        return false;
    }
    true
}

/// Drop a pin: subtract 2 with release.
fn unpin(count: &AtomicU32) {
    count.fetch_sub(2, Ordering::Release);
}

/// Optimistically mark free: add 1 with acquire, undo and fail if the
/// pre-image was anything but zero. The reclaimer must only ever step the
/// free bit by 1.
fn reclaim_if_unreferenced(count: &AtomicU32) -> bool {
    let prev = count.fetch_add(1, Ordering::Acquire);
    if prev != 0 {
        count.fetch_sub(1, Ordering::Relaxed);
        return false;
    }
    true
}

// ---------------------------------------------------------------------------
// VersionEntry
// ---------------------------------------------------------------------------

/// One ring slot: a snapshot descriptor plus its combined count word.
///
/// `version`, `top_ref` and `file_size` are written by the publishing writer
/// before the release store that clears the free bit, and read by pinned
/// readers after their acquire; the relaxed accessors below rely on that
/// synchronization. `next` is only modified by the writer under the write
/// mutex.
#[repr(C)]
pub struct VersionEntry {
    version: AtomicU64,
    file_size: AtomicU64,
    top_ref: AtomicU64,
    count: AtomicU32,
    next: AtomicU32,
}

impl VersionEntry {
    /// Snapshot sequence number. Valid only while pinned.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    /// Byte offset of the snapshot's root node. Valid only while pinned.
    #[inline]
    pub fn top_ref(&self) -> u64 {
        self.top_ref.load(Ordering::Relaxed)
    }

    /// Authoritative file size for the snapshot. Valid only while pinned.
    #[inline]
    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Relaxed)
    }

    /// Successor slot index.
    #[inline]
    pub fn next(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }

    /// Try to pin this slot. Fails if the slot is free or being reclaimed.
    #[inline]
    #[must_use]
    pub fn pin(&self) -> bool {
        pin_if_live(&self.count)
    }

    /// Release a pin previously obtained from [`pin`](Self::pin).
    #[inline]
    pub fn unpin(&self) {
        unpin(&self.count)
    }

    /// Raw count word, for assertions and diagnostics.
    #[inline]
    pub fn raw_count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Writer-side: fill in the snapshot fields of a still-free slot.
    fn set_snapshot(&self, version: u64, top_ref: u64, file_size: u64) {
        self.version.store(version, Ordering::Relaxed);
        self.top_ref.store(top_ref, Ordering::Relaxed);
        self.file_size.store(file_size, Ordering::Relaxed);
    }

    /// Writer-side: reset a slot to the free state with the given successor.
    fn reset_free(&self, next: u32) {
        self.version.store(1, Ordering::Relaxed);
        self.top_ref.store(0, Ordering::Relaxed);
        self.file_size.store(0, Ordering::Relaxed);
        self.count.store(1, Ordering::Relaxed);
        self.next.store(next, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// VersionRing
// ---------------------------------------------------------------------------

/// Ring header plus the initial slot array.
///
/// The slot array MUST remain the final field: the lock file is extended
/// past the end of this struct when the ring grows, and slots beyond
/// `RING_INITIAL_ENTRIES` live in that extension. For the same reason the
/// ring must be the final field of the enclosing `SharedInfo`.
#[repr(C)]
pub struct VersionRing {
    /// Number of usable slots. Only changed by the writer while holding the
    /// write mutex; other participants synchronize on `put_pos`.
    entry_count: AtomicU32,
    /// Index of the most recent live slot. Written only by the writer.
    put_pos: AtomicU32,
    /// Index of the oldest live slot. Advanced only during writer cleanup.
    old_pos: AtomicU32,
    _filler: u32,
    entries: [VersionEntry; RING_INITIAL_ENTRIES as usize],
}

impl VersionRing {
    /// Bytes required past `size_of::<VersionRing>()`'s enclosing struct for
    /// a ring with `num_entries` slots.
    #[must_use]
    pub const fn extra_bytes(num_entries: u32) -> usize {
        (num_entries as usize - RING_INITIAL_ENTRIES as usize) * mem::size_of::<VersionEntry>()
    }
}

/// Accessor for a [`VersionRing`] living inside a shared mapping.
///
/// Slot access goes through raw pointer arithmetic from the ring base so
/// that slots past the declared array (added by ring growth) stay reachable.
/// The wrapper is `Copy` and re-created from the current mapping whenever
/// the mapping may have moved.
#[derive(Clone, Copy)]
pub struct RingPtr {
    base: *mut VersionRing,
}

impl RingPtr {
    /// Wrap a raw pointer to a ring.
    ///
    /// # Safety
    ///
    /// `base` must point at memory holding an initialized `VersionRing`
    /// whose backing allocation extends to at least
    /// `size_of::<VersionRing>() + VersionRing::extra_bytes(entry_count)`
    /// bytes, and must stay valid for the lifetime of the wrapper and every
    /// entry reference obtained through it.
    #[must_use]
    pub unsafe fn from_raw(base: *mut VersionRing) -> Self {
        Self { base }
    }

    #[inline]
    fn header(&self) -> &VersionRing {
        // Safety: per from_raw, base points at an initialized ring.
        unsafe { &*self.base }
    }

    /// Initialize the ring in place over zeroed memory.
    ///
    /// # Safety
    ///
    /// Caller must be the only party with access to the memory (bootstrap
    /// runs under the exclusive file lock).
    pub unsafe fn initialize(&self) {
        let h = self.header();
        for i in 0..RING_INITIAL_ENTRIES {
            self.entry(i).reset_free(i + 1);
        }
        self.entry(RING_INITIAL_ENTRIES - 1)
            .next
            .store(0, Ordering::Relaxed);
        h.old_pos.store(0, Ordering::Relaxed);
        // Slot 0 starts live so the ring always carries one snapshot.
        self.entry(0).count.store(0, Ordering::Relaxed);
        h.entry_count
            .store(RING_INITIAL_ENTRIES, Ordering::Relaxed);
        h.put_pos.store(0, Ordering::Release);
    }

    /// Current number of usable slots.
    #[inline]
    pub fn num_entries(&self) -> u32 {
        self.header().entry_count.load(Ordering::Relaxed)
    }

    /// Index of the most recent live slot.
    #[inline]
    pub fn last(&self) -> u32 {
        self.header().put_pos.load(Ordering::Acquire)
    }

    /// Index of the oldest live slot.
    #[inline]
    pub fn oldest_index(&self) -> u32 {
        self.header().old_pos.load(Ordering::Relaxed)
    }

    /// Access slot `idx`.
    ///
    /// The caller must have established `idx < num_entries()` under its own
    /// mapping (see `grow_reader_mapping`); slot fields are only meaningful
    /// between a matched pin/unpin.
    #[inline]
    pub fn entry(&self, idx: u32) -> &VersionEntry {
        let offset =
            mem::offset_of!(VersionRing, entries) + idx as usize * mem::size_of::<VersionEntry>();
        // Safety: the backing allocation covers `entry_count` slots (see
        // from_raw) and the caller has checked idx against its mapping.
        unsafe { &*self.base.cast::<u8>().add(offset).cast::<VersionEntry>() }
    }

    /// Whether the free arc is empty.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.entry(self.last()).next() == self.oldest_index()
    }

    /// Index of the slot the next commit will publish into. Must not be
    /// called while the ring is full.
    #[inline]
    pub fn next_index(&self) -> u32 {
        self.entry(self.last()).next()
    }

    /// Writer-side: reset the current head slot for session bootstrap.
    ///
    /// Only valid while the caller is the sole participant (session
    /// initiator under the control mutex); the atomic store is then
    /// immaterial and merely forced on us by the field type.
    pub fn reinit_last(&self) -> &VersionEntry {
        let e = self.entry(self.last());
        e.count.store(0, Ordering::Relaxed);
        e
    }

    /// Writer-side: load the initial session snapshot into the head slot.
    ///
    /// Only valid for the session initiator, under the control mutex, while
    /// no other participant is attached.
    pub fn init_versioning(&self, version: u64, top_ref: u64, file_size: u64) {
        self.reinit_last().set_snapshot(version, top_ref, file_size);
    }

    /// Writer-side: fill the next free slot and publish it as the new head.
    ///
    /// The release store that clears the free bit is the single point at
    /// which the snapshot becomes pinnable; the release store to `put_pos`
    /// makes it the head.
    pub fn publish_next(&self, version: u64, top_ref: u64, file_size: u64) {
        let next = self.next_index();
        let e = self.entry(next);
        e.set_snapshot(version, top_ref, file_size);
        e.count.fetch_sub(1, Ordering::Release);
        self.header().put_pos.store(next, Ordering::Release);
    }

    /// Writer-side: advance `old_pos` past every unreferenced slot.
    ///
    /// Stops at the first slot with live readers. The head slot is never
    /// reclaimed. Requires the write mutex; cleanup is single-threaded by
    /// construction, so a non-zero pre-image in the probe always means real
    /// readers.
    pub fn cleanup(&self) {
        let h = self.header();
        while h.old_pos.load(Ordering::Relaxed) != h.put_pos.load(Ordering::Relaxed) {
            let e = self.entry(h.old_pos.load(Ordering::Relaxed));
            if !reclaim_if_unreferenced(&e.count) {
                break;
            }
            h.old_pos.store(e.next(), Ordering::Relaxed);
        }
    }

    /// Writer-side: extend the ring to `new_entries` slots.
    ///
    /// The backing file must already have been grown and remapped. New
    /// slots are chained between the current head and `old_pos`.
    pub fn expand_to(&self, new_entries: u32) {
        let h = self.header();
        let old_count = self.num_entries();
        debug_assert!(new_entries > old_count);
        for i in old_count..new_entries {
            self.entry(i).reset_free(i + 1);
        }
        self.entry(new_entries - 1)
            .next
            .store(self.oldest_index(), Ordering::Relaxed);
        self.entry(h.put_pos.load(Ordering::Relaxed))
            .next
            .store(old_count, Ordering::Relaxed);
        h.entry_count.store(new_entries, Ordering::Relaxed);
    }

    /// Number of live slots (diagnostics; racy outside the write mutex).
    pub fn live_len(&self) -> u32 {
        let mut n = 1;
        let mut i = self.oldest_index();
        while i != self.last() {
            i = self.entry(i).next();
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Heap-backed ring for tests: an aligned buffer large enough for
    /// `capacity` slots, initialized through the same code path the
    /// bootstrap uses.
    struct HeapRing {
        buf: Vec<u64>,
        capacity: u32,
    }

    impl HeapRing {
        fn new(capacity: u32) -> Self {
            assert!(capacity >= RING_INITIAL_ENTRIES);
            let bytes = mem::size_of::<VersionRing>() + VersionRing::extra_bytes(capacity);
            let ring = Self {
                buf: vec![0u64; bytes.div_ceil(8)],
                capacity,
            };
            unsafe { ring.ptr().initialize() };
            ring
        }

        fn ptr(&self) -> RingPtr {
            unsafe { RingPtr::from_raw(self.buf.as_ptr().cast_mut().cast()) }
        }
    }

    fn publish(ring: RingPtr, version: u64) {
        ring.cleanup();
        if ring.is_full() {
            panic!("test ring full at version {version}");
        }
        ring.publish_next(version, version * 100, version * 1000);
    }

    #[test]
    fn test_initial_ring_state() {
        let heap = HeapRing::new(RING_INITIAL_ENTRIES);
        let ring = heap.ptr();
        assert_eq!(ring.num_entries(), RING_INITIAL_ENTRIES);
        assert_eq!(ring.last(), 0);
        assert_eq!(ring.oldest_index(), 0);
        assert_eq!(ring.live_len(), 1);
        assert!(!ring.is_full());
        // Head slot is live (count 0), all others free (count 1).
        assert_eq!(ring.entry(0).raw_count(), 0);
        for i in 1..RING_INITIAL_ENTRIES {
            assert_eq!(ring.entry(i).raw_count(), 1);
        }
    }

    #[test]
    fn test_pin_reads_published_snapshot() {
        let heap = HeapRing::new(RING_INITIAL_ENTRIES);
        let ring = heap.ptr();
        ring.reinit_last().set_snapshot(7, 4096, 8192);

        let idx = ring.last();
        let e = ring.entry(idx);
        assert!(e.pin());
        assert_eq!(e.version(), 7);
        assert_eq!(e.top_ref(), 4096);
        assert_eq!(e.file_size(), 8192);
        e.unpin();
    }

    #[test]
    fn test_pin_fails_on_free_slot() {
        let heap = HeapRing::new(RING_INITIAL_ENTRIES);
        let ring = heap.ptr();
        let free_idx = ring.entry(ring.last()).next();
        let e = ring.entry(free_idx);
        assert!(!e.pin());
        // The failed pin must leave the count untouched.
        assert_eq!(e.raw_count(), 1);
    }

    #[test]
    fn test_cleanup_reclaims_unpinned_history() {
        let heap = HeapRing::new(RING_INITIAL_ENTRIES);
        let ring = heap.ptr();
        for v in 2..=10 {
            publish(ring, v);
        }
        assert_eq!(ring.live_len(), 10);

        ring.cleanup();
        assert_eq!(ring.live_len(), 1, "cleanup collapses unpinned history");
        assert_eq!(ring.entry(ring.oldest_index()).version(), 10);
    }

    #[test]
    fn test_pinned_slot_blocks_cleanup() {
        let heap = HeapRing::new(RING_INITIAL_ENTRIES);
        let ring = heap.ptr();
        ring.reinit_last().set_snapshot(1, 0, 0);

        let pinned_idx = ring.last();
        let pinned = ring.entry(pinned_idx);
        assert!(pinned.pin());

        for v in 2..=8 {
            publish(ring, v);
        }
        ring.cleanup();
        assert_eq!(
            ring.oldest_index(),
            pinned_idx,
            "old_pos must not pass a pinned slot"
        );
        assert_eq!(pinned.version(), 1);

        pinned.unpin();
        ring.cleanup();
        assert_eq!(ring.live_len(), 1);
        assert_eq!(ring.entry(ring.oldest_index()).version(), 8);
    }

    #[test]
    fn test_ring_fills_and_expands() {
        let heap = HeapRing::new(RING_INITIAL_ENTRIES + RING_GROW_ENTRIES);
        let ring = heap.ptr();
        ring.reinit_last().set_snapshot(1, 0, 0);

        // Pin every published head so nothing can be reclaimed.
        let mut pins = Vec::new();
        let head = ring.entry(ring.last());
        assert!(head.pin());
        pins.push(ring.last());

        let mut v = 1;
        while !ring.is_full() {
            v += 1;
            ring.publish_next(v, 0, 0);
            let e = ring.entry(ring.last());
            assert!(e.pin());
            pins.push(ring.last());
        }
        assert_eq!(v, u64::from(RING_INITIAL_ENTRIES));

        ring.expand_to(RING_INITIAL_ENTRIES + RING_GROW_ENTRIES);
        assert!(!ring.is_full());
        assert_eq!(ring.num_entries(), RING_INITIAL_ENTRIES + RING_GROW_ENTRIES);

        // Another full round of publishes fits after expansion.
        for _ in 0..RING_GROW_ENTRIES - 1 {
            assert!(!ring.is_full());
            v += 1;
            ring.publish_next(v, 0, 0);
        }

        // Old pins still read their own snapshots.
        for (i, &idx) in pins.iter().enumerate() {
            assert_eq!(ring.entry(idx).version(), i as u64 + 1);
            ring.entry(idx).unpin();
        }
        ring.cleanup();
        assert_eq!(ring.live_len(), 1);
    }

    #[test]
    fn test_versions_monotone_after_mixed_traffic() {
        let heap = HeapRing::new(RING_INITIAL_ENTRIES);
        let ring = heap.ptr();
        ring.reinit_last().set_snapshot(1, 100, 1000);

        let mut last_version = 1;
        for v in 2..=40 {
            publish(ring, v);
            let e = ring.entry(ring.last());
            assert!(e.pin());
            assert!(e.version() > last_version);
            last_version = e.version();
            e.unpin();
        }
    }

    proptest! {
        // Random interleavings of publish / pin / unpin must preserve:
        // every pinned handle reads its own snapshot, and cleanup never
        // reclaims a pinned slot.
        #[test]
        fn prop_pins_survive_commits(ops in proptest::collection::vec(0u8..3, 1..200)) {
            let heap = HeapRing::new(256);
            let ring = heap.ptr();
            ring.reinit_last().set_snapshot(1, 100, 1000);

            let mut version = 1u64;
            let mut pins: Vec<(u32, u64)> = Vec::new();

            for op in ops {
                match op {
                    0 => {
                        ring.cleanup();
                        if !ring.is_full() {
                            version += 1;
                            ring.publish_next(version, version * 100, version * 1000);
                        }
                    }
                    1 => {
                        let idx = ring.last();
                        let e = ring.entry(idx);
                        if e.pin() {
                            pins.push((idx, e.version()));
                        }
                    }
                    _ => {
                        if let Some((idx, _)) = pins.pop() {
                            ring.entry(idx).unpin();
                        }
                    }
                }

                for &(idx, v) in &pins {
                    let e = ring.entry(idx);
                    prop_assert_eq!(e.version(), v);
                    prop_assert_eq!(e.top_ref(), v * 100);
                    prop_assert!(e.raw_count() >= 2);
                }
            }

            for (idx, _) in pins.drain(..) {
                ring.entry(idx).unpin();
            }
            ring.cleanup();
            prop_assert_eq!(ring.live_len(), 1);
        }
    }
}
