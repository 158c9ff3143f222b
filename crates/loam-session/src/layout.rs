//! Fixed layout of the `.lock` file contents.
//!
//! The lock file is transient: it is recreated at the beginning of every
//! session by the initiator, under the exclusive file lock. Its contents are
//! native byte order and architecture specific within a host; the file is
//! not portable across hosts.
//!
//! The prefix up to and including `shared_info_version` has an eternally
//! constant layout: it is what lets a joining participant verify that the
//! actual format is the expected one before trusting anything else. Any
//! change to the layout or the meaning of a field beyond that prefix
//! requires bumping [`SHARED_INFO_VERSION`].
//!
//! Locking rules: `init_complete`, `shared_info_version`, `size_of_mutex`
//! and `size_of_condvar` may be written only under the exclusive file lock
//! and read under any file lock. All other fields (except the ring, which
//! has its own protocol) are guarded by the control mutex.

use std::mem::{self, offset_of};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8};

use loam_error::Result;
use loam_types::{Durability, HistoryType};

use crate::ring::{RingPtr, VersionEntry, VersionRing};
use crate::sync::{condvar_part_size, mutex_part_size, SharedCondVarPart, SharedMutexPart};

/// Layout version of [`SharedInfo`]. Joining participants must agree.
pub const SHARED_INFO_VERSION: u16 = 1;

/// Byte offsets of the fixed prefix. These must never change, not even
/// across [`SHARED_INFO_VERSION`] bumps, to keep version negotiation
/// possible between disagreeing participants.
pub mod offsets {
    /// `u8` — 1 once bootstrap finished writing the file.
    pub const INIT_COMPLETE: usize = 0;
    /// `u8` — `size_of::<SharedMutexPart>()` of the initiator.
    pub const SIZE_OF_MUTEX: usize = 1;
    /// `u8` — `size_of::<SharedCondVarPart>()` of the initiator.
    pub const SIZE_OF_CONDVAR: usize = 2;
    /// `u8` — poison bit; set while a commit is republishing the ring.
    pub const COMMIT_IN_CRITICAL_PHASE: usize = 3;
    /// `u8` — target data-file format for this session.
    pub const FILE_FORMAT_VERSION: usize = 4;
    /// `i8` — history type of this session.
    pub const HISTORY_TYPE: usize = 5;
    /// `u16` — [`super::SHARED_INFO_VERSION`].
    pub const SHARED_INFO_VERSION: usize = 6;
    /// `u16` — durability level of this session.
    pub const DURABILITY: usize = 8;
    /// `u16` — async-commit credit counter (reserved in this build).
    pub const FREE_WRITE_SLOTS: usize = 10;
    /// `u32` — number of participants attached to the session.
    pub const NUM_PARTICIPANTS: usize = 12;
    /// `u64` — latest snapshot number, guarded by the control mutex.
    pub const LATEST_VERSION_NUMBER: usize = 16;
    /// `u64` — pid of the initiator, recorded only for encrypted files.
    pub const SESSION_INITIATOR_PID: usize = 24;
    /// `u64` — live version span, guarded by the control mutex.
    pub const NUMBER_OF_VERSIONS: usize = 32;
    /// `u8` — 1 while a sync client is attached.
    pub const SYNC_CLIENT_PRESENT: usize = 40;
    /// `u8` — async daemon lifecycle flag (reserved in this build).
    pub const DAEMON_STARTED: usize = 41;
    /// `u8` — async daemon lifecycle flag (reserved in this build).
    pub const DAEMON_READY: usize = 42;
    /// Start of the embedded mutexes, condvars and the version ring.
    pub const SHARED_PARTS: usize = 48;
}

/// The structure of the contents of the per-session lock file.
///
/// Must stay 8-byte aligned, and must not have a stricter alignment
/// requirement than [`VersionEntry`]: the file (and its mappings) are
/// extended at run time by whole entries.
///
/// The ring MUST be the last field, and the ring's entry array is its last
/// field; everything past `size_of::<SharedInfo>()` is ring extension.
#[repr(C, align(8))]
pub struct SharedInfo {
    /// 1 iff initialization of the lock file completed.
    pub init_complete: AtomicU8,
    /// Mutex size agreement across participants. A size match does not
    /// prove identical internal layout, but it catches most mismatches;
    /// the try-lock probe covers part of the rest.
    pub size_of_mutex: u8,
    /// Like `size_of_mutex`, for condition variables.
    pub size_of_condvar: u8,
    /// Set during the critical phase of a commit, when the ring and the
    /// data file may be out of sync with each other. A writer crash while
    /// this is set leaves no safe way to continue writing; `begin_write`
    /// checks it and refuses.
    pub commit_in_critical_phase: AtomicU8,
    /// Target data-file format version for the current session.
    pub file_format_version: AtomicU8,
    /// `HistoryType` of the session; must match across participants.
    pub history_type: i8,
    /// [`SHARED_INFO_VERSION`] of the initiator.
    pub shared_info_version: u16,
    /// `Durability` of the session; fixed at creation.
    pub durability: u16,
    /// Async-commit credit counter. Reserved: no daemon in this build.
    pub free_write_slots: AtomicU16,
    /// Number of participants attached to this session.
    pub num_participants: AtomicU32,
    /// Latest snapshot number (guarded by the control mutex; for lock-free
    /// access use the ring head instead).
    pub latest_version_number: AtomicU64,
    /// Pid of the session initiator, recorded only when encryption is in
    /// use: other processes cannot join an encrypted session.
    pub session_initiator_pid: AtomicU64,
    /// Count of distinct live versions, guarded by the control mutex.
    pub number_of_versions: AtomicU64,
    /// 1 while a sync client is attached to the session.
    pub sync_client_present: AtomicU8,
    /// Daemon lifecycle flag, reserved in this build.
    pub daemon_started: AtomicU8,
    /// Daemon lifecycle flag, reserved in this build.
    pub daemon_ready: AtomicU8,
    _filler_1: u8,
    _filler_2: u32,
    /// Serializes writers.
    pub writemutex: SharedMutexPart,
    /// Guards the session-level fields above and condvar notification.
    pub controlmutex: SharedMutexPart,
    /// Async-variant condvar, kept for layout negotiation only.
    pub room_to_write: SharedCondVarPart,
    /// Async-variant condvar, kept for layout negotiation only.
    pub work_to_do: SharedCondVarPart,
    /// Async-variant condvar, kept for layout negotiation only.
    pub daemon_becomes_ready: SharedCondVarPart,
    /// Broadcast after every commit publishes a new version.
    pub new_commit_available: SharedCondVarPart,
    /// The version ring. MUST remain the last field.
    pub readers: VersionRing,
}

const _: () = {
    assert!(mem::align_of::<SharedInfo>() == 8);
    assert!(mem::align_of::<SharedInfo>() <= mem::align_of::<VersionEntry>());
    assert!(mem::size_of::<VersionEntry>() == 32);

    // The eternally constant prefix.
    assert!(offset_of!(SharedInfo, init_complete) == offsets::INIT_COMPLETE);
    assert!(offset_of!(SharedInfo, shared_info_version) == offsets::SHARED_INFO_VERSION);

    // Everything else in the fixed prefix; a change here requires bumping
    // SHARED_INFO_VERSION.
    assert!(offset_of!(SharedInfo, size_of_mutex) == offsets::SIZE_OF_MUTEX);
    assert!(offset_of!(SharedInfo, size_of_condvar) == offsets::SIZE_OF_CONDVAR);
    assert!(
        offset_of!(SharedInfo, commit_in_critical_phase) == offsets::COMMIT_IN_CRITICAL_PHASE
    );
    assert!(offset_of!(SharedInfo, file_format_version) == offsets::FILE_FORMAT_VERSION);
    assert!(offset_of!(SharedInfo, history_type) == offsets::HISTORY_TYPE);
    assert!(offset_of!(SharedInfo, durability) == offsets::DURABILITY);
    assert!(offset_of!(SharedInfo, free_write_slots) == offsets::FREE_WRITE_SLOTS);
    assert!(offset_of!(SharedInfo, num_participants) == offsets::NUM_PARTICIPANTS);
    assert!(offset_of!(SharedInfo, latest_version_number) == offsets::LATEST_VERSION_NUMBER);
    assert!(offset_of!(SharedInfo, session_initiator_pid) == offsets::SESSION_INITIATOR_PID);
    assert!(offset_of!(SharedInfo, number_of_versions) == offsets::NUMBER_OF_VERSIONS);
    assert!(offset_of!(SharedInfo, sync_client_present) == offsets::SYNC_CLIENT_PRESENT);
    assert!(offset_of!(SharedInfo, daemon_started) == offsets::DAEMON_STARTED);
    assert!(offset_of!(SharedInfo, daemon_ready) == offsets::DAEMON_READY);
    assert!(offset_of!(SharedInfo, writemutex) == offsets::SHARED_PARTS);

    // The ring is the final field.
    assert!(
        offset_of!(SharedInfo, readers) + mem::size_of::<VersionRing>()
            == mem::size_of::<SharedInfo>()
    );
};

impl SharedInfo {
    /// Size of the structure itself; the minimum valid lock-file size.
    pub const BASE_SIZE: usize = mem::size_of::<SharedInfo>();

    /// Byte offset of the version ring within the mapping.
    #[must_use]
    pub const fn ring_offset() -> usize {
        offset_of!(SharedInfo, readers)
    }

    /// Lock-file size for a ring with `num_entries` slots.
    #[must_use]
    pub const fn size_with_entries(num_entries: u32) -> usize {
        Self::BASE_SIZE + VersionRing::extra_bytes(num_entries)
    }

    /// Construct a fresh `SharedInfo` in place, with `init_complete` left
    /// at 0. The embedded mutexes and condvars are initialized unlocked;
    /// the ring is bootstrapped with its single initial live slot.
    ///
    /// # Safety
    ///
    /// `ptr` must be 8-byte aligned, point at [`Self::BASE_SIZE`] zeroed
    /// writable bytes, and be exclusively owned by the caller.
    pub unsafe fn initialize(
        ptr: *mut SharedInfo,
        durability: Durability,
        history_type: HistoryType,
    ) -> Result<()> {
        let info = &mut *ptr;
        info.size_of_mutex = mutex_part_size();
        info.size_of_condvar = condvar_part_size();
        info.history_type = history_type.as_i8();
        info.shared_info_version = SHARED_INFO_VERSION;
        info.durability = durability.as_u16();

        SharedMutexPart::init(&mut info.writemutex)?;
        SharedMutexPart::init(&mut info.controlmutex)?;
        SharedCondVarPart::init(&mut info.room_to_write)?;
        SharedCondVarPart::init(&mut info.work_to_do)?;
        SharedCondVarPart::init(&mut info.daemon_becomes_ready)?;
        SharedCondVarPart::init(&mut info.new_commit_available)?;

        RingPtr::from_raw(&mut info.readers).initialize();
        Ok(())
    }
}
