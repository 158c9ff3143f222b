//! Session lifecycle and the transaction state machine.
//!
//! A [`SharedStore`] is one participant handle on a session. Opening runs
//! the bootstrap protocol over the `.lock` file: whoever wins a
//! non-blocking exclusive file lock rebuilds the file from scratch; every
//! participant then holds a shared file lock for the life of its handle,
//! which is what delays the next fresh initializer until all current
//! participants have closed.
//!
//! A handle moves between `Ready`, `Reading` and `Writing`. Reads pin a
//! version-ring entry; writes hold the cross-process write mutex, publish a
//! new ring entry on commit, and broadcast `new_commit_available`.
//!
//! Lock nesting: the OS file lock is always outermost. The write mutex is
//! held across an entire write transaction; the control mutex is only ever
//! taken for short sections, including under the write mutex when a commit
//! publishes its counters. Nothing blocks on the write mutex while holding
//! the control mutex.

use std::fmt;
use std::fs::{self, File};
use std::mem::MaybeUninit;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::{ptr, slice};

use loam_error::{LoamError, Result};
use loam_types::{Durability, HistoryType, TransactStage, VersionId};
use nix::errno::Errno;
use tracing::{debug, info, warn};

use crate::handover::Handover;
use crate::layout::{SharedInfo, SHARED_INFO_VERSION};
use crate::map::{prealloc, FileMap};
use crate::ring::{RingPtr, RING_GROW_ENTRIES};
use crate::store::{AttachConfig, History, PageStore};
use crate::sync::{
    condvar_part_size, mutex_part_size, SharedCondVar, SharedMutex,
};

// ---------------------------------------------------------------------------
// Advisory file locking
// ---------------------------------------------------------------------------

/// Issue a `flock` operation, retrying on signal interruption.
///
/// Returns `Ok(true)` on success and `Ok(false)` when a non-blocking
/// request would have to wait.
fn flock_file(file: &File, operation: libc::c_int) -> Result<bool> {
    loop {
        // Safety: the descriptor is valid for the lifetime of `file`.
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc == 0 {
            return Ok(true);
        }
        match Errno::last() {
            Errno::EAGAIN => return Ok(false),
            Errno::EINTR => continue,
            errno => {
                return Err(LoamError::Io(std::io::Error::from_raw_os_error(
                    errno as i32,
                )))
            }
        }
    }
}

fn try_lock_exclusive(file: &File) -> Result<bool> {
    flock_file(file, libc::LOCK_EX | libc::LOCK_NB)
}

fn lock_shared(file: &File) -> Result<()> {
    flock_file(file, libc::LOCK_SH).map(drop)
}

fn unlock(file: &File) -> Result<()> {
    flock_file(file, libc::LOCK_UN).map(drop)
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Configuration recognized at [`SharedStore::open`].
pub struct SessionOptions {
    /// Durability level; must match across the session.
    pub durability: Durability,
    /// Optional encryption key. When set, the file cannot be shared across
    /// processes.
    pub encryption_key: Option<Vec<u8>>,
    /// Fail if the data file is absent instead of creating it.
    pub no_create: bool,
    /// Permit the file-format upgrade hook to run.
    pub allow_file_format_upgrade: bool,
    /// Where condvar auxiliary files are placed instead of the coordination
    /// directory.
    pub temp_dir: Option<PathBuf>,
    /// Invoked as `(old_format, new_format)` inside the write transaction
    /// that performs a file-format upgrade.
    pub upgrade_callback: Option<Box<dyn FnMut(u8, u8) + Send>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            durability: Durability::Full,
            encryption_key: None,
            no_create: false,
            allow_file_format_upgrade: true,
            temp_dir: None,
            upgrade_callback: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ReadLock
// ---------------------------------------------------------------------------

/// A pinned ring entry plus the snapshot coordinates read from it.
#[derive(Debug, Clone, Copy)]
struct ReadLock {
    reader_idx: u32,
    version: u64,
    top_ref: u64,
    file_size: u64,
}

impl ReadLock {
    const INVALID_IDX: u32 = u32::MAX;

    /// No pin held; `version` is kept as the change-detection baseline.
    fn unset(baseline_version: u64) -> Self {
        Self {
            reader_idx: Self::INVALID_IDX,
            version: baseline_version,
            top_ref: 0,
            file_size: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// SharedStore
// ---------------------------------------------------------------------------

/// One participant handle on a loamdb session.
///
/// A handle is single-transaction: it is either `Ready`, bound to one read
/// snapshot, or running the session's single write transaction. Handles may
/// be moved across threads; concurrent use of one handle is not supported
/// (open one handle per thread instead).
pub struct SharedStore<S: PageStore> {
    store: S,
    history: Option<Box<dyn History + Send>>,
    db_path: PathBuf,
    coordination_dir: PathBuf,
    durability: Durability,
    writemutex: SharedMutex,
    controlmutex: SharedMutex,
    new_commit_available: SharedCondVar,
    info_map: FileMap,
    reader_map: FileMap,
    file: File,
    local_max_entry: u32,
    read_lock: ReadLock,
    transact_stage: TransactStage,
    wait_for_change_enabled: AtomicBool,
    closed: bool,
}

impl<S: PageStore> SharedStore<S> {
    /// Open a session participant on `path`.
    ///
    /// Runs the bootstrap retry loop: acquire the lock file, initialize it
    /// if we are alone in the world, validate its layout, then start or
    /// join the session under the control mutex. On failure, every
    /// acquired resource is released in reverse order; no partial session
    /// is left behind.
    pub fn open(
        path: impl AsRef<Path>,
        mut store: S,
        mut history: Option<Box<dyn History + Send>>,
        mut options: SessionOptions,
    ) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let lockfile_path = path_with_suffix(&db_path, ".lock");
        let coordination_dir = path_with_suffix(&db_path, ".management");
        let lockfile_prefix = coordination_dir.join("access_control");

        if options.durability == Durability::Async {
            return Err(LoamError::AsyncUnsupported);
        }
        fs::create_dir_all(&coordination_dir)?;

        let history_type = history
            .as_ref()
            .map_or(HistoryType::None, |h| h.history_type());

        loop {
            let file = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lockfile_path)?;

            if try_lock_exclusive(&file)? {
                // We are alone in the world and may initialize the file.
                init_lock_file(&file, options.durability, history_type)?;
                unlock(&file)?;
            }

            // Held from here until the handle closes.
            lock_shared(&file)?;

            // If the file is not completely initialized at this point, the
            // preceding initialization attempt died: we could not get the
            // exclusive lock, yet under our shared lock no initializer can
            // be running anymore. Retry and become the initializer.
            let file_len = file.metadata()?.len();
            if (file_len as usize) < SharedInfo::BASE_SIZE {
                if file_len == 0 {
                    continue;
                }
                let mut byte = [0u8; 1];
                file.read_exact_at(&mut byte, 0)?;
                if byte[0] == 0 {
                    continue;
                }
                return Err(LoamError::incompatible(format!(
                    "lock file too small: {file_len} bytes, expected {}",
                    SharedInfo::BASE_SIZE
                )));
            }

            let info_map = FileMap::map(&file, SharedInfo::BASE_SIZE)?;
            // Safety: the mapping covers BASE_SIZE bytes; the layout checks
            // below run before anything beyond the fixed prefix is trusted.
            let info = unsafe { &*info_map.as_ptr().cast::<SharedInfo>() };
            if info.init_complete.load(Ordering::Acquire) == 0 {
                continue;
            }

            // The file was completely initialized, but possibly by a
            // participant with a different memory layout.
            if info.shared_info_version != SHARED_INFO_VERSION {
                return Err(LoamError::incompatible(format!(
                    "layout version mismatch: {} vs {}",
                    info.shared_info_version, SHARED_INFO_VERSION
                )));
            }
            if info.size_of_mutex != mutex_part_size() {
                return Err(LoamError::incompatible(format!(
                    "mutex size mismatch: {} vs {}",
                    info.size_of_mutex,
                    mutex_part_size()
                )));
            }
            if info.size_of_condvar != condvar_part_size() {
                return Err(LoamError::incompatible(format!(
                    "condvar size mismatch: {} vs {}",
                    info.size_of_condvar,
                    condvar_part_size()
                )));
            }

            // Safety: the prefix mapping never moves for the life of the
            // handle; the parts were initialized by the session initiator.
            let writemutex = unsafe { SharedMutex::attach(&info.writemutex, "write") };
            let controlmutex = unsafe { SharedMutex::attach(&info.controlmutex, "control") };

            // Sizes matching does not prove the implementations agree;
            // ask the mutex itself.
            if !controlmutex.is_valid() {
                return Err(LoamError::incompatible("control mutex is invalid"));
            }

            let guard = controlmutex.lock()?;

            // Per-handle copy of the ring size, used to detect concurrent
            // ring expansion later.
            let prefix_ring = unsafe {
                RingPtr::from_raw(info_map.as_ptr().add(SharedInfo::ring_offset()).cast())
            };
            let local_max_entry = prefix_ring.num_entries();

            // The ring region gets its own mapping: it can be resized and
            // remapped, and the embedded mutexes must not move with it.
            let reader_map =
                FileMap::map(&file, SharedInfo::size_with_entries(local_max_entry))?;
            // Safety: the reader mapping covers the whole ring.
            let ring = unsafe {
                RingPtr::from_raw(reader_map.as_ptr().add(SharedInfo::ring_offset()).cast())
            };

            let begin_new_session = info.num_participants.load(Ordering::Relaxed) == 0;
            let cfg = AttachConfig {
                session_initiator: begin_new_session,
                read_only: false,
                is_shared: true,
                skip_validate: !begin_new_session,
                // Only the session initiator may create the data file; all
                // others must assume it already exists.
                no_create: if begin_new_session {
                    options.no_create
                } else {
                    true
                },
                // A MemOnly file found on disk at session start was left
                // behind by a crash and must be discarded.
                clear_file: options.durability == Durability::MemOnly && begin_new_session,
                encryption_key: options.encryption_key.clone(),
            };
            let top_ref = match store.attach_file(&db_path, &cfg) {
                Ok(top_ref) => top_ref,
                Err(e) if e.is_transient() => {
                    drop(guard);
                    continue;
                }
                Err(e) => return Err(e),
            };

            // From here on every failure must detach the store before
            // surfacing, or its mapping cache could hand stale mappings to
            // a later handle after the file is re-initialized.
            let setup = (|| -> Result<()> {
                let target_format = store.target_file_format_version(history_type);
                if begin_new_session {
                    let snap = store.snapshot_info(top_ref)?;
                    if !history_type.accepts_stored(snap.history_type, top_ref) {
                        return Err(LoamError::invalid_database(
                            "bad or incompatible history type",
                            &db_path,
                        ));
                    }
                    if let Some(h) = history.as_deref_mut() {
                        h.initiate_session(snap.version)?;
                    }
                    if options.encryption_key.is_some() {
                        info.session_initiator_pid
                            .store(u64::from(std::process::id()), Ordering::Relaxed);
                    }
                    info.file_format_version
                        .store(target_format, Ordering::Relaxed);
                    // Initially there is a single version in the file.
                    info.number_of_versions.store(1, Ordering::Relaxed);
                    info.latest_version_number
                        .store(snap.version, Ordering::Relaxed);
                    ring.init_versioning(snap.version, top_ref, store.baseline());
                    info!(
                        path = %db_path.display(),
                        version = snap.version,
                        "starting new session"
                    );
                } else {
                    // Durability and history type are fixed per session; a
                    // mismatch is a logic error on the caller's side.
                    if info.durability != options.durability.as_u16() {
                        return Err(LoamError::MixedDurability);
                    }
                    if info.history_type != history_type.as_i8() {
                        return Err(LoamError::MixedHistoryType);
                    }
                    if options.encryption_key.is_some() {
                        let initiator_pid =
                            info.session_initiator_pid.load(Ordering::Relaxed);
                        let current_pid = u64::from(std::process::id());
                        if initiator_pid != current_pid {
                            return Err(LoamError::EncryptedCrossProcess {
                                initiator_pid,
                                current_pid,
                            });
                        }
                    }
                    // All participants must agree on the target data-file
                    // format for the session.
                    let session_format = info.file_format_version.load(Ordering::Relaxed);
                    if session_format != target_format {
                        return Err(LoamError::incompatible(format!(
                            "file format version mismatch: {session_format} vs {target_format}"
                        )));
                    }
                    debug!(path = %db_path.display(), "joining existing session");
                }
                Ok(())
            })();
            if let Err(e) = setup {
                store.detach_file();
                return Err(e);
            }

            // Safety: the prefix mapping never moves.
            let new_commit_available = match unsafe {
                SharedCondVar::attach(
                    &info.new_commit_available,
                    &lockfile_prefix,
                    "new_commit",
                    options.temp_dir.as_deref(),
                )
            } {
                Ok(cv) => cv,
                Err(e) => {
                    store.detach_file();
                    return Err(e);
                }
            };

            // Baseline for change detection, so wait_for_change sees
            // commits made after this point.
            let baseline_version = info.latest_version_number.load(Ordering::Relaxed);

            // Make our presence noted.
            info.num_participants.fetch_add(1, Ordering::Relaxed);
            drop(guard);

            let mut shared = Self {
                store,
                history,
                db_path,
                coordination_dir,
                durability: options.durability,
                writemutex,
                controlmutex,
                new_commit_available,
                info_map,
                reader_map,
                file,
                local_max_entry,
                read_lock: ReadLock::unset(baseline_version),
                transact_stage: TransactStage::Ready,
                wait_for_change_enabled: AtomicBool::new(true),
                closed: false,
            };

            if let Err(e) = shared.finish_file_format_upgrade(
                options.allow_file_format_upgrade,
                &mut options.upgrade_callback,
            ) {
                shared.close();
                return Err(e);
            }
            return Ok(shared);
        }
    }

    // -- accessors ---------------------------------------------------------

    fn info(&self) -> &SharedInfo {
        // Safety: the prefix mapping holds an initialized SharedInfo for
        // the life of the handle.
        unsafe { &*self.info_map.as_ptr().cast::<SharedInfo>() }
    }

    fn ring(&self) -> RingPtr {
        // Safety: the reader mapping covers `local_max_entry` ring slots;
        // callers check indices through grow_reader_mapping.
        unsafe {
            RingPtr::from_raw(
                self.reader_map
                    .as_ptr()
                    .add(SharedInfo::ring_offset())
                    .cast(),
            )
        }
    }

    /// The external page store backing this handle.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mutable access to the page store, for staging transaction contents.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Path of the data file this handle is attached to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Directory holding the condvar auxiliary files.
    #[must_use]
    pub fn coordination_dir(&self) -> &Path {
        &self.coordination_dir
    }

    /// Current stage of this handle's transaction state machine.
    #[must_use]
    pub fn transact_stage(&self) -> TransactStage {
        self.transact_stage
    }

    fn wrong_state(&self, expected: &'static str) -> LoamError {
        LoamError::WrongTransactState {
            expected,
            actual: self.transact_stage.name(),
        }
    }

    // -- mapped ring growth ------------------------------------------------

    /// Make sure slot `index` is covered by our ring mapping, remapping if
    /// another participant grew the ring. Returns `true` if a remap
    /// happened (the caller should restart whatever it read before).
    fn grow_reader_mapping(&mut self, index: u32) -> Result<bool> {
        if index < self.local_max_entry {
            return Ok(false);
        }
        let entries = self.ring().num_entries();
        if index >= entries {
            // Not a slot of this session's ring at any size.
            return Err(LoamError::BadVersion);
        }
        self.local_max_entry = entries;
        self.reader_map
            .remap(&self.file, SharedInfo::size_with_entries(entries))?;
        debug!(entries, "remapped reader mapping after ring growth");
        Ok(true)
    }

    /// Map the entire ring. Cleanup walks arbitrary slots, which
    /// begin_read's head-only guarantee does not cover.
    fn ensure_full_ring_mapped(&mut self) -> Result<()> {
        let entries = self.ring().num_entries();
        if entries > self.local_max_entry {
            self.local_max_entry = entries;
            self.reader_map
                .remap(&self.file, SharedInfo::size_with_entries(entries))?;
        }
        Ok(())
    }

    // -- read locks --------------------------------------------------------

    fn grab_read_lock(&mut self, version_id: Option<VersionId>) -> Result<ReadLock> {
        if let Some(vid) = version_id {
            loop {
                let idx = vid.index;
                if self.grow_reader_mapping(idx)? {
                    continue;
                }
                let ring = self.ring();
                let entry = ring.entry(idx);
                while !entry.pin() {
                    // The pin can fail because the slot is being reclaimed,
                    // but also because cleanup is merely probing it. While
                    // probed, `old_pos` still names the slot: retry. Once
                    // `old_pos` moved on, the entry is gone for good.
                    if ring.oldest_index() != idx {
                        return Err(LoamError::BadVersion);
                    }
                }
                // Pinned, but the slot may have been recycled for a newer
                // snapshot since the version id was minted.
                if entry.version() != vid.version {
                    entry.unpin();
                    return Err(LoamError::BadVersion);
                }
                return Ok(ReadLock {
                    reader_idx: idx,
                    version: entry.version(),
                    top_ref: entry.top_ref(),
                    file_size: entry.file_size(),
                });
            }
        }

        // Latest snapshot.
        loop {
            let idx = self.ring().last();
            if self.grow_reader_mapping(idx)? {
                // Remapping takes time; start over with a fresh head.
                continue;
            }
            let ring = self.ring();
            let entry = ring.entry(idx);
            // A stale head may have been cleaned up under us. Extremely
            // unlikely, but possible.
            if !entry.pin() {
                continue;
            }
            return Ok(ReadLock {
                reader_idx: idx,
                version: entry.version(),
                top_ref: entry.top_ref(),
                file_size: entry.file_size(),
            });
        }
    }

    fn release_read_lock(&mut self, lock: ReadLock) -> Result<()> {
        // The lock may have been minted by a handle that had mapped a
        // larger ring than ours.
        self.grow_reader_mapping(lock.reader_idx)?;
        let ring = self.ring();
        ring.entry(lock.reader_idx).unpin();
        Ok(())
    }

    fn do_begin_read(&mut self, version_id: Option<VersionId>, writable: bool) -> Result<()> {
        let lock = self.grab_read_lock(version_id)?;
        if let Err(e) = self.store.bind(lock.top_ref, lock.file_size, writable) {
            let _ = self.release_read_lock(lock);
            return Err(e);
        }
        self.read_lock = lock;
        Ok(())
    }

    fn do_end_read(&mut self) {
        if self.read_lock.reader_idx != ReadLock::INVALID_IDX {
            let lock = self.read_lock;
            if let Err(e) = self.release_read_lock(lock) {
                warn!(error = %e, "failed to release read lock");
            }
            // Keep `version` as the change-detection baseline.
            self.read_lock.reader_idx = ReadLock::INVALID_IDX;
        }
        self.store.unbind();
    }

    // -- transactions ------------------------------------------------------

    /// Begin a read transaction, on the latest snapshot or on a previously
    /// pinned `(version, index)`.
    ///
    /// Fails with `BadVersion` when a requested snapshot no longer exists
    /// or its ring slot has been reused.
    pub fn begin_read(&mut self, version_id: Option<VersionId>) -> Result<VersionId> {
        if self.transact_stage != TransactStage::Ready {
            return Err(self.wrong_state("Ready"));
        }
        self.do_begin_read(version_id, false)?;
        self.transact_stage = TransactStage::Reading;
        Ok(self.version_of_current_transaction())
    }

    /// End a read transaction. Idempotent from `Ready`, so unwinding code
    /// can call it unconditionally.
    pub fn end_read(&mut self) -> Result<()> {
        match self.transact_stage {
            TransactStage::Ready => Ok(()),
            TransactStage::Writing => Err(self.wrong_state("Reading")),
            TransactStage::Reading => {
                self.do_end_read();
                self.transact_stage = TransactStage::Ready;
                Ok(())
            }
        }
    }

    fn do_begin_write(&mut self) -> Result<()> {
        // Not released until commit() or rollback().
        let owner_died = self.writemutex.lock_unguarded()?;
        if owner_died {
            // The ring invariants the write mutex protects are covered by
            // the poison bit checked next; the mutex itself has been made
            // consistent already.
            warn!("write mutex recovered from a dead writer");
        }
        if self
            .info()
            .commit_in_critical_phase
            .load(Ordering::Acquire)
            != 0
        {
            self.writemutex.unlock_unguarded();
            warn!(path = %self.db_path.display(), "session poisoned by a writer crash");
            return Err(LoamError::SessionPoisoned);
        }
        Ok(())
    }

    fn do_end_write(&mut self) {
        self.writemutex.unlock_unguarded();
    }

    /// Begin the session's single write transaction. Blocks while another
    /// participant is writing.
    pub fn begin_write(&mut self) -> Result<()> {
        if self.transact_stage != TransactStage::Ready {
            return Err(self.wrong_state("Ready"));
        }
        self.do_begin_write()?;

        // No other write transaction can start while we hold the write
        // mutex, so this binds to the latest snapshot.
        if let Err(e) = self.do_begin_read(None, true) {
            self.do_end_write();
            return Err(e);
        }
        let current_version = self.read_lock.version;
        if let Some(h) = self.history.as_deref_mut() {
            if let Err(e) = h.initiate_transact(current_version) {
                self.do_end_read();
                self.do_end_write();
                return Err(e);
            }
        }
        self.transact_stage = TransactStage::Writing;
        Ok(())
    }

    fn do_commit(&mut self) -> Result<u64> {
        debug_assert_eq!(self.transact_stage, TransactStage::Writing);
        let ring = self.ring();
        let current_version = ring.entry(ring.last()).version();

        // If prepare_commit fails the whole transaction fails; the caller
        // then ends it with rollback(), which calls abort_transact.
        let new_version = match self.history.as_deref_mut() {
            Some(h) => h.prepare_commit(current_version)?,
            None => current_version + 1,
        };
        if let Err(e) = self.low_level_commit(new_version) {
            if let Some(h) = self.history.as_deref_mut() {
                h.abort_transact();
            }
            return Err(e);
        }
        if let Some(h) = self.history.as_deref_mut() {
            h.finalize_commit();
        }
        Ok(new_version)
    }

    fn low_level_commit(&mut self, new_version: u64) -> Result<()> {
        // Reclaim slots released since the last write. Cleanup may walk the
        // entire ring, so the whole ring must be mapped first.
        self.ensure_full_ring_mapped()?;
        let ring = self.ring();
        ring.cleanup();
        let oldest_version = ring.entry(ring.oldest_index()).version();
        debug_assert!(oldest_version <= new_version);

        // Histories that keep changesets per version may discard anything
        // below the oldest bound snapshot.
        if let Some(h) = self.history.as_deref_mut() {
            h.trim_history(oldest_version)?;
        }

        let snap = self.store.write_snapshot(new_version, oldest_version)?;
        if self.durability == Durability::Full {
            self.store.sync_to_disk()?;
        }

        // Critical phase: between here and the clear below, the ring and
        // the data file may disagree. A writer that dies in this window
        // leaves no safe way to continue; every future begin_write refuses
        // until the session is drained and restarted.
        self.info()
            .commit_in_critical_phase
            .store(1, Ordering::Release);

        if self.ring().is_full() {
            let entries = self.ring().num_entries() + RING_GROW_ENTRIES;
            let new_size = SharedInfo::size_with_entries(entries);
            debug!(entries, "growing version ring");
            prealloc(&self.file, new_size as u64)?;
            self.reader_map.remap(&self.file, new_size)?;
            self.local_max_entry = entries;
            self.ring().expand_to(entries);
        }
        self.ring()
            .publish_next(new_version, snap.top_ref, snap.file_size);

        self.info()
            .commit_in_critical_phase
            .store(0, Ordering::Release);

        {
            let guard = self.controlmutex.lock()?;
            let info = self.info();
            info.number_of_versions
                .store(new_version - oldest_version + 1, Ordering::Relaxed);
            info.latest_version_number
                .store(new_version, Ordering::Relaxed);
            self.new_commit_available.notify_all();
            drop(guard);
        }
        debug!(
            version = new_version,
            oldest = oldest_version,
            "published commit"
        );
        Ok(())
    }

    /// Commit the write transaction and return the published version.
    ///
    /// On error the handle stays in `Writing`; the caller must finish with
    /// [`rollback`](Self::rollback).
    pub fn commit(&mut self) -> Result<u64> {
        if self.transact_stage != TransactStage::Writing {
            return Err(self.wrong_state("Writing"));
        }
        let new_version = self.do_commit()?;
        self.do_end_write();
        self.do_end_read();
        self.transact_stage = TransactStage::Ready;
        Ok(new_version)
    }

    /// Commit, then stay attached read-only to the snapshot just created.
    pub fn commit_and_continue_as_read(&mut self) -> Result<u64> {
        if self.transact_stage != TransactStage::Writing {
            return Err(self.wrong_state("Writing"));
        }
        let new_version = self.do_commit()?;

        // Advance the read lock without detaching. Still under the write
        // mutex, so the head we grab is necessarily our own commit.
        let old_lock = self.read_lock;
        self.release_read_lock(old_lock)?;
        self.read_lock.reader_idx = ReadLock::INVALID_IDX;
        self.read_lock = self.grab_read_lock(None)?;
        self.do_end_write();

        self.store
            .rebind(self.read_lock.top_ref, self.read_lock.file_size)?;
        self.transact_stage = TransactStage::Reading;
        Ok(new_version)
    }

    /// Abandon the write transaction. Idempotent from `Ready`.
    pub fn rollback(&mut self) -> Result<()> {
        match self.transact_stage {
            TransactStage::Ready => Ok(()),
            TransactStage::Reading => Err(self.wrong_state("Writing")),
            TransactStage::Writing => {
                self.do_end_write();
                self.do_end_read();
                if let Some(h) = self.history.as_deref_mut() {
                    h.abort_transact();
                }
                self.transact_stage = TransactStage::Ready;
                Ok(())
            }
        }
    }

    // -- version observation -----------------------------------------------

    /// The `(version, index)` the current transaction is bound to.
    ///
    /// Only meaningful while a transaction is in progress.
    #[must_use]
    pub fn version_of_current_transaction(&self) -> VersionId {
        VersionId::new(self.read_lock.version, self.read_lock.reader_idx)
    }

    /// Version number of the latest published snapshot.
    ///
    /// Lock-free: protects the head entry with a transient pin while the
    /// number is read, since cleanup may recycle it from under us.
    pub fn version_of_latest_snapshot(&mut self) -> Result<u64> {
        loop {
            let idx = self.ring().last();
            if self.grow_reader_mapping(idx)? {
                continue;
            }
            let ring = self.ring();
            let entry = ring.entry(idx);
            if !entry.pin() {
                continue;
            }
            let version = entry.version();
            entry.unpin();
            return Ok(version);
        }
    }

    /// Whether a newer snapshot than the one this handle last observed has
    /// been published.
    pub fn has_changed(&mut self) -> Result<bool> {
        let latest = self.version_of_latest_snapshot()?;
        Ok(self.read_lock.version != latest)
    }

    /// Count of distinct live versions in the session.
    pub fn number_of_versions(&self) -> Result<u64> {
        let _guard = self.controlmutex.lock()?;
        Ok(self.info().number_of_versions.load(Ordering::Relaxed))
    }

    // -- change notification -----------------------------------------------

    /// Block until a version newer than this handle's last observed one is
    /// published, or until [`wait_for_change_release`] unblocks waiting.
    ///
    /// Returns whether a change was actually seen.
    ///
    /// [`wait_for_change_release`]: Self::wait_for_change_release
    pub fn wait_for_change(&self) -> Result<bool> {
        let guard = self.controlmutex.lock()?;
        let info = self.info();
        while self.read_lock.version == info.latest_version_number.load(Ordering::Relaxed)
            && self.wait_for_change_enabled.load(Ordering::Relaxed)
        {
            self.new_commit_available.wait(&guard)?;
        }
        Ok(self.read_lock.version != info.latest_version_number.load(Ordering::Relaxed))
    }

    /// Unblock pending and future [`wait_for_change`](Self::wait_for_change)
    /// calls on this handle.
    pub fn wait_for_change_release(&self) -> Result<()> {
        let guard = self.controlmutex.lock()?;
        self.wait_for_change_enabled.store(false, Ordering::Relaxed);
        self.new_commit_available.notify_all();
        drop(guard);
        Ok(())
    }

    /// Re-arm [`wait_for_change`](Self::wait_for_change) after a release.
    pub fn enable_wait_for_change(&self) -> Result<()> {
        let _guard = self.controlmutex.lock()?;
        self.wait_for_change_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    // -- pinning and handover ----------------------------------------------

    /// Pin the snapshot of the current transaction so it survives past the
    /// transaction's end, until [`unpin_version`](Self::unpin_version).
    pub fn pin_version(&mut self) -> Result<VersionId> {
        if self.transact_stage == TransactStage::Ready {
            return Err(self.wrong_state("Reading or Writing"));
        }
        let vid = self.version_of_current_transaction();
        self.grab_read_lock(Some(vid))?;
        Ok(vid)
    }

    /// Release a pin taken with [`pin_version`](Self::pin_version).
    pub fn unpin_version(&mut self, token: VersionId) -> Result<()> {
        self.grow_reader_mapping(token.index)?;
        let ring = self.ring();
        ring.entry(token.index).unpin();
        Ok(())
    }

    /// Export a value from the current read transaction, tagged with its
    /// snapshot. Export does not pin the snapshot by itself; use
    /// [`pin_version`](Self::pin_version) to hold it until import.
    pub fn export_for_handover<T>(&self, payload: T) -> Result<Handover<T>> {
        if self.transact_stage != TransactStage::Reading {
            return Err(self.wrong_state("Reading"));
        }
        Ok(Handover::new(payload, self.version_of_current_transaction()))
    }

    /// Import a value exported on the same session. The importing
    /// transaction must be bound to the exact snapshot the export was
    /// tagged with; anything else fails with `BadVersion`.
    pub fn import_from_handover<T>(&self, handover: Handover<T>) -> Result<T> {
        if self.transact_stage == TransactStage::Ready {
            return Err(self.wrong_state("Reading or Writing"));
        }
        if handover.version() != self.version_of_current_transaction() {
            return Err(LoamError::BadVersion);
        }
        Ok(handover.into_payload())
    }

    // -- file format upgrade -----------------------------------------------

    fn finish_file_format_upgrade(
        &mut self,
        allow_upgrade: bool,
        callback: &mut Option<Box<dyn FnMut(u8, u8) + Send>>,
    ) -> Result<()> {
        let target = self.info().file_format_version.load(Ordering::Relaxed);
        let current = self.store.file_format_version();
        if current == 0 {
            // Format still undecided: adopt the session's choice. It is
            // persisted by whichever commit happens first.
            self.store.adopt_file_format(target);
            return Ok(());
        }
        if current >= target {
            return Ok(());
        }

        // An upgrade looks necessary, but the fast check raced other
        // handles; recheck reliably inside a write transaction.
        self.begin_write()?;
        let committed = self.store.file_format_version();
        if committed < target {
            if !allow_upgrade {
                self.rollback()?;
                return Err(LoamError::FileFormatUpgradeRequired);
            }
            if let Err(e) = self.store.upgrade_file_format(target) {
                self.rollback()?;
                return Err(e);
            }
            if let Some(cb) = callback.as_mut() {
                cb(committed, target);
            }
            self.commit()?;
            info!(from = committed, to = target, "upgraded data file format");
        } else {
            // Somebody else already performed the upgrade.
            self.rollback()?;
            self.store.adopt_file_format(target);
        }
        Ok(())
    }

    // -- close -------------------------------------------------------------

    /// Leave the session. Any transaction still in progress is ended (reads
    /// released, writes rolled back) first.
    pub fn close(mut self) {
        self.close_internal();
    }

    fn close_internal(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        match self.transact_stage {
            TransactStage::Ready => {}
            TransactStage::Reading => {
                let _ = self.end_read();
            }
            TransactStage::Writing => {
                let _ = self.rollback();
            }
        }

        let guard = self.controlmutex.lock();
        if self.store.is_attached() {
            self.store.detach_file();
        }
        let prev = self.info().num_participants.fetch_sub(1, Ordering::Relaxed);
        if prev == 1 {
            // We were the last participant: the session ends here.
            if self.durability == Durability::MemOnly {
                // The data file only ever backed a transient structure.
                let _ = fs::remove_file(&self.db_path);
            }
            if let Some(h) = self.history.as_deref_mut() {
                h.terminate_session();
            }
            info!(path = %self.db_path.display(), "session ended");
        }
        drop(guard);
        // Mappings unmap and the shared file lock releases as the fields
        // drop with the handle.
    }
}

impl<S: PageStore> Drop for SharedStore<S> {
    fn drop(&mut self) {
        self.close_internal();
    }
}

impl<S: PageStore> fmt::Debug for SharedStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStore")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Bootstrap helpers
// ---------------------------------------------------------------------------

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Rebuild the lock file from scratch. Caller holds the exclusive file
/// lock.
fn init_lock_file(file: &File, durability: Durability, history_type: HistoryType) -> Result<()> {
    // Truncate first: if we die half way through, participants that get
    // the shared lock afterwards see a short or zeroed file and reject it.
    // This also resets a poison bit left over from a crashed session.
    file.set_len(0)?;

    let mut block: Box<MaybeUninit<SharedInfo>> = Box::new(MaybeUninit::uninit());
    // The embedded mutexes and condvars are copied into the file in their
    // freshly initialized, unlocked state. Process-shared primitives are
    // never destroyed, so dropping the staging buffer is a plain free.
    let bytes: &[u8] = unsafe {
        ptr::write_bytes(block.as_mut_ptr().cast::<u8>(), 0, SharedInfo::BASE_SIZE);
        SharedInfo::initialize(block.as_mut_ptr(), durability, history_type)?;
        slice::from_raw_parts(block.as_ptr().cast::<u8>(), SharedInfo::BASE_SIZE)
    };
    file.write_all_at(bytes, 0)?;

    // Flag completion through a mapping, as a separate final step over
    // separate system calls, so no reordering can make the flag visible
    // before the body even across a crash.
    let map = FileMap::map(file, SharedInfo::BASE_SIZE)?;
    // Safety: the file now holds a fully written SharedInfo.
    let info = unsafe { &*map.as_ptr().cast::<SharedInfo>() };
    info.init_complete.store(1, Ordering::Release);
    Ok(())
}
