//! Contracts for the external collaborators of the session coordinator.
//!
//! The coordinator owns the lock file and the version ring; everything that
//! touches the data file's contents is delegated through these traits. The
//! page allocator and the snapshot writer live behind [`PageStore`]; change
//! history and replication live behind [`History`].

use std::path::Path;

use loam_error::Result;
use loam_types::HistoryType;

/// Configuration the coordinator hands to [`PageStore::attach_file`].
#[derive(Debug, Clone, Default)]
pub struct AttachConfig {
    /// This participant is starting a new session and may validate and
    /// repair the file; joiners must assume a live session.
    pub session_initiator: bool,
    /// Open without write access. The coordinator always attaches
    /// read-write; the flag is part of the contract for other callers.
    pub read_only: bool,
    /// The file is shared with other participants.
    pub is_shared: bool,
    /// Skip whole-file validation (joiners trust the initiator's).
    pub skip_validate: bool,
    /// Fail if the file does not exist instead of creating it.
    pub no_create: bool,
    /// Discard any existing contents (leftover from a crashed `MemOnly`
    /// session).
    pub clear_file: bool,
    /// Encryption key for the data file, when encryption is in use.
    pub encryption_key: Option<Vec<u8>>,
}

/// What a store reports about a stored snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Persisted snapshot number.
    pub version: u64,
    /// History type recorded in the file.
    pub history_type: HistoryType,
}

/// Result of writing a new snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewSnapshot {
    /// Byte offset of the new snapshot's root node.
    pub top_ref: u64,
    /// Data-file size after the write; readers of this snapshot must not
    /// read past it.
    pub file_size: u64,
}

/// The page allocator and snapshot writer for the data file.
///
/// One implementation instance belongs to exactly one session participant.
/// `attach_file` may return [`LoamError::Retry`] to ask the bootstrap loop
/// to start over (for example when it observes a concurrent session
/// teardown); the coordinator then drops its file lock and re-runs the
/// whole open protocol.
///
/// [`LoamError::Retry`]: loam_error::LoamError::Retry
pub trait PageStore {
    /// Attach to the data file and return the top-ref of its most recent
    /// persisted snapshot (0 for a fresh, empty file).
    fn attach_file(&mut self, path: &Path, cfg: &AttachConfig) -> Result<u64>;

    /// Detach from the data file, releasing mappings without corrupting
    /// anything. Must be safe to call at any point after `attach_file`.
    fn detach_file(&mut self);

    /// Whether `attach_file` succeeded and `detach_file` has not run.
    fn is_attached(&self) -> bool;

    /// Data-file size observed at attach time.
    fn baseline(&self) -> u64;

    /// Version number and stored history type of the snapshot at `top_ref`.
    fn snapshot_info(&self, top_ref: u64) -> Result<SnapshotInfo>;

    /// Format version of the attached file (0 when still undecided).
    fn file_format_version(&self) -> u8;

    /// Format version this store wants the session to run at, given the
    /// session's history type.
    fn target_file_format_version(&self, history_type: HistoryType) -> u8;

    /// Record the session's format without changing file contents (used
    /// when the stored format is still undecided, or after another
    /// participant already upgraded).
    fn adopt_file_format(&mut self, version: u8);

    /// Rewrite the file to `target` format. Called inside an open write
    /// transaction; the surrounding commit persists the result.
    fn upgrade_file_format(&mut self, target: u8) -> Result<()>;

    /// Bind to a snapshot for a transaction. `writable` is true only for
    /// the single write transaction.
    fn bind(&mut self, top_ref: u64, file_size: u64, writable: bool) -> Result<()>;

    /// Release the binding made by [`bind`](Self::bind).
    fn unbind(&mut self);

    /// Move an existing binding to a newer snapshot without releasing it
    /// (after `commit_and_continue_as_read`): discard write-side state,
    /// extend mappings if the file grew, and continue read-only.
    fn rebind(&mut self, top_ref: u64, file_size: u64) -> Result<()>;

    /// Serialize the bound write transaction's dirty state as snapshot
    /// `new_version`. Free space below `oldest_version` may be recycled.
    fn write_snapshot(&mut self, new_version: u64, oldest_version: u64) -> Result<NewSnapshot>;

    /// Synchronous durability barrier on the data file.
    fn sync_to_disk(&mut self) -> Result<()>;
}

/// Change-history / replication collaborator.
///
/// All methods are invoked with the coordinator's locking already in place:
/// session hooks under the control mutex, transaction hooks under the write
/// mutex.
pub trait History {
    /// History type this collaborator maintains.
    fn history_type(&self) -> HistoryType;

    /// A new session is starting at `version`.
    fn initiate_session(&mut self, version: u64) -> Result<()>;

    /// The last participant is leaving the session.
    fn terminate_session(&mut self);

    /// A write transaction began on top of `version`.
    fn initiate_transact(&mut self, version: u64) -> Result<()>;

    /// Seal the changeset for the commit built on `current_version` and
    /// return the version number the commit must publish. On failure the
    /// transaction stays open; the caller is expected to `rollback`.
    fn prepare_commit(&mut self, current_version: u64) -> Result<u64>;

    /// The commit prepared by [`prepare_commit`](Self::prepare_commit) was
    /// published.
    fn finalize_commit(&mut self);

    /// The write transaction was abandoned.
    fn abort_transact(&mut self);

    /// No snapshot below `oldest_version` is pinned anymore; history for
    /// older versions may be discarded.
    fn trim_history(&mut self, oldest_version: u64) -> Result<()>;
}
