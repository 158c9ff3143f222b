//! Multi-reader / single-writer session coordinator for loamdb files.
//!
//! Multiple processes and threads attach to the same on-disk data file and
//! to a companion `.lock` file held in shared memory, and cooperatively run
//! transactions over an MVCC snapshot history. This crate owns the lock
//! file: the bootstrap protocol, the lock-free version ring that tracks
//! which snapshots are pinned by live readers, the transaction state
//! machine, the commit pipeline, and the cross-process synchronization
//! primitives. The data file itself is reached through the [`PageStore`]
//! and [`History`] collaborator traits.

pub mod handover;
pub mod layout;
mod map;
pub mod ring;
pub mod session;
pub mod store;
pub mod sync;

pub use handover::Handover;
pub use layout::{offsets, SharedInfo, SHARED_INFO_VERSION};
pub use ring::{RingPtr, VersionEntry, VersionRing, RING_GROW_ENTRIES, RING_INITIAL_ENTRIES};
pub use session::{SessionOptions, SharedStore};
pub use store::{AttachConfig, History, NewSnapshot, PageStore, SnapshotInfo};
pub use sync::{SharedCondVar, SharedMutex, SharedMutexGuard};

pub use loam_error::{LoamError, Result};
pub use loam_types::{Durability, HistoryType, TransactStage, VersionId};
