//! Small value types shared across the loamdb crates.

use std::fmt;

/// Identity of a snapshot as seen by one session.
///
/// The `version` is the global, monotonically increasing snapshot number.
/// The `index` names the version-ring slot that carried the snapshot when it
/// was pinned; it is only meaningful within the session that produced it and
/// is required to re-locate (and re-pin) the same snapshot later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionId {
    /// Snapshot sequence number.
    pub version: u64,
    /// Ring slot index the snapshot occupied when observed.
    pub index: u32,
}

impl VersionId {
    /// Create a version id from a snapshot number and ring slot index.
    #[must_use]
    pub const fn new(version: u64, index: u32) -> Self {
        Self { version, index }
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.version, self.index)
    }
}

/// Durability level of a session.
///
/// Fixed when the session is started; every joining participant must use
/// the same level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u16)]
pub enum Durability {
    /// Synchronous durability barrier on every commit.
    #[default]
    Full = 0,
    /// The data file is backing store only; it is deleted when the last
    /// participant closes and never flushed deliberately.
    MemOnly = 1,
    /// Commits become durable asynchronously via an external daemon.
    Async = 2,
}

impl Durability {
    /// Raw wire value stored in the lock file.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for Durability {
    type Error = InvalidDurability;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Full),
            1 => Ok(Self::MemOnly),
            2 => Ok(Self::Async),
            other => Err(InvalidDurability(other)),
        }
    }
}

impl fmt::Display for Durability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Full => "Full",
            Self::MemOnly => "MemOnly",
            Self::Async => "Async",
        };
        f.write_str(name)
    }
}

/// Error returned when a lock file carries an unknown durability value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidDurability(pub u16);

impl fmt::Display for InvalidDurability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown durability value {}", self.0)
    }
}

impl std::error::Error for InvalidDurability {}

/// Kind of change history attached to the data file.
///
/// Fixed per session, like [`Durability`]. The stored value lives in the
/// data file and constrains which history types may start a session on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i8)]
pub enum HistoryType {
    /// No history is kept.
    #[default]
    None = 0,
    /// History kept outside the data file.
    OutOfBand = 1,
    /// History kept inside the data file.
    InFile = 2,
    /// Synchronization history for a remote-sync client.
    Sync = 3,
}

impl HistoryType {
    /// Raw wire value stored in the lock file.
    #[must_use]
    pub const fn as_i8(self) -> i8 {
        self as i8
    }

    /// Whether a session requesting `self` may start on a file whose stored
    /// history type is `stored`.
    ///
    /// Upgrading from `None` is permitted where the target history can be
    /// built from scratch: `InFile` accepts a fresh file, and `Sync` accepts
    /// a fresh file only when it is still empty (`top_ref == 0`).
    #[must_use]
    pub const fn accepts_stored(self, stored: Self, top_ref: u64) -> bool {
        match self {
            Self::None | Self::OutOfBand => matches!(stored, Self::None),
            Self::InFile => matches!(stored, Self::InFile | Self::None),
            Self::Sync => match stored {
                Self::Sync => true,
                Self::None => top_ref == 0,
                _ => false,
            },
        }
    }
}

impl TryFrom<i8> for HistoryType {
    type Error = InvalidHistoryType;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::OutOfBand),
            2 => Ok(Self::InFile),
            3 => Ok(Self::Sync),
            other => Err(InvalidHistoryType(other)),
        }
    }
}

/// Error returned when a file carries an unknown history-type value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidHistoryType(pub i8);

impl fmt::Display for InvalidHistoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown history type value {}", self.0)
    }
}

impl std::error::Error for InvalidHistoryType {}

/// Per-handle transaction stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransactStage {
    /// No transaction in progress.
    #[default]
    Ready,
    /// A read transaction is bound to a pinned snapshot.
    Reading,
    /// A write transaction holds the write mutex.
    Writing,
}

impl TransactStage {
    /// Stage name for error reporting.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::Reading => "Reading",
            Self::Writing => "Writing",
        }
    }
}

impl fmt::Display for TransactStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
