//! Version-tagged transfer of accessor values between transactions.
//!
//! A [`Handover`] wraps an opaque payload together with the [`VersionId`]
//! of the transaction that exported it. Import succeeds only on a
//! transaction of the same session bound to that exact snapshot; see
//! `SharedStore::export_for_handover` / `import_from_handover`.
//!
//! A handover does not keep its snapshot alive. Callers that need the
//! snapshot held between export and import must pin it separately.

use loam_types::VersionId;

/// An exported value waiting to be imported at the same snapshot.
#[derive(Debug)]
pub struct Handover<T> {
    payload: T,
    version: VersionId,
}

impl<T> Handover<T> {
    pub(crate) fn new(payload: T, version: VersionId) -> Self {
        Self { payload, version }
    }

    /// Snapshot the payload was exported under.
    #[must_use]
    pub fn version(&self) -> VersionId {
        self.version
    }

    pub(crate) fn into_payload(self) -> T {
        self.payload
    }
}
