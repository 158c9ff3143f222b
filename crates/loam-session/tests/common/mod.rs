//! Shared test fixtures: a file-backed append-only [`PageStore`] and a
//! scripted [`History`].
#![allow(dead_code)]

use std::fs::{File, OpenOptions};
use std::mem;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use loam_error::{LoamError, Result};
use loam_session::store::{AttachConfig, History, NewSnapshot, PageStore, SnapshotInfo};
use loam_types::HistoryType;

const MAGIC: &[u8; 8] = b"LOAMHEAP";
const HEADER_LEN: u64 = 16;
const TOP_REF_OFFSET: u64 = 8;
const BLOB_HEADER_LEN: u64 = 16;

/// Append-only snapshot store over a real file.
///
/// Layout: 16-byte header (`magic`, `top_ref`), followed by snapshot blobs
/// of `[version: u64][len: u64][payload]`. `top_ref` is the offset of the
/// most recent blob, 0 while the file carries no snapshot. Blobs are never
/// rewritten, so a reader bound to `(top_ref, file_size)` keeps seeing its
/// own snapshot no matter how many commits follow.
pub struct HeapStore {
    file: Option<File>,
    baseline: u64,
    bound: Option<Bound>,
    staged: Vec<u8>,
    format: u8,
    target_format: u8,
}

#[derive(Debug, Clone, Copy)]
struct Bound {
    top_ref: u64,
    file_size: u64,
    writable: bool,
}

impl HeapStore {
    pub fn new() -> Self {
        Self::with_format(1, 1)
    }

    /// A store reporting `format` as the current file format and `target`
    /// as the format it wants the session to run at.
    pub fn with_format(format: u8, target: u8) -> Self {
        Self {
            file: None,
            baseline: 0,
            bound: None,
            staged: Vec::new(),
            format,
            target_format: target,
        }
    }

    /// Stage the payload the next commit will write.
    pub fn stage(&mut self, payload: &[u8]) {
        self.staged = payload.to_vec();
    }

    /// Current format as the store sees it.
    pub fn format(&self) -> u8 {
        self.format
    }

    fn file(&self) -> &File {
        self.file.as_ref().expect("store is not attached")
    }

    /// Payload of the snapshot the current transaction is bound to.
    pub fn read_current(&self) -> Vec<u8> {
        let bound = self.bound.expect("no transaction bound");
        if bound.top_ref == 0 {
            return Vec::new();
        }
        let mut header = [0u8; BLOB_HEADER_LEN as usize];
        self.file()
            .read_exact_at(&mut header, bound.top_ref)
            .expect("blob header read");
        let len = u64::from_le_bytes(header[8..16].try_into().unwrap());
        assert!(
            bound.top_ref + BLOB_HEADER_LEN + len <= bound.file_size,
            "blob exceeds the snapshot's file size"
        );
        let mut payload = vec![0u8; len as usize];
        self.file()
            .read_exact_at(&mut payload, bound.top_ref + BLOB_HEADER_LEN)
            .expect("blob payload read");
        payload
    }

    fn read_header_top_ref(&self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.file().read_exact_at(&mut buf, TOP_REF_OFFSET)?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl Default for HeapStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStore for HeapStore {
    fn attach_file(&mut self, path: &Path, cfg: &AttachConfig) -> Result<u64> {
        if cfg.no_create && !path.exists() {
            return Err(LoamError::DatabaseNotFound {
                path: path.to_path_buf(),
            });
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(!cfg.no_create)
            .truncate(false)
            .open(path)?;
        if cfg.clear_file {
            file.set_len(0)?;
        }

        let len = file.metadata()?.len();
        if len == 0 {
            let mut header = [0u8; HEADER_LEN as usize];
            header[..8].copy_from_slice(MAGIC);
            file.write_all_at(&header, 0)?;
        } else {
            let mut magic = [0u8; 8];
            file.read_exact_at(&mut magic, 0)?;
            if &magic != MAGIC {
                return Err(LoamError::invalid_database("bad magic", path));
            }
        }

        self.baseline = file.metadata()?.len();
        self.file = Some(file);
        self.read_header_top_ref()
    }

    fn detach_file(&mut self) {
        self.file = None;
        self.bound = None;
        self.baseline = 0;
    }

    fn is_attached(&self) -> bool {
        self.file.is_some()
    }

    fn baseline(&self) -> u64 {
        self.baseline
    }

    fn snapshot_info(&self, top_ref: u64) -> Result<SnapshotInfo> {
        if top_ref == 0 {
            return Ok(SnapshotInfo {
                version: 1,
                history_type: HistoryType::None,
            });
        }
        let mut buf = [0u8; 8];
        self.file().read_exact_at(&mut buf, top_ref)?;
        Ok(SnapshotInfo {
            version: u64::from_le_bytes(buf),
            history_type: HistoryType::None,
        })
    }

    fn file_format_version(&self) -> u8 {
        self.format
    }

    fn target_file_format_version(&self, _history_type: HistoryType) -> u8 {
        self.target_format
    }

    fn adopt_file_format(&mut self, version: u8) {
        self.format = version;
    }

    fn upgrade_file_format(&mut self, target: u8) -> Result<()> {
        self.format = target;
        Ok(())
    }

    fn bind(&mut self, top_ref: u64, file_size: u64, writable: bool) -> Result<()> {
        self.bound = Some(Bound {
            top_ref,
            file_size,
            writable,
        });
        Ok(())
    }

    fn unbind(&mut self) {
        self.bound = None;
        self.staged.clear();
    }

    fn rebind(&mut self, top_ref: u64, file_size: u64) -> Result<()> {
        self.staged.clear();
        self.bind(top_ref, file_size, false)
    }

    fn write_snapshot(&mut self, new_version: u64, _oldest_version: u64) -> Result<NewSnapshot> {
        let bound = self.bound.expect("write_snapshot without a bound txn");
        assert!(bound.writable, "write_snapshot on a read binding");

        let payload = mem::take(&mut self.staged);
        let top_ref = self.file().metadata()?.len();
        let mut blob = Vec::with_capacity(BLOB_HEADER_LEN as usize + payload.len());
        blob.extend_from_slice(&new_version.to_le_bytes());
        blob.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        blob.extend_from_slice(&payload);
        self.file().write_all_at(&blob, top_ref)?;
        self.file()
            .write_all_at(&top_ref.to_le_bytes(), TOP_REF_OFFSET)?;

        Ok(NewSnapshot {
            top_ref,
            file_size: top_ref + blob.len() as u64,
        })
    }

    fn sync_to_disk(&mut self) -> Result<()> {
        self.file().sync_all()?;
        Ok(())
    }
}

/// A [`History`] that records every hook invocation and can be told to
/// fail `prepare_commit`.
pub struct TestHistory {
    htype: HistoryType,
    fail_prepare: bool,
    pub events: Arc<Mutex<Vec<String>>>,
}

impl TestHistory {
    pub fn new(htype: HistoryType) -> Self {
        Self {
            htype,
            fail_prepare: false,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing_prepare(htype: HistoryType) -> Self {
        Self {
            fail_prepare: true,
            ..Self::new(htype)
        }
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

impl History for TestHistory {
    fn history_type(&self) -> HistoryType {
        self.htype
    }

    fn initiate_session(&mut self, version: u64) -> Result<()> {
        self.record(format!("initiate_session({version})"));
        Ok(())
    }

    fn terminate_session(&mut self) {
        self.record("terminate_session");
    }

    fn initiate_transact(&mut self, version: u64) -> Result<()> {
        self.record(format!("initiate_transact({version})"));
        Ok(())
    }

    fn prepare_commit(&mut self, current_version: u64) -> Result<u64> {
        self.record(format!("prepare_commit({current_version})"));
        if self.fail_prepare {
            return Err(LoamError::internal("prepare_commit told to fail"));
        }
        Ok(current_version + 1)
    }

    fn finalize_commit(&mut self) {
        self.record("finalize_commit");
    }

    fn abort_transact(&mut self) {
        self.record("abort_transact");
    }

    fn trim_history(&mut self, oldest_version: u64) -> Result<()> {
        self.record(format!("trim_history({oldest_version})"));
        Ok(())
    }
}
