//! Durable storage for the keeper state record.
//!
//! The record is a fixed-layout little-endian binary file. Writes go to a
//! sibling temporary file which is then renamed over the target, so a crash
//! at any point leaves either the previous record or the new one on disk,
//! never a torn mix.

use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};

use crate::error::{KeeperError, Result};
use crate::node_state::NodeState;
use crate::state::{KeeperState, SYNC_STATE_LEN};

/// On-disk format version. Bump on any layout change; readers reject
/// versions they do not know.
const STATE_FILE_VERSION: u32 = 1;

/// Exact size of an encoded record.
const RECORD_LEN: usize = 4 + 4 + 4 + 8 + 4 + 4 + 4 + 4 + 8 + 8 + 8 + 1 + SYNC_STATE_LEN;

/// Atomic read/write access to the keeper state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// A store backed by the given file path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a state file exists at all.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read and decode the state record.
    ///
    /// # Errors
    ///
    /// Returns `StateCorrupt` when the file is missing, short, trailing
    /// garbage, of an unknown format version, or names an unknown role.
    pub fn read(&self) -> Result<KeeperState> {
        let raw = std::fs::read(&self.path).map_err(|e| self.corrupt(e.to_string()))?;
        self.decode(&raw)
    }

    /// Encode and durably publish the state record.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the sibling temp file cannot be created,
    /// written, synced, or renamed into place.
    pub fn write(&self, state: &KeeperState) -> Result<()> {
        let parent = self.path.parent().ok_or_else(|| {
            KeeperError::Internal(format!("state path {:?} has no parent", self.path))
        })?;

        let mut tmp = tempfile::Builder::new()
            .prefix("pg_autoctl.state.")
            .suffix(".new")
            .tempfile_in(parent)?;

        tmp.write_all(&encode(state))?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| KeeperError::Io(e.error))?;

        Ok(())
    }

    /// Delete the state file, ignoring a file that is already gone.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors other than `NotFound`.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn decode(&self, raw: &[u8]) -> Result<KeeperState> {
        if raw.len() != RECORD_LEN {
            return Err(self.corrupt(format!(
                "expected {RECORD_LEN} bytes, found {}",
                raw.len()
            )));
        }

        let mut buf = raw;

        let version = buf.get_u32_le();
        if version != STATE_FILE_VERSION {
            return Err(self.corrupt(format!("unknown state file version {version}")));
        }

        let pg_version = buf.get_u32_le();
        let pg_control_version = buf.get_u32_le();
        let system_identifier = buf.get_u64_le();
        let current_node_id = buf.get_i32_le();
        let current_group = buf.get_i32_le();

        let current_role = NodeState::from_code(buf.get_i32_le())
            .map_err(|e| self.corrupt(e.to_string()))?;
        let assigned_role = NodeState::from_code(buf.get_i32_le())
            .map_err(|e| self.corrupt(e.to_string()))?;

        let last_monitor_contact = buf.get_u64_le();
        let last_secondary_contact = buf.get_u64_le();
        let xlog_lag_bytes = buf.get_i64_le();
        let pg_is_running = buf.get_u8() != 0;

        let mut sync_bytes = [0u8; SYNC_STATE_LEN];
        buf.copy_to_slice(&mut sync_bytes);
        let end = sync_bytes.iter().position(|b| *b == 0).unwrap_or(SYNC_STATE_LEN);
        let sync_state = std::str::from_utf8(&sync_bytes[..end])
            .map_err(|_| self.corrupt("sync_state is not valid UTF-8".into()))?
            .to_string();

        Ok(KeeperState {
            pg_version,
            pg_control_version,
            system_identifier,
            current_node_id,
            current_group,
            current_role,
            assigned_role,
            last_monitor_contact,
            last_secondary_contact,
            xlog_lag_bytes,
            pg_is_running,
            sync_state,
        })
    }

    fn corrupt(&self, reason: String) -> KeeperError {
        KeeperError::StateCorrupt {
            path: self.path.clone(),
            reason,
        }
    }
}

fn encode(state: &KeeperState) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_LEN);

    buf.put_u32_le(STATE_FILE_VERSION);
    buf.put_u32_le(state.pg_version);
    buf.put_u32_le(state.pg_control_version);
    buf.put_u64_le(state.system_identifier);
    buf.put_i32_le(state.current_node_id);
    buf.put_i32_le(state.current_group);
    buf.put_i32_le(state.current_role.code());
    buf.put_i32_le(state.assigned_role.code());
    buf.put_u64_le(state.last_monitor_contact);
    buf.put_u64_le(state.last_secondary_contact);
    buf.put_i64_le(state.xlog_lag_bytes);
    buf.put_u8(u8::from(state.pg_is_running));

    let mut sync_bytes = [0u8; SYNC_STATE_LEN];
    let src = state.sync_state.as_bytes();
    let len = src.len().min(SYNC_STATE_LEN);
    sync_bytes[..len].copy_from_slice(&src[..len]);
    buf.put_slice(&sync_bytes);

    debug_assert_eq!(buf.len(), RECORD_LEN);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_state::NodeState;

    fn sample() -> KeeperState {
        KeeperState {
            pg_version: 160_004,
            pg_control_version: 1300,
            system_identifier: 7_215_223_639_716_209_244,
            current_node_id: 2,
            current_group: 0,
            current_role: NodeState::Primary,
            assigned_role: NodeState::Primary,
            last_monitor_contact: 1_722_000_000,
            last_secondary_contact: 1_722_000_003,
            xlog_lag_bytes: 512,
            pg_is_running: true,
            sync_state: "sync".into(),
        }
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("pg_autoctl.state"));

        store.write(&sample()).unwrap();
        assert_eq!(store.read().unwrap(), sample());
    }

    #[test]
    fn test_missing_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("pg_autoctl.state"));

        assert!(matches!(
            store.read(),
            Err(KeeperError::StateCorrupt { .. })
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("pg_autoctl.state"));

        let mut raw = encode(&sample());
        raw[0] = 42;
        std::fs::write(store.path(), &raw).unwrap();

        assert!(matches!(
            store.read(),
            Err(KeeperError::StateCorrupt { .. })
        ));
    }

    #[test]
    fn test_unknown_role_code_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("pg_autoctl.state"));

        let mut raw = encode(&sample());
        raw[28..32].copy_from_slice(&99i32.to_le_bytes());
        std::fs::write(store.path(), &raw).unwrap();

        assert!(store.read().is_err());
    }

    #[test]
    fn test_truncated_record_rejected_at_every_offset() {
        // A crash can only ever leave the previous complete record (rename
        // is atomic) or, if someone bypasses the store, a short file. Either
        // way the reader must never hand back a blend of two records.
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("pg_autoctl.state"));
        let raw = encode(&sample());

        for len in 0..raw.len() {
            std::fs::write(store.path(), &raw[..len]).unwrap();
            assert!(store.read().is_err(), "prefix of {len} bytes accepted");
        }
    }

    #[test]
    fn test_overwrite_publishes_new_record_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("pg_autoctl.state"));

        let old = KeeperState::new();
        store.write(&old).unwrap();

        let new = sample();
        store.write(&new).unwrap();

        // No `.new` sibling left behind, and the content is the new record.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
        assert_eq!(store.read().unwrap(), new);
    }

    #[test]
    fn test_long_sync_state_is_truncated_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("pg_autoctl.state"));

        let mut state = sample();
        state.sync_state = "a-very-long-sync-state-value".into();
        store.write(&state).unwrap();

        let read = store.read().unwrap();
        assert_eq!(read.sync_state.len(), SYNC_STATE_LEN);
    }
}
