//! Durable blob storage keyed by rendezvous code.
//!
//! Layout of the data directory:
//! - `.index.bin` - code -> created-at map, the authoritative record of
//!   which blobs exist
//! - `<code>.blob` - metadata record (plus the sealed payload for
//!   single-blob uploads)
//! - `<code>.dat` - sealed chunk frames for chunked uploads, written by the
//!   upload handler and read-only afterwards
//!
//! A blob exists once its code is in the index; the index insert is the
//! commit point of a publish. Any `.blob`/`.dat` file whose code is missing
//! from the index is an orphan and is reaped at start-up.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::diskfree;
use crate::protocol::PayloadFormat;
use crate::{CODE_LENGTH, NONCE_SIZE, TAG_SIZE};

const INDEX_FILENAME: &str = ".index.bin";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("blob encoding: {0}")]
    Codec(#[from] bincode::Error),
}

/// Metadata record for one stored code.
///
/// Chunked blobs keep their ciphertext in the side `.dat` file; single-blob
/// uploads embed nonce and sealed bytes right here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredBlob {
    pub name: String,
    pub plaintext_checksum: [u8; 32],
    pub created_at: SystemTime,
    pub chunked: bool,
    /// Sealed with an externally-held key; this server cannot decrypt it.
    pub secure: bool,
    pub nonce: Option<[u8; NONCE_SIZE]>,
    pub sealed: Option<Vec<u8>>,
    pub total_plain_len: u64,
    pub num_chunks: u32,
}

impl StoredBlob {
    pub fn new_chunked(
        name: String,
        plaintext_checksum: [u8; 32],
        total_plain_len: u64,
        num_chunks: u32,
        secure: bool,
    ) -> Self {
        StoredBlob {
            name,
            plaintext_checksum,
            created_at: SystemTime::now(),
            chunked: true,
            secure,
            nonce: None,
            sealed: None,
            total_plain_len,
            num_chunks,
        }
    }

    pub fn new_single(
        name: String,
        plaintext_checksum: [u8; 32],
        nonce: [u8; NONCE_SIZE],
        sealed: Vec<u8>,
        secure: bool,
    ) -> Self {
        let total_plain_len = (sealed.len() as u64).saturating_sub(TAG_SIZE as u64);
        StoredBlob {
            name,
            plaintext_checksum,
            created_at: SystemTime::now(),
            chunked: false,
            secure,
            nonce: Some(nonce),
            sealed: Some(sealed),
            total_plain_len,
            num_chunks: 0,
        }
    }

    pub fn format(&self) -> PayloadFormat {
        PayloadFormat::new(self.secure, self.chunked)
    }
}

/// On-disk blob store shared by every connection task.
///
/// The in-memory index takes a read lock on lookups and a write lock on
/// publish/remove/sweep. Data files need no locking: each has exactly one
/// writer (its upload handler) and is read-only afterwards.
pub struct Store {
    index: RwLock<HashMap<String, SystemTime>>,
    data_dir: PathBuf,
    storage_duration: Duration,
}

impl Store {
    /// Opens (or creates) the data directory, loads the index, removes
    /// orphaned files and sweeps anything already expired.
    pub fn open(data_dir: impl Into<PathBuf>, storage_duration: Duration) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&data_dir, fs::Permissions::from_mode(0o755))?;
        }
        let store = Store {
            index: RwLock::new(HashMap::new()),
            data_dir,
            storage_duration,
        };
        store.load_index()?;
        store.remove_orphans()?;
        store.sweep_expired();
        Ok(store)
    }

    pub fn blob_path(&self, code: &str) -> PathBuf {
        self.data_dir.join(format!("{code}.blob"))
    }

    pub fn data_path(&self, code: &str) -> PathBuf {
        self.data_dir.join(format!("{code}.dat"))
    }

    fn index_path(&self) -> PathBuf {
        self.data_dir.join(INDEX_FILENAME)
    }

    fn load_index(&self) -> Result<(), StoreError> {
        let bytes = match fs::read(self.index_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let map: HashMap<String, SystemTime> = bincode::deserialize(&bytes)?;
        debug!("loaded index with {} blob(s)", map.len());
        *self.index.write().unwrap() = map;
        Ok(())
    }

    fn save_index_locked(&self, index: &HashMap<String, SystemTime>) -> Result<(), StoreError> {
        let bytes = bincode::serialize(index)?;
        fs::write(self.index_path(), bytes)?;
        Ok(())
    }

    fn remove_orphans(&self) -> Result<(), StoreError> {
        let index = self.index.read().unwrap();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            // Half-written metadata never made it into the index.
            if file_name.ends_with(".blob.tmp") {
                let _ = fs::remove_file(entry.path());
                continue;
            }
            let Some(code) = file_name
                .strip_suffix(".blob")
                .or_else(|| file_name.strip_suffix(".dat"))
            else {
                continue;
            };
            if code.len() != CODE_LENGTH || !code.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            if !index.contains_key(code) {
                debug!("removing orphan {file_name}");
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    /// Publishes a blob under `code`. The metadata record is written to a
    /// temporary and renamed into place; the index insert and rewrite under
    /// the write lock is the commit point. A colliding code is overwritten
    /// (last write wins).
    pub fn publish(&self, code: &str, blob: &StoredBlob) -> Result<(), StoreError> {
        let bytes = bincode::serialize(blob)?;
        let tmp = self.data_dir.join(format!("{code}.blob.tmp"));
        fs::write(&tmp, &bytes)?;
        if let Err(e) = fs::rename(&tmp, self.blob_path(code)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        let mut index = self.index.write().unwrap();
        index.insert(code.to_string(), blob.created_at);
        self.save_index_locked(&index)
    }

    /// True if `code` currently has an index entry (expired or not).
    pub fn contains(&self, code: &str) -> bool {
        self.index.read().unwrap().contains_key(code)
    }

    /// Fetches the metadata record for `code` if it exists and is still
    /// within the retention window. Stale entries are evicted on the spot;
    /// a missing, unreadable or undecodable metadata file reads as absent.
    pub fn lookup(&self, code: &str) -> Option<StoredBlob> {
        let created_at = { self.index.read().unwrap().get(code).copied() }?;
        if self.is_expired(created_at) {
            self.remove(code);
            return None;
        }
        let bytes = fs::read(self.blob_path(code)).ok()?;
        bincode::deserialize(&bytes).ok()
    }

    /// Deletes the blob's files and index entry. Best-effort on the files.
    pub fn remove(&self, code: &str) {
        let _ = fs::remove_file(self.blob_path(code));
        let _ = fs::remove_file(self.data_path(code));
        let mut index = self.index.write().unwrap();
        if index.remove(code).is_some() {
            if let Err(e) = self.save_index_locked(&index) {
                warn!("rewrite index after removing {code}: {e}");
            }
        }
    }

    /// Removes every expired blob. Expired codes are copied out under the
    /// lock, their files deleted, then the index is rewritten once.
    /// Returns how many blobs were removed.
    pub fn sweep_expired(&self) -> usize {
        let expired: Vec<String> = {
            let index = self.index.write().unwrap();
            index
                .iter()
                .filter(|(_, &created_at)| self.is_expired(created_at))
                .map(|(code, _)| code.clone())
                .collect()
        };
        if expired.is_empty() {
            return 0;
        }
        for code in &expired {
            let _ = fs::remove_file(self.blob_path(code));
            let _ = fs::remove_file(self.data_path(code));
        }
        let mut index = self.index.write().unwrap();
        for code in &expired {
            index.remove(code);
        }
        if let Err(e) = self.save_index_locked(&index) {
            warn!("rewrite index after sweep: {e}");
        }
        debug!("swept {} expired blob(s)", expired.len());
        expired.len()
    }

    /// Free bytes on the volume holding the data directory, or
    /// [`crate::FREE_BYTES_UNKNOWN`] when the platform cannot say.
    pub fn free_bytes(&self) -> u64 {
        diskfree::free_bytes(&self.data_dir)
    }

    fn is_expired(&self, created_at: SystemTime) -> bool {
        match created_at.elapsed() {
            Ok(age) => age >= self.storage_duration,
            // Clock moved backwards; keep serving rather than dropping data.
            Err(_) => false,
        }
    }
}
