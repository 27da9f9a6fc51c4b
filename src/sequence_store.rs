//! ==============================================================================
//! sequence_store.rs - durable per-device watermarks
//! ==============================================================================
//!
//! purpose:
//!     remembers, for every device, the sequence number of the last reading
//!     that was accepted. the batch processor consults it before every
//!     acceptance decision and overwrites it right after.
//!
//! implementations:
//!     - FileSequenceStore: one `{prefix}_{id}.seq` text file per device.
//!     - MemorySequenceStore: a map in process memory (tests, dry runs).
//!
//! contract:
//!     - `get` on an unknown device is `Watermark::Absent`, not an error.
//!     - `set` is durable before it returns. a crash right after must not
//!       let the same reading be accepted again on retry.
//!
//! ==============================================================================

use crate::domain::{DeviceId, Watermark};
use crate::error::StorageError;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Watermark persistence used by the batch processor.
pub trait SequenceStore: Send + Sync {
    fn get(&self, device_id: DeviceId) -> Result<Watermark, StorageError>;
    fn set(&self, device_id: DeviceId, sequence: i64) -> Result<(), StorageError>;
}

// ==============================================================================
// FILE IMPLEMENTATION
// ==============================================================================

pub struct FileSequenceStore {
    dir: PathBuf,
    prefix: String,
}

impl FileSequenceStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn path_for(&self, device_id: DeviceId) -> PathBuf {
        self.dir.join(format!("{}_{}.seq", self.prefix, device_id))
    }
}

impl SequenceStore for FileSequenceStore {
    fn get(&self, device_id: DeviceId) -> Result<Watermark, StorageError> {
        let path = self.path_for(device_id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Watermark::Absent),
            Err(e) => return Err(StorageError::io(&path, e)),
        };

        content
            .trim()
            .parse::<i64>()
            .map(Watermark::At)
            .map_err(|_| StorageError::CorruptWatermark { path, content })
    }

    fn set(&self, device_id: DeviceId, sequence: i64) -> Result<(), StorageError> {
        let path = self.path_for(device_id);
        let tmp = path.with_extension("seq.tmp");

        // write-fsync-rename so a reader only ever sees the old or the new value
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| StorageError::io(&tmp, e))?;
        file.write_all(sequence.to_string().as_bytes())
            .map_err(|e| StorageError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StorageError::io(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &path).map_err(|e| StorageError::io(&path, e))?;
        sync_dir(&self.dir)
    }
}

/// makes a rename inside `dir` durable
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StorageError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StorageError::io(dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StorageError> {
    Ok(())
}

// ==============================================================================
// MEMORY IMPLEMENTATION
// ==============================================================================

#[derive(Default)]
pub struct MemorySequenceStore {
    watermarks: Mutex<HashMap<DeviceId, i64>>,
}

impl MemorySequenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SequenceStore for MemorySequenceStore {
    fn get(&self, device_id: DeviceId) -> Result<Watermark, StorageError> {
        let watermarks = self.watermarks.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(watermarks
            .get(&device_id)
            .copied()
            .map_or(Watermark::Absent, Watermark::At))
    }

    fn set(&self, device_id: DeviceId, sequence: i64) -> Result<(), StorageError> {
        let mut watermarks = self.watermarks.lock().map_err(|_| StorageError::Poisoned)?;
        watermarks.insert(device_id, sequence);
        Ok(())
    }
}
