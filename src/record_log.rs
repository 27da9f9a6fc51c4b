//! ==============================================================================
//! record_log.rs - append-only csv logs of accepted readings
//! ==============================================================================
//!
//! purpose:
//!     every accepted reading becomes one line in two logs:
//!     - the device's own log     `{prefix}_{id}.csv`
//!     - the combined log         `{prefix}_all.csv`
//!     lines are only ever appended, in acceptance order.
//!
//! implementations:
//!     - FileRecordLog: the csv files above, fsynced per record.
//!     - MemoryRecordLog: vectors in process memory (tests, dry runs).
//!
//! torn lines:
//!     a crash in the middle of a write can leave a partial last line. the
//!     first time this process touches a log file it cuts the file back to
//!     its last complete line, so the next record starts on a clean line.
//!
//! ==============================================================================

use crate::domain::{DeviceId, LogRecord};
use crate::error::StorageError;
use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Append-only persistence of accepted readings.
pub trait RecordLog: Send + Sync {
    /// writes `record` to the device log and then to the combined log
    fn append(&self, record: &LogRecord) -> Result<(), StorageError>;
}

// ==============================================================================
// FILE IMPLEMENTATION
// ==============================================================================

pub struct FileRecordLog {
    dir: PathBuf,
    prefix: String,
    /// serializes combined-log writes coming from different devices
    combined: Mutex<()>,
    /// log files already checked for a torn tail
    verified: Mutex<HashSet<PathBuf>>,
}

impl FileRecordLog {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            combined: Mutex::new(()),
            verified: Mutex::new(HashSet::new()),
        }
    }

    pub fn device_path(&self, device_id: DeviceId) -> PathBuf {
        self.dir.join(format!("{}_{}.csv", self.prefix, device_id))
    }

    pub fn combined_path(&self) -> PathBuf {
        self.dir.join(format!("{}_all.csv", self.prefix))
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<(), StorageError> {
        self.verify_once(path)?;

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| {
                file.write_all(line.as_bytes())?;
                file.sync_data()
            });

        if let Err(e) = result {
            // a failed write may have left a partial line behind
            if let Ok(mut verified) = self.verified.lock() {
                verified.remove(path);
            }
            return Err(StorageError::io(path, e));
        }
        Ok(())
    }

    fn verify_once(&self, path: &Path) -> Result<(), StorageError> {
        let mut verified = self.verified.lock().map_err(|_| StorageError::Poisoned)?;
        if verified.contains(path) {
            return Ok(());
        }
        repair_torn_tail(path)?;
        verified.insert(path.to_path_buf());
        Ok(())
    }
}

impl RecordLog for FileRecordLog {
    fn append(&self, record: &LogRecord) -> Result<(), StorageError> {
        let line = record.to_line();
        self.append_line(&self.device_path(record.device_id), &line)?;

        let _guard = self.combined.lock().map_err(|_| StorageError::Poisoned)?;
        self.append_line(&self.combined_path(), &line)
    }
}

/// Truncates `path` back to its last complete line.
///
/// Returns the number of bytes removed. A missing file is left alone.
pub fn repair_torn_tail(path: &Path) -> Result<u64, StorageError> {
    let io = |e: std::io::Error| StorageError::io(path, e);

    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io(e)),
    };

    let len = file.metadata().map_err(io)?.len();
    if len == 0 {
        return Ok(0);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1)).map_err(io)?;
    file.read_exact(&mut last).map_err(io)?;
    if last[0] == b'\n' {
        return Ok(0);
    }

    // walk backwards to the last newline
    let mut buf = [0u8; 4096];
    let mut end = len;
    let keep = loop {
        if end == 0 {
            break 0;
        }
        let start = end.saturating_sub(buf.len() as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start)).map_err(io)?;
        file.read_exact(chunk).map_err(io)?;
        if let Some(i) = chunk.iter().rposition(|b| *b == b'\n') {
            break start + i as u64 + 1;
        }
        end = start;
    };

    file.set_len(keep).map_err(io)?;
    file.sync_all().map_err(io)?;

    let removed = len - keep;
    tracing::warn!(path = %path.display(), removed, "[LOG] truncated torn trailing line");
    Ok(removed)
}

// ==============================================================================
// MEMORY IMPLEMENTATION
// ==============================================================================

#[derive(Default)]
struct MemoryLogs {
    combined: Vec<LogRecord>,
    per_device: HashMap<DeviceId, Vec<LogRecord>>,
}

#[derive(Default)]
pub struct MemoryRecordLog {
    logs: Mutex<MemoryLogs>,
}

impl MemoryRecordLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// all records in acceptance order
    #[cfg(test)]
    pub fn combined(&self) -> Vec<LogRecord> {
        self.logs
            .lock()
            .map(|logs| logs.combined.clone())
            .unwrap_or_default()
    }

    /// records of one device in acceptance order
    #[cfg(test)]
    pub fn device(&self, device_id: DeviceId) -> Vec<LogRecord> {
        self.logs
            .lock()
            .ok()
            .and_then(|logs| logs.per_device.get(&device_id).cloned())
            .unwrap_or_default()
    }
}

impl RecordLog for MemoryRecordLog {
    fn append(&self, record: &LogRecord) -> Result<(), StorageError> {
        let mut logs = self.logs.lock().map_err(|_| StorageError::Poisoned)?;
        logs.per_device
            .entry(record.device_id)
            .or_default()
            .push(record.clone());
        logs.combined.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BatchEntry, Reading};
    use chrono::NaiveDate;
    use std::fs;

    fn record(device_id: DeviceId, sequence: i64) -> LogRecord {
        let entry = serde_json::json!({
            "id": device_id, "seq": sequence, "volt": 3.7, "temp": 21, "rssi": -60
        });
        let reading: Reading = match BatchEntry::from_json(&entry) {
            BatchEntry::Reading(r) => r,
            other => panic!("unexpected {:?}", other),
        };
        let ts = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        LogRecord::new(&reading, ts)
    }

    #[test]
    fn file_log_writes_device_and_combined() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileRecordLog::new(dir.path(), "node");

        log.append(&record(1, 10)).unwrap();
        log.append(&record(2, 4)).unwrap();
        log.append(&record(1, 11)).unwrap();

        let dev1 = fs::read_to_string(dir.path().join("node_1.csv")).unwrap();
        assert_eq!(
            dev1,
            "2024-01-02 03:04:05,1,3.7,21,-60,10\n2024-01-02 03:04:05,1,3.7,21,-60,11\n"
        );
        let dev2 = fs::read_to_string(dir.path().join("node_2.csv")).unwrap();
        assert_eq!(dev2, "2024-01-02 03:04:05,2,3.7,21,-60,4\n");

        let all = fs::read_to_string(log.combined_path()).unwrap();
        let seqs: Vec<&str> = all.lines().map(|l| l.rsplit(',').next().unwrap()).collect();
        assert_eq!(seqs, vec!["10", "4", "11"]);
    }

    #[test]
    fn file_log_appends_to_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("node_all.csv"), "old line\n").unwrap();

        let log = FileRecordLog::new(dir.path(), "node");
        log.append(&record(5, 1)).unwrap();

        let all = fs::read_to_string(dir.path().join("node_all.csv")).unwrap();
        assert_eq!(all, "old line\n2024-01-02 03:04:05,5,3.7,21,-60,1\n");
    }

    #[test]
    fn torn_tail_is_cut_before_next_append() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("node_1.csv"), "complete\n2024-01-02 03:0").unwrap();
        fs::write(dir.path().join("node_all.csv"), "partial without newline").unwrap();

        let log = FileRecordLog::new(dir.path(), "node");
        log.append(&record(1, 2)).unwrap();

        let dev = fs::read_to_string(dir.path().join("node_1.csv")).unwrap();
        assert_eq!(dev, "complete\n2024-01-02 03:04:05,1,3.7,21,-60,2\n");
        let all = fs::read_to_string(dir.path().join("node_all.csv")).unwrap();
        assert_eq!(all, "2024-01-02 03:04:05,1,3.7,21,-60,2\n");
    }

    #[test]
    fn repair_handles_long_partial_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.csv");
        let tail = "x".repeat(10_000);
        fs::write(&path, format!("keep\n{}", tail)).unwrap();

        assert_eq!(repair_torn_tail(&path).unwrap(), 10_000);
        assert_eq!(fs::read_to_string(&path).unwrap(), "keep\n");
        assert_eq!(repair_torn_tail(&path).unwrap(), 0);
        assert_eq!(repair_torn_tail(&dir.path().join("absent.csv")).unwrap(), 0);
    }

    #[test]
    fn failed_write_rechecks_tail_on_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("node_1.csv");
        let log = FileRecordLog::new(dir.path(), "node");

        log.append(&record(1, 1)).unwrap();

        // a directory in place of the log makes the next write fail
        fs::remove_file(&device).unwrap();
        fs::create_dir(&device).unwrap();
        assert!(matches!(
            log.append(&record(1, 2)),
            Err(StorageError::Io { .. })
        ));

        // the failed write left a partial line behind
        fs::remove_dir(&device).unwrap();
        fs::write(&device, "2024-01-02 03:04:05,1,3.7,21,-60,1\n2024-01-0").unwrap();

        log.append(&record(1, 3)).unwrap();
        assert_eq!(
            fs::read_to_string(&device).unwrap(),
            "2024-01-02 03:04:05,1,3.7,21,-60,1\n2024-01-02 03:04:05,1,3.7,21,-60,3\n"
        );

        let seqs: Vec<String> = fs::read_to_string(log.combined_path())
            .unwrap()
            .lines()
            .map(|l| l.rsplit(',').next().unwrap().to_string())
            .collect();
        assert_eq!(seqs, vec!["1", "3"]);
    }

    #[test]
    fn file_log_fails_without_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileRecordLog::new(dir.path().join("missing"), "node");
        assert!(matches!(
            log.append(&record(1, 1)),
            Err(StorageError::Io { .. })
        ));
    }

    #[test]
    fn memory_log_keeps_both_views() {
        let log = MemoryRecordLog::new();
        log.append(&record(1, 1)).unwrap();
        log.append(&record(2, 1)).unwrap();
        log.append(&record(1, 2)).unwrap();

        assert_eq!(log.combined().len(), 3);
        let dev1: Vec<i64> = log.device(1).iter().map(|r| r.sequence).collect();
        assert_eq!(dev1, vec![1, 2]);
        assert!(log.device(3).is_empty());
    }
}
