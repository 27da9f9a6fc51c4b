//! ==============================================================================
//! processor.rs - dedup and append for one batch
//! ==============================================================================
//!
//! purpose:
//!     walks a batch in submission order and decides, per reading, whether it
//!     is new. a reading is a duplicate only when its sequence equals the
//!     device's current watermark; anything else (older, newer, after a
//!     device reboot) is accepted, appended and becomes the new watermark.
//!
//! per reading:
//!
//!     ┌──────────────┐   lock(device)   ┌──────────────┐
//!     │ BatchEntry   │ ───────────────> │ get watermark│
//!     └──────────────┘                  └──────┬───────┘
//!                                  equal?      │      different?
//!                              ┌───────────────┴──────────────┐
//!                              ▼                              ▼
//!                         Duplicate                  append record
//!                                                    set watermark
//!                                                    Accepted
//!
//! concurrency:
//!     batches run in parallel. the read-decide-append-write sequence for a
//!     device runs under that device's mutex, so two batches carrying the
//!     same reading can never both accept it.
//!
//! ==============================================================================

use crate::domain::{BatchEntry, BatchSummary, DeviceId, LogRecord, ProcessOutcome, Reading};
use crate::error::StorageError;
use crate::record_log::RecordLog;
use crate::sequence_store::SequenceStore;
use chrono::NaiveDateTime;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// source of the timestamp written into each record
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// One mutex per device id, created on first use.
#[derive(Default)]
pub struct DeviceLocks {
    locks: DashMap<DeviceId, Arc<Mutex<()>>>,
}

impl DeviceLocks {
    pub fn handle(&self, device_id: DeviceId) -> Arc<Mutex<()>> {
        self.locks.entry(device_id).or_default().clone()
    }

    /// number of devices seen so far
    pub fn device_count(&self) -> usize {
        self.locks.len()
    }
}

#[derive(Clone)]
pub struct BatchProcessor {
    sequences: Arc<dyn SequenceStore>,
    log: Arc<dyn RecordLog>,
    locks: Arc<DeviceLocks>,
    clock: Clock,
    show_readings: bool,
}

impl BatchProcessor {
    pub fn new(sequences: Arc<dyn SequenceStore>, log: Arc<dyn RecordLog>) -> Self {
        Self {
            sequences,
            log,
            locks: Arc::new(DeviceLocks::default()),
            clock: Arc::new(|| chrono::Local::now().naive_local()),
            show_readings: false,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// log every accepted reading at info instead of debug
    pub fn with_show_readings(mut self, show: bool) -> Self {
        self.show_readings = show;
        self
    }

    pub fn known_devices(&self) -> usize {
        self.locks.device_count()
    }

    /// Applies every entry of a batch in order.
    ///
    /// Malformed entries are skipped. The first storage error aborts the
    /// batch; records accepted before it stay written.
    pub fn process_batch(&self, entries: &[BatchEntry]) -> Result<BatchSummary, StorageError> {
        let mut summary = BatchSummary {
            outcomes: Vec::with_capacity(entries.len()),
        };

        for entry in entries {
            let outcome = match entry {
                BatchEntry::Reading(reading) => self.apply(reading)?,
                BatchEntry::Malformed(reason) => {
                    tracing::debug!(reason, "[INGEST] skipping malformed entry");
                    ProcessOutcome::Skipped
                }
            };
            summary.outcomes.push(outcome);
        }

        Ok(summary)
    }

    /// Applies one reading under its device lock.
    pub fn apply(&self, reading: &Reading) -> Result<ProcessOutcome, StorageError> {
        let lock = self.locks.handle(reading.device_id);
        // the mutex guards no data of its own, so a poisoned one is still usable
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let watermark = self.sequences.get(reading.device_id)?;
        if watermark.is_duplicate(reading.sequence) {
            tracing::debug!(
                device = reading.device_id,
                seq = reading.sequence,
                "[INGEST] duplicate reading"
            );
            return Ok(ProcessOutcome::Duplicate);
        }

        let record = LogRecord::new(reading, (self.clock)());
        self.log.append(&record)?;
        self.sequences.set(reading.device_id, reading.sequence)?;

        if self.show_readings {
            let line = record.to_line();
            tracing::info!(
                device = reading.device_id,
                seq = reading.sequence,
                line = line.trim_end(),
                "[INGEST] accepted"
            );
        } else {
            tracing::debug!(device = reading.device_id, seq = reading.sequence, "[INGEST] accepted");
        }
        Ok(ProcessOutcome::Accepted)
    }
}
