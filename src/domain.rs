use crate::error::RequestError;
use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// device identifier as sent by the node; partition key for all state
pub type DeviceId = i64;

/// format of the timestamp column in every log line
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// a measurement value passed through exactly as the node sent it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Measurement(String);

impl Measurement {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(Self(n.to_string())),
            Value::String(s) => {
                let s = s.trim();
                match s.parse::<f64>() {
                    Ok(v) if v.is_finite() => Some(Self(s.to_string())),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// one sensor reading from a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reading {
    pub device_id: DeviceId,
    /// device-assigned counter; may wrap, repeat or arrive out of order
    pub sequence: i64,
    /// battery voltage (`volt`)
    pub voltage: Option<Measurement>,
    /// temperature (`temp`)
    pub temperature: Option<Measurement>,
    /// radio signal strength (`rssi`)
    pub signal_strength: Option<Measurement>,
}

/// one element of a batch's `data` array after parsing
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchEntry {
    Reading(Reading),
    /// skipped without failing the batch; carries the reason for logging
    Malformed(&'static str),
}

impl BatchEntry {
    pub fn from_json(entry: &Value) -> Self {
        let Some(fields) = entry.as_object() else {
            return BatchEntry::Malformed("entry is not an object");
        };
        let Some(device_id) = fields.get("id").and_then(as_integer) else {
            return BatchEntry::Malformed("missing or non-numeric id");
        };
        let Some(sequence) = fields.get("seq").and_then(as_integer) else {
            return BatchEntry::Malformed("missing or non-numeric seq");
        };

        let measurement = |key: &str| fields.get(key).and_then(Measurement::from_json);

        BatchEntry::Reading(Reading {
            device_id,
            sequence,
            voltage: measurement("volt"),
            temperature: measurement("temp"),
            signal_strength: measurement("rssi"),
        })
    }
}

/// integers, integral floats and integer strings are all accepted
fn as_integer(value: &Value) -> Option<i64> {
    match value {
        // `i64::MAX as f64` rounds up to 2^63, which is already out of range
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// last sequence durably accepted for a device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Watermark {
    /// nothing ever accepted for this device
    Absent,
    At(i64),
}

impl Watermark {
    /// only an exact match with the last accepted sequence is a duplicate
    pub fn is_duplicate(&self, sequence: i64) -> bool {
        matches!(self, Watermark::At(last) if *last == sequence)
    }
}

/// an accepted reading as it is written to the logs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: NaiveDateTime,
    pub device_id: DeviceId,
    pub voltage: Option<Measurement>,
    pub temperature: Option<Measurement>,
    pub signal_strength: Option<Measurement>,
    pub sequence: i64,
}

impl LogRecord {
    pub fn new(reading: &Reading, timestamp: NaiveDateTime) -> Self {
        Self {
            timestamp,
            device_id: reading.device_id,
            voltage: reading.voltage.clone(),
            temperature: reading.temperature.clone(),
            signal_strength: reading.signal_strength.clone(),
            sequence: reading.sequence,
        }
    }

    /// `timestamp,deviceId,voltage,temperature,signalStrength,sequence\n`
    pub fn to_line(&self) -> String {
        fn field(m: &Option<Measurement>) -> String {
            m.as_ref().map(ToString::to_string).unwrap_or_default()
        }

        format!(
            "{},{},{},{},{},{}\n",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.device_id,
            field(&self.voltage),
            field(&self.temperature),
            field(&self.signal_strength),
            self.sequence,
        )
    }
}

/// what happened to one batch entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    Accepted,
    Duplicate,
    Skipped,
}

/// per-entry outcomes of one batch, in submission order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub outcomes: Vec<ProcessOutcome>,
}

impl BatchSummary {
    fn count(&self, wanted: ProcessOutcome) -> usize {
        self.outcomes.iter().filter(|o| **o == wanted).count()
    }

    pub fn accepted(&self) -> usize {
        self.count(ProcessOutcome::Accepted)
    }

    pub fn duplicates(&self) -> usize {
        self.count(ProcessOutcome::Duplicate)
    }

    pub fn skipped(&self) -> usize {
        self.count(ProcessOutcome::Skipped)
    }
}

/// the request envelope: `{"count": n, "data": [...]}`
#[derive(Clone, Debug, PartialEq)]
pub struct IngestRequest {
    /// reported by the sender, informational only
    pub count: f64,
    pub entries: Vec<BatchEntry>,
}

impl IngestRequest {
    pub fn from_slice(body: &[u8]) -> Result<Self, RequestError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| RequestError::InvalidJson(e.to_string()))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, RequestError> {
        let fields = value.as_object().ok_or(RequestError::NotAnObject)?;

        let count = match fields.get("count") {
            Some(Value::Number(n)) => n.as_f64().filter(|v| v.is_finite()),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
        .ok_or(RequestError::BadCount)?;

        let data = fields
            .get("data")
            .and_then(Value::as_array)
            .ok_or(RequestError::BadData)?;

        Ok(Self {
            count,
            entries: data.iter().map(BatchEntry::from_json).collect(),
        })
    }
}

/// response body of the ingest endpoint
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct IngestResponse {
    /// readings newly accepted from this batch
    pub update: usize,
}
