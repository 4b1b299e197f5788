use serde::Serialize;
use serde_json::{Map, Value};
use slog::{debug, warn, Logger};

use crate::{
    batch::{EVENT_OVERHEAD_BYTES, MAX_BATCH_PAYLOAD_BYTES, PAYLOAD_FOOTER_BYTES},
    config::LogFormat,
};

/// CloudWatch refuses events older than 14 days.
const MAX_EVENT_AGE_MILLIS: i64 = 14 * 24 * 3600 * 1000;

/// CloudWatch refuses events more than 2 hours in the future.
const MAX_EVENT_SKEW_MILLIS: i64 = 2 * 3600 * 1000;

/// Initial per-flush event capacity; the vector grows on demand.
const EVENTS_INITIAL_CAPACITY: usize = 5000;

/// A record timestamp as delivered by the host: whole seconds plus a
/// nanosecond remainder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecordTime {
    pub seconds: i64,
    pub nanos: u32,
}

impl RecordTime {
    pub fn millis(&self) -> i64 {
        self.seconds * 1000 + i64::from(self.nanos) / 1_000_000
    }
}

/// One decoded record from the host's batch: a timestamp and a map of
/// key/value fields. The host's wire encoding has already been unpacked by
/// the time records reach the sink.
#[derive(Clone, Debug)]
pub struct Record {
    pub timestamp: RecordTime,
    pub fields: Map<String, Value>,
}

/// A single log event in PutLogEvents form.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct LogEvent {
    /// Milliseconds since the UNIX epoch.
    pub timestamp: i64,
    /// The serialized record, or the value at the configured log key.
    pub message: String,
}

impl LogEvent {
    /// The size this event contributes to a PutLogEvents payload.
    pub(crate) fn payload_size(&self) -> usize {
        self.message.len() + EVENT_OVERHEAD_BYTES
    }
}

/// Converts the host's records into log events, dropping records the remote
/// API would refuse: timestamps outside the ingestion window, messages that
/// can never fit in a request, and records without a usable value at the
/// configured log key. Output order matches input order; the caller sorts.
pub(crate) fn decode_records(
    records: &[Record],
    log_format: LogFormat,
    log_key: Option<&str>,
    logger: &Logger,
) -> Vec<LogEvent> {
    let now = chrono::Utc::now().timestamp_millis();
    let mut events = Vec::with_capacity(EVENTS_INITIAL_CAPACITY);

    for record in records {
        let timestamp = record.timestamp.millis();
        if timestamp < now - MAX_EVENT_AGE_MILLIS {
            warn!(
                logger, "dropping event older than the 14 day ingestion limit";
                "timestamp" => timestamp,
            );
            continue;
        }
        if timestamp > now + MAX_EVENT_SKEW_MILLIS {
            warn!(
                logger, "dropping event more than 2 hours in the future";
                "timestamp" => timestamp,
            );
            continue;
        }

        let message = match render_message(record, log_format, log_key, logger) {
            Some(message) => message,
            None => continue,
        };

        if message.len() + EVENT_OVERHEAD_BYTES + PAYLOAD_FOOTER_BYTES > MAX_BATCH_PAYLOAD_BYTES {
            warn!(
                logger, "dropping event larger than the maximum request payload";
                "message_bytes" => message.len(),
            );
            continue;
        }

        events.push(LogEvent { timestamp, message });
    }

    events
}

fn render_message(
    record: &Record,
    log_format: LogFormat,
    log_key: Option<&str>,
    logger: &Logger,
) -> Option<String> {
    if let Some(log_key) = log_key {
        return match record.fields.get(log_key) {
            Some(Value::String(message)) if !message.is_empty() => Some(message.clone()),
            Some(Value::String(_)) | None => {
                debug!(
                    logger, "skipping event without a usable value at the log key";
                    "log_key" => log_key,
                );
                None
            }
            Some(_) => {
                debug!(
                    logger, "skipping event whose log key value is not a string";
                    "log_key" => log_key,
                );
                None
            }
        };
    }

    match log_format {
        // Both formats ship the record as a serialized JSON object; EMF is a
        // payload convention CloudWatch interprets on ingestion.
        LogFormat::Json | LogFormat::JsonEmf => match serde_json::to_string(&record.fields) {
            Ok(message) => Some(message),
            Err(error) => {
                debug!(logger, "skipping unserializable record"; "error" => %error);
                None
            }
        },
    }
}
