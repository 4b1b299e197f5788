use chrono::{DateTime, Duration, Utc};
use slog::{debug, Logger};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::config::StreamNaming;

/// Local registry entries idle longer than this are evicted on access. Log
/// streams in CloudWatch do not expire; only the local bookkeeping goes
/// away, and with it the cached sequence token, which is rediscovered on the
/// next send.
const IDLE_EXPIRY_SECONDS: i64 = 3600;

/// Mutable per-stream protocol state.
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    /// Token returned by the last successful PutLogEvents; echoed on the
    /// next call. Absent before the first success and after re-creation.
    pub sequence_token: Option<String>,
    /// True once the remote stream is confirmed present.
    pub exists_remotely: bool,
}

/// Local view of one remote log stream.
///
/// The `state` mutex is held for the full duration of any PutLogEvents call
/// against this stream: the sequence-token protocol cannot tolerate
/// concurrent writers, so the lock is the cross-writer ordering guarantee.
#[derive(Debug)]
pub(crate) struct LogStream {
    name: String,
    state: Mutex<StreamState>,
}

impl LogStream {
    fn new(name: String) -> LogStream {
        LogStream {
            name,
            state: Mutex::new(StreamState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_state(&self) -> MutexGuard<StreamState> {
        self.state.lock().unwrap()
    }
}

#[derive(Debug)]
struct RegistryEntry {
    stream: Arc<LogStream>,
    last_used: DateTime<Utc>,
}

/// Maps routing tags to log stream state. With a static stream name every
/// tag resolves to the same permanent entry; with a prefix each tag gets its
/// own entry, created on first use and evicted after sitting idle.
///
/// The registry lock covers lookup and insertion only; per-stream mutation
/// happens under the stream's own lock.
#[derive(Debug)]
pub(crate) struct StreamRegistry {
    naming: StreamNaming,
    streams: Mutex<HashMap<String, RegistryEntry>>,
    logger: Logger,
}

impl StreamRegistry {
    pub fn new(naming: StreamNaming, logger: Logger) -> StreamRegistry {
        StreamRegistry {
            naming,
            streams: Mutex::new(HashMap::new()),
            logger,
        }
    }

    /// Resolves the stream for a routing tag.
    pub fn resolve(&self, tag: &str) -> Arc<LogStream> {
        let name = match &self.naming {
            StreamNaming::Static(name) => name.clone(),
            StreamNaming::Prefix(prefix) => format!("{}{}", prefix, tag),
        };

        let mut streams = self.streams.lock().unwrap();
        let now = Utc::now();

        streams.retain(|key, entry| {
            *key == name || now - entry.last_used < Duration::seconds(IDLE_EXPIRY_SECONDS)
        });

        let entry = streams.entry(name).or_insert_with_key(|name| {
            debug!(self.logger, "tracking new log stream"; "log_stream" => name.clone());
            RegistryEntry {
                stream: Arc::new(LogStream::new(name.clone())),
                last_used: now,
            }
        });
        entry.last_used = now;
        Arc::clone(&entry.stream)
    }
}
