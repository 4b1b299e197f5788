use std::mem;

use crate::events::LogEvent;

/// The CloudWatch API documents 1,048,576 bytes as the maximum PutLogEvents
/// payload, but requests near that size have been observed to be rejected;
/// 1,000,000 leaves margin.
pub(crate) const MAX_BATCH_PAYLOAD_BYTES: usize = 1_000_000;

/// Maximum number of events in one PutLogEvents request.
pub(crate) const MAX_BATCH_EVENTS: usize = 10_000;

/// Per-event accounting overhead the API charges on top of the message
/// bytes.
pub(crate) const EVENT_OVERHEAD_BYTES: usize = 26;

/// Bytes needed to close out the JSON body of a PutLogEvents request.
pub(crate) const PAYLOAD_FOOTER_BYTES: usize = 4;

/// Events within one request may span at most 24 hours.
pub(crate) const MAX_BATCH_SPAN_MILLIS: i64 = 24 * 3600 * 1000;

/// One API-legal PutLogEvents sub-batch.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct EventBatch {
    pub events: Vec<LogEvent>,
    /// Accounted payload size, including the closing footer.
    pub payload_bytes: usize,
    pub oldest_timestamp: i64,
    pub newest_timestamp: i64,
}

impl EventBatch {
    fn seal(events: Vec<LogEvent>, payload_bytes: usize) -> EventBatch {
        let oldest_timestamp = events.first().map(|e| e.timestamp).unwrap_or_default();
        let newest_timestamp = events.last().map(|e| e.timestamp).unwrap_or_default();
        EventBatch {
            events,
            payload_bytes,
            oldest_timestamp,
            newest_timestamp,
        }
    }
}

/// Greedily partitions a timestamp-sorted event list into sub-batches, each
/// satisfying every PutLogEvents constraint: event count, accounted payload
/// size, and the 24 hour time span. Order is preserved, so concatenating the
/// output reproduces the input.
pub(crate) fn plan_batches(events: Vec<LogEvent>) -> Vec<EventBatch> {
    let mut batches = Vec::new();
    let mut current: Vec<LogEvent> = Vec::new();
    let mut payload_bytes = PAYLOAD_FOOTER_BYTES;
    let mut oldest_timestamp = 0;

    for event in events {
        let over_limit = !current.is_empty()
            && (current.len() >= MAX_BATCH_EVENTS
                || payload_bytes + event.payload_size() > MAX_BATCH_PAYLOAD_BYTES
                || event.timestamp - oldest_timestamp > MAX_BATCH_SPAN_MILLIS);
        if over_limit {
            batches.push(EventBatch::seal(mem::take(&mut current), payload_bytes));
            payload_bytes = PAYLOAD_FOOTER_BYTES;
        }

        if current.is_empty() {
            oldest_timestamp = event.timestamp;
        }
        payload_bytes += event.payload_size();
        current.push(event);
    }

    if !current.is_empty() {
        batches.push(EventBatch::seal(current, payload_bytes));
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(timestamp: i64, message: &str) -> LogEvent {
        LogEvent {
            timestamp,
            message: message.to_owned(),
        }
    }

    fn sized_event(timestamp: i64, message_bytes: usize) -> LogEvent {
        LogEvent {
            timestamp,
            message: "x".repeat(message_bytes),
        }
    }

    #[test]
    fn empty_input() {
        assert!(plan_batches(Vec::new()).is_empty());
    }

    #[test]
    fn single_batch_invariants() {
        let batches = plan_batches(vec![
            event(1_000, "one"),
            event(1_500, "two"),
            event(2_000, "three"),
        ]);

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].events.len(), 3);
        assert_eq!(batches[0].oldest_timestamp, 1_000);
        assert_eq!(batches[0].newest_timestamp, 2_000);
        assert_eq!(
            batches[0].payload_bytes,
            PAYLOAD_FOOTER_BYTES + 3 * EVENT_OVERHEAD_BYTES + "one".len() + "two".len() + "three".len()
        );
    }

    #[test]
    fn event_count_boundary() {
        // Exactly the maximum stays in one request
        let events: Vec<LogEvent> = (0..MAX_BATCH_EVENTS as i64).map(|i| event(i, "m")).collect();
        let batches = plan_batches(events);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].events.len(), MAX_BATCH_EVENTS);

        // One more splits into maximum + 1
        let events: Vec<LogEvent> = (0..MAX_BATCH_EVENTS as i64 + 1)
            .map(|i| event(i, "m"))
            .collect();
        let batches = plan_batches(events);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].events.len(), MAX_BATCH_EVENTS);
        assert_eq!(batches[1].events.len(), 1);
    }

    #[test]
    fn payload_size_boundary() {
        // Two events that exactly reach the ceiling stay together
        let half = (MAX_BATCH_PAYLOAD_BYTES - PAYLOAD_FOOTER_BYTES) / 2 - EVENT_OVERHEAD_BYTES;
        let batches = plan_batches(vec![sized_event(1, half), sized_event(2, half)]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].payload_bytes, MAX_BATCH_PAYLOAD_BYTES);

        // One byte more starts a new batch
        let batches = plan_batches(vec![sized_event(1, half), sized_event(2, half + 1)]);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].events.len(), 1);
        assert_eq!(batches[1].events.len(), 1);
    }

    #[test]
    fn time_span_boundary() {
        // Exactly 24 hours apart stays together
        let batches = plan_batches(vec![event(0, "a"), event(MAX_BATCH_SPAN_MILLIS, "b")]);
        assert_eq!(batches.len(), 1);

        // One millisecond past splits
        let batches = plan_batches(vec![event(0, "a"), event(MAX_BATCH_SPAN_MILLIS + 1, "b")]);
        assert_eq!(batches.len(), 2);

        // The span is measured from each batch's own oldest event
        let batches = plan_batches(vec![
            event(0, "a"),
            event(MAX_BATCH_SPAN_MILLIS + 1, "b"),
            event(MAX_BATCH_SPAN_MILLIS + 2, "c"),
        ]);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].events.len(), 2);
    }

    #[test]
    fn concatenation_reproduces_input() {
        let events: Vec<LogEvent> = (0..25_000)
            .map(|i| event(i * 10, &format!("message-{}", i)))
            .collect();

        let batches = plan_batches(events.clone());
        assert!(batches.len() > 1);

        let concatenated: Vec<LogEvent> = batches
            .into_iter()
            .flat_map(|batch| batch.events)
            .collect();
        assert_eq!(concatenated, events);
    }
}
