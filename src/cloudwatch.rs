use rusoto_core::Region;
use serde::{Deserialize, Serialize};
use slog::{debug, info, o, warn, Logger};
use std::sync::Arc;
use url::Url;

use crate::{
    batch::EventBatch,
    credentials::{CredentialsError, ProvideCredentials},
    events::LogEvent,
    http::{HttpAgent, HttpError, HttpResponse},
    parse_url,
    streams::StreamState,
    ErrorClassification, UrlParseError,
};

const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const TARGET_PUT_LOG_EVENTS: &str = "Logs_20140328.PutLogEvents";
const TARGET_CREATE_LOG_GROUP: &str = "Logs_20140328.CreateLogGroup";
const TARGET_CREATE_LOG_STREAM: &str = "Logs_20140328.CreateLogStream";

/// Builds the default regional endpoint for an AWS service.
pub fn regional_endpoint(service: &str, region: &Region) -> Result<Url, UrlParseError> {
    parse_url(format!("https://{}.{}.amazonaws.com", service, region.name()))
}

/// Errors from the CloudWatch Logs API, shaped around the host's
/// retry-or-drop decision.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
    #[error("failed to serialize request body: {0}")]
    BodySerialization(serde_json::Error),
    #[error("failed to parse CloudWatch Logs response: {0}")]
    BadResponse(serde_json::Error),
    #[error("CloudWatch Logs throttled the request: {0}")]
    Throttled(String),
    #[error("CloudWatch Logs returned HTTP {status}: {message}")]
    Server { status: u16, message: String },
    #[error("request was not authorized (HTTP {0}), credentials may be stale")]
    Unauthorized(u16),
    #[error("CloudWatch Logs rejected the request with {type_name}: {message}")]
    Rejected { type_name: String, message: String },
    #[error("stream rejected the sequence token twice in a row")]
    SequenceTokenDesync,
    #[error("log stream was reported missing again after re-creation")]
    StreamVanished,
}

impl ErrorClassification for ApiError {
    fn is_retryable(&self) -> bool {
        match self {
            // Transport problems, throttling and server-side failures heal;
            // 401/403 may clear after a credential refresh, and a chain that
            // produced nothing may produce something next flush.
            ApiError::Http(_)
            | ApiError::Credentials(_)
            | ApiError::Throttled(_)
            | ApiError::Server { .. }
            | ApiError::Unauthorized(_) => true,
            // Resending the same bytes cannot fix any of these.
            ApiError::BodySerialization(_)
            | ApiError::BadResponse(_)
            | ApiError::Rejected { .. }
            | ApiError::SequenceTokenDesync
            | ApiError::StreamVanished => false,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PutLogEventsBody<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
    log_events: &'a [LogEvent],
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence_token: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutLogEventsResponse {
    next_sequence_token: Option<String>,
    rejected_log_events_info: Option<serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLogGroupBody<'a> {
    log_group_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLogStreamBody<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
}

/// The JSON 1.1 error body. `__type` is sometimes namespaced
/// (`com.amazonaws.logs#...`); only the trailing code matters.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(rename = "__type", default)]
    type_name: String,
    #[serde(default, alias = "Message")]
    message: Option<String>,
    #[serde(rename = "expectedSequenceToken", default)]
    expected_sequence_token: Option<String>,
}

impl ErrorBody {
    fn parse(response: &HttpResponse) -> ErrorBody {
        serde_json::from_str(&response.body).unwrap_or_default()
    }

    fn code(&self) -> &str {
        self.type_name
            .rsplit('#')
            .next()
            .unwrap_or(&self.type_name)
    }

    fn message(&self) -> String {
        self.message.clone().unwrap_or_default()
    }
}

/// Result of one PutLogEvents attempt: the protocol-level conditions the
/// driver reacts to, as opposed to hard errors.
#[derive(Debug)]
enum PutOutcome {
    Accepted { next_sequence_token: Option<String> },
    InvalidSequenceToken { expected: Option<String> },
    AlreadyAccepted,
    StreamMissing,
}

/// Synchronous CloudWatch Logs client scoped to one log group.
///
/// Callers are responsible for per-stream serialization: `send_batch`
/// mutates the stream state it is handed and must never run concurrently
/// for the same stream.
pub struct CloudWatchLogsClient {
    endpoint: Url,
    region: Region,
    log_group: String,
    agent: HttpAgent,
    provider: Arc<dyn ProvideCredentials>,
    logger: Logger,
}

impl CloudWatchLogsClient {
    pub fn new(
        endpoint: Url,
        region: Region,
        log_group: String,
        provider: Arc<dyn ProvideCredentials>,
        parent_logger: &Logger,
    ) -> CloudWatchLogsClient {
        CloudWatchLogsClient {
            logger: parent_logger.new(o!("log_group" => log_group.clone())),
            endpoint,
            region,
            log_group,
            agent: HttpAgent::service(),
            provider,
        }
    }

    /// Issues one signed JSON 1.1 call, selected by the X-Amz-Target header.
    fn call(&self, target: &str, body: Vec<u8>) -> Result<HttpResponse, ApiError> {
        let credentials = self.provider.fetch()?;
        Ok(self.agent.post_signed(
            &self.logger,
            &self.endpoint,
            &self.region,
            "logs",
            &[("Content-Type", CONTENT_TYPE), ("X-Amz-Target", target)],
            body,
            &credentials,
        )?)
    }

    /// Classifies a failure response that is not part of the sequence-token
    /// protocol.
    fn classify_failure(&self, response: HttpResponse) -> ApiError {
        if response.status == 401 || response.status == 403 {
            // The cached credentials may have expired mid-session. Force a
            // refresh and let the host redeliver the batch.
            if let Err(error) = self.provider.refresh() {
                warn!(self.logger, "credential refresh failed"; "error" => %error);
            }
            return ApiError::Unauthorized(response.status);
        }
        if response.status >= 500 {
            return ApiError::Server {
                status: response.status,
                message: response.body.trim().to_owned(),
            };
        }

        let error = ErrorBody::parse(&response);
        if error.code() == "ThrottlingException" {
            return ApiError::Throttled(error.message());
        }
        ApiError::Rejected {
            type_name: error.code().to_owned(),
            message: error.message(),
        }
    }

    fn put_log_events_once(
        &self,
        stream_name: &str,
        events: &[LogEvent],
        sequence_token: Option<&str>,
    ) -> Result<PutOutcome, ApiError> {
        let body = serde_json::to_vec(&PutLogEventsBody {
            log_group_name: &self.log_group,
            log_stream_name: stream_name,
            log_events: events,
            sequence_token,
        })
        .map_err(ApiError::BodySerialization)?;

        let response = self.call(TARGET_PUT_LOG_EVENTS, body)?;

        if response.is_success() {
            let parsed: PutLogEventsResponse =
                serde_json::from_str(&response.body).map_err(ApiError::BadResponse)?;
            if let Some(rejected) = parsed.rejected_log_events_info {
                warn!(
                    self.logger, "CloudWatch rejected some events in the batch";
                    "log_stream" => stream_name,
                    "rejected_log_events_info" => rejected.to_string(),
                );
            }
            return Ok(PutOutcome::Accepted {
                next_sequence_token: parsed.next_sequence_token,
            });
        }

        if response.status == 400 {
            let error = ErrorBody::parse(&response);
            match error.code() {
                "InvalidSequenceTokenException" => {
                    return Ok(PutOutcome::InvalidSequenceToken {
                        expected: error.expected_sequence_token,
                    })
                }
                "DataAlreadyAcceptedException" => return Ok(PutOutcome::AlreadyAccepted),
                "ResourceNotFoundException" => return Ok(PutOutcome::StreamMissing),
                _ => {}
            }
        }

        Err(self.classify_failure(response))
    }

    /// Sends one sub-batch, driving the sequence-token protocol: an invalid
    /// token is replaced by the remote's expected token and the batch is
    /// retried once; a missing stream is re-created and the batch retried
    /// once; a duplicate delivery is skipped.
    pub(crate) fn send_batch(
        &self,
        stream_name: &str,
        state: &mut StreamState,
        batch: &EventBatch,
    ) -> Result<(), ApiError> {
        let mut token_retried = false;
        let mut create_retried = false;

        loop {
            let outcome =
                self.put_log_events_once(stream_name, &batch.events, state.sequence_token.as_deref())?;

            match outcome {
                PutOutcome::Accepted {
                    next_sequence_token,
                } => {
                    state.sequence_token = next_sequence_token;
                    debug!(
                        self.logger, "sent events";
                        "log_stream" => stream_name,
                        "event_count" => batch.events.len(),
                        "payload_bytes" => batch.payload_bytes,
                    );
                    return Ok(());
                }
                PutOutcome::AlreadyAccepted => {
                    info!(
                        self.logger, "batch was already accepted, skipping";
                        "log_stream" => stream_name,
                    );
                    return Ok(());
                }
                PutOutcome::InvalidSequenceToken { expected } => {
                    if token_retried {
                        return Err(ApiError::SequenceTokenDesync);
                    }
                    token_retried = true;
                    debug!(
                        self.logger, "adopting expected sequence token";
                        "log_stream" => stream_name,
                    );
                    state.sequence_token = expected;
                }
                PutOutcome::StreamMissing => {
                    if create_retried {
                        return Err(ApiError::StreamVanished);
                    }
                    create_retried = true;
                    warn!(
                        self.logger, "log stream is missing remotely, re-creating";
                        "log_stream" => stream_name,
                    );
                    state.exists_remotely = false;
                    self.ensure_stream(state, stream_name)?;
                }
            }
        }
    }

    /// Idempotent CreateLogStream: an "already exists" answer counts as
    /// created. On success the stream starts over with no sequence token.
    pub(crate) fn ensure_stream(
        &self,
        state: &mut StreamState,
        stream_name: &str,
    ) -> Result<(), ApiError> {
        if state.exists_remotely {
            return Ok(());
        }

        let body = serde_json::to_vec(&CreateLogStreamBody {
            log_group_name: &self.log_group,
            log_stream_name: stream_name,
        })
        .map_err(ApiError::BodySerialization)?;

        let response = self.call(TARGET_CREATE_LOG_STREAM, body)?;
        if response.is_success() || already_exists(&response) {
            info!(self.logger, "created log stream"; "log_stream" => stream_name);
            state.exists_remotely = true;
            state.sequence_token = None;
            return Ok(());
        }
        Err(self.classify_failure(response))
    }

    /// Idempotent CreateLogGroup.
    pub(crate) fn create_group(&self) -> Result<(), ApiError> {
        let body = serde_json::to_vec(&CreateLogGroupBody {
            log_group_name: &self.log_group,
        })
        .map_err(ApiError::BodySerialization)?;

        let response = self.call(TARGET_CREATE_LOG_GROUP, body)?;
        if response.is_success() || already_exists(&response) {
            info!(self.logger, "created log group");
            return Ok(());
        }
        Err(self.classify_failure(response))
    }
}

fn already_exists(response: &HttpResponse) -> bool {
    response.status == 400 && ErrorBody::parse(response).code() == "ResourceAlreadyExistsException"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        credentials::test_support::FakeProvider, events::LogEvent, logging::setup_test_logging,
    };
    use assert_matches::assert_matches;
    use mockito::{mock, Matcher};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn client_at(path: &str, provider: Arc<dyn ProvideCredentials>) -> CloudWatchLogsClient {
        CloudWatchLogsClient::new(
            parse_url(format!("{}{}", mockito::server_url(), path)).unwrap(),
            Region::UsEast1,
            "test-group".to_owned(),
            provider,
            &setup_test_logging(),
        )
    }

    fn one_event_batch(message: &str) -> EventBatch {
        let events = vec![LogEvent {
            timestamp: 1_000,
            message: message.to_owned(),
        }];
        let payload_bytes = events[0].payload_size() + 4;
        EventBatch {
            events,
            payload_bytes,
            oldest_timestamp: 1_000,
            newest_timestamp: 1_000,
        }
    }

    fn put_body(message: &str, sequence_token: Option<&str>) -> serde_json::Value {
        let mut body = json!({
            "logGroupName": "test-group",
            "logStreamName": "test-stream",
            "logEvents": [{"timestamp": 1_000, "message": message}],
        });
        if let Some(token) = sequence_token {
            body["sequenceToken"] = json!(token);
        }
        body
    }

    #[test]
    fn accepted_batch_stores_next_token() {
        let mocked_put = mock("POST", "/put-accepted")
            .match_header("x-amz-target", "Logs_20140328.PutLogEvents")
            .match_header("content-type", "application/x-amz-json-1.1")
            .match_body(Matcher::Json(put_body("hello", None)))
            .with_status(200)
            .with_body(r#"{"nextSequenceToken": "next-token"}"#)
            .expect(1)
            .create();

        let client = client_at("/put-accepted", Arc::new(FakeProvider::succeeding("AKID")));
        let mut state = StreamState {
            sequence_token: None,
            exists_remotely: true,
        };

        client
            .send_batch("test-stream", &mut state, &one_event_batch("hello"))
            .unwrap();

        mocked_put.assert();
        assert_eq!(state.sequence_token.as_deref(), Some("next-token"));
    }

    #[test]
    fn invalid_token_is_adopted_and_retried_once() {
        let mocked_stale = mock("POST", "/put-invalid-token")
            .match_body(Matcher::Json(put_body("hello", Some("stale"))))
            .with_status(400)
            .with_body(
                r#"{"__type": "InvalidSequenceTokenException", "expectedSequenceToken": "expected-token", "message": "The given sequenceToken is invalid."}"#,
            )
            .expect(1)
            .create();
        let mocked_adopted = mock("POST", "/put-invalid-token")
            .match_body(Matcher::Json(put_body("hello", Some("expected-token"))))
            .with_status(200)
            .with_body(r#"{"nextSequenceToken": "after-recovery"}"#)
            .expect(1)
            .create();

        let client = client_at(
            "/put-invalid-token",
            Arc::new(FakeProvider::succeeding("AKID")),
        );
        let mut state = StreamState {
            sequence_token: Some("stale".to_owned()),
            exists_remotely: true,
        };

        client
            .send_batch("test-stream", &mut state, &one_event_batch("hello"))
            .unwrap();

        mocked_stale.assert();
        mocked_adopted.assert();
        assert_eq!(state.sequence_token.as_deref(), Some("after-recovery"));
    }

    #[test]
    fn second_invalid_token_is_fatal() {
        let mocked_put = mock("POST", "/put-desync")
            .with_status(400)
            .with_body(
                r#"{"__type": "InvalidSequenceTokenException", "expectedSequenceToken": "another"}"#,
            )
            .expect(2)
            .create();

        let client = client_at("/put-desync", Arc::new(FakeProvider::succeeding("AKID")));
        let mut state = StreamState {
            sequence_token: Some("stale".to_owned()),
            exists_remotely: true,
        };

        let error = client
            .send_batch("test-stream", &mut state, &one_event_batch("hello"))
            .unwrap_err();
        assert_matches!(error, ApiError::SequenceTokenDesync);
        assert!(!error.is_retryable());
        mocked_put.assert();
    }

    #[test]
    fn duplicate_delivery_is_skipped() {
        let mocked_put = mock("POST", "/put-duplicate")
            .with_status(400)
            .with_body(r#"{"__type": "DataAlreadyAcceptedException", "message": "already in"}"#)
            .expect(1)
            .create();

        let client = client_at("/put-duplicate", Arc::new(FakeProvider::succeeding("AKID")));
        let mut state = StreamState {
            sequence_token: Some("kept".to_owned()),
            exists_remotely: true,
        };

        client
            .send_batch("test-stream", &mut state, &one_event_batch("hello"))
            .unwrap();

        mocked_put.assert();
        // The stored token is whatever the last success established
        assert_eq!(state.sequence_token.as_deref(), Some("kept"));
    }

    #[test]
    fn missing_stream_is_recreated() {
        let mocked_orphan = mock("POST", "/put-missing-stream")
            .match_header("x-amz-target", "Logs_20140328.PutLogEvents")
            .match_body(Matcher::Json(put_body("hello", Some("orphaned"))))
            .with_status(400)
            .with_body(r#"{"__type": "ResourceNotFoundException", "message": "no such stream"}"#)
            .expect(1)
            .create();
        let mocked_create = mock("POST", "/put-missing-stream")
            .match_header("x-amz-target", "Logs_20140328.CreateLogStream")
            .match_body(Matcher::Json(json!({
                "logGroupName": "test-group",
                "logStreamName": "test-stream",
            })))
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create();
        let mocked_retry = mock("POST", "/put-missing-stream")
            .match_header("x-amz-target", "Logs_20140328.PutLogEvents")
            .match_body(Matcher::Json(put_body("hello", None)))
            .with_status(200)
            .with_body(r#"{"nextSequenceToken": "fresh-token"}"#)
            .expect(1)
            .create();

        let client = client_at(
            "/put-missing-stream",
            Arc::new(FakeProvider::succeeding("AKID")),
        );
        let mut state = StreamState {
            sequence_token: Some("orphaned".to_owned()),
            exists_remotely: true,
        };

        client
            .send_batch("test-stream", &mut state, &one_event_batch("hello"))
            .unwrap();

        mocked_orphan.assert();
        mocked_create.assert();
        mocked_retry.assert();
        assert!(state.exists_remotely);
        assert_eq!(state.sequence_token.as_deref(), Some("fresh-token"));
    }

    #[test]
    fn throttling_is_retryable() {
        let mocked_put = mock("POST", "/put-throttled")
            .with_status(400)
            .with_body(r#"{"__type": "ThrottlingException", "message": "slow down"}"#)
            .expect(1)
            .create();

        let client = client_at("/put-throttled", Arc::new(FakeProvider::succeeding("AKID")));
        let mut state = StreamState {
            sequence_token: None,
            exists_remotely: true,
        };

        let error = client
            .send_batch("test-stream", &mut state, &one_event_batch("hello"))
            .unwrap_err();
        assert_matches!(error, ApiError::Throttled(_));
        assert!(error.is_retryable());
        mocked_put.assert();
    }

    #[test]
    fn server_errors_are_retryable() {
        let mocked_put = mock("POST", "/put-5xx")
            .with_status(503)
            .with_body("Service Unavailable")
            .expect(1)
            .create();

        let client = client_at("/put-5xx", Arc::new(FakeProvider::succeeding("AKID")));
        let mut state = StreamState {
            sequence_token: None,
            exists_remotely: true,
        };

        let error = client
            .send_batch("test-stream", &mut state, &one_event_batch("hello"))
            .unwrap_err();
        assert_matches!(error, ApiError::Server { status: 503, .. });
        assert!(error.is_retryable());
        mocked_put.assert();
    }

    #[test]
    fn unauthorized_refreshes_credentials() {
        let mocked_put = mock("POST", "/put-403")
            .with_status(403)
            .with_body(r#"{"__type": "AccessDeniedException"}"#)
            .expect(1)
            .create();

        let provider = Arc::new(FakeProvider::succeeding("AKID"));
        let client = client_at("/put-403", Arc::clone(&provider) as Arc<dyn ProvideCredentials>);
        let mut state = StreamState {
            sequence_token: None,
            exists_remotely: true,
        };

        let error = client
            .send_batch("test-stream", &mut state, &one_event_batch("hello"))
            .unwrap_err();
        assert_matches!(error, ApiError::Unauthorized(403));
        assert!(error.is_retryable());
        // One fetch to sign the request, one more from the forced refresh
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 2);
        mocked_put.assert();
    }

    #[test]
    fn other_client_errors_are_fatal() {
        let mocked_put = mock("POST", "/put-fatal")
            .with_status(400)
            .with_body(
                r#"{"__type": "com.amazonaws.logs#InvalidParameterException", "message": "bad input"}"#,
            )
            .expect(1)
            .create();

        let client = client_at("/put-fatal", Arc::new(FakeProvider::succeeding("AKID")));
        let mut state = StreamState {
            sequence_token: None,
            exists_remotely: true,
        };

        let error = client
            .send_batch("test-stream", &mut state, &one_event_batch("hello"))
            .unwrap_err();
        assert_matches!(error, ApiError::Rejected { ref type_name, .. } => {
            assert_eq!(type_name, "InvalidParameterException");
        });
        assert!(!error.is_retryable());
        mocked_put.assert();
    }

    #[test]
    fn create_group_tolerates_already_exists() {
        let mocked_create = mock("POST", "/group-exists")
            .match_header("x-amz-target", "Logs_20140328.CreateLogGroup")
            .match_body(Matcher::Json(json!({"logGroupName": "test-group"})))
            .with_status(400)
            .with_body(r#"{"__type": "ResourceAlreadyExistsException"}"#)
            .expect(1)
            .create();

        let client = client_at("/group-exists", Arc::new(FakeProvider::succeeding("AKID")));
        client.create_group().unwrap();
        mocked_create.assert();
    }

    #[test]
    fn ensure_stream_is_lazy_and_resets_token() {
        let mocked_create = mock("POST", "/stream-create")
            .match_header("x-amz-target", "Logs_20140328.CreateLogStream")
            .with_status(400)
            .with_body(r#"{"__type": "ResourceAlreadyExistsException"}"#)
            .expect(1)
            .create();

        let client = client_at("/stream-create", Arc::new(FakeProvider::succeeding("AKID")));
        let mut state = StreamState {
            sequence_token: Some("left-over".to_owned()),
            exists_remotely: false,
        };

        client.ensure_stream(&mut state, "test-stream").unwrap();
        assert!(state.exists_remotely);
        assert_eq!(state.sequence_token, None);

        // Confirmed streams are not re-created
        client.ensure_stream(&mut state, "test-stream").unwrap();
        mocked_create.assert();
    }
}
