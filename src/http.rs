use rusoto_core::{signature::SignedRequest, Region};
use slog::{debug, Logger};
use std::{str, time::Duration};
use ureq::{Agent, AgentBuilder};
use url::Url;

use crate::credentials::Credentials;

/// Timeout for calls to AWS service endpoints.
const SERVICE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for link-local metadata endpoints (IMDS, the ECS agent). Those
/// either answer within milliseconds or are absent from the environment
/// entirely, so waiting the full service timeout only delays the fallthrough
/// to the next credential source.
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("failed to dispatch request: {0}")]
    Dispatch(Box<ureq::Error>),
    #[error("failed to read response body: {0}")]
    Body(std::io::Error),
    #[error("generated signature header {0} is not valid UTF-8")]
    HeaderEncoding(String),
}

/// An HTTP response whose body has already been read, regardless of status.
/// Remote error details for AWS APIs live in the body of non-2xx responses,
/// so callers always need both.
#[derive(Clone, Debug)]
pub(crate) struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A synchronous HTTP agent. All requests block the calling thread: response
/// sequencing matters to the callers (sequence tokens, credential exchange),
/// so nothing here may yield to an event loop.
#[derive(Clone, Debug)]
pub(crate) struct HttpAgent {
    agent: Agent,
}

impl HttpAgent {
    /// Agent for AWS service endpoints (CloudWatch Logs, STS).
    pub fn service() -> Self {
        Self {
            agent: AgentBuilder::new().timeout(SERVICE_TIMEOUT).build(),
        }
    }

    /// Agent for link-local metadata endpoints.
    pub fn metadata() -> Self {
        Self {
            agent: AgentBuilder::new().timeout(METADATA_TIMEOUT).build(),
        }
    }

    /// Issues an unsigned request with no body to `url`. `headers` are
    /// attached verbatim.
    pub fn request(
        &self,
        logger: &Logger,
        method: &str,
        url: &Url,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, HttpError> {
        debug!(logger, "issuing request"; "method" => method, "url" => url.as_str());
        let mut request = self.agent.request_url(method, url);
        for (name, value) in headers {
            request = request.set(name, value);
        }
        finish(request.call())
    }

    /// POSTs a form-encoded body without signing it. Used for STS calls that
    /// authenticate with a bearer token in the form itself.
    pub fn post_form(
        &self,
        logger: &Logger,
        url: &Url,
        form: &[(&str, &str)],
    ) -> Result<HttpResponse, HttpError> {
        debug!(logger, "issuing form request"; "url" => url.as_str());
        finish(self.agent.request_url("POST", url).send_form(form))
    }

    /// Signs `body` with SigV4 for `service` in `region` using the provided
    /// credential triple, then POSTs it to `endpoint`. `headers` participate
    /// in the signature.
    pub fn post_signed(
        &self,
        logger: &Logger,
        endpoint: &Url,
        region: &Region,
        service: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
        credentials: &Credentials,
    ) -> Result<HttpResponse, HttpError> {
        let hostname = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_owned(),
            (None, _) => String::new(),
        };

        let mut signed = SignedRequest::new("POST", service, region, endpoint.path());
        signed.set_hostname(Some(hostname));
        for (name, value) in headers {
            signed.add_header(*name, value);
        }
        signed.set_payload(Some(body.clone()));
        signed.sign(&credentials.as_signing_credentials());

        debug!(
            logger, "issuing signed request";
            "service" => service,
            "url" => endpoint.as_str(),
            "payload_bytes" => body.len(),
        );

        let mut request = self.agent.request_url("POST", endpoint);
        for (name, values) in &signed.headers {
            // ureq derives Host and Content-Length itself; the signed values
            // match because the hostname and payload above are the ones sent.
            if name == "host" || name == "content-length" {
                continue;
            }
            for value in values {
                let value = str::from_utf8(value)
                    .map_err(|_| HttpError::HeaderEncoding(name.clone()))?;
                request = request.set(name, value);
            }
        }
        finish(request.send_bytes(&body))
    }
}

/// Collapses ureq's status-as-error convention: any response with a body is
/// a response, only transport failures are errors.
fn finish(result: Result<ureq::Response, ureq::Error>) -> Result<HttpResponse, HttpError> {
    match result {
        Ok(response) => read_response(response),
        Err(ureq::Error::Status(_, response)) => read_response(response),
        Err(error @ ureq::Error::Transport(_)) => Err(HttpError::Dispatch(Box::new(error))),
    }
}

fn read_response(response: ureq::Response) -> Result<HttpResponse, HttpError> {
    let status = response.status();
    let body = response.into_string().map_err(HttpError::Body)?;
    Ok(HttpResponse { status, body })
}
