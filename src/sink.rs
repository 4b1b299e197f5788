use slog::{debug, error, o, warn, Logger};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    batch::plan_batches,
    cloudwatch::{regional_endpoint, ApiError, CloudWatchLogsClient},
    config::SinkConfig,
    credentials::{AssumeRoleProvider, ChainProvider, ProvideCredentials},
    events::{decode_records, Record},
    parse_url,
    streams::StreamRegistry,
    Error, ErrorClassification,
};

/// What the host should do with the batch it just flushed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushOutcome {
    /// Batch accepted.
    Ok,
    /// Transient failure; the host should redeliver the whole batch.
    Retry,
    /// Permanent failure; the batch is reported and dropped.
    Error,
}

/// The CloudWatch Logs sink.
///
/// One instance serves a plugin instance for its whole lifetime. `flush` may
/// be called concurrently from multiple worker threads with different
/// routing tags; sends into the same stream serialize on that stream's lock.
pub struct CloudWatchSink {
    config: SinkConfig,
    registry: StreamRegistry,
    client: CloudWatchLogsClient,
    group_created: AtomicBool,
    logger: Logger,
}

impl CloudWatchSink {
    /// Builds the credential chain (decorated with STS when a role ARN is
    /// configured), the CloudWatch client and the stream registry.
    pub fn new(config: SinkConfig, parent_logger: &Logger) -> Result<CloudWatchSink, Error> {
        let logger = parent_logger.new(o!(
            "log_group" => config.log_group_name.clone(),
            "region" => config.region.name().to_owned(),
        ));

        let base: Box<dyn ProvideCredentials> = Box::new(ChainProvider::standard(&logger));
        let provider: Arc<dyn ProvideCredentials> = match &config.role_arn {
            Some(role_arn) => Arc::new(AssumeRoleProvider::new(
                base,
                role_arn.clone(),
                &config.region,
                &logger,
            )?),
            None => Arc::from(base),
        };

        // Prime the credential cache once so an obviously broken environment
        // is visible at startup. Not fatal: the first flush retries.
        if let Err(e) = provider.fetch() {
            warn!(
                logger, "unable to obtain AWS credentials at startup, will retry on first flush";
                "error" => %e,
            );
        }

        let endpoint = match &config.endpoint {
            Some(endpoint) if endpoint.contains("://") => parse_url(endpoint.clone())?,
            Some(endpoint) => parse_url(format!("https://{}", endpoint))?,
            None => regional_endpoint("logs", &config.region)?,
        };

        let client = CloudWatchLogsClient::new(
            endpoint,
            config.region.clone(),
            config.log_group_name.clone(),
            provider,
            &logger,
        );
        let registry = StreamRegistry::new(config.stream_naming.clone(), logger.clone());

        Ok(CloudWatchSink {
            config,
            registry,
            client,
            group_created: AtomicBool::new(false),
            logger,
        })
    }

    /// Ships one batch of records for a routing tag. All network I/O happens
    /// synchronously on the calling thread.
    pub fn flush(&self, tag: &str, records: &[Record]) -> FlushOutcome {
        let logger = self.logger.new(o!("tag" => tag.to_owned()));

        let mut events = decode_records(
            records,
            self.config.log_format,
            self.config.log_key.as_deref(),
            &logger,
        );
        if events.is_empty() {
            debug!(logger, "nothing to send");
            return FlushOutcome::Ok;
        }
        // Stable sort: events sharing a timestamp keep their input order
        events.sort_by_key(|event| event.timestamp);

        if self.config.auto_create_group && !self.group_created.load(Ordering::Acquire) {
            match self.client.create_group() {
                Ok(()) => self.group_created.store(true, Ordering::Release),
                Err(e) => {
                    warn!(logger, "failed to create log group"; "error" => %e);
                    return FlushOutcome::Retry;
                }
            }
        }

        let stream = self.registry.resolve(tag);
        // Held for the rest of the flush: the sequence-token protocol
        // forbids concurrent writers to one stream
        let mut state = stream.lock_state();

        if let Err(e) = self.client.ensure_stream(&mut state, stream.name()) {
            return self.report(&logger, e);
        }

        for batch in plan_batches(events) {
            if let Err(e) = self.client.send_batch(stream.name(), &mut state, &batch) {
                return self.report(&logger, e);
            }
        }

        FlushOutcome::Ok
    }

    fn report(&self, logger: &Logger, e: ApiError) -> FlushOutcome {
        if e.is_retryable() {
            warn!(logger, "flush failed, batch should be redelivered"; "error" => %e);
            FlushOutcome::Retry
        } else {
            error!(logger, "flush failed permanently, dropping batch"; "error" => %e);
            FlushOutcome::Error
        }
    }
}
