use anyhow::{anyhow, Context, Result};
use atty::Stream;
use slog::{o, Drain, Level, LevelFilter, Logger, Never};
use slog_json::Json;
use slog_scope::GlobalLoggerGuard;
use slog_term::{FullFormat, PlainSyncDecorator, TermDecorator, TestStdoutWriter};
use std::{io::stderr, str::FromStr};

/// Where and how the sink writes its own log output.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogOutput {
    /// One JSON object per line on stderr, for collection by a pipeline.
    Json,
    /// Human-readable, colored output for a terminal.
    Terminal,
    /// `Json` when stderr is not a terminal, `Terminal` otherwise.
    Auto,
}

/// Logging options, typically derived from the host runtime's own verbosity
/// settings.
pub struct LogOptions<'a> {
    pub output: LogOutput,
    /// Messages below this slog level are discarded.
    pub level: &'a str,
    /// Plugin version stamped on every message.
    pub version: &'a str,
}

/// Builds the root logger the sink and all of its components log through,
/// and installs it process-wide. The returned guard must be kept alive for
/// as long as logging should keep working; dropping it tears the global
/// logger down.
///
/// Every component derives child loggers from the returned root, adding its
/// own context (`log_group`, `log_stream`, `tag`, `provider`) as key/value
/// pairs.
pub fn init_logging(options: &LogOptions) -> Result<(Logger, GlobalLoggerGuard)> {
    let level = Level::from_str(options.level)
        .map_err(|_| anyhow!("'{}' is not a recognized log level", options.level))?;

    let drain = LevelFilter::new(output_drain(options.output), level).fuse();
    // The worker threads calling flush must not block on stderr; hand
    // records off to the async writer thread instead
    let drain = slog_async::Async::new(drain).build().fuse();

    let root = Logger::root(
        drain,
        o!(
            "plugin" => "cloudwatch_logs",
            "version" => options.version.to_owned(),
        ),
    );

    // Dependencies (ureq, rusoto) log through the `log` crate; route those
    // records into the same drain so nothing ends up on a second channel
    let guard = slog_scope::set_global_logger(root.clone());
    slog_stdlog::init().context("failed to route log-crate records into slog")?;

    Ok((root, guard))
}

/// Builds the output-format half of the drain stack. Both variants are
/// fused before boxing so the rest of the stack only deals in infallible
/// drains.
fn output_drain(output: LogOutput) -> Box<dyn Drain<Ok = (), Err = Never> + Send> {
    let want_json = match output {
        LogOutput::Json => true,
        LogOutput::Terminal => false,
        // No terminal on stderr means a pipeline is collecting our output
        LogOutput::Auto => atty::isnt(Stream::Stderr),
    };

    if want_json {
        let drain = Json::new(stderr())
            .set_newlines(true)
            .add_default_keys()
            .build();
        Box::new(drain.fuse())
    } else {
        let drain = FullFormat::new(TermDecorator::new().stderr().build()).build();
        Box::new(drain.fuse())
    }
}

/// Logger for unit and integration tests: synchronous and plain, routed
/// through the test harness's captured stdout. Must be public for
/// visibility in integration tests.
pub fn setup_test_logging() -> Logger {
    let drain = FullFormat::new(PlainSyncDecorator::new(TestStdoutWriter))
        .build()
        .fuse();
    Logger::root(drain, o!())
}
