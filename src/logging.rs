//! Structured logging setup: a compact human layer to stderr, and a full
//! JSON layer to a daily-rolling log file under the runner's data directory.

use std::path::{Path, PathBuf};

use derive_more::{AsRef, From};
use derive_new::new;
use error_stack::{Report, ResultExt};
use getset::Getters;
use rolling_file::{BasicRollingFileAppender, RollingConditionBasic};
use tracing::{info, Metadata};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter, fmt::format::FmtSpan, layer::Context, prelude::*, Layer, Registry,
};

use crate::ext::error_stack::{DescribeContext, ErrorHelper, IntoContext};

/// Errors possibly surfaced while initializing logging.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Logging is initialized as a global singleton; a second attempt to initialize it fails.
    #[error("tracing subscriber was installed more than once")]
    SubscriberReconfigured,

    /// The rolling file appender failed to open its sink.
    #[error("open rolling log file")]
    OpenLogFile,

    /// The log directory didn't exist and couldn't be created.
    #[error("create log directory")]
    CreateLogRoot,
}

/// The directory into which rolling log files are written.
#[derive(Debug, Clone, PartialEq, Eq, AsRef, From, new)]
pub struct LogRoot(PathBuf);

impl LogRoot {
    /// The directory as a path.
    pub fn as_path(&self) -> &Path {
        self.as_ref()
    }
}

/// Validated logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Getters, new)]
#[getset(get = "pub")]
pub struct Config {
    /// The directory rolling log files are written under.
    root: LogRoot,
}

impl Config {
    /// Initialize the global tracing subscriber.
    ///
    /// Returns a [`WorkerGuard`] that must be held for the program's lifetime;
    /// dropping it stops the background writer thread and buffered log lines
    /// are lost.
    #[must_use = "dropping this guard stops the log writer"]
    pub fn install(&self) -> Result<WorkerGuard, Report<Error>> {
        self.ensure_log_root_exists()?;

        let target = self.root.as_path().join("runner-proxy.log");
        let condition = RollingConditionBasic::new().daily();
        let file = BasicRollingFileAppender::new(&target, condition, 7)
            .context(Error::OpenLogFile)
            .help("ensure the log directory is writable")
            .describe_lazy(|| format!("opening rolling sink at '{}'", target.display()))?;
        let (sink, guard) = tracing_appender::non_blocking(file);

        let subscriber = Registry::default()
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_file(false)
                    .with_level(true)
                    .with_line_number(false)
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_ansi(atty::is(atty::Stream::Stderr))
                    .with_filter(filter::dynamic_filter_fn(filter_to_events))
                    .with_filter(filter::LevelFilter::INFO),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::FULL)
                    .with_writer(sink),
            );

        tracing::subscriber::set_global_default(subscriber)
            .context(Error::SubscriberReconfigured)
            .help("this should only happen if `logging::Config::install` is called twice")?;

        info!("logging to '{}'", target.display());
        Ok(guard)
    }

    fn ensure_log_root_exists(&self) -> Result<(), Report<Error>> {
        let root = self.root.as_path();
        std::fs::create_dir_all(root)
            .context(Error::CreateLogRoot)
            .describe_lazy(|| format!("log root '{}'", root.display()))
    }
}

/// Operators care about events, not span plumbing: restrict the stderr layer
/// to actual log events (and spans currently producing one), dropping span
/// enter/exit noise that the file sink still captures in full.
fn filter_to_events(metadata: &Metadata<'_>, ctx: &Context<'_, Registry>) -> bool {
    if metadata.is_event() {
        return true;
    }

    if let Some(current) = ctx.lookup_current() {
        return current.metadata().is_event();
    }

    false
}
