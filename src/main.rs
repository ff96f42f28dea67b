//! The `runner-proxy` binary.

#![deny(clippy::unwrap_used)]
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(feature = "jemalloc")]
use tikv_jemallocator::Jemalloc;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use atty::Stream;
use clap::{Parser, Subcommand};
use error_stack::{bail, fmt::ColorMode, Report, Result, ResultExt};
use runner_proxy::config::{self, RawDaemonArgs};
use runner_proxy::doc::{self, crate_version};
use runner_proxy::ext::error_stack::IntoContext;
use runner_proxy::{
    daemon,
    ext::error_stack::{DescribeContext, ErrorDocReference, ErrorHelper, FatalErrorReport},
};
use tap::TapFallible;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("determine effective configuration")]
    DetermineEffectiveConfig,

    #[error("this subcommand is not implemented")]
    SubcommandUnimplemented,

    #[error("a fatal error occurred during internal configuration")]
    InternalSetup,

    #[error("a fatal error occurred at runtime")]
    Runtime,
}

#[derive(Debug, Parser)]
#[clap(version)]
struct Opts {
    /// The runner proxy can run a number of subcommands.
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Register this runner with the Forge and persist its identity.
    Register,

    /// Poll the Forge for tasks and dispatch them to the Worker until stopped.
    Daemon(RawDaemonArgs),

    /// Run a single workflow file through the Worker without polling the Forge.
    Exec,

    /// Install, uninstall, start, or stop the OS-level service wrapper.
    Svc,

    /// Download and switch to a different Worker binary.
    Update,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // App-wide setup that doesn't depend on config or subcommand goes here.
    let version = crate_version();
    if atty::is(Stream::Stdout) {
        Report::set_color_mode(ColorMode::Color);
    } else {
        Report::set_color_mode(ColorMode::None);
    }
    runner_proxy::error_ext::install();

    // Subcommand routing.
    let Opts { command } = Opts::parse();
    let subcommand = || async {
        match command {
            Commands::Register => main_register().await,
            Commands::Daemon(args) => main_daemon(args).await,
            Commands::Exec => main_exec().await,
            Commands::Svc => main_svc().await,
            Commands::Update => main_update().await,
        }
    };

    // Run the subcommand, but also listen for ctrl+c.
    // If ctrl+c is fired, we exit; this drops any futures currently running.
    // In Rust, this is the appropriate way to cancel futures.
    tokio::select! {
        // We want to handle signals first, regardless of how often the subcommand
        // is ready to be polled.
        biased;

        // If the signal fires, log that we're shutting down and return.
        result = tokio::signal::ctrl_c() => {
            // Only log this on success.
            //
            // Write directly to stderr because tracing may already be shut down,
            // or may not ever have been started, by the time this runs.
            result.tap_ok(|_| eprintln!("Shut down due to OS signal"))
            // If this errors, it'll do so immediately before anything else runs,
            // so it's definitely part of internal setup.
            .context(Error::InternalSetup)
        },

        // Otherwise, run the subcommand to completion.
        result = subcommand() => {
            result
        }
    }
    // Decorate any error message with top level diagnostics and debugging help.
    .request_support()
    .describe_lazy(|| format!("runner-proxy version: {version}"))
}

/// Register this runner with the Forge.
async fn main_register() -> Result<(), Error> {
    bail!(Error::SubcommandUnimplemented)
}

/// Poll the Forge for tasks and dispatch them until stopped.
async fn main_daemon(raw: RawDaemonArgs) -> Result<(), Error> {
    let args = config::validate_args(raw)
        .await
        .change_context(Error::DetermineEffectiveConfig)
        .help("try running with the '--help' argument to see available options and usage suggestions")?;

    let log_root = runner_proxy::logging::LogRoot::new(args.data_root().join("log"));
    let _tracing_guard = runner_proxy::logging::Config::new(log_root)
        .install()
        .change_context(Error::InternalSetup)?;
    debug!("loaded daemon args: {args:?}");

    let runner = config::load(&args)
        .change_context(Error::DetermineEffectiveConfig)
        .documentation_lazy(doc::link::config_file_reference)
        .help("run the 'register' subcommand first")?;

    daemon::run(&args, &runner).await.change_context(Error::Runtime)
}

/// Run a single workflow file through the Worker without polling the Forge.
async fn main_exec() -> Result<(), Error> {
    bail!(Error::SubcommandUnimplemented)
}

/// Install, uninstall, start, or stop the OS-level service wrapper.
async fn main_svc() -> Result<(), Error> {
    bail!(Error::SubcommandUnimplemented)
}

/// Download and switch to a different Worker binary.
async fn main_update() -> Result<(), Error> {
    bail!(Error::SubcommandUnimplemented)
}
