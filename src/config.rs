//! Interactions and data types for the runner's configuration live here:
//! CLI argument validation, the persisted `.runner` file, and the data root.

use error_stack::{Result, ResultExt};

// Keep `config` opaque externally, only export what is required for callers.
mod args;
mod file;

pub use args::{DaemonArgs, RawDaemonArgs, DATA_ROOT_VAR};
pub use file::RunnerConfig;

/// Errors that are possibly surfaced during configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// This crate doesn't parse command line arguments itself; it validates
    /// what `clap` already parsed. The error message only concerns validation,
    /// since `clap` already reports its own parse errors.
    #[error("validate command line arguments")]
    ValidateArgs,

    /// Loading the persisted runner config file failed.
    #[error("load runner config file")]
    LoadRunnerFile,
}

/// Validate the args provided by the user for the `daemon` subcommand.
pub async fn validate_args(provided: RawDaemonArgs) -> Result<DaemonArgs, Error> {
    provided.validate().await.change_context(Error::ValidateArgs)
}

/// Load the persisted runner config for the application.
pub fn load(args: &DaemonArgs) -> Result<RunnerConfig, Error> {
    RunnerConfig::load(args.runner_file().path()).change_context(Error::LoadRunnerFile)
}
