//! Types and functions for parsing & validating CLI arguments for the `daemon` subcommand.

use std::path::PathBuf;

use clap::Parser;
use derive_new::new;
use error_stack::{Report, ResultExt};
use getset::{CopyGetters, Getters};
use serde::Serialize;

use crate::ext::{
    error_stack::{merge_error_stacks, DescribeContext, ErrorHelper},
    io,
    result::WrapOk,
};

/// The environment variable that overrides the runner's data root directory.
pub const DATA_ROOT_VAR: &str = "RUNNER_DATA_ROOT";

/// Errors that are possibly surfaced during validation of config values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The runner config file was not able to be located.
    #[error("locate runner config file")]
    RunnerFileLocation,

    /// The data root directory could not be determined.
    #[error("determine data root directory")]
    DataRoot,
}

/// Raw arguments accepted by the `daemon` subcommand, as parsed by `clap` before validation.
///
/// This crate doesn't parse these itself; `clap` does, because these fields implement
/// `Parser` and are included in `main`'s top-level subcommand. By the time code here
/// sees a `RawDaemonArgs`, `clap` has already validated its own syntax (types, required-ness);
/// what's left to validate is filesystem discovery, which is what [`RawDaemonArgs::validate`] does.
#[derive(Debug, Clone, Parser, Serialize, new)]
#[command(version, about)]
pub struct RawDaemonArgs {
    /// The host of the Forge RPC server.
    #[arg(long, env = "RPC_HOST")]
    rpc_host: String,

    /// The protocol used to reach the Forge RPC server.
    #[arg(long, env = "RPC_PROTO", default_value = "https")]
    rpc_proto: String,

    /// The path to the persisted runner config file (`.runner`).
    ///
    /// If unset, the runner searches the current working directory,
    /// then the data root directory (see [`DATA_ROOT_VAR`]).
    #[arg(long, env = "RUNNER_FILE")]
    runner_file: Option<String>,

    /// Run exactly one task then exit.
    #[arg(long)]
    once: bool,

    /// Maximum number of concurrently dispatched tasks. Forced to `1` in once-mode.
    #[arg(long, env = "RUNNER_CAPACITY")]
    capacity: Option<u32>,
}

impl RawDaemonArgs {
    /// Validate the raw args, resolving the runner config file location and data root on disk.
    pub async fn validate(self) -> Result<DaemonArgs, Report<Error>> {
        let data_root = data_root().change_context(Error::DataRoot);

        let runner_file = match (&data_root, self.runner_file) {
            (_, Some(provided)) => RunnerFilePath::from(provided).wrap_ok(),
            (Ok(root), None) => {
                RunnerFilePath::discover(root).change_context(Error::RunnerFileLocation)
            }
            (Err(_), None) => Err(Report::new(Error::RunnerFileLocation))
                .describe("data root lookup failed, so the default runner file location is unknown"),
        };

        match (data_root, runner_file) {
            (Ok(data_root), Ok(runner_file)) => Ok(DaemonArgs {
                rpc_host: self.rpc_host,
                rpc_proto: self.rpc_proto,
                runner_file,
                data_root,
                once: self.once,
                capacity: if self.once { Some(1) } else { self.capacity },
            }),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(_)) => Err(err),
            (Err(first), Err(second)) => Err(merge_error_stacks!(first, second)),
        }
    }
}

/// Validated arguments for the `daemon` subcommand.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct DaemonArgs {
    /// The host of the Forge RPC server.
    #[getset(get = "pub")]
    rpc_host: String,

    /// The protocol used to reach the Forge RPC server.
    #[getset(get = "pub")]
    rpc_proto: String,

    /// The path to the persisted runner config file.
    #[getset(get = "pub")]
    runner_file: RunnerFilePath,

    /// The runner's data root directory.
    #[getset(get = "pub")]
    data_root: PathBuf,

    /// Whether the daemon should exit after dispatching exactly one task.
    #[getset(get_copy = "pub")]
    once: bool,

    /// The configured concurrency bound, if overridden on the command line.
    #[getset(get_copy = "pub")]
    capacity: Option<u32>,
}

/// The path to the persisted runner config file.
///
/// Validated as being correctly shaped; the file is not guaranteed to exist
/// (it doesn't, prior to `register`).
#[derive(Debug, Clone, Eq, PartialEq, Getters, CopyGetters)]
pub struct RunnerFilePath {
    /// The path on disk for the file.
    #[getset(get = "pub")]
    path: PathBuf,

    /// Whether the path was provided explicitly by the operator.
    #[getset(get_copy = "pub")]
    provided: bool,
}

impl RunnerFilePath {
    fn discover(data_root: &std::path::Path) -> Result<Self, Report<io::Error>> {
        match io::find(data_root, ".runner") {
            Ok(path) => Self { path, provided: false }.wrap_ok(),
            // The file legitimately may not exist yet (before `register` runs);
            // fall back to the default location under the data root rather than failing.
            Err(_) => Self {
                path: data_root.join(".runner"),
                provided: false,
            }
            .wrap_ok(),
        }
    }
}

impl From<String> for RunnerFilePath {
    fn from(value: String) -> Self {
        Self {
            path: PathBuf::from(value),
            provided: true,
        }
    }
}

/// The runner's data root directory.
///
/// - On Linux and macOS: `~/.config/runner-proxy/`
/// - On Windows: `%USERPROFILE%\.config\runner-proxy`
///
/// Overridable via [`DATA_ROOT_VAR`].
fn data_root() -> Result<PathBuf, Report<io::Error>> {
    if let Ok(over) = std::env::var(DATA_ROOT_VAR) {
        return PathBuf::from(over).wrap_ok();
    }
    io::home_dir().map(|home| home.join(".config").join("runner-proxy"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_runner_file_is_marked_provided() {
        let path = RunnerFilePath::from("/tmp/custom.runner".to_owned());
        assert!(path.provided());
        assert_eq!(path.path(), &PathBuf::from("/tmp/custom.runner"));
    }
}
