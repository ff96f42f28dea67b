//! File-discovery helpers used while locating the persisted runner config
//! file and reading the workflow/job files passed to `exec` (out of scope
//! for the core, but the discovery helpers are shared infrastructure).

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::ext::{
    error_stack::{DescribeContext, ErrorHelper, IntoContext},
    iter::AlternativeIter,
    result::WrapOk,
};
use error_stack::{Report, ResultExt};

/// Errors that are possibly surfaced during file-discovery IO actions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The provided path-like item failed validation.
    #[error("validate path")]
    ValidatePath,

    /// The provided file path does not reference a file on disk.
    #[error("path is not a regular file")]
    NotRegularFile,

    /// Failed to locate the home directory for the current user.
    #[error("locate home directory for the current user")]
    LocateUserHome,

    /// Failed to locate the current working directory.
    #[error("locate working directory")]
    LocateWorkingDirectory,

    /// Failed to read the contents of the file at the provided path.
    #[error("read contents of file")]
    ReadFileContent,

    /// None of the searched locations contained the file.
    #[error("locate file")]
    NotFound,
}

/// Searches the working directory, then the runner's data root, for a file with the given name.
#[tracing::instrument]
pub fn find(data_root: &Path, name: &str) -> Result<PathBuf, Report<Error>> {
    [working_dir()?.join(name), data_root.join(name)]
        .into_iter()
        .map(validate_file)
        .alternative_fold()
        .change_context(Error::NotFound)
        .describe_lazy(|| format!("searches the working directory and '{}'", data_root.display()))
}

/// Searches configured locations (see [`find`]) for one of several provided
/// names, returning the first one that was found.
#[tracing::instrument]
pub fn find_some(data_root: &Path, names: &[&str]) -> Result<PathBuf, Report<Error>> {
    names
        .iter()
        .map(|name| find(data_root, name))
        .alternative_fold()
}

/// Reads the provided file content to a string.
#[tracing::instrument]
pub fn read_to_string<P: AsRef<Path> + std::fmt::Debug>(file: P) -> Result<String, Report<Error>> {
    fs::read_to_string(file.as_ref())
        .context(Error::ReadFileContent)
        .help("validate that you have access to the file and that it exists")
}

/// Validate that a file path exists and is a regular file.
#[tracing::instrument]
pub fn validate_file(path: PathBuf) -> Result<PathBuf, Report<Error>> {
    let meta = fs::metadata(&path)
        .context(Error::ValidatePath)
        .describe_lazy(|| format!("validate file: '{}'", path.display()))
        .help("validate that you have access to the file and that it exists")?;

    if meta.is_file() {
        path.wrap_ok()
    } else {
        Err(Report::new(Error::NotRegularFile))
            .attach_printable_lazy(|| format!("validate file: '{}'", path.display()))
    }
}

/// Look up the current working directory, memoized after the first successful call.
#[tracing::instrument]
pub fn working_dir() -> Result<&'static PathBuf, Report<Error>> {
    static LAZY: OnceCell<PathBuf> = OnceCell::new();
    LAZY.get_or_try_init(|| {
        debug!("performing uncached lookup of working directory");
        env::current_dir()
            .context(Error::LocateWorkingDirectory)
            .describe("on macOS and Linux, this uses the system call 'getcwd'")
    })
}

/// Look up the user's home directory, memoized after the first successful call.
#[tracing::instrument]
pub fn home_dir() -> Result<&'static PathBuf, Report<Error>> {
    static LAZY: OnceCell<PathBuf> = OnceCell::new();
    LAZY.get_or_try_init(|| {
        debug!("performing uncached lookup of home directory");
        dirs::home_dir()
            .ok_or(Error::LocateUserHome)
            .map_err(Report::from)
            .describe("on macOS and Linux, this uses the $HOME environment variable")
    })
}
