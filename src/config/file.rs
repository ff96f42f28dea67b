//! The persisted runner config file (`.runner`): a human-editable JSON file
//! written atomically on registration, holding the identity and defaults the
//! daemon needs to start without re-registering every run.

use std::path::Path;

use error_stack::{Report, ResultExt};
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::ext::{
    error_stack::{DescribeContext, ErrorHelper, IntoContext},
    secrecy::ComparableSecretString,
};

/// Errors possibly surfaced while loading or saving the runner config file.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reading the file from disk failed.
    #[error("read runner config file")]
    Read,

    /// The file's contents were not valid JSON in the expected shape.
    #[error("parse runner config file")]
    Parse,

    /// Serializing the config back to JSON failed.
    #[error("serialize runner config")]
    Serialize,

    /// Writing the file (or its temporary sibling) failed.
    #[error("write runner config file")]
    Write,

    /// Renaming the written temporary file into place failed.
    #[error("commit runner config file")]
    Commit,
}

/// The runner's registration identity and defaults, as persisted to disk.
#[derive(Debug, Clone, PartialEq, Getters, CopyGetters, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// The runner's server-assigned numeric id.
    #[getset(get_copy = "pub")]
    id: u64,

    /// The runner's server-assigned UUID, used in the `x-runner-uuid` RPC header.
    #[getset(get = "pub")]
    uuid: uuid::Uuid,

    /// The human-readable runner name.
    #[getset(get = "pub")]
    name: String,

    /// The bearer token used in the `x-runner-token` RPC header.
    #[serde(with = "token_serde")]
    #[getset(get = "pub")]
    token: ComparableSecretString,

    /// The address the daemon was told to report as reachable.
    #[getset(get = "pub")]
    address: String,

    /// Routing labels declared on registration.
    #[getset(get = "pub")]
    labels: Vec<String>,

    /// The command vector used to spawn the Worker subprocess.
    #[getset(get = "pub")]
    runner_worker: Vec<String>,

    /// The configured concurrency bound.
    #[getset(get_copy = "pub")]
    capacity: u32,

    /// Whether the runner exits after a single dispatched task.
    #[getset(get_copy = "pub")]
    ephemeral: bool,
}

impl RunnerConfig {
    /// Load the runner config file from disk.
    pub fn load(path: &Path) -> Result<Self, Report<Error>> {
        let raw = std::fs::read_to_string(path)
            .context(Error::Read)
            .describe_lazy(|| format!("reading '{}'", path.display()))
            .help("run the 'register' subcommand first to create this file")?;

        serde_json::from_str(&raw)
            .context(Error::Parse)
            .describe_lazy(|| format!("parsing '{}'", path.display()))
    }

    /// Write the runner config file to disk atomically: write to a temp file
    /// in the same directory, then rename over the destination.
    pub fn save(&self, path: &Path) -> Result<(), Report<Error>> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).context(Error::Write)?;

        let contents = serde_json::to_string_pretty(self).context(Error::Serialize)?;
        let mut tmp = NamedTempFile::new_in(parent)
            .context(Error::Write)
            .describe("creating a temp file beside the destination so the rename is atomic")?;

        use std::io::Write;
        tmp.write_all(contents.as_bytes()).context(Error::Write)?;
        tmp.as_file().sync_all().context(Error::Write)?;

        tmp.persist(path)
            .map_err(|err| err.error)
            .context(Error::Commit)
            .describe_lazy(|| format!("renaming into place at '{}'", path.display()))
    }
}

mod token_serde {
    use secrecy::ExposeSecret;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::ComparableSecretString;

    pub fn serialize<S: Serializer>(value: &ComparableSecretString, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(value.expose_secret())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<ComparableSecretString, D::Error> {
        let raw = String::deserialize(de)?;
        Ok(ComparableSecretString::from(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn sample() -> RunnerConfig {
        RunnerConfig {
            id: 7,
            uuid: uuid::Uuid::nil(),
            name: "test-runner".to_owned(),
            token: ComparableSecretString::from("sekrit"),
            address: "10.0.0.1:9000".to_owned(),
            labels: vec!["self-hosted".to_owned()],
            runner_worker: vec!["/usr/local/bin/worker".to_owned()],
            capacity: 4,
            ephemeral: false,
        }
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join(".runner");

        let original = sample();
        original.save(&path).expect("save runner config");
        let loaded = RunnerConfig::load(&path).expect("load runner config");
        assert_eq!(loaded, original);
    }

    #[test]
    fn rejects_malformed_file() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join(".runner");
        let mut file = std::fs::File::create(&path).expect("create file");
        file.write_all(b"not json").expect("write file");

        assert!(RunnerConfig::load(&path).is_err());
    }
}
