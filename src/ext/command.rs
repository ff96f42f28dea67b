//! A `Command` wrapper that tracks which of its arguments/env values are secret,
//! so subprocess output and debug descriptions can be redacted without the
//! caller having to remember to do it by hand.
//!
//! The Worker subprocess ([`crate::task::worker`]) is the only thing in this
//! crate that shells out, and it's given the runtime OAuth token and job
//! secrets as environment/argument values, so this redaction matters: a
//! crashing Worker's stderr must never leak a secret into the runner's logs.

use std::{
    ffi::{OsStr, OsString},
    fmt::Display,
    path::PathBuf,
    process::{ExitStatus, Stdio},
};

use aho_corasick::AhoCorasick;
use itertools::Itertools;
use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};

use super::secrecy::{ComparableSecretString, REDACTION_LITERAL};

/// Any error encountered running the program.
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying IO error occurred.
    #[error("underlying IO error: {}", .0.trim())]
    IO(String),
}

impl Error {
    fn io(err: std::io::Error, engine: &AhoCorasick) -> Self {
        let message = format!("{err:#}");
        Self::IO(redact_str(&message, engine))
    }
}

/// Replacement for [`tokio::process::Command`] that knows which values are secret.
#[derive(Debug, Clone)]
pub struct Command {
    args: Vec<Value>,
    envs: Vec<(String, Value)>,
    working_dir: Option<PathBuf>,
    name: OsString,
}

impl Command {
    /// Create a new command that will eventually execute the provided binary.
    pub fn new<S: AsRef<OsStr>>(command: S) -> Self {
        Self {
            args: Vec::new(),
            envs: Vec::new(),
            name: command.as_ref().to_owned(),
            working_dir: None,
        }
    }

    /// Add a plain-text argument.
    pub fn arg_plain<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(Value::Plain(arg.into()));
        self
    }

    /// Add multiple plain-text arguments.
    pub fn args_plain<S: Into<String>, I: IntoIterator<Item = S>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(|a| Value::Plain(a.into())));
        self
    }

    /// Set a plain-text environment variable.
    pub fn env_plain<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.envs.push((key.into(), Value::Plain(value.into())));
        self
    }

    /// Set an environment variable whose value must be redacted from debug output.
    pub fn env_secret<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<ComparableSecretString>,
    {
        self.envs.push((key.into(), Value::Secret(value.into())));
        self
    }

    /// Set the working directory for the command.
    pub fn current_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Spawn the command, inheriting the host's environment and leaving stdin
    /// piped so the caller can write the length-prefixed job-request frame.
    pub fn spawn_piped(&self) -> Result<Spawned, Error> {
        let mut cmd = self.as_tokio_command();
        let engine = self.redaction_engine();

        let child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| Error::io(err, &engine))?;

        Ok(Spawned {
            child,
            engine,
            description: self.describe(),
        })
    }

    fn as_tokio_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.name);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for arg in &self.args {
            cmd.arg(arg.expose());
        }
        for (key, value) in &self.envs {
            cmd.env(key, value.expose());
        }
        cmd
    }

    fn redaction_engine(&self) -> AhoCorasick {
        let values = self
            .envs
            .iter()
            .map(|(_, v)| v.clone())
            .chain(self.args.iter().cloned());
        redaction_engine(values)
    }

    fn describe(&self) -> Description {
        let name = self.name.to_string_lossy().to_string();
        let args = self.args.iter().map(|a| a.to_string()).collect_vec();
        let envs = self
            .envs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect_vec();
        Description { name, args, envs, status: None, stdout: None, stderr: None }
    }
}

/// A spawned, still-running child process.
pub struct Spawned {
    child: Child,
    engine: AhoCorasick,
    description: Description,
}

impl Spawned {
    /// Take ownership of stdin, to write the length-prefixed job-request/cancel frames.
    pub fn take_stdin(&mut self) -> ChildStdin {
        self.child.stdin.take().expect("stdin must be piped")
    }

    /// Take ownership of stdout, to tee it into the host log.
    pub fn take_stdout(&mut self) -> ChildStdout {
        self.child.stdout.take().expect("stdout must be piped")
    }

    /// Take ownership of stderr, to tee it into the host log.
    pub fn take_stderr(&mut self) -> ChildStderr {
        self.child.stderr.take().expect("stderr must be piped")
    }

    /// Wait for the child to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus, Error> {
        self.child.wait().await.map_err(|err| Error::io(err, &self.engine))
    }

    /// Forcibly kill the child process.
    pub async fn kill(&mut self) -> Result<(), Error> {
        self.child.kill().await.map_err(|err| Error::io(err, &self.engine))
    }

    /// Build a description of this command enriched with the given output, for error reports.
    pub fn describe_with_output(&self, stdout: &str, stderr: &str, status: Option<i32>) -> Description {
        let mut desc = self.description.clone();
        desc.stdout = Some(self.redact(stdout));
        desc.stderr = Some(self.redact(stderr));
        desc.status = status;
        desc
    }

    /// Redact secrets belonging to this command from arbitrary captured output.
    pub fn redact(&self, input: &str) -> String {
        redact_str(input, &self.engine)
    }
}

/// A command argument or environment value, tagged with whether it's secret.
#[derive(Debug, Clone)]
enum Value {
    Secret(ComparableSecretString),
    Plain(String),
}

impl Value {
    fn expose(&self) -> &str {
        match self {
            Value::Secret(s) => s.expose_secret(),
            Value::Plain(s) => s,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Secret(_) => write!(f, "{REDACTION_LITERAL}"),
            Value::Plain(s) => write!(f, "{s}"),
        }
    }
}

/// A redacted, human-readable description of a command invocation, suitable for error reports.
#[derive(Debug, Clone, Default)]
pub struct Description {
    name: String,
    args: Vec<String>,
    envs: Vec<String>,
    status: Option<i32>,
    stdout: Option<String>,
    stderr: Option<String>,
}

impl Display for Description {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.name)?;
        writeln!(f, "args: {:?}", self.args)?;
        writeln!(f, "env: {:?}", self.envs)?;
        if let Some(status) = self.status {
            writeln!(f, "status: {status}")?;
        }
        if let Some(stdout) = &self.stdout {
            writeln!(f, "stdout: '{}'", stdout.trim())?;
        }
        if let Some(stderr) = &self.stderr {
            writeln!(f, "stderr: '{}'", stderr.trim())?;
        }
        Ok(())
    }
}

fn redact_str(provided: &str, engine: &AhoCorasick) -> String {
    let mut redacted = String::new();
    engine.replace_all_with(provided, &mut redacted, |_, _, dst| {
        dst.push_str(REDACTION_LITERAL);
        true
    });
    redacted
}

fn redaction_engine<I: IntoIterator<Item = Value>>(values: I) -> AhoCorasick {
    let patterns = values
        .into_iter()
        .filter_map(|v| match v {
            Value::Secret(s) => Some(s.expose_secret().to_owned()),
            Value::Plain(_) => None,
        })
        .collect_vec();
    AhoCorasick::new_auto_configured(&patterns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_secret_values() {
        let provided = "token=abc123 and more text";
        let engine = redaction_engine([Value::Secret(ComparableSecretString::from("abc123"))]);
        assert_eq!(redact_str(provided, &engine), "token=<REDACTED> and more text");
    }

    #[test]
    fn describe_redacts_secret_args() {
        let cmd = Command::new("worker").arg_plain("--flag").env_secret("TOKEN", "sekrit");
        let desc = cmd.describe();
        assert!(desc.envs.iter().any(|e| e.contains(REDACTION_LITERAL)));
        assert!(!desc.envs.iter().any(|e| e.contains("sekrit")));
    }
}
