//! Drives the Worker subprocess: length-prefixed stdin framing, cancellation,
//! and stdout/stderr capture with secret redaction.

use error_stack::{Report, ResultExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::ext::command::{Command, Spawned};
use crate::ext::error_stack::IntoContext;

use super::message::{JobRequestMessage, MESSAGE_ID_CANCEL_REQUEST, MESSAGE_ID_NEW_JOB_REQUEST};

/// Errors possibly surfaced driving the Worker subprocess.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configured command vector is empty; there's no binary to run.
    #[error("runner_worker command vector is empty")]
    EmptyCommand,

    /// Spawning the Worker process failed.
    #[error("spawn worker process")]
    Spawn,

    /// Serializing the job request message to JSON failed.
    #[error("serialize job request message")]
    SerializeMessage,

    /// Writing a frame to the Worker's stdin failed.
    #[error("write frame to worker stdin")]
    WriteFrame,

    /// Waiting for the Worker to exit failed.
    #[error("wait for worker exit")]
    Wait,
}

/// A running Worker subprocess.
pub struct Worker {
    spawned: Spawned,
}

/// The outcome of running a job to completion.
pub struct WorkerOutcome {
    /// The process's exit status, `None` if it was killed before exiting.
    pub exit_code: Option<i32>,
    /// Captured stdout+stderr, secrets redacted.
    pub captured_output: String,
}

impl Worker {
    /// Spawn the Worker using the configured command vector; the last
    /// element is the absolute path to the Worker binary, per spec.
    ///
    /// The caller is responsible for sending the `NewJobRequest` frame via
    /// the returned [`JobSender`] once the job request message is ready.
    pub fn spawn(command_vector: &[String]) -> Result<(Self, JobSender), Report<Error>> {
        let (binary, args) = command_vector
            .split_last()
            .ok_or_else(|| Report::new(Error::EmptyCommand))?;

        let mut spawned = Command::new(binary)
            .args_plain(args.to_vec())
            .spawn_piped()
            .context(Error::Spawn)?;

        let stdin = spawned.take_stdin();
        Ok((Worker { spawned }, JobSender { stdin }))
    }

    /// Tee stdout and stderr into the host log, returning the combined
    /// captured output once both streams close. Runs until EOF on both
    /// streams; does not wait for process exit (call [`Worker::wait`] for that).
    pub async fn capture_output(&mut self) -> Result<String, Report<Error>> {
        let mut stdout = self.spawned.take_stdout();
        let mut stderr = self.spawned.take_stderr();

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let (stdout_result, stderr_result) = tokio::join!(
            stdout.read_to_end(&mut stdout_buf),
            stderr.read_to_end(&mut stderr_buf),
        );
        stdout_result.context(Error::Wait)?;
        stderr_result.context(Error::Wait)?;

        let stdout_text = self.spawned.redact(&String::from_utf8_lossy(&stdout_buf));
        let stderr_text = self.spawned.redact(&String::from_utf8_lossy(&stderr_buf));
        for line in stdout_text.lines() {
            debug!(target: "worker::stdout", "{line}");
        }
        for line in stderr_text.lines() {
            debug!(target: "worker::stderr", "{line}");
        }

        Ok(format!("{stdout_text}{stderr_text}"))
    }

    /// Wait for the Worker process to exit.
    pub async fn wait(&mut self) -> Result<Option<i32>, Report<Error>> {
        let status = self.spawned.wait().await.context(Error::Wait)?;
        Ok(status.code())
    }

    /// Forcibly kill the Worker process.
    pub async fn kill(&mut self) -> Result<(), Error> {
        self.spawned.kill().await.map_err(|_| Error::Wait)
    }
}

/// The write half of the framed stdin protocol; kept separate from [`Worker`]
/// so the cancellation watcher task can hold it without also owning stdout/stderr.
pub struct JobSender {
    stdin: tokio::process::ChildStdin,
}

impl JobSender {
    /// Write the initial `NewJobRequest` frame.
    pub async fn send_job_request(&mut self, job: &JobRequestMessage) -> Result<(), Report<Error>> {
        let payload = serde_json::to_vec(job).context(Error::SerializeMessage)?;
        self.write_frame(MESSAGE_ID_NEW_JOB_REQUEST, &payload).await
    }

    /// Write a `CancelRequest` frame; the Worker ignores the payload content,
    /// so the same job-request payload is reused.
    pub async fn send_cancel(&mut self, job: &JobRequestMessage) -> Result<(), Report<Error>> {
        let payload = serde_json::to_vec(job).context(Error::SerializeMessage)?;
        info!("sending cancellation frame to worker");
        self.write_frame(MESSAGE_ID_CANCEL_REQUEST, &payload).await
    }

    async fn write_frame(&mut self, message_id: u32, payload: &[u8]) -> Result<(), Report<Error>> {
        let mut header = [0u8; 8];
        header[0..4].copy_from_slice(&message_id.to_be_bytes());
        header[4..8].copy_from_slice(&(payload.len() as u32).to_be_bytes());

        self.stdin.write_all(&header).await.context(Error::WriteFrame)?;
        self.stdin.write_all(payload).await.context(Error::WriteFrame)?;
        self.stdin.flush().await.context(Error::WriteFrame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_vector_is_rejected() {
        let result = Worker::spawn(&[]);
        assert!(result.is_err());
    }
}
