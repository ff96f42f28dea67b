//! Typed unary RPC calls to the Forge: `Ping`, `Declare`, `FetchTask`,
//! `UpdateTask`, `UpdateLog`, `Register`.

use std::collections::HashMap;

use async_trait::async_trait;
use error_stack::Report;
use getset::{CopyGetters, Getters};
use uuid::Uuid;

use crate::{
    ext::secrecy::ComparableSecretString,
    task::{Task, TaskResult, TaskState},
};

pub mod client;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use client::ConnectRpcClient;

/// Errors possibly surfaced performing an RPC call.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying transport (HTTP) call failed.
    #[error("perform RPC call")]
    Transport,

    /// The server's response body could not be decoded.
    #[error("decode RPC response")]
    Decode,

    /// The server responded with an error status.
    #[error("server returned an error response")]
    ServerError,

    /// The server doesn't implement this RPC method (older Forge versions).
    #[error("RPC method is not implemented by the server")]
    Unimplemented,

    /// The task was already claimed by another runner.
    #[error("task was already claimed by another runner")]
    DataLock,
}

/// A runner's registration identity, as returned by `Declare`/`Register`.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct RunnerInfo {
    /// The runner's server-assigned numeric id.
    #[getset(get_copy = "pub")]
    id: u64,

    /// The runner's server-assigned UUID.
    #[getset(get = "pub")]
    uuid: Uuid,

    /// The runner's name.
    #[getset(get = "pub")]
    name: String,

    /// The bearer token the runner should use for subsequent calls.
    #[getset(get = "pub")]
    token: ComparableSecretString,

    /// Whether the runner is ephemeral (exits after one task).
    #[getset(get_copy = "pub")]
    ephemeral: bool,
}

/// Response to `FetchTask`.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct FetchTaskResponse {
    /// The fetched task, if the queue had one ready.
    #[getset(get = "pub")]
    task: Option<Task>,

    /// The server's current tasks-version cursor.
    #[getset(get_copy = "pub")]
    tasks_version: i64,
}

impl FetchTaskResponse {
    /// Construct a response.
    pub fn new(task: Option<Task>, tasks_version: i64) -> Self {
        Self { task, tasks_version }
    }
}

/// Response to `UpdateTask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
pub struct UpdateTaskResponse {
    /// The task's result as recorded by the server, reflecting
    /// Forge-initiated cancellation if it occurred.
    #[getset(get_copy = "pub")]
    result: TaskResult,
}

impl UpdateTaskResponse {
    /// Construct a response.
    pub fn new(result: TaskResult) -> Self {
        Self { result }
    }
}

/// One row of captured Worker log output.
#[derive(Debug, Clone)]
pub struct LogRow {
    /// When the line was captured.
    pub timestamp: time::OffsetDateTime,
    /// The captured line content.
    pub content: String,
}

/// Response to `UpdateLog`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateLogResponse {
    /// The new global log-line cursor; the next `UpdateLog` call must use this as its index.
    pub ack_index: i64,
}

/// Typed unary calls to the Forge control plane.
///
/// Implementations attach `x-runner-uuid`/`x-runner-token` headers to every
/// call; see [`ConnectRpcClient`] for the production implementation over
/// `reqwest`, and [`fake::FakeRpcClient`] (behind the `test-util` feature)
/// for tests.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Echo `data` back, used as a connectivity check.
    async fn ping(&self, data: Vec<u8>) -> Result<Vec<u8>, Report<Error>>;

    /// Declare this runner's version and labels to the server.
    async fn declare(&self, version: &str, labels: &[String]) -> Result<RunnerInfo, Report<Error>>;

    /// Register a new runner.
    async fn register(
        &self,
        name: &str,
        token: &ComparableSecretString,
        labels: &[String],
        ephemeral: bool,
    ) -> Result<RunnerInfo, Report<Error>>;

    /// Fetch the next ready task, if any, using `tasks_version` as a queue-skip hint.
    async fn fetch_task(&self, tasks_version: i64) -> Result<FetchTaskResponse, Report<Error>>;

    /// Push the task's current state (and final outputs, if any) to the server.
    async fn update_task(
        &self,
        task_id: u64,
        state: &TaskState,
        outputs: Option<&HashMap<String, String>>,
    ) -> Result<UpdateTaskResponse, Report<Error>>;

    /// Append log rows for a task, starting at the given global index.
    async fn update_log(
        &self,
        task_id: u64,
        index: i64,
        rows: Vec<LogRow>,
        no_more: bool,
    ) -> Result<UpdateLogResponse, Report<Error>>;
}
