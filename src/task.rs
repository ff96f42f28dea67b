//! The task data model: what the Forge hands the runner, and the state the
//! dispatch loop accumulates while running it.

use std::collections::HashMap;

use derive_new::new;
use getset::{CopyGetters, Getters, MutGetters};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ext::secrecy::ComparableSecretString;

pub mod expr;
pub mod message;
pub mod translate;
pub mod worker;

/// A single job's worth of work dispatched by the Forge.
///
/// Constructed from an RPC response, consumed exactly once by a dispatch
/// task, and never persisted.
#[derive(Debug, Clone, Getters, CopyGetters, new)]
pub struct Task {
    /// The task's server-assigned id.
    #[getset(get_copy = "pub")]
    id: u64,

    /// The raw YAML workflow payload.
    #[getset(get = "pub")]
    workflow: Vec<u8>,

    /// The `github` context: repository, event, sha, token, server_url, api_url, etc.
    #[getset(get = "pub")]
    context: HashMap<String, serde_json::Value>,

    /// Job secrets, by name. All values are sensitive.
    #[getset(get = "pub")]
    secrets: HashMap<String, ComparableSecretString>,

    /// Job-level variables, by name.
    #[getset(get = "pub")]
    vars: HashMap<String, String>,

    /// Upstream job results and outputs, keyed by job id.
    #[getset(get = "pub")]
    needs: HashMap<String, NeedsResult>,

    /// An opaque cursor hinting at the position in the Forge's task queue.
    #[getset(get_copy = "pub")]
    tasks_version: Option<i64>,
}

/// The recorded result and outputs of an upstream job, as seen from `needs.<job>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeedsResult {
    /// The upstream job's terminal result, lowercased (`success`, `failure`, etc).
    pub result: String,

    /// The upstream job's declared outputs.
    pub outputs: HashMap<String, String>,
}

/// A task's overall or per-step result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskResult {
    /// No result has been recorded yet.
    #[default]
    Unspecified,
    /// The task or step completed successfully.
    Success,
    /// The task or step failed.
    Failure,
    /// The task or step was skipped (e.g. `if` evaluated to false).
    Skipped,
    /// The task or step was cancelled.
    Cancelled,
}

impl TaskResult {
    /// Whether this result represents a completed (non-[`TaskResult::Unspecified`]) state.
    pub fn is_terminal(self) -> bool {
        self != TaskResult::Unspecified
    }
}

/// Per-task state owned by the dispatch task for the lifetime of one task.
#[derive(Debug, Clone, Getters, CopyGetters, MutGetters)]
pub struct TaskState {
    /// The task id this state belongs to.
    #[getset(get_copy = "pub")]
    id: u64,

    /// The overall result of the task.
    #[getset(get_copy = "pub", get_mut = "pub")]
    result: TaskResult,

    /// When the task's dispatch began.
    #[getset(get_copy = "pub")]
    started_at: OffsetDateTime,

    /// When the task's dispatch ended, if it has.
    #[getset(get_copy = "pub", get_mut = "pub")]
    stopped_at: Option<OffsetDateTime>,

    /// Steps, indexed by position in the workflow's step list.
    ///
    /// Invariant: `steps[i].id == i`, and the length is fixed at dispatch
    /// start to the number of steps in the parsed workflow.
    #[getset(get = "pub", get_mut = "pub")]
    steps: Vec<StepState>,
}

impl TaskState {
    /// Construct task state for a newly-dispatched task with `step_count` steps.
    pub fn new(id: u64, started_at: OffsetDateTime, step_count: usize) -> Self {
        let steps = (0..step_count)
            .map(|i| StepState::new(i as u64))
            .collect();
        Self {
            id,
            result: TaskResult::Unspecified,
            started_at,
            stopped_at: None,
            steps,
        }
    }

    /// Mark the task finished now, setting `result` to `Failure` only if it's
    /// still [`TaskResult::Unspecified`], and recording `stopped_at`.
    pub fn finish(&mut self, now: OffsetDateTime, result_if_unspecified: TaskResult) {
        if self.result == TaskResult::Unspecified {
            self.result = result_if_unspecified;
        }
        self.stopped_at = Some(now);
    }
}

/// Per-step result and log-range bookkeeping, owned by [`TaskState`].
#[derive(Debug, Clone, Copy, Getters, CopyGetters, new)]
pub struct StepState {
    /// The step's position in the workflow's step list.
    #[getset(get_copy = "pub")]
    id: u64,

    /// The step's result.
    #[new(value = "TaskResult::Unspecified")]
    #[getset(get_copy = "pub")]
    result: TaskResult,

    /// When the step started, once observed via a Timeline record.
    #[new(default)]
    #[getset(get_copy = "pub")]
    started_at: Option<OffsetDateTime>,

    /// When the step stopped, once observed via a Timeline record.
    #[new(default)]
    #[getset(get_copy = "pub")]
    stopped_at: Option<OffsetDateTime>,

    /// The first absolute log-line index attributed to this step, `None` until the first line.
    #[new(value = "None")]
    #[getset(get_copy = "pub")]
    log_index: Option<i64>,

    /// The count of log lines attributed to this step so far.
    #[new(value = "0")]
    #[getset(get_copy = "pub")]
    log_length: i64,
}

impl StepState {
    /// Record the first log line attributed to this step, if not already set.
    pub fn record_log_start(&mut self, index: i64) {
        if self.log_index.is_none() {
            self.log_index = Some(index);
        }
    }

    /// Record `count` additional log lines attributed to this step.
    pub fn record_log_lines(&mut self, count: i64) {
        self.log_length += count;
    }

    /// Set the step's result, but only if it's still [`TaskResult::Unspecified`] —
    /// duplicate events for an already-resolved step are ignored.
    pub fn set_result_once(&mut self, result: TaskResult) {
        if self.result == TaskResult::Unspecified {
            self.result = result;
        }
    }

    /// Record the step's start/stop timestamps.
    pub fn set_times(&mut self, started_at: Option<OffsetDateTime>, stopped_at: Option<OffsetDateTime>) {
        if let Some(started_at) = started_at {
            self.started_at = Some(started_at);
        }
        if let Some(stopped_at) = stopped_at {
            self.stopped_at = Some(stopped_at);
        }
    }
}

/// Internal per-step bookkeeping keyed by the Worker-provided step GUID,
/// separate from [`StepState`] because the Worker identifies steps by GUID
/// while the Forge-facing state is indexed by position.
#[derive(Debug, Clone, Getters, CopyGetters, new)]
pub struct StepMeta {
    /// The first absolute log-line index attributed to this step, `-1` until set.
    #[new(value = "-1")]
    #[getset(get_copy = "pub")]
    log_index: i64,

    /// The count of log lines attributed to this step so far.
    #[new(value = "0")]
    #[getset(get_copy = "pub")]
    log_length: i64,

    /// This step's position in the workflow's step list, `-1` if unresolved.
    #[new(value = "-1")]
    #[getset(get_copy = "pub")]
    step_index: i64,
}

impl StepMeta {
    /// Record that `count` log lines, starting at `first_index`, have arrived for this step.
    pub fn record_log(&mut self, first_index: i64, count: i64) {
        if self.log_index < 0 {
            self.log_index = first_index;
        }
        self.log_length += count;
    }

    /// Resolve and cache the step's position, if not already known.
    pub fn resolve_step_index(&mut self, index: i64) {
        if self.step_index < 0 {
            self.step_index = index;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_sets_failure_only_if_unspecified() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let mut state = TaskState::new(1, now, 0);
        state.finish(now, TaskResult::Failure);
        assert_eq!(state.result(), TaskResult::Failure);

        let mut resolved = TaskState::new(2, now, 0);
        *resolved.result_mut() = TaskResult::Success;
        resolved.finish(now, TaskResult::Failure);
        assert_eq!(resolved.result(), TaskResult::Success);
    }

    #[test]
    fn step_state_ignores_duplicate_results() {
        let mut step = StepState::new(0);
        step.set_result_once(TaskResult::Success);
        step.set_result_once(TaskResult::Failure);
        assert_eq!(step.result(), TaskResult::Success);
    }

    #[test]
    fn step_meta_log_index_is_monotone_once_set() {
        let mut meta = StepMeta::new();
        meta.record_log(5, 2);
        assert_eq!(meta.log_index(), 5);
        meta.record_log(9, 1);
        assert_eq!(meta.log_index(), 5);
        assert_eq!(meta.log_length(), 3);
    }
}
