//! An in-memory [`RpcClient`] used by integration tests to drive the daemon
//! without a real Forge server.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use error_stack::Report;
use uuid::Uuid;

use crate::{
    ext::secrecy::ComparableSecretString,
    task::{Task, TaskResult, TaskState},
};

use super::{Error, FetchTaskResponse, LogRow, RpcClient, RunnerInfo, UpdateLogResponse, UpdateTaskResponse};

/// A scripted, in-memory RPC client.
///
/// Tasks are handed out from a queue in order, one per `fetch_task` call.
/// Every `update_task`/`update_log` call is recorded for assertions.
#[derive(Default)]
pub struct FakeRpcClient {
    tasks: Mutex<Vec<Task>>,
    /// Set to force the next (and only the next) `update_task` response's result.
    pub next_update_task_result: Mutex<Option<TaskResult>>,
    pub update_task_calls: Mutex<Vec<(u64, TaskResult)>>,
    pub update_log_calls: Mutex<Vec<(u64, i64, usize, bool)>>,
    ack_index: Mutex<i64>,
}

impl FakeRpcClient {
    /// Construct a client that will hand out `tasks` in order, one per `fetch_task` call.
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks: Mutex::new(tasks), ..Default::default() }
    }

    /// Force the next `update_task` response to carry the given result
    /// (used to simulate Forge-initiated cancellation).
    pub fn force_next_update_task_result(&self, result: TaskResult) {
        *self.next_update_task_result.lock().expect("lock poisoned") = Some(result);
    }
}

#[async_trait]
impl RpcClient for FakeRpcClient {
    async fn ping(&self, data: Vec<u8>) -> Result<Vec<u8>, Report<Error>> {
        Ok(data)
    }

    async fn declare(&self, _version: &str, _labels: &[String]) -> Result<RunnerInfo, Report<Error>> {
        Ok(RunnerInfo {
            id: 1,
            uuid: Uuid::nil(),
            name: "fake".to_owned(),
            token: ComparableSecretString::from("fake-token"),
            ephemeral: false,
        })
    }

    async fn register(
        &self,
        name: &str,
        token: &ComparableSecretString,
        _labels: &[String],
        ephemeral: bool,
    ) -> Result<RunnerInfo, Report<Error>> {
        Ok(RunnerInfo {
            id: 1,
            uuid: Uuid::nil(),
            name: name.to_owned(),
            token: token.clone(),
            ephemeral,
        })
    }

    async fn fetch_task(&self, _tasks_version: i64) -> Result<FetchTaskResponse, Report<Error>> {
        let mut tasks = self.tasks.lock().expect("lock poisoned");
        if tasks.is_empty() {
            Ok(FetchTaskResponse::new(None, 0))
        } else {
            Ok(FetchTaskResponse::new(Some(tasks.remove(0)), 0))
        }
    }

    async fn update_task(
        &self,
        task_id: u64,
        state: &TaskState,
        _outputs: Option<&HashMap<String, String>>,
    ) -> Result<UpdateTaskResponse, Report<Error>> {
        self.update_task_calls
            .lock()
            .expect("lock poisoned")
            .push((task_id, state.result()));

        let forced = self.next_update_task_result.lock().expect("lock poisoned").take();
        Ok(UpdateTaskResponse::new(forced.unwrap_or(state.result())))
    }

    async fn update_log(
        &self,
        task_id: u64,
        index: i64,
        rows: Vec<LogRow>,
        no_more: bool,
    ) -> Result<UpdateLogResponse, Report<Error>> {
        let mut ack = self.ack_index.lock().expect("lock poisoned");
        *ack = index + rows.len() as i64;
        self.update_log_calls
            .lock()
            .expect("lock poisoned")
            .push((task_id, index, rows.len(), no_more));
        Ok(UpdateLogResponse { ack_index: *ack })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hands_out_tasks_in_order_then_empty() {
        let task = Task::new(1, vec![], Default::default(), Default::default(), Default::default(), Default::default(), None);
        let client = FakeRpcClient::new(vec![task]);

        let first = client.fetch_task(0).await.expect("fetch");
        assert!(first.task().is_some());

        let second = client.fetch_task(0).await.expect("fetch");
        assert!(second.task().is_none());
    }

    #[tokio::test]
    async fn update_log_tracks_ack_index() {
        let client = FakeRpcClient::default();
        let rows = vec![LogRow { timestamp: time::OffsetDateTime::UNIX_EPOCH, content: "hi".to_owned() }];
        let response = client.update_log(1, 0, rows, false).await.expect("update_log");
        assert_eq!(response.ack_index, 1);
    }
}
