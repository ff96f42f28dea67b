//! A Worker binary that exits without ever reaching a terminal job event is
//! reported as a task `Failure`, with captured output flushed to the log.

use runner_proxy::{
    rpc::fake::FakeRpcClient,
    task::{translate, TaskResult},
};

use crate::helper::task_with_job;

#[tokio::test]
async fn worker_non_zero_exit_reports_failure() {
    let task = task_with_job(2, None, "echo hi");

    let config = translate::TranslatorConfig {
        worker_command: vec!["/bin/false".to_owned()],
        server_url: "http://127.0.0.1:0".to_owned(),
        actions_server_url: "http://127.0.0.1:0".to_owned(),
        cache_root: std::env::temp_dir(),
    };

    let rpc = FakeRpcClient::default();
    let in_flight = translate::InFlightTasks::new();

    translate::run(task, &config, &rpc, &in_flight).await.expect("translate::run should not error");

    let calls = rpc.update_task_calls.lock().expect("lock poisoned");
    let last = calls.last().expect("at least one update_task call");
    assert_eq!(last.0, 2);
    assert_eq!(last.1, TaskResult::Failure);
}
