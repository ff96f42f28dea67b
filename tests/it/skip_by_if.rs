//! A job whose `if:` evaluates to false is reported `Skipped` without ever
//! touching the configured Worker binary.

use runner_proxy::{
    rpc::fake::FakeRpcClient,
    task::{translate, TaskResult},
};

use crate::helper::task_with_job;

#[tokio::test]
async fn skipped_job_never_spawns_a_worker() {
    let task = task_with_job(1, Some("false"), "echo unreachable");

    let config = translate::TranslatorConfig {
        // If the translator ever tried to spawn this, `Worker::spawn` would
        // fail immediately and the task would be reported `Failure` instead.
        worker_command: vec!["/does/not/exist/runner-worker".to_owned()],
        server_url: "http://127.0.0.1:0".to_owned(),
        actions_server_url: "http://127.0.0.1:0".to_owned(),
        cache_root: std::env::temp_dir(),
    };

    let rpc = FakeRpcClient::default();
    let in_flight = translate::InFlightTasks::new();

    translate::run(task, &config, &rpc, &in_flight).await.expect("translate::run should not error");

    let calls = rpc.update_task_calls.lock().expect("lock poisoned");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], (1, TaskResult::Skipped));
}
