//! `--once` dispatches exactly one task, then the poll loop stops on its own
//! and `Poller::wait` returns once that task has finished.

use std::sync::Arc;

use runner_proxy::{
    poller::{Poller, Shutdown},
    rpc::fake::FakeRpcClient,
    task::translate::{InFlightTasks, TranslatorConfig},
};

use crate::helper::task_with_job;

#[tokio::test]
async fn once_mode_dispatches_one_task_and_stops() {
    let task = task_with_job(3, Some("false"), "echo unreachable");
    let rpc = Arc::new(FakeRpcClient::new(vec![task]));

    let config = TranslatorConfig {
        worker_command: vec!["/does/not/exist/runner-worker".to_owned()],
        server_url: "http://127.0.0.1:0".to_owned(),
        actions_server_url: "http://127.0.0.1:0".to_owned(),
        cache_root: std::env::temp_dir(),
    };

    let poller = Poller::new(2);
    let in_flight = Arc::new(InFlightTasks::new());
    let shutdown = Shutdown::new();

    poller
        .poll(rpc.clone(), config, in_flight, true, &shutdown)
        .await
        .expect("poll loop should not error");
    poller.wait().await;

    assert_eq!(poller.busy_workers(), 0);
    assert_eq!(rpc.update_task_calls.lock().expect("lock poisoned").len(), 1);
}
