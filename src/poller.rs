//! The bounded-concurrency poll loop: acquires a worker slot, fetches the
//! next ready task, and hands it to the task translator — tracking the
//! tasks-version cursor and, in once mode, terminating after one dispatch.

use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use error_stack::Report;
use tokio::{
    sync::{Mutex, Notify, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error, trace, warn};

use crate::{
    rpc::{Error as RpcError, RpcClient},
    task::translate::{self, InFlightTasks, TranslatorConfig},
};

pub mod metrics;

use metrics::BusyWorkers;

/// Errors possibly surfaced by the poll loop itself (not by individual tasks,
/// which report their own failures through the Forge and never reach here).
#[derive(Debug, thiserror::Error)]
pub enum Error {}

const IDLE_WAIT: Duration = Duration::from_secs(5);
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// A cooperative stop signal: either the poll loop's own once-mode logic, or
/// the daemon's parent-cancellation handler, can trigger it.
#[derive(Debug, Default)]
pub struct Shutdown {
    notify: Notify,
    triggered: std::sync::atomic::AtomicBool,
}

impl Shutdown {
    /// Construct a signal that hasn't fired yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal, waking every waiter. Idempotent.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether the signal has already fired.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once the signal fires (immediately if it already has).
    pub async fn wait(&self) {
        if self.is_triggered() {
            return;
        }
        self.notify.notified().await;
    }
}

/// The bounded-concurrency poll loop and its dispatched-task wait-group.
pub struct Poller {
    tasks_version: AtomicI64,
    busy: BusyWorkers,
    slots: Arc<Semaphore>,
    dispatched: Mutex<JoinSet<()>>,
}

impl Poller {
    /// Construct a poller that allows at most `capacity` concurrent dispatches.
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks_version: AtomicI64::new(0),
            busy: BusyWorkers::new(),
            slots: Arc::new(Semaphore::new(capacity.max(1))),
            dispatched: Mutex::new(JoinSet::new()),
        }
    }

    /// The current busy-worker count.
    pub fn busy_workers(&self) -> usize {
        self.busy.get()
    }

    /// Run the fetch/dispatch loop until `shutdown` fires. In `once` mode,
    /// the loop fires `shutdown` itself immediately after dispatching its
    /// first task, so no second `FetchTask` call is ever made — callers
    /// still need [`Poller::wait`] to block until that task completes.
    pub async fn poll<R: RpcClient + 'static>(
        &self,
        rpc: Arc<R>,
        config: TranslatorConfig,
        in_flight: Arc<InFlightTasks>,
        once: bool,
        shutdown: &Shutdown,
    ) -> Result<(), Report<Error>> {
        loop {
            if shutdown.is_triggered() {
                return Ok(());
            }

            let permit = tokio::select! {
                permit = Arc::clone(&self.slots).acquire_owned() => {
                    permit.expect("worker-slot semaphore is never closed")
                }
                _ = shutdown.wait() => return Ok(()),
            };

            let version = self.tasks_version.load(Ordering::SeqCst);
            match tokio::time::timeout(FETCH_TIMEOUT, rpc.fetch_task(version)).await {
                Ok(Ok(response)) => {
                    let task = response.task().clone();
                    update_tasks_version(&self.tasks_version, response.tasks_version(), task.is_some());

                    let Some(task) = task else {
                        drop(permit);
                        trace!("no task ready, idling for {IDLE_WAIT:?}");
                        tokio::time::sleep(IDLE_WAIT).await;
                        continue;
                    };

                    self.busy.increment();
                    let busy = self.busy.clone();
                    let rpc = rpc.clone();
                    let config = config.clone();
                    let in_flight = in_flight.clone();
                    self.dispatched.lock().await.spawn(async move {
                        let _permit = permit;
                        if let Err(err) = translate::run(task, &config, rpc.as_ref(), &in_flight).await {
                            error!("dispatching task failed: {err:#}");
                        }
                        busy.decrement();
                    });

                    if once {
                        shutdown.trigger();
                    }
                }
                Ok(Err(err)) => {
                    drop(permit);
                    if is_transient(&err) {
                        debug!("transient fetch_task error, retrying: {err:#}");
                    } else {
                        warn!("fetch_task failed: {err:#}");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
                Err(_elapsed) => {
                    drop(permit);
                    debug!("fetch_task timed out after {FETCH_TIMEOUT:?}");
                }
            }
        }
    }

    /// Block until every dispatched task has returned.
    pub async fn wait(&self) {
        let mut dispatched = self.dispatched.lock().await;
        while dispatched.join_next().await.is_some() {}
    }
}

/// `Unimplemented` never applies to `FetchTask`; `DataLock` means another
/// runner already claimed the task and is a routine, no-op-retry condition.
fn is_transient(err: &Report<RpcError>) -> bool {
    matches!(err.current_context(), RpcError::DataLock)
}

/// Upgrade the stored cursor to `response_version` if it's newer, unless a
/// real task was returned — in which case reset to `0` to force a fresh
/// query next call (a returned task means the queue may have more work the
/// cached cursor would otherwise cause the server to skip).
fn update_tasks_version(cursor: &AtomicI64, response_version: i64, task_returned: bool) {
    if task_returned {
        cursor.store(0, Ordering::SeqCst);
        return;
    }
    let mut current = cursor.load(Ordering::SeqCst);
    while response_version > current {
        match cursor.compare_exchange_weak(current, response_version, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::atomic::AtomicUsize};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        ext::secrecy::ComparableSecretString,
        rpc::{FetchTaskResponse, LogRow, RunnerInfo, UpdateLogResponse, UpdateTaskResponse},
        task::{Task, TaskState},
    };

    #[test]
    fn version_cursor_upgrades_only_when_newer() {
        let cursor = AtomicI64::new(5);
        update_tasks_version(&cursor, 3, false);
        assert_eq!(cursor.load(Ordering::SeqCst), 5);
        update_tasks_version(&cursor, 9, false);
        assert_eq!(cursor.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn version_cursor_resets_once_a_task_is_returned() {
        let cursor = AtomicI64::new(42);
        update_tasks_version(&cursor, 99, true);
        assert_eq!(cursor.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_wait_resolves_immediately_once_triggered() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.wait().await;
        assert!(shutdown.is_triggered());
    }

    /// A minimal scripted [`RpcClient`] returning one task then an empty
    /// queue forever, used to exercise once-mode dispatch counting without
    /// depending on the `test-util`-gated fake client.
    #[derive(Default)]
    struct ScriptedRpc {
        responses: Mutex<VecDeque<(Option<Task>, i64)>>,
        fetch_calls: AtomicUsize,
    }

    #[async_trait]
    impl RpcClient for ScriptedRpc {
        async fn ping(&self, data: Vec<u8>) -> Result<Vec<u8>, Report<RpcError>> {
            Ok(data)
        }

        async fn declare(&self, _version: &str, _labels: &[String]) -> Result<RunnerInfo, Report<RpcError>> {
            unimplemented!("not exercised by this test")
        }

        async fn register(
            &self,
            _name: &str,
            _token: &ComparableSecretString,
            _labels: &[String],
            _ephemeral: bool,
        ) -> Result<RunnerInfo, Report<RpcError>> {
            unimplemented!("not exercised by this test")
        }

        async fn fetch_task(&self, _tasks_version: i64) -> Result<FetchTaskResponse, Report<RpcError>> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().await;
            let (task, version) = responses.pop_front().unwrap_or((None, 0));
            Ok(FetchTaskResponse::new(task, version))
        }

        async fn update_task(
            &self,
            _task_id: u64,
            state: &TaskState,
            _outputs: Option<&std::collections::HashMap<String, String>>,
        ) -> Result<UpdateTaskResponse, Report<RpcError>> {
            Ok(UpdateTaskResponse::new(state.result()))
        }

        async fn update_log(
            &self,
            _task_id: u64,
            index: i64,
            rows: Vec<LogRow>,
            _no_more: bool,
        ) -> Result<UpdateLogResponse, Report<RpcError>> {
            Ok(UpdateLogResponse { ack_index: index + rows.len() as i64 })
        }
    }

    fn skip_this_job_task(id: u64) -> Task {
        let workflow = b"jobs:\n  a:\n    if: \"false\"\n    steps:\n      - run: echo\n".to_vec();
        Task::new(id, workflow, Default::default(), Default::default(), Default::default(), Default::default(), None)
    }

    #[tokio::test]
    async fn once_mode_dispatches_exactly_one_task_and_stops_polling() {
        let rpc = Arc::new(ScriptedRpc {
            responses: Mutex::new(VecDeque::from([(Some(skip_this_job_task(1)), 0), (None, 7)])),
            fetch_calls: AtomicUsize::new(0),
        });

        let poller = Poller::new(4);
        let in_flight = Arc::new(InFlightTasks::new());
        let config = TranslatorConfig {
            worker_command: vec!["/bin/true".to_owned()],
            server_url: "http://forge.example".to_owned(),
            actions_server_url: "http://forge.example".to_owned(),
            cache_root: std::env::temp_dir(),
        };
        let shutdown = Shutdown::new();

        poller.poll(rpc.clone(), config, in_flight, true, &shutdown).await.expect("poll completes");
        poller.wait().await;

        assert_eq!(rpc.fetch_calls.load(Ordering::SeqCst), 1, "no second FetchTask after the one task was dispatched");
        assert_eq!(poller.busy_workers(), 0, "the dispatched task's slot is freed once it returns");
    }
}
