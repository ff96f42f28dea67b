//! Consumes events from the callback server, maps them onto [`TaskState`],
//! and drives the corresponding `UpdateLog`/`UpdateTask` RPC calls —
//! including detecting Forge-initiated cancellation.

use std::{collections::HashMap, time::Duration};

use error_stack::{Report, ResultExt};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::{
    callback::{CallbackServer, Event, TimelineRecord},
    rpc::{LogRow, RpcClient},
    task::{StepMeta, TaskResult, TaskState},
};

/// Errors possibly surfaced running the event pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Pushing the task's current state to the Forge failed.
    #[error("push task state to forge")]
    UpdateTask,

    /// Pushing captured log lines to the Forge failed.
    #[error("push captured log lines to forge")]
    UpdateLog,
}

/// Why [`run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The Worker sent its terminal job event.
    JobEvent,
    /// The Forge reported the task as cancelled in an `UpdateTask` response.
    Cancelled,
    /// The callback server's event channel closed (the Worker likely crashed
    /// without ever reaching `FinishJob`).
    ChannelClosed,
    /// The Worker process exited before the job reached a terminal event.
    WorkerExited,
}

/// Drain `server`'s event channel, updating `state` and pushing RPC updates,
/// until the job completes, the Forge cancels the task, the channel closes,
/// or `worker_exited` fires (the caller observed the Worker process exit).
///
/// `step_ids` is the Worker-facing step GUID order (the same order as the
/// synthesized job request's steps, and therefore `state`'s step indices).
#[allow(clippy::too_many_arguments)]
pub async fn run<R: RpcClient>(
    mut server: CallbackServer,
    rpc: &R,
    task_id: u64,
    step_ids: &[Uuid],
    mut state: TaskState,
    mut worker_exited: oneshot::Receiver<()>,
) -> Result<(Outcome, TaskState, HashMap<String, String>, i64, CallbackServer), Report<Error>> {
    let mut step_meta: HashMap<Uuid, StepMeta> = HashMap::new();
    let mut global_log_index: i64 = 0;
    let mut outputs = HashMap::new();

    let mut heartbeat = tokio::time::interval(Duration::from_secs(60));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;

    let outcome = loop {
        tokio::select! {
            event = server.next_event() => {
                match event {
                    None => break Outcome::ChannelClosed,
                    Some(Event::LineFeed { step_id, lines }) => {
                        global_log_index = handle_line_feed(
                            rpc, task_id, step_id, lines, step_ids, &mut step_meta, &mut state, global_log_index,
                        ).await?;
                        if report_task_state(rpc, task_id, &state).await? {
                            server.cancel();
                            break Outcome::Cancelled;
                        }
                    }
                    Some(Event::Timeline(record)) => {
                        handle_timeline(record, step_ids, &mut step_meta, &mut state);
                    }
                    Some(Event::Job { result, outputs: job_outputs }) => {
                        *state.result_mut() = map_job_result(&result);
                        outputs = job_outputs;
                        break Outcome::JobEvent;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if report_task_state(rpc, task_id, &state).await? {
                    server.cancel();
                    break Outcome::Cancelled;
                }
            }
            _ = &mut worker_exited => break Outcome::WorkerExited,
        }
    };

    Ok((outcome, state, outputs, global_log_index, server))
}

/// Push the current state to the Forge, reporting whether it responded with
/// `Result = CANCELLED` (used both after every line-feed event and on the
/// idle heartbeat tick).
async fn report_task_state<R: RpcClient>(rpc: &R, task_id: u64, state: &TaskState) -> Result<bool, Report<Error>> {
    let response = rpc.update_task(task_id, state, None).await.change_context(Error::UpdateTask)?;
    debug!("UpdateTask for task {task_id}: forge reports {:?}", response.result());
    Ok(response.result() == TaskResult::Cancelled)
}

#[allow(clippy::too_many_arguments)]
async fn handle_line_feed<R: RpcClient>(
    rpc: &R,
    task_id: u64,
    step_id: Uuid,
    lines: Vec<String>,
    step_ids: &[Uuid],
    step_meta: &mut HashMap<Uuid, StepMeta>,
    state: &mut TaskState,
    global_log_index: i64,
) -> Result<i64, Report<Error>> {
    let meta = step_meta.entry(step_id).or_insert_with(StepMeta::new);
    resolve_step_index(meta, step_id, step_ids);

    let now = OffsetDateTime::now_utc();
    let rows: Vec<LogRow> = lines.iter().map(|content| LogRow { timestamp: now, content: content.clone() }).collect();
    let row_count = rows.len() as i64;

    let response = rpc.update_log(task_id, global_log_index, rows, false).await.change_context(Error::UpdateLog)?;

    meta.record_log(global_log_index, row_count);
    if meta.step_index() >= 0 {
        if let Some(step) = state.steps_mut().get_mut(meta.step_index() as usize) {
            step.record_log_start(meta.log_index());
            step.record_log_lines(row_count);
        }
    }

    Ok(response.ack_index)
}

fn handle_timeline(record: TimelineRecord, step_ids: &[Uuid], step_meta: &mut HashMap<Uuid, StepMeta>, state: &mut TaskState) {
    let meta = step_meta.entry(record.id).or_insert_with(StepMeta::new);
    resolve_step_index(meta, record.id, step_ids);

    let step_index = meta.step_index();
    if step_index < 0 {
        return;
    }
    let Some(step) = state.steps_mut().get_mut(step_index as usize) else { return };

    if let Some(result) = record.result.as_deref() {
        step.set_result_once(map_step_result(result));
    }
    let started = record.start_time.as_deref().and_then(parse_timestamp);
    let stopped = record.finish_time.as_deref().and_then(parse_timestamp);
    step.set_times(started, stopped);
}

fn resolve_step_index(meta: &mut StepMeta, id: Uuid, step_ids: &[Uuid]) {
    if meta.step_index() < 0 {
        if let Some(index) = step_ids.iter().position(|candidate| *candidate == id) {
            meta.resolve_step_index(index as i64);
        }
    }
}

fn map_step_result(result: &str) -> TaskResult {
    match result {
        "succeeded" => TaskResult::Success,
        "skipped" => TaskResult::Skipped,
        _ => TaskResult::Failure,
    }
}

fn map_job_result(result: &str) -> TaskResult {
    match result {
        "succeeded" => TaskResult::Success,
        "skipped" => TaskResult::Skipped,
        "cancelled" => TaskResult::Cancelled,
        _ => TaskResult::Failure,
    }
}

/// Parse a Worker-reported timestamp. Per the source's own inconsistency
/// across its duplicated implementations, unparseable timestamps are
/// ignored rather than treated as fatal.
fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        rpc::fake::FakeRpcClient,
        task::message::{Endpoint, JobRequestMessage, Resources},
    };

    #[test]
    fn maps_worker_results_to_task_results() {
        assert_eq!(map_step_result("succeeded"), TaskResult::Success);
        assert_eq!(map_step_result("skipped"), TaskResult::Skipped);
        assert_eq!(map_step_result("anything-else"), TaskResult::Failure);
        assert_eq!(map_job_result("cancelled"), TaskResult::Cancelled);
    }

    #[test]
    fn parses_rfc3339_timestamps_and_ignores_garbage() {
        assert!(parse_timestamp("2024-01-01T00:00:00Z").is_some());
        assert!(parse_timestamp("not-a-timestamp").is_none());
    }

    /// A Forge that answers `UpdateTask` with `Cancelled` the moment a
    /// line-feed event is observed mirrors a user cancelling the run mid-step.
    #[tokio::test]
    async fn forge_initiated_cancellation_stops_the_pipeline_and_cancels_the_server() {
        let endpoint = Endpoint::new("http://127.0.0.1:0".to_owned(), crate::ext::secrecy::ComparableSecretString::from("tok"));
        let job = JobRequestMessage::new(Resources { endpoint }, vec![], HashMap::new(), HashMap::new());

        let server = CallbackServer::start(
            job,
            crate::ext::secrecy::ComparableSecretString::from("tok"),
            "http://127.0.0.1:0".to_owned(),
            "http://127.0.0.1:0".to_owned(),
            std::env::temp_dir(),
        )
        .await
        .expect("start callback server");

        let addr = server.addr();
        let rpc = FakeRpcClient::default();
        rpc.force_next_update_task_result(TaskResult::Cancelled);

        let step_id = Uuid::new_v4();
        let state = TaskState::new(7, OffsetDateTime::UNIX_EPOCH, 1);
        let (_exited_tx, exited_rx) = oneshot::channel();

        let pipeline = run(server, &rpc, 7, &[step_id], state, exited_rx);
        tokio::pin!(pipeline);

        let http = reqwest::Client::new();
        let post = http
            .post(format!("http://{addr}/_apis/v1/TimeLineWebConsoleLog/00000000-0000-0000-0000-000000000000/{step_id}"))
            .json(&serde_json::json!({ "value": ["hello from the worker"] }))
            .send();

        let (pipeline_result, post_result) = tokio::join!(&mut pipeline, post);
        post_result.expect("post console log");

        let (outcome, _state, _outputs, _index, server) = pipeline_result.expect("event pipeline should not error");
        assert_eq!(outcome, Outcome::Cancelled);
        server.shutdown().await;
    }
}
