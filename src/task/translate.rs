//! Translates one fetched [`Task`] into a Worker job request, drives the
//! Worker subprocess and callback server to completion, and reports the
//! terminal result back to the Forge.
//!
//! Deduplication (a task id already being worked can't be picked up twice)
//! lives here via [`InFlightTasks`], since it's the translator's entry point
//! that first learns a task id is about to be dispatched.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Mutex,
};

use error_stack::{Report, ResultExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

use crate::{
    callback::CallbackServer,
    events,
    ext::{error_stack::DescribeContext, secrecy::ComparableSecretString},
    rpc::{LogRow, RpcClient},
};

use super::{
    expr,
    message::{ActionStep, Endpoint, JobRequestMessage, Resources, StepReference, Variable},
    worker::Worker,
    Task, TaskResult, TaskState,
};

/// Errors possibly surfaced translating and running one task.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The task was already in flight; the caller handed out a duplicate.
    #[error("task is already in flight")]
    DuplicateTask,

    /// Pushing the task's terminal state to the Forge failed.
    #[error("push terminal task state to forge")]
    UpdateTask,

    /// Pushing a captured-output log flush to the Forge failed.
    #[error("push captured log flush to forge")]
    UpdateLog,

    /// Driving the event pipeline failed.
    #[error("drive event pipeline")]
    EventPipeline,
}

/// Configuration the translator needs to stand up a Worker and callback
/// server for one task; shared across every dispatched task.
#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    /// The Worker command vector; the last element is the binary path.
    pub worker_command: Vec<String>,
    /// The Forge's base URL, used for default action/archive resolution.
    pub server_url: String,
    /// The Forge's actions-serving base URL, if distinct from `server_url`.
    pub actions_server_url: String,
    /// Root directory for the per-task artifact cache.
    pub cache_root: PathBuf,
}

/// A process-wide set of task ids currently being dispatched, guarding
/// against picking up a task the poller has already handed to a worker.
#[derive(Debug, Default)]
pub struct InFlightTasks(Mutex<HashSet<u64>>);

impl InFlightTasks {
    /// Construct an empty set.
    pub fn new() -> Self {
        Self(Mutex::new(HashSet::new()))
    }

    fn enter(&self, id: u64) -> bool {
        self.0.lock().expect("in-flight task set lock poisoned").insert(id)
    }

    fn leave(&self, id: u64) {
        self.0.lock().expect("in-flight task set lock poisoned").remove(&id);
    }
}

#[derive(Debug, Deserialize)]
struct WorkflowFile {
    jobs: HashMap<String, JobSpec>,
}

#[derive(Debug, Deserialize)]
struct JobSpec {
    #[serde(rename = "if")]
    condition: Option<String>,
    #[serde(default)]
    steps: Vec<StepSpec>,
}

#[derive(Debug, Deserialize)]
struct StepSpec {
    id: Option<String>,
    name: Option<String>,
    #[serde(rename = "if")]
    condition: Option<String>,
    run: Option<String>,
    shell: Option<String>,
    #[serde(rename = "working-directory")]
    working_directory: Option<String>,
    uses: Option<String>,
    #[serde(default)]
    with: HashMap<String, Value>,
    #[serde(default)]
    env: HashMap<String, Value>,
    #[serde(rename = "timeout-minutes")]
    timeout_minutes: Option<u32>,
    #[serde(rename = "continue-on-error")]
    continue_on_error: Option<bool>,
}

const FEATURE_FLAGS: &[(&str, &str)] =
    &[("DistributedTask.NewActionMetadata", "true"), ("DistributedTask.EnhancedAnnotationFormat", "true")];

/// Translate and run `task` to completion, reporting its terminal result.
///
/// Returns an error only for conditions the caller (the poller loop) should
/// itself treat as exceptional: a duplicate dispatch, or a failure to reach
/// the Forge even to report that the task failed. Every other failure mode
/// (a malformed workflow, a `run:` step that exits non-zero, a Worker crash)
/// is caught and reported as a terminal `UpdateTask` call; the function
/// still returns `Ok(())` in those cases.
pub async fn run<R: RpcClient>(
    task: Task,
    config: &TranslatorConfig,
    rpc: &R,
    in_flight: &InFlightTasks,
) -> Result<(), Report<Error>> {
    let task_id = task.id();
    if !in_flight.enter(task_id) {
        return Err(Report::new(Error::DuplicateTask)).describe_lazy(|| format!("task {task_id}"));
    }
    let result = run_dispatched(task, config, rpc).await;
    in_flight.leave(task_id);
    result
}

async fn run_dispatched<R: RpcClient>(task: Task, config: &TranslatorConfig, rpc: &R) -> Result<(), Report<Error>> {
    let task_id = task.id();
    let started_at = time::OffsetDateTime::now_utc();

    let file: WorkflowFile = match serde_yaml::from_slice(task.workflow()) {
        Ok(file) => file,
        Err(err) => {
            warn!("task {task_id}: workflow did not parse as YAML: {err}");
            return finalize_without_worker(rpc, task_id, started_at, TaskResult::Failure).await;
        }
    };

    let job = match exactly_one_job(file) {
        Ok(job) => job,
        Err(err) => {
            warn!("task {task_id}: {err}");
            return finalize_without_worker(rpc, task_id, started_at, TaskResult::Failure).await;
        }
    };

    let env = expr::Environment { github: task.context().clone(), needs: task.needs().clone(), vars: task.vars().clone() };
    let raw_if = job.condition.clone().unwrap_or_else(|| "true".to_owned());
    let composed = format!("({}) && true || false", strip_interpolation(&raw_if));
    match expr::evaluate(&composed, &env) {
        Ok(Value::Bool(true)) => {}
        Ok(_) => return finalize_without_worker(rpc, task_id, started_at, TaskResult::Skipped).await,
        Err(err) => {
            warn!("task {task_id}: job `if` failed to evaluate: {err}");
            return finalize_without_worker(rpc, task_id, started_at, TaskResult::Failure).await;
        }
    }

    let steps = translate_steps(&job.steps);
    let step_ids: Vec<Uuid> = steps.iter().map(|step| step.id).collect();
    let state = TaskState::new(task_id, started_at, steps.len());

    let runtime_token = runtime_token(&task);
    let variables = build_variables(&task);
    let context_data = build_context_data(&task);
    let endpoint = Endpoint::new("http://127.0.0.1:0".to_owned(), runtime_token.clone());
    let job_message = JobRequestMessage::new(Resources { endpoint }, steps, variables, context_data);

    let server = match CallbackServer::start(
        job_message.clone(),
        runtime_token,
        config.server_url.clone(),
        config.actions_server_url.clone(),
        config.cache_root.clone(),
    )
    .await
    {
        Ok(server) => server,
        Err(err) => {
            warn!("task {task_id}: failed to start callback server: {err:#}");
            return finalize_without_worker(rpc, task_id, started_at, TaskResult::Failure).await;
        }
    };

    let (mut worker, mut sender) = match Worker::spawn(&config.worker_command) {
        Ok(pair) => pair,
        Err(err) => {
            warn!("task {task_id}: failed to spawn worker: {err:#}");
            server.shutdown().await;
            return finalize_without_worker(rpc, task_id, started_at, TaskResult::Failure).await;
        }
    };

    let job_for_worker = job_message.with_connection(format!("http://{}", server.addr()), None);
    if let Err(err) = sender.send_job_request(&job_for_worker).await {
        warn!("task {task_id}: failed to send job request to worker: {err:#}");
        let _ = worker.kill().await;
        server.shutdown().await;
        return finalize_without_worker(rpc, task_id, started_at, TaskResult::Failure).await;
    }

    let (exited_tx, exited_rx) = oneshot::channel();
    let pipeline = events::run(server, rpc, task_id, &step_ids, state, exited_rx);
    tokio::pin!(pipeline);

    let output_and_wait = async {
        let captured = worker.capture_output().await.unwrap_or_default();
        let exit_code = worker.wait().await.ok().flatten();
        (captured, exit_code)
    };
    tokio::pin!(output_and_wait);

    let mut exited_tx = Some(exited_tx);
    let mut pipeline_done = None;
    let (captured_output, exit_code) = loop {
        tokio::select! {
            result = &mut pipeline, if pipeline_done.is_none() => {
                if matches!(result.as_ref(), Ok((events::Outcome::Cancelled, ..))) {
                    let _ = sender.send_cancel(&job_for_worker).await;
                }
                pipeline_done = Some(result);
            }
            output = &mut output_and_wait => {
                if let Some(tx) = exited_tx.take() {
                    let _ = tx.send(());
                }
                break output;
            }
        }
    };

    let pipeline_result = match pipeline_done {
        Some(result) => result,
        None => pipeline.await,
    };
    let (outcome, mut final_state, outputs, global_log_index, server) =
        pipeline_result.change_context(Error::EventPipeline)?;
    server.shutdown().await;

    let stopped_at = time::OffsetDateTime::now_utc();
    let default_result = if outcome == events::Outcome::Cancelled { TaskResult::Cancelled } else { TaskResult::Failure };

    if outcome == events::Outcome::Cancelled {
        flush_log(rpc, task_id, global_log_index, Vec::new()).await?;
    } else if exit_code == Some(0) {
        let now = time::OffsetDateTime::now_utc();
        flush_log(rpc, task_id, global_log_index, vec![LogRow { timestamp: now, content: "Finished".to_owned() }]).await?;
    } else {
        let now = time::OffsetDateTime::now_utc();
        let mut rows: Vec<LogRow> =
            captured_output.lines().map(|line| LogRow { timestamp: now, content: line.to_owned() }).collect();
        rows.push(LogRow { timestamp: now, content: "##[error]worker exited without a successful status".to_owned() });
        flush_log(rpc, task_id, global_log_index, rows).await?;
    }

    final_state.finish(stopped_at, default_result);
    rpc.update_task(task_id, &final_state, Some(&outputs)).await.change_context(Error::UpdateTask)?;
    Ok(())
}

async fn finalize_without_worker<R: RpcClient>(
    rpc: &R,
    task_id: u64,
    started_at: time::OffsetDateTime,
    result: TaskResult,
) -> Result<(), Report<Error>> {
    let mut state = TaskState::new(task_id, started_at, 0);
    state.finish(time::OffsetDateTime::now_utc(), result);
    rpc.update_task(task_id, &state, None).await.change_context(Error::UpdateTask)?;
    Ok(())
}

async fn flush_log<R: RpcClient>(rpc: &R, task_id: u64, index: i64, rows: Vec<LogRow>) -> Result<(), Report<Error>> {
    rpc.update_log(task_id, index, rows, true).await.change_context(Error::UpdateLog)?;
    Ok(())
}

fn exactly_one_job(file: WorkflowFile) -> Result<JobSpec, &'static str> {
    let mut jobs = file.jobs.into_iter();
    let (_, job) = jobs.next().ok_or("workflow declares no jobs")?;
    if jobs.next().is_some() {
        return Err("workflow declares more than one job");
    }
    Ok(job)
}

fn runtime_token(task: &Task) -> ComparableSecretString {
    task.context().get("token").and_then(Value::as_str).map(ComparableSecretString::from).unwrap_or_else(|| "".into())
}

fn build_variables(task: &Task) -> HashMap<String, Variable> {
    let mut variables = HashMap::new();
    for (name, value) in FEATURE_FLAGS {
        variables.insert((*name).to_owned(), Variable::plain(*value));
    }
    for (name, secret) in task.secrets() {
        variables.insert(name.clone(), Variable::secret(secret.clone()));
    }
    variables
}

fn build_context_data(task: &Task) -> HashMap<String, Value> {
    let mut data = HashMap::new();
    data.insert("github".to_owned(), serde_json::to_value(task.context()).unwrap_or_default());
    data.insert("matrix".to_owned(), Value::Object(Default::default()));
    data.insert("strategy".to_owned(), Value::Object(Default::default()));
    data.insert("inputs".to_owned(), Value::Object(Default::default()));
    data.insert("needs".to_owned(), serde_json::to_value(task.needs()).unwrap_or_default());
    data.insert("vars".to_owned(), serde_json::to_value(task.vars()).unwrap_or_default());
    data
}

fn translate_steps(steps: &[StepSpec]) -> Vec<ActionStep> {
    steps.iter().map(translate_step).collect()
}

fn translate_step(step: &StepSpec) -> ActionStep {
    let reference = if let Some(script) = &step.run {
        StepReference::Script {
            script: script.clone(),
            shell: step.shell.clone(),
            working_directory: step.working_directory.clone(),
        }
    } else if let Some(uses) = &step.uses {
        translate_uses(uses)
    } else {
        StepReference::Script { script: String::new(), shell: None, working_directory: None }
    };

    let inputs = step.with.iter().map(|(k, v)| (k.clone(), yaml_value_to_token(v))).collect();
    let environment = step.env.iter().map(|(k, v)| (k.clone(), yaml_value_to_token(v))).collect();
    let condition = step.condition.as_deref().map(rewrite_if_expression);

    ActionStep {
        id: Uuid::new_v4(),
        context_name: step.id.clone(),
        display_name: step.name.clone().unwrap_or_else(|| default_display_name(step)),
        reference,
        inputs,
        environment,
        condition,
        timeout_in_minutes: step.timeout_minutes,
        continue_on_error: step.continue_on_error.unwrap_or(false),
    }
}

fn translate_uses(uses: &str) -> StepReference {
    if let Some(image) = uses.strip_prefix("docker://") {
        return StepReference::ContainerRegistry { image: image.to_owned() };
    }
    if uses.starts_with("https://") || uses.starts_with("http://") {
        let scheme = if uses.starts_with("https://") { "https" } else { "http" };
        let rest = &uses[scheme.len() + 3..];
        let (name_with_owner, reference) = split_reference(rest);
        return StepReference::Repository {
            repository_type: "GitHub".to_owned(),
            name_with_owner: format!("{scheme}~{name_with_owner}"),
            reference,
        };
    }
    if let Some(path) = uses.strip_prefix("./") {
        return StepReference::Repository { repository_type: "self".to_owned(), name_with_owner: path.to_owned(), reference: String::new() };
    }
    let (name_with_owner, reference) = split_reference(uses);
    StepReference::Repository { repository_type: "GitHub".to_owned(), name_with_owner, reference }
}

fn split_reference(value: &str) -> (String, String) {
    match value.rsplit_once('@') {
        Some((name, reference)) => (name.to_owned(), reference.to_owned()),
        None => (value.to_owned(), "main".to_owned()),
    }
}

fn strip_interpolation(expr: &str) -> String {
    let trimmed = expr.trim();
    match trimmed.strip_prefix("${{").and_then(|rest| rest.strip_suffix("}}")) {
        Some(inner) => inner.trim().to_owned(),
        None => trimmed.to_owned(),
    }
}

fn rewrite_if_expression(raw: &str) -> String {
    let stripped = strip_interpolation(raw);
    if contains_status_function(&stripped) {
        stripped
    } else {
        format!("success() && ({stripped})")
    }
}

fn contains_status_function(expr: &str) -> bool {
    ["success(", "always(", "failure(", "cancelled("].iter().any(|needle| expr.contains(needle))
}

fn yaml_value_to_token(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn default_display_name(step: &StepSpec) -> String {
    match (&step.run, &step.uses) {
        (Some(script), _) => {
            let first_line = script.lines().next().unwrap_or_default();
            format!("Run {first_line}")
        }
        (None, Some(uses)) => uses.clone(),
        (None, None) => "step".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_in_flight_tasks_are_rejected() {
        let set = InFlightTasks::new();
        assert!(set.enter(1));
        assert!(!set.enter(1));
        set.leave(1);
        assert!(set.enter(1));
    }

    #[test]
    fn translates_run_step_to_script_reference() {
        let step = StepSpec {
            id: None,
            name: None,
            condition: None,
            run: Some("echo hi".to_owned()),
            shell: None,
            working_directory: None,
            uses: None,
            with: HashMap::new(),
            env: HashMap::new(),
            timeout_minutes: None,
            continue_on_error: None,
        };
        let translated = translate_step(&step);
        assert!(matches!(translated.reference, StepReference::Script { .. }));
        assert_eq!(translated.display_name, "Run echo hi");
    }

    #[test]
    fn translates_docker_uses_to_container_registry() {
        let step = StepSpec {
            id: None,
            name: None,
            condition: None,
            run: None,
            shell: None,
            working_directory: None,
            uses: Some("docker://alpine:3.19".to_owned()),
            with: HashMap::new(),
            env: HashMap::new(),
            timeout_minutes: None,
            continue_on_error: None,
        };
        match translate_step(&step).reference {
            StepReference::ContainerRegistry { image } => assert_eq!(image, "alpine:3.19"),
            other => panic!("expected container registry reference, got {other:?}"),
        }
    }

    #[test]
    fn translates_absolute_url_uses_with_tilde_escape() {
        let reference = translate_uses("https://git.example.com/owner/repo/path@v1");
        match reference {
            StepReference::Repository { repository_type, name_with_owner, reference } => {
                assert_eq!(repository_type, "GitHub");
                assert_eq!(name_with_owner, "https~git.example.com/owner/repo/path");
                assert_eq!(reference, "v1");
            }
            other => panic!("expected repository reference, got {other:?}"),
        }
    }

    #[test]
    fn translates_relative_uses_with_implicit_main_ref() {
        let reference = translate_uses("actions/checkout");
        match reference {
            StepReference::Repository { name_with_owner, reference, .. } => {
                assert_eq!(name_with_owner, "actions/checkout");
                assert_eq!(reference, "main");
            }
            other => panic!("expected repository reference, got {other:?}"),
        }
    }

    #[test]
    fn translates_local_uses_to_self_repository() {
        let reference = translate_uses("./.github/actions/build");
        match reference {
            StepReference::Repository { repository_type, name_with_owner, reference } => {
                assert_eq!(repository_type, "self");
                assert_eq!(name_with_owner, ".github/actions/build");
                assert_eq!(reference, "");
            }
            other => panic!("expected repository reference, got {other:?}"),
        }
    }

    #[test]
    fn rewrite_injects_success_check_when_absent() {
        assert_eq!(rewrite_if_expression("${{ github.event_name == 'push' }}"), "success() && (github.event_name == 'push')");
    }

    #[test]
    fn rewrite_leaves_existing_status_check_alone() {
        assert_eq!(rewrite_if_expression("${{ always() }}"), "always()");
    }
}
