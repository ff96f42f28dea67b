//! The callback server itself: the axum router, its shared state, and the
//! event channel the [`crate::events`] pipeline drains.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use error_stack::{Report, ResultExt};
use futures::stream;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, Mutex, Notify},
};
use tracing::{error, warn};
use uuid::Uuid;

use crate::ext::error_stack::IntoContext;
use crate::ext::secrecy::ComparableSecretString;
use crate::task::message::JobRequestMessage;

use super::Error;

/// An event captured from a Worker HTTP call, forwarded to the event pipeline.
#[derive(Debug, Clone)]
pub enum Event {
    /// A batch of log lines attributed to one step.
    LineFeed {
        /// The Worker-assigned step/record GUID the lines belong to.
        step_id: Uuid,
        /// The captured lines, in order.
        lines: Vec<String>,
    },
    /// A timeline record update (job or step).
    Timeline(TimelineRecord),
    /// The terminal job event.
    Job {
        /// The job's final result, as reported by the Worker (lowercased).
        result: String,
        /// The job's declared outputs.
        outputs: HashMap<String, String>,
    },
}

/// A Worker-emitted status object for a job or step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineRecord {
    /// The record's GUID; for a step this is the step's identity throughout the run.
    pub id: Uuid,
    /// The record's position in the timeline, if known.
    #[serde(default)]
    pub order: Option<i64>,
    /// The record's display name.
    #[serde(default)]
    pub name: Option<String>,
    /// The record's result (`succeeded`, `failed`, `skipped`, ...), once known.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default, rename = "startTime")]
    pub start_time: Option<String>,
    #[serde(default, rename = "finishTime")]
    pub finish_time: Option<String>,
}

/// State shared across every callback HTTP handler for one in-flight task.
pub(crate) struct Shared {
    pub(crate) job: Mutex<JobRequestMessage>,
    pub(crate) runtime_token: ComparableSecretString,
    pub(crate) events_tx: mpsc::Sender<Event>,
    pub(crate) cancel_notify: Notify,
    pub(crate) cancelled: AtomicBool,
    pub(crate) stop_notify: Notify,
    pub(crate) server_url: String,
    pub(crate) actions_server_url: String,
    pub(crate) action_auth_overrides: Mutex<HashMap<String, String>>,
    pub(crate) cache_root: PathBuf,
    pub(crate) cache_server_url: Mutex<Option<String>>,
    pub(crate) http: reqwest::Client,
    pub(crate) external_base_url: String,
}

/// A running callback server instance, scoped to one in-flight task.
pub struct CallbackServer {
    addr: std::net::SocketAddr,
    shared: Arc<Shared>,
    events_rx: mpsc::Receiver<Event>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: tokio::task::JoinHandle<()>,
}

impl CallbackServer {
    /// Bind an ephemeral listener and start serving. The returned server's
    /// [`CallbackServer::addr`] is what gets baked into the Worker's job
    /// request message as the `SYSTEMVSSCONNECTION` URL.
    pub async fn start(
        job: JobRequestMessage,
        runtime_token: ComparableSecretString,
        server_url: String,
        actions_server_url: String,
        cache_root: PathBuf,
    ) -> Result<Self, Report<Error>> {
        let listener = TcpListener::bind("0.0.0.0:0").await.context(Error::Bind)?;
        let addr = listener.local_addr().context(Error::Bind)?;
        let (events_tx, events_rx) = mpsc::channel(256);

        let shared = Arc::new(Shared {
            job: Mutex::new(job),
            runtime_token,
            events_tx,
            cancel_notify: Notify::new(),
            cancelled: AtomicBool::new(false),
            stop_notify: Notify::new(),
            server_url,
            actions_server_url,
            action_auth_overrides: Mutex::new(HashMap::new()),
            cache_root,
            cache_server_url: Mutex::new(None),
            http: reqwest::Client::new(),
            external_base_url: format!("http://{addr}"),
        });

        let app = router(shared.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(async move {
            let serving = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serving.await {
                error!("callback server exited with an error: {err}");
            }
        });

        Ok(Self { addr, shared, events_rx, shutdown_tx: Some(shutdown_tx), join })
    }

    /// The address the Worker should connect back to.
    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    /// Await the next captured event, or `None` once the server has shut down.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events_rx.recv().await
    }

    /// Signal cancellation: `/WaitForCancellation` wakes and returns `cancelled`.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.cancel_notify.notify_waiters();
    }

    /// Tear down the listener and background task, waking any in-flight
    /// `/WaitForCancellation` long-poll with a final `stopped` line.
    pub async fn shutdown(mut self) {
        self.shared.stop_notify.notify_waiters();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(err) = self.join.await {
            warn!("callback server task panicked during shutdown: {err}");
        }
    }
}

fn router(shared: Arc<Shared>) -> Router {
    Router::new()
        .route("/_apis/connectionData", get(connection_data))
        .route("/_apis/v1/Timeline/:timeline_id", post(post_timeline))
        .route(
            "/_apis/v1/TimeLineWebConsoleLog/:timeline_id/:record_id",
            post(post_console_log),
        )
        .route("/_apis/v1/Logfiles", post(post_logfile_metadata))
        .route("/_apis/v1/Logfiles/:log_id", post(post_logfile_upload))
        .route("/_apis/v1/FinishJob", post(finish_job))
        .route("/_apis/v1/ActionDownloadInfo", post(action_download_info))
        .route("/_apis/v1/ActionDownload", get(action_download))
        .route("/_apis/pipelines/workflows/*rest", any(proxy_pipelines))
        .route("/JobRequest", get(job_request))
        .route("/WaitForCancellation", get(wait_for_cancellation))
        .fallback(fallback)
        .with_state(shared)
}

async fn connection_data() -> impl IntoResponse {
    Json(serde_json::json!({
        "locationServiceData": {
            "serviceDefinitions": [
                {"id": "timeline", "relativePath": "/_apis/v1/Timeline/{timelineId}"},
                {"id": "logfiles", "relativePath": "/_apis/v1/Logfiles/{logId}"},
                {"id": "consoleLog", "relativePath": "/_apis/v1/TimeLineWebConsoleLog/{timelineId}/{recordId}"},
            ]
        }
    }))
}

#[derive(Deserialize, Serialize)]
struct TimelineRecordWrapper {
    value: Vec<TimelineRecord>,
}

async fn post_timeline(
    State(shared): State<Arc<Shared>>,
    Path(_timeline_id): Path<Uuid>,
    Json(body): Json<TimelineRecordWrapper>,
) -> impl IntoResponse {
    for record in &body.value {
        let _ = shared.events_tx.send(Event::Timeline(record.clone())).await;
    }
    Json(body)
}

#[derive(Deserialize)]
struct WebConsoleLogLines {
    value: Vec<String>,
}

async fn post_console_log(
    State(shared): State<Arc<Shared>>,
    Path((_timeline_id, record_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<WebConsoleLogLines>,
) -> impl IntoResponse {
    let _ = shared.events_tx.send(Event::LineFeed { step_id: record_id, lines: body.value }).await;
    StatusCode::OK
}

async fn post_logfile_upload(Path(log_id): Path<Uuid>, _body: Bytes) -> impl IntoResponse {
    Json(serde_json::json!({ "id": log_id }))
}

async fn post_logfile_metadata(Json(mut body): Json<serde_json::Value>) -> impl IntoResponse {
    if let Some(object) = body.as_object_mut() {
        object.insert("id".to_owned(), serde_json::json!(Uuid::new_v4()));
    }
    Json(body)
}

#[derive(Deserialize)]
struct JobEventWire {
    result: String,
    #[serde(default)]
    outputs: HashMap<String, OutputWire>,
}

#[derive(Deserialize)]
struct OutputWire {
    value: String,
}

async fn finish_job(State(shared): State<Arc<Shared>>, Json(body): Json<JobEventWire>) -> impl IntoResponse {
    let outputs = body.outputs.into_iter().map(|(k, v)| (k, v.value)).collect();
    let _ = shared.events_tx.send(Event::Job { result: body.result, outputs }).await;
    StatusCode::OK
}

#[derive(Deserialize)]
struct ActionDownloadInfoRequest {
    actions: Vec<ActionRefWire>,
}

#[derive(Deserialize, Clone)]
struct ActionRefWire {
    #[serde(rename = "nameWithOwner")]
    name_with_owner: String,
    #[serde(rename = "ref")]
    reference: String,
}

#[derive(Serialize)]
struct ResolvedActionWire {
    #[serde(rename = "tarballUrl")]
    tarball_url: String,
    #[serde(rename = "zipballUrl")]
    zipball_url: String,
}

async fn action_download_info(
    State(shared): State<Arc<Shared>>,
    Json(req): Json<ActionDownloadInfoRequest>,
) -> impl IntoResponse {
    let mut actions = HashMap::new();
    for action in req.actions {
        let key = format!("{}@{}", action.name_with_owner, action.reference);
        match super::actions::resolve(&shared, &action.name_with_owner, &action.reference).await {
            Ok(resolved) => {
                actions.insert(
                    key,
                    ResolvedActionWire { tarball_url: resolved.tarball_url, zipball_url: resolved.zipball_url },
                );
            }
            Err(err) => warn!("resolving action download info for '{key}' failed: {err:#}"),
        }
    }
    Json(serde_json::json!({ "actions": actions }))
}

#[derive(Deserialize)]
struct ActionDownloadQuery {
    url: String,
}

async fn action_download(State(shared): State<Arc<Shared>>, Query(q): Query<ActionDownloadQuery>) -> Response {
    match shared
        .http
        .get(&q.url)
        .header("x-access-token", shared.runtime_token.expose_secret())
        .send()
        .await
    {
        Ok(resp) => {
            let status = resp.status();
            (status, Body::from_stream(resp.bytes_stream())).into_response()
        }
        Err(err) => (StatusCode::BAD_GATEWAY, format!("fetching '{}' failed: {err}", q.url)).into_response(),
    }
}

async fn proxy_pipelines(
    State(shared): State<Arc<Shared>>,
    method: Method,
    uri: Uri,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().strip_prefix("/_apis/pipelines/workflows").unwrap_or("");
    let target = format!("{}/api/actions_pipeline{path}", shared.server_url);

    let mut request = shared.http.request(method, &target).body(body);
    for (name, value) in headers.iter() {
        if *name == header::HOST {
            continue;
        }
        request = request.header(name, value);
    }

    match request.send().await {
        Ok(resp) => {
            let status = resp.status();
            let bytes = resp.bytes().await.unwrap_or_default();
            (status, bytes).into_response()
        }
        Err(err) => (StatusCode::BAD_GATEWAY, format!("proxying to '{target}' failed: {err}")).into_response(),
    }
}

#[derive(Deserialize)]
struct JobRequestQuery {
    url: Option<String>,
}

async fn job_request(State(shared): State<Arc<Shared>>, Query(q): Query<JobRequestQuery>) -> impl IntoResponse {
    let cache_url = {
        let mut guard = shared.cache_server_url.lock().await;
        if guard.is_none() {
            *guard = Some(format!("{}/cache", shared.external_base_url));
        }
        guard.clone()
    };

    let url = q.url.unwrap_or_else(|| shared.external_base_url.clone());
    let mut job = shared.job.lock().await;
    *job = job.clone().with_connection(url, cache_url);
    Json(job.clone())
}

/// Long-poll: a `ping` line every 10s, then a single terminal line — either
/// `cancelled` once the task is cancelled, or `stopped` once the server is
/// torn down — after which the stream ends.
async fn wait_for_cancellation(State(shared): State<Arc<Shared>>) -> impl IntoResponse {
    let headers = [(header::CONTENT_TYPE, "text/plain; charset=utf-8")];
    let body = Body::from_stream(stream::unfold(Some(shared), |state| async move {
        let shared = state?;
        if shared.cancelled.load(Ordering::SeqCst) {
            return Some((Ok::<_, std::io::Error>("cancelled\n\n".to_owned()), None));
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(10)) => {
                Some((Ok("ping\n".to_owned()), Some(shared)))
            }
            _ = shared.cancel_notify.notified() => {
                Some((Ok("cancelled\n\n".to_owned()), None))
            }
            _ = shared.stop_notify.notified() => {
                Some((Ok("stopped\n\n".to_owned()), None))
            }
        }
    }));
    (headers, body)
}

async fn fallback(State(shared): State<Arc<Shared>>, method: Method, uri: Uri, body: Bytes) -> Response {
    match uri.path().strip_prefix("/cache/") {
        Some(key) => super::cache::handle(&shared.cache_root, method, key, body).await,
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}
