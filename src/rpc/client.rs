//! The production [`RpcClient`](super::RpcClient) implementation, talking to
//! the Forge over HTTP using `reqwest`. Every call carries the `x-runner-uuid`/
//! `x-runner-token` headers the server expects.

use std::{collections::HashMap, future::Future, time::Duration};

use async_trait::async_trait;
use error_stack::{Report, ResultExt};
use indoc::indoc;
use secrecy::ExposeSecret;
use tokio_retry::{strategy::jitter, strategy::ExponentialBackoff, Retry};
use tracing::warn;
use uuid::Uuid;

use crate::ext::{
    error_stack::{DescribeContext, ErrorHelper, IntoContext},
    secrecy::ComparableSecretString,
};
use crate::task::{TaskResult, TaskState};

use super::{Error, FetchTaskResponse, LogRow, RpcClient, RunnerInfo, UpdateLogResponse, UpdateTaskResponse};

/// A connection to the Forge's RPC surface over HTTP.
pub struct ConnectRpcClient {
    http: reqwest::Client,
    base_url: String,
    uuid: Uuid,
    token: ComparableSecretString,
}

impl ConnectRpcClient {
    /// Construct a new client. `base_url` should include the protocol and host,
    /// e.g. `https://forge.example.com`.
    pub fn new(base_url: String, uuid: Uuid, token: ComparableSecretString) -> Result<Self, Report<Error>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context(Error::Transport)
            .help("this is usually a TLS or DNS configuration problem in the host environment")?;
        Ok(Self { http, base_url, uuid, token })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.http
            .request(method, url)
            .header("x-runner-uuid", self.uuid.to_string())
            .header("x-runner-token", self.token.expose_secret())
    }

    async fn call<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, Report<Error>> {
        let response = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await
            .context(Error::Transport)
            .describe_lazy(|| format!("calling '{path}'"))?;

        match response.status() {
            status if status == reqwest::StatusCode::NOT_IMPLEMENTED => Err(Report::new(Error::Unimplemented)),
            status if status == reqwest::StatusCode::CONFLICT => Err(Report::new(Error::DataLock)),
            status if status.is_success() => response
                .json()
                .await
                .context(Error::Decode)
                .describe_lazy(|| format!("decoding response from '{path}'")),
            _ => Err(Report::new(Error::ServerError))
                .describe_lazy(|| format!("'{path}' returned {}", response.status())),
        }
    }
}

#[async_trait]
impl RpcClient for ConnectRpcClient {
    async fn ping(&self, data: Vec<u8>) -> Result<Vec<u8>, Report<Error>> {
        #[derive(serde::Serialize)]
        struct PingRequest {
            data: Vec<u8>,
        }
        #[derive(serde::Deserialize)]
        struct PingResponse {
            data: Vec<u8>,
        }
        self.call::<_, PingResponse>("/Ping", &PingRequest { data })
            .await
            .map(|r| r.data)
    }

    async fn declare(&self, version: &str, labels: &[String]) -> Result<RunnerInfo, Report<Error>> {
        #[derive(serde::Serialize)]
        struct DeclareRequest<'a> {
            version: &'a str,
            labels: &'a [String],
        }
        #[derive(serde::Deserialize)]
        struct Wire {
            id: u64,
            uuid: Uuid,
            name: String,
            token: String,
            ephemeral: bool,
        }
        self.call::<_, Wire>("/Declare", &DeclareRequest { version, labels })
            .await
            .map(|w| RunnerInfo {
                id: w.id,
                uuid: w.uuid,
                name: w.name,
                token: ComparableSecretString::from(w.token),
                ephemeral: w.ephemeral,
            })
    }

    async fn register(
        &self,
        name: &str,
        token: &ComparableSecretString,
        labels: &[String],
        ephemeral: bool,
    ) -> Result<RunnerInfo, Report<Error>> {
        #[derive(serde::Serialize)]
        struct RegisterRequest<'a> {
            name: &'a str,
            token: &'a str,
            agent_labels: &'a [String],
            ephemeral: bool,
        }
        #[derive(serde::Deserialize)]
        struct Wire {
            id: u64,
            uuid: Uuid,
            name: String,
            token: String,
            ephemeral: bool,
        }
        let request = RegisterRequest { name, token: token.expose_secret(), agent_labels: labels, ephemeral };
        self.call::<_, Wire>("/Register", &request).await.map(|w| RunnerInfo {
            id: w.id,
            uuid: w.uuid,
            name: w.name,
            token: ComparableSecretString::from(w.token),
            ephemeral: w.ephemeral,
        })
    }

    async fn fetch_task(&self, tasks_version: i64) -> Result<FetchTaskResponse, Report<Error>> {
        #[derive(serde::Serialize)]
        struct FetchTaskRequest {
            tasks_version: i64,
        }
        #[derive(serde::Deserialize)]
        struct Wire {
            task: Option<serde_json::Value>,
            tasks_version: i64,
        }
        let wire: Wire = self
            .call("/FetchTask", &FetchTaskRequest { tasks_version })
            .await?;
        let task = wire
            .task
            .map(|value| serde_json::from_value(value).context(Error::Decode))
            .transpose()?;
        Ok(FetchTaskResponse::new(task, wire.tasks_version))
    }

    async fn update_task(
        &self,
        task_id: u64,
        state: &TaskState,
        outputs: Option<&HashMap<String, String>>,
    ) -> Result<UpdateTaskResponse, Report<Error>> {
        #[derive(serde::Serialize)]
        struct UpdateTaskRequest<'a> {
            task_id: u64,
            result: TaskResult,
            outputs: Option<&'a HashMap<String, String>>,
        }
        #[derive(serde::Deserialize)]
        struct Wire {
            result: TaskResult,
        }
        let request = UpdateTaskRequest { task_id, result: state.result(), outputs };
        self.call::<_, Wire>("/UpdateTask", &request)
            .await
            .map(|w| UpdateTaskResponse::new(w.result))
    }

    async fn update_log(
        &self,
        task_id: u64,
        index: i64,
        rows: Vec<LogRow>,
        no_more: bool,
    ) -> Result<UpdateLogResponse, Report<Error>> {
        #[derive(serde::Serialize)]
        struct Row<'a> {
            timestamp: String,
            content: &'a str,
        }
        #[derive(serde::Serialize)]
        struct UpdateLogRequest<'a> {
            task_id: u64,
            index: i64,
            rows: Vec<Row<'a>>,
            no_more: bool,
        }
        #[derive(serde::Deserialize)]
        struct Wire {
            ack_index: i64,
        }
        let rows = rows
            .iter()
            .map(|row| Row {
                timestamp: row.timestamp.to_string(),
                content: &row.content,
            })
            .collect();
        let request = UpdateLogRequest { task_id, index, rows, no_more };
        self.call::<_, Wire>("/UpdateLog", &request)
            .await
            .map(|w| UpdateLogResponse { ack_index: w.ack_index })
    }
}

/// Retry `action`, using an exponential backoff with jitter starting at 1
/// second and capped at ten attempts.
///
/// Each failed attempt is logged as a warning labeled with `label`; if the
/// overall retry budget is exhausted, the returned error carries help text
/// pointing the operator at those warnings.
pub async fn retry_default<S, A, F, T>(label: S, action: A) -> Result<T, Report<Error>>
where
    S: AsRef<str>,
    A: Fn() -> F,
    F: Future<Output = Result<T, Report<Error>>>,
{
    let wrapped = || async {
        match action().await {
            Ok(result) => Ok(result),
            Err(err) => {
                warn!("{}: attempt failed, will retry. error: {err:#}", label.as_ref());
                Err(err)
            }
        }
    };

    let strategy = ExponentialBackoff::from_millis(1000).map(jitter).take(10);
    Retry::spawn(strategy, wrapped).await.help(indoc! {"
        Each time this operation was attempted, it logged a warning; please review those
        warnings in the logs for more details.
    "})
}
