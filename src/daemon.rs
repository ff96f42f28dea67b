//! Wires the RPC client, poller, and task translator together into the
//! runnable `daemon` subcommand: declare this runner to the Forge, then poll
//! and dispatch tasks until told to stop.

use std::sync::Arc;

use error_stack::{Report, ResultExt};
use tracing::{info, warn};

use crate::{
    config::{DaemonArgs, RunnerConfig},
    doc::{crate_version, link},
    ext::error_stack::{DescribeContext, ErrorDocReference, ErrorHelper, IntoContext},
    poller::{Poller, Shutdown},
    rpc::{client::retry_default, ConnectRpcClient, Error as RpcError, RpcClient},
    task::translate::{InFlightTasks, TranslatorConfig},
};

/// Errors possibly surfaced running the daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Constructing the RPC client failed.
    #[error("construct RPC client")]
    BuildRpcClient,

    /// Declaring this runner's version and labels to the Forge failed.
    #[error("declare runner to forge")]
    Declare,

    /// Listening for the OS shutdown signal failed.
    #[error("listen for shutdown signal")]
    SignalListener,

    /// The poll loop itself failed.
    #[error("run poll loop")]
    Poll,
}

/// Run the daemon to completion: polls and dispatches tasks until `args`
/// requests a single dispatch (`--once`) or the process receives ctrl-c.
pub async fn run(args: &DaemonArgs, runner: &RunnerConfig) -> Result<(), Report<Error>> {
    let base_url = format!("{}://{}", args.rpc_proto(), args.rpc_host());
    let rpc = ConnectRpcClient::new(base_url.clone(), *runner.uuid(), runner.token().clone())
        .change_context(Error::BuildRpcClient)?;
    let rpc = Arc::new(rpc);

    declare(rpc.as_ref(), runner.labels()).await?;

    let capacity = args.capacity().unwrap_or(runner.capacity()).max(1) as usize;
    let config = TranslatorConfig {
        worker_command: runner.runner_worker().clone(),
        server_url: base_url.clone(),
        actions_server_url: base_url,
        cache_root: args.data_root().join("cache"),
    };

    let poller = Poller::new(capacity);
    let in_flight = Arc::new(InFlightTasks::new());
    let shutdown = Shutdown::new();

    info!(capacity, once = args.once(), "starting poll loop");

    tokio::select! {
        result = poller.poll(rpc, config, in_flight, args.once(), &shutdown) => result.change_context(Error::Poll)?,
        signal = tokio::signal::ctrl_c() => {
            signal.context(Error::SignalListener)?;
            info!("received shutdown signal, draining in-flight tasks");
            shutdown.trigger();
        }
    }

    poller.wait().await;
    info!("daemon stopped");
    Ok(())
}

/// Declare this runner's version and labels, tolerating servers that don't
/// implement `Declare` yet.
///
/// `Unimplemented` is a permanent condition (an older Forge version), so it's
/// checked before reaching for [`retry_default`]'s backoff — retrying would
/// only add startup latency for a call that will never succeed.
async fn declare<R: RpcClient>(rpc: &R, labels: &[String]) -> Result<(), Report<Error>> {
    let version = crate_version();
    match rpc.declare(version, labels).await {
        Ok(info) => {
            info!(runner_id = info.id(), "declared to forge");
            Ok(())
        }
        Err(err) if matches!(err.current_context(), RpcError::Unimplemented) => {
            warn!("forge does not implement Declare; continuing without it");
            Ok(())
        }
        Err(_) => retry_default("Declare", || rpc.declare(version, labels))
            .await
            .map(|info| info!(runner_id = info.id(), "declared to forge"))
            .change_context(Error::Declare)
            .describe("calling Declare on daemon startup")
            .documentation_lazy(link::labels_reference)
            .help("check that RPC_HOST/RPC_PROTO point at a reachable Forge server"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::{
        ext::secrecy::ComparableSecretString,
        rpc::{FetchTaskResponse, LogRow, RunnerInfo, UpdateLogResponse, UpdateTaskResponse},
        task::TaskState,
    };

    struct UnimplementedDeclareRpc {
        declare_calls: AtomicUsize,
    }

    #[async_trait]
    impl RpcClient for UnimplementedDeclareRpc {
        async fn ping(&self, data: Vec<u8>) -> Result<Vec<u8>, Report<RpcError>> {
            Ok(data)
        }

        async fn declare(&self, _version: &str, _labels: &[String]) -> Result<RunnerInfo, Report<RpcError>> {
            self.declare_calls.fetch_add(1, Ordering::SeqCst);
            Err(Report::new(RpcError::Unimplemented))
        }

        async fn register(
            &self,
            name: &str,
            token: &ComparableSecretString,
            _labels: &[String],
            ephemeral: bool,
        ) -> Result<RunnerInfo, Report<RpcError>> {
            Ok(RunnerInfo { id: 1, uuid: Uuid::nil(), name: name.to_owned(), token: token.clone(), ephemeral })
        }

        async fn fetch_task(&self, _tasks_version: i64) -> Result<FetchTaskResponse, Report<RpcError>> {
            Ok(FetchTaskResponse::new(None, 0))
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

    #[tokio::test]
    async fn declare_tolerates_unimplemented_servers() {
        let rpc = UnimplementedDeclareRpc { declare_calls: AtomicUsize::new(0) };
        let result = declare(&rpc, &["self-hosted".to_owned()]).await;
        assert!(result.is_ok(), "Declare returning Unimplemented must not fail startup");
        assert_eq!(rpc.declare_calls.load(Ordering::SeqCst), 1);
    }
}
