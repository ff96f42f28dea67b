//! `ActionDownloadInfo` resolves a plain `owner/repo@ref` action against the
//! configured Forge, retrying the archive probe with basic auth when the
//! unauthenticated HEAD request is rejected.

use std::collections::HashMap;

use axum::{extract::Request, http::StatusCode, routing::head, Router};
use runner_proxy::{
    callback::CallbackServer, ext::secrecy::ComparableSecretString, task::message::{Endpoint, JobRequestMessage, Resources},
};
use tokio::net::TcpListener;

async fn archive_head(request: Request) -> StatusCode {
    if request.headers().contains_key(axum::http::header::AUTHORIZATION) {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    }
}

async fn start_mock_gitea() -> String {
    let app = Router::new().route("/api/v1/repos/:owner/:repo/archive/:file", head(archive_head));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock gitea");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock gitea server");
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn resolves_relative_action_after_auth_probe_retry() {
    let gitea_url = start_mock_gitea().await;

    let endpoint = Endpoint::new("http://127.0.0.1:0".to_owned(), ComparableSecretString::from("runtime-token"));
    let job = JobRequestMessage::new(Resources { endpoint }, vec![], HashMap::new(), HashMap::new());

    let server = CallbackServer::start(
        job,
        ComparableSecretString::from("runtime-token"),
        gitea_url.clone(),
        gitea_url.clone(),
        std::env::temp_dir(),
    )
    .await
    .expect("start callback server");

    let http = reqwest::Client::new();
    let response = http
        .post(format!("http://{}/_apis/v1/ActionDownloadInfo", server.addr()))
        .json(&serde_json::json!({
            "actions": [{"nameWithOwner": "acme/widgets", "ref": "main"}]
        }))
        .send()
        .await
        .expect("post ActionDownloadInfo");

    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.expect("decode body");
    let resolved = &body["actions"]["acme/widgets@main"];
    assert_eq!(
        resolved["tarballUrl"],
        format!("{gitea_url}/api/v1/repos/acme/widgets/archive/main.tar.gz")
    );

    server.shutdown().await;
}
