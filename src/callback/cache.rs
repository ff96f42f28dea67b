//! A minimal directory-backed artifact cache, exposed under the callback
//! server's `/cache/*` fallthrough route once `/JobRequest` has handed the
//! Worker a `CacheServerUrl`.

use std::path::{Path, PathBuf};

use axum::{
    body::Bytes,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
};
use tokio::io::AsyncWriteExt;

/// Serve (`GET`) or store (`PUT`/`POST`) an artifact under `root`, keyed by
/// the request path past the `/cache/` prefix.
pub(super) async fn handle(root: &Path, method: Method, key: &str, body: Bytes) -> Response {
    let path = root.join(sanitize(key));
    match method {
        Method::GET => match tokio::fs::read(&path).await {
            Ok(contents) => (StatusCode::OK, contents).into_response(),
            Err(_) => StatusCode::NOT_FOUND.into_response(),
        },
        Method::PUT | Method::POST => store(&path, &body).await,
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn store(path: &Path, body: &[u8]) -> Response {
    let Some(parent) = path.parent() else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    if tokio::fs::create_dir_all(parent).await.is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let file = tokio::fs::File::create(path).await;
    match file {
        Ok(mut file) => match file.write_all(body).await {
            Ok(()) => StatusCode::CREATED.into_response(),
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        },
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Drop path-traversal segments so a malicious artifact key can't escape `root`.
fn sanitize(key: &str) -> PathBuf {
    key.split('/').filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..").collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_an_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let put = handle(dir.path(), Method::PUT, "a/b.tar", Bytes::from_static(b"hello")).await;
        assert_eq!(put.status(), StatusCode::CREATED);

        let get = handle(dir.path(), Method::GET, "a/b.tar", Bytes::new()).await;
        assert_eq!(get.status(), StatusCode::OK);
    }

    #[test]
    fn sanitize_strips_traversal_segments() {
        assert_eq!(sanitize("../../etc/passwd"), PathBuf::from("etc/passwd"));
    }
}
