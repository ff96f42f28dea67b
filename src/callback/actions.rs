//! Resolving `{nameWithOwner, ref}` action references into downloadable
//! tarball/zipball URLs for `/_apis/v1/ActionDownloadInfo`.

use error_stack::Report;
use secrecy::ExposeSecret;
use url::Url;

use crate::ext::{error_stack::DescribeContext, iter::AlternativeIter};

use super::server::Shared;

/// Errors possibly surfaced resolving an action reference.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// None of the candidate server URLs authenticated a HEAD probe for the archive.
    #[error("no candidate server could serve this action's archive")]
    Unreachable,
}

/// A resolved action: where the Worker should fetch its tarball/zipball from.
pub struct ResolvedAction {
    /// The resolved tarball download URL.
    pub tarball_url: String,
    /// The resolved zipball download URL.
    pub zipball_url: String,
}

/// Resolve one action reference.
///
/// `name_with_owner` is either a tilde-escaped absolute URL (produced by the
/// task translator's rewrite of `uses: http(s)://…`) or a plain
/// `owner/repo[/path]` reference.
pub(super) async fn resolve(
    shared: &Shared,
    name_with_owner: &str,
    reference: &str,
) -> Result<ResolvedAction, Report<Error>> {
    match decode_absolute(name_with_owner) {
        Some(url) => resolve_absolute(shared, &url, reference).await,
        None => resolve_relative(shared, name_with_owner, reference).await,
    }
}

fn decode_absolute(name_with_owner: &str) -> Option<Url> {
    for scheme in ["https~", "http~"] {
        if let Some(rest) = name_with_owner.strip_prefix(scheme) {
            let scheme_name = &scheme[..scheme.len() - 1];
            return Url::parse(&format!("{scheme_name}://{rest}")).ok();
        }
    }
    None
}

async fn resolve_absolute(shared: &Shared, url: &Url, reference: &str) -> Result<ResolvedAction, Report<Error>> {
    let path = url.path().trim_start_matches('/');
    let mut segments = path.splitn(2, '/');
    let owner = segments.next().unwrap_or_default();
    let repo = segments.next().and_then(|rest| rest.split('/').next()).unwrap_or_default();

    let resolved = if url.host_str() == Some("github.com") {
        ResolvedAction {
            tarball_url: format!("https://github.com/{owner}/{repo}/archive/{reference}.tar.gz"),
            zipball_url: format!("https://github.com/{owner}/{repo}/archive/{reference}.zip"),
        }
    } else {
        let scheme = url.scheme();
        let host = url.host_str().unwrap_or_default();
        let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
        ResolvedAction {
            tarball_url: format!("{scheme}://{host}{port}/api/v1/repos/{owner}/{repo}/archive/{reference}.tar.gz"),
            zipball_url: format!("{scheme}://{host}{port}/api/v1/repos/{owner}/{repo}/archive/{reference}.zip"),
        }
    };

    // An auth override registered against the original (pre-decode) URL would
    // be attached here; none are currently populated by the task translator.
    let _ = shared.action_auth_overrides.lock().await;
    Ok(resolved)
}

async fn resolve_relative(
    shared: &Shared,
    name_with_owner: &str,
    reference: &str,
) -> Result<ResolvedAction, Report<Error>> {
    let mut parts = name_with_owner.splitn(3, '/');
    let owner = parts.next().unwrap_or_default();
    let repo = parts.next().unwrap_or_default();

    let mut candidates = vec![shared.server_url.clone()];
    if shared.actions_server_url != shared.server_url {
        candidates.push(shared.actions_server_url.clone());
    }

    let mut attempts = Vec::with_capacity(candidates.len());
    for candidate in &candidates {
        attempts.push(probe_candidate(shared, candidate, owner, repo, reference).await);
    }

    match attempts.into_iter().alternative_fold() {
        Ok(resolved) => Ok(resolved),
        Err(_unauthenticated) => {
            let base = &candidates[0];
            let tarball_target = format!("{base}/api/v1/repos/{owner}/{repo}/archive/{reference}.tar.gz");
            let zipball_target = format!("{base}/api/v1/repos/{owner}/{repo}/archive/{reference}.zip");
            Ok(ResolvedAction {
                tarball_url: format!(
                    "{}/_apis/v1/ActionDownload?url={}",
                    shared.external_base_url,
                    encode(&tarball_target)
                ),
                zipball_url: format!(
                    "{}/_apis/v1/ActionDownload?url={}",
                    shared.external_base_url,
                    encode(&zipball_target)
                ),
            })
        }
    }
}

async fn probe_candidate(
    shared: &Shared,
    candidate: &str,
    owner: &str,
    repo: &str,
    reference: &str,
) -> Result<ResolvedAction, Report<Error>> {
    let tarball_url = format!("{candidate}/api/v1/repos/{owner}/{repo}/archive/{reference}.tar.gz");
    let zipball_url = format!("{candidate}/api/v1/repos/{owner}/{repo}/archive/{reference}.zip");

    if head_ok(shared, &tarball_url, false).await || head_ok(shared, &tarball_url, true).await {
        return Ok(ResolvedAction { tarball_url, zipball_url });
    }

    Err(Report::new(Error::Unreachable)).describe_lazy(|| format!("probing '{tarball_url}' with and without auth"))
}

async fn head_ok(shared: &Shared, url: &str, with_auth: bool) -> bool {
    let mut request = shared.http.head(url);
    if with_auth {
        request = request.basic_auth("x-access-token", Some(shared.runtime_token.expose_secret()));
    }
    matches!(request.send().await, Ok(resp) if resp.status().is_success())
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_tilde_escaped_github_url() {
        let url = decode_absolute("https~//github.com/owner/repo/path").expect("decodes");
        assert_eq!(url.host_str(), Some("github.com"));
        assert_eq!(url.path(), "/owner/repo/path");
    }

    #[test]
    fn plain_reference_is_not_absolute() {
        assert!(decode_absolute("owner/repo/path").is_none());
    }
}
