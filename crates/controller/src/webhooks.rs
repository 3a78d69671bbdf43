//! Git push webhook verification and payload parsing.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::Result;

type HmacSha256 = Hmac<Sha256>;

pub const GITHUB_SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const GITHUB_EVENT_HEADER: &str = "x-github-event";
pub const GITLAB_TOKEN_HEADER: &str = "x-gitlab-token";
pub const GITLAB_EVENT_HEADER: &str = "x-gitlab-event";

pub const GITHUB_PUSH_EVENT: &str = "push";
pub const GITLAB_PUSH_EVENT: &str = "Push Hook";

const SIGNATURE_PREFIX: &str = "sha256=";
const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// Verify a GitHub `X-Hub-Signature-256` header (`sha256=<hex>`).
///
/// HMAC-SHA256 over the raw body, compared in constant time.
#[must_use]
pub fn verify_github_signature(body: &[u8], signature: &str, secret: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(hex_digest) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    computed.as_slice().ct_eq(&signature_bytes).into()
}

/// GitLab sends the shared secret verbatim in `X-Gitlab-Token`.
#[must_use]
pub fn verify_gitlab_token(token: &str, secret: &str) -> bool {
    token.as_bytes().ct_eq(secret.as_bytes()).into()
}

/// A push normalized across providers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PushEvent {
    pub repo_url: String,
    pub branch: String,
    pub commit_sha: String,
    pub pusher: String,
}

fn branch_from_ref(git_ref: &str) -> String {
    git_ref
        .strip_prefix(BRANCH_REF_PREFIX)
        .unwrap_or(git_ref)
        .to_string()
}

#[derive(Debug, Deserialize)]
struct GithubPush {
    #[serde(rename = "ref", default)]
    git_ref: String,
    #[serde(default)]
    after: String,
    repository: GithubRepository,
    #[serde(default)]
    pusher: Option<GithubPusher>,
}

#[derive(Debug, Deserialize)]
struct GithubRepository {
    #[serde(default)]
    clone_url: String,
}

#[derive(Debug, Deserialize)]
struct GithubPusher {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct GitlabPush {
    #[serde(rename = "ref", default)]
    git_ref: String,
    #[serde(default)]
    checkout_sha: Option<String>,
    #[serde(default)]
    after: String,
    project: GitlabProject,
    #[serde(default)]
    user_username: String,
}

#[derive(Debug, Deserialize)]
struct GitlabProject {
    #[serde(default)]
    git_http_url: String,
}

/// Parse a GitHub `push` event body.
pub fn parse_github_push(body: &[u8]) -> Result<PushEvent> {
    let push: GithubPush = serde_json::from_slice(body)?;
    Ok(PushEvent {
        repo_url: push.repository.clone_url,
        branch: branch_from_ref(&push.git_ref),
        commit_sha: push.after,
        pusher: push.pusher.map(|p| p.name).unwrap_or_default(),
    })
}

/// Parse a GitLab `Push Hook` body. Branch deletions carry no `checkout_sha`.
pub fn parse_gitlab_push(body: &[u8]) -> Result<PushEvent> {
    let push: GitlabPush = serde_json::from_slice(body)?;
    Ok(PushEvent {
        repo_url: push.project.git_http_url,
        branch: branch_from_ref(&push.git_ref),
        commit_sha: push.checkout_sha.unwrap_or(push.after),
        pusher: push.user_username,
    })
}
