//! GitHub pull-request webhook: turns PR lifecycle events into Environment
//! create and delete requests. Holds no state of its own; every request
//! performs at most one store mutation.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{validate_name, Environment, EnvironmentSpec, ObjectKey, MAX_NAME_LEN};
use crate::store::{EnvironmentStore, StoreError};

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_HEADER: &str = "x-github-event";
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// TTL given to Environments created from pull requests.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);

const HASH_SUFFIX_LEN: usize = 8;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullRequestEvent {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub pull_request: PullRequest,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullRequest {
    #[serde(default)]
    pub head: PullRequestHead,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullRequestHead {
    #[serde(rename = "ref", default)]
    pub branch: String,
    /// `null` when the head repository of a fork has been deleted.
    #[serde(default)]
    pub repo: Option<HeadRepo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeadRepo {
    #[serde(default)]
    pub clone_url: String,
}

impl PullRequestEvent {
    pub fn branch(&self) -> &str {
        &self.pull_request.head.branch
    }

    pub fn clone_url(&self) -> &str {
        self.pull_request
            .head
            .repo
            .as_ref()
            .map_or("", |repo| repo.clone_url.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrAction {
    /// opened, reopened and synchronize: the environment should exist.
    Upsert,
    Close,
    Other(String),
}

impl PrAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "opened" | "reopened" | "synchronize" | "synchronized" => PrAction::Upsert,
            "closed" => PrAction::Close,
            other => PrAction::Other(other.to_string()),
        }
    }
}

/// Result of handling one event, rendered as the plain-text response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created(String),
    Deleted(String),
    Ignored(String),
}

impl Outcome {
    pub fn message(&self) -> String {
        match self {
            Outcome::Created(name) => format!("Environment {} created\n", name),
            Outcome::Deleted(name) => format!("Environment {} deleted\n", name),
            Outcome::Ignored(reason) => format!("{} ignored\n", reason),
        }
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Failed to parse JSON: {0}")]
    InvalidPayload(String),
    #[error("Invalid branch name: {0}")]
    InvalidName(String),
    #[error("Invalid signature")]
    BadSignature,
    #[error("Store request failed: {0}")]
    Store(#[from] StoreError),
}

impl WebhookError {
    pub fn status(&self) -> StatusCode {
        match self {
            WebhookError::InvalidPayload(_) | WebhookError::InvalidName(_) => StatusCode::BAD_REQUEST,
            WebhookError::BadSignature => StatusCode::UNAUTHORIZED,
            WebhookError::Store(StoreError::Invalid { .. }) => StatusCode::BAD_REQUEST,
            WebhookError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        (self.status(), format!("{}\n", self)).into_response()
    }
}

/// Maps a branch to an Environment name.
///
/// A branch that only needs `/` replaced by `-` to be a valid name maps to
/// exactly that, so `feature/login-fix` becomes `feature-login-fix`. Any
/// other branch is lower-cased, every character outside `[a-z0-9-]` becomes
/// `-`, the result is trimmed and cut to fit, and a short hash of the full
/// branch is appended. Lossy rewrites therefore never merge two branches.
///
/// Known limitation: `feature/x` and `feature-x` both map to `feature-x` and
/// share one Environment.
pub fn branch_to_name(branch: &str) -> String {
    let direct = branch.replace('/', "-");
    if validate_name(&direct).is_ok() {
        return direct;
    }

    let sanitized: String = branch
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();
    let sanitized = sanitized.trim_matches('-');
    if sanitized.is_empty() {
        return String::new();
    }

    let digest = format!("{:x}", Sha256::digest(branch.as_bytes()));
    // Every character is ASCII here, so byte slicing is safe.
    let keep = sanitized.len().min(MAX_NAME_LEN - HASH_SUFFIX_LEN - 1);
    let head = sanitized[..keep].trim_end_matches('-');
    format!("{}-{}", head, &digest[..HASH_SUFFIX_LEN])
}

/// Checks a `sha256=<hex>` signature header against the HMAC of `body`.
pub fn verify_signature(secret: &[u8], header: Option<&str>, body: &[u8]) -> bool {
    let Some(signature) = header.and_then(|h| h.trim().strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    let expected = format!("{:x}", mac.finalize().into_bytes());
    expected
        .as_bytes()
        .ct_eq(signature.to_ascii_lowercase().as_bytes())
        .into()
}

pub struct WebhookState {
    store: Arc<dyn EnvironmentStore>,
    namespace: String,
    default_ttl: Duration,
    secret: Option<Vec<u8>>,
}

impl WebhookState {
    pub fn new(store: Arc<dyn EnvironmentStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            default_ttl: DEFAULT_TTL,
            secret: None,
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Enables signature verification.
    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret.map(String::into_bytes);
        self
    }

    /// Applies one pull-request event to the store.
    pub async fn handle(&self, event: &PullRequestEvent) -> Result<Outcome, WebhookError> {
        let action = PrAction::parse(&event.action);
        if let PrAction::Other(other) = &action {
            debug!(action = %other, "pull request action ignored");
            return Ok(Outcome::Ignored(format!("Action {}", other)));
        }

        let name = branch_to_name(event.branch());
        validate_name(&name).map_err(WebhookError::InvalidName)?;

        if action == PrAction::Close {
            self.delete(name).await
        } else {
            self.create(name, event).await
        }
    }

    async fn create(&self, name: String, event: &PullRequestEvent) -> Result<Outcome, WebhookError> {
        let env = Environment::new(
            self.namespace.clone(),
            name.clone(),
            EnvironmentSpec {
                repo_url: event.clone_url().to_string(),
                branch: event.branch().to_string(),
                ttl: self.default_ttl,
            },
        );
        match self.store.create(env).await {
            Ok(_) => info!(env = %name, branch = %event.branch(), "environment requested"),
            Err(StoreError::AlreadyExists(_)) => {
                debug!(env = %name, "environment already exists")
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Outcome::Created(name))
    }

    async fn delete(&self, name: String) -> Result<Outcome, WebhookError> {
        let key = ObjectKey::new(self.namespace.clone(), name.clone());
        match self.store.delete(&key).await {
            Ok(()) => info!(env = %key, "environment deletion requested"),
            Err(StoreError::NotFound(_)) => debug!(env = %key, "environment already gone"),
            Err(e) => return Err(e.into()),
        }
        Ok(Outcome::Deleted(name))
    }
}

/// `POST /webhook`, `GET /healthz` and `GET /readyz`.
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(
            "/webhook",
            post(webhook_handler).fallback(method_not_allowed),
        )
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn webhook_handler(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<String, WebhookError> {
    if let Some(secret) = &state.secret {
        let header = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        if !verify_signature(secret, header, &body) {
            warn!("rejected webhook with invalid signature");
            return Err(WebhookError::BadSignature);
        }
    }

    let event_type = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if event_type != "pull_request" {
        debug!(event = event_type, "event ignored");
        return Ok(Outcome::Ignored(format!("Event {}", event_type)).message());
    }

    let event: PullRequestEvent = serde_json::from_slice(&body)
        .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
    let outcome = state.handle(&event).await.map_err(|e| {
        warn!(error = %e, action = %event.action, "webhook request failed");
        e
    })?;
    Ok(outcome.message())
}

async fn method_not_allowed() -> (StatusCode, &'static str) {
    (StatusCode::METHOD_NOT_ALLOWED, "Invalid method\n")
}

async fn healthz() -> &'static str {
    "ok"
}

/// Ready once the store answers a list of the target namespace.
async fn readyz(State(state): State<Arc<WebhookState>>) -> (StatusCode, String) {
    match state.store.list(Some(state.namespace.as_str())).await {
        Ok(_) => (StatusCode::OK, "ok".to_string()),
        Err(e) => {
            warn!(error = %e, "readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, format!("{}\n", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn event(action: &str, branch: &str) -> PullRequestEvent {
        serde_json::from_value(serde_json::json!({
            "action": action,
            "pull_request": {
                "head": {
                    "ref": branch,
                    "repo": { "clone_url": "https://github.com/acme/app.git" }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_branch_to_name() {
        assert_eq!(branch_to_name("feature/login-fix"), "feature-login-fix");
        assert_eq!(branch_to_name("release/2024/q3"), "release-2024-q3");
        assert_eq!(branch_to_name("///"), "");

        let hashed = branch_to_name("Fix/JIRA_123");
        assert!(hashed.starts_with("fix-jira-123-"), "{}", hashed);
        assert_eq!(hashed.len(), "fix-jira-123-".len() + HASH_SUFFIX_LEN);
        assert!(branch_to_name("/release/").starts_with("release-"));
    }

    #[test]
    fn test_lossy_rewrites_do_not_merge_branches() {
        let plain = branch_to_name("feature/x");
        let upper = branch_to_name("Feature/X");
        let underscore = branch_to_name("feature_x");
        assert_eq!(plain, "feature-x");
        assert_ne!(upper, plain);
        assert_ne!(underscore, plain);
        assert_ne!(upper, underscore);
        for name in [&plain, &upper, &underscore] {
            assert!(validate_name(name).is_ok(), "{}", name);
        }
    }

    #[test]
    fn test_long_branch_names_are_hashed() {
        let a = format!("feature/{}", "x".repeat(80));
        let b = format!("feature/{}y", "x".repeat(80));
        let name_a = branch_to_name(&a);
        let name_b = branch_to_name(&b);
        assert!(name_a.len() <= MAX_NAME_LEN);
        assert!(validate_name(&name_a).is_ok());
        assert_ne!(name_a, name_b);
        assert_eq!(name_a, branch_to_name(&a));
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!(PrAction::parse("opened"), PrAction::Upsert);
        assert_eq!(PrAction::parse("synchronize"), PrAction::Upsert);
        assert_eq!(PrAction::parse("closed"), PrAction::Close);
        assert_eq!(PrAction::parse("labeled"), PrAction::Other("labeled".to_string()));
    }

    #[test]
    fn test_signature_verification() {
        let body = br#"{"action":"opened"}"#;
        let mut mac = HmacSha256::new_from_slice(b"s3cret").unwrap();
        mac.update(body);
        let good = format!("sha256={:x}", mac.finalize().into_bytes());

        assert!(verify_signature(b"s3cret", Some(&good), body));
        assert!(!verify_signature(b"other", Some(&good), body));
        assert!(!verify_signature(b"s3cret", Some("sha256=00"), body));
        assert!(!verify_signature(b"s3cret", Some("sha1=abc"), body));
        assert!(!verify_signature(b"s3cret", None, body));
    }

    #[tokio::test]
    async fn test_handle_create_is_repeatable() {
        let store = Arc::new(MemoryStore::new());
        let state = WebhookState::new(store.clone(), "default");

        let outcome = state.handle(&event("opened", "feature/x")).await.unwrap();
        assert_eq!(outcome, Outcome::Created("feature-x".to_string()));
        let outcome = state.handle(&event("synchronize", "feature/x")).await.unwrap();
        assert_eq!(outcome, Outcome::Created("feature-x".to_string()));

        let env = store.get(&ObjectKey::new("default", "feature-x")).await.unwrap();
        assert_eq!(env.spec.branch, "feature/x");
        assert_eq!(env.spec.repo_url, "https://github.com/acme/app.git");
        assert_eq!(env.spec.ttl, DEFAULT_TTL);
    }

    #[tokio::test]
    async fn test_handle_close_of_unknown_branch_succeeds() {
        let state = WebhookState::new(Arc::new(MemoryStore::new()), "default");
        let outcome = state.handle(&event("closed", "never-opened")).await.unwrap();
        assert_eq!(outcome, Outcome::Deleted("never-opened".to_string()));
    }

    #[tokio::test]
    async fn test_handle_rejects_empty_branch() {
        let state = WebhookState::new(Arc::new(MemoryStore::new()), "default");
        let err = state.handle(&event("opened", "")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        // Ignored actions never look at the branch.
        let outcome = state.handle(&event("labeled", "")).await.unwrap();
        assert_eq!(outcome.message(), "Action labeled ignored\n");
    }
}
