//! Desired-state store protocol.
//!
//! Every mutation is keyed by (namespace, name). `update` and
//! `update_status` are conditional on `metadata.resourceVersion`: a stale
//! token yields `StoreError::Conflict` and nothing is written.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{Environment, ObjectKey};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("environment {0} not found")]
    NotFound(ObjectKey),
    #[error("environment {0} already exists")]
    AlreadyExists(ObjectKey),
    #[error("conflict writing {key}: expected resourceVersion {expected}, found {current}")]
    Conflict {
        key: ObjectKey,
        expected: String,
        current: String,
    },
    #[error("invalid environment {key}: {reason}")]
    Invalid { key: ObjectKey, reason: String },
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Change notification published after every successful write.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Record created or modified; carries the new state.
    Applied(Environment),
    /// Record erased; carries the last state.
    Deleted(Environment),
}

impl WatchEvent {
    pub fn key(&self) -> ObjectKey {
        match self {
            WatchEvent::Applied(env) | WatchEvent::Deleted(env) => env.key(),
        }
    }
}

#[async_trait]
pub trait EnvironmentStore: Send + Sync {
    /// Returns `StoreError::NotFound` when absent.
    async fn get(&self, key: &ObjectKey) -> StoreResult<Environment>;

    /// Lists records, optionally restricted to one namespace-of-record,
    /// ordered by key.
    async fn list(&self, namespace: Option<&str>) -> StoreResult<Vec<Environment>>;

    /// Subscribes to change notifications. Receivers that fall behind see
    /// `RecvError::Lagged` and should relist.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;

    /// Inserts a new record. Supplied status is discarded.
    async fn create(&self, env: Environment) -> StoreResult<Environment>;

    /// Conditional write of metadata and spec. Status is left untouched.
    async fn update(&self, env: &Environment) -> StoreResult<Environment>;

    /// Conditional write of status only.
    async fn update_status(&self, env: &Environment) -> StoreResult<Environment>;

    /// Requests removal. Records without finalizers disappear immediately;
    /// the others gain a deletion marker.
    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;
}
