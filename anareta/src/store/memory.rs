//! In-memory Environment store.
//!
//! Thread-safe via `RwLock`. The conflict token is a store-wide revision
//! counter rendered as a string, so every successful write produces a token
//! that was never handed out before.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use super::{EnvironmentStore, StoreError, StoreResult, WatchEvent};
use crate::finalizer;
use crate::model::{
    validate_name, Environment, EnvironmentStatus, ObjectKey, API_VERSION, KIND,
};

const WATCH_CAPACITY: usize = 1024;

/// Serialisable copy of the whole store, used by `FileStore`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub revision: u64,
    pub items: Vec<Environment>,
}

#[derive(Debug, Default)]
struct StoreState {
    revision: u64,
    records: BTreeMap<ObjectKey, Environment>,
}

impl StoreState {
    fn next_version(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

pub struct MemoryStore {
    state: RwLock<StoreState>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::from_snapshot(StoreSnapshot::default())
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        let records = snapshot
            .items
            .into_iter()
            .map(|env| (env.key(), env))
            .collect();
        Self {
            state: RwLock::new(StoreState {
                revision: snapshot.revision,
                records,
            }),
            events,
        }
    }

    pub fn snapshot(&self) -> StoreResult<StoreSnapshot> {
        let state = self.read()?;
        Ok(StoreSnapshot {
            revision: state.revision,
            items: state.records.values().cloned().collect(),
        })
    }

    fn read(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, StoreState>> {
        self.state
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, StoreState>> {
        self.state
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn publish(&self, event: WatchEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn check_version(current: &Environment, supplied: &Environment) -> StoreResult<()> {
        if current.metadata.resource_version != supplied.metadata.resource_version {
            return Err(StoreError::Conflict {
                key: current.key(),
                expected: supplied.metadata.resource_version.clone(),
                current: current.metadata.resource_version.clone(),
            });
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EnvironmentStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Environment> {
        self.read()?
            .records
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn list(&self, namespace: Option<&str>) -> StoreResult<Vec<Environment>> {
        let state = self.read()?;
        Ok(state
            .records
            .values()
            .filter(|env| namespace.map_or(true, |ns| env.metadata.namespace == ns))
            .cloned()
            .collect())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    async fn create(&self, mut env: Environment) -> StoreResult<Environment> {
        let key = env.key();
        if key.namespace.is_empty() {
            return Err(StoreError::Invalid {
                key,
                reason: "namespace must not be empty".to_string(),
            });
        }
        validate_name(&key.name).map_err(|reason| StoreError::Invalid {
            key: key.clone(),
            reason,
        })?;

        let created = {
            let mut state = self.write()?;
            if state.records.contains_key(&key) {
                return Err(StoreError::AlreadyExists(key));
            }
            env.api_version = API_VERSION.to_string();
            env.kind = KIND.to_string();
            env.status = EnvironmentStatus::default();
            env.metadata.deletion_timestamp = None;
            env.metadata.generation = 1;
            env.metadata.creation_timestamp = Some(Utc::now());
            env.metadata.resource_version = state.next_version();
            state.records.insert(key.clone(), env.clone());
            env
        };

        debug!(env = %key, version = %created.metadata.resource_version, "created");
        self.publish(WatchEvent::Applied(created.clone()));
        Ok(created)
    }

    async fn update(&self, env: &Environment) -> StoreResult<Environment> {
        let key = env.key();
        let (updated, removed) = {
            let mut state = self.write()?;
            let current = state
                .records
                .get(&key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            Self::check_version(current, env)?;

            if current.metadata.is_deleting()
                && env
                    .metadata
                    .finalizers
                    .iter()
                    .any(|f| !finalizer::has(&current.metadata.finalizers, f))
            {
                return Err(StoreError::Invalid {
                    key,
                    reason: "finalizers cannot be added while deletion is pending".to_string(),
                });
            }

            let mut next = current.clone();
            next.metadata.finalizers = env.metadata.finalizers.clone();
            next.metadata.labels = env.metadata.labels.clone();
            next.metadata.annotations = env.metadata.annotations.clone();
            if next.spec != env.spec {
                next.spec = env.spec.clone();
                next.metadata.generation += 1;
            }
            next.metadata.resource_version = state.next_version();

            if next.metadata.is_deleting() && next.metadata.finalizers.is_empty() {
                state.records.remove(&key);
                (next, true)
            } else {
                state.records.insert(key.clone(), next.clone());
                (next, false)
            }
        };

        if removed {
            debug!(env = %key, "last finalizer removed, record erased");
            self.publish(WatchEvent::Deleted(updated.clone()));
        } else {
            self.publish(WatchEvent::Applied(updated.clone()));
        }
        Ok(updated)
    }

    async fn update_status(&self, env: &Environment) -> StoreResult<Environment> {
        let key = env.key();
        let updated = {
            let mut state = self.write()?;
            let current = state
                .records
                .get(&key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            Self::check_version(current, env)?;

            let mut next = current.clone();
            next.status = env.status.clone();
            next.metadata.resource_version = state.next_version();
            state.records.insert(key.clone(), next.clone());
            next
        };

        self.publish(WatchEvent::Applied(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let event = {
            let mut state = self.write()?;
            let current = state
                .records
                .get(key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;

            if current.metadata.finalizers.is_empty() {
                let mut gone = current.clone();
                gone.metadata.resource_version = state.next_version();
                state.records.remove(key);
                Some(WatchEvent::Deleted(gone))
            } else if current.metadata.is_deleting() {
                None
            } else {
                let mut marked = current.clone();
                marked.metadata.deletion_timestamp = Some(Utc::now());
                marked.metadata.resource_version = state.next_version();
                state.records.insert(key.clone(), marked.clone());
                Some(WatchEvent::Applied(marked))
            }
        };

        if let Some(event) = event {
            debug!(env = %key, "deletion requested");
            self.publish(event);
        }
        Ok(())
    }
}
