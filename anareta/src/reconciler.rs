//! Environment reconciliation state machine.
//!
//! One call to [`Reconciler::reconcile`] is one pass over one Environment.
//! The pass reads the record, performs at most one lifecycle step and tells
//! its caller when it wants to run again. It never sleeps and never retries
//! a conflicting write in place: a stale conflict token ends the pass with
//! [`Action::Requeue`] so the next pass starts from a fresh read.
//!
//! Lifecycle, per pass:
//!
//! ```text
//! absent                      -> Done
//! deletion requested          -> Terminating, tear down namespace, drop finalizer
//! no finalizer                -> add finalizer, Requeue
//! Ready and past its TTL      -> request deletion
//! otherwise                   -> Provisioning, namespace, release, Ready, RequeueAfter(ttl)
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::finalizer::{self, FINALIZER};
use crate::installer::{InstallError, ReleaseInstaller};
use crate::model::{Environment, ObjectKey, Phase};
use crate::namespace::{NamespaceProvisioner, ProvisionError};
use crate::store::{EnvironmentStore, StoreError};

pub const READY_MESSAGE: &str = "Environment provisioned";

/// Delay before retrying a failed namespace teardown.
pub const DEFAULT_CLEANUP_RETRY_DELAY: Duration = Duration::from_secs(5);

/// What the caller should do after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing further is scheduled by this pass.
    Done,
    /// Run another pass right away.
    Requeue,
    /// Run another pass after the given delay.
    RequeueAfter(Duration),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to ensure namespace {namespace}: {source}")]
    Namespace {
        namespace: String,
        #[source]
        source: ProvisionError,
    },
    #[error("failed to ensure release in {namespace}: {source}")]
    Release {
        namespace: String,
        #[source]
        source: InstallError,
    },
}

pub struct Reconciler {
    store: Arc<dyn EnvironmentStore>,
    namespaces: Arc<dyn NamespaceProvisioner>,
    installer: Arc<dyn ReleaseInstaller>,
    cleanup_retry_delay: Duration,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn EnvironmentStore>,
        namespaces: Arc<dyn NamespaceProvisioner>,
        installer: Arc<dyn ReleaseInstaller>,
    ) -> Self {
        Self {
            store,
            namespaces,
            installer,
            cleanup_retry_delay: DEFAULT_CLEANUP_RETRY_DELAY,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_cleanup_retry_delay(mut self, delay: Duration) -> Self {
        self.cleanup_retry_delay = delay;
        self
    }

    /// Replaces the time source used for `started_at` and TTL expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs one reconciliation pass for `key`.
    #[instrument(skip(self, key), fields(env = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let env = match self.store.get(key).await {
            Ok(env) => env,
            Err(StoreError::NotFound(_)) => {
                debug!("environment no longer exists");
                return Ok(Action::Done);
            }
            Err(e) => return Err(e.into()),
        };

        if env.metadata.is_deleting() {
            return self.finalize(env).await;
        }

        if !finalizer::has(&env.metadata.finalizers, FINALIZER) {
            return self.add_finalizer(env).await;
        }

        if self.is_expired(&env) {
            return self.expire(key).await;
        }

        self.provision(env).await
    }

    async fn add_finalizer(&self, mut env: Environment) -> Result<Action, ReconcileError> {
        env.metadata.finalizers = finalizer::with(&env.metadata.finalizers, FINALIZER);
        match self.store.update(&env).await {
            Ok(_) => {
                debug!("finalizer added");
                Ok(Action::Requeue)
            }
            Err(e) => write_failed(e, "add finalizer"),
        }
    }

    async fn finalize(&self, mut env: Environment) -> Result<Action, ReconcileError> {
        if !finalizer::has(&env.metadata.finalizers, FINALIZER) {
            return Ok(Action::Done);
        }

        let namespace = env.target_namespace();
        if env.status.phase != Phase::Terminating {
            env.status.phase = Phase::Terminating;
            env.status.message = format!("Deleting namespace {}", namespace);
            env = match self.store.update_status(&env).await {
                Ok(updated) => updated,
                Err(e) => return write_failed(e, "record Terminating"),
            };
        }

        info!(namespace = %namespace, "cleaning up environment");
        if let Err(e) = self.namespaces.ensure_absent(&namespace).await {
            warn!(namespace = %namespace, error = %e, "failed to delete namespace");
            return Ok(Action::RequeueAfter(self.cleanup_retry_delay));
        }

        env.metadata.finalizers = finalizer::without(&env.metadata.finalizers, FINALIZER);
        match self.store.update(&env).await {
            Ok(_) => {
                info!("finalizer removed");
                Ok(Action::Done)
            }
            Err(e) => write_failed(e, "remove finalizer"),
        }
    }

    fn is_expired(&self, env: &Environment) -> bool {
        env.status.phase == Phase::Ready
            && env.expires_at().is_some_and(|at| at <= self.clock.now())
    }

    async fn expire(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        info!("time-to-live elapsed, requesting deletion");
        match self.store.delete(key).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(Action::Done),
            Err(e) => Err(e.into()),
        }
    }

    async fn provision(&self, mut env: Environment) -> Result<Action, ReconcileError> {
        let key = env.key();
        let namespace = env.target_namespace();

        if !matches!(env.status.phase, Phase::Ready | Phase::Provisioning) {
            env.status.phase = Phase::Provisioning;
            env.status.message = format!("Provisioning namespace {}", namespace);
            env = match self.store.update_status(&env).await {
                Ok(updated) => updated,
                Err(e) => return write_failed(e, "record Provisioning"),
            };
        }

        if let Err(source) = self.namespaces.ensure(&namespace).await {
            warn!(namespace = %namespace, error = %source, "failed to ensure namespace");
            self.record_error(&key, &source.to_string()).await;
            return Err(ReconcileError::Namespace { namespace, source });
        }

        if let Err(source) = self.installer.ensure(&namespace, &env.spec).await {
            warn!(namespace = %namespace, error = %source, "failed to ensure release");
            self.record_error(&key, &source.to_string()).await;
            return Err(ReconcileError::Release { namespace, source });
        }

        if env.status.phase != Phase::Ready {
            env.status.phase = Phase::Ready;
            env.status.message = READY_MESSAGE.to_string();
            env.status.started_at = Some(self.clock.now());
            if let Err(e) = self.store.update_status(&env).await {
                return write_failed(e, "record Ready");
            }
            info!(namespace = %namespace, "environment ready");
        }

        if env.spec.ttl.is_zero() {
            Ok(Action::Done)
        } else {
            Ok(Action::RequeueAfter(env.spec.ttl))
        }
    }

    /// Writes phase=Error onto a freshly read record. The failure being
    /// recorded is what the pass reports, so a failed write is only logged.
    async fn record_error(&self, key: &ObjectKey, message: &str) {
        let mut latest = match self.store.get(key).await {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "could not re-read environment to record error");
                return;
            }
        };
        latest.status.phase = Phase::Error;
        latest.status.message = message.to_string();
        if let Err(e) = self.store.update_status(&latest).await {
            warn!(error = %e, "could not record Error phase");
        }
    }
}

/// Maps a failed conditional write to the pass outcome: a conflict or a
/// vanished record restarts from a fresh read, anything else surfaces.
fn write_failed(err: StoreError, step: &str) -> Result<Action, ReconcileError> {
    match err {
        StoreError::Conflict { .. } => {
            debug!(step, "conflict, requeueing");
            Ok(Action::Requeue)
        }
        StoreError::NotFound(_) => Ok(Action::Done),
        e => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::NoopInstaller;
    use crate::model::EnvironmentSpec;
    use crate::namespace::MemoryNamespaces;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    struct Fixture {
        store: Arc<MemoryStore>,
        namespaces: Arc<MemoryNamespaces>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(NoopInstaller))
    }

    fn fixture_with(installer: Arc<dyn ReleaseInstaller>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let namespaces = Arc::new(MemoryNamespaces::new());
        let reconciler = Reconciler::new(store.clone(), namespaces.clone(), installer);
        Fixture {
            store,
            namespaces,
            reconciler,
        }
    }

    async fn seed(store: &MemoryStore, name: &str, ttl: Duration) -> ObjectKey {
        let env = Environment::new(
            "default",
            name,
            EnvironmentSpec {
                repo_url: "https://example/repo.git".to_string(),
                branch: name.to_string(),
                ttl,
            },
        );
        store.create(env).await.unwrap().key()
    }

    #[tokio::test]
    async fn test_missing_environment_is_done() {
        let f = fixture();
        let action = f
            .reconciler
            .reconcile(&ObjectKey::new("default", "ghost"))
            .await
            .unwrap();
        assert_eq!(action, Action::Done);
    }

    #[tokio::test]
    async fn test_finalizer_pass_touches_nothing_else() {
        let f = fixture();
        let key = seed(&f.store, "alpha", Duration::ZERO).await;

        let action = f.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::Requeue);

        let env = f.store.get(&key).await.unwrap();
        assert!(finalizer::has(&env.metadata.finalizers, FINALIZER));
        assert_eq!(env.status.phase, Phase::Pending);
        assert!(f.namespaces.names().is_empty());
    }

    #[tokio::test]
    async fn test_zero_ttl_ends_without_requeue() {
        let f = fixture();
        let key = seed(&f.store, "alpha", Duration::ZERO).await;
        f.reconciler.reconcile(&key).await.unwrap();

        assert_eq!(f.reconciler.reconcile(&key).await.unwrap(), Action::Done);
        let env = f.store.get(&key).await.unwrap();
        assert_eq!(env.status.phase, Phase::Ready);
        assert_eq!(env.status.message, READY_MESSAGE);
        assert!(env.status.started_at.is_some());
    }

    #[tokio::test]
    async fn test_ready_pass_is_idempotent() {
        let f = fixture();
        let key = seed(&f.store, "alpha", Duration::from_secs(60)).await;
        f.reconciler.reconcile(&key).await.unwrap();
        f.reconciler.reconcile(&key).await.unwrap();
        let first = f.store.get(&key).await.unwrap();

        let action = f.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::RequeueAfter(Duration::from_secs(60)));

        let second = f.store.get(&key).await.unwrap();
        assert_eq!(first.metadata.resource_version, second.metadata.resource_version);
        assert_eq!(first.status.started_at, second.status.started_at);
        assert_eq!(f.namespaces.create_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_environment_requests_deletion() {
        let f = fixture();
        let key = seed(&f.store, "alpha", Duration::from_secs(60)).await;
        f.reconciler.reconcile(&key).await.unwrap();
        f.reconciler.reconcile(&key).await.unwrap();

        let mut env = f.store.get(&key).await.unwrap();
        env.status.started_at = Some(Utc::now() - chrono::Duration::minutes(2));
        f.store.update_status(&env).await.unwrap();

        assert_eq!(f.reconciler.reconcile(&key).await.unwrap(), Action::Done);
        let env = f.store.get(&key).await.unwrap();
        assert!(env.metadata.is_deleting());

        assert_eq!(f.reconciler.reconcile(&key).await.unwrap(), Action::Done);
        assert!(f.store.get(&key).await.unwrap_err().is_not_found());
        assert!(!f.namespaces.contains("anareta-alpha"));
    }

    /// Clock that only moves when told to.
    #[derive(Debug)]
    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += chrono::Duration::from_std(by).unwrap();
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    #[tokio::test]
    async fn test_expiry_follows_injected_clock() {
        let store = Arc::new(MemoryStore::new());
        let namespaces = Arc::new(MemoryNamespaces::new());
        let clock = Arc::new(ManualClock(Mutex::new(Utc::now())));
        let reconciler = Reconciler::new(store.clone(), namespaces.clone(), Arc::new(NoopInstaller))
            .with_clock(clock.clone());
        let key = seed(&store, "alpha", Duration::from_secs(60)).await;
        reconciler.reconcile(&key).await.unwrap();
        reconciler.reconcile(&key).await.unwrap();

        let ready = store.get(&key).await.unwrap();
        assert_eq!(ready.status.started_at, Some(clock.now()));

        clock.advance(Duration::from_secs(59));
        assert_eq!(
            reconciler.reconcile(&key).await.unwrap(),
            Action::RequeueAfter(Duration::from_secs(60))
        );
        assert!(!store.get(&key).await.unwrap().metadata.is_deleting());

        clock.advance(Duration::from_secs(1));
        assert_eq!(reconciler.reconcile(&key).await.unwrap(), Action::Done);
        assert!(store.get(&key).await.unwrap().metadata.is_deleting());
    }

    struct StuckNamespaces;

    #[async_trait]
    impl NamespaceProvisioner for StuckNamespaces {
        async fn ensure(&self, _name: &str) -> Result<(), ProvisionError> {
            Ok(())
        }

        async fn ensure_absent(&self, _name: &str) -> Result<(), ProvisionError> {
            Err(ProvisionError::Backend("api server unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_cleanup_failure_keeps_finalizer() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(StuckNamespaces),
            Arc::new(NoopInstaller),
        )
        .with_cleanup_retry_delay(Duration::from_secs(7));
        let key = seed(&store, "alpha", Duration::ZERO).await;
        reconciler.reconcile(&key).await.unwrap();
        store.delete(&key).await.unwrap();

        let action = reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::RequeueAfter(Duration::from_secs(7)));

        let env = store.get(&key).await.unwrap();
        assert!(finalizer::has(&env.metadata.finalizers, FINALIZER));
        assert_eq!(env.status.phase, Phase::Terminating);
    }

    #[tokio::test]
    async fn test_namespace_failure_records_error() {
        struct BrokenNamespaces;

        #[async_trait]
        impl NamespaceProvisioner for BrokenNamespaces {
            async fn ensure(&self, _name: &str) -> Result<(), ProvisionError> {
                Err(ProvisionError::Backend("quota exceeded".to_string()))
            }

            async fn ensure_absent(&self, _name: &str) -> Result<(), ProvisionError> {
                Ok(())
            }
        }

        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(
            store.clone(),
            Arc::new(BrokenNamespaces),
            Arc::new(NoopInstaller),
        );
        let key = seed(&store, "alpha", Duration::ZERO).await;
        reconciler.reconcile(&key).await.unwrap();

        let err = reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Namespace { .. }));
        let env = store.get(&key).await.unwrap();
        assert_eq!(env.status.phase, Phase::Error);
        assert!(env.status.message.contains("quota exceeded"));
    }
}
