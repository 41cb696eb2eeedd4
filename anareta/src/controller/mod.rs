//! Controller runtime: drives the reconciler from store notifications.
//!
//! Passes are triggered by three sources, all funnelled through one
//! [`WorkQueue`]:
//! - watch events for records whose spec, finalizers or deletion marker
//!   changed (status-only writes are the reconciler's own output and do not
//!   trigger a pass);
//! - a periodic resync that re-queues every known record;
//! - the delays returned by the reconciler itself, which is how TTL expiry
//!   gets scheduled.

pub mod queue;

pub use queue::{Backoff, WorkQueue};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::model::{Environment, ObjectKey};
use crate::reconciler::{Action, Reconciler};
use crate::store::{EnvironmentStore, StoreError, WatchEvent};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    pub resync_period: Duration,
    pub backoff: Backoff,
    /// Restricts the controller to one namespace-of-record.
    pub namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_period: Duration::from_secs(600),
            backoff: Backoff::default(),
            namespace: None,
        }
    }
}

/// The parts of a record whose change calls for a new pass.
#[derive(Debug, Clone, PartialEq)]
struct Trigger {
    generation: u64,
    deleting: bool,
    finalizers: Vec<String>,
}

impl Trigger {
    fn of(env: &Environment) -> Self {
        Self {
            generation: env.metadata.generation,
            deleting: env.metadata.is_deleting(),
            finalizers: env.metadata.finalizers.clone(),
        }
    }
}

/// Remembers the last trigger state per key so that status-only updates are
/// filtered out of the watch stream.
#[derive(Debug, Default)]
struct ChangeFilter {
    seen: HashMap<ObjectKey, Trigger>,
}

impl ChangeFilter {
    fn observe(&mut self, event: &WatchEvent) -> bool {
        match event {
            WatchEvent::Applied(env) => {
                let trigger = Trigger::of(env);
                match self.seen.insert(env.key(), trigger.clone()) {
                    Some(previous) => previous != trigger,
                    None => true,
                }
            }
            WatchEvent::Deleted(env) => {
                self.seen.remove(&env.key());
                true
            }
        }
    }

    fn reset(&mut self, items: &[Environment]) {
        self.seen = items.iter().map(|env| (env.key(), Trigger::of(env))).collect();
    }
}

pub struct Controller {
    store: Arc<dyn EnvironmentStore>,
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue<ObjectKey>>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(
        store: Arc<dyn EnvironmentStore>,
        reconciler: Arc<Reconciler>,
        config: ControllerConfig,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(config.backoff));
        Self {
            store,
            reconciler,
            queue,
            config,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue<ObjectKey>> {
        self.queue.clone()
    }

    /// Runs until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        // Subscribe before listing so nothing written in between is missed.
        let mut events = self.store.watch();
        let mut filter = ChangeFilter::default();
        self.relist(&mut filter).await?;

        let workers = self.config.workers.max(1);
        info!(
            workers,
            resync_secs = self.config.resync_period.as_secs(),
            namespace = self.config.namespace.as_deref().unwrap_or("*"),
            "controller started"
        );
        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|id| {
                tokio::spawn(worker(id, self.queue.clone(), self.reconciler.clone()))
            })
            .collect();

        let mut resync = interval_at(
            Instant::now() + self.config.resync_period,
            self.config.resync_period,
        );
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = events.recv() => match received {
                    Ok(event) => {
                        if self.in_scope(&event.key()) && filter.observe(&event) {
                            debug!(env = %event.key(), "change observed");
                            self.queue.add(event.key());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "watch lagged, relisting");
                        if let Err(e) = self.relist(&mut filter).await {
                            error!(error = %e, "relist failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("watch channel closed");
                        break;
                    }
                },
                _ = resync.tick() => {
                    debug!("periodic resync");
                    if let Err(e) = self.relist(&mut filter).await {
                        error!(error = %e, "resync failed");
                    }
                }
            }
        }

        info!("controller stopping");
        self.queue.shutdown();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker panicked");
            }
        }
        Ok(())
    }

    fn in_scope(&self, key: &ObjectKey) -> bool {
        self.config
            .namespace
            .as_deref()
            .map_or(true, |ns| key.namespace == ns)
    }

    async fn relist(&self, filter: &mut ChangeFilter) -> Result<(), StoreError> {
        let items = self.store.list(self.config.namespace.as_deref()).await?;
        filter.reset(&items);
        for env in &items {
            self.queue.add(env.key());
        }
        Ok(())
    }
}

async fn worker(id: usize, queue: Arc<WorkQueue<ObjectKey>>, reconciler: Arc<Reconciler>) {
    while let Some(key) = queue.next().await {
        match reconciler.reconcile(&key).await {
            Ok(Action::Done) => queue.forget(&key),
            Ok(Action::Requeue) => {
                queue.forget(&key);
                queue.add(key.clone());
            }
            Ok(Action::RequeueAfter(delay)) => {
                queue.forget(&key);
                debug!(worker = id, env = %key, delay_secs = delay.as_secs(), "requeue scheduled");
                queue.add_after(key.clone(), delay);
            }
            Err(e) => {
                let delay = queue.add_rate_limited(key.clone());
                warn!(
                    worker = id,
                    env = %key,
                    error = %e,
                    retry_ms = delay.as_millis() as u64,
                    "reconcile failed"
                );
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker exiting");
}
