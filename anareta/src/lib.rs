//! ANARETA: ephemeral per-branch development environments.
//!
//! A pull-request webhook writes `Environment` records into a store; the
//! controller watches the store and runs the reconciler, which provisions a
//! dedicated namespace and release per record and tears both down again when
//! the record is deleted or its TTL runs out.

pub mod clock;
pub mod config;
pub mod controller;
pub mod finalizer;
pub mod installer;
pub mod model;
pub mod namespace;
pub mod process;
pub mod reconciler;
pub mod store;
#[cfg(feature = "server")]
pub mod webhook;

pub use clock::{Clock, SystemClock};
pub use config::{AnaretaConfig, ConfigError};
pub use controller::{Controller, ControllerConfig};
pub use model::{Environment, EnvironmentSpec, EnvironmentStatus, ObjectKey, Phase};
pub use reconciler::{Action, ReconcileError, Reconciler};
pub use store::{EnvironmentStore, StoreError};
