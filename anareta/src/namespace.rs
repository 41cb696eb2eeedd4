//! Namespace provisioning.
//!
//! Both operations are "ensure" operations: calling them repeatedly has no
//! effect beyond the first successful call, and an already-satisfied target
//! state is never an error.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::process::{self, CommandError};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("namespace command failed: {0}")]
    Command(#[from] CommandError),
    #[error("namespace backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait NamespaceProvisioner: Send + Sync {
    /// Creates `name` if absent.
    async fn ensure(&self, name: &str) -> Result<(), ProvisionError>;

    /// Deletes `name` if present.
    async fn ensure_absent(&self, name: &str) -> Result<(), ProvisionError>;
}

/// In-process namespace set. Used for standalone runs and tests.
#[derive(Debug, Default)]
pub struct MemoryNamespaces {
    names: RwLock<BTreeSet<String>>,
    creates: AtomicUsize,
}

impl MemoryNamespaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names
            .read()
            .map(|names| names.contains(name))
            .unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        self.names
            .read()
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of namespaces actually created (not ensure calls).
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NamespaceProvisioner for MemoryNamespaces {
    async fn ensure(&self, name: &str) -> Result<(), ProvisionError> {
        let mut names = self
            .names
            .write()
            .map_err(|_| ProvisionError::Backend("lock poisoned".to_string()))?;
        if names.insert(name.to_string()) {
            self.creates.fetch_add(1, Ordering::SeqCst);
            debug!(namespace = name, "namespace created");
        }
        Ok(())
    }

    async fn ensure_absent(&self, name: &str) -> Result<(), ProvisionError> {
        let mut names = self
            .names
            .write()
            .map_err(|_| ProvisionError::Backend("lock poisoned".to_string()))?;
        if names.remove(name) {
            debug!(namespace = name, "namespace deleted");
        }
        Ok(())
    }
}

/// Provisions namespaces on a real cluster through the `kubectl` CLI.
#[derive(Debug, Clone)]
pub struct KubectlNamespaces {
    kubectl: String,
    global_args: Vec<String>,
    timeout: Duration,
}

impl KubectlNamespaces {
    pub fn new(kubectl: impl Into<String>, timeout: Duration) -> Self {
        Self {
            kubectl: kubectl.into(),
            global_args: Vec::new(),
            timeout,
        }
    }

    /// Arguments placed before every subcommand, e.g. `--context dev`.
    pub fn with_global_args(mut self, args: Vec<String>) -> Self {
        self.global_args = args;
        self
    }

    fn command(&self, args: &[&str]) -> Vec<String> {
        self.global_args
            .iter()
            .cloned()
            .chain(args.iter().map(|a| a.to_string()))
            .collect()
    }
}

#[async_trait]
impl NamespaceProvisioner for KubectlNamespaces {
    async fn ensure(&self, name: &str) -> Result<(), ProvisionError> {
        let args = self.command(&["create", "namespace", name]);
        match process::run(&self.kubectl, &args, self.timeout).await {
            Ok(_) => {
                info!(namespace = name, "namespace created");
                Ok(())
            }
            Err(e) if e.stderr().is_some_and(|s| s.contains("AlreadyExists")) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_absent(&self, name: &str) -> Result<(), ProvisionError> {
        let args = self.command(&[
            "delete",
            "namespace",
            name,
            "--ignore-not-found",
            "--wait=false",
        ]);
        process::run(&self.kubectl, &args, self.timeout).await?;
        info!(namespace = name, "namespace deletion requested");
        Ok(())
    }
}
