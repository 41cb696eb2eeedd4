//! Operator configuration, loaded from an optional TOML file.
//!
//! ```toml
//! [webhook]
//! listen_addr = "0.0.0.0:8080"
//! namespace = "default"
//! default_ttl = "24h"
//! secret_env = "ANARETA_WEBHOOK_SECRET"
//!
//! [controller]
//! workers = 4
//! resync_period = "10m"
//!
//! [store]
//! state_file = "/var/lib/anareta/state.json"
//!
//! [provisioner]
//! backend = "kubectl"
//!
//! [installer]
//! backend = "helm"
//! chart = "./charts/devenv"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::controller::{Backoff, ControllerConfig};
use crate::installer::{HelmInstaller, NoopInstaller, ReleaseInstaller};
use crate::model::humantime_serde;
use crate::namespace::{KubectlNamespaces, MemoryNamespaces, NamespaceProvisioner};
use crate::store::{EnvironmentStore, FileStore, MemoryStore, StoreError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnaretaConfig {
    pub webhook: WebhookSection,
    pub controller: ControllerSection,
    pub store: StoreSection,
    pub provisioner: ProvisionerSection,
    pub installer: InstallerSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSection {
    pub listen_addr: String,
    /// Namespace-of-record for Environments created from pull requests.
    pub namespace: String,
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Name of the environment variable holding the HMAC secret. Signature
    /// checking is off when unset.
    pub secret_env: Option<String>,
}

impl Default for WebhookSection {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            namespace: "default".to_string(),
            default_ttl: Duration::from_secs(24 * 3600),
            secret_env: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    pub workers: usize,
    #[serde(with = "humantime_serde")]
    pub resync_period: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_retry_delay: Duration,
    pub watch_namespace: Option<String>,
}

impl Default for ControllerSection {
    fn default() -> Self {
        let backoff = Backoff::default();
        Self {
            workers: 4,
            resync_period: Duration::from_secs(600),
            backoff_base: backoff.base,
            backoff_max: backoff.max,
            cleanup_retry_delay: crate::reconciler::DEFAULT_CLEANUP_RETRY_DELAY,
            watch_namespace: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// File-backed store when set, in-memory otherwise.
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerBackend {
    #[default]
    Memory,
    Kubectl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerSection {
    pub backend: ProvisionerBackend,
    pub kubectl_bin: String,
    /// Extra arguments before every kubectl subcommand, e.g. `--context`.
    pub kubectl_args: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ProvisionerSection {
    fn default() -> Self {
        Self {
            backend: ProvisionerBackend::Memory,
            kubectl_bin: "kubectl".to_string(),
            kubectl_args: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallerBackend {
    #[default]
    Noop,
    Helm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerSection {
    pub backend: InstallerBackend,
    pub helm_bin: String,
    pub chart: Option<String>,
    pub release_name: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub extra_args: Vec<String>,
}

impl Default for InstallerSection {
    fn default() -> Self {
        Self {
            backend: InstallerBackend::Noop,
            helm_bin: "helm".to_string(),
            chart: None,
            release_name: "devenv".to_string(),
            timeout: Duration::from_secs(300),
            extra_args: Vec::new(),
        }
    }
}

impl AnaretaConfig {
    /// Reads and parses a TOML file. Missing sections and keys take their
    /// defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controller.workers == 0 {
            return Err(ConfigError::Invalid(
                "controller.workers must be at least 1".to_string(),
            ));
        }
        if self.webhook.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "webhook.namespace must not be empty".to_string(),
            ));
        }
        self.listen_addr()?;
        if self.installer.backend == InstallerBackend::Helm
            && self.installer.chart.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::Invalid(
                "installer.chart is required for the helm backend".to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.webhook.listen_addr.parse().map_err(|e| {
            ConfigError::Invalid(format!(
                "webhook.listen_addr '{}': {}",
                self.webhook.listen_addr, e
            ))
        })
    }

    /// Webhook secret read from the configured environment variable.
    pub fn webhook_secret(&self) -> Option<String> {
        let var = self.webhook.secret_env.as_deref()?;
        std::env::var(var).ok().filter(|s| !s.is_empty())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.controller.workers,
            resync_period: self.controller.resync_period,
            backoff: Backoff {
                base: self.controller.backoff_base,
                max: self.controller.backoff_max,
            },
            namespace: self.controller.watch_namespace.clone(),
        }
    }

    pub async fn build_store(&self) -> Result<Arc<dyn EnvironmentStore>, StoreError> {
        Ok(match &self.store.state_file {
            Some(path) => Arc::new(FileStore::open(path.clone()).await?),
            None => Arc::new(MemoryStore::new()),
        })
    }

    pub fn build_provisioner(&self) -> Arc<dyn NamespaceProvisioner> {
        let section = &self.provisioner;
        match section.backend {
            ProvisionerBackend::Memory => Arc::new(MemoryNamespaces::new()),
            ProvisionerBackend::Kubectl => Arc::new(
                KubectlNamespaces::new(section.kubectl_bin.clone(), section.timeout)
                    .with_global_args(section.kubectl_args.clone()),
            ),
        }
    }

    pub fn build_installer(&self) -> Result<Arc<dyn ReleaseInstaller>, ConfigError> {
        let section = &self.installer;
        match section.backend {
            InstallerBackend::Noop => Ok(Arc::new(NoopInstaller)),
            InstallerBackend::Helm => {
                let chart = section.chart.clone().ok_or_else(|| {
                    ConfigError::Invalid("installer.chart is required for the helm backend".to_string())
                })?;
                Ok(Arc::new(
                    HelmInstaller::new(
                        section.helm_bin.clone(),
                        chart,
                        section.release_name.clone(),
                        section.timeout,
                    )
                    .with_extra_args(section.extra_args.clone()),
                ))
            }
        }
    }
}
