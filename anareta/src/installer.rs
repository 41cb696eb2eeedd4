//! Release installation into a provisioned namespace.
//!
//! The reconciler only relies on `ensure` being safe to repeat and on it
//! reporting failure through its return value.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::model::EnvironmentSpec;
use crate::process::{self, CommandError};

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{0}")]
    Command(#[from] CommandError),
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait ReleaseInstaller: Send + Sync {
    /// Installs or upgrades the environment's release inside `namespace`.
    async fn ensure(&self, namespace: &str, spec: &EnvironmentSpec) -> Result<(), InstallError>;
}

/// Installer used when no chart is configured: the namespace alone is the
/// environment.
#[derive(Debug, Default, Clone)]
pub struct NoopInstaller;

#[async_trait]
impl ReleaseInstaller for NoopInstaller {
    async fn ensure(&self, namespace: &str, spec: &EnvironmentSpec) -> Result<(), InstallError> {
        info!(namespace, branch = %spec.branch, "no release configured, skipping install");
        Ok(())
    }
}

/// Runs `helm upgrade --install`, which is idempotent by construction.
#[derive(Debug, Clone)]
pub struct HelmInstaller {
    helm: String,
    chart: String,
    release_name: String,
    timeout: Duration,
    extra_args: Vec<String>,
}

impl HelmInstaller {
    pub fn new(
        helm: impl Into<String>,
        chart: impl Into<String>,
        release_name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            helm: helm.into(),
            chart: chart.into(),
            release_name: release_name.into(),
            timeout,
            extra_args: Vec::new(),
        }
    }

    /// Arguments appended to every install, e.g. `--values dev.yaml`.
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn install_args(&self, namespace: &str, spec: &EnvironmentSpec) -> Vec<String> {
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            self.release_name.clone(),
            self.chart.clone(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--set-string".to_string(),
            format!("repoURL={}", escape_set_value(&spec.repo_url)),
            "--set-string".to_string(),
            format!("branch={}", escape_set_value(&spec.branch)),
            "--wait".to_string(),
            "--timeout".to_string(),
            format!("{}s", self.timeout.as_secs()),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Escapes a `--set-string` value so helm reads it as one literal string:
/// `,` would otherwise start a new assignment.
fn escape_set_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | ',') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl ReleaseInstaller for HelmInstaller {
    async fn ensure(&self, namespace: &str, spec: &EnvironmentSpec) -> Result<(), InstallError> {
        let args = self.install_args(namespace, spec);
        // Give helm its own --timeout plus some slack before killing it.
        let deadline = self.timeout + Duration::from_secs(30);
        process::run(&self.helm, &args, deadline).await?;
        info!(namespace, release = %self.release_name, chart = %self.chart, "release installed");
        Ok(())
    }
}
