//! Environment resource types.
//!
//! The persisted shape follows the control-plane convention of
//! `metadata` / `spec` / `status`, with camelCase field names:
//!
//! ```json
//! {
//!   "apiVersion": "anareta.dev/v1alpha1",
//!   "kind": "Environment",
//!   "metadata": { "name": "feature-x", "namespace": "default", "resourceVersion": "7" },
//!   "spec": { "repoURL": "https://example/repo.git", "branch": "feature/x", "ttl": "1day" },
//!   "status": { "phase": "Ready", "message": "Environment provisioned" }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "anareta.dev/v1alpha1";
pub const KIND: &str = "Environment";

/// Prefix of every namespace backing an Environment.
pub const NAMESPACE_PREFIX: &str = "anareta-";

/// Longest Environment name whose backing namespace still fits in a
/// 63-character DNS label.
pub const MAX_NAME_LEN: usize = 63 - NAMESPACE_PREFIX.len();

/// Store key of an Environment: (namespace-of-record, name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    /// Conflict token. Assigned by the store; must match on every update.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(default)]
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set once the owner asked for removal; the record stays until
    /// `finalizers` is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// Desired state, written by the webhook only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    pub branch: String,
    /// Zero means the environment never expires.
    #[serde(default, with = "humantime_serde")]
    pub ttl: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Provisioning,
    Ready,
    Error,
    Terminating,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Provisioning => "Provisioning",
            Phase::Ready => "Ready",
            Phase::Error => "Error",
            Phase::Terminating => "Terminating",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Observed state, written by the reconciler only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Last transition into `Ready`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: EnvironmentSpec,
    #[serde(default)]
    pub status: EnvironmentStatus,
}

impl Environment {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: EnvironmentSpec) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..Default::default()
            },
            spec,
            status: EnvironmentStatus::default(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Namespace that hosts this environment's workload.
    pub fn target_namespace(&self) -> String {
        namespace_for(&self.metadata.name)
    }

    /// When the environment becomes due for expiry, if it has a TTL and
    /// has reached `Ready`.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.spec.ttl.is_zero() {
            return None;
        }
        let started = self.status.started_at?;
        let ttl = chrono::Duration::from_std(self.spec.ttl).ok()?;
        started.checked_add_signed(ttl)
    }
}

/// Backing namespace for an Environment name. Injective: the prefix is fixed
/// and the name is appended verbatim.
pub fn namespace_for(name: &str) -> String {
    format!("{}{}", NAMESPACE_PREFIX, name)
}

/// Checks that `name` is a DNS-1123 label short enough to be prefixed.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!(
            "name '{}' is {} characters, limit is {}",
            name,
            name.len(),
            MAX_NAME_LEN
        ));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || name.starts_with('-') || name.ends_with('-') {
        return Err(format!(
            "name '{}' must consist of lower case alphanumerics or '-', and start and end with an alphanumeric",
            name
        ));
    }
    Ok(())
}

pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
