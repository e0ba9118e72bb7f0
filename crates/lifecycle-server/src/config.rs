//! Server configuration
//!
//! Loaded from a TOML file. Every section and field has a default, so an
//! empty file (or no file at all) yields a runnable local configuration.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8080"
//! reconcile_interval_secs = 30
//!
//! [jobs]
//! failure_policy = "best-effort"
//! job_budget_secs = 900
//! retry = { max_attempts = 5, base_delay = 250, max_delay = 4000 }
//!
//! [auth]
//! verifying_key = "3b6a27bc..."
//!
//! [store]
//! kind = "file"
//! path = "/var/lib/lifecycle/registrations.json"
//! ```

use anyhow::{bail, Context};
use ed25519_dalek::VerifyingKey;
use lifecycle_core::context::output_keys;
use lifecycle_core::{FailurePolicy, JobSettings, RetryPolicy, StackOutputs, Tier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub jobs: JobsSection,
    pub auth: AuthSection,
    pub store: StoreSection,
    pub logging: LoggingSection,
    /// Outputs of the shared resource layer
    pub outputs: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            jobs: JobsSection::default(),
            auth: AuthSection::default(),
            store: StoreSection::default(),
            logging: LoggingSection::default(),
            outputs: default_outputs(),
        }
    }
}

/// `[server]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    /// Management API listen address
    pub bind: SocketAddr,
    /// Seconds between reconciliation sweeps
    pub reconcile_interval_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            reconcile_interval_secs: 30,
        }
    }
}

/// `[jobs]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobsSection {
    pub failure_policy: FailurePolicy,
    /// Wall-clock budget of one job
    pub job_budget_secs: u64,
    /// Tenant lease time-to-live
    pub lease_ttl_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            job_budget_secs: 900,
            lease_ttl_secs: 900,
            retry: RetryPolicy::default(),
        }
    }
}

/// `[auth]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSection {
    /// Hex-encoded ed25519 public key that operator tokens must verify against
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifying_key: Option<String>,
}

/// Registration store backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    File,
}

/// `[store]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    pub kind: StoreKind,
    /// Snapshot path, required for `kind = "file"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Outputs of a complete local deployment
#[must_use]
pub fn default_outputs() -> BTreeMap<String, String> {
    let mut outputs = BTreeMap::from([
        (output_keys::DATA_BUCKET.to_string(), "tenant-data".to_string()),
        (output_keys::USER_POOL.to_string(), "local-user-pool".to_string()),
        (
            output_keys::USER_POOL_CLIENT.to_string(),
            "local-user-pool-client".to_string(),
        ),
        (
            output_keys::API_URL.to_string(),
            "http://127.0.0.1:8081/prod".to_string(),
        ),
        (
            output_keys::INGESTION_FUNCTION.to_string(),
            "local:function:ingest".to_string(),
        ),
    ]);
    for tier in Tier::ALL {
        outputs.insert(
            format!("{}{}", output_keys::USAGE_PLAN_PREFIX, tier.as_str()),
            format!("local-plan-{tier}"),
        );
    }
    outputs
}

impl ServerConfig {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("loading config {}", path.display()))
    }

    /// Load from `path` when given, defaults otherwise
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content).context("invalid TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("serializing config")
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.jobs.retry.max_attempts == 0 {
            bail!("[jobs] retry.max_attempts must be at least 1");
        }
        if self.jobs.retry.base_delay > self.jobs.retry.max_delay {
            bail!("[jobs] retry.base_delay must not exceed retry.max_delay");
        }
        if self.jobs.job_budget_secs == 0 {
            bail!("[jobs] job_budget_secs must be positive");
        }
        if self.jobs.lease_ttl_secs < self.jobs.job_budget_secs {
            bail!("[jobs] lease_ttl_secs must cover job_budget_secs");
        }
        if self.server.reconcile_interval_secs == 0 {
            bail!("[server] reconcile_interval_secs must be positive");
        }
        if self.store.kind == StoreKind::File && self.store.path.is_none() {
            bail!("[store] kind = \"file\" requires a path");
        }
        if let Some(key) = &self.auth.verifying_key {
            lifecycle_api::auth::verifying_key_from_hex(key)
                .context("[auth] verifying_key is not a valid ed25519 public key")?;
        }
        Ok(())
    }

    /// Job settings for provisioning and deprovisioning
    #[must_use]
    pub fn job_settings(&self) -> JobSettings {
        JobSettings::new()
            .with_failure_policy(self.jobs.failure_policy)
            .with_retry(self.jobs.retry)
            .with_lease_ttl(Duration::from_secs(self.jobs.lease_ttl_secs))
    }

    #[must_use]
    pub fn job_budget(&self) -> Duration {
        Duration::from_secs(self.jobs.job_budget_secs)
    }

    #[must_use]
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.server.reconcile_interval_secs)
    }

    /// Shared resource layer outputs
    #[must_use]
    pub fn stack_outputs(&self) -> StackOutputs {
        self.outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Operator token verifying key; serving refuses to start without one
    pub fn verifying_key(&self) -> anyhow::Result<VerifyingKey> {
        let Some(encoded) = &self.auth.verifying_key else {
            bail!("[auth] verifying_key is required to serve the management API");
        };
        lifecycle_api::auth::verifying_key_from_hex(encoded)
            .context("[auth] verifying_key is not a valid ed25519 public key")
    }
}
