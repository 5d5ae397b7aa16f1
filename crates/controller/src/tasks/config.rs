//! Controller Configuration
//!
//! Loaded from the mounted `config.yaml`. Every field has a default, so an
//! empty file (or no file at all) yields a working controller.

use crate::tasks::types::DEFAULT_MEMBERSHIP_LABEL;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Label that places a namespace in a class
    #[serde(default = "default_membership_label", rename = "membershipLabel")]
    pub membership_label: String,

    /// Number of reconciliations allowed to run at once
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// What happens to generated children when a class goes away
    #[serde(default, rename = "deletionPolicy")]
    pub deletion_policy: DeletionPolicy,

    /// Names of the generated child objects
    #[serde(default)]
    pub children: ChildrenConfig,

    /// Work queue rate limiting
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Handling of generated children once they no longer belong to a class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum DeletionPolicy {
    /// Leave children in place, still labeled with the class
    #[default]
    Orphan,
    /// Delete children when the class is deleted, the namespace leaves the
    /// class, or the template is removed
    Cascade,
}

impl fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeletionPolicy::Orphan => write!(f, "Orphan"),
            DeletionPolicy::Cascade => write!(f, "Cascade"),
        }
    }
}

impl FromStr for DeletionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "orphan" => Ok(DeletionPolicy::Orphan),
            "cascade" => Ok(DeletionPolicy::Cascade),
            other => Err(format!(
                "unknown deletion policy '{other}', expected Orphan or Cascade"
            )),
        }
    }
}

/// Child object names
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChildrenConfig {
    #[serde(default = "default_network_policy_name", rename = "networkPolicyName")]
    pub network_policy_name: String,

    #[serde(
        default = "default_service_account_name",
        rename = "serviceAccountName"
    )]
    pub service_account_name: String,
}

/// Work queue backoff and admission settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// First per-key retry delay, in milliseconds
    #[serde(default = "default_base_delay_millis", rename = "baseDelayMillis")]
    pub base_delay_millis: u64,

    /// Upper bound for the per-key retry delay, in seconds
    #[serde(default = "default_max_delay_seconds", rename = "maxDelaySeconds")]
    pub max_delay_seconds: u64,

    /// Sustained admissions per second shared by all keys
    #[serde(default = "default_qps")]
    pub qps: f64,

    /// Admissions allowed in a burst before `qps` applies
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl QueueConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_millis)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_seconds)
    }
}

fn default_membership_label() -> String {
    DEFAULT_MEMBERSHIP_LABEL.to_string()
}

fn default_workers() -> usize {
    5
}

fn default_network_policy_name() -> String {
    "admin-network-policy".to_string()
}

fn default_service_account_name() -> String {
    "admin-service-account".to_string()
}

fn default_base_delay_millis() -> u64 {
    5
}

fn default_max_delay_seconds() -> u64 {
    30
}

fn default_qps() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    100
}

impl Default for ChildrenConfig {
    fn default() -> Self {
        Self {
            network_policy_name: default_network_policy_name(),
            service_account_name: default_service_account_name(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay_millis: default_base_delay_millis(),
            max_delay_seconds: default_max_delay_seconds(),
            qps: default_qps(),
            burst: default_burst(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            membership_label: default_membership_label(),
            workers: default_workers(),
            deletion_policy: DeletionPolicy::default(),
            children: ChildrenConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Validate that the configuration can drive the controller
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.membership_label.trim().is_empty() {
            return Err(anyhow::anyhow!("membershipLabel must not be empty"));
        }
        if self.workers == 0 {
            return Err(anyhow::anyhow!("workers must be at least 1"));
        }
        if self.children.network_policy_name.trim().is_empty()
            || self.children.service_account_name.trim().is_empty()
        {
            return Err(anyhow::anyhow!(
                "children.networkPolicyName and children.serviceAccountName must not be empty"
            ));
        }
        if !(self.queue.qps.is_finite() && self.queue.qps > 0.0) {
            return Err(anyhow::anyhow!(
                "queue.qps must be a positive number, got {}",
                self.queue.qps
            ));
        }
        if self.queue.burst == 0 {
            return Err(anyhow::anyhow!("queue.burst must be at least 1"));
        }
        if self.queue.base_delay() > self.queue.max_delay() {
            return Err(anyhow::anyhow!(
                "queue.baseDelayMillis ({}ms) exceeds queue.maxDelaySeconds ({}s)",
                self.queue.base_delay_millis,
                self.queue.max_delay_seconds
            ));
        }
        Ok(())
    }

    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        let config: ControllerConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;

        Ok(config)
    }
}
