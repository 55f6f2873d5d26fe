use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SchedulerError};

/// Which leader-election strategy the scheduler runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaderMode {
    /// A single process that is always leader.
    Standalone,
    /// Leadership is held through a ttl'd lease on a coordination service.
    Lease,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Address the executor-facing gRPC server listens on.
    pub grpc_listen_addr: SocketAddr,
    /// PEM certificate/key pair; TLS is disabled when unset.
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    /// Ports for the externally-served metrics and pprof endpoints.
    pub metrics_port: u16,
    pub pprof_port: u16,

    /// How often the reconcile cycle runs.
    pub cycle_period_ms: u64,
    /// How often a cycle additionally invokes the scheduling algorithm.
    pub schedule_period_ms: u64,
    /// An executor silent for longer than this has its leases expired.
    pub executor_timeout_ms: u64,
    /// A job whose attempted runs reach this count is failed.
    pub max_attempts: u32,

    /// Priority class table applied to every job built by the job db.
    pub priority_classes: HashMap<String, i32>,
    pub default_priority_class: String,

    pub leader_mode: LeaderMode,
    pub leader_lease_ttl_ms: u64,
    pub leader_renew_interval_ms: u64,

    /// Node label whose value is the node id used for anti-affinities.
    pub node_id_label: String,
    /// Bound on the interned-string cache inside the job db.
    pub interned_strings_cache_size: usize,
    /// Scheduling contexts retained per executor for reporting.
    pub max_scheduling_contexts_per_executor: usize,
    /// Largest message the publisher will hand to the event bus.
    pub max_event_message_bytes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            grpc_listen_addr: "0.0.0.0:50051".parse().unwrap(),
            tls_cert_path: None,
            tls_key_path: None,
            metrics_port: 9000,
            pprof_port: 6060,
            cycle_period_ms: 1_000,
            schedule_period_ms: 10_000,
            executor_timeout_ms: 60_000,
            max_attempts: 5,
            priority_classes: HashMap::from([("default".to_string(), 0)]),
            default_priority_class: "default".to_string(),
            leader_mode: LeaderMode::Standalone,
            leader_lease_ttl_ms: 15_000,
            leader_renew_interval_ms: 5_000,
            node_id_label: "kubernetes.io/hostname".to_string(),
            interned_strings_cache_size: 10_000,
            max_scheduling_contexts_per_executor: 50,
            max_event_message_bytes: 4 * 1024 * 1024,
        }
    }
}

impl SchedulerConfig {
    /// Load a configuration document from a YAML file, falling back to the
    /// defaults for any field the document omits.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SchedulerError::Config(format!("reading {}: {e}", path.display())))?;
        let config: SchedulerConfig = serde_yaml::from_str(&raw)
            .map_err(|e| SchedulerError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.priority_classes.is_empty() {
            return Err(SchedulerError::Config(
                "at least one priority class must be configured".to_string(),
            ));
        }
        if !self.priority_classes.contains_key(&self.default_priority_class) {
            return Err(SchedulerError::Config(format!(
                "default priority class {} is not in the priority class table",
                self.default_priority_class
            )));
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err(SchedulerError::Config(
                "tls_cert_path and tls_key_path must be set together".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(SchedulerError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cycle_period(&self) -> Duration {
        Duration::from_millis(self.cycle_period_ms)
    }

    pub fn schedule_period(&self) -> Duration {
        Duration::from_millis(self.schedule_period_ms)
    }

    pub fn executor_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.executor_timeout_ms as i64)
    }
}
