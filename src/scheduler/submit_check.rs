//! Feasibility predicate: can this job still fit somewhere?
//!
//! Consulted when lease-return anti-affinities or scheduling-info updates
//! might have made a job unschedulable everywhere. Feasibility only; fairness
//! and priority are no concern here.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::jobdb::Job;
use crate::repository::{ExecutorRepository, NodeSnapshot};

#[async_trait]
pub trait SubmitChecker: Send + Sync {
    /// Returns (ok, reason). `ok` is true iff every job can be scheduled on
    /// at least one known node; `reason` names the first job that cannot.
    async fn check_jobs(&self, jobs: &[Job]) -> Result<(bool, String)>;
}

/// Checks jobs against the nodes last reported by the executors.
pub struct FeasibilityChecker {
    executor_repository: Arc<dyn ExecutorRepository>,
}

impl FeasibilityChecker {
    pub fn new(executor_repository: Arc<dyn ExecutorRepository>) -> Self {
        Self {
            executor_repository,
        }
    }
}

#[async_trait]
impl SubmitChecker for FeasibilityChecker {
    async fn check_jobs(&self, jobs: &[Job]) -> Result<(bool, String)> {
        let executors = self.executor_repository.get_executors().await?;
        for job in jobs {
            let feasible = executors
                .iter()
                .flat_map(|e| e.nodes.iter())
                .any(|node| node_fits(job, node));
            if !feasible {
                return Ok((
                    false,
                    format!("job {} does not fit on any node of any executor", job.id()),
                ));
            }
        }
        Ok((true, String::new()))
    }
}

/// Whether a single node admits a job: not excluded by anti-affinity, label
/// selector satisfied, all taints tolerated, allocatable covers the requests.
pub(crate) fn node_fits(job: &Job, node: &NodeSnapshot) -> bool {
    let info = job.scheduling_info();
    if info.node_anti_affinities.iter().any(|n| *n == node.node_id) {
        return false;
    }
    for (key, value) in &info.node_selector {
        if node.labels.get(key) != Some(value) {
            return false;
        }
    }
    for taint in &node.taints {
        if !info.tolerations.contains(taint) {
            return false;
        }
    }
    for (resource, request) in &info.resources {
        let requested = parse_quantity(request).unwrap_or(0.0);
        let allocatable = node
            .allocatable
            .get(resource)
            .and_then(|q| parse_quantity(q))
            .unwrap_or(0.0);
        if requested > allocatable {
            return false;
        }
    }
    true
}

/// Parse a resource quantity string: a plain number, milli-units ("500m"),
/// or a binary/decimal suffix ("4Gi", "2G"). Unknown formats are None.
pub(crate) fn parse_quantity(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return None;
    }
    let suffixes: [(&str, f64); 9] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0_f64.powi(4)),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];
    for (suffix, factor) in suffixes {
        if let Some(number) = quantity.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * factor);
        }
    }
    quantity.parse::<f64>().ok()
}
