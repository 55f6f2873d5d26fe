//! Constructors for the lifecycle event sequences published to the bus.
//!
//! Events are the prost-generated wire types; this module only provides the
//! glue between job db snapshots and those types.

use crate::jobdb::{Job, JobRun};
use crate::proto::{self, event::Event as EventKind};

pub const REASON_LEASE_EXPIRED: &str = "lease-expired";
pub const REASON_UNSCHEDULABLE: &str = "unschedulable";
pub const REASON_TOO_MANY_ATTEMPTS: &str = "too-many-attempts";
pub const REASON_PREEMPTED: &str = "preempted";
pub const REASON_QUEUE_TTL_EXPIRED: &str = "queue-ttl-expired";
pub const REASON_RUN_ERROR: &str = "run-error";

/// One sequence per job, addressed by the job's (queue, jobset) grouping.
pub fn sequence_for_job(job: &Job, events: Vec<proto::Event>) -> proto::EventSequence {
    proto::EventSequence {
        queue: job.queue().to_string(),
        jobset: job.jobset().to_string(),
        user: String::new(),
        groups: Vec::new(),
        events,
    }
}

pub fn event(created: i64, kind: EventKind) -> proto::Event {
    proto::Event {
        created,
        event: Some(kind),
    }
}

pub fn terminal_error(reason: &str, message: impl Into<String>) -> proto::Error {
    proto::Error {
        terminal: true,
        reason: reason.to_string(),
        message: message.into(),
    }
}

pub fn job_run_leased(job: &Job, run: &JobRun) -> EventKind {
    EventKind::JobRunLeased(proto::JobRunLeased {
        job_id: job.id().to_string(),
        run_id: run.id().to_string(),
        executor_id: run.executor().to_string(),
        node_id: run.node_id().to_string(),
        has_scheduled_at_priority: run.scheduled_at_priority().is_some(),
        scheduled_at_priority: run.scheduled_at_priority().unwrap_or(0),
    })
}

pub fn job_run_errors(job: &Job, run: &JobRun, errors: Vec<proto::Error>) -> EventKind {
    EventKind::JobRunErrors(proto::JobRunErrors {
        job_id: job.id().to_string(),
        run_id: run.id().to_string(),
        errors,
    })
}

pub fn job_errors(job: &Job, errors: Vec<proto::Error>) -> EventKind {
    EventKind::JobErrors(proto::JobErrors {
        job_id: job.id().to_string(),
        errors,
    })
}

pub fn job_run_preempted(job: &Job, run: &JobRun) -> EventKind {
    EventKind::JobRunPreempted(proto::JobRunPreempted {
        job_id: job.id().to_string(),
        run_id: run.id().to_string(),
    })
}

pub fn cancel_job(job: &Job, reason: &str) -> EventKind {
    EventKind::CancelJob(proto::CancelJob {
        job_id: job.id().to_string(),
        reason: reason.to_string(),
    })
}

pub fn cancelled_job(job: &Job) -> EventKind {
    EventKind::CancelledJob(proto::CancelledJob {
        job_id: job.id().to_string(),
    })
}

pub fn reprioritised_job(job: &Job, priority: u32) -> EventKind {
    EventKind::ReprioritisedJob(proto::ReprioritisedJob {
        job_id: job.id().to_string(),
        priority,
    })
}

pub fn job_succeeded(job: &Job) -> EventKind {
    EventKind::JobSucceeded(proto::JobSucceeded {
        job_id: job.id().to_string(),
    })
}

pub fn job_requeued(job: &Job, run: &JobRun) -> EventKind {
    EventKind::JobRequeued(proto::JobRequeued {
        job_id: job.id().to_string(),
        run_id: run.id().to_string(),
        update_sequence_number: job.queued_version() as u32,
    })
}

pub fn partition_marker(group_id: &str, partition: u32) -> EventKind {
    EventKind::PartitionMarker(proto::PartitionMarker {
        group_id: group_id.to_string(),
        partition,
    })
}
