use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("not the leader")]
    NotLeader,

    #[error("job not found: {0}")]
    JobNotFound(ulid::Ulid),

    #[error("run not found: {0}")]
    RunNotFound(uuid::Uuid),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("error decoding scheduling info: {0}")]
    SchedulingInfoDecode(#[from] prost::DecodeError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
