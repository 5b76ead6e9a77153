use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("not initialized: run 'rollout init'")]
    NotInitialized,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("release not found: {0}")]
    ReleaseNotFound(u64),

    #[error("environment not found: {0}")]
    EnvironmentNotFound(u64),

    #[error("release {id} is {status}; only active releases can be deployed")]
    ReleaseInactive { id: u64, status: String },

    #[error("release execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("stage execution not found: {0}")]
    StageExecutionNotFound(Uuid),

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("release execution {0} is already being driven")]
    ExecutionBusy(Uuid),

    #[error("persisted state is inconsistent, operator intervention required: {0}")]
    ResumeInconsistency(String),

    #[error("execution db error: {0}")]
    ExecutionDb(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RolloutError>;
