use thiserror::Error;

/// The engine's single error boundary. The dispatcher converts these into
/// wire-level error envelopes without reinterpreting the message.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    #[error("Command not found: {0}")]
    CommandNotFound(i64),

    #[error("{0} required")]
    MissingField(String),

    #[error("{a} and {b} required")]
    MissingFields { a: String, b: String },

    #[error("Task status transition failed for {id}: {from} -> {to}")]
    IllegalTransition {
        id: i64,
        from: String,
        to: String,
    },

    #[error("Invalid project state transition: {from} -> {to}")]
    IllegalProjectTransition { from: String, to: String },

    #[error("Command {0} is locked")]
    Locked(i64),

    #[error("force reason required when mutating locked command")]
    LockReasonRequired,

    #[error("{0}")]
    Precondition(String),

    #[error("Merge failed: {0}")]
    MergeFailed(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error(transparent)]
    External(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Stable kind tag used by the dispatcher/server to map errors onto
    /// wire status codes without parsing the message text.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::ProjectNotFound(_)
            | EngineError::TaskNotFound(_)
            | EngineError::CommandNotFound(_) => "not_found",
            EngineError::MissingField(_) | EngineError::MissingFields { .. } => {
                "invalid_argument"
            }
            EngineError::IllegalTransition { .. } => "illegal_transition",
            EngineError::IllegalProjectTransition { .. } => "illegal_project_transition",
            EngineError::Locked(_) | EngineError::LockReasonRequired => "locked",
            EngineError::Precondition(_) => "precondition",
            EngineError::MergeFailed(_) => "conflict",
            EngineError::UnknownAction(_) => "unknown_action",
            EngineError::External(_) => "external",
        }
    }
}
