use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrataError {
    // Caller errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    // Infrastructure errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Event bus is closed")]
    EventBusClosed,

    // Execution errors
    #[error("Step execution failed: {step}: {message}")]
    StepExecution { step: String, message: String },

    #[error("Branch {branch} failed: {message}")]
    BranchFailure { branch: String, message: String },

    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Resource limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Shutdown of {tier} timed out with {active} active executions")]
    ShutdownTimeout { tier: String, active: usize },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure taxonomy used to decide how far an error may travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad config or input. Immediate, never retried.
    Validation,
    /// Missing user, tool, run or swarm. Fatal to the triggering call.
    NotFound,
    /// Persistence or bus unavailable. Logged, execution continues in memory.
    TransientInfra,
    /// Strategy or tool failure. Captured inside a `StepResult`.
    StepExecution,
    /// Branch outcome, governed by the run's recovery strategy.
    Branch,
    /// Run lifecycle problems (bad transition, limits, cancellation, shutdown).
    Lifecycle,
}

impl StrataError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Config(_) | Self::ConfigNotFound(_) => {
                ErrorKind::Validation
            }
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Persistence(_) | Self::EventBusClosed | Self::Io(_) | Self::Json(_) => {
                ErrorKind::TransientInfra
            }
            Self::StepExecution { .. } => ErrorKind::StepExecution,
            Self::BranchFailure { .. } => ErrorKind::Branch,
            Self::InvalidTransition { .. }
            | Self::LimitExceeded(_)
            | Self::Cancelled
            | Self::ShutdownTimeout { .. } => ErrorKind::Lifecycle,
        }
    }

    /// Whether the service should reject the initiating call with this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation | ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_kind() {
        let err = StrataError::not_found("User", "invalid-user");
        assert_eq!(err.to_string(), "User not found: invalid-user");
        assert!(err.is_fatal());
    }

    #[test]
    fn persistence_is_not_fatal() {
        let err = StrataError::Persistence("connection refused".into());
        assert_eq!(err.kind(), ErrorKind::TransientInfra);
        assert!(!err.is_fatal());
    }
}
