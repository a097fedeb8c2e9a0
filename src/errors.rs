use thiserror::Error;

/// Process exit codes reported by the runner.
pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG: i32 = 1;
pub const EXIT_PERSISTENCE: i32 = 2;
pub const EXIT_GATE_NOT_SATISFIED: i32 = 3;

/// Top-level failures that terminate the process. Everything recoverable is
/// handled inside the owning component; only invariant-threatening errors
/// bubble up here.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("promotion gate not satisfied: {0}")]
    GateNotSatisfied(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunnerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunnerError::Config(_) => EXIT_CONFIG,
            RunnerError::Persistence(_) | RunnerError::Migration(_) => EXIT_PERSISTENCE,
            RunnerError::GateNotSatisfied(_) => EXIT_GATE_NOT_SATISFIED,
            RunnerError::Other(_) => EXIT_PERSISTENCE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(RunnerError::Config("x".into()).exit_code(), 1);
        assert_eq!(
            RunnerError::GateNotSatisfied("roi below target".into()).exit_code(),
            3
        );
    }
}
