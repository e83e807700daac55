use std::path::PathBuf;

/// Unified error type for the gt orchestration core.
///
/// Variants are kinds, not carriers of every detail: callers route on the
/// kind (retry, surface, escalate) and the message carries the specifics.
#[derive(Debug, thiserror::Error)]
pub enum GtError {
    #[error("not inside a Gas Town workspace (searched up from {0})")]
    NotInWorkspace(PathBuf),

    #[error("workspace conflict: {0}")]
    WorkspaceConflict(String),

    #[error("config not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(String),

    #[error("ledger is stale and needs sync")]
    LedgerStale,

    #[error("ledger transport error: {0}")]
    LedgerTransport(String),

    #[error("ledger item not found: {0}")]
    LedgerNotFound(String),

    #[error("ledger conflict: {0}")]
    LedgerConflict(String),

    #[error("ledger rejected arguments: {0}")]
    LedgerInvalidArgument(String),

    #[error("multiplexer unavailable: {0}")]
    MultiplexerUnavailable(String),

    #[error("session '{0}' already exists")]
    SessionExists(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("timed out waiting for agent to become interactive in '{0}'")]
    LlmNotReady(String),

    #[error("rebase conflict on {branch}: {detail}")]
    GitConflict { branch: String, detail: String },

    #[error("push verification mismatch on {branch}: local {local} vs remote {remote}")]
    GitPushMismatch {
        branch: String,
        local: String,
        remote: String,
    },

    #[error("git {op} failed (exit {code}): {stderr}")]
    Git {
        op: String,
        code: i32,
        stderr: String,
    },

    #[error("quality gate '{gate}' failed")]
    QualityGateFailed { gate: String, output: String },

    #[error("validation failed: {message} (try '{suggestion}')")]
    ValidationFailed { message: String, suggestion: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GtError {
    /// CLI exit code for this error kind. 2 = preconditions unmet,
    /// 3 = ledger error surfaced, 1 = everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            GtError::NotInWorkspace(_) | GtError::WorkspaceConflict(_) => 2,
            GtError::LedgerStale
            | GtError::LedgerTransport(_)
            | GtError::LedgerNotFound(_)
            | GtError::LedgerConflict(_)
            | GtError::LedgerInvalidArgument(_) => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_by_kind() {
        assert_eq!(GtError::NotInWorkspace("/tmp".into()).exit_code(), 2);
        assert_eq!(GtError::LedgerStale.exit_code(), 3);
        assert_eq!(GtError::LedgerNotFound("gt-1".into()).exit_code(), 3);
        assert_eq!(
            GtError::LlmNotReady("gt-demo-polecat-nux".into()).exit_code(),
            1
        );
    }

    #[test]
    fn messages_are_one_line() {
        let e = GtError::GitPushMismatch {
            branch: "main".into(),
            local: "abc".into(),
            remote: "def".into(),
        };
        assert!(!e.to_string().contains('\n'));
    }
}
