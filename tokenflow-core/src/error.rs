use thiserror::Error;
use uuid::Uuid;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Coarse error classification used at the RPC boundary and by the run loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Definition,
    TokenState,
    Expression,
    Executor,
    Transaction,
    Scheduling,
    Bus,
    NotFound,
    Store,
}

/// All failures the engine can surface.
///
/// Executors return these; the run loop classifies via [`EngineError::kind`]
/// and maps to instance ERROR state. The user-visible HTTP mapping happens
/// once, at the embedding server's boundary, via [`EngineError::status_code`].
#[derive(Debug, Error)]
pub enum EngineError {
    // ── Definition errors ──
    #[error("invalid BPMN: {0}")]
    InvalidBpmn(String),

    #[error("cycle detected at node '{0}'")]
    CyclicGraph(String),

    #[error("no start event found in process definition")]
    MissingStartEvent,

    #[error("process definition {0} not found")]
    DefinitionNotFound(Uuid),

    // ── Token state errors ──
    #[error("token not found at node '{node_id}' for instance {instance_id}")]
    TokenNotFound { instance_id: Uuid, node_id: String },

    #[error("token at node '{node_id}' is not active (state: {state})")]
    TokenNotActive { node_id: String, state: String },

    #[error("token already exists at '{node_id}' for instance {instance_id}")]
    TokenExists { instance_id: Uuid, node_id: String },

    // ── Expression errors ──
    #[error("expression syntax error: {0}")]
    ExpressionSyntax(String),

    #[error("expression evaluation failed: {0}")]
    ExpressionEval(String),

    // ── Executor errors ──
    #[error("no valid outgoing path at gateway '{0}' and no default flow")]
    NoValidPath(String),

    #[error("script error in task '{task_id}': {message}")]
    Script { task_id: String, message: String },

    #[error("service task '{task_name}' failed: {source}")]
    Service {
        task_name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("service task '{0}' is not registered")]
    ServiceTaskNotFound(String),

    #[error("node '{0}' not found in process graph")]
    NodeNotFound(String),

    #[error("run loop exceeded {0} iterations")]
    ExecutionLimit(usize),

    #[error(
        "called process for activity '{activity}' failed{}",
        match error_code { Some(c) => format!(" with error code '{c}'"), None => String::new() }
    )]
    CalledProcessFailed {
        activity: String,
        error_code: Option<String>,
    },

    // ── Instance lifecycle errors ──
    #[error("process instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("cannot {action} instance in {status} state")]
    InvalidStateTransition { action: &'static str, status: String },

    #[error("invalid variable '{name}': {message}")]
    InvalidVariable { name: String, message: String },

    // ── Transaction errors ──
    #[error("instance {0} already has an active transaction")]
    TransactionActive(Uuid),

    #[error("instance {0} has no active transaction")]
    NoActiveTransaction(Uuid),

    // ── Scheduling errors ──
    #[error("invalid timer definition '{0}'")]
    InvalidTimer(String),

    // ── Event bus errors ──
    #[error("event bus delivery failed: {0}")]
    Bus(String),

    // ── Store errors ──
    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidBpmn(_)
            | EngineError::CyclicGraph(_)
            | EngineError::MissingStartEvent => ErrorKind::Definition,
            EngineError::DefinitionNotFound(_) | EngineError::InstanceNotFound(_) => {
                ErrorKind::NotFound
            }
            EngineError::TokenNotFound { .. }
            | EngineError::TokenNotActive { .. }
            | EngineError::TokenExists { .. } => ErrorKind::TokenState,
            EngineError::ExpressionSyntax(_) | EngineError::ExpressionEval(_) => {
                ErrorKind::Expression
            }
            EngineError::NoValidPath(_)
            | EngineError::Script { .. }
            | EngineError::Service { .. }
            | EngineError::ServiceTaskNotFound(_)
            | EngineError::NodeNotFound(_)
            | EngineError::ExecutionLimit(_)
            | EngineError::CalledProcessFailed { .. } => ErrorKind::Executor,
            EngineError::InvalidStateTransition { .. } | EngineError::InvalidVariable { .. } => {
                ErrorKind::Definition
            }
            EngineError::TransactionActive(_) | EngineError::NoActiveTransaction(_) => {
                ErrorKind::Transaction
            }
            EngineError::InvalidTimer(_) => ErrorKind::Scheduling,
            EngineError::Bus(_) => ErrorKind::Bus,
            EngineError::Store(_) => ErrorKind::Store,
        }
    }

    /// True for token-state errors inside an instance that no longer exists;
    /// the run loop treats these as a benign concurrent terminate.
    pub fn is_token_state(&self) -> bool {
        self.kind() == ErrorKind::TokenState
    }

    /// HTTP-style status for the RPC boundary.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::Definition | ErrorKind::Transaction | ErrorKind::Expression => 400,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_taxonomy() {
        assert_eq!(
            EngineError::InvalidBpmn("x".into()).kind(),
            ErrorKind::Definition
        );
        assert_eq!(
            EngineError::TokenNotActive {
                node_id: "Task_1".into(),
                state: "WAITING".into()
            }
            .kind(),
            ErrorKind::TokenState
        );
        assert_eq!(
            EngineError::TransactionActive(Uuid::nil()).kind(),
            ErrorKind::Transaction
        );
        assert_eq!(
            EngineError::CalledProcessFailed {
                activity: "Call_1".into(),
                error_code: Some("E42".into())
            }
            .kind(),
            ErrorKind::Executor
        );
    }

    #[test]
    fn status_codes() {
        assert_eq!(EngineError::InstanceNotFound(Uuid::nil()).status_code(), 404);
        assert_eq!(EngineError::NoActiveTransaction(Uuid::nil()).status_code(), 400);
        assert_eq!(EngineError::ExecutionLimit(1000).status_code(), 500);
    }
}
