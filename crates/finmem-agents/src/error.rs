use finmem_memory::MemoryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    /// The text generation service could not be reached or answered with an
    /// error status.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    #[error("Response parse error: {0}")]
    Parse(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A per-symbol worker task panicked or was cancelled.
    #[error("Task error: {0}")]
    Task(String),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Errors worth retrying: the request may succeed if sent again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::Transport(_) | AgentError::Timeout(_) | AgentError::Embedding(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(AgentError::Timeout(30).is_transient());
        assert!(AgentError::Transport("connection reset".into()).is_transient());
        assert!(!AgentError::Parse("bad json".into()).is_transient());
        assert!(!AgentError::Memory(MemoryError::Invariant("x".into())).is_transient());
    }
}
