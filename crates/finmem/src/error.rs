use finmem_agents::AgentError;
use finmem_memory::MemoryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid observation on line {line}: {source}")]
    Observation {
        line: usize,
        source: serde_json::Error,
    },

    #[error("Data error: {0}")]
    Data(String),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}
