pub mod assembler;
pub mod claude_cli;
pub mod cycle;
pub mod embedding;
pub mod error;
pub mod generator;
pub mod openai;
pub mod parser;
pub mod prompts;
pub mod reflection;
pub mod service;

pub mod test_support;

pub use assembler::{Assembler, CitationTable, DecisionContext, PromptMemory};
pub use claude_cli::ClaudeCliGenerator;
pub use cycle::{observation_memories, DayOutcome, DecisionCycle};
pub use embedding::{CachedEmbedder, Embedder, HashingEmbedder, OpenAiEmbedder};
pub use error::AgentError;
pub use generator::{GenerationState, GuardPolicy, GuardedGenerator};
pub use openai::OpenAiChatGenerator;
pub use reflection::{reflection_text, ReflectionPolicy};
pub use service::TextGenerator;
