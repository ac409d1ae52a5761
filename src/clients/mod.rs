pub mod embedding;
pub mod oracle;

pub use embedding::{EmbeddingProvider, OpenAiEmbedding};
pub use oracle::{LlmOracle, ReasoningOracle};
