//! LLM integration: the [`LanguageModel`] seam, its `async-openai`-backed
//! implementation, and the shared JSON-extraction helper every prompt-parsing
//! call site in this crate relies on.

mod client;
pub mod json_extract;

pub use client::{ChunkStream, LanguageModel, OpenAiClient};
pub use client::stub::StubLanguageModel;
