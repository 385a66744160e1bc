//! Concrete [`LlmProvider`](super::LlmProvider) implementations.

#[cfg(feature = "openai")]
mod openai;

#[cfg(feature = "openai")]
pub use openai::OpenAiProvider;
