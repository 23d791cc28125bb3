//! Assistant chat.
//!
//! # Responsibility
//! - Stream completions from an OpenAI-compatible endpoint.
//! - Keep chat transcripts and write generated text into entries.

pub mod compose;
pub mod session;
pub mod stream;
