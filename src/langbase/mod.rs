//! Langbase Pipes client: the HTTP model-invocation backend.

mod client;
mod types;

pub use client::LangbaseClient;
pub use types::*;
