pub mod client;
pub mod traits;
pub mod types;

pub use client::LlmClient;
pub use traits::Llm;
pub use types::{AnalysisEntry, GenerateRequest, GenerateResponse};
