pub mod error;
pub mod pricing;
pub mod reader;
pub mod writer;

pub use error::RecorderError;
pub use reader::{RunTrace, StageTrace, TraceReader};
pub use writer::{EmbeddingUsageRecord, LlmUsageDescriptor, RunSession, TraceWriter};
