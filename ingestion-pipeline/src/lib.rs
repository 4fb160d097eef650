#![allow(clippy::missing_docs_in_private_items)]

pub mod chunker;
pub mod limits;
pub mod pipeline;
pub mod queue;

pub use chunker::{chunk, Chunk, ChunkerConfig};
pub use limits::validate_ingest_payload;
pub use pipeline::IngestionPipeline;
pub use queue::{QueueConfig, TaskProcessor, TaskQueue, TaskStatusMap};
