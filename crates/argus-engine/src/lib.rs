pub mod classify;
pub mod pipeline;
pub mod relationships;
pub mod sweeper;
pub mod updates;

pub use pipeline::{IngestPipeline, PipelineError};
pub use relationships::RelationshipEngine;
pub use updates::Update;
