pub mod config;
pub mod error;
pub mod ingest;
pub mod migrate;
pub mod model;
pub mod pipeline;
pub mod quality;
pub mod ranking;
pub mod runtime;
pub mod staging;
pub mod store;
pub mod windows;

pub use error::{PipelineError, QualityViolation};
