//! Relationship tracking: `@mention` parsing, identity resolution,
//! extraction staging and exactly-once review over SQLite.

pub mod config;
pub mod disambiguation;
pub mod error;
pub mod extraction;
pub mod graph;
pub mod logging;
pub mod manager;
pub mod mentions;
pub mod metadata;
pub mod resolver;
pub mod review;
pub mod storage;
pub mod validator;

pub use error::{PipelineError, PipelineResult};
pub use manager::RelationshipManager;
