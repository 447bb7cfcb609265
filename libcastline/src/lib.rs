//! Castline - scheduled publishing to social platforms
//!
//! This library holds the post-publishing pipeline: expanding a scheduled
//! post into per-profile targets, executing publish attempts, deciding
//! retries, and driving it all from a polling dispatch loop.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod platforms;
pub mod scheduling;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{CastlineError, Result};
pub use pipeline::PublishPipeline;
pub use types::{Post, PostStatus, PostTarget, SocialProfile, TargetStatus};
