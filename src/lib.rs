//! DEP-11 AppStream metadata harvester for Debian-style package archives.
//!
//! Scans binary packages for AppStream metainfo and desktop entries,
//! resolves icons across the archive, downloads screenshots, and keeps a
//! content-addressed cache from which the compressed YAML catalog is
//! generated.

pub mod archive;
pub mod cache;
pub mod config;
pub mod extractor;
pub mod generator;
pub mod hints;
pub mod icons;
pub mod model;
pub mod parsers;
pub mod scheduler;
pub mod screenshots;
pub mod version;

// Re-export the types most callers need
pub use cache::Cache;
pub use config::Config;
pub use extractor::Extractor;
pub use generator::{Generator, GeneratorError};
pub use model::{Component, Package};
pub use scheduler::Scheduler;
