//! Configuration loading and effective-config types.

pub mod include;
pub mod json;
pub mod loader;
pub mod schema;

pub use loader::{
    absolute, normalize_path, ConfigLoader, DependencyOutputs, LoadOptions, SentinelOutputs,
};
pub use schema::*;
