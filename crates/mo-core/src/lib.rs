//! Core types for the model record store: records, queries, errors,
//! configuration and the interfaces the store consumes from its host.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{DatabaseDirSource, MoConfig, StorageConfig};
pub use error::{MoError, Result};
pub use types::*;
