//! # Syncflow Core
//!
//! Types shared by every syncflow crate: the TOML configuration tree and the
//! orchestrator error taxonomy.

pub mod config;
pub mod error;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
