//! Core types and utilities for flowctl
//!
//! # Modules
//!
//! - `config`: Environment loading and runtime controller configuration
//! - `error`: Error types and Result alias
//! - `types`: Address and identifier types shared by every crate

pub mod config;
pub mod error;
pub mod types;

// Re-exports
pub use config::{BackendConfig, ControllerConfig, VipConfig};
pub use error::{Error, Result};
pub use types::*;
