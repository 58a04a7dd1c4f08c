//! ShardFS Common - Shared types and utilities
//!
//! This crate provides the identity types, error definitions, and
//! configuration structs used across all ShardFS components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    EngineOptions, IndexOptions, LeaseOptions, NetOptions, ServerOptions, MAX_SERVERS,
};
pub use error::{Error, Result};
pub use types::*;
