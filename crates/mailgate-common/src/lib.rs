//! Mailgate Common - Shared types and utilities
//!
//! This crate provides the configuration surface, the error taxonomy,
//! and the envelope/payload types shared across all Mailgate components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
