//! Mailgate Storage - Durable storage backends
//!
//! This crate provides the database pool, the job queue, the counting
//! store used for rate limiting and short-TTL caching, and the on-disk
//! message spool.

pub mod counters;
pub mod db;
pub mod models;
pub mod queue;
pub mod spool;
