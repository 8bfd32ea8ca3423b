//! Ingestion gatekeeper: rate limiting, policy, and envelope orchestration

mod coordinator;
mod policy;
mod ratelimit;

pub use coordinator::{IngestCoordinator, IngestOutcome};
pub use policy::PolicyValidator;
pub use ratelimit::RateLimiter;
