pub mod client;
pub mod rate_limit;

// Re-export the client types for convenient access (e.g. `use crate::exchange::BybitClient`).
pub use client::{BybitClient, Credentials, MAX_PAGE_LIMIT};
pub use rate_limit::{RateLimitSnapshot, RateLimitTracker};
