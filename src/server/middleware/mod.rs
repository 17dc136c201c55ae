// src/server/middleware/mod.rs
pub mod rate_limit;
pub mod validation;

// Re-export main components for cleaner imports
pub use rate_limit::MethodRateLimiter;
pub use validation::{validate_envelope, validate_params, RejectedRequest};
