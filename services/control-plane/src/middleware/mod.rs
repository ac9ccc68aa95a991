//! Middleware for the marketplace API

pub mod admin;
pub mod auth;
pub mod rate_limit;

// Re-export commonly used items
pub use admin::{admin_middleware, developer_middleware, AdminContext};
pub use auth::{auth_middleware, AuthContext};
pub use rate_limit::{public_rate_limit_middleware, rate_limit_middleware, RateLimiter};
