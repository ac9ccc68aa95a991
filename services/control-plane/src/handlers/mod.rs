//! HTTP handlers grouped by resource

pub mod admin;
pub mod auth;
pub mod billing;
pub mod bots;
pub mod credentials;
pub mod points;
pub mod subscriptions;
pub mod users;
