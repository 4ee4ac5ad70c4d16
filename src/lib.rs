//! Authentication and API access for Microsoft 365 administration.
//!
//! [`auth`] acquires and caches tokens for Microsoft Graph and opens
//! Exchange Online sessions; [`api`] calls Graph with retries, pagination
//! and a response cache.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod sanitize;

pub use error::{ApiOutcome, Error, Result};
