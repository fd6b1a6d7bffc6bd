//! # Error Handling
//!
//! One error type for the whole crate. Every variant carries enough context
//! (operation, resource, retryable flag) to log or alert on without walking
//! the call stack.

pub mod types;

pub use types::{ErrorCategory, Result, VaultkeeperError};
