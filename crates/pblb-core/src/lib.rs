//! pblb-core: Core types for the pblb load balancer
//!
//! This crate provides the types shared by the balancer and its binary:
//! - Configuration types and file loading
//! - Error handling

pub mod config;
pub mod error;

pub use config::*;
pub use error::*;
