//! Shared building blocks for the camsync node and central services.

pub mod artifact;
pub mod config;
pub mod protocol;
