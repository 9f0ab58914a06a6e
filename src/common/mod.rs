//! Common utilities and shared functionality
//!
//! Types, traits and configuration loading used across the engine.

pub mod config;
pub mod traits;
pub mod types;
