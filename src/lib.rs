//! Market Engine Library
//!
//! This library provides the core functionality for the pool-based prediction market engine.

// Re-export modules for use in binaries
pub mod amm_core;
pub mod config;
pub mod documents;
pub mod http;
pub mod market_api;
pub mod pg_store;
pub mod store;
pub mod stress;

#[cfg(test)]
mod integration_tests;
