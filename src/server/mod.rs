//! HTTP server exposing the cache.
//!
//! - [`cache_api`]: Request/response types and route handlers

pub mod cache_api;
