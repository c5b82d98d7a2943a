//! Control-plane service library crate.
//!
//! # Purpose
//! Hosts the outbound dispatcher, the reference domain stores behind the GVK
//! router, configuration, observability, and the composition root, for use by
//! the binary and integration tests.
pub mod app;
pub mod config;
pub mod dispatcher;
pub mod model;
pub mod observability;
pub mod store;
