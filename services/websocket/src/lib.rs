//! WebSocket fan-out service library crate.
//!
//! # Purpose
//! Bridges broker notifications (resource changes and agent logs) to
//! websocket clients: topic grammar, the client protocol, per-connection
//! subscription state, and the axum upgrade route.
pub mod app;
pub mod config;
pub mod hub;
pub mod observability;
pub mod protocol;
pub mod since;
pub mod topic;
