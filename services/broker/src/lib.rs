//! Broker service library crate.
//!
//! Exposes configuration, node wiring and the admin HTTP surface for the
//! broker binary and integration tests.
pub mod admin_http;
pub mod config;
pub mod node;
