//! REST API module for external integrations
//!
//! Provides an HTTP API for inspecting Modules, triggering reconciles and
//! rollbacks, and managing the template cache.

mod dto;
mod handlers;
mod server;

pub use server::{router, run_server};
