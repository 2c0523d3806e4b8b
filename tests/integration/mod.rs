//! Integration tests for chat-stream
//!
//! These tests drive the session, transports and correlation engine
//! together, against in-memory or local fake servers.

#[path = "../common/mod.rs"]
pub mod common;

pub mod correlation_props;
pub mod session_flow;
pub mod transport_sse;
pub mod transport_ws;
