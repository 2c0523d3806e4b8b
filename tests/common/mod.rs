//! Shared test utilities for chat-stream
//!
//! - Wire frame builders
//! - An in-memory `ConversationApi`
//! - Session wiring and event waiting helpers

pub mod fake_api;
pub mod frames;
pub mod session;

pub use fake_api::FakeConversationApi;
pub use session::{mock_session, mock_session_with, test_config, wait_for, TestSession};
