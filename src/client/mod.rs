//! Collaborators the session core calls into: token supply and the REST
//! backend.

pub mod auth;
pub mod rest;

pub use auth::{AuthProvider, EnvTokenProvider, StaticTokenProvider};
pub use rest::{ApiError, ConversationApi, HistoryPage, HttpConversationApi};
