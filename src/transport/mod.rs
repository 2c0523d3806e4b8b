//! Wire transports. Both adapters present the same contract: `connect`
//! yields an ordered stream of [`TransportSignal`]s for one physical
//! connection, `send` carries client actions the other way.

pub mod error;
pub mod mock;
pub mod sse;
pub mod websocket;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::ConnectionSettings;
use crate::protocol::ClientAction;

pub use error::TransportError;
pub use mock::{MockConfig, MockRemote, MockTransport};
pub use sse::SseTransport;
pub use websocket::WebSocketTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Duplex socket
    #[default]
    #[serde(alias = "ws")]
    WebSocket,
    /// Server-sent event stream plus request calls for client actions
    Sse,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::WebSocket => "websocket",
            TransportMode::Sse => "sse",
        }
    }
}

/// What a live connection reports, in server order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// Physical connection established
    Opened,
    /// Raw event frame
    Frame(String),
    /// Server-sent event whose name may carry the event type
    NamedFrame { event: String, data: String },
    /// Connection ended without the client asking for it
    Lost { reason: String },
}

#[async_trait]
pub trait Transport: Send {
    fn mode(&self) -> TransportMode;

    /// Open a connection. Any previous connection is closed first; its
    /// receiver simply ends.
    async fn connect(
        &mut self,
        endpoint: &str,
        token: &str,
    ) -> Result<mpsc::Receiver<TransportSignal>, TransportError>;

    async fn send(&mut self, action: &ClientAction) -> Result<(), TransportError>;

    /// Close the connection. Does not produce a `Lost` signal.
    async fn close(&mut self);

    fn is_connected(&self) -> bool;
}

/// Build the transport selected in config.
pub fn from_settings(settings: &ConnectionSettings) -> Box<dyn Transport> {
    match settings.transport {
        TransportMode::WebSocket => Box::new(WebSocketTransport::new(
            Duration::from_secs(settings.heartbeat_secs),
            settings.event_buffer,
        )),
        TransportMode::Sse => Box::new(SseTransport::new(
            settings.api_base.clone(),
            settings.event_buffer,
        )),
    }
}
