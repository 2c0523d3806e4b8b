use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use reqwest_eventsource::{retry, Event, EventSource, RequestBuilderExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Transport, TransportError, TransportMode, TransportSignal};
use crate::protocol::ClientAction;

/// Unidirectional transport: server events arrive on a long-lived SSE
/// stream, client actions go out as individual POSTs addressed by
/// conversation id.
pub struct SseTransport {
    client: Client,
    api_base: String,
    buffer: usize,
    token: Option<String>,
    reader: Option<JoinHandle<()>>,
}

impl SseTransport {
    pub fn new(api_base: impl Into<String>, buffer: usize) -> Self {
        Self::with_client(Client::new(), api_base, buffer)
    }

    pub fn with_client(client: Client, api_base: impl Into<String>, buffer: usize) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            buffer: buffer.max(1),
            token: None,
            reader: None,
        }
    }

    fn actions_url(&self, action: &ClientAction) -> String {
        format!(
            "{}/conversations/{}/actions",
            self.api_base,
            action.conversation_id()
        )
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Sse
    }

    async fn connect(
        &mut self,
        endpoint: &str,
        token: &str,
    ) -> Result<mpsc::Receiver<TransportSignal>, TransportError> {
        self.close().await;

        let mut events = self
            .client
            .get(endpoint)
            .bearer_auth(token)
            .header(ACCEPT, "text/event-stream")
            .eventsource()
            .map_err(|e| TransportError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
        // Reconnect policy belongs to the session controller.
        events.set_retry_policy(Box::new(retry::Never));

        tracing::debug!(endpoint = %endpoint, "Opening event stream");
        match events.next().await {
            Some(Ok(Event::Open)) => {}
            Some(Ok(Event::Message(_))) => {
                return Err(TransportError::Connect(
                    "event arrived before stream opened".into(),
                ))
            }
            Some(Err(reqwest_eventsource::Error::InvalidStatusCode(status, _)))
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN =>
            {
                events.close();
                return Err(TransportError::Unauthorized);
            }
            Some(Err(e)) => {
                events.close();
                return Err(TransportError::Connect(e.to_string()));
            }
            None => return Err(TransportError::Connect("event stream ended".into())),
        }

        let (signal_tx, signal_rx) = mpsc::channel(self.buffer);
        let _ = signal_tx.send(TransportSignal::Opened).await;

        let reader = tokio::spawn(forward_events(events, signal_tx));
        self.reader = Some(reader);
        self.token = Some(token.to_string());
        Ok(signal_rx)
    }

    async fn send(&mut self, action: &ClientAction) -> Result<(), TransportError> {
        let Some(token) = self.token.as_deref() else {
            return Err(TransportError::Closed);
        };
        let url = self.actions_url(action);
        let send_error = |reason: String| TransportError::Send {
            action: action.action_name().to_string(),
            reason,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(action)
            .send()
            .await
            .map_err(|e| send_error(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TransportError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(send_error(format!("{status}: {body}")));
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.token = None;
    }

    fn is_connected(&self) -> bool {
        self.reader
            .as_ref()
            .is_some_and(|reader| !reader.is_finished())
    }
}

async fn forward_events(mut events: EventSource, signals: mpsc::Sender<TransportSignal>) {
    let reason = loop {
        match events.next().await {
            Some(Ok(Event::Open)) => {}
            Some(Ok(Event::Message(message))) => {
                tracing::trace!(event = %message.event, "SSE frame: {}", message.data);
                let signal = if message.event.is_empty() || message.event == "message" {
                    TransportSignal::Frame(message.data)
                } else {
                    TransportSignal::NamedFrame {
                        event: message.event,
                        data: message.data,
                    }
                };
                if signals.send(signal).await.is_err() {
                    events.close();
                    return;
                }
            }
            Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => {
                break "event stream ended".to_string();
            }
            Some(Err(e)) => break e.to_string(),
        }
    };
    events.close();
    let _ = signals.send(TransportSignal::Lost { reason }).await;
}
