use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};

use super::{Transport, TransportError, TransportMode, TransportSignal};
use crate::protocol::ClientAction;

/// Duplex socket transport. One reader task forwards frames in arrival
/// order; one writer task owns the sink and the heartbeat.
pub struct WebSocketTransport {
    heartbeat: Duration,
    buffer: usize,
    outgoing: Option<mpsc::Sender<Message>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    alive: Arc<AtomicBool>,
}

impl WebSocketTransport {
    pub fn new(heartbeat: Duration, buffer: usize) -> Self {
        Self {
            heartbeat,
            buffer: buffer.max(1),
            outgoing: None,
            reader: None,
            writer: None,
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    fn abort_tasks(&mut self) {
        for task in [self.reader.take(), self.writer.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::WebSocket
    }

    async fn connect(
        &mut self,
        endpoint: &str,
        token: &str,
    ) -> Result<mpsc::Receiver<TransportSignal>, TransportError> {
        self.close().await;

        let mut request = endpoint
            .into_client_request()
            .map_err(|e| TransportError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| TransportError::Connect("token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        tracing::debug!(endpoint = %endpoint, "Opening websocket");
        let (stream, _response) = connect_async(request).await.map_err(connect_error)?;
        let (mut sink, mut source) = stream.split();

        let (signal_tx, signal_rx) = mpsc::channel(self.buffer);
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(self.buffer);
        let alive = Arc::new(AtomicBool::new(true));
        self.alive = alive.clone();

        let _ = signal_tx.send(TransportSignal::Opened).await;

        let heartbeat = self.heartbeat;
        let writer_signals = signal_tx.clone();
        let writer_alive = alive.clone();
        let writer = tokio::spawn(async move {
            let period = if heartbeat.is_zero() {
                Duration::from_secs(3600)
            } else {
                heartbeat
            };
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let outgoing = tokio::select! {
                    msg = out_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = ticker.tick(), if !heartbeat.is_zero() => Message::Ping(Vec::new()),
                };
                let closing = matches!(outgoing, Message::Close(_));
                if let Err(e) = sink.send(outgoing).await {
                    if writer_alive.swap(false, Ordering::SeqCst) {
                        let _ = writer_signals
                            .send(TransportSignal::Lost {
                                reason: format!("write failed: {e}"),
                            })
                            .await;
                    }
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader_alive = alive;
        let reader = tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        tracing::trace!("WS frame: {}", text);
                        if signal_tx.send(TransportSignal::Frame(text)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if signal_tx.send(TransportSignal::Frame(text)).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => tracing::warn!("Dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => format!("closed by server: {}", frame.reason),
                            None => "closed by server".to_string(),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            if reader_alive.swap(false, Ordering::SeqCst) {
                let _ = signal_tx.send(TransportSignal::Lost { reason }).await;
            }
        });

        self.outgoing = Some(out_tx);
        self.reader = Some(reader);
        self.writer = Some(writer);
        Ok(signal_rx)
    }

    async fn send(&mut self, action: &ClientAction) -> Result<(), TransportError> {
        let Some(outgoing) = &self.outgoing else {
            return Err(TransportError::Closed);
        };
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let payload = serde_json::to_string(action).map_err(|e| TransportError::Send {
            action: action.action_name().to_string(),
            reason: e.to_string(),
        })?;
        outgoing
            .send(Message::Text(payload))
            .await
            .map_err(|_| TransportError::Send {
                action: action.action_name().to_string(),
                reason: "writer stopped".to_string(),
            })
    }

    async fn close(&mut self) {
        // Flag first so neither task reports the shutdown as a loss.
        self.alive.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        // The writer exits on its own once the close frame is flushed.
        if let Some(outgoing) = self.outgoing.take() {
            if outgoing.try_send(Message::Close(None)).is_err() {
                self.abort_tasks();
            }
        }
        self.writer = None;
    }

    fn is_connected(&self) -> bool {
        self.outgoing.is_some() && self.alive.load(Ordering::SeqCst)
    }
}

fn connect_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            TransportError::Unauthorized
        }
        tungstenite::Error::Url(e) => TransportError::InvalidEndpoint(e.to_string()),
        other => TransportError::Connect(other.to_string()),
    }
}
