//! Upstream connection (§4.10): owns one outbound WebSocket to the
//! generative voice provider and delegates four events to an attached
//! handler.
//!
//! The handler-nulling pattern is the entire mechanism distinguishing an
//! explicit `disconnect()` from an unexpected close: once nulled, any
//! in-flight read-loop callback becomes a no-op. No `isConnected` flag is
//! kept; `disconnect()` is idempotent.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, warn};

use rsvoice_protocol::CoreError;

pub trait UpstreamHandler: Send + Sync {
    fn on_connect(&self);
    fn on_error(&self, message: String);
    fn on_close(&self, code: u16, reason: String);
    /// Returning `Err` (always `EXTERNAL_NO_CREDITS` in practice) means the
    /// handler has already disconnected the upstream; the reader loop only
    /// logs it, since there is no caller left to propagate it to (§4.11).
    fn on_msg_received(&self, raw: String) -> Result<(), CoreError>;
}

type HandlerSlot = Arc<Mutex<Option<Arc<dyn UpstreamHandler>>>>;

pub struct UpstreamConnection {
    ws_url: String,
    bearer_token: String,
    handler: HandlerSlot,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl UpstreamConnection {
    /// The handler reference is set here, at construction, per §4.10.
    pub fn new(ws_url: String, bearer_token: String, handler: Arc<dyn UpstreamHandler>) -> Self {
        Self {
            ws_url,
            bearer_token,
            handler: Arc::new(Mutex::new(Some(handler))),
            outbound: Mutex::new(None),
            reader_task: Mutex::new(None),
        }
    }

    pub async fn connect(&self) -> Result<(), CoreError> {
        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|_| CoreError::InternalError)?;
        let auth_value = format!("Bearer {}", self.bearer_token)
            .parse()
            .map_err(|_| CoreError::InternalError)?;
        request.headers_mut().insert(AUTHORIZATION, auth_value);

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| {
                error!("upstream connect failed: {e}");
                CoreError::InternalError
            })?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(256);
        *self.outbound.lock() = Some(outbound_tx);

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        if let Some(handler) = self.handler.lock().clone() {
            handler.on_connect();
        }

        let handler_ref = self.handler.clone();
        let reader_task = tokio::spawn(async move {
            let mut closed_explicitly = false;
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if let Some(handler) = handler_ref.lock().clone() {
                            if let Err(e) = handler.on_msg_received(text.to_string()) {
                                warn!("on_msg_received: {e}");
                            }
                        }
                    }
                    Ok(Message::Binary(bytes)) => {
                        if let Some(handler) = handler_ref.lock().clone() {
                            if let Err(e) = handler.on_msg_received(String::from_utf8_lossy(&bytes).into_owned()) {
                                warn!("on_msg_received: {e}");
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        closed_explicitly = true;
                        if let Some(handler) = handler_ref.lock().clone() {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.to_string()))
                                .unwrap_or((1000, String::new()));
                            handler.on_close(code, reason);
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if let Some(handler) = handler_ref.lock().clone() {
                            handler.on_error(e.to_string());
                        }
                    }
                }
            }
            if !closed_explicitly {
                if let Some(handler) = handler_ref.lock().clone() {
                    handler.on_close(1006, "connection ended unexpectedly".to_string());
                }
            }
        });
        *self.reader_task.lock() = Some(reader_task);

        Ok(())
    }

    /// String passthrough when already a string, matching §4.10.
    pub fn send(&self, payload: &str) {
        let sender = self.outbound.lock().clone();
        match sender {
            Some(tx) => {
                if tx.try_send(Message::Text(payload.to_string().into())).is_err() {
                    warn!("upstream send dropped: outbound queue full or closed");
                }
            }
            None => warn!("upstream send dropped: not connected"),
        }
    }

    /// Null the handler reference before closing the underlying connection.
    /// Idempotent: repeated calls are no-ops past the first.
    pub fn disconnect(&self) {
        self.handler.lock().take();
        if let Some(tx) = self.outbound.lock().take() {
            drop(tx);
        }
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
    }
}
