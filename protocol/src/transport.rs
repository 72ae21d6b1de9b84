//! Correlated request/response transport over a single duplex Unix socket
//! (§4.2). This is the initiator (Gateway) side: it keeps a pending-request
//! table keyed by correlation id, demultiplexes replies out of a background
//! reader task, and enforces a high-water mark on both lanes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::codec::{self, DecodedResponse};
use crate::error::CoreError;
use crate::framing::{read_frame, write_frame};
use crate::schema::{Lane, MessageType};

struct PendingRequest {
    expected_type: MessageType,
    reply_tx: oneshot::Sender<DecodedResponse>,
}

/// Handle to a connected transport. Cloning shares the same underlying
/// connection; the reader and writer tasks are each spawned once per
/// connected socket.
#[derive(Clone)]
pub struct Transport {
    outbound: mpsc::Sender<String>,
    pending: Arc<DashMap<String, PendingRequest>>,
    destroyed: Arc<AtomicBool>,
    timeout: Duration,
    high_water_mark: usize,
}

impl Transport {
    /// Connect to `socket_path` and spawn the reader/writer tasks.
    pub async fn connect(
        socket_path: &str,
        timeout: Duration,
        high_water_mark: usize,
    ) -> Result<Self, CoreError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|_| CoreError::InternalZmqNotConnected)?;
        let (read_half, mut write_half) = stream.into_split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(high_water_mark);
        let pending: Arc<DashMap<String, PendingRequest>> = Arc::new(DashMap::new());
        let destroyed = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &frame).await {
                    error!("transport write failed: {e}");
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut read_half = read_half;
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(frame)) => demux(&reader_pending, &frame),
                    Ok(None) => {
                        debug!("transport connection closed by peer");
                        break;
                    }
                    Err(e) => {
                        error!("transport read failed: {e}");
                        break;
                    }
                }
            }
            reject_all_pending(&reader_pending, CoreError::InternalZmqDestroyed);
        });

        Ok(Self {
            outbound: outbound_tx,
            pending,
            destroyed,
            timeout,
            high_water_mark,
        })
    }

    /// Send a request/response message and await its reply, subject to the
    /// configured timeout. Returns `INTERNAL_ZMQ_REQUEST_TIMEOUT` on timeout
    /// and removes the pending entry in that case.
    pub async fn request(
        &self,
        message_type: MessageType,
        args: &[&str],
    ) -> Result<DecodedResponse, CoreError> {
        debug_assert_eq!(message_type.lane(), Lane::Request);
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(CoreError::InternalZmqDestroyed);
        }
        if self.pending.len() >= self.high_water_mark {
            return Err(CoreError::InternalError);
        }

        let correlation_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(
            correlation_id.clone(),
            PendingRequest {
                expected_type: message_type,
                reply_tx,
            },
        );

        let frame = codec::encode_request(&correlation_id, message_type, args);
        if self.outbound.try_send(frame).is_err() {
            self.pending.remove(&correlation_id);
            return Err(CoreError::InternalZmqNotConnected);
        }

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CoreError::InternalZmqDestroyed),
            Err(_) => {
                self.pending.remove(&correlation_id);
                Err(CoreError::InternalZmqRequestTimeout)
            }
        }
    }

    /// Send a fire-and-forget message. If not connected or the outbound
    /// queue is over the high-water mark, the send is dropped and logged —
    /// it never fails the caller (§4.2, §7 propagation policy).
    pub fn fire_and_forget(&self, message_type: MessageType, args: &[&str]) {
        debug_assert_eq!(message_type.lane(), Lane::OneWay);
        if self.destroyed.load(Ordering::SeqCst) {
            warn!("dropping {} : transport destroyed", message_type.as_wire());
            return;
        }
        let correlation_id = Uuid::new_v4().to_string();
        let frame = codec::encode_request(&correlation_id, message_type, args);
        if self.outbound.try_send(frame).is_err() {
            warn!("dropping {} : outbound queue full or closed", message_type.as_wire());
        }
    }

    /// Tear down the transport: reject all pending requests with
    /// `INTERNAL_ZMQ_DESTROYED` and stop accepting new sends.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        reject_all_pending(&self.pending, CoreError::InternalZmqDestroyed);
    }
}

fn demux(pending: &DashMap<String, PendingRequest>, line: &str) {
    let Some(correlation_id) = codec::peek_correlation_id(line) else {
        warn!("received unparseable frame");
        return;
    };
    let Some((_, entry)) = pending.remove(correlation_id) else {
        warn!("received response for unknown correlation id {correlation_id}");
        return;
    };
    match codec::decode_response(line, entry.expected_type) {
        Ok(response) => {
            let _ = entry.reply_tx.send(response);
        }
        Err(e) => {
            warn!("failed to decode response for {correlation_id}: {e}");
        }
    }
}

fn reject_all_pending(pending: &DashMap<String, PendingRequest>, error: CoreError) {
    let keys: Vec<String> = pending.iter().map(|e| e.key().clone()).collect();
    for key in keys {
        if let Some((id, entry)) = pending.remove(&key) {
            let _ = entry.reply_tx.send(DecodedResponse {
                correlation_id: id,
                error: error.wire_code().to_string(),
                fields: Vec::new(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    fn socket_path() -> String {
        std::env::temp_dir()
            .join(format!("rsvoice-transport-test-{}.sock", Uuid::new_v4()))
            .to_string_lossy()
            .into_owned()
    }

    /// The regression this guards: a `\n`-delimited frame boundary would
    /// split a checkpoint payload like this one (§4.9 joins speaker turns
    /// with `\n`) into bogus partial frames.
    #[tokio::test]
    async fn request_round_trips_a_response_with_an_embedded_newline() {
        let path = socket_path();
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read_half, mut write_half) = stream.into_split();
            let frame = read_frame(&mut read_half).await.unwrap().unwrap();
            let correlation_id = codec::peek_correlation_id(&frame).unwrap().to_string();
            let response = codec::encode_response(
                &correlation_id,
                "",
                &["acct1", "user:hi\nagent:hello", "1000"],
            );
            write_frame(&mut write_half, &response).await.unwrap();
        });

        let transport = Transport::connect(&path, Duration::from_millis(500), 10)
            .await
            .unwrap();
        let response = transport
            .request(MessageType::ValidateAndLoad, &["key1", "S1"])
            .await
            .unwrap();
        server.await.unwrap();

        assert!(response.is_success());
        assert_eq!(response.fields[1], "user:hi\nagent:hello");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn fire_and_forget_delivers_an_embedded_newline_payload_intact() {
        let path = socket_path();
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut read_half, _write_half) = stream.into_split();
            read_frame(&mut read_half).await.unwrap().unwrap()
        });

        let transport = Transport::connect(&path, Duration::from_millis(500), 10)
            .await
            .unwrap();
        transport.fire_and_forget(
            MessageType::AppendConversation,
            &["acct1", "S1", "user:hi\nagent:hello"],
        );

        let received = server.await.unwrap();
        let decoded = codec::decode_request(&received).unwrap();
        assert_eq!(decoded.args[2], "user:hi\nagent:hello");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn request_times_out_and_clears_the_pending_entry() {
        let path = socket_path();
        let listener = UnixListener::bind(&path).unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _addr) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let transport = Transport::connect(&path, Duration::from_millis(50), 10)
            .await
            .unwrap();
        let err = transport
            .request(MessageType::GetCredits, &["acct1"])
            .await
            .unwrap_err();

        assert_eq!(err, CoreError::InternalZmqRequestTimeout);
        assert!(transport.pending.is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
