//! Datastore-side IPC accept loop (§4.2, §6).
//!
//! One `UnixListener` accepts connections from Gateway processes. Each
//! connection runs its own reader/writer pair: the reader decodes request
//! frames and dispatches by message type, fire-and-forget types are handled
//! without a reply, and request/response types produce exactly one reply
//! frame carrying the same correlation id. Any exception while handling a
//! request becomes a non-empty error string rather than a dropped
//! connection.

use std::path::Path;
use std::sync::Arc;

use rsvoice_protocol::codec::{self, DecodedRequest};
use rsvoice_protocol::framing::{read_frame, write_frame};
use rsvoice_protocol::schema::{Lane, MessageType};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::service::BusinessService;

pub async fn run(socket_path: &str, high_water_mark: usize, service: Arc<BusinessService>) -> std::io::Result<()> {
    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    info!("datastore IPC listening on {socket_path}");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, high_water_mark, service).await {
                warn!("ipc connection ended: {e}");
            }
        });
    }
}

async fn handle_connection(
    stream: UnixStream,
    high_water_mark: usize,
    service: Arc<BusinessService>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(high_water_mark);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = reply_rx.recv().await {
            if write_frame(&mut write_half, &frame).await.is_err() {
                break;
            }
        }
    });

    let mut read_half = read_half;
    while let Some(frame) = read_frame(&mut read_half)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?
    {
        let reply_tx = reply_tx.clone();
        let service = service.clone();
        tokio::spawn(async move {
            dispatch(&frame, reply_tx, service).await;
        });
    }

    drop(reply_tx);
    let _ = writer_task.await;
    Ok(())
}

async fn dispatch(line: &str, reply_tx: mpsc::Sender<String>, service: Arc<BusinessService>) {
    let request = match codec::decode_request(line) {
        Ok(r) => r,
        Err(e) => {
            warn!("failed to decode request frame: {e}");
            return;
        }
    };

    match request.message_type.lane() {
        Lane::OneWay => handle_one_way(request, service).await,
        Lane::Request => {
            let reply = handle_request(&request, service).await;
            if reply_tx.try_send(reply).is_err() {
                warn!("reply dropped: connection outbound queue full or closed");
            }
        }
    }
}

async fn handle_one_way(request: DecodedRequest, service: Arc<BusinessService>) {
    match request.message_type {
        MessageType::UpdateUsage => {
            let [account_id, session_id, provider, input, output] = take5(&request.args);
            let input_tokens: i64 = input.parse().unwrap_or(0);
            let output_tokens: i64 = output.parse().unwrap_or(0);
            service
                .update_usage(account_id, session_id, provider, input_tokens, output_tokens)
                .await;
        }
        MessageType::SaveSession => {
            let [account_id, session_id, raw_event] = take3(&request.args);
            service.save_session(account_id, session_id, raw_event).await;
        }
        MessageType::AppendConversation => {
            let [account_id, session_id, blob] = take3(&request.args);
            service.append_conversation(account_id, session_id, blob).await;
        }
        other => error!("one-way dispatch received request-lane type {:?}", other),
    }
}

async fn handle_request(request: &DecodedRequest, service: Arc<BusinessService>) -> String {
    match request.message_type {
        MessageType::ValidateAndLoad => {
            let [api_key, session_id] = take2(&request.args);
            let result = service.validate_and_load(&api_key, &session_id).await;
            match result.error {
                Some(err) => codec::encode_response(&request.correlation_id, err.wire_code(), &[]),
                None => codec::encode_response(
                    &request.correlation_id,
                    "",
                    &[&result.account_id, &result.session_data, &result.credits.to_string()],
                ),
            }
        }
        MessageType::GetCredits => {
            let [account_id] = take1(&request.args);
            match service.db.get_credits(&account_id).await {
                Ok(credits) => {
                    codec::encode_response(&request.correlation_id, "", &[&credits.to_string()])
                }
                Err(e) => {
                    error!("getCredits failed: {e}");
                    codec::encode_response(&request.correlation_id, "INTERNAL_ERROR", &[])
                }
            }
        }
        other => {
            error!("request dispatch received one-way type {:?}", other);
            codec::encode_response(&request.correlation_id, "INTERNAL_ERROR", &[])
        }
    }
}

fn take1(args: &[String]) -> [String; 1] {
    [args.first().cloned().unwrap_or_default()]
}

fn take2(args: &[String]) -> [String; 2] {
    [
        args.first().cloned().unwrap_or_default(),
        args.get(1).cloned().unwrap_or_default(),
    ]
}

fn take3(args: &[String]) -> [String; 3] {
    [
        args.first().cloned().unwrap_or_default(),
        args.get(1).cloned().unwrap_or_default(),
        args.get(2).cloned().unwrap_or_default(),
    ]
}

fn take5(args: &[String]) -> [String; 5] {
    [
        args.first().cloned().unwrap_or_default(),
        args.get(1).cloned().unwrap_or_default(),
        args.get(2).cloned().unwrap_or_default(),
        args.get(3).cloned().unwrap_or_default(),
        args.get(4).cloned().unwrap_or_default(),
    ]
}
