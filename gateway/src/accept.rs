//! The client accept loop (§6). Treated as an external collaborator by the
//! core spec, but a binary needs *something* here: bind a TCP listener,
//! upgrade to WebSocket, pull `rs_key`/`rs_sessid`/`rs_api` off the query
//! string, call `VALIDATE_AND_LOAD`, and only then construct an
//! [`Orchestrator`].
//!
//! A real HTTP upgrade negotiation would let us reject with a genuine
//! `400`/`402`/`403`/`503` status before completing the handshake. Plain
//! `tokio-tungstenite` only gives us a pre-upgrade callback to *read* the
//! request, not to defer the handshake pending an async IPC round trip, so
//! rejections here close the freshly upgraded socket with a 4xxx close code
//! carrying the same meaning instead.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as PLMutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use rsvoice_protocol::Transport;

use crate::client_stream::ClientStream;
use crate::config::GatewayConfig;
use crate::ipc_client::{GatewayIpc, IpcClient};
use crate::orchestrator::Orchestrator;

const CLOSE_MISSING_PARAMS: u16 = 4400;
const CLOSE_NO_CREDITS: u16 = 4402;
const CLOSE_AUTH_FAILED: u16 = 4403;
const CLOSE_IPC_UNAVAILABLE: u16 = 4503;

#[derive(Default, Clone)]
struct QueryParams {
    rs_key: Option<String>,
    rs_sessid: Option<String>,
    rs_api: Option<String>,
}

fn parse_query(uri: &str) -> QueryParams {
    let mut params = QueryParams::default();
    let Some((_, query)) = uri.split_once('?') else {
        return params;
    };
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key {
            "rs_key" => params.rs_key = Some(value.to_string()),
            "rs_sessid" => params.rs_sessid = Some(value.to_string()),
            "rs_api" => params.rs_api = Some(value.to_string()),
            _ => {}
        }
    }
    params
}

pub async fn run(config: Arc<GatewayConfig>) -> std::io::Result<()> {
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("gateway listening on {}", config.bind_addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, config).await {
                warn!("connection from {peer} ended: {e}");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    config: Arc<GatewayConfig>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let params = Arc::new(PLMutex::new(QueryParams::default()));
    let params_for_cb = params.clone();

    let callback = move |req: &Request, resp: Response| {
        *params_for_cb.lock() = parse_query(req.uri().to_string().as_str());
        Ok(resp)
    };

    let ws = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        callback,
        Some(WebSocketConfig::default()),
    )
    .await?;

    let params = params.lock().clone();
    let (Some(rs_key), Some(rs_sessid)) = (params.rs_key.clone(), params.rs_sessid.clone()) else {
        close_with(ws, CLOSE_MISSING_PARAMS, "missing rs_key/rs_sessid").await;
        return Ok(());
    };

    let transport = match Transport::connect(&config.socket_path, config.request_timeout, config.high_water_mark).await
    {
        Ok(t) => t,
        Err(e) => {
            warn!("datastore unreachable: {e}");
            close_with(ws, CLOSE_IPC_UNAVAILABLE, "datastore unavailable").await;
            return Ok(());
        }
    };
    let ipc_client = Arc::new(IpcClient::new(transport));

    let loaded = match ipc_client.validate_and_load(&rs_key, &rs_sessid).await {
        Ok(r) => r,
        Err(e) => {
            warn!("validate_and_load failed: {e}");
            close_with(ws, CLOSE_IPC_UNAVAILABLE, "datastore request failed").await;
            return Ok(());
        }
    };

    if !loaded.error.is_empty() {
        let code = if loaded.error == "NO_CREDITS" {
            CLOSE_NO_CREDITS
        } else {
            CLOSE_AUTH_FAILED
        };
        close_with(ws, code, &loaded.error).await;
        return Ok(());
    }

    let (mut write, mut read) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(256);
    tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    let client_stream: Arc<dyn ClientStream> = Arc::new(ChannelClientStream(outbound_tx));
    let ipc: Arc<dyn GatewayIpc> = ipc_client;

    let orch = Orchestrator::construct(
        loaded.account_id,
        rs_sessid,
        loaded.session_data,
        loaded.credits,
        client_stream,
        ipc,
        config.upstream_ws_url.clone(),
        params.rs_api.unwrap_or_else(|| config.openai_api_key.clone()),
    );

    Orchestrator::connect(&orch).await;

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Err(e) = Orchestrator::send(&orch, &text.to_string()) {
                    warn!("client send rejected: {e}");
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    Orchestrator::cleanup(&orch);
    Ok(())
}

struct ChannelClientStream(mpsc::Sender<Message>);

impl ClientStream for ChannelClientStream {
    fn send(&self, raw: &str) -> Result<(), rsvoice_protocol::CoreError> {
        self.0
            .try_send(Message::Text(raw.to_string().into()))
            .map_err(|_| rsvoice_protocol::CoreError::InternalError)
    }
}

async fn close_with(
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    code: u16,
    reason: &str,
) {
    let mut ws = ws;
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    let _ = ws.close(Some(frame)).await;
}
