//! The Orchestrator (§4.11): the per-session state machine tying together
//! the client stream, the upstream connection, credit accounting,
//! conversation checkpointing, and session replay/persistence.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use rsvoice_protocol::CoreError;

use crate::checkpoint_handler::CheckpointHandler;
use crate::client_stream::ClientStream;
use crate::ipc_client::GatewayIpc;
use crate::upstream::{UpstreamConnection, UpstreamHandler};

pub const BUFFER_CAPACITY: usize = 10_000;
/// Cadence for the credit refresh, in upstream completion events (§4.11,
/// §5 "every 50 upstream completions").
const CREDIT_REFRESH_CADENCE: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Preconnect,
    Connecting,
    Connected,
    Draining,
    Terminated,
}

struct Mutable {
    state: OrchestratorState,
    buffer: VecDeque<String>,
    skip_session_save: bool,
    response_count: u32,
    preloaded_session_data: String,
}

/// The session state machine. Always held behind `Arc` so the upstream
/// connection's handler and the credit-refresh background task can hold a
/// reference back without an explicit `isConnected`/`shouldReconnect` flag
/// anywhere (§9 re-entrant cycles).
pub struct Orchestrator {
    pub account_id: String,
    pub session_id: String,
    client: Arc<dyn ClientStream>,
    ipc: Arc<dyn GatewayIpc>,
    upstream_url: String,
    upstream_bearer_token: String,
    upstream: Mutex<Option<Arc<UpstreamConnection>>>,
    usage_handler: Arc<crate::usage_handler::UsageHandler>,
    checkpoint_handler: Arc<CheckpointHandler>,
    credits: AtomicI64,
    credit_refresh_in_progress: AtomicBool,
    mutable: Mutex<Mutable>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn construct(
        account_id: String,
        session_id: String,
        session_data: String,
        credits: i64,
        client: Arc<dyn ClientStream>,
        ipc: Arc<dyn GatewayIpc>,
        upstream_url: String,
        upstream_bearer_token: String,
    ) -> Arc<Self> {
        let skip_session_save = !session_data.is_empty();
        Arc::new(Self {
            usage_handler: Arc::new(crate::usage_handler::UsageHandler::new(
                account_id.clone(),
                session_id.clone(),
            )),
            checkpoint_handler: Arc::new(CheckpointHandler::new(account_id.clone(), session_id.clone())),
            account_id,
            session_id,
            client,
            ipc,
            upstream_url,
            upstream_bearer_token,
            upstream: Mutex::new(None),
            credits: AtomicI64::new(credits),
            credit_refresh_in_progress: AtomicBool::new(false),
            mutable: Mutex::new(Mutable {
                state: OrchestratorState::Preconnect,
                buffer: VecDeque::new(),
                skip_session_save,
                response_count: 0,
                preloaded_session_data: session_data,
            }),
        })
    }

    pub fn state(orch: &Arc<Self>) -> OrchestratorState {
        orch.mutable.lock().state
    }

    /// If a prior upstream connection exists, disconnect it first — this
    /// prevents leaking the old handler. Construct a fresh upstream
    /// connection with this Orchestrator (via a bridge) as its handler.
    pub async fn connect(orch: &Arc<Self>) {
        if let Some(prior) = orch.upstream.lock().take() {
            prior.disconnect();
        }

        orch.mutable.lock().state = OrchestratorState::Connecting;

        let bridge: Arc<dyn UpstreamHandler> = Arc::new(HandlerBridge(orch.clone()));
        let upstream = Arc::new(UpstreamConnection::new(
            orch.upstream_url.clone(),
            orch.upstream_bearer_token.clone(),
            bridge,
        ));

        if let Err(e) = upstream.connect().await {
            error!("upstream connect failed for session {}: {e}", orch.session_id);
            return;
        }

        *orch.upstream.lock() = Some(upstream);
    }

    /// Called by the client stream on every inbound client frame.
    /// Never awaits (§4.11, §9).
    pub fn send(orch: &Arc<Self>, client_msg: &str) -> Result<(), CoreError> {
        let connected = {
            let mut mutable = orch.mutable.lock();
            if mutable.state != OrchestratorState::Connected {
                if mutable.buffer.len() >= BUFFER_CAPACITY {
                    return Err(CoreError::ExternalBufferOverflow);
                }
                mutable.buffer.push_back(client_msg.to_string());
                false
            } else {
                true
            }
        };

        if !connected {
            return Ok(());
        }

        check_and_schedule_credits_check(orch);

        if orch.credits.load(Ordering::SeqCst) <= 0 {
            if let Some(upstream) = orch.upstream.lock().clone() {
                upstream.disconnect();
            }
            return Err(CoreError::ExternalNoCredits);
        }

        if let Some(upstream) = orch.upstream.lock().clone() {
            upstream.send(client_msg);
        }
        Ok(())
    }

    /// Fire-and-forget flush of both per-session handlers, then disconnect
    /// the upstream and clear the buffer. Idempotent.
    pub fn cleanup(orch: &Arc<Self>) {
        orch.usage_handler.flush(orch.ipc.as_ref());
        orch.checkpoint_handler.flush(orch.ipc.as_ref());
        if let Some(upstream) = orch.upstream.lock().take() {
            upstream.disconnect();
        }
        orch.mutable.lock().buffer.clear();
    }
}

/// Bridges the sync [`UpstreamHandler`] callbacks to the Orchestrator's
/// Arc-holding operations, since `on_close` must be able to trigger a fresh
/// `connect()` (§4.11).
struct HandlerBridge(Arc<Orchestrator>);

impl UpstreamHandler for HandlerBridge {
    fn on_connect(&self) {
        on_connect(&self.0);
    }

    fn on_error(&self, message: String) {
        on_error(&self.0, message);
    }

    fn on_close(&self, code: u16, reason: String) {
        on_close(&self.0, code, reason);
    }

    fn on_msg_received(&self, raw: String) -> Result<(), CoreError> {
        on_msg_received(&self.0, raw)
    }
}

fn on_connect(orch: &Arc<Orchestrator>) {
    let preloaded = {
        let mut mutable = orch.mutable.lock();
        mutable.state = OrchestratorState::Connected;
        std::mem::take(&mut mutable.preloaded_session_data)
    };

    if let Some(upstream) = orch.upstream.lock().clone() {
        if !preloaded.is_empty() {
            upstream.send(&preloaded);
        }

        let drained: Vec<String> = {
            let mut mutable = orch.mutable.lock();
            mutable.buffer.drain(..).collect()
        };
        for msg in drained {
            upstream.send(&msg);
        }
    }
}

/// Critical path: forward to the client first, *before* any suspension. A
/// failure here means the client is gone and the session must be torn down.
fn on_msg_received(orch: &Arc<Orchestrator>, raw: String) -> Result<(), CoreError> {
    if orch.client.send(&raw).is_err() {
        Orchestrator::cleanup(orch);
        return Ok(());
    }

    if let Some(tokens) = orch.usage_handler.ingest(&raw, orch.ipc.as_ref()) {
        orch.credits
            .fetch_sub(tokens.input_tokens + tokens.output_tokens, Ordering::SeqCst);
        {
            let mut mutable = orch.mutable.lock();
            mutable.response_count += 1;
        }
        if orch.credits.load(Ordering::SeqCst) <= 0 {
            if let Some(upstream) = orch.upstream.lock().clone() {
                upstream.disconnect();
            }
            return Err(CoreError::ExternalNoCredits);
        }
    }

    save_session_if_needed(orch, &raw);
    orch.checkpoint_handler.ingest(&raw, orch.ipc.as_ref());
    Ok(())
}

fn save_session_if_needed(orch: &Arc<Orchestrator>, raw: &str) {
    if !raw.contains("\"type\":\"session.updated\"") {
        return;
    }
    let was_skipped = {
        let mut mutable = orch.mutable.lock();
        if mutable.skip_session_save {
            mutable.skip_session_save = false;
            true
        } else {
            false
        }
    };
    if was_skipped {
        return;
    }
    orch.ipc.save_session(&orch.account_id, &orch.session_id, raw);
}

fn on_error(orch: &Arc<Orchestrator>, message: String) {
    warn!("upstream error for session {}: {message}", orch.session_id);
    orch.mutable.lock().skip_session_save = false;
}

/// Unexpected close — explicit disconnects have already nulled the upstream
/// handler, so reaching here always means reconnect.
fn on_close(orch: &Arc<Orchestrator>, code: u16, reason: String) {
    info!(
        "upstream closed unexpectedly for session {} (code {code}, {reason})",
        orch.session_id
    );
    {
        let mut mutable = orch.mutable.lock();
        mutable.state = OrchestratorState::Preconnect;
        mutable.skip_session_save = true;
    }
    let orch = orch.clone();
    tokio::spawn(async move {
        Orchestrator::connect(&orch).await;
    });
}

fn check_and_schedule_credits_check(orch: &Arc<Orchestrator>) {
    let response_count = orch.mutable.lock().response_count;
    if response_count < CREDIT_REFRESH_CADENCE {
        return;
    }
    if orch
        .credit_refresh_in_progress
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    let orch = orch.clone();
    tokio::spawn(async move {
        match orch.ipc.get_credits(&orch.account_id).await {
            Ok(credits) => orch.credits.store(credits, Ordering::SeqCst),
            Err(e) => warn!("credit refresh failed for session {}: {e}", orch.session_id),
        }
        orch.mutable.lock().response_count = 0;
        orch.credit_refresh_in_progress.store(false, Ordering::SeqCst);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct NullClientStream;
    impl ClientStream for NullClientStream {
        fn send(&self, _raw: &str) -> Result<(), CoreError> {
            Ok(())
        }
    }

    struct FailingClientStream;
    impl ClientStream for FailingClientStream {
        fn send(&self, _raw: &str) -> Result<(), CoreError> {
            Err(CoreError::InternalError)
        }
    }

    #[derive(Default)]
    struct FakeGatewayIpc {
        credits: AtomicI64,
        get_credits_calls: AtomicUsize,
        saved_sessions: StdMutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl GatewayIpc for FakeGatewayIpc {
        fn save_session(&self, _account_id: &str, _session_id: &str, session_data: &str) {
            self.saved_sessions.lock().unwrap().push(session_data.to_string());
        }

        async fn get_credits(&self, _account_id: &str) -> Result<i64, CoreError> {
            self.get_credits_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.credits.load(Ordering::SeqCst))
        }
    }

    fn orch_with(client: Arc<dyn ClientStream>, ipc: Arc<dyn GatewayIpc>, credits: i64) -> Arc<Orchestrator> {
        Orchestrator::construct(
            "acct1".into(),
            "sess1".into(),
            String::new(),
            credits,
            client,
            ipc,
            "ws://upstream.invalid".into(),
            "token".into(),
        )
    }

    #[test]
    fn buffer_overflow_fails_send_without_mutating_beyond_capacity() {
        let orch = orch_with(Arc::new(NullClientStream), Arc::new(FakeGatewayIpc::default()), 1000);
        for _ in 0..BUFFER_CAPACITY {
            Orchestrator::send(&orch, "m").unwrap();
        }
        assert_eq!(
            Orchestrator::send(&orch, "one too many"),
            Err(CoreError::ExternalBufferOverflow)
        );
    }

    #[test]
    fn send_while_preconnect_buffers_instead_of_forwarding() {
        let orch = orch_with(Arc::new(NullClientStream), Arc::new(FakeGatewayIpc::default()), 1000);
        assert!(Orchestrator::send(&orch, "hello").is_ok());
        assert_eq!(orch.mutable.lock().buffer.len(), 1);
    }

    #[test]
    fn send_rejects_with_no_credits_once_connected() {
        let orch = orch_with(Arc::new(NullClientStream), Arc::new(FakeGatewayIpc::default()), 0);
        orch.mutable.lock().state = OrchestratorState::Connected;
        assert_eq!(Orchestrator::send(&orch, "hi"), Err(CoreError::ExternalNoCredits));
    }

    #[test]
    fn skip_session_save_is_derived_from_nonempty_preloaded_session_data() {
        let orch = Orchestrator::construct(
            "acct1".into(),
            "sess1".into(),
            "preloaded".into(),
            1000,
            Arc::new(NullClientStream),
            Arc::new(FakeGatewayIpc::default()),
            "ws://upstream.invalid".into(),
            "token".into(),
        );
        assert!(orch.mutable.lock().skip_session_save);

        let orch_empty = orch_with(Arc::new(NullClientStream), Arc::new(FakeGatewayIpc::default()), 1000);
        assert!(!orch_empty.mutable.lock().skip_session_save);
    }

    #[test]
    fn on_msg_received_cleans_up_when_client_send_fails() {
        let orch = orch_with(Arc::new(FailingClientStream), Arc::new(FakeGatewayIpc::default()), 1000);
        orch.mutable.lock().state = OrchestratorState::Connected;
        orch.mutable.lock().buffer.push_back("leftover".to_string());
        let result = on_msg_received(
            &orch,
            r#"{"type":"response.done","input_tokens":1,"output_tokens":1}"#.to_string(),
        );
        assert!(result.is_ok());
        assert!(orch.mutable.lock().buffer.is_empty());
    }

    #[test]
    fn on_msg_received_errors_with_no_credits_once_depleted() {
        let orch = orch_with(Arc::new(NullClientStream), Arc::new(FakeGatewayIpc::default()), 40);
        orch.mutable.lock().state = OrchestratorState::Connected;
        let result = on_msg_received(
            &orch,
            r#"{"type":"response.done","input_tokens":20,"output_tokens":30}"#.to_string(),
        );
        assert_eq!(result, Err(CoreError::ExternalNoCredits));
        assert_eq!(orch.credits.load(Ordering::SeqCst), -10);
    }

    #[test]
    fn save_session_if_needed_skips_exactly_once_after_preload() {
        let ipc = Arc::new(FakeGatewayIpc::default());
        let orch = Orchestrator::construct(
            "acct1".into(),
            "sess1".into(),
            "preloaded".into(),
            1000,
            Arc::new(NullClientStream),
            ipc.clone(),
            "ws://upstream.invalid".into(),
            "token".into(),
        );
        save_session_if_needed(&orch, r#"{"type":"session.updated"}"#);
        assert!(ipc.saved_sessions.lock().unwrap().is_empty());

        save_session_if_needed(&orch, r#"{"type":"session.updated"}"#);
        assert_eq!(ipc.saved_sessions.lock().unwrap().len(), 1);
    }
}
