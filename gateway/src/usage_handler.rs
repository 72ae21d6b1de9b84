//! Usage handler (§4.8): substring-scan extraction of token counts from raw
//! upstream frames, batched to avoid one IPC round-trip per completion
//! event.
//!
//! Substring search only, never a general JSON parse — the hot path is
//! measured roughly an order of magnitude faster this way (§9).

use parking_lot::Mutex;

use crate::ipc_client::GatewayIpc;

const RESPONSE_DONE_MARKER: &str = "\"type\":\"response.done\"";
const INPUT_TOKENS_MARKER: &str = "\"input_tokens\":";
const OUTPUT_TOKENS_MARKER: &str = "\"output_tokens\":";

pub const DEFAULT_FLUSH_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenCounts {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

struct State {
    input_acc: i64,
    output_acc: i64,
    batch_count: u32,
}

pub struct UsageHandler {
    account_id: String,
    session_id: String,
    flush_threshold: u32,
    state: Mutex<State>,
}

impl UsageHandler {
    pub fn new(account_id: String, session_id: String) -> Self {
        Self::with_threshold(account_id, session_id, DEFAULT_FLUSH_THRESHOLD)
    }

    pub fn with_threshold(account_id: String, session_id: String, flush_threshold: u32) -> Self {
        Self {
            account_id,
            session_id,
            flush_threshold,
            state: Mutex::new(State {
                input_acc: 0,
                output_acc: 0,
                batch_count: 0,
            }),
        }
    }

    /// Scan `raw` for a completion event; accumulate and flush on threshold.
    /// Returns the extracted pair when present, purely for the caller's
    /// credit bookkeeping — it does not indicate whether a flush happened.
    pub fn ingest(&self, raw: &str, ipc: &dyn GatewayIpc) -> Option<TokenCounts> {
        if !raw.contains(RESPONSE_DONE_MARKER) {
            return None;
        }

        let input_tokens = extract_digits_after(raw, INPUT_TOKENS_MARKER)?;
        let output_tokens = extract_digits_after(raw, OUTPUT_TOKENS_MARKER)?;

        let should_flush = {
            let mut state = self.state.lock();
            state.input_acc += input_tokens;
            state.output_acc += output_tokens;
            state.batch_count += 1;
            state.batch_count >= self.flush_threshold
        };
        if should_flush {
            self.flush(ipc);
        }

        Some(TokenCounts {
            input_tokens,
            output_tokens,
        })
    }

    pub fn flush(&self, ipc: &dyn GatewayIpc) {
        let (input_acc, output_acc) = {
            let mut state = self.state.lock();
            if state.batch_count == 0 {
                return;
            }
            let totals = (state.input_acc, state.output_acc);
            state.input_acc = 0;
            state.output_acc = 0;
            state.batch_count = 0;
            totals
        };
        ipc.update_usage(&self.account_id, &self.session_id, "OPENAI", input_acc, output_acc);
    }
}

fn extract_digits_after(haystack: &str, marker: &str) -> Option<i64> {
    let start = haystack.find(marker)? + marker.len();
    let tail = &haystack[start..];
    let digit_len = tail.bytes().take_while(|b| b.is_ascii_digit()).count();
    if digit_len == 0 {
        return None;
    }
    tail[..digit_len].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        calls: AtomicUsize,
        last: Mutex<Option<(i64, i64)>>,
    }

    impl GatewayIpc for RecordingSink {
        fn update_usage(&self, _account_id: &str, _session_id: &str, _provider: &str, input_tokens: i64, output_tokens: i64) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some((input_tokens, output_tokens));
        }
    }

    fn completion_frame(input: i64, output: i64) -> String {
        format!(r#"{{"type":"response.done","input_tokens":{input},"output_tokens":{output}}}"#)
    }

    #[test]
    fn extracts_contiguous_digit_run() {
        let frame = r#"{"type":"response.done","input_tokens":10,"output_tokens":20}"#;
        assert_eq!(extract_digits_after(frame, INPUT_TOKENS_MARKER), Some(10));
        assert_eq!(extract_digits_after(frame, OUTPUT_TOKENS_MARKER), Some(20));
    }

    #[test]
    fn ignores_frames_without_response_done() {
        assert_eq!(extract_digits_after("no marker here", INPUT_TOKENS_MARKER), None);
    }

    #[test]
    fn flushes_exactly_once_per_five_completions() {
        let handler = UsageHandler::new("acct1".into(), "S1".into());
        let sink = RecordingSink::default();

        for _ in 0..4 {
            handler.ingest(&completion_frame(10, 20), &sink);
        }
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);

        handler.ingest(&completion_frame(10, 20), &sink);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*sink.last.lock(), Some((50, 100)));
    }

    #[test]
    fn flush_after_partial_batch_sends_remaining_total() {
        let handler = UsageHandler::new("acct1".into(), "S1".into());
        let sink = RecordingSink::default();

        handler.ingest(&completion_frame(20, 30), &sink);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);

        handler.flush(&sink);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*sink.last.lock(), Some((20, 30)));

        handler.flush(&sink);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1, "flush on an empty batch is a no-op");
    }
}
