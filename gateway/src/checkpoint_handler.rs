//! Checkpoint handler (§4.9): substring-scan extraction of speaker-tagged
//! transcript deltas, flushed once the accumulated length crosses a
//! threshold.
//!
//! `flush()` resets fragments, counter, and speaker *before* sending — a
//! re-entrant flush during the async append must start from empty state
//! (§8 "checkpoint reset-before-send").

use parking_lot::Mutex;

use crate::ipc_client::GatewayIpc;

const USER_DELTA_MARKER: &str = "\"type\":\"conversation.item.input_audio_transcription.delta\"";
const AGENT_DELTA_MARKER: &str = "\"type\":\"response.output_audio_transcript.delta\"";
const DELTA_FIELD_MARKER: &str = "\"delta\":\"";

pub const DEFAULT_LENGTH_THRESHOLD: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Speaker {
    None,
    User,
    Agent,
}

impl Speaker {
    fn label(&self) -> &'static str {
        match self {
            Speaker::None => "",
            Speaker::User => "user",
            Speaker::Agent => "agent",
        }
    }
}

struct State {
    fragments: Vec<String>,
    length: usize,
    speaker: Speaker,
}

pub struct CheckpointHandler {
    account_id: String,
    session_id: String,
    length_threshold: usize,
    state: Mutex<State>,
}

impl CheckpointHandler {
    pub fn new(account_id: String, session_id: String) -> Self {
        Self::with_threshold(account_id, session_id, DEFAULT_LENGTH_THRESHOLD)
    }

    pub fn with_threshold(account_id: String, session_id: String, length_threshold: usize) -> Self {
        Self {
            account_id,
            session_id,
            length_threshold,
            state: Mutex::new(State {
                fragments: Vec::new(),
                length: 0,
                speaker: Speaker::None,
            }),
        }
    }

    pub fn ingest(&self, raw: &str, ipc: &dyn GatewayIpc) {
        let speaker = if raw.contains(USER_DELTA_MARKER) {
            Speaker::User
        } else if raw.contains(AGENT_DELTA_MARKER) {
            Speaker::Agent
        } else {
            return;
        };

        let Some(delta) = extract_delta(raw) else {
            return;
        };

        let should_flush = {
            let mut state = self.state.lock();
            let is_first_fragment = state.fragments.is_empty();
            if state.speaker != speaker {
                if is_first_fragment {
                    state.fragments.push(format!("{}:{}", speaker.label(), delta));
                } else {
                    state.fragments.push(format!("\n{}:{}", speaker.label(), delta));
                }
                state.speaker = speaker;
            } else {
                state.fragments.push(delta.clone());
            }
            state.length += delta.len();
            state.length >= self.length_threshold
        };

        if should_flush {
            self.flush(ipc);
        }
    }

    pub fn flush(&self, ipc: &dyn GatewayIpc) {
        let snapshot = {
            let mut state = self.state.lock();
            if state.fragments.is_empty() {
                return;
            }
            let snapshot = state.fragments.concat();
            state.fragments.clear();
            state.length = 0;
            state.speaker = Speaker::None;
            snapshot
        };
        ipc.append_conversation(&self.account_id, &self.session_id, &snapshot);
    }
}

fn extract_delta(raw: &str) -> Option<String> {
    let start = raw.find(DELTA_FIELD_MARKER)? + DELTA_FIELD_MARKER.len();
    let tail = &raw[start..];
    let mut out = String::new();
    let mut chars = tail.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let escaped = chars.next()?;
                match escaped {
                    'n' => out.push('\n'),
                    'r' => out.push('\r'),
                    't' => out.push('\t'),
                    '"' => out.push('"'),
                    '\\' => out.push('\\'),
                    other => out.push(other),
                }
            }
            '"' => return Some(out),
            c => out.push(c),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        calls: AtomicUsize,
        last: Mutex<String>,
    }

    impl GatewayIpc for RecordingSink {
        fn append_conversation(&self, _account_id: &str, _session_id: &str, conversation_data: &str) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = conversation_data.to_string();
        }
    }

    fn user_delta(text: &str) -> String {
        format!(
            r#"{{"type":"conversation.item.input_audio_transcription.delta","delta":"{text}"}}"#
        )
    }

    fn agent_delta(text: &str) -> String {
        format!(r#"{{"type":"response.output_audio_transcript.delta","delta":"{text}"}}"#)
    }

    #[test]
    fn first_fragment_has_no_leading_newline() {
        let handler = CheckpointHandler::new("acct1".into(), "S1".into());
        let sink = RecordingSink::default();
        handler.ingest(&user_delta("hi"), &sink);
        handler.flush(&sink);
        assert_eq!(*sink.last.lock(), "user:hi");
    }

    #[test]
    fn speaker_change_inserts_tagged_newline() {
        let handler = CheckpointHandler::new("acct1".into(), "S1".into());
        let sink = RecordingSink::default();
        handler.ingest(&user_delta("hi"), &sink);
        handler.ingest(&agent_delta("hello"), &sink);
        handler.flush(&sink);
        assert_eq!(*sink.last.lock(), "user:hi\nagent:hello");
    }

    #[test]
    fn flushes_when_length_threshold_is_crossed() {
        let handler = CheckpointHandler::with_threshold("acct1".into(), "S1".into(), 5);
        let sink = RecordingSink::default();
        handler.ingest(&user_delta("hello world"), &sink);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn flush_resets_state_before_returning() {
        let handler = CheckpointHandler::new("acct1".into(), "S1".into());
        let sink = RecordingSink::default();
        handler.ingest(&user_delta("hi"), &sink);
        handler.flush(&sink);
        let state = handler.state.lock();
        assert!(state.fragments.is_empty());
        assert_eq!(state.length, 0);
        assert_eq!(state.speaker, Speaker::None);
    }
}
