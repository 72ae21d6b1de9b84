//! Business service (§4.7): validate+load+inject conversation context,
//! summarize when oversize, and transform upstream session events for
//! persistence.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::{error, warn};

use crate::db::sessions::{KIND_CONV, KIND_SESSION};
use crate::db::Db;
use rsvoice_protocol::error::BusinessError;

pub const THRESHOLD_CHARS: usize = 32_000;
pub const SUMMARY_TARGET_CHARS: usize = 24_000;
const OMITTED_PREFIX: &str = "[...earlier context omitted...]\n";
const CONTINUATION_PREFIX: &str =
    "\n\nHere is the previous conversation that happened which should be continued now:\n";

pub struct ValidateAndLoadResult {
    pub error: Option<BusinessError>,
    pub account_id: String,
    pub session_data: String,
    pub credits: i64,
}

/// Pluggable summarizer; the default does nothing interesting but keeps the
/// call site and error-handling shape real. A live deployment wires this to
/// an LLM client built from `OPENAI_API_KEY` / `GEMINI_API_KEY`.
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, conversation: &str, target_chars: usize) -> Result<String, String>;
}

pub struct NullSummarizer;

#[async_trait::async_trait]
impl Summarizer for NullSummarizer {
    async fn summarize(&self, conversation: &str, target_chars: usize) -> Result<String, String> {
        Err(format!(
            "no summarizer configured ({} chars would target {})",
            conversation.len(),
            target_chars
        ))
    }
}

pub struct BusinessService {
    pub db: Db,
    pub summarizer: std::sync::Arc<dyn Summarizer>,
}

impl BusinessService {
    pub fn new(db: Db, summarizer: std::sync::Arc<dyn Summarizer>) -> Self {
        Self { db, summarizer }
    }

    pub async fn validate_and_load(&self, api_key: &str, session_id: &str) -> ValidateAndLoadResult {
        let key_hash = crate::db::accounts::hash_key_pub(api_key);

        let load = match self.db.load_session_by_key_and_id(key_hash, session_id.to_string()).await {
            Ok(load) => load,
            Err(e) => {
                error!("validate_and_load query failed: {e}");
                return ValidateAndLoadResult {
                    error: Some(BusinessError::Internal),
                    account_id: String::new(),
                    session_data: String::new(),
                    credits: 0,
                };
            }
        };

        let Some(load) = load else {
            return ValidateAndLoadResult {
                error: Some(BusinessError::InvalidAuth),
                account_id: String::new(),
                session_data: String::new(),
                credits: 0,
            };
        };

        let credits = load.token_remaining + load.topup_remaining;
        if credits <= 0 {
            return ValidateAndLoadResult {
                error: Some(BusinessError::NoCredits),
                account_id: load.account_id,
                session_data: String::new(),
                credits,
            };
        }

        let session_blob = load
            .rows
            .iter()
            .find(|r| r.kind == KIND_SESSION)
            .map(|r| r.data.clone());
        let mut conv_blob = load
            .rows
            .iter()
            .find(|r| r.kind == KIND_CONV)
            .map(|r| r.data.clone());

        if session_blob.is_none() && conv_blob.is_none() {
            return ValidateAndLoadResult {
                error: None,
                account_id: load.account_id,
                session_data: String::new(),
                credits,
            };
        }

        if let Some(conv) = &conv_blob {
            if conv.chars().count() > THRESHOLD_CHARS {
                self.schedule_summarization(load.account_id.clone(), session_id.to_string(), conv.clone());
                conv_blob = Some(truncate_conversation(conv));
            }
        }

        let session_data = match (&session_blob, &conv_blob) {
            (Some(session), Some(conv)) => inject_conversation(session, conv),
            (None, Some(conv)) => synth_session_from_conversation(conv),
            (Some(session), None) => session.clone(),
            (None, None) => unreachable!("handled above"),
        };

        ValidateAndLoadResult {
            error: None,
            account_id: load.account_id,
            session_data,
            credits,
        }
    }

    /// Fire-and-forget: log only, never propagate.
    pub async fn update_usage(
        &self,
        account_id: String,
        session_id: String,
        provider: String,
        input_tokens: i64,
        output_tokens: i64,
    ) {
        if let Err(e) = self
            .db
            .insert_usage(account_id, session_id, provider, input_tokens, output_tokens)
            .await
        {
            warn!("updateUsage failed (swallowed): {e}");
        }
    }

    /// Fire-and-forget: parse the raw event, clean it, and upsert.
    pub async fn save_session(&self, account_id: String, session_id: String, raw_event: String) {
        let parsed: Value = match serde_json::from_str(&raw_event) {
            Ok(v) => v,
            Err(e) => {
                warn!("saveSession: event was not valid JSON (swallowed): {e}");
                return;
            }
        };

        let to_persist = if parsed.get("type").and_then(Value::as_str) == Some("session.updated") {
            match parsed.get("session") {
                Some(session) => {
                    let mut cleaned = session.clone();
                    strip_server_only_fields(&mut cleaned);
                    remove_nulls(&mut cleaned);
                    serde_json::json!({ "type": "session.update", "session": cleaned }).to_string()
                }
                None => raw_event,
            }
        } else {
            raw_event
        };

        if let Err(e) = self.db.upsert_session(account_id, session_id, to_persist).await {
            warn!("saveSession upsert failed (swallowed): {e}");
        }
    }

    /// Fire-and-forget UPSERT-with-concat.
    pub async fn append_conversation(&self, account_id: String, session_id: String, blob: String) {
        if let Err(e) = self.db.append_conversation(account_id, session_id, blob).await {
            warn!("appendConversation failed (swallowed): {e}");
        }
    }

    fn schedule_summarization(&self, account_id: String, session_id: String, conversation: String) {
        let db = self.db.clone();
        let summarizer = self.summarizer.clone();
        tokio::spawn(async move {
            match summarizer.summarize(&conversation, SUMMARY_TARGET_CHARS).await {
                Ok(summary) => {
                    if let Err(e) = db.overwrite_conversation(account_id, session_id, summary).await {
                        warn!("summarization overwrite failed (swallowed): {e}");
                    }
                }
                Err(e) => warn!("summarization failed, best-effort (swallowed): {e}"),
            }
        });
    }
}

/// Keep the last `THRESHOLD_CHARS` characters, drop any partial leading
/// line, and prepend the omission marker.
fn truncate_conversation(conv: &str) -> String {
    let char_count = conv.chars().count();
    if char_count <= THRESHOLD_CHARS {
        return conv.to_string();
    }
    let skip = char_count - THRESHOLD_CHARS;
    let mut tail: String = conv.chars().skip(skip).collect();
    if let Some(newline_pos) = tail.find('\n') {
        tail = tail[newline_pos + 1..].to_string();
    }
    format!("{OMITTED_PREFIX}{tail}")
}

fn instructions_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""instructions"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("valid regex")
    })
}

/// Append the conversation into the session JSON's `instructions` string
/// field via a bounded regex splice, with JSON-string escaping of the
/// appended text. Falls back to synthesizing a minimal envelope if no
/// `instructions` field is present.
fn inject_conversation(session_json: &str, conv: &str) -> String {
    let escaped = format!("{CONTINUATION_PREFIX}{conv}");
    let escaped = json_escape(&escaped);

    let re = instructions_regex();
    if let Some(m) = re.find(session_json) {
        let capture = re.captures(session_json).expect("find implies captures");
        let existing = capture.get(1).map(|g| g.as_str()).unwrap_or("");
        let replacement = format!("\"instructions\":\"{existing}{escaped}\"");
        let mut out = String::with_capacity(session_json.len() + escaped.len());
        out.push_str(&session_json[..m.start()]);
        out.push_str(&replacement);
        out.push_str(&session_json[m.end()..]);
        out
    } else {
        synth_session_from_conversation(conv)
    }
}

fn synth_session_from_conversation(conv: &str) -> String {
    let escaped = json_escape(&format!("{CONTINUATION_PREFIX}{conv}").trim_start_matches("\n\n"));
    format!(r#"{{"type":"session.update","session":{{"type":"realtime","instructions":"{escaped}"}}}}"#)
}

fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

fn strip_server_only_fields(value: &mut Value) {
    if let Value::Object(map) = value {
        map.remove("object");
        map.remove("id");
        map.remove("expires_at");
    }
}

fn remove_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            for v in map.values_mut() {
                remove_nulls(v);
            }
        }
        Value::Array(items) => {
            for item in items {
                remove_nulls(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_conversation_into_instructions_with_escaping() {
        let session = r#"{"type":"session.update","session":{"type":"realtime","instructions":"Be helpful"}}"#;
        let injected = inject_conversation(session, "user:hi\nagent:hello");
        assert!(injected.contains(r#""instructions":"Be helpful\n\nHere is the previous conversation that happened which should be continued now:\nuser:hi\nagent:hello""#));
    }

    #[test]
    fn truncate_keeps_last_threshold_chars_and_drops_partial_line() {
        let mut conv = String::new();
        for i in 0..5000 {
            conv.push_str(&format!("line-{i}\n"));
        }
        let truncated = truncate_conversation(&conv);
        assert!(truncated.starts_with(OMITTED_PREFIX));
        assert!(!truncated[OMITTED_PREFIX.len()..].starts_with("line-"));
    }

    #[test]
    fn short_conversation_is_not_truncated() {
        let conv = "user:hi\n";
        assert_eq!(truncate_conversation(conv), conv);
    }

    /// A multi-byte transcript whose byte length exceeds `THRESHOLD_CHARS`
    /// but whose char count does not must not be treated as oversize —
    /// the oversize gate and `truncate_conversation` both key off
    /// `chars().count()`, never `str::len()`.
    #[test]
    fn multibyte_conversation_under_char_threshold_is_not_oversize_by_byte_length() {
        let conv: String = std::iter::repeat('世').take(THRESHOLD_CHARS - 1).collect();
        assert!(conv.len() > THRESHOLD_CHARS, "each char is multi-byte in UTF-8");
        assert!(conv.chars().count() <= THRESHOLD_CHARS);
        assert_eq!(truncate_conversation(&conv), conv);
    }

    #[test]
    fn remove_nulls_strips_nested_null_fields() {
        let mut v = serde_json::json!({"a": 1, "b": null, "c": {"d": null, "e": 2}});
        remove_nulls(&mut v);
        assert_eq!(v, serde_json::json!({"a": 1, "c": {"e": 2}}));
    }
}
