//! Frame encoding/decoding for the `|`-delimited wire protocol (§4.1).
//!
//! A request frame is `<correlation-id>|<type>|<arg1>|<arg2>|…`. A response
//! frame is `<correlation-id>|<error-string>|<field1>|<field2>|…`, where an
//! empty error string signals success. The final field is the sole place an
//! opaque blob (session data, conversation text) may itself contain the `|`
//! delimiter; decoding therefore always splits with a bound equal to the
//! known field count, so the last piece absorbs any embedded delimiters.

use crate::error::CoreError;
use crate::schema::MessageType;

const DELIMITER: char = '|';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    pub correlation_id: String,
    pub message_type: MessageType,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedResponse {
    pub correlation_id: String,
    /// Empty string means success.
    pub error: String,
    pub fields: Vec<String>,
}

impl DecodedResponse {
    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}

/// Encode a request frame. `args` must already be in schema order; the
/// caller is responsible for not embedding the delimiter in any field but
/// the last.
pub fn encode_request(correlation_id: &str, message_type: MessageType, args: &[&str]) -> String {
    let mut out = String::with_capacity(64 + args.iter().map(|a| a.len() + 1).sum::<usize>());
    out.push_str(correlation_id);
    out.push(DELIMITER);
    out.push_str(message_type.as_wire());
    for arg in args {
        out.push(DELIMITER);
        out.push_str(arg);
    }
    out
}

/// Encode a response frame. An empty `error` signals success.
pub fn encode_response(correlation_id: &str, error: &str, fields: &[&str]) -> String {
    let mut out = String::with_capacity(64 + fields.iter().map(|f| f.len() + 1).sum::<usize>());
    out.push_str(correlation_id);
    out.push(DELIMITER);
    out.push_str(error);
    for field in fields {
        out.push(DELIMITER);
        out.push_str(field);
    }
    out
}

/// Decode a request frame, validating the argument count against the
/// schema. Frames with fewer fields than the schema demands are rejected;
/// extra trailing delimiters inside the final (opaque) argument are
/// tolerated by construction, since the split bound equals the schema's
/// field count.
pub fn decode_request(frame: &str) -> Result<DecodedRequest, CoreError> {
    // One pass to learn the type before we know how many args to expect.
    let mut head_split = frame.splitn(3, DELIMITER);
    let correlation_id = head_split.next().ok_or(CoreError::InternalZmqDecodeFailed)?;
    let type_str = head_split.next().ok_or(CoreError::InternalZmqDecodeFailed)?;
    let message_type = MessageType::from_wire(type_str).ok_or(CoreError::InternalZmqDecodeFailed)?;

    let expected_args = message_type.request_args().len();
    let max_parts = 2 + expected_args;
    let parts: Vec<&str> = frame.splitn(max_parts, DELIMITER).collect();
    if parts.len() < max_parts {
        return Err(CoreError::InternalZmqDecodeFailed);
    }

    let args = parts[2..].iter().map(|s| s.to_string()).collect();
    Ok(DecodedRequest {
        correlation_id: correlation_id.to_string(),
        message_type,
        args,
    })
}

/// Decode a response frame for a request of the given expected type, since
/// the response field count is only known from the request that provoked
/// it — the frame itself carries no type tag (§4.1).
pub fn decode_response(
    frame: &str,
    expected_type: MessageType,
) -> Result<DecodedResponse, CoreError> {
    let mut head_split = frame.splitn(2, DELIMITER);
    let correlation_id = head_split.next().ok_or(CoreError::InternalZmqDecodeFailed)?;
    let rest = head_split.next().ok_or(CoreError::InternalZmqDecodeFailed)?;

    let mut error_split = rest.splitn(2, DELIMITER);
    let error = error_split.next().unwrap_or("");
    let tail = error_split.next().unwrap_or("");

    // An error response carries no field list regardless of the expected
    // type's schema; only a success response must match field count.
    if !error.is_empty() {
        return Ok(DecodedResponse {
            correlation_id: correlation_id.to_string(),
            error: error.to_string(),
            fields: Vec::new(),
        });
    }

    let expected_fields = expected_type.response_fields().len();
    if expected_fields == 0 {
        return Ok(DecodedResponse {
            correlation_id: correlation_id.to_string(),
            error: String::new(),
            fields: Vec::new(),
        });
    }

    let parts: Vec<&str> = tail.splitn(expected_fields, DELIMITER).collect();
    if parts.len() < expected_fields {
        return Err(CoreError::InternalZmqInvalidResponse);
    }

    Ok(DecodedResponse {
        correlation_id: correlation_id.to_string(),
        error: String::new(),
        fields: parts.into_iter().map(|s| s.to_string()).collect(),
    })
}

/// Peek the correlation id off any frame without knowing its type, for the
/// reader task to demultiplex before it knows which pending request the
/// frame answers.
pub fn peek_correlation_id(frame: &str) -> Option<&str> {
    frame.split(DELIMITER).next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_and_decodes_validate_and_load_request() {
        let frame = encode_request("c1", MessageType::ValidateAndLoad, &["rslive_v1_abc", "S1"]);
        assert_eq!(frame, "c1|VALIDATE_AND_LOAD|rslive_v1_abc|S1");
        let decoded = decode_request(&frame).unwrap();
        assert_eq!(decoded.correlation_id, "c1");
        assert_eq!(decoded.message_type, MessageType::ValidateAndLoad);
        assert_eq!(decoded.args, vec!["rslive_v1_abc", "S1"]);
    }

    #[test]
    fn opaque_final_field_keeps_embedded_delimiters() {
        let frame = encode_request(
            "c2",
            MessageType::SaveSession,
            &["acct1", "S1", "a|b|c|d"],
        );
        let decoded = decode_request(&frame).unwrap();
        assert_eq!(decoded.args[2], "a|b|c|d");
    }

    #[test]
    fn rejects_request_with_too_few_fields() {
        let err = decode_request("c3|UPDATE_USAGE|acct1|S1").unwrap_err();
        assert_eq!(err, CoreError::InternalZmqDecodeFailed);
    }

    #[test]
    fn decodes_success_response_with_opaque_session_data() {
        let frame = encode_response("c1", "", &["acct1", "session|with|pipes", "1000"]);
        let decoded = decode_response(&frame, MessageType::ValidateAndLoad).unwrap();
        assert!(decoded.is_success());
        assert_eq!(decoded.fields, vec!["acct1", "session|with|pipes", "1000"]);
    }

    #[test]
    fn decodes_error_response_without_fields() {
        let frame = encode_response("c1", "INVALID_AUTH", &[]);
        let decoded = decode_response(&frame, MessageType::ValidateAndLoad).unwrap();
        assert!(!decoded.is_success());
        assert_eq!(decoded.error, "INVALID_AUTH");
    }

    #[test]
    fn peeks_correlation_id_without_full_decode() {
        assert_eq!(peek_correlation_id("c9|GET_CREDITS|acct1"), Some("c9"));
    }
}
