//! Central schema for the five IPC message types (§4.1).

/// Which lane a message type travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Correlated request/response; caller awaits a reply frame.
    Request,
    /// Fire-and-forget; no reply frame is ever produced.
    OneWay,
}

/// The argument/field kind, used only for documentation and validation of
/// the numeric fields — the wire itself carries everything as strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ValidateAndLoad,
    GetCredits,
    UpdateUsage,
    SaveSession,
    AppendConversation,
}

impl MessageType {
    pub fn as_wire(&self) -> &'static str {
        match self {
            MessageType::ValidateAndLoad => "VALIDATE_AND_LOAD",
            MessageType::GetCredits => "GET_CREDITS",
            MessageType::UpdateUsage => "UPDATE_USAGE",
            MessageType::SaveSession => "SAVE_SESSION",
            MessageType::AppendConversation => "APPEND_CONVERSATION",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "VALIDATE_AND_LOAD" => Some(MessageType::ValidateAndLoad),
            "GET_CREDITS" => Some(MessageType::GetCredits),
            "UPDATE_USAGE" => Some(MessageType::UpdateUsage),
            "SAVE_SESSION" => Some(MessageType::SaveSession),
            "APPEND_CONVERSATION" => Some(MessageType::AppendConversation),
            _ => None,
        }
    }

    pub fn lane(&self) -> Lane {
        match self {
            MessageType::ValidateAndLoad | MessageType::GetCredits => Lane::Request,
            MessageType::UpdateUsage | MessageType::SaveSession | MessageType::AppendConversation => {
                Lane::OneWay
            }
        }
    }

    /// Ordered (name, kind) pairs for the request's argument list.
    pub fn request_args(&self) -> &'static [(&'static str, FieldKind)] {
        match self {
            MessageType::ValidateAndLoad => {
                &[("apiKey", FieldKind::String), ("sessionId", FieldKind::String)]
            }
            MessageType::GetCredits => &[("accountId", FieldKind::String)],
            MessageType::UpdateUsage => &[
                ("accountId", FieldKind::String),
                ("sessionId", FieldKind::String),
                ("provider", FieldKind::String),
                ("inputTokens", FieldKind::Number),
                ("outputTokens", FieldKind::Number),
            ],
            MessageType::SaveSession => &[
                ("accountId", FieldKind::String),
                ("sessionId", FieldKind::String),
                ("sessionData", FieldKind::String),
            ],
            MessageType::AppendConversation => &[
                ("accountId", FieldKind::String),
                ("sessionId", FieldKind::String),
                ("conversationData", FieldKind::String),
            ],
        }
    }

    /// Ordered (name, kind) pairs for the response field list. Empty for
    /// one-way types, which never produce a reply frame.
    pub fn response_fields(&self) -> &'static [(&'static str, FieldKind)] {
        match self {
            MessageType::ValidateAndLoad => &[
                ("accountId", FieldKind::String),
                ("sessionData", FieldKind::String),
                ("credits", FieldKind::Number),
            ],
            MessageType::GetCredits => &[("credits", FieldKind::Number)],
            MessageType::UpdateUsage
            | MessageType::SaveSession
            | MessageType::AppendConversation => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trips_for_all_types() {
        for ty in [
            MessageType::ValidateAndLoad,
            MessageType::GetCredits,
            MessageType::UpdateUsage,
            MessageType::SaveSession,
            MessageType::AppendConversation,
        ] {
            assert_eq!(MessageType::from_wire(ty.as_wire()), Some(ty));
        }
    }

    #[test]
    fn request_response_types_have_response_fields() {
        assert_eq!(MessageType::ValidateAndLoad.lane(), Lane::Request);
        assert!(!MessageType::ValidateAndLoad.response_fields().is_empty());
        assert_eq!(MessageType::UpdateUsage.lane(), Lane::OneWay);
        assert!(MessageType::UpdateUsage.response_fields().is_empty());
    }
}
