//! Typed facade over [`rsvoice_protocol::Transport`] for the five IPC
//! message types (§4.1, §4.2), used by the Orchestrator and its handlers.

use rsvoice_protocol::{CoreError, MessageType, Transport};

/// The IPC surface consumed by the Orchestrator and its per-session
/// handlers, factored out as a trait so session logic can be exercised
/// against a recording fake instead of a live socket in tests.
#[async_trait::async_trait]
pub trait GatewayIpc: Send + Sync {
    fn update_usage(
        &self,
        _account_id: &str,
        _session_id: &str,
        _provider: &str,
        _input_tokens: i64,
        _output_tokens: i64,
    ) {
    }
    fn save_session(&self, _account_id: &str, _session_id: &str, _session_data: &str) {}
    fn append_conversation(&self, _account_id: &str, _session_id: &str, _conversation_data: &str) {}
    async fn get_credits(&self, _account_id: &str) -> Result<i64, CoreError> {
        Ok(0)
    }
}

#[derive(Clone)]
pub struct IpcClient {
    transport: Transport,
}

pub struct ValidateAndLoadResponse {
    pub error: String,
    pub account_id: String,
    pub session_data: String,
    pub credits: i64,
}

impl IpcClient {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    pub async fn validate_and_load(
        &self,
        api_key: &str,
        session_id: &str,
    ) -> Result<ValidateAndLoadResponse, CoreError> {
        let response = self
            .transport
            .request(MessageType::ValidateAndLoad, &[api_key, session_id])
            .await?;
        if !response.is_success() {
            return Ok(ValidateAndLoadResponse {
                error: response.error,
                account_id: String::new(),
                session_data: String::new(),
                credits: 0,
            });
        }
        let [account_id, session_data, credits] = three(&response.fields)?;
        Ok(ValidateAndLoadResponse {
            error: String::new(),
            account_id,
            session_data,
            credits: credits.parse().unwrap_or(0),
        })
    }
}

#[async_trait::async_trait]
impl GatewayIpc for IpcClient {
    fn update_usage(
        &self,
        account_id: &str,
        session_id: &str,
        provider: &str,
        input_tokens: i64,
        output_tokens: i64,
    ) {
        let input = input_tokens.to_string();
        let output = output_tokens.to_string();
        self.transport.fire_and_forget(
            MessageType::UpdateUsage,
            &[account_id, session_id, provider, &input, &output],
        );
    }

    fn save_session(&self, account_id: &str, session_id: &str, session_data: &str) {
        self.transport
            .fire_and_forget(MessageType::SaveSession, &[account_id, session_id, session_data]);
    }

    fn append_conversation(&self, account_id: &str, session_id: &str, conversation_data: &str) {
        self.transport.fire_and_forget(
            MessageType::AppendConversation,
            &[account_id, session_id, conversation_data],
        );
    }

    async fn get_credits(&self, account_id: &str) -> Result<i64, CoreError> {
        let response = self.transport.request(MessageType::GetCredits, &[account_id]).await?;
        if !response.is_success() {
            return Err(CoreError::from_wire_code(&response.error));
        }
        let credits = response
            .fields
            .first()
            .and_then(|f| f.parse().ok())
            .unwrap_or(0);
        Ok(credits)
    }
}

fn three(fields: &[String]) -> Result<[String; 3], CoreError> {
    if fields.len() < 3 {
        return Err(CoreError::InternalZmqInvalidResponse);
    }
    Ok([fields[0].clone(), fields[1].clone(), fields[2].clone()])
}
