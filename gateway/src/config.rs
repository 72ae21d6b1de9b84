use std::env;
use std::time::Duration;

use rsvoice_protocol::CoreError;

const DEFAULT_UPSTREAM_WS_URL: &str = "wss://api.openai.com/v1/realtime";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Process-wide, read-mostly configuration loaded once from the environment
/// at startup (§5, §9).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub socket_path: String,
    pub request_timeout: Duration,
    pub high_water_mark: usize,
    pub openai_api_key: String,
    pub upstream_ws_url: String,
    pub bind_addr: String,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        let timeout_ms: u64 = env::var("ZMQ_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(rsvoice_protocol::DEFAULT_TIMEOUT_MS);

        Ok(Self {
            socket_path: required("ZMQ_SOCKET_PATH")?,
            request_timeout: Duration::from_millis(timeout_ms),
            high_water_mark: rsvoice_protocol::DEFAULT_HIGH_WATER_MARK,
            openai_api_key: required("OPENAI_API_KEY")?,
            upstream_ws_url: env::var("UPSTREAM_WS_URL").unwrap_or_else(|_| DEFAULT_UPSTREAM_WS_URL.to_string()),
            bind_addr: env::var("GATEWAY_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string()),
        })
    }
}

fn required(key: &str) -> Result<String, CoreError> {
    env::var(key).map_err(|_| CoreError::InternalEnvKeyNotFound(key.to_string()))
}
