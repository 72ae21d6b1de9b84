use std::env;

use rsvoice_protocol::CoreError;

/// Process-wide, read-mostly configuration loaded once from the environment
/// at startup (§5 shared-resource policy, §9 ambient singletons). Required
/// keys fail fast on missing access rather than defaulting silently.
#[derive(Debug, Clone)]
pub struct DatastoreConfig {
    pub db_path: String,
    pub db_encryption_key: String,
    pub socket_path: String,
    pub high_water_mark: usize,
    /// Present only when summarization is configured; absent disables it.
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
}

impl DatastoreConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        Ok(Self {
            db_path: required("DB_PATH")?,
            db_encryption_key: required("DB_ENCRYPTION_KEY")?,
            socket_path: required("ZMQ_SOCKET_PATH")?,
            high_water_mark: rsvoice_protocol::DEFAULT_HIGH_WATER_MARK,
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            gemini_api_key: env::var("GEMINI_API_KEY").ok(),
        })
    }
}

fn required(key: &str) -> Result<String, CoreError> {
    env::var(key).map_err(|_| CoreError::InternalEnvKeyNotFound(key.to_string()))
}
