use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use uuid::Uuid;

/// Client configuration for the realtime core.
///
/// Read once at startup; the engines receive the pieces they need rather than
/// the whole struct.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the conversation/message persistence API.
    pub api_base_url: String,
    /// WebSocket endpoint of the event transport.
    pub ws_url: String,
    /// Path of the durable offline-queue file.
    pub queue_path: PathBuf,
    /// Identity of the local user, stamped on outbound intents.
    pub user_id: Uuid,
    pub user_name: String,
}

impl Config {
    pub fn from_env() -> Result<Self, crate::error::EngineError> {
        dotenv().ok();

        let api_base_url = env::var("WELLSPRING_API_URL")
            .unwrap_or_else(|_| "http://localhost:3000/api".to_string());
        let ws_url =
            env::var("WELLSPRING_WS_URL").unwrap_or_else(|_| "ws://localhost:3000/ws".to_string());

        let queue_path = env::var("WELLSPRING_QUEUE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("wellspring-offline-queue.json"));

        let user_id = env::var("WELLSPRING_USER_ID")
            .map_err(|_| crate::error::EngineError::Config("WELLSPRING_USER_ID missing".into()))?;
        let user_id = Uuid::parse_str(&user_id).map_err(|e| {
            crate::error::EngineError::Config(format!("WELLSPRING_USER_ID parse: {e}"))
        })?;

        let user_name = env::var("WELLSPRING_USER_NAME").unwrap_or_default();

        Ok(Self {
            api_base_url,
            ws_url,
            queue_path,
            user_id,
            user_name,
        })
    }
}
