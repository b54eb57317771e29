use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub twilio: TwilioConfig,
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public base URL the carrier can reach, e.g. "https://concierge.example.com".
    pub external_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TwilioConfig {
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub phone_number: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    #[serde(default = "default_realtime_model")]
    pub model: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_instructions")]
    pub instructions: String,
    #[serde(default = "default_concierge_name")]
    pub concierge_name: String,
}

fn default_realtime_model() -> String {
    "gpt-realtime".to_string()
}

fn default_voice() -> String {
    "alloy".to_string()
}

fn default_instructions() -> String {
    "You are a friendly phone concierge. Keep responses short and conversational; \
     you are speaking over a telephone line."
        .to_string()
}

fn default_concierge_name() -> String {
    "the concierge".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Minimum seconds between two third-party bridge attempts with the
    /// same (phone, caller, message-prefix) fingerprint.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Hard cap on the relayed message length.
    #[serde(default = "default_message_max_chars")]
    pub message_max_chars: usize,
    /// Sliding-window cap on stored transcript turns per call.
    #[serde(default = "default_memory_turns")]
    pub memory_turns: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            message_max_chars: default_message_max_chars(),
            memory_turns: default_memory_turns(),
        }
    }
}

fn default_cooldown_secs() -> u64 {
    12
}

fn default_message_max_chars() -> usize {
    800
}

fn default_memory_turns() -> usize {
    12
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    /// Directory for the file-backed KV store. Empty means memory-only.
    #[serde(default)]
    pub dir: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ApiConfig {
    /// Bearer token required for /api/* endpoints. If empty, all requests are rejected.
    #[serde(default)]
    pub token: String,
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file from same directory as config.toml
        let env_path = config_dir().join(".env");
        match dotenvy::from_path(&env_path) {
            Ok(()) => tracing::info!("Loaded .env from {}", env_path.display()),
            Err(dotenvy::Error::Io(_)) => {
                tracing::debug!(
                    "No .env file at {}, using environment only",
                    env_path.display()
                );
            }
            Err(e) => tracing::warn!("Failed to parse .env: {e}"),
        }

        let path = config_path();
        tracing::info!("Loading config from {}", path.display());

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            format!(
                "Failed to read config at {}: {}. Copy config.example.toml to {}",
                path.display(),
                e,
                path.display()
            )
        })?;

        let mut config: Config = toml::from_str(&contents)?;

        // Allow env var overrides for secrets
        if let Ok(v) = std::env::var("TWILIO_ACCOUNT_SID") {
            config.twilio.account_sid = v;
        }
        if let Ok(v) = std::env::var("TWILIO_AUTH_TOKEN") {
            config.twilio.auth_token = v;
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            config.openai.api_key = v;
        }
        if let Ok(v) = std::env::var("RELAY_API_TOKEN") {
            config.api.token = v;
        }
        if let Ok(v) = std::env::var("SERVER_EXTERNAL_URL") {
            config.server.external_url = v;
        }

        Ok(config)
    }
}

fn config_dir() -> PathBuf {
    if let Ok(p) = std::env::var("RELAY_CONCIERGE_CONFIG") {
        // If pointing to a file, use its parent directory
        let path = PathBuf::from(p);
        return path.parent().map(|p| p.to_path_buf()).unwrap_or(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".relay-concierge")
}

fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("RELAY_CONCIERGE_CONFIG") {
        return PathBuf::from(p);
    }

    config_dir().join("config.toml")
}

#[cfg(test)]
pub fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            external_url: "https://concierge.test".to_string(),
        },
        twilio: TwilioConfig {
            account_sid: String::new(),
            auth_token: String::new(),
            phone_number: "+15550000000".to_string(),
        },
        openai: OpenAiConfig {
            api_key: String::new(),
            model: default_realtime_model(),
            voice: default_voice(),
            instructions: default_instructions(),
            concierge_name: default_concierge_name(),
        },
        relay: RelayConfig::default(),
        store: StoreConfig::default(),
        api: ApiConfig::default(),
    }
}
