//! Konfiguration für Signaling-Relay und ICE-Server
//!
//! Standardwerte können über Umgebungsvariablen überschrieben werden:
//! - `SIGNALING_URL`, `SIGNALING_API_KEY`
//! - `STUN_URLS` (kommagetrennt)
//! - `TURN_URL`, `TURN_USERNAME`, `TURN_CREDENTIAL`

use serde::{Deserialize, Serialize};

/// Standard-Präfix für Raum-Topics
pub const DEFAULT_TOPIC_PREFIX: &str = "debate-room-";

/// Standard Signaling URL
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:4000";

// ============================================================================
// ICE SERVER
// ============================================================================

/// Ein STUN- oder TURN-Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(urls: Vec<String>) -> Self {
        Self {
            urls,
            username: None,
            credential: None,
        }
    }
}

/// Standard STUN Server (Google, kostenlos)
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig::stun(vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
        "stun:stun2.l.google.com:19302".to_string(),
    ])]
}

// ============================================================================
// CALL CONFIG
// ============================================================================

/// Konfiguration eines Call-Clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub signaling_url: String,
    pub api_key: Option<String>,
    pub ice_servers: Vec<IceServerConfig>,
    pub topic_prefix: String,
    pub heartbeat_interval_secs: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            api_key: None,
            ice_servers: default_ice_servers(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            heartbeat_interval_secs: 25,
        }
    }
}

impl CallConfig {
    /// Liest die Konfiguration aus der Umgebung
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Baut die Konfiguration aus einer beliebigen Key-Value-Quelle
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("SIGNALING_URL") {
            config.signaling_url = url;
        }
        config.api_key = lookup("SIGNALING_API_KEY").filter(|k| !k.is_empty());

        if let Some(stun) = lookup("STUN_URLS") {
            let urls: Vec<String> = stun
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
            if !urls.is_empty() {
                config.ice_servers = vec![IceServerConfig::stun(urls)];
            }
        }

        if let Some(turn_url) = lookup("TURN_URL") {
            config = config.with_turn_server(
                turn_url,
                lookup("TURN_USERNAME").unwrap_or_default(),
                lookup("TURN_CREDENTIAL").unwrap_or_default(),
            );
        }

        config
    }

    /// Fügt einen TURN-Server mit Credentials hinzu
    pub fn with_turn_server(mut self, url: String, username: String, credential: String) -> Self {
        self.ice_servers.push(IceServerConfig {
            urls: vec![url],
            username: Some(username),
            credential: Some(credential),
        });
        self
    }

    /// Topic-Name für einen Raum
    pub fn room_topic(&self, room_id: &str) -> String {
        format!("{}{}", self.topic_prefix, room_id)
    }
}
