//! Call configuration.

use serde::{Deserialize, Serialize};

/// STUN servers used when no other ICE servers are configured
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Top-level collection holding one session document per call
pub const DEFAULT_SESSIONS_COLLECTION: &str = "calls";

/// One ICE server entry handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// STUN/TURN urls
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A credential-less server (STUN).
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            username: None,
            credential: None,
        }
    }
}

/// Configuration shared by every call a client makes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallConfig {
    /// ICE servers for candidate gathering
    pub ice_servers: Vec<IceServer>,
    /// Collection that holds the session documents
    pub sessions_collection: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::new(DEFAULT_STUN_SERVERS.iter().copied())],
            sessions_collection: DEFAULT_SESSIONS_COLLECTION.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_public_stun() {
        let config = CallConfig::default();
        assert_eq!(config.sessions_collection, "calls");
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(
            config.ice_servers[0].urls,
            vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string()
            ]
        );
    }

    #[test]
    fn test_stun_entries_omit_credentials() {
        let json = serde_json::to_string(&CallConfig::default()).unwrap();
        assert!(json.contains("iceServers"));
        assert!(!json.contains("username"));
    }
}
