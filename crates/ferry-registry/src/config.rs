use serde::{Deserialize, Serialize};

/// Bearer token for one registry host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryAuth {
    pub host: String,
    pub token: String,
}

/// Registry access settings, read from the `[registry]` table of the ferry
/// config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Hosts reached over plain HTTP.
    #[serde(default)]
    pub insecure: Vec<String>,
    #[serde(default)]
    pub auth: Vec<RegistryAuth>,
}

impl RegistryConfig {
    pub fn is_insecure(&self, host: &str) -> bool {
        self.insecure.iter().any(|h| h == host)
    }

    pub fn token_for(&self, host: &str) -> Option<&str> {
        self.auth
            .iter()
            .find(|a| a.host == host)
            .map(|a| a.token.as_str())
    }

    pub fn base_url(&self, host: &str) -> String {
        let scheme = if self.is_insecure(host) { "http" } else { "https" };
        format!("{scheme}://{host}")
    }
}
