//! Upstream API credentials. Read-only to the gateway.

use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,

    /// Bearer token sent to the upstream.
    pub secret: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Requests allowed in any trailing 60 seconds. 0 means unlimited.
    #[serde(default)]
    pub requests_per_minute: u32,

    /// Tokens allowed per UTC day. 0 means unlimited.
    #[serde(default)]
    pub tokens_per_day: u64,
}

fn default_enabled() -> bool {
    true
}

impl Credential {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            enabled: true,
            requests_per_minute: 0,
            tokens_per_day: 0,
        }
    }

    pub fn with_limits(mut self, requests_per_minute: u32, tokens_per_day: u64) -> Self {
        self.requests_per_minute = requests_per_minute;
        self.tokens_per_day = tokens_per_day;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

// Secrets stay out of logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("enabled", &self.enabled)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("tokens_per_day", &self.tokens_per_day)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_secret() {
        let cred = Credential::new("k1", "sk-very-secret");
        let printed = format!("{:?}", cred);
        assert!(printed.contains("k1"));
        assert!(!printed.contains("sk-very-secret"));
    }
}
