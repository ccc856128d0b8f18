//! Collaborators consulted before a completion: web retrieval and
//! entitlement checks.

use crate::models::Mode;
use async_trait::async_trait;

/// One retrieved web snippet.
#[derive(Debug, Clone, PartialEq)]
pub struct WebSnippet {
    pub url: String,
    pub text: String,
}

#[async_trait]
pub trait WebContextProvider: Send + Sync {
    /// Snippets relevant to `query`, most relevant first. Failures are the
    /// provider's to absorb; an empty list is always acceptable.
    async fn snippets(&self, query: &str) -> Vec<WebSnippet>;
}

/// Retrieval disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWebContext;

#[async_trait]
impl WebContextProvider for NoWebContext {
    async fn snippets(&self, _query: &str) -> Vec<WebSnippet> {
        Vec::new()
    }
}

pub trait EntitlementCheck: Send + Sync {
    fn is_entitled(&self, user_id: &str, mode: Mode) -> bool;
}

/// Only `ultimate` is gated; `*` in the allowlist admits everyone.
#[derive(Debug, Clone, Default)]
pub struct AllowlistEntitlement {
    ultimate_users: Vec<String>,
}

impl AllowlistEntitlement {
    pub fn new(ultimate_users: Vec<String>) -> Self {
        Self { ultimate_users }
    }
}

impl EntitlementCheck for AllowlistEntitlement {
    fn is_entitled(&self, user_id: &str, mode: Mode) -> bool {
        match mode {
            Mode::Ultimate => self
                .ultimate_users
                .iter()
                .any(|u| u == "*" || u == user_id),
            _ => true,
        }
    }
}
