//! Connection authorization seam.
//!
//! The actual policy (allow-lists, JWT validation) lives outside the core;
//! the ingest only enforces its verdict before upgrading the WebSocket.

use std::collections::HashSet;
use std::net::SocketAddr;

/// What the ingest knows about a connection attempt.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub remote_addr: Option<SocketAddr>,
    /// Bearer token from the `Authorization` header or `token` query param.
    pub bearer_token: Option<String>,
}

/// Verdict provider consulted before accepting a telephony connection.
pub trait IngestAuthPolicy: Send + Sync {
    fn authorize(&self, context: &AuthContext) -> bool;
}

/// Accepts every connection. Default for deployments that terminate auth
/// upstream (mTLS, provider IP allow-lists at the load balancer).
pub struct AllowAllPolicy;

impl IngestAuthPolicy for AllowAllPolicy {
    fn authorize(&self, _context: &AuthContext) -> bool {
        true
    }
}

/// Accepts only connections presenting a token from a fixed set.
///
/// Stands in for externally-issued credentials; rotation means swapping the
/// policy instance.
pub struct TokenAllowListPolicy {
    tokens: HashSet<String>,
}

impl TokenAllowListPolicy {
    #[must_use]
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl IngestAuthPolicy for TokenAllowListPolicy {
    fn authorize(&self, context: &AuthContext) -> bool {
        context
            .bearer_token
            .as_ref()
            .is_some_and(|token| self.tokens.contains(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_all_accepts_empty_context() {
        assert!(AllowAllPolicy.authorize(&AuthContext::default()));
    }

    #[test]
    fn token_allow_list_enforces_membership() {
        let policy = TokenAllowListPolicy::new(["secret-1".to_string()]);

        let mut context = AuthContext::default();
        assert!(!policy.authorize(&context));

        context.bearer_token = Some("wrong".into());
        assert!(!policy.authorize(&context));

        context.bearer_token = Some("secret-1".into());
        assert!(policy.authorize(&context));
    }
}
