//! Remote cancellation tokens.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Opaque id correlating a cancellation request to one in-flight operation.
///
/// `NotCancellable` is an explicit variant, not a zero id, so a missing or
/// default token can never be confused with a real one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RemoteCancellationToken {
    /// The call cannot be cancelled. Never matches anything.
    #[default]
    NotCancellable,
    Remote(Uuid),
}

impl RemoteCancellationToken {
    /// Mint a fresh token.
    #[must_use]
    pub fn mint() -> Self {
        Self::Remote(Uuid::new_v4())
    }

    /// Token for a caller's local cancellation handle, or `NotCancellable`
    /// when there is none.
    #[must_use]
    pub fn for_source(source: Option<&CancellationToken>) -> Self {
        source.map_or(Self::NotCancellable, |_| Self::mint())
    }

    #[must_use]
    pub const fn is_cancellable(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Whether a broadcast carrying `requested` targets this token.
    #[must_use]
    pub fn matches(&self, requested: &Self) -> bool {
        match (self, requested) {
            (Self::Remote(a), Self::Remote(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Display for RemoteCancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotCancellable => f.write_str("none"),
            Self::Remote(id) => write!(f, "{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_never_matches() {
        let none = RemoteCancellationToken::NotCancellable;
        assert!(!none.matches(&none));
        assert!(!none.matches(&RemoteCancellationToken::mint()));
        assert!(!RemoteCancellationToken::mint().matches(&none));
    }

    #[test]
    fn test_minted_tokens_are_distinct() {
        let a = RemoteCancellationToken::mint();
        let b = RemoteCancellationToken::mint();
        assert!(a.matches(&a));
        assert!(!a.matches(&b));
    }

    #[test]
    fn test_for_source() {
        let source = CancellationToken::new();
        assert!(RemoteCancellationToken::for_source(Some(&source)).is_cancellable());
        assert!(!RemoteCancellationToken::for_source(None).is_cancellable());
    }

    #[test]
    fn test_missing_token_deserializes_as_not_cancellable() {
        #[derive(Deserialize)]
        struct Params {
            #[serde(default)]
            token: RemoteCancellationToken,
        }
        let parsed: Params = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.token, RemoteCancellationToken::NotCancellable);

        let json = serde_json::to_string(&RemoteCancellationToken::NotCancellable).unwrap();
        assert_eq!(json, r#"{"kind":"not_cancellable"}"#);
    }
}
