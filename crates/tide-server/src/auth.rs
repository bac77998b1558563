use std::collections::HashSet;

use async_trait::async_trait;

use tide_protocol::Credentials;

use crate::error::{ServerError, ServerResult};

/// Who a session belongs to, as established by the handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self { name: "anonymous".into() }
    }

    pub fn user(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Accepts or rejects the credentials of a connecting client.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> ServerResult<Identity>;
}

/// Accepts every handshake.
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, credentials: &Credentials) -> ServerResult<Identity> {
        match credentials {
            Credentials::Token(token) => Ok(Identity::user(token_label(token))),
            Credentials::Anonymous => Ok(Identity::anonymous()),
        }
    }
}

/// Accepts a fixed set of tokens, and optionally anonymous clients.
pub struct StaticTokens {
    tokens: HashSet<String>,
    allow_anonymous: bool,
}

impl StaticTokens {
    pub fn new(tokens: impl IntoIterator<Item = String>, allow_anonymous: bool) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
            allow_anonymous,
        }
    }
}

#[async_trait]
impl Authenticator for StaticTokens {
    async fn authenticate(&self, credentials: &Credentials) -> ServerResult<Identity> {
        match credentials {
            Credentials::Token(token) if self.tokens.contains(token) => {
                Ok(Identity::user(token_label(token)))
            }
            Credentials::Token(_) => Err(ServerError::AuthFailed("unknown token".into())),
            Credentials::Anonymous if self.allow_anonymous => Ok(Identity::anonymous()),
            Credentials::Anonymous => {
                Err(ServerError::AuthFailed("anonymous access disabled".into()))
            }
        }
    }
}

/// Loggable name for a token; never the whole secret.
fn token_label(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("token:{prefix}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_all_accepts_anonymous() {
        let id = AllowAll.authenticate(&Credentials::Anonymous).await.unwrap();
        assert_eq!(id, Identity::anonymous());
    }

    #[tokio::test]
    async fn allow_all_labels_tokens() {
        let id = AllowAll
            .authenticate(&Credentials::Token("s3cret-value".into()))
            .await
            .unwrap();
        assert!(id.name.starts_with("token:s3cr"));
        assert!(!id.name.contains("value"));
    }

    #[tokio::test]
    async fn static_tokens_gatekeeping() {
        let auth = StaticTokens::new(vec!["good".to_string()], false);
        assert!(auth.authenticate(&Credentials::Token("good".into())).await.is_ok());
        assert!(matches!(
            auth.authenticate(&Credentials::Token("bad".into())).await,
            Err(ServerError::AuthFailed(_))
        ));
        assert!(auth.authenticate(&Credentials::Anonymous).await.is_err());

        let open = StaticTokens::new(Vec::new(), true);
        assert!(open.authenticate(&Credentials::Anonymous).await.is_ok());
    }
}
