use serde::{Deserialize, Serialize};

/// Credentials a client presents in its handshake.
///
/// The server only accepts or rejects them; what a token means is up to the
/// server's configured authenticator.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Credentials {
    Token(String),
    #[default]
    Anonymous,
}

impl Credentials {
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Self::Anonymous)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::Anonymous => "anonymous",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_not_authenticated() {
        assert!(!Credentials::Anonymous.is_authenticated());
    }

    #[test]
    fn token_is_authenticated() {
        assert!(Credentials::Token("secret".into()).is_authenticated());
    }

    #[test]
    fn display_names() {
        assert_eq!(Credentials::Anonymous.display_name(), "anonymous");
        assert_eq!(Credentials::Token("x".into()).display_name(), "token");
    }

    #[test]
    fn default_is_anonymous() {
        assert_eq!(Credentials::default(), Credentials::Anonymous);
    }
}
