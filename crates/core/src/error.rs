//! Error taxonomy shared by every Cairn crate.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A hook or provider slot that must be unique was registered twice.
    #[error("already registered: {0}")]
    AlreadyRegistered(String),

    /// Resource-store create hit an existing object.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{capability}: provider not supported: {provider}")]
    ProviderNotSupported { capability: String, provider: String },

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// Non-2xx answer from an external HTTP API.
    #[error("upstream error from {resource} ({status}): {body}")]
    Upstream { resource: String, status: u16, body: String },

    /// External CLI exited non-zero.
    #[error("exec error: {command}: {stderr}")]
    Exec { command: String, stderr: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound { kind, name: name.into() }
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::InvalidParams(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_detail() {
        let e = Error::not_found("method", "create-widget");
        assert_eq!(e.to_string(), "method not found: create-widget");
        assert!(e.is_not_found());

        let e = Error::Upstream { resource: "providers/oauth2".into(), status: 400, body: "{\"name\":[\"taken\"]}".into() };
        assert!(e.to_string().contains("providers/oauth2"));
        assert!(e.to_string().contains("taken"));

        let e = Error::Exec { command: "fly login".into(), stderr: "bad credentials".into() };
        assert_eq!(e.to_string(), "exec error: fly login: bad credentials");

        let e = Error::ProviderNotSupported { capability: "create-oidc-client".into(), provider: "keycloak".into() };
        assert!(e.to_string().ends_with("provider not supported: keycloak"));
    }

    #[test]
    fn io_and_json_errors_convert() {
        let io: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(matches!(io, Error::Io(_)));
        let js: Error = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(js, Error::Serialization(_)));
        assert!(!js.is_already_exists());
    }
}
