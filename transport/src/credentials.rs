// Copyright (c) 2018-2023 The Botho Foundation

//! Secure dial options provider (spec.md §6's "Secure dial options
//! provider: a supplier returning transport credentials for outgoing
//! connections").

use std::fmt::Debug;

/// Errors a [`CredentialsProvider`] can surface while producing credentials.
pub trait CredentialsProviderError: Debug + Send + Sync {
    /// Whether the caller should retry with a fresh set of credentials.
    fn should_retry(&self) -> bool {
        false
    }
}

/// HTTP Basic credentials for dialing a peer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BasicCredentials {
    username: String,
    password: String,
}

impl BasicCredentials {
    /// Build a new basic-credentials pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Whether both username and password are empty (no credentials).
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }

    /// Render as an `Authorization: Basic ...` header value.
    pub fn authorization_header(&self) -> String {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password));
        format!("Basic {encoded}")
    }
}

/// Supplies whatever credentials the transport should attach to outgoing
/// connections. Implementations may refresh tokens, read from a keyring, or
/// simply hand back a fixed value.
pub trait CredentialsProvider: Send + Sync {
    /// The concrete error type this provider can return.
    type Error: CredentialsProviderError + 'static;

    /// Produce the current credentials.
    fn get_credentials(&self) -> core::result::Result<BasicCredentials, Self::Error>;

    /// Invalidate any cached credentials, forcing a refresh on next use.
    /// Called by the transport when the peer rejects a connection as
    /// unauthenticated.
    fn clear(&self) {}
}

/// A provider that always returns the same fixed credentials.
#[derive(Clone, Debug, Default)]
pub struct HardcodedCredentialsProvider {
    credentials: BasicCredentials,
}

impl HardcodedCredentialsProvider {
    /// Wrap a fixed set of credentials.
    pub fn new(credentials: BasicCredentials) -> Self {
        Self { credentials }
    }
}

/// Infallible error type for [`HardcodedCredentialsProvider`].
#[derive(Debug)]
pub enum AnyCredentialsError {
    /// A provider-specific failure, carried as a display string since
    /// provider error types differ across the `Any*` family.
    Other(String),
}

impl CredentialsProviderError for AnyCredentialsError {
    fn should_retry(&self) -> bool {
        false
    }
}

impl CredentialsProvider for HardcodedCredentialsProvider {
    type Error = AnyCredentialsError;

    fn get_credentials(&self) -> core::result::Result<BasicCredentials, Self::Error> {
        Ok(self.credentials.clone())
    }
}

/// A type-erased [`CredentialsProvider`], for call sites that need to hold
/// one of several provider implementations behind a single type.
pub enum AnyCredentialsProvider {
    /// A fixed, never-changing set of credentials.
    Hardcoded(HardcodedCredentialsProvider),
    /// No credentials at all (plaintext dial).
    None,
}

impl CredentialsProvider for AnyCredentialsProvider {
    type Error = AnyCredentialsError;

    fn get_credentials(&self) -> core::result::Result<BasicCredentials, Self::Error> {
        match self {
            AnyCredentialsProvider::Hardcoded(p) => p.get_credentials(),
            AnyCredentialsProvider::None => Ok(BasicCredentials::default()),
        }
    }

    fn clear(&self) {
        if let AnyCredentialsProvider::Hardcoded(p) = self {
            p.clear()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardcoded_provider_returns_fixed_credentials() {
        let creds = BasicCredentials::new("alice", "s3cret");
        let provider = HardcodedCredentialsProvider::new(creds.clone());
        assert_eq!(provider.get_credentials().unwrap(), creds);
    }

    #[test]
    fn empty_credentials_report_empty() {
        assert!(BasicCredentials::default().is_empty());
        assert!(!BasicCredentials::new("a", "").is_empty());
    }

    #[test]
    fn authorization_header_is_basic_scheme() {
        let creds = BasicCredentials::new("alice", "wonderland");
        assert!(creds.authorization_header().starts_with("Basic "));
    }

    #[test]
    fn any_provider_none_has_no_credentials() {
        let provider = AnyCredentialsProvider::None;
        assert!(provider.get_credentials().unwrap().is_empty());
    }
}
