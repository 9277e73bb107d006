//! Identity verification at the connection boundary.
//!
//! The coordination layer itself trusts the user ids inside events; the
//! thin check here runs once at WebSocket upgrade, before any event
//! reaches the core components. Verification is a collaborator concern,
//! kept behind a trait so a real token service can replace the built-in
//! modes.

use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The presented credential was rejected.
    #[error("Invalid credential")]
    InvalidCredential,

    /// No credential was presented but one is required.
    #[error("Missing credential")]
    MissingCredential,
}

/// Identity verification collaborator.
pub trait Verifier: Send + Sync {
    /// Verify a credential, yielding the caller's user id.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential is missing or invalid.
    fn verify(&self, credential: Option<&str>) -> Result<Option<String>, AuthError>;
}

/// Accepts every connection with its claimed identity. Used when no token
/// is configured (development and trusted-network deployments).
#[derive(Debug, Default)]
pub struct OpenVerifier;

impl Verifier for OpenVerifier {
    fn verify(&self, _credential: Option<&str>) -> Result<Option<String>, AuthError> {
        Ok(None)
    }
}

/// Requires a shared static token in the form `token:user_id`.
#[derive(Debug)]
pub struct StaticTokenVerifier {
    token: String,
}

impl StaticTokenVerifier {
    /// Create a verifier for the given shared token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Verifier for StaticTokenVerifier {
    fn verify(&self, credential: Option<&str>) -> Result<Option<String>, AuthError> {
        let credential = credential.ok_or(AuthError::MissingCredential)?;
        let (token, user_id) = credential
            .split_once(':')
            .ok_or(AuthError::InvalidCredential)?;
        if token != self.token || user_id.is_empty() {
            return Err(AuthError::InvalidCredential);
        }
        Ok(Some(user_id.to_string()))
    }
}
