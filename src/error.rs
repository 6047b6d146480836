//! Error types for the auth service

use std::io;

use thiserror::Error;

use crate::authn::AuthenticatorError;
use crate::authz::AuthorizerError;
use crate::session::{ProviderError, StateError};
use crate::store::StoreError;

/// Result type alias for the auth service
pub type Result<T> = std::result::Result<T, Error>;

/// Auth service errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// CSRF state verification failed
    #[error(transparent)]
    State(#[from] StateError),

    /// Identity provider or transport failure
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// An authenticator rejected the request definitively
    #[error(transparent)]
    Authenticator(#[from] AuthenticatorError),

    /// Authorization policy could not be loaded or watched
    #[error(transparent)]
    Authorizer(#[from] AuthorizerError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
