// =============================================================================
// Discriminated error taxonomy
// =============================================================================
//
// Every kind below is a distinct variant a caller can match on, never an
// opaque string. Collection entry points (login-all, refresh-all, execute,
// sweep, supervisor tick) never propagate these — they fold per-item
// failures into result aggregates. Single-target entry points return
// `Result<T, E>` with one of these as `E`. Only the startup path is allowed
// to turn a `ConfigError`/`StorageError` into a process exit.
// =============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Upstream rejected credentials or a token. Recovery path: fall back to
/// `SessionPool::login_one`.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("upstream rejected credentials for broker {broker_id}")]
    InvalidCredentials { broker_id: String },
    #[error("upstream token expired or rejected: {0}")]
    TokenRejected(String),
}

/// Non-retryable 4xx (other than 401) from the upstream.
#[derive(Debug, thiserror::Error)]
#[error("upstream request error ({status}): {message}")]
pub struct RequestError {
    pub status: u16,
    pub message: String,
}

/// Network/5xx error surfaced only after the retry budget is exhausted.
#[derive(Debug, thiserror::Error)]
#[error("upstream transient error after retries: {0}")]
pub struct TransientError(pub String);

/// Repository/commit failure. The triggering transaction has been rolled
/// back by the time this is returned.
#[derive(Debug, thiserror::Error)]
#[error("storage error: {0}")]
pub struct StorageError(pub String);

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError(e.to_string())
    }
}

/// `CredentialVault` decryption failure. Never handled by silently
/// returning plaintext or falling back to another encoding.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("ciphertext too short to contain a nonce")]
    Truncated,
    #[error("AEAD decryption failed (bad key or tampered ciphertext)")]
    DecryptionFailed,
    #[error("encryption key is malformed: {0}")]
    BadKey(String),
}

/// Fatal startup misconfiguration (e.g. missing `ENCRYPTION_KEY`).
#[derive(Debug, thiserror::Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

/// A subscriber send failed, timed out, or observed a non-connected state.
/// The subscriber is evicted; publishers are never informed of this.
#[derive(Debug, thiserror::Error)]
#[error("bus delivery error: {0}")]
pub struct BusDeliveryError(pub String);

/// Unified error used at the HTTP boundary to pick a status code.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Transient(#[from] TransientError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            OrchestratorError::Auth(e) => (StatusCode::UNAUTHORIZED, e.to_string()),
            OrchestratorError::Request(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            OrchestratorError::Transient(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            OrchestratorError::Storage(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            OrchestratorError::Crypto(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            OrchestratorError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            OrchestratorError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
