//! Error taxonomy for the relay gateway.
//!
//! Every error that reaches a client is reduced to a stable `{code, reason}`
//! pair. Backend-native errors (SSH, SFTP, MySQL) are translated at the
//! adapter boundary — raw driver errors and credential material stay in
//! operator logs and never cross the wire.

use thiserror::Error;

/// Authentication failures, emitted as `auth.error` events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing authentication parameters")]
    MissingParameters,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("address not authorized")]
    Unauthorized,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingParameters => "missing_parameters",
            Self::InvalidSignature => "invalid_signature",
            Self::Unauthorized => "unauthorized",
        }
    }
}

/// Session lifecycle failures, emitted as kind-scoped `session.error` events.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("authentication required")]
    AuthRequired,
    #[error("unknown session kind: {0}")]
    UnknownKind(String),
    #[error("a session of this kind is already open or opening")]
    AlreadyOpen,
    #[error("no open session of this kind")]
    NotOpen,
    #[error("failed to open backend session: {0}")]
    OpenFailed(String),
    #[error("{0}")]
    Backend(String),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthRequired => "auth_required",
            Self::UnknownKind(_) => "unknown_kind",
            Self::AlreadyOpen => "already_open",
            Self::NotOpen => "not_open",
            Self::OpenFailed(_) => "open_failed",
            Self::Backend(_) => "backend",
        }
    }
}
