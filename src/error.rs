//! The stable error taxonomy surfaced at API boundaries.
//!
//! Internals use [`anyhow::Result`] with `.context()` chains; only the
//! request dispatcher, [`crate::load_balancer::LoadBalancer::forward_to_rippled`]
//! and the `Source` fetch methods commit to this enum, so the dispatcher can
//! match on *kind* without internals losing their context chain.

use thiserror::Error;

/// Why a forwarded request could not be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingFailure {
    /// No source is currently connected at all.
    NoSources,
    /// Every attempted source rejected or failed the forward.
    AllAttemptsFailed,
}

impl std::fmt::Display for ForwardingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSources => write!(f, "no sources"),
            Self::AllAttemptsFailed => write!(f, "all attempts failed"),
        }
    }
}

/// Taxonomy of errors this crate's core can produce, independent of how a
/// transport ultimately encodes them on the wire.
#[derive(Debug, Error)]
pub enum ClioError {
    /// The queried ledger or entry does not exist upstream.
    #[error("not found")]
    NotFound,

    /// A transport or stream failure; retryable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The storage collaborator reports the ledger is already indexed
    /// locally; callers should treat this like a short-circuited success.
    #[error("already present")]
    AlreadyPresent,

    /// The shutdown flag was observed; all retry loops terminate with this.
    #[error("shutting down")]
    Shutdown,

    /// Local request validation failed (malformed JSON, missing field).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No handler is registered for the given command name.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// `forwardToRippled` could not complete.
    #[error("forwarding failed: {0}")]
    ForwardingFailed(ForwardingFailure),

    /// An unexpected condition; logged and counted before being returned.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ClioError {
    /// Build an [`ClioError::Internal`], logging it once at the construction
    /// site so it is never re-logged on every propagation.
    pub fn internal(context: impl std::fmt::Display) -> Self {
        tracing::error!(%context, "internal error");
        Self::Internal(context.to_string())
    }

    /// The stable RPC error code the dispatcher maps this kind to.
    pub fn rpc_code(&self) -> &'static str {
        match self {
            Self::NotFound => "notFound",
            Self::Unavailable(_) => "unavailable",
            Self::AlreadyPresent => "alreadyPresent",
            Self::Shutdown => "shuttingDown",
            Self::BadRequest(_) => "badRequest",
            Self::UnknownCommand(_) => "unknownCmd",
            Self::ForwardingFailed(_) => "forwardingFailed",
            Self::Internal(_) => "internal",
        }
    }
}
