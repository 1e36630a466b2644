//! The storage collaborator's trait boundary. The spec excludes the
//! storage engine's internals from this crate's scope; this trait is the
//! minimal contract the `LoadBalancer` and request dispatcher depend on.

use async_trait::async_trait;

/// What the core needs from the persistence layer: whether a ledger is
/// already indexed locally (used to short-circuit `fetchLedger`, see
/// `ClioError::AlreadyPresent`) and the locally indexed range.
#[async_trait]
pub trait Backend: Send + Sync {
    /// True if `seq` is already indexed locally; `fetchLedger` short-circuits
    /// to `Ok(None)` in that case rather than re-fetching upstream.
    async fn is_ledger_indexed(&self, seq: u32) -> anyhow::Result<bool>;

    /// The `[lo, hi]` range of ledgers indexed locally, if any.
    async fn indexed_range(&self) -> anyhow::Result<Option<(u32, u32)>>;
}

/// An in-memory fake used by tests, and by any process wired up without a
/// real storage backend.
#[derive(Debug, Default)]
pub struct NullBackend;

#[async_trait]
impl Backend for NullBackend {
    async fn is_ledger_indexed(&self, _seq: u32) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn indexed_range(&self) -> anyhow::Result<Option<(u32, u32)>> {
        Ok(None)
    }
}
