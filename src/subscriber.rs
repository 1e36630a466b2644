//! The subscriber capability and the identity scheme used to key it.
//!
//! Subscribers are owned by the transport layer: one strong [`Arc`] per
//! connection. The core never holds more than a [`Weak`] reference, so a
//! dropped connection logically unsubscribes itself everywhere without an
//! explicit unsubscribe call (see `DESIGN.md` for the grounding).

use std::sync::{Arc, Weak};

/// API version a subscriber negotiated; selects message shape at publish
/// time (§4.6 of the design).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ApiVersion {
    V1,
    V2,
}

impl ApiVersion {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }
}

/// A single capability exposed by an externally owned client connection:
/// deliver one already-rendered message.
pub trait SubscriberSink: Send + Sync {
    /// Deliver `message` to the client. Must not block; an implementation
    /// backed by a bounded channel should fail fast (return `Err`) rather
    /// than apply backpressure, since `pub` must complete synchronously
    /// (§5 "Suspension points").
    fn send(&self, message: Arc<str>) -> anyhow::Result<()>;

    /// The API version this subscriber negotiated at connect time.
    fn api_version(&self) -> ApiVersion;
}

/// A strong handle to a subscriber, owned by the transport layer.
pub type SubscriberHandle = Arc<dyn SubscriberSink>;

/// A weak handle stored inside feed slots and the subscriber registry.
pub type WeakSubscriber = Weak<dyn SubscriberSink>;

/// Pointer-identity key for a subscriber, stable across `Weak` upgrades of
/// the same underlying allocation. Rust has no pointer-identity trait for
/// `dyn Trait`, so this is derived from the strong handle's data address at
/// subscription time (see `DESIGN.md`, Open Question on subscriber
/// identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(usize);

impl SubscriberId {
    pub fn of(handle: &SubscriberHandle) -> Self {
        Self(Arc::as_ptr(handle) as *const () as usize)
    }
}
