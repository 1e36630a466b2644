//! The `ledger`, `manifests`, and `validations` feeds: each carries one
//! precomputed message with no API-version branching (§4.6).

use std::sync::Arc;

use crate::{
    feed::{signal::TrackableSignal, strand::Strand},
    subscriber::{SubscriberHandle, SubscriberId},
};

pub struct SimpleFeed {
    strand: Strand<TrackableSignal>,
}

impl SimpleFeed {
    pub fn new() -> Self {
        Self {
            strand: Strand::new(TrackableSignal::new()),
        }
    }

    pub async fn sub(&self, subscriber: SubscriberHandle) -> SubscriberId {
        self.strand.run(move |signal| signal.connect(&subscriber)).await
    }

    pub async fn unsub(&self, subscriber: SubscriberHandle) -> bool {
        self.strand.run(move |signal| signal.disconnect(&subscriber)).await
    }

    /// Publishes `message` to every live subscriber. Serialized on this
    /// feed's strand; never suspends once it starts iterating slots. A
    /// subscriber whose `send` fails (e.g. a full bounded channel) is
    /// disconnected from this feed; delivery continues for the rest (§7).
    pub async fn publish(&self, message: Arc<str>) {
        self.strand
            .run(move |signal| {
                signal.emit(|_id, sub| sub.send(message.clone()).is_ok());
            })
            .await;
    }

    pub async fn count(&self) -> u64 {
        self.strand.run(|signal| signal.count()).await
    }
}

impl Default for SimpleFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::ApiVersion;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<String>>);
    impl crate::subscriber::SubscriberSink for Recorder {
        fn send(&self, message: Arc<str>) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(message.to_string());
            Ok(())
        }
        fn api_version(&self) -> ApiVersion {
            ApiVersion::V1
        }
    }

    #[tokio::test]
    async fn publish_delivers_to_subscribed_only() {
        let feed = SimpleFeed::new();
        let sub: SubscriberHandle = Arc::new(Recorder(Mutex::new(Vec::new())));
        feed.sub(sub.clone()).await;
        feed.publish(Arc::from("hello")).await;
        assert_eq!(feed.count().await, 1);

        feed.unsub(sub.clone()).await;
        feed.publish(Arc::from("world")).await;
        assert_eq!(feed.count().await, 0);
    }

    struct FailingSink;
    impl crate::subscriber::SubscriberSink for FailingSink {
        fn send(&self, _message: Arc<str>) -> anyhow::Result<()> {
            anyhow::bail!("channel full")
        }
        fn api_version(&self) -> ApiVersion {
            ApiVersion::V1
        }
    }

    #[tokio::test]
    async fn publish_disconnects_subscriber_whose_send_fails() {
        let feed = SimpleFeed::new();
        let sub: SubscriberHandle = Arc::new(FailingSink);
        feed.sub(sub.clone()).await;
        assert_eq!(feed.count().await, 1);

        feed.publish(Arc::from("hello")).await;
        assert_eq!(feed.count().await, 0, "failed subscriber pruned after publish");
    }
}
