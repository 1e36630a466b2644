//! The `transactions` feed and its `transactions_proposed` mirror: a
//! global subscription plus per-account and per-book filters, with
//! at-most-once delivery per publish across all three (§4.6).

use std::{collections::HashSet, sync::Arc};

use crate::{
    feed::{
        signal::{TrackableSignal, TrackableSignalMap},
        strand::Strand,
    },
    subscriber::{ApiVersion, SubscriberHandle, SubscriberId},
};

/// A currency pair identifying an order book, as `(taker_gets, taker_pays)`
/// currency+issuer strings.
pub type BookKey = (String, String);

/// One transaction's precomputed renderings, ready to hand to subscribers
/// without per-subscriber work (§4.6 "both renderings are produced once
/// per pub and shared").
pub struct TransactionEvent {
    pub v1: Arc<str>,
    pub v2: Arc<str>,
    pub affected_accounts: Vec<String>,
    pub affected_books: Vec<BookKey>,
}

#[derive(Default)]
struct TransactionFeedState {
    all: TrackableSignal,
    accounts: TrackableSignalMap<String>,
    books: TrackableSignalMap<BookKey>,
}

impl TransactionFeedState {
    /// Delivers `event` to every distinct subscriber reachable through the
    /// global table, the affected accounts, or the affected books — each
    /// subscriber hears it at most once even if subscribed on more than
    /// one of those paths (§4.6). A subscriber whose `send` fails is
    /// disconnected from the signal it was reached through; a send that is
    /// skipped because the subscriber was already notified through another
    /// path this publish does not count as a failure (§7).
    fn publish(&self, event: &TransactionEvent) {
        let mut notified: HashSet<SubscriberId> = HashSet::new();
        let mut deliver = |id: SubscriberId, sub: &SubscriberHandle| {
            if notified.insert(id) {
                let message = match sub.api_version() {
                    ApiVersion::V1 => event.v1.clone(),
                    ApiVersion::V2 => event.v2.clone(),
                };
                sub.send(message).is_ok()
            } else {
                true
            }
        };

        self.all.emit(&mut deliver);
        for account in &event.affected_accounts {
            self.accounts.emit(account, &mut deliver);
        }
        for book in &event.affected_books {
            self.books.emit(book, &mut deliver);
        }
    }
}

/// One of `transactions` or `transactions_proposed`: structurally
/// identical, driven by validated vs. not-yet-validated transaction
/// events respectively (§4.6).
pub struct TransactionFeed {
    strand: Strand<TransactionFeedState>,
}

impl TransactionFeed {
    pub fn new() -> Self {
        Self {
            strand: Strand::new(TransactionFeedState::default()),
        }
    }

    pub async fn sub_all(&self, subscriber: SubscriberHandle) -> SubscriberId {
        self.strand.run(move |state| state.all.connect(&subscriber)).await
    }

    pub async fn unsub_all(&self, subscriber: SubscriberHandle) -> bool {
        self.strand.run(move |state| state.all.disconnect(&subscriber)).await
    }

    pub async fn sub_account(&self, account: String, subscriber: SubscriberHandle) -> SubscriberId {
        self.strand
            .run(move |state| state.accounts.connect(account, &subscriber))
            .await
    }

    pub async fn unsub_account(&self, account: String, subscriber: SubscriberHandle) -> bool {
        self.strand
            .run(move |state| state.accounts.disconnect(&account, &subscriber))
            .await
    }

    pub async fn sub_book(&self, book: BookKey, subscriber: SubscriberHandle) -> SubscriberId {
        self.strand.run(move |state| state.books.connect(book, &subscriber)).await
    }

    pub async fn unsub_book(&self, book: BookKey, subscriber: SubscriberHandle) -> bool {
        self.strand
            .run(move |state| state.books.disconnect(&book, &subscriber))
            .await
    }

    /// Publishes `event`, serialized on this feed's strand alongside any
    /// concurrent `sub`/`unsub` calls.
    pub async fn publish(&self, event: TransactionEvent) {
        self.strand.run(move |state| state.publish(&event)).await;
    }

    pub async fn subscription_count(&self) -> u64 {
        self.strand
            .run(|state| state.all.count() + state.accounts.count() + state.books.count())
            .await
    }
}

impl Default for TransactionFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        api_version: ApiVersion,
        received: Mutex<Vec<String>>,
    }

    impl crate::subscriber::SubscriberSink for Recorder {
        fn send(&self, message: Arc<str>) -> anyhow::Result<()> {
            self.received.lock().unwrap().push(message.to_string());
            Ok(())
        }

        fn api_version(&self) -> ApiVersion {
            self.api_version
        }
    }

    fn recorder(api_version: ApiVersion) -> Arc<Recorder> {
        Arc::new(Recorder {
            api_version,
            received: Mutex::new(Vec::new()),
        })
    }

    fn event() -> TransactionEvent {
        TransactionEvent {
            v1: Arc::from("v1-rendering"),
            v2: Arc::from("v2-rendering"),
            affected_accounts: vec!["rAccount1".to_string()],
            affected_books: vec![("XRP".to_string(), "USD".to_string())],
        }
    }

    #[tokio::test]
    async fn double_subscribed_subscriber_is_notified_once() {
        let feed = TransactionFeed::new();
        let sub = recorder(ApiVersion::V1);
        feed.sub_all(sub.clone()).await;
        feed.sub_account("rAccount1".to_string(), sub.clone()).await;

        feed.publish(event()).await;

        assert_eq!(sub.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delivers_version_matching_rendering() {
        let feed = TransactionFeed::new();
        let v1_sub = recorder(ApiVersion::V1);
        let v2_sub = recorder(ApiVersion::V2);
        feed.sub_all(v1_sub.clone()).await;
        feed.sub_all(v2_sub.clone()).await;

        feed.publish(event()).await;

        assert_eq!(v1_sub.received.lock().unwrap()[0], "v1-rendering");
        assert_eq!(v2_sub.received.lock().unwrap()[0], "v2-rendering");
    }

    #[tokio::test]
    async fn book_only_subscriber_receives_matching_book_event() {
        let feed = TransactionFeed::new();
        let sub = recorder(ApiVersion::V1);
        feed.sub_book(("XRP".to_string(), "USD".to_string()), sub.clone()).await;
        feed.sub_book(("EUR".to_string(), "BTC".to_string()), recorder(ApiVersion::V1)).await;

        feed.publish(event()).await;

        assert_eq!(sub.received.lock().unwrap().len(), 1);
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
        let feed = TransactionFeed::new();
        let sub: SubscriberHandle = Arc::new(FailingSink);
        feed.sub_account("rAccount1".to_string(), sub.clone()).await;
        assert_eq!(feed.subscription_count().await, 1);

        feed.publish(event()).await;
        assert_eq!(
            feed.subscription_count().await,
            0,
            "failed subscriber pruned from the account signal after publish"
        );
    }
}
