//! Concrete feeds composed from the signal primitives (§4.6): `ledger`,
//! `transactions`, `transactions_proposed`, per-account and per-book
//! filters, `manifests`, `validations`.

pub mod registry;
pub mod signal;
pub mod simple;
pub mod strand;
pub mod transaction;

use std::sync::Arc;

pub use registry::SubscriberRegistry;
pub use simple::SimpleFeed;
pub use transaction::{BookKey, TransactionEvent, TransactionFeed};

use crate::{
    metrics::CoreMetrics,
    subscriber::{SubscriberHandle, SubscriberId},
};

/// One of the named topics a client may subscribe to (§3 "Topic").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Ledger,
    Transactions,
    TransactionsProposed,
    Account(String),
    AccountProposed(String),
    Book(BookKey),
    Manifests,
    Validations,
}

/// The set of typed publish/subscribe topics, each backed by the signal
/// primitives in [`crate::feed::signal`] (§2 "FeedEngine").
pub struct FeedEngine {
    pub ledger: SimpleFeed,
    pub manifests: SimpleFeed,
    pub validations: SimpleFeed,
    pub transactions: TransactionFeed,
    pub transactions_proposed: TransactionFeed,
    pub registry: SubscriberRegistry,
    metrics: Arc<CoreMetrics>,
}

impl FeedEngine {
    /// `metrics` is shared with the [`crate::load_balancer::LoadBalancer`]
    /// so both collaborators account into the same process-wide counters.
    pub fn new(metrics: Arc<CoreMetrics>) -> Self {
        Self {
            ledger: SimpleFeed::new(),
            manifests: SimpleFeed::new(),
            validations: SimpleFeed::new(),
            transactions: TransactionFeed::new(),
            transactions_proposed: TransactionFeed::new(),
            registry: SubscriberRegistry::new(),
            metrics,
        }
    }

    /// Routes a subscribe request to the matching feed's strand. Also
    /// tracks the subscriber in the top-level registry so its liveness
    /// accounting doesn't depend on which feeds it ended up on.
    pub async fn sub(&self, topic: Topic, subscriber: SubscriberHandle) -> SubscriberId {
        self.registry.insert(&subscriber);
        match topic {
            Topic::Ledger => self.ledger.sub(subscriber).await,
            Topic::Manifests => self.manifests.sub(subscriber).await,
            Topic::Validations => self.validations.sub(subscriber).await,
            Topic::Transactions => self.transactions.sub_all(subscriber).await,
            Topic::TransactionsProposed => self.transactions_proposed.sub_all(subscriber).await,
            Topic::Account(account) => self.transactions.sub_account(account, subscriber).await,
            Topic::AccountProposed(account) => {
                self.transactions_proposed.sub_account(account, subscriber).await
            },
            Topic::Book(book) => self.transactions.sub_book(book, subscriber).await,
        }
    }

    /// Routes an unsubscribe request. Per §5 "Ordering" (d), the caller
    /// must `.await` this before assuming the subscriber will receive no
    /// further messages on `topic` — the unsub is posted to the feed's
    /// strand and processed in order with any in-flight `pub`.
    pub async fn unsub(&self, topic: Topic, subscriber: SubscriberHandle) -> bool {
        match topic {
            Topic::Ledger => self.ledger.unsub(subscriber).await,
            Topic::Manifests => self.manifests.unsub(subscriber).await,
            Topic::Validations => self.validations.unsub(subscriber).await,
            Topic::Transactions => self.transactions.unsub_all(subscriber).await,
            Topic::TransactionsProposed => self.transactions_proposed.unsub_all(subscriber).await,
            Topic::Account(account) => self.transactions.unsub_account(account, subscriber).await,
            Topic::AccountProposed(account) => {
                self.transactions_proposed.unsub_account(account, subscriber).await
            },
            Topic::Book(book) => self.transactions.unsub_book(book, subscriber).await,
        }
    }

    /// Publishes one precomputed ledger-header message (§4.6: "the ledger
    /// feed carries one precomputed header message").
    pub async fn publish_ledger(&self, header_message: Arc<str>) {
        self.ledger.publish(header_message).await;
    }

    /// The `manifests` and `validations` feeds carry their payloads
    /// verbatim (§4.6).
    pub async fn publish_manifest(&self, message: Arc<str>) {
        self.manifests.publish(message).await;
    }

    pub async fn publish_validation(&self, message: Arc<str>) {
        self.validations.publish(message).await;
    }

    /// Publishes a validated transaction to the global/account/book
    /// signals, at most once per subscriber (§4.6).
    pub async fn publish_transaction(&self, event: TransactionEvent) {
        self.transactions.publish(event).await;
    }

    /// Mirrors `publish_transaction` for not-yet-validated transactions.
    pub async fn publish_proposed_transaction(&self, event: TransactionEvent) {
        self.transactions_proposed.publish(event).await;
    }

    /// Liveness accounting for the observability collaborator: prunes
    /// dead slots from the top-level registry, accounts the prune count
    /// into the shared metrics, and returns the surviving count (§4.4).
    pub fn prune_and_count_subscribers(&self) -> usize {
        let (pruned, remaining) = self.registry.prune_and_count();
        self.metrics.subscribers_pruned.add(pruned as u64);
        remaining
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

    fn recorder() -> Arc<Recorder> {
        Arc::new(Recorder(Mutex::new(Vec::new())))
    }

    #[tokio::test]
    async fn ledger_topic_routes_to_simple_feed() {
        let engine = FeedEngine::new(Arc::new(CoreMetrics::default()));
        let sub: SubscriberHandle = recorder();
        engine.sub(Topic::Ledger, sub.clone()).await;
        engine.publish_ledger(Arc::from("ledger closed 5")).await;
        assert_eq!(engine.ledger.count().await, 1);
    }

    #[tokio::test]
    async fn account_topic_routes_to_transactions_feed() {
        let engine = FeedEngine::new(Arc::new(CoreMetrics::default()));
        let sub: SubscriberHandle = recorder();
        engine.sub(Topic::Account("rAlice".to_string()), sub.clone()).await;

        engine
            .publish_transaction(TransactionEvent {
                v1: Arc::from("tx1"),
                v2: Arc::from("tx1-v2"),
                affected_accounts: vec!["rAlice".to_string()],
                affected_books: vec![],
            })
            .await;

        assert_eq!(engine.transactions.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn proposed_and_validated_topics_are_independent() {
        let engine = FeedEngine::new(Arc::new(CoreMetrics::default()));
        let sub: SubscriberHandle = recorder();
        engine.sub(Topic::TransactionsProposed, sub.clone()).await;
        engine.sub(Topic::Transactions, sub.clone()).await;

        engine
            .publish_proposed_transaction(TransactionEvent {
                v1: Arc::from("proposed"),
                v2: Arc::from("proposed-v2"),
                affected_accounts: vec![],
                affected_books: vec![],
            })
            .await;
        engine
            .publish_transaction(TransactionEvent {
                v1: Arc::from("validated"),
                v2: Arc::from("validated-v2"),
                affected_accounts: vec![],
                affected_books: vec![],
            })
            .await;

        let received = sub.0.lock().unwrap().clone();
        assert_eq!(received, vec!["proposed".to_string(), "validated".to_string()]);
    }

    #[tokio::test]
    async fn unsub_before_publish_suppresses_delivery() {
        let engine = FeedEngine::new(Arc::new(CoreMetrics::default()));
        let sub: SubscriberHandle = recorder();
        engine.sub(Topic::Validations, sub.clone()).await;
        assert!(engine.unsub(Topic::Validations, sub.clone()).await);
        engine.publish_validation(Arc::from("v")).await;
        assert!(sub.0.lock().unwrap().is_empty());
    }
}
