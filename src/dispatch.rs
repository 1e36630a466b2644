//! Request dispatch (boundary only, §4.7): a fixed command table built
//! once at startup, cost weighting, and routing between local handlers,
//! the feed engine's subscribe/unsubscribe, and
//! [`crate::load_balancer::LoadBalancer::forward_to_rippled`].
//!
//! The per-RPC handler *bodies* (`doTx`, `doAccountInfo`, ...) are out of
//! scope (§1 Non-goals); this module supplies the pluggable table,
//! cost-policy application, and the subscribe/unsubscribe wiring the spec
//! does assign to the core.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use serde_json::{json, Value};

use crate::{
    backend::Backend,
    error::ClioError,
    feed::{BookKey, FeedEngine, Topic},
    load_balancer::LoadBalancer,
    subscriber::SubscriberHandle,
};

/// `X-User` / client-ip / admin identity threaded through to
/// `forwardToRippled` (§1 "records whether a request is admin").
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_ip: String,
    pub is_admin: bool,
}

/// Everything a handler needs: the parsed request, identity, and
/// references to the collaborators named in §4.7 ("storage backend, the
/// feed engine, and — for subscribe/unsubscribe — the subscriber
/// handle").
pub struct HandlerRequest<'a> {
    pub params: &'a Value,
    pub ctx: &'a RequestContext,
    pub backend: &'a dyn Backend,
    pub feed: &'a FeedEngine,
    pub subscriber: Option<SubscriberHandle>,
}

pub type HandlerResult = Result<Value, ClioError>;
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type HandlerFn =
    Arc<dyn for<'a> Fn(HandlerRequest<'a>) -> BoxFuture<'a, HandlerResult> + Send + Sync>;

/// Cost policy for a locally-handled command (§4.7.1, "resolved from
/// original source"'s upstream session-handler switch).
#[derive(Debug, Clone, Copy)]
pub enum CostPolicy {
    Fixed(u64),
    /// Count of `field`'s array in `result`; `1` if absent.
    CountField(&'static str),
    /// `weight` times the count of `field`'s array in `result`; `1` if
    /// absent.
    WeightedCountField(&'static str, u64),
    /// Sum of the two fields' array counts; `1` if *neither* is present
    /// (`account_currencies`: `send_currencies` + `receive_currencies`).
    SumFields(&'static str, &'static str),
}

fn array_len(response: &Value, field: &str) -> Option<usize> {
    response
        .get("result")
        .and_then(|r| r.get(field))
        .and_then(Value::as_array)
        .map(Vec::len)
}

impl CostPolicy {
    pub fn cost(&self, response: &Value) -> u64 {
        match self {
            Self::Fixed(c) => *c,
            Self::CountField(field) => array_len(response, field).unwrap_or(1) as u64,
            Self::WeightedCountField(field, weight) => match array_len(response, field) {
                Some(n) => weight * n as u64,
                None => 1,
            },
            Self::SumFields(a, b) => match (array_len(response, a), array_len(response, b)) {
                (None, None) => 1,
                (a, b) => (a.unwrap_or(0) + b.unwrap_or(0)) as u64,
            },
        }
    }
}

struct CommandEntry {
    handler: HandlerFn,
    cost: CostPolicy,
}

/// Fixed string→handler table built once at startup (§9 "Global command
/// table").
pub struct CommandTable {
    commands: HashMap<&'static str, CommandEntry>,
}

/// Methods this process intentionally proxies even though they are not
/// locally indexable, distinct from genuinely unrecognized commands
/// (§6, "plus any method not in that set which is forwarded"; the
/// original source's `shouldForwardToP2p` predicate — see DESIGN.md's
/// resolution of this Open Question). A request naming anything outside
/// both this set and the local command table is `UnknownCommand`.
const FORWARDABLE_METHODS: &[&str] = &[
    "submit",
    "submit_multisigned",
    "sign",
    "sign_for",
    "fee",
    "ping",
    "random",
    "path_find",
    "ripple_path_find",
    "gateway_balances",
    "noripple_check",
    "deposit_authorized",
    "nft_buy_offers",
    "nft_sell_offers",
    "nft_info",
    "server_state",
];

/// Cost for a forwarded request: `1` by default; the original's
/// `shouldForwardToP2p` branch carries a fixed cost of `10`, kept here as
/// policy attached to the table rather than pinned into the contract
/// (§9 "P2P forwarding flag").
pub const FORWARDED_DEFAULT_COST: u64 = 1;
pub const FORWARDED_P2P_COST: u64 = 10;

impl CommandTable {
    /// Registers every locally-indexable command from §6 with its cost
    /// policy from §4.7.1. `subscribe`/`unsubscribe` get real handlers;
    /// the remaining entries are stubs, since their RPC bodies are out of
    /// scope (§1 Non-goals) — the table's job is routing and costing, not
    /// ledger semantics.
    pub fn build() -> Self {
        let mut commands = HashMap::new();

        let mut register = |name: &'static str, cost: CostPolicy, handler: HandlerFn| {
            commands.insert(name, CommandEntry { handler, cost });
        };

        register("tx", CostPolicy::Fixed(1), stub_handler());
        register("account_tx", CostPolicy::CountField("transactions"), stub_handler());
        register("ledger", CostPolicy::CountField("transactions"), stub_handler());
        register("ledger_entry", CostPolicy::Fixed(1), stub_handler());
        register("ledger_range", CostPolicy::Fixed(1), stub_handler());
        register("ledger_data", CostPolicy::WeightedCountField("objects", 4), stub_handler());
        register("account_info", CostPolicy::Fixed(1), stub_handler());
        register("book_offers", CostPolicy::WeightedCountField("offers", 4), stub_handler());
        register("account_channels", CostPolicy::CountField("channels"), stub_handler());
        register("account_lines", CostPolicy::CountField("lines"), stub_handler());
        register(
            "account_currencies",
            CostPolicy::SumFields("send_currencies", "receive_currencies"),
            stub_handler(),
        );
        register("account_offers", CostPolicy::CountField("offers"), stub_handler());
        register("account_objects", CostPolicy::CountField("objects"), stub_handler());
        register("channel_authorize", CostPolicy::Fixed(1), stub_handler());
        register("channel_verify", CostPolicy::Fixed(1), stub_handler());
        register("server_info", CostPolicy::Fixed(1), stub_handler());
        register("feature", CostPolicy::Fixed(1), stub_handler());
        register("subscribe", CostPolicy::Fixed(1), Arc::new(|req| Box::pin(handle_subscribe(req))));
        register(
            "unsubscribe",
            CostPolicy::Fixed(1),
            Arc::new(|req| Box::pin(handle_unsubscribe(req))),
        );

        Self { commands }
    }

    pub fn is_locally_handled(&self, command: &str) -> bool {
        self.commands.contains_key(command)
    }

    pub fn is_forwardable(&self, command: &str) -> bool {
        FORWARDABLE_METHODS.contains(&command)
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::build()
    }
}

fn stub_handler() -> HandlerFn {
    Arc::new(|_req| Box::pin(async { Ok(json!({ "result": {} })) }))
}

async fn handle_subscribe(req: HandlerRequest<'_>) -> HandlerResult {
    let subscriber = req
        .subscriber
        .clone()
        .ok_or_else(|| ClioError::BadRequest("subscribe requires a connection".into()))?;
    for topic in topics_from_request(req.params)? {
        req.feed.sub(topic, subscriber.clone()).await;
    }
    Ok(json!({ "result": {} }))
}

async fn handle_unsubscribe(req: HandlerRequest<'_>) -> HandlerResult {
    let subscriber = req
        .subscriber
        .clone()
        .ok_or_else(|| ClioError::BadRequest("unsubscribe requires a connection".into()))?;
    for topic in topics_from_request(req.params)? {
        req.feed.unsub(topic, subscriber.clone()).await;
    }
    Ok(json!({ "result": {} }))
}

/// Parses `{"streams":[...],"accounts":[...],"books":[...],"accounts_proposed":[...]}`
/// (§6) into the [`Topic`] set it names.
fn topics_from_request(params: &Value) -> Result<Vec<Topic>, ClioError> {
    let mut topics = Vec::new();

    if let Some(streams) = params.get("streams").and_then(Value::as_array) {
        for stream in streams {
            let name = stream
                .as_str()
                .ok_or_else(|| ClioError::BadRequest("streams entries must be strings".into()))?;
            topics.push(match name {
                "ledger" => Topic::Ledger,
                "transactions" => Topic::Transactions,
                "transactions_proposed" => Topic::TransactionsProposed,
                "manifests" => Topic::Manifests,
                "validations" => Topic::Validations,
                other => return Err(ClioError::BadRequest(format!("unknown stream: {other}"))),
            });
        }
    }

    if let Some(accounts) = params.get("accounts").and_then(Value::as_array) {
        for account in accounts {
            let account = account
                .as_str()
                .ok_or_else(|| ClioError::BadRequest("accounts entries must be strings".into()))?;
            topics.push(Topic::Account(account.to_string()));
        }
    }

    if let Some(accounts) = params.get("accounts_proposed").and_then(Value::as_array) {
        for account in accounts {
            let account = account.as_str().ok_or_else(|| {
                ClioError::BadRequest("accounts_proposed entries must be strings".into())
            })?;
            topics.push(Topic::AccountProposed(account.to_string()));
        }
    }

    if let Some(books) = params.get("books").and_then(Value::as_array) {
        for book in books {
            let base = book
                .get("taker_gets")
                .and_then(Value::as_str)
                .ok_or_else(|| ClioError::BadRequest("book missing taker_gets".into()))?;
            let counter = book
                .get("taker_pays")
                .and_then(Value::as_str)
                .ok_or_else(|| ClioError::BadRequest("book missing taker_pays".into()))?;
            topics.push(Topic::Book((base.to_string(), counter.to_string())));
        }
    }

    Ok(topics)
}

/// Result of dispatching one request: the response body paired with its
/// cost (§4.7).
pub struct DispatchOutcome {
    pub response: Value,
    pub cost: u64,
}

/// Dispatches one already-parsed JSON-RPC request (§4.7). `subscriber` is
/// `None` for transports that don't carry a persistent connection (e.g. a
/// plain HTTP POST), in which case `subscribe`/`unsubscribe` fail with
/// `BadRequest`.
pub async fn dispatch(
    table: &CommandTable,
    load_balancer: &LoadBalancer,
    backend: &dyn Backend,
    feed: &FeedEngine,
    request: &Value,
    ctx: &RequestContext,
    subscriber: Option<SubscriberHandle>,
) -> DispatchOutcome {
    let Some(command) = request.get("command").and_then(Value::as_str) else {
        return DispatchOutcome {
            response: json!({ "error": "Unknown command: " }),
            cost: 1,
        };
    };

    if let Some(entry) = table.commands.get(command) {
        let handler_request = HandlerRequest {
            params: request,
            ctx,
            backend,
            feed,
            subscriber,
        };
        return match (entry.handler)(handler_request).await {
            Ok(response) => {
                let cost = entry.cost.cost(&response);
                DispatchOutcome { response, cost }
            },
            Err(e) => DispatchOutcome {
                response: json!({ "error": e.rpc_code(), "error_message": e.to_string() }),
                cost: 1,
            },
        };
    }

    if table.is_forwardable(command) {
        return match load_balancer.forward_to_rippled(request, &ctx.client_ip, ctx.is_admin).await
        {
            Ok(response) => DispatchOutcome { response, cost: FORWARDED_DEFAULT_COST },
            Err(e) => DispatchOutcome {
                response: json!({ "error": e.rpc_code(), "error_message": e.to_string() }),
                cost: 1,
            },
        };
    }

    DispatchOutcome {
        response: json!({ "error": format!("Unknown command: {command}") }),
        cost: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cost_policy_book_offers_weights_by_four() {
        let response = json!({ "result": { "offers": [1, 2, 3] } });
        assert_eq!(CostPolicy::WeightedCountField("offers", 4).cost(&response), 12);
    }

    #[test]
    fn cost_policy_ledger_data_weights_by_four() {
        let response = json!({ "result": { "objects": [1, 2] } });
        assert_eq!(CostPolicy::WeightedCountField("objects", 4).cost(&response), 8);
    }

    #[test]
    fn cost_policy_account_tx_counts_transactions() {
        let response = json!({ "result": { "transactions": [1, 2, 3, 4] } });
        assert_eq!(CostPolicy::CountField("transactions").cost(&response), 4);
    }

    #[test]
    fn cost_policy_defaults_to_one_when_field_absent() {
        let response = json!({ "result": {} });
        assert_eq!(CostPolicy::CountField("transactions").cost(&response), 1);
        assert_eq!(CostPolicy::WeightedCountField("objects", 4).cost(&response), 1);
    }

    #[test]
    fn cost_policy_account_currencies_sums_both_fields() {
        let response = json!({ "result": { "send_currencies": [1], "receive_currencies": [1, 2] } });
        assert_eq!(CostPolicy::SumFields("send_currencies", "receive_currencies").cost(&response), 3);
        let empty = json!({ "result": {} });
        assert_eq!(CostPolicy::SumFields("send_currencies", "receive_currencies").cost(&empty), 1);
    }

    #[test]
    fn topics_from_request_parses_all_kinds() {
        let params = json!({
            "streams": ["ledger", "transactions"],
            "accounts": ["rAlice"],
            "accounts_proposed": ["rBob"],
            "books": [{"taker_gets": "XRP", "taker_pays": "USD"}],
        });
        let topics = topics_from_request(&params).unwrap();
        assert_eq!(topics.len(), 5);
        assert!(topics.contains(&Topic::Ledger));
        assert!(topics.contains(&Topic::Account("rAlice".to_string())));
        assert!(topics.contains(&Topic::AccountProposed("rBob".to_string())));
        assert!(topics.contains(&Topic::Book(("XRP".to_string(), "USD".to_string()))));
    }

    #[tokio::test]
    async fn unknown_command_produces_exact_error_shape() {
        let table = CommandTable::build();
        let metrics = Arc::new(crate::metrics::CoreMetrics::default());
        let lb = LoadBalancer::new(vec![], None, metrics.clone(), tokio_util::sync::CancellationToken::new());
        let feed = FeedEngine::new(metrics);
        let backend = crate::backend::NullBackend;
        let ctx = RequestContext { client_ip: "127.0.0.1".into(), is_admin: false };

        let outcome = dispatch(
            &table,
            &lb,
            &backend,
            &feed,
            &json!({"command": "wat"}),
            &ctx,
            None,
        )
        .await;

        assert_eq!(outcome.response, json!({ "error": "Unknown command: wat" }));
    }

    #[tokio::test]
    async fn subscribe_registers_topics_and_unsubscribe_removes_them() {
        struct Noop;
        impl crate::subscriber::SubscriberSink for Noop {
            fn send(&self, _message: std::sync::Arc<str>) -> anyhow::Result<()> {
                Ok(())
            }
            fn api_version(&self) -> crate::subscriber::ApiVersion {
                crate::subscriber::ApiVersion::V1
            }
        }

        let table = CommandTable::build();
        let metrics = Arc::new(crate::metrics::CoreMetrics::default());
        let lb = LoadBalancer::new(vec![], None, metrics.clone(), tokio_util::sync::CancellationToken::new());
        let feed = FeedEngine::new(metrics);
        let backend = crate::backend::NullBackend;
        let ctx = RequestContext { client_ip: "127.0.0.1".into(), is_admin: false };
        let subscriber: SubscriberHandle = Arc::new(Noop);

        dispatch(
            &table,
            &lb,
            &backend,
            &feed,
            &json!({"command": "subscribe", "streams": ["ledger"]}),
            &ctx,
            Some(subscriber.clone()),
        )
        .await;
        assert_eq!(feed.ledger.count().await, 1);

        dispatch(
            &table,
            &lb,
            &backend,
            &feed,
            &json!({"command": "unsubscribe", "streams": ["ledger"]}),
            &ctx,
            Some(subscriber.clone()),
        )
        .await;
        assert_eq!(feed.ledger.count().await, 0);
    }
}
