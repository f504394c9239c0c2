//! Subscription dispatch on behalf of internal modules.
//!
//! Every handler gets its own relay subscription and task. Events are handed
//! to the handler one at a time in relay order; successes advance the
//! handler's checkpoint, failures and panics are logged and skipped.

use std::{collections::BTreeMap, panic::AssertUnwindSafe, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    checkpoint::{CheckpointError, CheckpointStore, CheckpointTracker},
    event::Event,
    filter::Filter,
    relay::{EventStream, RelayClient, SubscribeOptions},
    trust::TrustRegistry,
};

/// Consumer of a filtered event stream.
#[async_trait]
pub trait SubscriptionHandler: Send + Sync {
    /// Unique handler name; also the checkpoint key.
    fn name(&self) -> &str;

    /// Filter template. `since` is replaced by the dispatcher.
    fn filter(&self) -> Filter;

    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Delivers events to a module by POSTing the event JSON to
/// `base_url + path`. Any 2xx response counts as handled.
pub struct WebhookHandler {
    name: String,
    filter: Filter,
    url: String,
    client: reqwest::Client,
}

impl WebhookHandler {
    pub fn new(name: String, filter: Filter, url: String, client: reqwest::Client) -> Self {
        Self {
            name,
            filter,
            url,
            client,
        }
    }
}

#[async_trait]
impl SubscriptionHandler for WebhookHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter(&self) -> Filter {
        self.filter.clone()
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .with_context(|| format!("delivering to {}", self.url))?;
        resp.error_for_status()
            .with_context(|| format!("{} refused event {}", self.url, event.id))?;
        debug!(handler = %self.name, id = %event.id, "delivered");
        Ok(())
    }
}

/// One webhook handler per subscription declared by a module.
pub fn webhook_handlers(
    trust: &TrustRegistry,
    client: &reqwest::Client,
) -> Vec<Arc<dyn SubscriptionHandler>> {
    let mut handlers: Vec<Arc<dyn SubscriptionHandler>> = Vec::new();
    for module in trust.modules() {
        let Some(base_url) = module.base_url.as_deref() else {
            continue;
        };
        for sub in &module.subscriptions {
            handlers.push(Arc::new(WebhookHandler::new(
                sub.name.clone(),
                sub.filter.clone(),
                format!("{base_url}{}", sub.path),
                client.clone(),
            )));
        }
    }
    handlers
}

/// Opens and drives handler subscriptions.
pub struct Dispatcher {
    relay: Arc<dyn RelayClient>,
    store: Arc<dyn CheckpointStore>,
}

impl Dispatcher {
    pub fn new(relay: Arc<dyn RelayClient>, store: Arc<dyn CheckpointStore>) -> Self {
        Self { relay, store }
    }

    /// Start one subscription task per handler.
    ///
    /// Duplicate handler names abort the whole pass: nothing is subscribed
    /// and an empty set of tasks is returned. All checkpoints are loaded
    /// before the first subscription opens.
    pub async fn start(
        &self,
        handlers: Vec<Arc<dyn SubscriptionHandler>>,
    ) -> Result<Vec<JoinHandle<()>>, CheckpointError> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for handler in &handlers {
            *counts.entry(handler.name()).or_default() += 1;
        }
        let duplicates: Vec<&str> = counts
            .iter()
            .filter(|(_, n)| **n > 1)
            .map(|(name, _)| *name)
            .collect();
        if !duplicates.is_empty() {
            for name in &duplicates {
                warn!(handler = %name, "duplicate subscription handler");
            }
            warn!("not subscribing any handler");
            return Ok(Vec::new());
        }

        let names: Vec<String> = handlers.iter().map(|h| h.name().to_string()).collect();
        let tracker = Arc::new(CheckpointTracker::load(Arc::clone(&self.store), &names).await?);

        let mut tasks = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let mut filter = handler.filter();
            filter.since = tracker.resume_since(handler.name());
            let opts = SubscribeOptions {
                close_on_eose: false,
            };
            let stream = match self.relay.subscribe(filter.clone(), opts).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(handler = %handler.name(), error = %e, "cannot subscribe");
                    continue;
                }
            };
            info!(handler = %handler.name(), since = ?filter.since, "subscribed");
            tasks.push(tokio::spawn(drive(handler, stream, Arc::clone(&tracker))));
        }
        Ok(tasks)
    }
}

/// Feed `stream` to `handler` until the stream ends.
async fn drive(
    handler: Arc<dyn SubscriptionHandler>,
    mut stream: EventStream,
    tracker: Arc<CheckpointTracker>,
) {
    while let Some(event) = stream.next().await {
        let outcome = AssertUnwindSafe(handler.handle(&event)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => tracker.hit(handler.name(), event.created_at),
            Ok(Err(e)) => {
                warn!(handler = %handler.name(), id = %event.id, error = ?e, "handler failed")
            }
            Err(_) => error!(handler = %handler.name(), id = %event.id, "handler panicked"),
        }
    }
    info!(handler = %handler.name(), "subscription ended");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        checkpoint::{tests::wait_for, MemoryCheckpointStore, CHECKPOINT_TOLERANCE},
        event::testing::signed_event,
        relay::{Fetched, PublishError, RelayError},
        routes::tests::serve_router,
    };
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use futures_util::stream;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Relay client replaying a fixed list of events on every subscription.
    #[derive(Default)]
    pub(crate) struct FakeRelay {
        pub(crate) events: Vec<Event>,
        pub(crate) filters: Mutex<Vec<Filter>>,
    }

    #[async_trait]
    impl RelayClient for FakeRelay {
        async fn publish(&self, _event: &Event) -> Result<(), PublishError> {
            Ok(())
        }

        async fn fetch(&self, _filter: &Filter) -> Result<Fetched, RelayError> {
            Ok(Fetched::Events(vec![]))
        }

        async fn subscribe(
            &self,
            filter: Filter,
            opts: SubscribeOptions,
        ) -> Result<EventStream, RelayError> {
            assert!(!opts.close_on_eose);
            self.filters.lock().unwrap().push(filter);
            Ok(stream::iter(self.events.clone())
                .chain(stream::pending())
                .boxed())
        }
    }

    /// Records every event it sees and fails on configured ids.
    struct Recorder {
        name: String,
        filter: Filter,
        seen: mpsc::UnboundedSender<String>,
        fail: Vec<String>,
        panic_on: Vec<String>,
    }

    #[async_trait]
    impl SubscriptionHandler for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn filter(&self) -> Filter {
            self.filter.clone()
        }

        async fn handle(&self, event: &Event) -> anyhow::Result<()> {
            self.seen.send(event.id.clone()).unwrap();
            if self.panic_on.contains(&event.id) {
                panic!("boom");
            }
            if self.fail.contains(&event.id) {
                anyhow::bail!("rejected {}", event.id);
            }
            Ok(())
        }
    }

    fn recorder(name: &str) -> (Arc<dyn SubscriptionHandler>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let filter = Filter::from_value(&json!({"kinds": [1112], "since": 1})).unwrap();
        (
            Arc::new(Recorder {
                name: name.into(),
                filter,
                seen: tx,
                fail: vec![],
                panic_on: vec![],
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn since_follows_checkpoints() {
        let relay = Arc::new(FakeRelay::default());
        let store = Arc::new(MemoryCheckpointStore::default());
        store.set("resumed", 10_000).await.unwrap();
        let dispatcher = Dispatcher::new(relay.clone(), store);
        let (fresh, _) = recorder("fresh");
        let (resumed, _) = recorder("resumed");
        let tasks = dispatcher.start(vec![fresh, resumed]).await.unwrap();
        assert_eq!(tasks.len(), 2);

        let filters = relay.filters.lock().unwrap().clone();
        assert_eq!(filters[0].since, None);
        assert_eq!(filters[0].kinds, Some(vec![1112]));
        assert_eq!(filters[1].since, Some(10_000 - CHECKPOINT_TOLERANCE));
        for t in tasks {
            t.abort();
        }
    }

    #[tokio::test]
    async fn duplicate_names_subscribe_nothing() {
        let relay = Arc::new(FakeRelay::default());
        let dispatcher = Dispatcher::new(relay.clone(), Arc::new(MemoryCheckpointStore::default()));
        let (a, _) = recorder("same");
        let (b, _) = recorder("same");
        let (c, _) = recorder("other");
        let tasks = dispatcher.start(vec![a, b, c]).await.unwrap();
        assert!(tasks.is_empty());
        assert!(relay.filters.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failures_and_panics_are_skipped() {
        let events: Vec<Event> = (1..=4)
            .map(|ts| signed_event([1u8; 32], 1112, ts, vec![], "e"))
            .collect();
        let relay = Arc::new(FakeRelay {
            events: events.clone(),
            ..Default::default()
        });
        let store = Arc::new(MemoryCheckpointStore::default());
        let dispatcher = Dispatcher::new(relay, store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn SubscriptionHandler> = Arc::new(Recorder {
            name: "flaky".into(),
            filter: Filter::default(),
            seen: tx,
            fail: vec![events[1].id.clone()],
            panic_on: vec![events[2].id.clone()],
        });
        let tasks = dispatcher.start(vec![handler]).await.unwrap();

        for ev in &events {
            assert_eq!(rx.recv().await.unwrap(), ev.id);
        }
        wait_for(store.as_ref(), "flaky", 4).await;
        assert!(!tasks[0].is_finished());
        tasks[0].abort();
    }

    #[tokio::test]
    async fn webhook_handler_posts_event() {
        async fn accept(
            State(tx): State<mpsc::UnboundedSender<Value>>,
            Json(body): Json<Value>,
        ) -> StatusCode {
            let refuse = body["content"] == "refuse";
            tx.send(body).unwrap();
            if refuse {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::NO_CONTENT
            }
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let app = Router::new().route("/events", post(accept)).with_state(tx);
        let (addr, handle) = serve_router(app).await;

        let doc = json!({
            "urlx": {
                "url": format!("http://{addr}/"),
                "subscriptions": [{"name": "urlx-start", "path": "/events", "filter": {"kinds": [1112]}}]
            }
        });
        let trust = TrustRegistry::from_json(&doc.to_string(), &[]).unwrap();
        let handlers = webhook_handlers(&trust, &reqwest::Client::new());
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].name(), "urlx-start");
        assert_eq!(handlers[0].filter().kinds, Some(vec![1112]));

        let ok = signed_event([1u8; 32], 1112, 5, vec![], "fine");
        handlers[0].handle(&ok).await.unwrap();
        assert_eq!(rx.recv().await.unwrap()["id"], ok.id.as_str());

        let bad = signed_event([1u8; 32], 1112, 6, vec![], "refuse");
        assert!(handlers[0].handle(&bad).await.is_err());
        handle.abort();
    }
}
