//! Relay network client: publishing, one-shot fetches and live
//! subscriptions over NIP-01 WebSockets.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{
    future::join_all,
    stream::{self, BoxStream},
    SinkExt, StreamExt,
};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
    time::{sleep, timeout, timeout_at, Instant},
};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::{
    client_async_tls,
    tungstenite::{self, client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    event::{verify_event, Event},
    filter::Filter,
};

/// Events buffered per subscription before relay reads back off.
const SUBSCRIPTION_BUFFER: usize = 256;
/// Event ids remembered per subscription for de-duplication.
const SEEN_CAPACITY: usize = 10_000;

pub type EventStream = BoxStream<'static, Event>;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// No relay acknowledged the event.
    #[error("did not publish to any relay")]
    NoRelays,
    #[error("publish failed: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("no relays configured")]
    NoRelays,
    #[error("invalid relay url `{0}`")]
    InvalidUrl(String),
    #[error("relay timed out")]
    Timeout,
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("socks proxy: {0}")]
    Socks(#[from] tokio_socks::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a one-shot fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    /// Matching raw events, newest first.
    Events(Vec<Value>),
    /// A relay answered the request with a `NOTICE` instead of results.
    Notice(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// End the stream once every relay has sent `EOSE`.
    pub close_on_eose: bool,
}

/// What the gateway needs from the relay network.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Publish a validated event.
    async fn publish(&self, event: &Event) -> Result<(), PublishError>;

    /// Collect stored events matching `filter`. Only notices sent on this
    /// request's own connections are reported.
    async fn fetch(&self, filter: &Filter) -> Result<Fetched, RelayError>;

    /// Open a subscription yielding matching events in relay order.
    async fn subscribe(
        &self,
        filter: Filter,
        opts: SubscribeOptions,
    ) -> Result<EventStream, RelayError>;
}

/// Messages a relay may send.
#[derive(Debug, Clone, PartialEq)]
enum RelayMessage {
    Event { sub_id: String, event: Value },
    Eose(String),
    Closed { sub_id: String, reason: String },
    Notice(String),
    Ok { id: String, accepted: bool, reason: String },
}

fn parse_relay_message(txt: &str) -> Option<RelayMessage> {
    let val: Value = serde_json::from_str(txt).ok()?;
    let arr = val.as_array()?;
    let text = |i: usize| arr.get(i).and_then(Value::as_str).map(String::from);
    match arr.first()?.as_str()? {
        "EVENT" => Some(RelayMessage::Event {
            sub_id: text(1)?,
            event: arr.get(2)?.clone(),
        }),
        "EOSE" => Some(RelayMessage::Eose(text(1)?)),
        "CLOSED" => Some(RelayMessage::Closed {
            sub_id: text(1)?,
            reason: text(2).unwrap_or_default(),
        }),
        "NOTICE" => Some(RelayMessage::Notice(text(1)?)),
        "OK" => Some(RelayMessage::Ok {
            id: text(1)?,
            accepted: arr.get(2)?.as_bool()?,
            reason: text(3).unwrap_or_default(),
        }),
        _ => None,
    }
}

/// Parse and verify a raw event, dropping anything forged.
fn authentic(raw: &Value) -> Option<Event> {
    let ev: Event = serde_json::from_value(raw.clone()).ok()?;
    match verify_event(&ev) {
        Ok(()) => Some(ev),
        Err(e) => {
            debug!(id = %ev.id, error = %e, "dropping unverifiable event");
            None
        }
    }
}

fn log_notice(relay: &str, notice: &str) {
    info!(relay, notice, "relay notice");
}

/// Bounded set of recently seen event ids.
#[derive(Default)]
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenIds {
    /// Record `id`, returning false when it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == SEEN_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

type RelaySocket = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<RelaySocket, RelayError> {
    let invalid = || RelayError::InvalidUrl(relay.to_string());
    let url = Url::parse(relay).map_err(|_| invalid())?;
    let host = url.host_str().ok_or_else(invalid)?;
    let port = url.port_or_known_default().ok_or_else(invalid)?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}

/// [`RelayClient`] talking to a fixed set of relays. Every operation opens
/// its own connections.
pub struct WsRelayPool {
    relays: Vec<String>,
    tor_socks: Option<String>,
    timeout: Duration,
    reconnect_delay: Duration,
    next_sub: AtomicU64,
}

impl WsRelayPool {
    pub fn new(relays: Vec<String>, tor_socks: Option<String>, timeout: Duration) -> Self {
        Self {
            relays,
            tor_socks,
            timeout,
            reconnect_delay: Duration::from_secs(5),
            next_sub: AtomicU64::new(0),
        }
    }

    /// Delay before a dropped live subscription reconnects.
    #[cfg(test)]
    fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    fn next_sub_id(&self) -> String {
        format!("relaygate-{}", self.next_sub.fetch_add(1, Ordering::Relaxed))
    }

    /// Send an `EVENT` and wait for the matching `OK`.
    async fn publish_one(&self, relay: &str, frame: &str, id: &str) -> Result<bool, RelayError> {
        let attempt = async {
            let mut ws = connect_ws(relay, self.tor_socks.as_deref()).await?;
            ws.send(Message::Text(frame.to_string())).await?;
            while let Some(msg) = ws.next().await {
                let Message::Text(txt) = msg? else {
                    continue;
                };
                match parse_relay_message(&txt) {
                    Some(RelayMessage::Ok {
                        id: acked,
                        accepted,
                        reason,
                    }) if acked == id => {
                        if !accepted {
                            warn!(relay, %reason, "event rejected by relay");
                        }
                        let _ = ws.close(None).await;
                        return Ok(accepted);
                    }
                    Some(RelayMessage::Notice(notice)) => log_notice(relay, &notice),
                    _ => {}
                }
            }
            Ok::<_, RelayError>(false)
        };
        timeout(self.timeout, attempt)
            .await
            .map_err(|_| RelayError::Timeout)?
    }

    /// Send a `REQ` and collect events until `EOSE`, `CLOSED` or the
    /// deadline. A `NOTICE` ends the request early.
    async fn fetch_one(&self, relay: &str, sub_id: &str, req: &str) -> Result<Fetched, RelayError> {
        let deadline = Instant::now() + self.timeout;
        let mut ws = timeout_at(deadline, connect_ws(relay, self.tor_socks.as_deref()))
            .await
            .map_err(|_| RelayError::Timeout)??;
        ws.send(Message::Text(req.to_string())).await?;
        let mut events = Vec::new();
        let mut notice = None;
        loop {
            let msg = match timeout_at(deadline, ws.next()).await {
                Ok(Some(msg)) => msg?,
                Ok(None) => break,
                Err(_) => {
                    warn!(relay, collected = events.len(), "fetch timed out before EOSE");
                    break;
                }
            };
            let Message::Text(txt) = msg else {
                continue;
            };
            match parse_relay_message(&txt) {
                Some(RelayMessage::Event { sub_id: s, event }) if s == sub_id => events.push(event),
                Some(RelayMessage::Eose(s)) if s == sub_id => break,
                Some(RelayMessage::Closed { sub_id: s, reason }) if s == sub_id => {
                    debug!(relay, %reason, "fetch closed by relay");
                    break;
                }
                Some(RelayMessage::Notice(reason)) => {
                    log_notice(relay, &reason);
                    notice = Some(reason);
                    break;
                }
                _ => {}
            }
        }
        let _ = ws
            .send(Message::Text(json!(["CLOSE", sub_id]).to_string()))
            .await;
        let _ = ws.close(None).await;
        Ok(match notice {
            Some(reason) => Fetched::Notice(reason),
            None => Fetched::Events(events),
        })
    }
}

#[async_trait]
impl RelayClient for WsRelayPool {
    async fn publish(&self, event: &Event) -> Result<(), PublishError> {
        if self.relays.is_empty() {
            warn!(id = %event.id, "no relays configured");
            return Err(PublishError::NoRelays);
        }
        let frame = json!(["EVENT", event]).to_string();
        let results = join_all(
            self.relays
                .iter()
                .map(|relay| self.publish_one(relay, &frame, &event.id)),
        )
        .await;
        let mut accepted = 0;
        for (relay, result) in self.relays.iter().zip(results) {
            match result {
                Ok(true) => accepted += 1,
                Ok(false) => {}
                Err(e) => warn!(%relay, error = %e, "publish failed"),
            }
        }
        info!(id = %event.id, accepted, relays = self.relays.len(), "published");
        if accepted == 0 {
            return Err(PublishError::NoRelays);
        }
        Ok(())
    }

    async fn fetch(&self, filter: &Filter) -> Result<Fetched, RelayError> {
        if self.relays.is_empty() {
            return Err(RelayError::NoRelays);
        }
        let sub_id = self.next_sub_id();
        let req = json!(["REQ", sub_id, filter]).to_string();
        let results = join_all(
            self.relays
                .iter()
                .map(|relay| self.fetch_one(relay, &sub_id, &req)),
        )
        .await;

        let mut seen = HashSet::new();
        let mut events: Vec<(u64, Value)> = Vec::new();
        let mut last_err = None;
        let mut failures = 0;
        for (relay, result) in self.relays.iter().zip(results) {
            match result {
                Ok(Fetched::Notice(reason)) => return Ok(Fetched::Notice(reason)),
                Ok(Fetched::Events(raw)) => {
                    for value in raw {
                        let Some(ev) = authentic(&value) else {
                            continue;
                        };
                        if seen.insert(ev.id) {
                            events.push((ev.created_at, value));
                        }
                    }
                }
                Err(e) => {
                    warn!(%relay, error = %e, "fetch failed");
                    failures += 1;
                    last_err = Some(e);
                }
            }
        }
        if failures == self.relays.len() {
            return Err(last_err.unwrap_or(RelayError::NoRelays));
        }
        // Newest first, like relays answer.
        events.sort_by(|a, b| b.0.cmp(&a.0));
        if let Some(limit) = filter.limit {
            events.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        Ok(Fetched::Events(
            events.into_iter().map(|(_, v)| v).collect(),
        ))
    }

    async fn subscribe(
        &self,
        filter: Filter,
        opts: SubscribeOptions,
    ) -> Result<EventStream, RelayError> {
        if self.relays.is_empty() {
            return Err(RelayError::NoRelays);
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let seen = Arc::new(Mutex::new(SeenIds::default()));
        let sub_id = self.next_sub_id();
        for relay in &self.relays {
            let sub = RelaySubscription {
                relay: relay.clone(),
                tor_socks: self.tor_socks.clone(),
                sub_id: sub_id.clone(),
                filter: filter.clone(),
                opts,
                latest: 0,
                tx: tx.clone(),
                seen: Arc::clone(&seen),
                reconnect_delay: self.reconnect_delay,
            };
            tokio::spawn(sub.run());
        }
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|ev| (ev, rx))
        })
        .boxed())
    }
}

/// Why a single relay connection stopped streaming.
enum Ended {
    Eose,
    ReceiverDropped,
    Disconnected,
}

/// One relay's share of a subscription.
struct RelaySubscription {
    relay: String,
    tor_socks: Option<String>,
    sub_id: String,
    filter: Filter,
    opts: SubscribeOptions,
    /// Newest `created_at` seen on this relay, used to narrow reconnects.
    latest: u64,
    tx: mpsc::Sender<Event>,
    seen: Arc<Mutex<SeenIds>>,
    reconnect_delay: Duration,
}

impl RelaySubscription {
    async fn run(mut self) {
        loop {
            match self.stream_once().await {
                Ok(Ended::Eose) | Ok(Ended::ReceiverDropped) => return,
                Ok(Ended::Disconnected) => info!(relay = %self.relay, "relay dropped subscription"),
                Err(e) => warn!(relay = %self.relay, error = %e, "subscription failed"),
            }
            if self.opts.close_on_eose || self.tx.is_closed() {
                return;
            }
            sleep(self.reconnect_delay).await;
            if self.latest > 0 {
                self.filter.since = Some(self.filter.since.unwrap_or(0).max(self.latest));
            }
        }
    }

    async fn stream_once(&mut self) -> Result<Ended, RelayError> {
        let mut ws = connect_ws(&self.relay, self.tor_socks.as_deref()).await?;
        let req = json!(["REQ", self.sub_id, self.filter]).to_string();
        ws.send(Message::Text(req)).await?;
        debug!(relay = %self.relay, sub_id = %self.sub_id, "subscription opened");
        while let Some(msg) = ws.next().await {
            let Message::Text(txt) = msg? else {
                continue;
            };
            match parse_relay_message(&txt) {
                Some(RelayMessage::Event { sub_id, event }) if sub_id == self.sub_id => {
                    let Some(ev) = authentic(&event) else {
                        continue;
                    };
                    self.latest = self.latest.max(ev.created_at);
                    let fresh = self
                        .seen
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(&ev.id);
                    if fresh && self.tx.send(ev).await.is_err() {
                        return Ok(Ended::ReceiverDropped);
                    }
                }
                Some(RelayMessage::Eose(sub_id)) if sub_id == self.sub_id => {
                    if self.opts.close_on_eose {
                        let _ = ws
                            .send(Message::Text(json!(["CLOSE", self.sub_id]).to_string()))
                            .await;
                        let _ = ws.close(None).await;
                        return Ok(Ended::Eose);
                    }
                }
                Some(RelayMessage::Closed { sub_id, reason }) if sub_id == self.sub_id => {
                    warn!(relay = %self.relay, %reason, "subscription closed by relay");
                    return Ok(Ended::Disconnected);
                }
                Some(RelayMessage::Notice(notice)) => log_notice(&self.relay, &notice),
                _ => {}
            }
        }
        Ok(Ended::Disconnected)
    }
}
