// Typed publish/subscribe bus connecting the stream tap to plugins
//
// Fan-out is synchronous: `publish` invokes sync subscribers inline in
// descending priority order and detaches async subscribers onto the runtime,
// so a publisher is never suspended. `publish_async` awaits async
// subscribers for callers that need completion (drains, tests).
//
// Subscriber failures never propagate to the publisher. Each failure is
// converted into a synthetic `error` event carrying the cause, the failing
// kind, and the handler id. A subscriber that fails while handling an
// `error` event is muted for the error fan-out; the failure is still
// counted.

use crate::events::{Event, EventKind};
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

pub type SyncHandler = Box<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;
pub type AsyncHandler =
    Box<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type EventFilter = Box<dyn Fn(&Event) -> bool + Send + Sync>;

pub enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

impl Handler {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Handler::Sync(Box::new(f))
    }

    pub fn asynchronous<F>(f: F) -> Self
    where
        F: Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        Handler::Async(Box::new(f))
    }
}

/// What a subscriber listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    Kind(EventKind),
    /// Receives every event in addition to kind-specific subscribers
    Wildcard,
}

impl Subscription {
    fn matches(&self, kind: EventKind) -> bool {
        match self {
            Subscription::Wildcard => true,
            Subscription::Kind(k) => *k == kind,
        }
    }

    fn label(&self) -> String {
        match self {
            Subscription::Wildcard => "*".to_string(),
            Subscription::Kind(k) => k.as_str().to_string(),
        }
    }
}

pub struct SubscribeOptions {
    pub filter: Option<EventFilter>,
    /// Deliver the replay ring's history before live events
    pub replay: bool,
    /// Higher runs earlier within a publish; ties in registration order
    pub priority: i32,
    /// Auto-unsubscribe after the first delivered event
    pub once: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        SubscribeOptions {
            filter: None,
            replay: false,
            priority: 0,
            once: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
}

struct Subscriber {
    id: u64,
    seq: u64,
    subscription: Subscription,
    priority: i32,
    once: bool,
    spent: AtomicBool,
    /// Set after the subscriber fails while handling an `error` event;
    /// muted subscribers are skipped on the error fan-out
    muted_for_errors: AtomicBool,
    removed: AtomicBool,
    handler: Handler,
    filter: Option<EventFilter>,
}

impl Subscriber {
    /// Kind match plus mute/removal/filter checks. Filter misses are
    /// skips, not errors.
    fn wants(&self, event: &Event) -> bool {
        if self.removed.load(Ordering::Acquire) {
            return false;
        }
        if !self.subscription.matches(event.kind) {
            return false;
        }
        if event.kind == EventKind::Error && self.muted_for_errors.load(Ordering::Acquire) {
            return false;
        }
        match &self.filter {
            Some(f) => f(event),
            None => true,
        }
    }

    /// For `once` subscribers, arm exactly one delivery.
    fn claim_delivery(&self) -> bool {
        if self.once {
            !self.spent.swap(true, Ordering::AcqRel)
        } else {
            true
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BusMetrics {
    pub total_published: u64,
    pub per_kind_counts: HashMap<String, u64>,
    pub listener_counts: HashMap<String, usize>,
    pub error_count: u64,
}

struct ReplayRing {
    capacity: usize,
    events: VecDeque<Event>,
}

pub struct EventBus {
    session_id: String,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    replay: Mutex<Option<ReplayRing>>,
    /// Detached async handler tasks, awaited by `drain`
    spawned: Mutex<Vec<JoinHandle<()>>>,
    per_kind: Mutex<HashMap<&'static str, u64>>,
    total_published: AtomicU64,
    error_count: AtomicU64,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

impl EventBus {
    pub fn new(session_id: impl Into<String>) -> Arc<Self> {
        Arc::new(EventBus {
            session_id: session_id.into(),
            subscribers: Mutex::new(Vec::new()),
            replay: Mutex::new(None),
            spawned: Mutex::new(Vec::new()),
            per_kind: Mutex::new(HashMap::new()),
            total_published: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Activate a bounded ring buffer of recent events. Subscribers created
    /// with `replay: true` receive the buffered history first.
    pub fn enable_replay(&self, capacity: usize) {
        let mut replay = self.replay.lock().unwrap();
        *replay = Some(ReplayRing {
            capacity,
            events: VecDeque::with_capacity(capacity),
        });
    }

    pub fn subscribe(
        self: &Arc<Self>,
        subscription: Subscription,
        handler: Handler,
        options: SubscribeOptions,
    ) -> SubscriptionHandle {
        let subscriber = Arc::new(Subscriber {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            subscription,
            priority: options.priority,
            once: options.once,
            spent: AtomicBool::new(false),
            muted_for_errors: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            handler,
            filter: options.filter,
        });
        let handle = SubscriptionHandle { id: subscriber.id };

        if options.replay {
            let history: Vec<Event> = self
                .replay
                .lock()
                .unwrap()
                .as_ref()
                .map(|ring| ring.events.iter().cloned().collect())
                .unwrap_or_default();
            for event in history {
                self.deliver(&subscriber, &event);
            }
        }

        self.subscribers.lock().unwrap().push(subscriber);
        handle
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut subs = self.subscribers.lock().unwrap();
        if let Some(sub) = subs.iter().find(|s| s.id == handle.id) {
            sub.removed.store(true, Ordering::Release);
        }
        subs.retain(|s| s.id != handle.id);
    }

    /// Drop every subscriber registered for exactly this kind. Wildcard
    /// subscribers are unaffected.
    pub fn remove_all_for(&self, kind: EventKind) {
        let mut subs = self.subscribers.lock().unwrap();
        for sub in subs.iter() {
            if sub.subscription == Subscription::Kind(kind) {
                sub.removed.store(true, Ordering::Release);
            }
        }
        subs.retain(|s| s.subscription != Subscription::Kind(kind));
    }

    /// Synchronous fan-out. Sync subscribers run inline; async subscribers
    /// are detached onto the runtime. The caller is never suspended and
    /// never sees a subscriber failure.
    pub fn publish(self: &Arc<Self>, event: Event) {
        self.record_published(&event);
        for subscriber in self.targets(&event) {
            self.deliver(&subscriber, &event);
        }
        self.prune();
    }

    /// Fan-out that awaits async subscribers. Individual failures are
    /// isolated exactly as in `publish`; the aggregate never fails.
    pub async fn publish_async(self: &Arc<Self>, event: Event) {
        self.record_published(&event);
        for subscriber in self.targets(&event) {
            if !subscriber.wants(&event) || !subscriber.claim_delivery() {
                continue;
            }
            match &subscriber.handler {
                Handler::Sync(f) => {
                    if let Err(err) = f(&event) {
                        self.on_handler_failure(subscriber.id, event.kind, &err);
                    }
                }
                Handler::Async(f) => {
                    if let Err(err) = f(event.clone()).await {
                        self.on_handler_failure(subscriber.id, event.kind, &err);
                    }
                }
            }
        }
        self.prune();
    }

    /// Await all detached async handler invocations issued so far.
    pub async fn drain(&self) {
        loop {
            let tasks: Vec<JoinHandle<()>> = {
                let mut spawned = self.spawned.lock().unwrap();
                spawned.drain(..).collect()
            };
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                let _ = task.await;
            }
        }
    }

    pub fn metrics(&self) -> BusMetrics {
        let mut listener_counts: HashMap<String, usize> = HashMap::new();
        for sub in self.subscribers.lock().unwrap().iter() {
            *listener_counts.entry(sub.subscription.label()).or_insert(0) += 1;
        }
        BusMetrics {
            total_published: self.total_published.load(Ordering::Relaxed),
            per_kind_counts: self
                .per_kind
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            listener_counts,
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of matching subscribers in dispatch order: descending
    /// priority, ties in registration order.
    fn targets(&self, event: &Event) -> Vec<Arc<Subscriber>> {
        let subs = self.subscribers.lock().unwrap();
        let mut matched: Vec<Arc<Subscriber>> = subs
            .iter()
            .filter(|s| s.subscription.matches(event.kind))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        matched
    }

    fn deliver(self: &Arc<Self>, subscriber: &Arc<Subscriber>, event: &Event) {
        if !subscriber.wants(event) || !subscriber.claim_delivery() {
            return;
        }
        match &subscriber.handler {
            Handler::Sync(f) => {
                if let Err(err) = f(event) {
                    self.on_handler_failure(subscriber.id, event.kind, &err);
                }
            }
            Handler::Async(f) => {
                let fut = f(event.clone());
                let bus = Arc::clone(self);
                let id = subscriber.id;
                let kind = event.kind;
                let task = tokio::spawn(async move {
                    if let Err(err) = fut.await {
                        bus.on_handler_failure(id, kind, &err);
                    }
                });
                let mut spawned = self.spawned.lock().unwrap();
                spawned.retain(|t| !t.is_finished());
                spawned.push(task);
            }
        }
    }

    fn on_handler_failure(self: &Arc<Self>, handler_id: u64, failing_kind: EventKind, err: &anyhow::Error) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        if failing_kind == EventKind::Error {
            // Failure while handling an error event: mute instead of
            // publishing another error, which would recurse.
            if let Some(sub) = self
                .subscribers
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.id == handler_id)
            {
                sub.muted_for_errors.store(true, Ordering::Release);
            }
            tracing::warn!(handler_id, "error subscriber failed; muted for error fan-out: {err:#}");
            return;
        }
        tracing::debug!(handler_id, kind = %failing_kind, "subscriber failed: {err:#}");
        let synthetic =
            Event::handler_error(&self.session_id, &err.to_string(), failing_kind, handler_id);
        self.publish(synthetic);
    }

    fn record_published(&self, event: &Event) {
        self.total_published.fetch_add(1, Ordering::Relaxed);
        *self
            .per_kind
            .lock()
            .unwrap()
            .entry(event.kind.as_str())
            .or_insert(0) += 1;
        if let Some(ring) = self.replay.lock().unwrap().as_mut() {
            if ring.events.len() == ring.capacity {
                ring.events.pop_front();
            }
            ring.events.push_back(event.clone());
        }
    }

    fn prune(&self) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|s| !(s.once && s.spent.load(Ordering::Acquire)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSource;
    use serde_json::json;

    fn event(kind: &str) -> Event {
        Event::from_record(json!({"kind": kind, "text": "x"}), EventSource::Child, "sess")
    }

    fn recording_handler(log: Arc<Mutex<Vec<String>>>, tag: &str) -> Handler {
        let tag = tag.to_string();
        Handler::sync(move |_| {
            log.lock().unwrap().push(tag.clone());
            Ok(())
        })
    }

    #[tokio::test]
    async fn priority_order_then_registration_order() {
        let bus = EventBus::new("sess");
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(
            Subscription::Kind(EventKind::Query),
            recording_handler(log.clone(), "low"),
            SubscribeOptions { priority: 1, ..Default::default() },
        );
        bus.subscribe(
            Subscription::Kind(EventKind::Query),
            recording_handler(log.clone(), "high"),
            SubscribeOptions { priority: 10, ..Default::default() },
        );
        bus.subscribe(
            Subscription::Kind(EventKind::Query),
            recording_handler(log.clone(), "high2"),
            SubscribeOptions { priority: 10, ..Default::default() },
        );

        bus.publish(event("query"));
        assert_eq!(*log.lock().unwrap(), vec!["high", "high2", "low"]);
    }

    #[tokio::test]
    async fn wildcard_receives_every_kind_exactly_once() {
        let bus = EventBus::new("sess");
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            Subscription::Wildcard,
            recording_handler(log.clone(), "star"),
            SubscribeOptions::default(),
        );

        bus.publish(event("query"));
        bus.publish(event("response"));
        bus.publish(event("tool_use"));
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn filter_skips_without_counting_errors() {
        let bus = EventBus::new("sess");
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            Subscription::Kind(EventKind::Query),
            recording_handler(log.clone(), "filtered"),
            SubscribeOptions {
                filter: Some(Box::new(|e| e.payload.get("keep").is_some())),
                ..Default::default()
            },
        );

        bus.publish(event("query"));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(bus.metrics().error_count, 0);
    }

    #[tokio::test]
    async fn once_fires_a_single_time() {
        let bus = EventBus::new("sess");
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            Subscription::Kind(EventKind::Query),
            recording_handler(log.clone(), "once"),
            SubscribeOptions { once: true, ..Default::default() },
        );

        bus.publish(event("query"));
        bus.publish(event("query"));
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(bus.metrics().listener_counts.get("query"), None);
    }

    #[tokio::test]
    async fn failure_becomes_synthetic_error_event() {
        let bus = EventBus::new("sess");
        let errors = Arc::new(Mutex::new(Vec::new()));

        let sink = errors.clone();
        bus.subscribe(
            Subscription::Kind(EventKind::Error),
            Handler::sync(move |e| {
                sink.lock().unwrap().push(e.payload.clone());
                Ok(())
            }),
            SubscribeOptions::default(),
        );
        bus.subscribe(
            Subscription::Kind(EventKind::Query),
            Handler::sync(|_| Err(anyhow::anyhow!("handler exploded"))),
            SubscribeOptions::default(),
        );

        bus.publish(event("query"));

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["cause"], "handler exploded");
        assert_eq!(errors[0]["failingKind"], "query");
        assert!(errors[0]["handlerId"].is_number());
        assert_eq!(bus.metrics().error_count, 1);
    }

    #[tokio::test]
    async fn other_subscribers_still_run_after_a_failure() {
        let bus = EventBus::new("sess");
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            Subscription::Kind(EventKind::Query),
            Handler::sync(|_| Err(anyhow::anyhow!("first fails"))),
            SubscribeOptions { priority: 10, ..Default::default() },
        );
        bus.subscribe(
            Subscription::Kind(EventKind::Query),
            recording_handler(log.clone(), "second"),
            SubscribeOptions::default(),
        );

        bus.publish(event("query"));
        assert_eq!(*log.lock().unwrap(), vec!["second"]);
    }

    #[tokio::test]
    async fn failing_error_subscriber_is_muted_not_recursed() {
        let bus = EventBus::new("sess");
        let calls = Arc::new(Mutex::new(0u32));

        let counter = calls.clone();
        bus.subscribe(
            Subscription::Kind(EventKind::Error),
            Handler::sync(move |_| {
                *counter.lock().unwrap() += 1;
                Err(anyhow::anyhow!("error handler also fails"))
            }),
            SubscribeOptions::default(),
        );
        bus.subscribe(
            Subscription::Kind(EventKind::Query),
            Handler::sync(|_| Err(anyhow::anyhow!("boom"))),
            SubscribeOptions::default(),
        );

        bus.publish(event("query"));
        // The error subscriber ran once, failed, and was muted; the second
        // error event (from its own failure) never reaches it.
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(bus.metrics().error_count, 2);

        bus.publish(event("error"));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn replay_delivers_history_before_live_events() {
        let bus = EventBus::new("sess");
        bus.enable_replay(8);

        bus.publish(event("query"));
        bus.publish(event("response"));

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        bus.subscribe(
            Subscription::Wildcard,
            Handler::sync(move |e| {
                sink.lock().unwrap().push(e.kind.as_str().to_string());
                Ok(())
            }),
            SubscribeOptions { replay: true, ..Default::default() },
        );

        bus.publish(event("tool_use"));
        assert_eq!(*log.lock().unwrap(), vec!["query", "response", "tool_use"]);
    }

    #[tokio::test]
    async fn replay_ring_is_bounded() {
        let bus = EventBus::new("sess");
        bus.enable_replay(2);
        bus.publish(event("query"));
        bus.publish(event("response"));
        bus.publish(event("tool_use"));

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        bus.subscribe(
            Subscription::Wildcard,
            Handler::sync(move |e| {
                sink.lock().unwrap().push(e.kind.as_str().to_string());
                Ok(())
            }),
            SubscribeOptions { replay: true, ..Default::default() },
        );
        assert_eq!(*log.lock().unwrap(), vec!["response", "tool_use"]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new("sess");
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = bus.subscribe(
            Subscription::Kind(EventKind::Query),
            recording_handler(log.clone(), "gone"),
            SubscribeOptions::default(),
        );
        bus.unsubscribe(handle);
        bus.publish(event("query"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_all_for_spares_wildcards() {
        let bus = EventBus::new("sess");
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            Subscription::Kind(EventKind::Query),
            recording_handler(log.clone(), "kind"),
            SubscribeOptions::default(),
        );
        bus.subscribe(
            Subscription::Wildcard,
            recording_handler(log.clone(), "star"),
            SubscribeOptions::default(),
        );

        bus.remove_all_for(EventKind::Query);
        bus.publish(event("query"));
        assert_eq!(*log.lock().unwrap(), vec!["star"]);
    }

    #[tokio::test]
    async fn publish_async_awaits_async_handlers() {
        let bus = EventBus::new("sess");
        let flag = Arc::new(AtomicBool::new(false));
        let inner = flag.clone();
        bus.subscribe(
            Subscription::Kind(EventKind::Query),
            Handler::asynchronous(move |_| {
                let inner = inner.clone();
                Box::pin(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    inner.store(true, Ordering::SeqCst);
                    Ok(())
                })
            }),
            SubscribeOptions::default(),
        );

        bus.publish_async(event("query")).await;
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn detached_async_handlers_complete_on_drain() {
        let bus = EventBus::new("sess");
        let flag = Arc::new(AtomicBool::new(false));
        let inner = flag.clone();
        bus.subscribe(
            Subscription::Kind(EventKind::Query),
            Handler::asynchronous(move |_| {
                let inner = inner.clone();
                Box::pin(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    inner.store(true, Ordering::SeqCst);
                    Ok(())
                })
            }),
            SubscribeOptions::default(),
        );

        bus.publish(event("query"));
        bus.drain().await;
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn metrics_report_counts() {
        let bus = EventBus::new("sess");
        bus.subscribe(
            Subscription::Kind(EventKind::Query),
            Handler::sync(|_| Ok(())),
            SubscribeOptions::default(),
        );
        bus.subscribe(
            Subscription::Wildcard,
            Handler::sync(|_| Ok(())),
            SubscribeOptions::default(),
        );

        bus.publish(event("query"));
        bus.publish(event("query"));
        bus.publish(event("response"));

        let metrics = bus.metrics();
        assert_eq!(metrics.total_published, 3);
        assert_eq!(metrics.per_kind_counts["query"], 2);
        assert_eq!(metrics.per_kind_counts["response"], 1);
        assert_eq!(metrics.listener_counts["query"], 1);
        assert_eq!(metrics.listener_counts["*"], 1);
        assert_eq!(metrics.error_count, 0);
    }
}
