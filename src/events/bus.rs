//! Event Bus - Asynchronous publish/subscribe backbone
//!
//! Publishing never blocks: events go onto an unbounded FIFO queue. A single
//! dispatch loop pops them in order and runs every handler subscribed to the
//! event's type concurrently, waiting for all of them before the next event.
//! Each handler runs in its own task so an error or a panic stays isolated.

use futures::future::{BoxFuture, join_all};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::{Error, Result};
use crate::events::{Event, EventKind, EventType};

type Handler = Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Subscriber {
    name: String,
    handler: Handler,
}

struct Inner {
    tx: flume::Sender<Arc<Event>>,
    rx: flume::Receiver<Arc<Event>>,
    subscribers: RwLock<HashMap<EventType, Vec<Subscriber>>>,
    accepting: AtomicBool,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stop_timeout: Duration,
    dispatched: AtomicU64,
    handler_failures: AtomicU64,
}

/// Cloneable handle to the shared bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(stop_timeout: Duration) -> Self {
        let (tx, rx) = flume::unbounded();
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tx,
                rx,
                subscribers: RwLock::new(HashMap::new()),
                accepting: AtomicBool::new(true),
                shutdown,
                worker: Mutex::new(None),
                stop_timeout,
                dispatched: AtomicU64::new(0),
                handler_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Register an async handler for one event type.
    pub fn subscribe<F, Fut>(&self, event_type: EventType, name: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        debug!("Subscribed {} to {:?}", name, event_type);
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));
        self.inner
            .subscribers
            .write()
            .entry(event_type)
            .or_default()
            .push(Subscriber { name, handler });
    }

    /// Remove every handler registered under `name` for the event type.
    pub fn unsubscribe(&self, event_type: EventType, name: &str) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        match subscribers.get_mut(&event_type) {
            Some(list) => {
                let before = list.len();
                list.retain(|s| s.name != name);
                list.len() != before
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.inner
            .subscribers
            .read()
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    /// Enqueue an event. Fails only once the bus has stopped.
    pub fn publish(&self, event: Event) -> Result<()> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(Error::BusStopped);
        }
        debug!("Event published: {:?} from {}", event.event_type(), event.source);
        self.inner
            .tx
            .send(Arc::new(event))
            .map_err(|_| Error::BusStopped)
    }

    /// Shorthand for `publish(Event::new(source, kind))`.
    pub fn emit(&self, source: &str, kind: EventKind) -> Result<()> {
        self.publish(Event::new(source, kind))
    }

    /// Events waiting for dispatch
    pub fn pending(&self) -> usize {
        self.inner.rx.len()
    }

    /// Events fully dispatched so far
    pub fn dispatched(&self) -> u64 {
        self.inner.dispatched.load(Ordering::Relaxed)
    }

    /// Handler invocations that returned an error or panicked
    pub fn handler_failures(&self) -> u64 {
        self.inner.handler_failures.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.inner.worker.lock().is_some()
    }

    /// Spawn the dispatch loop. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            warn!("EventBus already running");
            return;
        }
        if !self.inner.accepting.load(Ordering::Acquire) {
            warn!("EventBus was stopped, refusing to restart");
            return;
        }
        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown.subscribe();
        *worker = Some(tokio::spawn(dispatch_loop(inner, shutdown)));
        info!("EventBus started");
    }

    /// Drain queued events, then reject further publishes.
    ///
    /// Waits at most `stop_timeout` for the drain; the loop is aborted after
    /// that and whatever is still queued is dropped.
    pub async fn stop(&self) {
        let handle = self.inner.worker.lock().take();
        let _ = self.inner.shutdown.send(true);

        if let Some(mut handle) = handle {
            match tokio::time::timeout(self.inner.stop_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("EventBus dispatch loop failed: {}", e),
                Err(_) => {
                    warn!(
                        "EventBus drain timed out after {:?}, dropping {} events",
                        self.inner.stop_timeout,
                        self.inner.rx.len()
                    );
                    handle.abort();
                }
            }
        }

        self.inner.accepting.store(false, Ordering::Release);
        info!("EventBus stopped");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            received = inner.rx.recv_async() => match received {
                Ok(event) => dispatch(&inner, event).await,
                Err(_) => return,
            },
        }
    }

    // Handlers may still publish while the queue drains.
    loop {
        while let Ok(event) = inner.rx.try_recv() {
            dispatch(&inner, event).await;
        }
        inner.accepting.store(false, Ordering::Release);
        if inner.rx.is_empty() {
            break;
        }
    }
}

async fn dispatch(inner: &Inner, event: Arc<Event>) {
    let event_type = event.event_type();
    let handlers: Vec<(String, Handler)> = inner
        .subscribers
        .read()
        .get(&event_type)
        .map(|list| {
            list.iter()
                .map(|s| (s.name.clone(), s.handler.clone()))
                .collect()
        })
        .unwrap_or_default();

    if handlers.is_empty() {
        debug!("No subscribers for {:?}", event_type);
        inner.dispatched.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let (names, tasks): (Vec<_>, Vec<_>) = handlers
        .into_iter()
        .map(|(name, handler)| (name, tokio::spawn(handler(event.clone()))))
        .unzip();

    for (name, result) in names.into_iter().zip(join_all(tasks).await) {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                inner.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!("Handler {} failed on {:?}: {:#}", name, event_type, e);
            }
            Err(e) => {
                inner.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!("Handler {} panicked on {:?}: {}", name, event_type, e);
            }
        }
    }
    inner.dispatched.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Symbol;
    use crate::events::{PriceTick, SystemError};
    use rust_decimal::Decimal;
    use std::sync::atomic::AtomicUsize;

    fn tick(price: i64) -> EventKind {
        EventKind::PriceUpdate(PriceTick {
            symbol: Symbol::new("BTCUSDT"),
            price: Decimal::from(price),
        })
    }

    #[tokio::test]
    async fn test_fifo_delivery() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(EventType::PriceUpdate, "recorder", move |event| {
            let sink = sink.clone();
            async move {
                if let EventKind::PriceUpdate(t) = &event.kind {
                    sink.lock().push(t.price);
                }
                Ok(())
            }
        });

        bus.start();
        for p in 1..=5 {
            bus.emit("test", tick(p)).unwrap();
        }
        bus.stop().await;

        let expected: Vec<Decimal> = (1..=5).map(Decimal::from).collect();
        assert_eq!(*seen.lock(), expected);
    }

    async fn failing(_: Arc<Event>) -> anyhow::Result<()> {
        anyhow::bail!("boom")
    }

    async fn exploding(_: Arc<Event>) -> anyhow::Result<()> {
        panic!("handler panic")
    }

    #[tokio::test]
    async fn test_failing_handler_is_isolated() {
        let bus = EventBus::default();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventType::PriceUpdate, "broken", failing);
        bus.subscribe(EventType::PriceUpdate, "panicky", exploding);
        let counter = calls.clone();
        bus.subscribe(EventType::PriceUpdate, "healthy", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.start();
        bus.emit("test", tick(1)).unwrap();
        bus.emit("test", tick(2)).unwrap();
        bus.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(bus.handler_failures(), 4);
        assert_eq!(bus.dispatched(), 2);
    }

    #[tokio::test]
    async fn test_publish_after_stop_is_rejected() {
        let bus = EventBus::default();
        bus.start();
        bus.stop().await;
        let err = bus.emit("test", tick(1)).unwrap_err();
        assert!(matches!(err, Error::BusStopped));
    }

    #[tokio::test]
    async fn test_stop_drains_events_published_by_handlers() {
        let bus = EventBus::default();
        let errors = Arc::new(AtomicUsize::new(0));

        let republisher = bus.clone();
        bus.subscribe(EventType::PriceUpdate, "escalate", move |_| {
            let bus = republisher.clone();
            async move {
                bus.emit(
                    "test",
                    EventKind::SystemError(SystemError {
                        component: "test".into(),
                        message: "tick".into(),
                        critical: false,
                    }),
                )?;
                anyhow::Ok(())
            }
        });
        let counter = errors.clone();
        bus.subscribe(EventType::SystemError, "count", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        // Queued before start; all of it must be handled by stop().
        for p in 0..3 {
            bus.emit("test", tick(p)).unwrap();
        }
        bus.start();
        bus.stop().await;

        assert_eq!(errors.load(Ordering::SeqCst), 3);
        assert_eq!(bus.pending(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::default();
        bus.subscribe(EventType::RiskAlert, "a", |_| async { Ok(()) });
        bus.subscribe(EventType::RiskAlert, "b", |_| async { Ok(()) });
        assert_eq!(bus.subscriber_count(EventType::RiskAlert), 2);
        assert!(bus.unsubscribe(EventType::RiskAlert, "a"));
        assert!(!bus.unsubscribe(EventType::RiskAlert, "a"));
        assert_eq!(bus.subscriber_count(EventType::RiskAlert), 1);
    }
}
