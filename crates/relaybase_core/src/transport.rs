//! Message transport abstraction.

use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Callback invoked with `(topic or queue, payload)`.
pub type MessageHandler = Arc<dyn Fn(&str, Bytes) + Send + Sync>;

/// Default capacity of per-topic broadcast channels.
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Pub/sub and queue messaging used to fan out deltas and receive system
/// messages.
///
/// Topics deliver to every listener. Queues deliver each message to one
/// listener and hold messages until a listener is registered.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Publishes to a topic, returning the number of listeners reached.
    async fn publish(&self, topic: &str, payload: Bytes) -> CoreResult<usize>;

    /// Sends to a queue.
    async fn send(&self, queue: &str, payload: Bytes) -> CoreResult<()>;

    /// Registers a listener on a topic or queue.
    fn on_message(&self, name: &str, handler: MessageHandler);
}

#[derive(Default)]
struct Endpoints {
    handlers: HashMap<String, Vec<MessageHandler>>,
    queued: HashMap<String, VecDeque<Bytes>>,
    topics: HashMap<String, broadcast::Sender<Bytes>>,
    published: HashMap<String, VecDeque<Bytes>>,
    next_consumer: HashMap<String, usize>,
}

/// In-process [`MessageTransport`].
///
/// Topics are backed by `tokio::sync::broadcast` channels so tasks can
/// also [`subscribe`](InMemoryTransport::subscribe) as streams. The most
/// recent payloads of each topic, up to the record limit, are kept for
/// inspection.
pub struct InMemoryTransport {
    endpoints: Mutex<Endpoints>,
    connected: AtomicBool,
    capacity: usize,
    record_limit: usize,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }
}

impl InMemoryTransport {
    /// Creates a transport with the default topic capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport whose topic channels hold `capacity` messages.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            endpoints: Mutex::new(Endpoints::default()),
            connected: AtomicBool::new(true),
            capacity,
            record_limit: capacity,
        }
    }

    /// Keeps at most `limit` published payloads per topic. Zero disables
    /// recording.
    #[must_use]
    pub fn with_record_limit(mut self, limit: usize) -> Self {
        self.record_limit = limit;
        self
    }

    /// Simulates losing or regaining the broker connection.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Returns a receiver for every later publish on `topic`.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Bytes> {
        let mut endpoints = self.endpoints.lock();
        let capacity = self.capacity;
        endpoints
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe()
    }

    /// Returns the recorded payloads of `topic`, oldest first.
    pub fn published(&self, topic: &str) -> Vec<Bytes> {
        self.endpoints
            .lock()
            .published
            .get(topic)
            .map(|recorded| recorded.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of messages waiting on `queue`.
    pub fn queued(&self, queue: &str) -> usize {
        self.endpoints.lock().queued.get(queue).map_or(0, VecDeque::len)
    }

    fn check_connected(&self) -> CoreResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::Transport("not connected".into()))
        }
    }
}

#[async_trait]
impl MessageTransport for InMemoryTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> CoreResult<usize> {
        self.check_connected()?;
        let (handlers, streams) = {
            let mut endpoints = self.endpoints.lock();
            if self.record_limit > 0 {
                let recorded = endpoints.published.entry(topic.to_string()).or_default();
                if recorded.len() == self.record_limit {
                    recorded.pop_front();
                }
                recorded.push_back(payload.clone());
            }
            let handlers = endpoints.handlers.get(topic).cloned().unwrap_or_default();
            let streams = endpoints
                .topics
                .get(topic)
                .and_then(|tx| tx.send(payload.clone()).ok())
                .unwrap_or(0);
            (handlers, streams)
        };

        for handler in &handlers {
            handler(topic, payload.clone());
        }
        trace!(topic, handlers = handlers.len(), streams, "published");
        Ok(handlers.len() + streams)
    }

    async fn send(&self, queue: &str, payload: Bytes) -> CoreResult<()> {
        self.check_connected()?;
        let handler = {
            let mut endpoints = self.endpoints.lock();
            let count = endpoints.handlers.get(queue).map_or(0, Vec::len);
            if count == 0 {
                endpoints
                    .queued
                    .entry(queue.to_string())
                    .or_default()
                    .push_back(payload);
                debug!(queue, "no consumer, message held");
                return Ok(());
            }
            let turn = endpoints.next_consumer.entry(queue.to_string()).or_insert(0);
            let pick = *turn % count;
            *turn = turn.wrapping_add(1);
            endpoints
                .handlers
                .get(queue)
                .and_then(|hs| hs.get(pick))
                .cloned()
        };
        if let Some(handler) = handler {
            handler(queue, payload);
        }
        Ok(())
    }

    fn on_message(&self, name: &str, handler: MessageHandler) {
        let backlog: Vec<Bytes> = {
            let mut endpoints = self.endpoints.lock();
            endpoints
                .handlers
                .entry(name.to_string())
                .or_default()
                .push(handler.clone());
            endpoints
                .queued
                .remove(name)
                .map(Vec::from)
                .unwrap_or_default()
        };
        for payload in backlog {
            handler(name, payload);
        }
    }
}
