//! Internal bus adapter
//!
//! Pooling traffic travels over a single publish/subscribe topic. The topic
//! client is an external collaborator behind [`TopicEndpoint`]; this module
//! wraps it with message encoding and ships [`InMemoryTopic`], an in-process
//! endpoint used to wire several managers together.

use crate::error::{PoolingError, Result};
use crate::message::{encode, Message};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Receiver of raw events arriving on a topic
pub trait TopicListener: Send + Sync {
    fn on_topic_event(&self, topic: &str, event: &str);
}

/// Publish/subscribe client for one topic
pub trait TopicEndpoint: Send + Sync {
    /// Topic name
    fn topic(&self) -> &str;

    fn start_publisher(&self) -> Result<()>;

    /// Stop publishing, allowing up to `wait` for queued messages to drain
    fn stop_publisher(&self, wait: Duration);

    /// Begin delivering topic events to `listener`
    fn start_consumer(&self, listener: Arc<dyn TopicListener>) -> Result<()>;

    fn stop_consumer(&self);

    /// Send raw text on the topic
    fn publish(&self, text: &str) -> Result<()>;
}

/// Message-level view of the internal topic
#[derive(Clone)]
pub struct InternalBus {
    endpoint: Arc<dyn TopicEndpoint>,
}

impl InternalBus {
    pub fn new(endpoint: Arc<dyn TopicEndpoint>) -> Self {
        Self { endpoint }
    }

    pub fn topic(&self) -> &str {
        self.endpoint.topic()
    }

    pub fn endpoint(&self) -> &Arc<dyn TopicEndpoint> {
        &self.endpoint
    }

    /// Validate, encode and publish a message
    pub fn send(&self, message: &Message) -> Result<()> {
        message.check_validity()?;
        let text = encode(message)?;
        trace!(
            topic = %self.topic(),
            kind = %message.kind(),
            channel = %message.channel(),
            "Publishing pooling message"
        );
        self.endpoint.publish(&text)
    }
}

impl std::fmt::Debug for InternalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalBus")
            .field("topic", &self.topic())
            .finish()
    }
}

/// In-process topic shared by every endpoint created from it.
///
/// Publishing hands the text to each subscribed endpoint's delivery task, so
/// listeners are never invoked on the publisher's stack. The publisher's own
/// endpoint receives its messages too, as a real topic would echo them.
pub struct InMemoryTopic {
    name: String,
    subscribers: DashMap<u64, mpsc::UnboundedSender<String>>,
    next_subscriber: AtomicU64,
    delivering: AtomicBool,
    rejecting: AtomicBool,
    published: Mutex<Vec<String>>,
}

impl InMemoryTopic {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            subscribers: DashMap::new(),
            next_subscriber: AtomicU64::new(1),
            delivering: AtomicBool::new(true),
            rejecting: AtomicBool::new(false),
            published: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create a new endpoint attached to this topic
    pub fn endpoint(self: &Arc<Self>) -> Arc<InMemoryEndpoint> {
        Arc::new(InMemoryEndpoint {
            topic: Arc::clone(self),
            publishing: AtomicBool::new(false),
            consumer: Mutex::new(None),
        })
    }

    /// Simulate a broken bus: while disabled, published text is recorded
    /// but never delivered.
    pub fn set_delivering(&self, delivering: bool) {
        self.delivering.store(delivering, Ordering::SeqCst);
    }

    /// Simulate a broker refusing writes: publishes fail with
    /// [`PoolingError::PublishFailed`] and nothing is recorded.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Every text published on the topic so far, in order
    pub fn published(&self) -> Vec<String> {
        self.published.lock().clone()
    }

    pub fn clear_published(&self) {
        self.published.lock().clear();
    }

    /// Number of endpoints currently consuming
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver raw text to every subscriber, bypassing any publisher
    pub fn inject(&self, text: &str) {
        self.published.lock().push(text.to_string());
        if !self.delivering.load(Ordering::SeqCst) {
            debug!(topic = %self.name, "Delivery disabled, dropping event");
            return;
        }

        let mut closed = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.value().send(text.to_string()).is_err() {
                closed.push(*entry.key());
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
        }
    }

    fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }
}

/// One host's connection to an [`InMemoryTopic`]
pub struct InMemoryEndpoint {
    topic: Arc<InMemoryTopic>,
    publishing: AtomicBool,
    consumer: Mutex<Option<(u64, JoinHandle<()>)>>,
}

impl InMemoryEndpoint {
    pub fn is_publishing(&self) -> bool {
        self.publishing.load(Ordering::SeqCst)
    }

    pub fn is_consuming(&self) -> bool {
        self.consumer.lock().is_some()
    }
}

impl TopicEndpoint for InMemoryEndpoint {
    fn topic(&self) -> &str {
        self.topic.name()
    }

    fn start_publisher(&self) -> Result<()> {
        self.publishing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_publisher(&self, _wait: Duration) {
        // Delivery is handed off synchronously, so nothing is left to drain
        self.publishing.store(false, Ordering::SeqCst);
    }

    fn start_consumer(&self, listener: Arc<dyn TopicListener>) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| PoolingError::NoRuntime)?;

        let mut consumer = self.consumer.lock();
        if consumer.is_some() {
            return Ok(());
        }

        let (id, mut rx) = self.topic.subscribe();
        let topic = self.topic.name().to_string();
        let task = handle.spawn(async move {
            while let Some(event) = rx.recv().await {
                listener.on_topic_event(&topic, &event);
            }
        });
        *consumer = Some((id, task));
        Ok(())
    }

    fn stop_consumer(&self) {
        if let Some((id, task)) = self.consumer.lock().take() {
            self.topic.unsubscribe(id);
            task.abort();
        }
    }

    fn publish(&self, text: &str) -> Result<()> {
        if !self.is_publishing() {
            warn!(topic = %self.topic.name(), "Publish attempted before publisher started");
            return Err(PoolingError::EndpointNotStarted(self.topic.name().to_string()));
        }
        if self.topic.rejecting.load(Ordering::SeqCst) {
            return Err(PoolingError::PublishFailed {
                topic: self.topic.name().to_string(),
                reason: "topic is rejecting writes".to_string(),
            });
        }
        self.topic.inject(text);
        Ok(())
    }
}

impl Drop for InMemoryEndpoint {
    fn drop(&mut self) {
        if let Some((id, task)) = self.consumer.get_mut().take() {
            self.topic.unsubscribe(id);
            task.abort();
        }
    }
}
