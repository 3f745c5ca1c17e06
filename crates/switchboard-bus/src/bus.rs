use crate::handler::MessageHandler;
use crate::mailbox::Mailbox;
use crate::queue::MessageQueue;
use crate::registry::{Component, ComponentRegistration, ComponentRegistry};
use futures_util::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{
    BusConfig, ComponentEvent, Message, MessagePayload, MessageType, Recipient, SwitchboardError,
    SwitchboardResult, UnregisterReason,
};
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sender id used for messages the bus emits itself.
pub const BUS_ID: &str = "switchboard.bus";

/// Context keys added to every message on enqueue.
pub const CTX_ACTIVE_COMPONENTS: &str = "bus.active_components";
/// Queue depth at the time the message was enqueued.
pub const CTX_QUEUE_DEPTH: &str = "bus.queue_depth";
/// The sender's registered capabilities, when the sender is known.
pub const CTX_SENDER_CAPABILITIES: &str = "bus.sender_capabilities";

#[derive(Default)]
struct BusCounters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed_deliveries: AtomicU64,
    handler_failures: AtomicU64,
}

/// Point-in-time view of the bus.
#[derive(Debug, Clone, Serialize)]
pub struct BusStatus {
    pub queue_depth: usize,
    pub active_components: usize,
    pub enqueued: u64,
    pub delivered: u64,
    pub failed_deliveries: u64,
    pub handler_failures: u64,
    pub pending_replies: usize,
    /// Subscriber count per message type.
    pub subscriptions: HashMap<MessageType, usize>,
    pub handlers: Vec<MessageType>,
    pub closed: bool,
}

/// Priority message bus.
///
/// Messages are accepted by [`send`](Self::send) into a bounded priority queue
/// and delivered by a single delivery loop ([`run`](Self::run) /
/// [`spawn`](Self::spawn)) or synchronously by [`drain`](Self::drain). Delivery
/// order is highest priority first, FIFO within a priority.
///
/// The bus owns the queue and the pending-reply table; the component registry
/// it routes against is shared with the liveness monitor.
pub struct MessageBus {
    config: BusConfig,
    registry: Arc<ComponentRegistry>,
    queue: parking_lot::Mutex<MessageQueue>,
    wakeup: Notify,
    /// Serializes pop+deliver so only one deliverer runs at a time.
    delivery_lock: Mutex<()>,
    subscriptions: RwLock<HashMap<MessageType, BTreeSet<String>>>,
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
    mailboxes: RwLock<HashMap<String, mpsc::Sender<Message>>>,
    pending_replies: Mutex<HashMap<Uuid, oneshot::Sender<Message>>>,
    history: parking_lot::Mutex<VecDeque<Message>>,
    counters: BusCounters,
    closed: AtomicBool,
}

impl MessageBus {
    pub fn new(config: BusConfig, registry: Arc<ComponentRegistry>) -> Self {
        Self {
            queue: parking_lot::Mutex::new(MessageQueue::new(config.queue_capacity)),
            history: parking_lot::Mutex::new(VecDeque::with_capacity(config.history_limit)),
            config,
            registry,
            wakeup: Notify::new(),
            delivery_lock: Mutex::new(()),
            subscriptions: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            mailboxes: RwLock::new(HashMap::new()),
            pending_replies: Mutex::new(HashMap::new()),
            counters: BusCounters::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// Get a reference to the component registry.
    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    // --- Components ---

    /// Register a component without an inbox.
    ///
    /// Messages addressed to it still pass the receiver check, run handlers,
    /// and resolve reply waiters; they are just not queued anywhere.
    pub async fn register(&self, registration: ComponentRegistration) -> SwitchboardResult<Component> {
        let component = self.admit(registration).await?;
        self.announce(MessagePayload::ComponentRegistered(ComponentEvent {
            component_id: component.id.clone(),
            component_type: component.component_type.clone(),
            reason: None,
        }))
        .await;
        Ok(component)
    }

    /// Register a component and open its inbox.
    pub async fn connect(&self, registration: ComponentRegistration) -> SwitchboardResult<Mailbox> {
        let component = self.admit(registration).await?;
        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity);
        self.mailboxes.write().await.insert(component.id.clone(), tx);
        self.announce(MessagePayload::ComponentRegistered(ComponentEvent {
            component_id: component.id.clone(),
            component_type: component.component_type.clone(),
            reason: None,
        }))
        .await;
        Ok(Mailbox::new(component.id, rx))
    }

    /// Add to the registry. A stale entry that gets replaced is torn down and
    /// announced as evicted before the new one is announced.
    async fn admit(&self, registration: ComponentRegistration) -> SwitchboardResult<Component> {
        let (component, replaced) = self.registry.register_replacing(registration).await?;
        if let Some(stale) = replaced {
            self.release_component(&stale, UnregisterReason::LivenessTimeout)
                .await;
        }
        Ok(component)
    }

    /// Unregister a component, close its inbox, and drop its subscriptions.
    pub async fn disconnect(&self, component_id: &str) -> SwitchboardResult<Component> {
        let component = self.registry.unregister(component_id).await?;
        self.release_component(&component, UnregisterReason::Explicit)
            .await;
        Ok(component)
    }

    /// Refresh a component's liveness. No-op for unknown ids.
    pub async fn heartbeat(&self, component_id: &str) -> bool {
        self.registry.heartbeat(component_id).await
    }

    /// Tear down bus-side state for a component that already left the
    /// registry and tell the remaining subscribers.
    pub(crate) async fn release_component(&self, component: &Component, reason: UnregisterReason) {
        self.mailboxes.write().await.remove(&component.id);
        {
            let mut subscriptions = self.subscriptions.write().await;
            for subscribers in subscriptions.values_mut() {
                subscribers.remove(&component.id);
            }
            subscriptions.retain(|_, subscribers| !subscribers.is_empty());
        }
        self.announce(MessagePayload::ComponentUnregistered(ComponentEvent {
            component_id: component.id.clone(),
            component_type: component.component_type.clone(),
            reason: Some(reason),
        }))
        .await;
    }

    async fn announce(&self, payload: MessagePayload) {
        if let Err(e) = self.send(Message::broadcast(BUS_ID, payload)).await {
            warn!(error = %e, "Failed to broadcast component event");
        }
    }

    // --- Subscriptions and handlers ---

    /// Receive broadcasts of `message_type`.
    pub async fn subscribe(&self, component_id: &str, message_type: MessageType) -> SwitchboardResult<()> {
        if !self.registry.contains(component_id).await {
            return Err(SwitchboardError::ComponentNotFound(component_id.to_string()));
        }
        self.subscriptions
            .write()
            .await
            .entry(message_type)
            .or_default()
            .insert(component_id.to_string());
        debug!(component_id, %message_type, "Subscribed");
        Ok(())
    }

    /// Stop receiving broadcasts of `message_type`. Returns whether a
    /// subscription existed.
    pub async fn unsubscribe(&self, component_id: &str, message_type: MessageType) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        let Some(subscribers) = subscriptions.get_mut(&message_type) else {
            return false;
        };
        let removed = subscribers.remove(component_id);
        if subscribers.is_empty() {
            subscriptions.remove(&message_type);
        }
        removed
    }

    pub async fn subscribers(&self, message_type: MessageType) -> Vec<String> {
        self.subscriptions
            .read()
            .await
            .get(&message_type)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Install the handler for `message_type`, replacing and returning any
    /// previous one.
    pub async fn set_handler(
        &self,
        message_type: MessageType,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.write().await.insert(message_type, handler)
    }

    pub async fn remove_handler(&self, message_type: MessageType) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.write().await.remove(&message_type)
    }

    // --- Sending ---

    /// Enqueue a message and return its id without waiting for delivery.
    ///
    /// The message context is enriched with the active component count, the
    /// queue depth, and the sender's capabilities (when the sender is known).
    pub async fn send(&self, mut message: Message) -> SwitchboardResult<Uuid> {
        if self.is_closed() {
            return Err(SwitchboardError::BusClosed);
        }

        let active = self.registry.active_count().await;
        let sender_capabilities = self.registry.capabilities(&message.sender).await;
        message
            .context
            .insert(CTX_ACTIVE_COMPONENTS.into(), serde_json::json!(active));
        if let Some(capabilities) = sender_capabilities {
            message.context.insert(
                CTX_SENDER_CAPABILITIES.into(),
                serde_json::json!(capabilities),
            );
        }

        let id = message.id;
        let priority = message.priority;
        let message_type = message.message_type();
        let depth = {
            let mut queue = self.queue.lock();
            let depth = queue.len();
            message
                .context
                .insert(CTX_QUEUE_DEPTH.into(), serde_json::json!(depth));
            queue.push(message)?;
            depth + 1
        };
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.wakeup.notify_one();

        debug!(message_id = %id, %message_type, %priority, queue_depth = depth, "Message enqueued");
        Ok(id)
    }

    /// Send a message and wait for the message whose `reply_to` is its id.
    ///
    /// Only the caller is suspended; the delivery loop keeps running. On
    /// timeout the waiter is removed and [`SwitchboardError::ReplyTimeout`] is
    /// returned.
    pub async fn send_and_await_reply(
        &self,
        message: Message,
        timeout: Duration,
    ) -> SwitchboardResult<Message> {
        let message_id = message.id;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_replies.lock().await;
            if pending.contains_key(&message_id) {
                return Err(SwitchboardError::DuplicateWaiter(message_id));
            }
            pending.insert(message_id, tx);
        }

        if let Err(e) = self.send(message).await {
            self.pending_replies.lock().await.remove(&message_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                // Waiter dropped without a reply: the bus was closed.
                self.pending_replies.lock().await.remove(&message_id);
                Err(SwitchboardError::BusClosed)
            }
            Err(_) => {
                self.pending_replies.lock().await.remove(&message_id);
                warn!(
                    message_id = %message_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Reply timed out"
                );
                Err(SwitchboardError::ReplyTimeout {
                    message_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// [`send_and_await_reply`](Self::send_and_await_reply) with the configured
    /// default timeout.
    pub async fn request(&self, message: Message) -> SwitchboardResult<Message> {
        self.send_and_await_reply(message, self.config.reply_timeout())
            .await
    }

    // --- Delivery ---

    /// Spawn the delivery loop on the tokio runtime.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move { bus.run().await })
    }

    /// Deliver messages until the bus is closed.
    pub async fn run(&self) {
        info!("Message bus delivery loop started");
        loop {
            let notified = self.wakeup.notified();
            if self.is_closed() {
                break;
            }
            if self.deliver_next().await {
                continue;
            }
            notified.await;
        }
        info!("Message bus delivery loop stopped");
    }

    /// Deliver everything currently queued, including messages enqueued by
    /// handlers along the way. Returns how many messages were processed.
    pub async fn drain(&self) -> usize {
        let mut processed = 0;
        while self.deliver_next().await {
            processed += 1;
        }
        processed
    }

    async fn deliver_next(&self) -> bool {
        let _turn = self.delivery_lock.lock().await;
        let next = self.queue.lock().pop();
        match next {
            Some(message) => {
                self.deliver(message).await;
                true
            }
            None => false,
        }
    }

    async fn deliver(&self, message: Message) {
        let message_type = message.message_type();

        if let Recipient::Component(receiver) = &message.receiver {
            if !self.registry.contains(receiver).await {
                self.counters
                    .failed_deliveries
                    .fetch_add(1, Ordering::Relaxed);
                let err = SwitchboardError::UnknownReceiver {
                    message_id: message.id,
                    receiver: receiver.clone(),
                };
                warn!(%message_type, sender = %message.sender, error = %err, "Dropping message");
                return;
            }
        }

        match &message.payload {
            MessagePayload::Heartbeat => {
                self.registry.heartbeat(&message.sender).await;
            }
            MessagePayload::TaskAssignment(_)
            | MessagePayload::TaskResult(_)
            | MessagePayload::LearningFeedback(_)
            | MessagePayload::ComponentRegistered(_)
            | MessagePayload::ComponentUnregistered(_)
            | MessagePayload::Request { .. }
            | MessagePayload::Response { .. }
            | MessagePayload::Error { .. } => {}
        }

        self.invoke_handler(&message, message_type).await;

        match &message.receiver {
            Recipient::Component(receiver) => {
                self.push_to_mailbox(receiver, message.clone()).await;
            }
            Recipient::Broadcast => {
                let subscribers: Vec<String> = self
                    .subscriptions
                    .read()
                    .await
                    .get(&message_type)
                    .map(|s| {
                        s.iter()
                            .filter(|id| **id != message.sender)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                for subscriber in &subscribers {
                    self.push_to_mailbox(subscriber, message.copy_for(subscriber))
                        .await;
                }
            }
        }

        if let Some(original) = message.reply_to {
            let waiter = self.pending_replies.lock().await.remove(&original);
            if let Some(waiter) = waiter {
                if waiter.send(message.clone()).is_err() {
                    debug!(message_id = %original, "Reply arrived after the waiter gave up");
                }
            }
        }

        debug!(message_id = %message.id, %message_type, receiver = %message.receiver, "Message delivered");
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        self.record(message);
    }

    async fn invoke_handler(&self, message: &Message, message_type: MessageType) {
        let handler = self.handlers.read().await.get(&message_type).cloned();
        let Some(handler) = handler else {
            return;
        };

        let failure = match AssertUnwindSafe(handler.handle(message))
            .catch_unwind()
            .await
        {
            Ok(Ok(follow_ups)) => {
                for follow_up in follow_ups {
                    if let Err(e) = self.send(follow_up).await {
                        warn!(error = %e, "Failed to enqueue handler output");
                    }
                }
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(panic_reason(panic.as_ref())),
        };

        let Some(reason) = failure else {
            return;
        };
        self.counters
            .handler_failures
            .fetch_add(1, Ordering::Relaxed);
        let err = SwitchboardError::HandlerFailure {
            message_type: message_type.to_string(),
            reason,
        };
        warn!(message_id = %message.id, error = %err, "Message handler failed");

        // Never answer an error with another error.
        if message_type != MessageType::Error {
            let report = Message::reply(
                message,
                BUS_ID,
                MessagePayload::Error {
                    error: err.to_string(),
                },
            );
            if let Err(e) = self.send(report).await {
                warn!(error = %e, "Failed to report handler failure");
            }
        }
    }

    async fn push_to_mailbox(&self, component_id: &str, message: Message) -> bool {
        let sender = self.mailboxes.read().await.get(component_id).cloned();
        let Some(sender) = sender else {
            return true;
        };
        match sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                self.counters
                    .failed_deliveries
                    .fetch_add(1, Ordering::Relaxed);
                warn!(component_id, message_id = %message.id, "Mailbox full, message dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                self.counters
                    .failed_deliveries
                    .fetch_add(1, Ordering::Relaxed);
                self.mailboxes.write().await.remove(component_id);
                warn!(component_id, message_id = %message.id, "Mailbox closed, message dropped");
                false
            }
        }
    }

    fn record(&self, message: Message) {
        if self.config.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.config.history_limit {
            history.pop_front();
        }
        history.push_back(message);
    }

    // --- Inspection ---

    /// The most recent `limit` delivered messages, oldest first.
    pub fn history(&self, limit: usize) -> Vec<Message> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub async fn pending_reply_count(&self) -> usize {
        self.pending_replies.lock().await.len()
    }

    pub async fn status(&self) -> BusStatus {
        let subscriptions = self
            .subscriptions
            .read()
            .await
            .iter()
            .map(|(ty, subscribers)| (*ty, subscribers.len()))
            .collect();
        let mut handlers: Vec<MessageType> = self.handlers.read().await.keys().copied().collect();
        handlers.sort();
        BusStatus {
            queue_depth: self.queue_depth(),
            active_components: self.registry.active_count().await,
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed_deliveries: self.counters.failed_deliveries.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
            pending_replies: self.pending_reply_count().await,
            subscriptions,
            handlers,
            closed: self.is_closed(),
        }
    }

    // --- Shutdown ---

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting messages, stop the delivery loop, and fail every
    /// outstanding reply waiter with [`SwitchboardError::BusClosed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.wakeup.notify_waiters();
        self.wakeup.notify_one();
        let dropped = {
            let mut pending = self.pending_replies.lock().await;
            let count = pending.len();
            pending.clear();
            count
        };
        info!(
            undelivered = self.queue_depth(),
            dropped_waiters = dropped,
            "Message bus closed"
        );
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        format!("panicked: {reason}")
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        format!("panicked: {reason}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use std::sync::atomic::AtomicUsize;
    use switchboard_core::Priority;

    fn bus() -> Arc<MessageBus> {
        let registry = Arc::new(ComponentRegistry::new(Duration::from_secs(60)));
        Arc::new(MessageBus::new(BusConfig::default(), registry))
    }

    fn request(from: &str, to: &str, body: serde_json::Value) -> Message {
        Message::new(from, to, MessagePayload::Request { body })
    }

    #[tokio::test]
    async fn test_send_enriches_context() {
        let bus = bus();
        bus.register(ComponentRegistration::new("hub", "orchestrator").with_capabilities(["routing"]))
            .await
            .unwrap();
        bus.drain().await;

        bus.send(request("hub", "hub", serde_json::json!(1))).await.unwrap();
        bus.send(request("outsider", "hub", serde_json::json!(2))).await.unwrap();
        bus.drain().await;

        let history = bus.history(2);
        assert_eq!(history[0].context[CTX_ACTIVE_COMPONENTS], 1);
        assert_eq!(history[0].context[CTX_QUEUE_DEPTH], 0);
        assert_eq!(
            history[0].context[CTX_SENDER_CAPABILITIES],
            serde_json::json!(["routing"])
        );
        assert_eq!(history[1].context[CTX_QUEUE_DEPTH], 1);
        assert!(!history[1].context.contains_key(CTX_SENDER_CAPABILITIES));
    }

    #[tokio::test]
    async fn test_unknown_receiver_dropped_and_counted() {
        let bus = bus();
        bus.send(request("a", "nobody", serde_json::json!(null)))
            .await
            .unwrap();
        assert_eq!(bus.drain().await, 1);

        let status = bus.status().await;
        assert_eq!(status.failed_deliveries, 1);
        assert_eq!(status.delivered, 0);
        assert!(bus.history(10).is_empty());
    }

    #[tokio::test]
    async fn test_direct_delivery_to_mailbox() {
        let bus = bus();
        let mut inbox = bus
            .connect(ComponentRegistration::new("coder", "agent"))
            .await
            .unwrap();
        bus.send(request("hub", "coder", serde_json::json!("hi")))
            .await
            .unwrap();
        bus.drain().await;

        let received = inbox.drain();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].sender, "hub");
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_copies() {
        let bus = bus();
        let mut a = bus.connect(ComponentRegistration::new("a", "agent")).await.unwrap();
        let mut b = bus.connect(ComponentRegistration::new("b", "agent")).await.unwrap();
        bus.subscribe("a", MessageType::Request).await.unwrap();
        bus.subscribe("b", MessageType::Request).await.unwrap();
        bus.drain().await;

        let original = Message::broadcast(
            "a",
            MessagePayload::Request {
                body: serde_json::json!("news"),
            },
        );
        let original_id = original.id;
        bus.send(original).await.unwrap();
        bus.drain().await;

        assert!(a.drain().is_empty());
        let got = b.drain();
        assert_eq!(got.len(), 1);
        assert_ne!(got[0].id, original_id);
        assert_eq!(got[0].sender, "a");
        assert_eq!(got[0].receiver, Recipient::Component("b".into()));
    }

    #[tokio::test]
    async fn test_subscribe_requires_registration() {
        let bus = bus();
        let err = bus
            .subscribe("ghost", MessageType::Heartbeat)
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::ComponentNotFound(_)));
        assert!(!bus.unsubscribe("ghost", MessageType::Heartbeat).await);
    }

    #[tokio::test]
    async fn test_handler_outputs_are_enqueued() {
        let bus = bus();
        let mut inbox = bus
            .connect(ComponentRegistration::new("client", "agent"))
            .await
            .unwrap();
        bus.register(ComponentRegistration::new("echo", "service"))
            .await
            .unwrap();
        bus.set_handler(
            MessageType::Request,
            handler_fn(|msg| {
                Ok(vec![Message::reply(
                    msg,
                    "echo",
                    MessagePayload::Response {
                        body: serde_json::json!("pong"),
                    },
                )])
            }),
        )
        .await;
        bus.drain().await;

        let ping = request("client", "echo", serde_json::json!("ping"));
        let ping_id = ping.id;
        bus.send(ping).await.unwrap();
        bus.drain().await;

        let replies = inbox.drain();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].reply_to, Some(ping_id));
        assert_eq!(replies[0].message_type(), MessageType::Response);
    }

    #[tokio::test]
    async fn test_handler_error_reported_to_sender() {
        let bus = bus();
        let mut inbox = bus
            .connect(ComponentRegistration::new("client", "agent"))
            .await
            .unwrap();
        bus.register(ComponentRegistration::new("svc", "service"))
            .await
            .unwrap();
        bus.set_handler(
            MessageType::Request,
            handler_fn(|_| Err(SwitchboardError::Config("boom".into()))),
        )
        .await;
        bus.drain().await;

        let bad = request("client", "svc", serde_json::json!(null));
        let bad_id = bad.id;
        bus.send(bad).await.unwrap();
        bus.drain().await;

        let errors: Vec<Message> = inbox
            .drain()
            .into_iter()
            .filter(|m| m.message_type() == MessageType::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].reply_to, Some(bad_id));
        assert_eq!(errors[0].sender, BUS_ID);
        assert_eq!(bus.status().await.handler_failures, 1);
    }

    #[tokio::test]
    async fn test_handler_panic_does_not_stop_delivery() {
        let bus = bus();
        let mut inbox = bus
            .connect(ComponentRegistration::new("client", "agent"))
            .await
            .unwrap();
        bus.set_handler(MessageType::Request, handler_fn(|_| panic!("handler exploded")))
            .await;
        bus.drain().await;

        bus.send(request("client", "client", serde_json::json!(1)))
            .await
            .unwrap();
        bus.send(Message::new("client", "client", MessagePayload::Heartbeat))
            .await
            .unwrap();
        bus.drain().await;

        let received = inbox.drain();
        let types: Vec<MessageType> = received.iter().map(Message::message_type).collect();
        assert!(types.contains(&MessageType::Request));
        assert!(types.contains(&MessageType::Heartbeat));
        assert!(types.contains(&MessageType::Error));
        assert_eq!(bus.status().await.handler_failures, 1);
    }

    #[tokio::test]
    async fn test_handler_runs_for_every_message_of_its_type() {
        let bus = bus();
        bus.register(ComponentRegistration::new("svc", "service"))
            .await
            .unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        bus.set_handler(
            MessageType::Heartbeat,
            handler_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            }),
        )
        .await;

        for _ in 0..3 {
            bus.send(Message::new("svc", "svc", MessagePayload::Heartbeat))
                .await
                .unwrap();
        }
        bus.send(Message::broadcast("svc", MessagePayload::Heartbeat))
            .await
            .unwrap();
        bus.drain().await;
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let registry = Arc::new(ComponentRegistry::new(Duration::from_secs(60)));
        let config = BusConfig {
            history_limit: 3,
            ..BusConfig::default()
        };
        let bus = MessageBus::new(config, registry);
        bus.register(ComponentRegistration::new("svc", "service"))
            .await
            .unwrap();
        for i in 0..5 {
            bus.send(request("svc", "svc", serde_json::json!(i)))
                .await
                .unwrap();
        }
        bus.drain().await;

        let history = bus.history(10);
        assert_eq!(history.len(), 3);
        let bodies: Vec<serde_json::Value> = history
            .iter()
            .map(|m| match &m.payload {
                MessagePayload::Request { body } => body.clone(),
                _ => serde_json::Value::Null,
            })
            .collect();
        assert_eq!(bodies, vec![serde_json::json!(2), serde_json::json!(3), serde_json::json!(4)]);
        assert_eq!(bus.history(1).len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_message_refreshes_sender() {
        let bus = bus();
        bus.register(ComponentRegistration::new("agent", "agent"))
            .await
            .unwrap();
        let before = bus.registry().get("agent").await.unwrap().last_seen;
        tokio::time::sleep(Duration::from_millis(5)).await;
        bus.send(Message::new("agent", "agent", MessagePayload::Heartbeat))
            .await
            .unwrap();
        bus.drain().await;
        let after = bus.registry().get("agent").await.unwrap().last_seen;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_reply_resolves_waiter() {
        let bus = bus();
        let mut worker = bus
            .connect(ComponentRegistration::new("worker", "agent"))
            .await
            .unwrap();
        bus.register(ComponentRegistration::new("client", "agent"))
            .await
            .unwrap();
        let delivery = bus.spawn();

        let responder_bus = bus.clone();
        let responder = tokio::spawn(async move {
            while let Some(msg) = worker.recv().await {
                if msg.message_type() == MessageType::Request {
                    let reply = Message::reply(
                        &msg,
                        "worker",
                        MessagePayload::Response {
                            body: serde_json::json!("done"),
                        },
                    );
                    responder_bus.send(reply).await.unwrap();
                    break;
                }
            }
        });

        let ask = request("client", "worker", serde_json::json!("work")).with_priority(Priority::High);
        let ask_id = ask.id;
        let reply = bus
            .send_and_await_reply(ask, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.reply_to, Some(ask_id));
        assert_eq!(bus.pending_reply_count().await, 0);

        responder.await.unwrap();
        bus.close().await;
        delivery.await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_timeout_clears_waiter() {
        let bus = bus();
        bus.register(ComponentRegistration::new("silent", "agent"))
            .await
            .unwrap();
        let delivery = bus.spawn();

        let err = bus
            .send_and_await_reply(
                request("client", "silent", serde_json::json!(null)),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::ReplyTimeout { timeout_ms: 50, .. }));
        assert_eq!(bus.pending_reply_count().await, 0);

        bus.close().await;
        delivery.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_waiter_rejected() {
        let bus = bus();
        bus.register(ComponentRegistration::new("silent", "agent"))
            .await
            .unwrap();
        let msg = request("client", "silent", serde_json::json!(null));
        let duplicate = msg.clone();

        let first_bus = bus.clone();
        let first = tokio::spawn(async move {
            first_bus
                .send_and_await_reply(msg, Duration::from_millis(200))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = bus
            .send_and_await_reply(duplicate, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::DuplicateWaiter(_)));

        assert!(matches!(
            first.await.unwrap(),
            Err(SwitchboardError::ReplyTimeout { .. })
        ));
        assert_eq!(bus.pending_reply_count().await, 0);
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_sends() {
        let bus = bus();
        bus.close().await;
        let err = bus
            .send(request("a", "b", serde_json::json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::BusClosed));
        assert!(bus.status().await.closed);
    }

    #[tokio::test]
    async fn test_disconnect_drops_subscriptions_and_announces() {
        let bus = bus();
        let mut watcher = bus
            .connect(ComponentRegistration::new("watcher", "agent"))
            .await
            .unwrap();
        bus.connect(ComponentRegistration::new("leaver", "agent"))
            .await
            .unwrap();
        bus.subscribe("watcher", MessageType::ComponentUnregistered)
            .await
            .unwrap();
        bus.subscribe("leaver", MessageType::Request).await.unwrap();

        bus.disconnect("leaver").await.unwrap();
        bus.drain().await;

        assert!(bus.subscribers(MessageType::Request).await.is_empty());
        let events = watcher.drain();
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            MessagePayload::ComponentUnregistered(event) => {
                assert_eq!(event.component_id, "leaver");
                assert_eq!(event.reason, Some(UnregisterReason::Explicit));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_reregistration_evicts_previous_instance() {
        let registry = Arc::new(ComponentRegistry::new(Duration::from_millis(20)));
        let bus = MessageBus::new(BusConfig::default(), registry);
        let mut watcher = bus
            .connect(ComponentRegistration::new("watcher", "agent"))
            .await
            .unwrap();
        bus.subscribe("watcher", MessageType::ComponentUnregistered)
            .await
            .unwrap();
        let mut previous = bus
            .connect(ComponentRegistration::new("flaky", "agent"))
            .await
            .unwrap();
        bus.subscribe("flaky", MessageType::Request).await.unwrap();
        bus.drain().await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        let _current = bus
            .connect(ComponentRegistration::new("flaky", "agent"))
            .await
            .unwrap();
        bus.drain().await;

        assert!(previous.recv().await.is_none());
        assert!(bus.subscribers(MessageType::Request).await.is_empty());
        let events = watcher.drain();
        assert_eq!(events.len(), 1);
        match &events[0].payload {
            MessagePayload::ComponentUnregistered(event) => {
                assert_eq!(event.component_id, "flaky");
                assert_eq!(event.reason, Some(UnregisterReason::LivenessTimeout));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(bus.registry().contains("flaky").await);
    }
}
