//! Message Router: typed request/response with correlation ids, a bounded
//! outbound retry queue, broadcast with per-subscriber filters, and a rolling
//! message log.
//!
//! Grounded on `radium_core::collaboration::message_bus::MessageBus`
//! (per-agent `mpsc::UnboundedSender` registry, register/send/broadcast
//! shape) merged with `radium_orchestrator::queue::ExecutionQueue`'s bounded
//! FIFO-with-retry queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::time::{self, Duration};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::interfaces::{AgentLookup, FileLockService};

pub const MAX_QUEUE_SIZE: usize = 1000;
pub const MAX_RETRY_COUNT: u32 = 3;
pub const MAX_IPC_MESSAGE_SIZE: usize = 1024 * 1024;
pub const QUEUE_PROCESSING_INTERVAL_MS: u64 = 100;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const MESSAGE_LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Request,
    Response,
    Notification,
    Status,
    Artifact,
    Error,
    Control,
}

/// A typed unit of IPC. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub message_type: MessageType,
    pub from: String,
    pub to: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub correlation_id: Option<String>,
}

pub const BROADCAST_TARGET: &str = "broadcast";

#[derive(Debug, Default, Clone)]
pub struct SubscriptionFilter {
    pub message_types: Option<Vec<MessageType>>,
    pub from_filter: Option<String>,
}

impl SubscriptionFilter {
    fn matches(&self, msg: &AgentMessage) -> bool {
        if let Some(types) = &self.message_types {
            if !types.contains(&msg.message_type) {
                return false;
            }
        }
        if let Some(from) = &self.from_filter {
            if from != &msg.from {
                return false;
            }
        }
        true
    }
}

struct Subscription {
    sender: mpsc::UnboundedSender<AgentMessage>,
    filter: SubscriptionFilter,
}

struct PendingEntry {
    resolver: oneshot::Sender<AgentMessage>,
}

struct QueueEntry {
    message: AgentMessage,
    retry_count: u32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("unknown target: {0}")]
    UnknownTarget(String),
    #[error("invalid message: {field} — {reason}")]
    InvalidMessage { field: &'static str, reason: String },
    #[error("request timed out after {0}ms")]
    Timeout(u64),
    #[error("router disposed")]
    Disposed,
}

struct Inner {
    subscriptions: HashMap<String, Subscription>,
    pending: HashMap<String, PendingEntry>,
    queue: VecDeque<QueueEntry>,
    log: VecDeque<AgentMessage>,
}

/// Notification fan-out for lock events, distinct from agent-addressed
/// [`AgentMessage`] delivery.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    LockAcquired { file_path: String, agent_id: String },
    LockReleased { lock_id: String },
}

/// Routes typed messages between agents and the orchestrator.
pub struct MessageRouter {
    agent_lookup: Arc<dyn AgentLookup>,
    inner: RwLock<Inner>,
    events: broadcast::Sender<RouterEvent>,
    queue_shutdown: RwLock<Option<watch::Sender<()>>>,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter").finish_non_exhaustive()
    }
}

impl MessageRouter {
    #[must_use]
    pub fn new(agent_lookup: Arc<dyn AgentLookup>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            agent_lookup,
            inner: RwLock::new(Inner {
                subscriptions: HashMap::new(),
                pending: HashMap::new(),
                queue: VecDeque::new(),
                log: VecDeque::new(),
            }),
            events,
            queue_shutdown: RwLock::new(None),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    pub async fn subscribe(
        &self,
        agent_id: &str,
        filter: SubscriptionFilter,
    ) -> mpsc::UnboundedReceiver<AgentMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .write()
            .await
            .subscriptions
            .insert(agent_id.to_string(), Subscription { sender: tx, filter });
        rx
    }

    pub async fn unsubscribe(&self, agent_id: &str) {
        self.inner.write().await.subscriptions.remove(agent_id);
    }

    fn validate(msg: &AgentMessage) -> Result<(), RouterError> {
        if msg.id.is_empty() {
            return Err(RouterError::InvalidMessage { field: "id", reason: "must not be empty".to_string() });
        }
        if msg.from.is_empty() {
            return Err(RouterError::InvalidMessage { field: "from", reason: "must not be empty".to_string() });
        }
        if msg.to.is_empty() {
            return Err(RouterError::InvalidMessage { field: "to", reason: "must not be empty".to_string() });
        }
        Ok(())
    }

    fn enforce_size_policy(mut msg: AgentMessage) -> AgentMessage {
        let size = serde_json::to_vec(&msg.payload).map(|v| v.len()).unwrap_or(0);
        if size > MAX_IPC_MESSAGE_SIZE {
            msg.payload = serde_json::json!({
                "_truncated": true,
                "_originalSize": size,
            });
        }
        msg
    }

    pub async fn route_message(&self, msg: AgentMessage) -> Result<(), RouterError> {
        Self::validate(&msg)?;
        let msg = Self::enforce_size_policy(msg);
        self.log_message(msg.clone()).await;

        if msg.to == BROADCAST_TARGET {
            for agent_id in self.agent_lookup.active_agent_ids().await {
                if agent_id == msg.from {
                    continue;
                }
                self.deliver_or_enqueue(&agent_id, msg.clone()).await;
            }
            return Ok(());
        }

        if !self.agent_lookup.is_known(&msg.to).await {
            return Err(RouterError::UnknownTarget(msg.to));
        }
        self.deliver_or_enqueue(&msg.to.clone(), msg).await;
        Ok(())
    }

    async fn deliver_or_enqueue(&self, to: &str, msg: AgentMessage) {
        if self.agent_lookup.is_deliverable(to).await {
            if let Err(err) = self.agent_lookup.deliver(to, msg.payload.clone()).await {
                warn!(target = %to, %err, "delivery failed, enqueueing");
                self.enqueue(msg).await;
            }
        } else {
            self.enqueue(msg).await;
        }
    }

    async fn enqueue(&self, msg: AgentMessage) {
        let mut inner = self.inner.write().await;
        if inner.queue.len() >= MAX_QUEUE_SIZE {
            inner.queue.pop_front();
        }
        inner.queue.push_back(QueueEntry { message: msg, retry_count: 0 });
    }

    async fn log_message(&self, msg: AgentMessage) {
        let mut inner = self.inner.write().await;
        inner.log.push_front(msg);
        while inner.log.len() > MESSAGE_LOG_CAPACITY {
            inner.log.pop_back();
        }
    }

    pub async fn get_message_log(&self, limit: usize) -> Vec<AgentMessage> {
        self.inner.read().await.log.iter().take(limit).cloned().collect()
    }

    pub async fn send_request(
        &self,
        to: &str,
        payload: serde_json::Value,
        timeout_ms: u64,
    ) -> Result<AgentMessage, RouterError> {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.write().await.pending.insert(correlation_id.clone(), PendingEntry { resolver: tx });

        let msg = AgentMessage {
            id: Uuid::new_v4().to_string(),
            message_type: MessageType::Request,
            from: "orchestrator".to_string(),
            to: to.to_string(),
            timestamp: Utc::now(),
            payload,
            correlation_id: Some(correlation_id.clone()),
        };
        self.route_message(msg).await?;

        match time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RouterError::Disposed),
            Err(_) => {
                self.inner.write().await.pending.remove(&correlation_id);
                Err(RouterError::Timeout(timeout_ms))
            }
        }
    }

    pub async fn send_response(
        &self,
        to: &str,
        payload: serde_json::Value,
        correlation_id: String,
    ) -> Result<(), RouterError> {
        let msg = AgentMessage {
            id: Uuid::new_v4().to_string(),
            message_type: MessageType::Response,
            from: to.to_string(),
            to: "orchestrator".to_string(),
            timestamp: Utc::now(),
            payload,
            correlation_id: Some(correlation_id),
        };
        self.route_message(msg).await
    }

    pub async fn handle_incoming_message(&self, msg: AgentMessage) {
        self.log_message(msg.clone()).await;

        if msg.message_type == MessageType::Response {
            if let Some(correlation_id) = &msg.correlation_id {
                let resolver = self.inner.write().await.pending.remove(correlation_id);
                if let Some(entry) = resolver {
                    let _ = entry.resolver.send(msg);
                    return;
                }
            }
        }

        let inner = self.inner.read().await;
        if let Some(sub) = inner.subscriptions.get(&msg.to) {
            if sub.filter.matches(&msg) {
                let _ = sub.sender.send(msg);
            }
        }
    }

    /// Spawns the background outbound-queue tick (grounded on
    /// `TaskDispatcher`'s periodic-tick loop). Idempotent.
    pub fn start_queue_processor(self: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_millis(QUEUE_PROCESSING_INTERVAL_MS));
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = interval.tick() => {
                        router.process_queue_tick().await;
                    }
                }
            }
        });
        if let Ok(mut guard) = self.queue_shutdown.try_write() {
            *guard = Some(shutdown_tx);
        }
    }

    pub async fn stop_queue_processor(&self) {
        if let Some(tx) = self.queue_shutdown.write().await.take() {
            let _ = tx.send(());
        }
    }

    async fn process_queue_tick(&self) {
        let entries: Vec<QueueEntry> = {
            let mut inner = self.inner.write().await;
            std::mem::take(&mut inner.queue).into_iter().collect()
        };

        let mut retained = VecDeque::new();
        for entry in entries {
            let to = entry.message.to.clone();
            if !self.agent_lookup.is_known(&to).await {
                continue;
            }
            if self.agent_lookup.is_deliverable(&to).await {
                if self.agent_lookup.deliver(&to, entry.message.payload.clone()).await.is_ok() {
                    continue;
                }
            }
            if entry.retry_count < MAX_RETRY_COUNT {
                retained.push_back(QueueEntry { retry_count: entry.retry_count + 1, ..entry });
            }
        }

        let mut inner = self.inner.write().await;
        for entry in retained.into_iter().rev() {
            inner.queue.push_front(entry);
        }
        debug!(queued = inner.queue.len(), "queue tick processed");
    }

    /// Re-emits lock-service events as `notification` broadcast messages.
    pub async fn fan_out_lock_event(&self, event: RouterEvent) {
        let _ = self.events.send(event.clone());
        let payload = match &event {
            RouterEvent::LockAcquired { file_path, agent_id } => serde_json::json!({
                "event": "lock_acquired",
                "filePath": file_path,
                "agentId": agent_id,
            }),
            RouterEvent::LockReleased { lock_id } => serde_json::json!({
                "event": "lock_released",
                "lockId": lock_id,
            }),
        };
        let msg = AgentMessage {
            id: Uuid::new_v4().to_string(),
            message_type: MessageType::Notification,
            from: "router".to_string(),
            to: BROADCAST_TARGET.to_string(),
            timestamp: Utc::now(),
            payload,
            correlation_id: None,
        };
        let _ = self.route_message(msg).await;
    }

    /// Subscribes to the lock service's own events and fans them out. No-op
    /// unless the collaborator exposes an event channel.
    pub fn watch_lock_service(self: &Arc<Self>, _lock_service: Arc<dyn FileLockService>) {
        // FileLockService exposes no broadcast channel in this design; lock
        // fan-out is driven explicitly by callers via `fan_out_lock_event`.
    }

    pub async fn dispose(&self) {
        self.stop_queue_processor().await;
        let mut inner = self.inner.write().await;
        inner.subscriptions.clear();
        inner.pending.clear();
        inner.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::test_doubles::MockAgentLookup;
    use std::sync::Arc;

    fn msg(from: &str, to: &str, message_type: MessageType) -> AgentMessage {
        AgentMessage {
            id: Uuid::new_v4().to_string(),
            message_type,
            from: from.to_string(),
            to: to.to_string(),
            timestamp: Utc::now(),
            payload: serde_json::json!({"hello": "world"}),
            correlation_id: None,
        }
    }

    #[tokio::test]
    async fn unknown_target_is_rejected() {
        let lookup = Arc::new(MockAgentLookup::default());
        let router = MessageRouter::new(lookup);
        let err = router.route_message(msg("a1", "ghost", MessageType::Notification)).await.unwrap_err();
        assert_eq!(err, RouterError::UnknownTarget("ghost".to_string()));
    }

    #[tokio::test]
    async fn deliverable_recipient_receives_immediately() {
        let lookup = Arc::new(MockAgentLookup::default());
        lookup.deliverable.lock().await.push("a2".to_string());
        let router = MessageRouter::new(lookup);
        router.route_message(msg("a1", "a2", MessageType::Notification)).await.unwrap();
        assert_eq!(router.get_message_log(10).await.len(), 1);
    }

    #[tokio::test]
    async fn oversized_payload_is_truncated_in_place() {
        let lookup = Arc::new(MockAgentLookup::default());
        lookup.deliverable.lock().await.push("a2".to_string());
        let router = MessageRouter::new(lookup);
        let big = "x".repeat(MAX_IPC_MESSAGE_SIZE + 1);
        let mut message = msg("a1", "a2", MessageType::Notification);
        message.payload = serde_json::json!({ "data": big });
        router.route_message(message).await.unwrap();
        let logged = router.get_message_log(1).await;
        assert_eq!(logged[0].payload["_truncated"], serde_json::json!(true));
        assert!(logged[0].payload["_originalSize"].as_u64().unwrap() > MAX_IPC_MESSAGE_SIZE as u64);
    }

    #[tokio::test]
    async fn send_request_resolves_on_matching_response() {
        let lookup = Arc::new(MockAgentLookup::default());
        lookup.deliverable.lock().await.push("a2".to_string());
        let router = Arc::new(MessageRouter::new(lookup));
        let r = Arc::clone(&router);
        let handle = tokio::spawn(async move { r.send_request("a2", serde_json::json!({}), 1_000).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let correlation_id = {
            let log = router.get_message_log(1).await;
            log[0].correlation_id.clone().unwrap()
        };
        router
            .handle_incoming_message(AgentMessage {
                id: Uuid::new_v4().to_string(),
                message_type: MessageType::Response,
                from: "a2".to_string(),
                to: "orchestrator".to_string(),
                timestamp: Utc::now(),
                payload: serde_json::json!({"ok": true}),
                correlation_id: Some(correlation_id.clone()),
            })
            .await;

        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.correlation_id, Some(correlation_id));
    }

    #[tokio::test]
    async fn send_request_times_out_and_clears_pending() {
        let lookup = Arc::new(MockAgentLookup::default());
        lookup.deliverable.lock().await.push("a2".to_string());
        let router = MessageRouter::new(lookup);
        let err = router.send_request("a2", serde_json::json!({}), 20).await.unwrap_err();
        assert_eq!(err, RouterError::Timeout(20));
        assert!(router.inner.read().await.pending.is_empty());
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let lookup = Arc::new(MockAgentLookup::default());
        lookup.deliverable.lock().await.push("a1".to_string());
        lookup.deliverable.lock().await.push("a2".to_string());
        let router = MessageRouter::new(lookup);
        router.route_message(msg("a1", BROADCAST_TARGET, MessageType::Notification)).await.unwrap();
        assert_eq!(router.get_message_log(10).await.len(), 1);
    }
}
