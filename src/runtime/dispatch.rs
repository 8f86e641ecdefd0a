/// Dispatch channel
///
/// Hands `(workflow_id, step_id)` pairs to the workers of a lane. Delivery is
/// at-least-once and unordered across topics; within a lane the sequence gate
/// restores order.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    Mutex,
};
use uuid::Uuid;

/// One unit of routing work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMessage {
    pub workflow_id: Uuid,
    pub step_id: Uuid,
    pub chain_id: Option<u64>,
    /// Lane key string of the lane that advances this step
    pub topic: String,
    /// Lane sequence to pass through the gate; None bypasses the check
    pub sequence_number: Option<i64>,
}

impl DispatchMessage {
    /// Same work, no gate check: used when re-publishing a message whose
    /// sequence was already consumed
    pub fn without_sequence(mut self) -> Self {
        self.sequence_number = None;
        self
    }
}

/// Publishing side of the dispatch channel
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn publish(&self, message: DispatchMessage) -> Result<()>;
}

struct Topic {
    sender: UnboundedSender<DispatchMessage>,
    /// Taken by the single consumer of the topic
    receiver: Option<UnboundedReceiver<DispatchMessage>>,
}

impl Topic {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

/// In-process dispatcher: one tokio mpsc channel per topic
///
/// Messages published before anyone subscribes are buffered in the channel.
#[derive(Default)]
pub struct ChannelDispatcher {
    topics: Mutex<HashMap<String, Topic>>,
}

impl std::fmt::Debug for ChannelDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDispatcher").finish_non_exhaustive()
    }
}

impl ChannelDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the consuming end of `topic`; a topic has exactly one consumer
    pub async fn subscribe(&self, topic: &str) -> Result<UnboundedReceiver<DispatchMessage>> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(Topic::new)
            .receiver
            .take()
            .ok_or_else(|| EngineError::Dispatch(format!("Topic {} already has a consumer", topic)))
    }

    /// Give a consumer end back so another worker can pick the topic up
    pub async fn unsubscribe(&self, topic: &str, receiver: UnboundedReceiver<DispatchMessage>) {
        let mut topics = self.topics.lock().await;
        if let Some(entry) = topics.get_mut(topic) {
            entry.receiver = Some(receiver);
        }
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn publish(&self, message: DispatchMessage) -> Result<()> {
        let mut topics = self.topics.lock().await;
        let topic = topics.entry(message.topic.clone()).or_insert_with(Topic::new);

        tracing::debug!(
            "📨 Dispatching step {} of workflow {} on {} (sequence {:?})",
            message.step_id,
            message.workflow_id,
            message.topic,
            message.sequence_number
        );
        topic
            .sender
            .send(message)
            .map_err(|e| EngineError::Dispatch(format!("Topic {} is closed: {}", e.0.topic, e)))
    }
}

/// Publish `message` again after `delay` without blocking the caller
pub fn requeue_after<D>(dispatcher: std::sync::Arc<D>, message: DispatchMessage, delay: Duration)
where
    D: Dispatcher + ?Sized + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = dispatcher.publish(message).await {
            tracing::error!("❌ Failed to requeue dispatch message: {}", e);
        }
    });
}
