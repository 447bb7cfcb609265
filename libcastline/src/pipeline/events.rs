//! In-process pipeline events
//!
//! A `tokio::sync::broadcast` bus. Emitting never blocks and never fails:
//! with no subscribers the event is dropped, and a lagging subscriber loses
//! the oldest events rather than slowing the dispatch loop down.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{PostStatus, TargetStatus};

pub type EventReceiver = broadcast::Receiver<PipelineEvent>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer before old events are dropped
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    PostScheduled {
        post_id: String,
        targets: usize,
        scheduled_at: i64,
    },

    TargetClaimed {
        target_id: String,
        post_id: String,
        /// Number of the attempt about to run
        attempt: u32,
    },

    TargetResolved {
        target_id: String,
        post_id: String,
        status: TargetStatus,
        attempt_count: u32,
        next_attempt_at: Option<i64>,
        reason: Option<String>,
    },

    StaleClaimRecovered {
        target_id: String,
        post_id: String,
        claimed_at: Option<i64>,
    },

    /// Every target of the post reached a terminal state
    PostResolved { post_id: String, status: PostStatus },

    PostCancelled { post_id: String },
}
