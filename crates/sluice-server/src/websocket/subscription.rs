//! Per-stream subscription state: replay buffering, live promotion, and
//! the watermark that keeps the replay/live boundary duplicate-free.

use std::sync::Arc;

use sluice_proto::StoredEvent;

/// What the session loop should do with a live event for a subscription.
#[derive(Debug, PartialEq, Eq)]
pub enum LiveAction {
    /// Forward to the client now.
    Forward,
    /// Held in the replay buffer, flushed after `replay-end`.
    Buffered,
    /// Buffer capacity exhausted; the connection must error and close.
    Overflow,
    /// Not deliverable: already covered by replay, or the subscription is
    /// degraded.
    Discard,
}

/// Delivery phase for one subscribed stream.
#[derive(Debug)]
pub enum DeliveryState {
    /// Replay in flight; live events buffer until it completes.
    Replaying {
        /// Events broadcast while the replay read is outstanding.
        buffer: Vec<Arc<StoredEvent>>,
    },
    /// Replay done; live events forward directly.
    Live {
        /// Watermark separating replayed history from must-forward events.
        last_replay_seq: i64,
    },
    /// Replay failed; nothing is delivered until the client resubscribes.
    Failed,
}

/// One connection's view of one stream.
pub struct Subscription {
    /// Token tying replay results to the subscribe that spawned them; a
    /// result carrying an older generation is stale and discarded.
    pub generation: u64,
    /// Current delivery phase.
    pub state: DeliveryState,
}

impl Subscription {
    /// A fresh subscription, replaying with an empty buffer.
    pub fn new(generation: u64) -> Self {
        Self { generation, state: DeliveryState::Replaying { buffer: Vec::new() } }
    }

    /// Route a live event according to the current phase.
    ///
    /// While replaying, the event lands in the buffer unless that would
    /// exceed `max_buffer`. Once live, events at or below the replay
    /// watermark are duplicates of replayed history and are discarded.
    pub fn accept_live(&mut self, event: &Arc<StoredEvent>, max_buffer: usize) -> LiveAction {
        match &mut self.state {
            DeliveryState::Replaying { buffer } => {
                if buffer.len() >= max_buffer {
                    return LiveAction::Overflow;
                }
                buffer.push(Arc::clone(event));
                LiveAction::Buffered
            }
            DeliveryState::Live { last_replay_seq } => {
                if event.seq > *last_replay_seq {
                    LiveAction::Forward
                } else {
                    LiveAction::Discard
                }
            }
            DeliveryState::Failed => LiveAction::Discard,
        }
    }

    /// Promote to live and return the buffered events above the
    /// watermark, in arrival order.
    pub fn complete_replay(&mut self, last_replay_seq: i64) -> Vec<Arc<StoredEvent>> {
        let previous = std::mem::replace(&mut self.state, DeliveryState::Live { last_replay_seq });
        let buffer = match previous {
            DeliveryState::Replaying { buffer } => buffer,
            DeliveryState::Live { .. } | DeliveryState::Failed => Vec::new(),
        };
        buffer.into_iter().filter(|event| event.seq > last_replay_seq).collect()
    }

    /// Park the subscription after a failed replay, dropping the buffer.
    pub fn fail_replay(&mut self) {
        self.state = DeliveryState::Failed;
    }

    /// Whether the subscription reached live delivery.
    pub fn is_live(&self) -> bool {
        matches!(self.state, DeliveryState::Live { .. })
    }

    /// Number of events currently held in the replay buffer.
    pub fn buffered(&self) -> usize {
        match &self.state {
            DeliveryState::Replaying { buffer } => buffer.len(),
            DeliveryState::Live { .. } | DeliveryState::Failed => 0,
        }
    }
}
