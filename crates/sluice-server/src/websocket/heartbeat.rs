//! Heartbeat liveness state for a single connection.

use tokio::time::{Instant, sleep_until};

/// Liveness tracking driven by the session loop.
///
/// The loop sends a protocol `ping` on a fixed interval and arms the pong
/// deadline; a client `pong` disarms it. The loop selects on
/// [`pong_deadline`], so an expired deadline wakes it even when the
/// connection is otherwise silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// No ping outstanding.
    Idle,
    /// Ping sent; a pong must arrive before the deadline.
    AwaitingPong {
        /// When the connection is declared dead.
        deadline: Instant,
    },
}

impl HeartbeatState {
    /// Arm the deadline after sending a ping.
    pub fn ping_sent(deadline: Instant) -> Self {
        Self::AwaitingPong { deadline }
    }

    /// Disarm on pong. A pong with no ping outstanding is a no-op.
    pub fn pong_received(&mut self) {
        *self = Self::Idle;
    }

    /// The armed deadline, if any.
    pub fn deadline(self) -> Option<Instant> {
        match self {
            Self::Idle => None,
            Self::AwaitingPong { deadline } => Some(deadline),
        }
    }

    /// Whether a ping is outstanding.
    pub fn is_awaiting(self) -> bool {
        matches!(self, Self::AwaitingPong { .. })
    }
}

/// Resolve when the armed pong deadline passes; pend forever while idle.
pub async fn pong_deadline(state: HeartbeatState) {
    match state.deadline() {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
