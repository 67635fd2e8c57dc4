//! In-process event bus with per-session retention
//!
//! Publish/subscribe over Tokio broadcast channels. Each session keeps a
//! ring of its last K frames so a reconnecting subscriber can request the
//! missed tail with `events_since`. The ring is an accelerator only; the
//! canonical record is the persisted snapshot plus the audit log, and a
//! process restart discards the ring.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::{CouncilEvent, SessionFrame};

/// Default per-session retention window.
const DEFAULT_RETENTION: usize = 1024;

/// Broadcast channel capacity per session.
const CHANNEL_CAPACITY: usize = 256;

/// Error type for bus operations
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("lock poisoned")]
    LockPoisoned,
}

/// Result type for bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

struct SessionChannel {
    next_seq: u64,
    ring: VecDeque<SessionFrame>,
    sender: broadcast::Sender<SessionFrame>,
}

impl SessionChannel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            next_seq: 0,
            ring: VecDeque::new(),
            sender,
        }
    }
}

/// Per-session ordered pub/sub with a bounded replay tail.
pub struct EventBus {
    sessions: Mutex<HashMap<String, SessionChannel>>,
    retention: usize,
}

impl EventBus {
    /// Create a bus with the default retention window (1024 frames).
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Create a bus retaining the last `retention` frames per session.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            retention: retention.max(1),
        }
    }

    /// Create a shared reference to this bus.
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event for a session, assigning the next sequence number.
    ///
    /// Sequence assignment happens under the session lock, so frame order
    /// is total per session even with concurrent publishers.
    pub fn publish(&self, session_id: &str, event: CouncilEvent) -> EventBusResult<SessionFrame> {
        let mut sessions = self.sessions.lock().map_err(|_| EventBusError::LockPoisoned)?;
        let channel = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionChannel::new);

        let frame = SessionFrame {
            session_id: session_id.to_string(),
            seq: channel.next_seq,
            timestamp: Utc::now(),
            event,
        };
        channel.next_seq += 1;

        channel.ring.push_back(frame.clone());
        while channel.ring.len() > self.retention {
            // Slow subscribers lose the oldest frames; the store has them.
            channel.ring.pop_front();
        }

        // No receivers is fine; the frame is retained for replay.
        let receivers = channel.sender.send(frame.clone()).unwrap_or(0);
        debug!(
            session_id,
            seq = frame.seq,
            event = frame.event.event_type(),
            receivers,
            "frame published"
        );

        Ok(frame)
    }

    /// Subscribe to live frames for a session.
    pub fn subscribe(&self, session_id: &str) -> EventBusResult<broadcast::Receiver<SessionFrame>> {
        let mut sessions = self.sessions.lock().map_err(|_| EventBusError::LockPoisoned)?;
        let channel = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionChannel::new);
        Ok(channel.sender.subscribe())
    }

    /// Retained frames with `seq > since`, oldest first.
    ///
    /// A reconnecting client replays this tail, then switches to its live
    /// subscription.
    pub fn events_since(&self, session_id: &str, since: u64) -> EventBusResult<Vec<SessionFrame>> {
        let sessions = self.sessions.lock().map_err(|_| EventBusError::LockPoisoned)?;
        Ok(sessions
            .get(session_id)
            .map(|channel| {
                channel
                    .ring
                    .iter()
                    .filter(|f| f.seq > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Every retained frame for a session, oldest first.
    pub fn retained(&self, session_id: &str) -> EventBusResult<Vec<SessionFrame>> {
        let sessions = self.sessions.lock().map_err(|_| EventBusError::LockPoisoned)?;
        Ok(sessions
            .get(session_id)
            .map(|channel| channel.ring.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Highest sequence number assigned for a session, if any.
    pub fn last_seq(&self, session_id: &str) -> EventBusResult<Option<u64>> {
        let sessions = self.sessions.lock().map_err(|_| EventBusError::LockPoisoned)?;
        Ok(sessions
            .get(session_id)
            .and_then(|channel| channel.next_seq.checked_sub(1)))
    }

    /// Drop a session's channel and retained frames.
    pub fn drop_session(&self, session_id: &str) -> EventBusResult<()> {
        let mut sessions = self.sessions.lock().map_err(|_| EventBusError::LockPoisoned)?;
        sessions.remove(session_id);
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
