//! Process-wide publish/subscribe fan-out keyed by session id, plus a
//! bounded per-session debug ring buffer, backed by a `DashMap` of
//! `tokio::sync::broadcast` channels so one process can host many
//! sessions at once.

use crate::events::AgentEvent;
use agentcore_types::SessionKey;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

const RING_BUFFER_CAP: usize = 400;
const BROADCAST_CAP: usize = 256;

struct SessionChannel {
    tx: broadcast::Sender<AgentEvent>,
    ring: Mutex<std::collections::VecDeque<(u64, AgentEvent)>>,
}

#[derive(Clone, Debug)]
pub struct LoggedEvent {
    pub timestamp_ms: u64,
    pub event: AgentEvent,
}

pub struct EventEmitter {
    sessions: DashMap<SessionKey, SessionChannel>,
    debug_enabled: AtomicBool,
}

impl EventEmitter {
    pub fn new(debug_enabled: bool) -> Self {
        Self {
            sessions: DashMap::new(),
            debug_enabled: AtomicBool::new(debug_enabled),
        }
    }

    /// Flip debug ring-buffer capture on or off; takes effect on the next
    /// `broadcast` call. Lets `configure()` toggle it at runtime instead of
    /// it being frozen at construction.
    pub fn set_debug_enabled(&self, enabled: bool) {
        self.debug_enabled.store(enabled, Ordering::Relaxed);
    }

    fn channel(&self, session_id: &SessionKey) -> dashmap::mapref::one::Ref<'_, SessionKey, SessionChannel> {
        if !self.sessions.contains_key(session_id) {
            let (tx, _rx) = broadcast::channel(BROADCAST_CAP);
            self.sessions.insert(
                session_id.clone(),
                SessionChannel {
                    tx,
                    ring: Mutex::new(std::collections::VecDeque::new()),
                },
            );
        }
        self.sessions.get(session_id).expect("just inserted")
    }

    pub fn subscribe(&self, session_id: &SessionKey) -> broadcast::Receiver<AgentEvent> {
        self.channel(session_id).tx.subscribe()
    }

    /// Broadcast an event to all subscribers of `session_id`; if debug
    /// logging is enabled, also append it to the bounded ring buffer.
    pub fn broadcast(&self, session_id: &SessionKey, event: AgentEvent, timestamp_ms: u64) {
        let chan = self.channel(session_id);
        let _ = chan.tx.send(event.clone());

        if self.debug_enabled.load(Ordering::Relaxed) {
            let mut ring = chan.ring.lock().expect("ring buffer mutex poisoned");
            if ring.len() >= RING_BUFFER_CAP {
                ring.pop_front();
            }
            ring.push_back((timestamp_ms, event));
        }
    }

    /// Newest-first, capped at `limit` (itself capped at 500).
    pub fn recent(&self, session_id: &SessionKey, limit: usize) -> Vec<LoggedEvent> {
        let limit = limit.min(500);
        let Some(chan) = self.sessions.get(session_id) else {
            return Vec::new();
        };
        let ring = chan.ring.lock().expect("ring buffer mutex poisoned");
        ring.iter()
            .rev()
            .take(limit)
            .map(|(ts, ev)| LoggedEvent {
                timestamp_ms: *ts,
                event: ev.clone(),
            })
            .collect()
    }

    pub fn clear(&self, session_id: &SessionKey) {
        if let Some(chan) = self.sessions.get(session_id) {
            chan.ring.lock().expect("ring buffer mutex poisoned").clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_is_empty_for_unknown_session_without_panicking() {
        let emitter = EventEmitter::new(true);
        let session = SessionKey::new("nonexistent");
        assert!(emitter.recent(&session, 10).is_empty());
    }

    #[test]
    fn ring_buffer_caps_at_400_and_drops_oldest() {
        let emitter = EventEmitter::new(true);
        let session = SessionKey::new("s1");
        for i in 0..450u64 {
            emitter.broadcast(&session, AgentEvent::AgentStart, i);
        }
        let recent = emitter.recent(&session, 500);
        assert_eq!(recent.len(), RING_BUFFER_CAP);
        assert_eq!(recent[0].timestamp_ms, 449);
    }

    #[test]
    fn ring_buffer_disabled_when_debug_off() {
        let emitter = EventEmitter::new(false);
        let session = SessionKey::new("s1");
        emitter.broadcast(&session, AgentEvent::AgentStart, 0);
        assert!(emitter.recent(&session, 10).is_empty());
    }

    #[test]
    fn clear_empties_the_ring_buffer() {
        let emitter = EventEmitter::new(true);
        let session = SessionKey::new("s1");
        emitter.broadcast(&session, AgentEvent::AgentStart, 0);
        emitter.clear(&session);
        assert!(emitter.recent(&session, 10).is_empty());
    }

    #[tokio::test]
    async fn subscriber_receives_broadcast_events() {
        let emitter = EventEmitter::new(false);
        let session = SessionKey::new("s1");
        let mut rx = emitter.subscribe(&session);
        emitter.broadcast(&session, AgentEvent::AgentAbort, 0);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, AgentEvent::AgentAbort));
    }
}
