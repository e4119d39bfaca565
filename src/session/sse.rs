//! SSE connection registry
//!
//! The executor never writes to sockets. It hands frames to a connection's
//! outbox (an unbounded channel) under the registry lock; the connection's
//! own task does the writing. Responses for a session without an open stream
//! wait in that session's pending buffer until one is registered.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::http::SseFrame;

pub type ConnectionId = u64;

/// An open event stream
#[derive(Debug)]
pub struct SseConnection {
    pub connection_id: ConnectionId,
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
    /// Id of the last event handed to the outbox
    pub last_event_id: i32,
    pub active: bool,
    outbox: mpsc::UnboundedSender<SseFrame>,
}

impl SseConnection {
    /// Hand `data` to the outbox under the next event id. Fails when the
    /// writer is gone or the id counter is exhausted.
    fn push(&mut self, data: String) -> Result<i32, String> {
        let Some(id) = self.last_event_id.checked_add(1) else {
            return Err(data);
        };
        match self.outbox.send(SseFrame::message(id, data)) {
            Ok(()) => {
                self.last_event_id = id;
                Ok(id)
            }
            Err(mpsc::error::SendError(frame)) => Err(frame.data),
        }
    }
}

/// Result of registering a stream
#[derive(Debug)]
pub struct SseRegistration {
    pub receiver: mpsc::UnboundedReceiver<SseFrame>,
    /// Earlier stream of the same session that this one replaced
    pub superseded: Option<ConnectionId>,
    /// Buffered responses flushed into the new outbox
    pub flushed: usize,
}

/// Where a response went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Streamed {
        connection_id: ConnectionId,
        event_id: i32,
    },
    Buffered,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, SseConnection>,
    by_session: HashMap<String, ConnectionId>,
    pending: HashMap<String, VecDeque<String>>,
}

impl Registry {
    fn remove(&mut self, connection_id: ConnectionId) -> Option<SseConnection> {
        let mut conn = self.connections.remove(&connection_id)?;
        conn.active = false;
        if self.by_session.get(&conn.session_id) == Some(&connection_id) {
            self.by_session.remove(&conn.session_id);
        }
        Some(conn)
    }

    fn buffer(&mut self, session_id: &str, data: String) {
        self.pending
            .entry(session_id.to_string())
            .or_default()
            .push_back(data);
    }
}

/// Registry of open SSE connections, one active per session
#[derive(Default)]
pub struct SseRegistry {
    inner: Mutex<Registry>,
}

impl SseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream for `session_id`, superseding any previous one.
    ///
    /// Event ids continue after `resume_after` (the client's `Last-Event-ID`)
    /// or start at 1. A negative or exhausted `resume_after` restarts at 1.
    /// Buffered responses are flushed into the new outbox first, in arrival
    /// order, before any live event can be delivered.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        session_id: &str,
        resume_after: Option<i32>,
    ) -> SseRegistration {
        let (tx, receiver) = mpsc::unbounded_channel();
        let mut reg = self.inner.lock();

        let superseded = reg
            .by_session
            .get(session_id)
            .copied()
            .filter(|old| *old != connection_id);
        if let Some(old) = superseded {
            reg.remove(old);
        }

        let mut conn = SseConnection {
            connection_id,
            session_id: session_id.to_string(),
            connected_at: Utc::now(),
            last_event_id: resume_after
                .filter(|id| (0..i32::MAX).contains(id))
                .unwrap_or(0),
            active: true,
            outbox: tx,
        };

        let mut flushed = 0;
        if let Some(mut pending) = reg.pending.remove(session_id) {
            while let Some(data) = pending.pop_front() {
                // The receiver is still in hand; only the id counter can run out.
                if let Err(data) = conn.push(data) {
                    pending.push_front(data);
                    reg.pending.insert(session_id.to_string(), pending);
                    break;
                }
                flushed += 1;
            }
        }

        reg.by_session.insert(session_id.to_string(), connection_id);
        reg.connections.insert(connection_id, conn);

        SseRegistration {
            receiver,
            superseded,
            flushed,
        }
    }

    /// Remove a connection. The session mapping is only cleared if it still
    /// points at this connection.
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<SseConnection> {
        self.inner.lock().remove(connection_id)
    }

    pub fn find_active_for_session(&self, session_id: &str) -> Option<ConnectionId> {
        let reg = self.inner.lock();
        let id = reg.by_session.get(session_id)?;
        reg.connections
            .get(id)
            .filter(|c| c.active)
            .map(|c| c.connection_id)
    }

    /// Id the next event on this connection will carry
    pub fn next_event_id(&self, connection_id: ConnectionId) -> Option<i32> {
        self.inner
            .lock()
            .connections
            .get(&connection_id)
            .and_then(|c| c.last_event_id.checked_add(1))
    }

    /// Deliver a serialized response to the session's stream, or buffer it
    pub fn deliver(&self, session_id: &str, data: String) -> Delivery {
        let mut reg = self.inner.lock();
        let Some(connection_id) = reg.by_session.get(session_id).copied() else {
            reg.buffer(session_id, data);
            return Delivery::Buffered;
        };

        let pushed = match reg.connections.get_mut(&connection_id) {
            Some(conn) if conn.active => conn.push(data),
            _ => Err(data),
        };
        match pushed {
            Ok(event_id) => Delivery::Streamed {
                connection_id,
                event_id,
            },
            Err(data) => {
                // Writer task is gone without unregistering yet, or the
                // stream ran out of ids and the client has to reconnect.
                reg.remove(connection_id);
                reg.buffer(session_id, data);
                Delivery::Buffered
            }
        }
    }

    /// Handle a failed socket write: drop the connection and move the frame
    /// that failed, plus everything still queued in its outbox, back to the
    /// front of the session's buffer.
    pub fn fail(
        &self,
        connection_id: ConnectionId,
        failed: Option<SseFrame>,
        outbox: &mut mpsc::UnboundedReceiver<SseFrame>,
    ) -> Option<SseConnection> {
        let mut reg = self.inner.lock();
        let conn = reg.remove(connection_id)?;

        // The sender was dropped with the connection; nothing new can arrive.
        let mut undelivered: VecDeque<String> = failed
            .into_iter()
            .chain(std::iter::from_fn(|| outbox.try_recv().ok()))
            .filter(|f| f.event.as_deref() == Some("message"))
            .map(|f| f.data)
            .collect();

        if !undelivered.is_empty() {
            let pending = reg.pending.entry(conn.session_id.clone()).or_default();
            undelivered.append(pending);
            *pending = undelivered;
        }
        Some(conn)
    }

    /// Drop the session's stream and buffered responses
    pub fn close_session(&self, session_id: &str) -> Option<ConnectionId> {
        let mut reg = self.inner.lock();
        reg.pending.remove(session_id);
        let id = reg.by_session.get(session_id).copied()?;
        reg.remove(id).map(|c| c.connection_id)
    }

    /// Sessions that currently hold buffered responses
    pub fn pending_sessions(&self) -> Vec<String> {
        self.inner.lock().pending.keys().cloned().collect()
    }

    /// Drop a session's buffered responses, returning how many were dropped
    pub fn discard_pending(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .pending
            .remove(session_id)
            .map_or(0, |p| p.len())
    }

    /// Drop every stream; their writer tasks see the outbox close and exit
    pub fn close_all(&self) -> Vec<ConnectionId> {
        let mut reg = self.inner.lock();
        reg.by_session.clear();
        reg.pending.clear();
        reg.connections.drain().map(|(id, _)| id).collect()
    }

    pub fn pending_len(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .pending
            .get(session_id)
            .map_or(0, VecDeque::len)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<SseFrame>) -> Vec<SseFrame> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_buffer_then_flush_in_order() {
        let registry = SseRegistry::new();
        for i in 1..=3 {
            assert_eq!(registry.deliver("s", format!("r{i}")), Delivery::Buffered);
        }
        assert_eq!(registry.pending_len("s"), 3);

        let mut reg = registry.register(1, "s", None);
        assert_eq!(reg.flushed, 3);
        assert_eq!(registry.pending_len("s"), 0);

        assert_eq!(
            registry.deliver("s", "r4".to_string()),
            Delivery::Streamed {
                connection_id: 1,
                event_id: 4
            }
        );

        let frames = drain(&mut reg.receiver);
        let ids: Vec<i32> = frames.iter().filter_map(|f| f.id).collect();
        let data: Vec<&str> = frames.iter().map(|f| f.data.as_str()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(data, vec!["r1", "r2", "r3", "r4"]);
    }

    #[test]
    fn test_new_stream_supersedes_old() {
        let registry = SseRegistry::new();
        let mut first = registry.register(1, "s", None);
        let second = registry.register(2, "s", None);

        assert_eq!(second.superseded, Some(1));
        assert_eq!(registry.find_active_for_session("s"), Some(2));
        assert_eq!(registry.len(), 1);
        // Old outbox is closed once its sender is gone.
        assert!(matches!(
            first.receiver.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        // A late unregister from the old writer must not evict the new one.
        assert!(registry.unregister(1).is_none());
        assert_eq!(registry.find_active_for_session("s"), Some(2));
    }

    #[test]
    fn test_resume_after_last_event_id() {
        let registry = SseRegistry::new();
        let _reg = registry.register(5, "s", Some(41));
        assert_eq!(registry.next_event_id(5), Some(42));
    }

    #[test]
    fn test_out_of_range_last_event_id_restarts_at_one() {
        let registry = SseRegistry::new();
        let mut reg = registry.register(1, "s", Some(i32::MAX));
        assert_eq!(registry.next_event_id(1), Some(1));
        assert_eq!(
            registry.deliver("s", "x".to_string()),
            Delivery::Streamed {
                connection_id: 1,
                event_id: 1
            }
        );
        assert_eq!(drain(&mut reg.receiver)[0].id, Some(1));

        let _neg = registry.register(2, "t", Some(-7));
        assert_eq!(registry.next_event_id(2), Some(1));
    }

    #[test]
    fn test_exhausted_event_ids_end_the_stream() {
        let registry = SseRegistry::new();
        let mut reg = registry.register(1, "s", Some(i32::MAX - 1));
        assert_eq!(
            registry.deliver("s", "last".to_string()),
            Delivery::Streamed {
                connection_id: 1,
                event_id: i32::MAX
            }
        );
        assert_eq!(registry.next_event_id(1), None);

        // No id left: the stream is dropped and the response waits.
        assert_eq!(registry.deliver("s", "next".to_string()), Delivery::Buffered);
        assert_eq!(registry.find_active_for_session("s"), None);
        assert_eq!(registry.pending_len("s"), 1);
        let frames = drain(&mut reg.receiver);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            reg.receiver.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        // The client reconnects with the last id it saw and starts over.
        let mut next = registry.register(2, "s", frames[0].id);
        assert_eq!(next.flushed, 1);
        let frames = drain(&mut next.receiver);
        assert_eq!(frames[0].id, Some(1));
        assert_eq!(frames[0].data, "next");
    }

    #[test]
    fn test_flush_stops_when_ids_run_out() {
        let registry = SseRegistry::new();
        registry.deliver("s", "a".to_string());
        registry.deliver("s", "b".to_string());

        let mut reg = registry.register(1, "s", Some(i32::MAX - 1));
        assert_eq!(reg.flushed, 1);
        assert_eq!(registry.pending_len("s"), 1);
        let frames = drain(&mut reg.receiver);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "a");
    }

    #[test]
    fn test_discard_pending() {
        let registry = SseRegistry::new();
        registry.deliver("gone", "late".to_string());
        registry.deliver("gone", "later".to_string());
        registry.deliver("live", "x".to_string());

        let mut sessions = registry.pending_sessions();
        sessions.sort();
        assert_eq!(sessions, vec!["gone", "live"]);

        assert_eq!(registry.discard_pending("gone"), 2);
        assert_eq!(registry.discard_pending("gone"), 0);
        assert_eq!(registry.pending_len("gone"), 0);
        assert_eq!(registry.pending_len("live"), 1);
    }

    #[test]
    fn test_fail_requeues_undelivered_frames() {
        let registry = SseRegistry::new();
        let mut reg = registry.register(1, "s", None);
        registry.deliver("s", "a".to_string());
        registry.deliver("s", "b".to_string());
        registry.deliver("s", "c".to_string());

        // Writer took "a", failed writing it; "b" and "c" still queued.
        let failed = reg.receiver.try_recv().ok();
        let conn = registry.fail(1, failed, &mut reg.receiver).unwrap();
        assert!(!conn.active);
        assert_eq!(conn.last_event_id, 3);
        assert_eq!(registry.find_active_for_session("s"), None);

        assert_eq!(registry.deliver("s", "d".to_string()), Delivery::Buffered);
        assert_eq!(registry.pending_len("s"), 4);

        let mut next = registry.register(2, "s", None);
        let data: Vec<String> = drain(&mut next.receiver).into_iter().map(|f| f.data).collect();
        assert_eq!(data, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_deliver_to_dropped_receiver_buffers() {
        let registry = SseRegistry::new();
        let reg = registry.register(1, "s", None);
        drop(reg);

        assert_eq!(registry.deliver("s", "x".to_string()), Delivery::Buffered);
        assert_eq!(registry.pending_len("s"), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_session_and_all() {
        let registry = SseRegistry::new();
        let _a = registry.register(1, "a", None);
        let _b = registry.register(2, "b", None);
        registry.deliver("c", "x".to_string());

        assert_eq!(registry.close_session("a"), Some(1));
        assert_eq!(registry.len(), 1);

        let mut closed = registry.close_all();
        closed.sort();
        assert_eq!(closed, vec![2]);
        assert_eq!(registry.pending_len("c"), 0);
    }
}
