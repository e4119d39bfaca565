//! Pending-request queue between network tasks and the executor

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::protocol::JsonRpcReply;
use crate::session::ConnectionId;

/// What the executor produced for one request
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// `None` for notifications
    pub reply: Option<JsonRpcReply>,
    /// Session the request ran under, echoed as `Mcp-Session-Id`
    pub session_id: Option<String>,
    /// Set when `initialize` minted `session_id`
    pub created_session: bool,
}

impl DispatchOutcome {
    pub fn reply(reply: impl Into<JsonRpcReply>, session_id: Option<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            session_id,
            created_session: false,
        }
    }

    pub fn notification(session_id: Option<String>) -> Self {
        Self {
            reply: None,
            session_id,
            created_session: false,
        }
    }
}

/// Where the response for a queued request goes
#[derive(Debug)]
pub enum ResponseRoute {
    /// Back to the parked POST connection
    Direct(oneshot::Sender<DispatchOutcome>),
    /// Onto the session's event stream (legacy HTTP+SSE clients)
    Stream,
}

/// A validated request waiting for the executor
#[derive(Debug)]
pub struct PendingRequest {
    pub connection_id: ConnectionId,
    pub http_method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub session_id: Option<String>,
    pub route: ResponseRoute,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<PendingRequest>,
    closed: bool,
}

/// FIFO shared by every connection task (producers) and the executor
#[derive(Default)]
pub struct RequestQueue {
    inner: Mutex<QueueState>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue, handing the request back when the queue is closed
    pub fn push(&self, request: PendingRequest) -> Result<(), PendingRequest> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(request);
        }
        state.items.push_back(request);
        Ok(())
    }

    /// Take up to `max` requests in arrival order
    pub fn pop_batch(&self, max: usize) -> Vec<PendingRequest> {
        let mut state = self.inner.lock();
        let n = max.min(state.items.len());
        state.items.drain(..n).collect()
    }

    /// Refuse further pushes and return whatever was still queued
    pub fn close(&self) -> Vec<PendingRequest> {
        let mut state = self.inner.lock();
        state.closed = true;
        state.items.drain(..).collect()
    }

    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(connection_id: ConnectionId) -> PendingRequest {
        PendingRequest {
            connection_id,
            http_method: "POST".to_string(),
            path: "/".to_string(),
            headers: HashMap::new(),
            body: String::new(),
            session_id: None,
            route: ResponseRoute::Stream,
        }
    }

    #[test]
    fn test_pop_batch_is_bounded_and_ordered() {
        let queue = RequestQueue::new();
        for id in 0..5 {
            queue.push(request(id)).unwrap();
        }

        let first: Vec<_> = queue.pop_batch(3).iter().map(|r| r.connection_id).collect();
        assert_eq!(first, vec![0, 1, 2]);
        assert_eq!(queue.len(), 2);

        let rest: Vec<_> = queue.pop_batch(10).iter().map(|r| r.connection_id).collect();
        assert_eq!(rest, vec![3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_closed_queue_rejects_and_drains() {
        let queue = RequestQueue::new();
        queue.push(request(1)).unwrap();

        let drained = queue.close();
        assert_eq!(drained.len(), 1);
        let rejected = queue.push(request(2)).unwrap_err();
        assert_eq!(rejected.connection_id, 2);

        queue.reopen();
        assert!(queue.push(request(3)).is_ok());
    }
}
