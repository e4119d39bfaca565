//! Single-threaded executor driven by the host's tick
//!
//! The host creates one [`BridgeExecutor`] on the thread that is allowed to
//! touch its tools (the editor's main thread) and calls [`BridgeExecutor::tick`]
//! once per frame. Network tasks never see the registry; the only way in is
//! the request queue.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};

use super::dispatcher::{panic_message, Dispatcher};
use super::queue::{DispatchOutcome, ResponseRoute};
use super::{ServerEvent, Shared};
use crate::protocol::JsonRpcError;
use crate::session::Delivery;
use crate::tools::ToolRegistry;

pub struct BridgeExecutor<R: ToolRegistry> {
    shared: Arc<Shared>,
    registry: R,
}

impl<R: ToolRegistry> BridgeExecutor<R> {
    pub(super) fn new(shared: Arc<Shared>, registry: R) -> Self {
        Self { shared, registry }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut R {
        &mut self.registry
    }

    /// Drain one bounded batch of queued requests. Never blocks; returns the
    /// number of requests processed.
    pub fn tick(&mut self) -> usize {
        let max = self.shared.config.read().max_requests_per_tick.max(1);
        let batch = self.shared.queue.pop_batch(max);
        if batch.is_empty() {
            return 0;
        }

        let dispatcher = Dispatcher::new(
            &self.registry,
            &self.shared.sessions,
            &self.shared.server_info,
        );
        let processed = batch.len();

        for request in batch {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                dispatcher.dispatch(&request.body, request.session_id.as_deref())
            }))
            .unwrap_or_else(|payload| {
                let details = panic_message(payload.as_ref());
                error!(connection_id = request.connection_id, error = %details, "dispatch panicked");
                DispatchOutcome::reply(
                    JsonRpcError::internal_error(Value::Null, details),
                    request.session_id.clone(),
                )
            });

            if outcome.created_session {
                if let Some(session_id) = &outcome.session_id {
                    self.shared.emit(ServerEvent::SessionOpened {
                        session_id: session_id.clone(),
                    });
                }
            }

            match request.route {
                ResponseRoute::Direct(reply_tx) => {
                    if reply_tx.send(outcome).is_err() {
                        debug!(
                            connection_id = request.connection_id,
                            "client went away before its response was ready"
                        );
                    }
                }
                ResponseRoute::Stream => {
                    let (Some(reply), Some(session_id)) = (outcome.reply, outcome.session_id)
                    else {
                        continue;
                    };
                    let id = reply.id().clone();
                    let is_error = reply.is_error();
                    // Closed or expired while queued: nobody can collect it.
                    if !self.shared.sessions.is_valid(&session_id) {
                        debug!(%session_id, %id, is_error, "session gone, response dropped");
                        continue;
                    }
                    match self.shared.streams.deliver(&session_id, reply.to_json()) {
                        Delivery::Streamed {
                            connection_id,
                            event_id,
                        } => debug!(%session_id, %id, is_error, connection_id, event_id, "response streamed"),
                        Delivery::Buffered => debug!(%session_id, %id, is_error, "response buffered"),
                    }
                }
            }
        }

        processed
    }
}

impl<R: ToolRegistry> Drop for BridgeExecutor<R> {
    fn drop(&mut self) {
        self.shared.executor_attached.store(false, Ordering::SeqCst);
    }
}
