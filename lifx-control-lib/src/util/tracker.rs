//! Correlates replies with the requests that caused them and resends requests
//! that go unanswered.
//!
//! Each request is sent with a correlation id that is unique among the requests
//! still in flight. A retry timer is armed per request; when it fires the
//! identical datagram is sent again until the retry budget is spent.
//!
//! Timers never touch tracker state themselves. They post a [`TimerFired`] into a
//! channel that the owner of the tracker drains, so timer handling is serialized
//! with frame handling.

use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{message_name, message_type, DeviceId, Frame};
use crate::util::config::RetryPolicy;
use crate::util::transport::{new_correlation_id, CorrelationId, OutboundRequest, Transport};

static NEXT_HANDLER_ID: AtomicU32 = AtomicU32::new(1);

/// How many finished handlers keep their final state for [`RequestTracker::state`].
const FINISHED_HISTORY: usize = 128;

/// Identifies one tracked request for its whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u32);

impl Display for HandlerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Active,
    Completed,
    TimedOut,
    Stopped,
}

/// Posted by a retry timer when its interval has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub handler: HandlerId,
    generation: u64,
}

/// Outcome notifications for tracked requests.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent {
    /// The device acknowledged the request.
    Acknowledged { handler: HandlerId },
    /// The device answered with a state message.
    Response { handler: HandlerId, frame: Frame },
    /// Every retry went unanswered.
    TimedOut { handler: HandlerId },
    /// Always the last event for a handler.
    Complete {
        handler: HandlerId,
        state: RequestState,
    },
}

impl RequestEvent {
    pub fn handler(&self) -> HandlerId {
        match self {
            RequestEvent::Acknowledged { handler }
            | RequestEvent::Response { handler, .. }
            | RequestEvent::TimedOut { handler }
            | RequestEvent::Complete { handler, .. } => *handler,
        }
    }
}

struct PendingRequest {
    id: HandlerId,
    target: Option<DeviceId>,
    message_type: u16,
    correlation: CorrelationId,
    retries: u32,
    policy: RetryPolicy,
    state: RequestState,
    datagram: Bytes,
    destination: SocketAddr,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub struct RequestTracker {
    transport: Arc<Transport>,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    pending: HashMap<HandlerId, PendingRequest>,
    by_correlation: HashMap<CorrelationId, HandlerId>,
    finished: VecDeque<(HandlerId, RequestState)>,
}

impl RequestTracker {
    pub fn new(transport: Arc<Transport>, timer_tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        RequestTracker {
            transport,
            timer_tx,
            pending: HashMap::new(),
            by_correlation: HashMap::new(),
            finished: VecDeque::new(),
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Send `request` and keep resending it according to `policy` until a reply
    /// with the same correlation id arrives.
    pub fn issue(&mut self, request: OutboundRequest, policy: RetryPolicy) -> HandlerId {
        let id = self.next_handler_id();
        let correlation = self.next_correlation_id();
        let datagram = self.transport.send_request(&request, correlation);

        let mut pending = PendingRequest {
            id,
            target: request.target,
            message_type: request.message_type,
            correlation,
            retries: 0,
            policy,
            state: RequestState::Active,
            datagram,
            destination: request.destination,
            generation: 0,
            timer: None,
        };
        Self::arm_timer(&self.timer_tx, &mut pending);
        debug!(
            "Handler {} tracking {} to {} (source {:08x})",
            id,
            message_name(request.message_type),
            request.destination,
            correlation
        );

        self.finished.retain(|(finished, _)| *finished != id);
        self.by_correlation.insert(correlation, id);
        self.pending.insert(id, pending);
        id
    }

    /// Match an inbound frame against the requests in flight.
    pub fn on_frame(&mut self, frame: &Frame) -> Vec<RequestEvent> {
        let Some(&id) = self.by_correlation.get(&frame.header.source) else {
            return Vec::new();
        };
        let Some(mut pending) = self.release(id, RequestState::Completed) else {
            return Vec::new();
        };
        pending.cancel_timer();
        if pending.retries > 0 {
            debug!(
                "Handler {} answered after {} retries",
                id, pending.retries
            );
        }

        let first = if frame.header.message_type == message_type::ACKNOWLEDGEMENT {
            RequestEvent::Acknowledged { handler: id }
        } else {
            RequestEvent::Response {
                handler: id,
                frame: frame.clone(),
            }
        };
        vec![
            first,
            RequestEvent::Complete {
                handler: id,
                state: pending.state,
            },
        ]
    }

    /// Handle an elapsed retry interval: resend, or give up once the budget is spent.
    pub fn on_timer(&mut self, fired: TimerFired) -> Vec<RequestEvent> {
        let Some(pending) = self.pending.get_mut(&fired.handler) else {
            return Vec::new();
        };
        if pending.generation != fired.generation || pending.state != RequestState::Active {
            return Vec::new();
        }
        pending.timer = None;

        if pending.retries < pending.policy.max_retries {
            pending.retries += 1;
            debug!(
                "Resending {} for handler {} (retry {} of {})",
                message_name(pending.message_type),
                pending.id,
                pending.retries,
                pending.policy.max_retries
            );
            self.transport
                .resend(&pending.datagram, pending.destination);
            Self::arm_timer(&self.timer_tx, pending);
            return Vec::new();
        }

        let id = pending.id;
        match pending.target {
            Some(target) => warn!(
                "No reply from {} to {} after {} retries",
                target,
                message_name(pending.message_type),
                pending.retries
            ),
            None => warn!(
                "No reply from {} to {} after {} retries",
                pending.destination,
                message_name(pending.message_type),
                pending.retries
            ),
        }
        self.release(id, RequestState::TimedOut);
        vec![
            RequestEvent::TimedOut { handler: id },
            RequestEvent::Complete {
                handler: id,
                state: RequestState::TimedOut,
            },
        ]
    }

    /// Stop tracking a request. Nothing is emitted for it afterwards.
    /// # Returns
    /// `false` if the handler was not in flight.
    pub fn stop(&mut self, handler: HandlerId) -> bool {
        match self.release(handler, RequestState::Stopped) {
            Some(mut pending) => {
                pending.cancel_timer();
                debug!("Handler {} stopped", handler);
                true
            }
            None => false,
        }
    }

    /// Stop every request in flight.
    pub fn stop_all(&mut self) {
        let ids: Vec<HandlerId> = self.pending.keys().copied().collect();
        for id in ids {
            self.stop(id);
        }
    }

    pub fn is_active(&self, handler: HandlerId) -> bool {
        self.pending.contains_key(&handler)
    }

    /// `Active` while in flight, then the final state for as long as the handler
    /// is among the most recently finished ones.
    pub fn state(&self, handler: HandlerId) -> Option<RequestState> {
        if let Some(pending) = self.pending.get(&handler) {
            return Some(pending.state);
        }
        self.finished
            .iter()
            .find(|(id, _)| *id == handler)
            .map(|(_, state)| *state)
    }

    /// Number of requests in flight.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Stop tracking `handler` and remember how it ended.
    fn release(&mut self, handler: HandlerId, state: RequestState) -> Option<PendingRequest> {
        let mut pending = self.pending.remove(&handler)?;
        self.by_correlation.remove(&pending.correlation);
        pending.state = state;
        if self.finished.len() == FINISHED_HISTORY {
            self.finished.pop_front();
        }
        self.finished.push_back((handler, state));
        Some(pending)
    }

    fn next_handler_id(&self) -> HandlerId {
        loop {
            let id = NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !self.pending.contains_key(&HandlerId(id)) {
                return HandlerId(id);
            }
        }
    }

    fn next_correlation_id(&self) -> CorrelationId {
        loop {
            let id = new_correlation_id();
            if !self.by_correlation.contains_key(&id) {
                return id;
            }
        }
    }

    fn arm_timer(timer_tx: &mpsc::UnboundedSender<TimerFired>, pending: &mut PendingRequest) {
        pending.cancel_timer();
        pending.generation += 1;
        let fired = TimerFired {
            handler: pending.id,
            generation: pending.generation,
        };
        let interval = pending.policy.interval();
        let timer_tx = timer_tx.clone();
        pending.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = timer_tx.send(fired);
        }));
    }
}

impl Drop for RequestTracker {
    fn drop(&mut self) {
        for pending in self.pending.values_mut() {
            pending.cancel_timer();
        }
    }
}
