// Client-side state of one open queue handle. Owned by the session actor;
// the authority only ever sees the handle id.
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};
use wharf_common::ids::{ClientId, HandleId, MessageGuid};
use wharf_common::{ConfirmSelector, ConsumerParams, HandleFlags, Message, NodeId, QueueUri};

use crate::push::{PushSink, PushStream};
use crate::session::{OpenOptions, OpenedQueue, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Closed,
    Opening,
    Open,
    Reopening,
    // No request in flight; waiting for an authority or a retry timer.
    Parked,
    Closing,
}

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Control request waiting behind the one in flight.
#[derive(Debug)]
pub(crate) enum ParkedRequest {
    Configure {
        params: ConsumerParams,
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
    // Open for the same uri while the previous handle is closing.
    Open {
        options: OpenOptions,
        reply: Reply<OpenedQueue>,
    },
}

#[derive(Debug)]
pub(crate) enum RequestKind {
    Open {
        reply: Reply<OpenedQueue>,
        pushes: PushStream,
    },
    Configure {
        params: ConsumerParams,
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
    Reopen,
}

#[derive(Debug)]
pub(crate) struct InFlight {
    pub(crate) request_id: u64,
    pub(crate) node: NodeId,
    pub(crate) kind: RequestKind,
}

/// Post or confirm travelling on the handle's data lane.
#[derive(Debug)]
pub(crate) enum DataOp {
    Post {
        message: Message,
        ack: Reply<MessageGuid>,
    },
    Confirm {
        selector: ConfirmSelector,
    },
    // Resolved once everything queued before it has been sent.
    Barrier(oneshot::Sender<()>),
}

#[derive(Debug)]
pub(crate) struct Lane {
    pub(crate) generation: u64,
    pub(crate) tx: mpsc::UnboundedSender<DataOp>,
}

#[derive(Debug)]
pub(crate) struct QueueHandle {
    pub(crate) id: HandleId,
    pub(crate) client: ClientId,
    pub(crate) uri: QueueUri,
    pub(crate) flags: HandleFlags,
    // Parameters of the last successful Open or Configure.
    pub(crate) params: ConsumerParams,
    pub(crate) state: HandleState,
    pub(crate) sink: PushSink,
    pub(crate) in_flight: Option<InFlight>,
    pub(crate) parked: VecDeque<ParkedRequest>,
    // Data operations waiting for an authority, in submission order.
    pub(crate) held: VecDeque<DataOp>,
    pub(crate) bound: Option<NodeId>,
    pub(crate) lane: Option<Lane>,
    pub(crate) reopen_attempts: u32,
    pub(crate) retry_token: Option<u64>,
    // A data op bounced while a control request was in flight.
    pub(crate) stale: bool,
}

impl QueueHandle {
    pub(crate) fn new(client: ClientId, uri: QueueUri, options: &OpenOptions, sink: PushSink) -> Self {
        Self {
            id: HandleId::new(),
            client,
            uri,
            flags: options.flags,
            params: options.params,
            state: HandleState::Closed,
            sink,
            in_flight: None,
            parked: VecDeque::new(),
            held: VecDeque::new(),
            bound: None,
            lane: None,
            reopen_attempts: 0,
            retry_token: None,
            stale: false,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.state == HandleState::Closing
            || self
                .parked
                .iter()
                .any(|request| matches!(request, ParkedRequest::Close { .. }))
    }

    /// Queues a data op on the lane, or holds it when the handle is not
    /// bound. Ops never overtake ones already held.
    pub(crate) fn submit(&mut self, op: DataOp) {
        if !self.held.is_empty() || self.state != HandleState::Open {
            self.held.push_back(op);
            return;
        }
        let Some(lane) = &self.lane else {
            self.held.push_back(op);
            return;
        };
        if let Err(mpsc::error::SendError(op)) = lane.tx.send(op) {
            self.lane = None;
            self.held.push_back(op);
        }
    }

    /// Moves held ops onto a freshly bound lane.
    pub(crate) fn flush_held(&mut self) -> usize {
        let mut flushed = 0;
        while let Some(op) = self.held.pop_front() {
            let Some(lane) = &self.lane else {
                self.held.push_front(op);
                break;
            };
            if let Err(mpsc::error::SendError(op)) = lane.tx.send(op) {
                self.lane = None;
                self.held.push_front(op);
                break;
            }
            flushed += 1;
        }
        flushed
    }

    pub(crate) fn snapshot(&self) -> HandleSnapshot {
        HandleSnapshot {
            id: self.id,
            uri: self.uri.clone(),
            state: self.state,
            params: self.params,
            parked: self.parked.len(),
            held: self.held.len(),
            bound: self.bound.clone(),
            reopen_attempts: self.reopen_attempts,
        }
    }
}

/// Point-in-time view of a handle, for callers and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleSnapshot {
    pub id: HandleId,
    pub uri: QueueUri,
    pub state: HandleState,
    pub params: ConsumerParams,
    pub parked: usize,
    pub held: usize,
    pub bound: Option<NodeId>,
    pub reopen_attempts: u32,
}
