// Session layer: drives client queue handles through open, configure, close
// and reopen against whichever node the directory names as authority.
//
// All handle state lives in one actor task. Requests to an authority run in
// spawned tasks and report back through the actor's own command channel, so
// responses, retry timers and authority changes are ordered with client
// commands. At most one control request is in flight per handle; later ones
// park in FIFO order. Posts and confirms travel on a per-handle data lane and
// are held while the handle is not bound to a reachable authority.
use ahash::RandomState;
use hashbrown::HashMap;
use slab::Slab;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use wharf_common::ids::{ClientId, HandleId, MessageGuid};
use wharf_common::{ConfirmSelector, ConsumerParams, HandleFlags, Message, NodeId, QueueUri};
use wharf_consensus::AuthorityDirectory;

use crate::authority::{AuthorityClient, NodeRegistry};
use crate::handle::{
    DataOp, HandleSnapshot, HandleState, InFlight, Lane, ParkedRequest, QueueHandle, Reply,
    RequestKind,
};
use crate::push::{PushSink, PushStream};
use crate::{BrokerError, OpenRequest};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_REOPEN_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_REOPEN_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub open_timeout: Duration,
    pub configure_timeout: Duration,
    pub close_timeout: Duration,
    pub reopen_retry_interval: Duration,
    /// Bound on reopen attempts rejected with `LimitExceeded`.
    pub reopen_max_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open_timeout: DEFAULT_REQUEST_TIMEOUT,
            configure_timeout: DEFAULT_REQUEST_TIMEOUT,
            close_timeout: DEFAULT_REQUEST_TIMEOUT,
            reopen_retry_interval: DEFAULT_REOPEN_RETRY_INTERVAL,
            reopen_max_attempts: DEFAULT_REOPEN_MAX_ATTEMPTS,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("{0}")]
    LimitExceeded(String),
    #[error("request timed out")]
    Timeout,
    #[error("routing unavailable: {0}")]
    RoutingUnavailable(String),
    #[error("message not accepted: {0}")]
    Nack(String),
    #[error("queue already open: {0}")]
    AlreadyOpen(QueueUri),
    #[error("queue not open: {0}")]
    NotOpen(QueueUri),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("session stopped")]
    Stopped,
}

impl From<BrokerError> for SessionError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::LimitExceeded(message) => SessionError::LimitExceeded(message),
            BrokerError::Unreachable(_) | BrokerError::NotAuthority { .. } => {
                SessionError::RoutingUnavailable(err.to_string())
            }
            other => SessionError::Rejected(other.to_string()),
        }
    }
}

impl SessionError {
    fn retryable(&self) -> bool {
        matches!(
            self,
            SessionError::LimitExceeded(_)
                | SessionError::Timeout
                | SessionError::RoutingUnavailable(_)
        )
    }
}

// Errors meaning "this node cannot serve the handle right now": the data op
// is held and the handle reopened.
fn unrouted(err: &BrokerError) -> bool {
    matches!(
        err,
        BrokerError::Unreachable(_) | BrokerError::NotAuthority { .. } | BrokerError::HandleNotFound(_)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    pub flags: HandleFlags,
    pub params: ConsumerParams,
}

impl OpenOptions {
    pub fn reader() -> Self {
        Self {
            flags: HandleFlags::reader(),
            params: ConsumerParams::default(),
        }
    }

    pub fn writer() -> Self {
        Self {
            flags: HandleFlags::writer(),
            params: ConsumerParams::default(),
        }
    }

    pub fn with_params(mut self, params: ConsumerParams) -> Self {
        self.params = params;
        self
    }
}

/// Successful open. Readers receive deliveries on `pushes` for as long as
/// the handle stays open, across reopens.
#[derive(Debug)]
pub struct OpenedQueue {
    pub handle_id: HandleId,
    pub pushes: PushStream,
}

/// Acknowledgement of one post.
#[derive(Debug)]
pub struct PendingAck {
    guid: MessageGuid,
    rx: oneshot::Receiver<Result<MessageGuid, SessionError>>,
}

impl PendingAck {
    pub fn guid(&self) -> MessageGuid {
        self.guid
    }

    /// Resolves once the authority accepted the message (ACK) or refused it
    /// (NACK). Stays pending while no authority is reachable.
    pub async fn wait(self) -> Result<MessageGuid, SessionError> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(SessionError::Nack("session stopped".into())))
    }
}

#[derive(Debug)]
enum Command {
    Open {
        uri: QueueUri,
        options: OpenOptions,
        reply: Reply<OpenedQueue>,
    },
    Configure {
        uri: QueueUri,
        params: ConsumerParams,
        reply: Reply<()>,
    },
    Close {
        uri: QueueUri,
        reply: Reply<()>,
    },
    Post {
        uri: QueueUri,
        message: Message,
        ack: Reply<MessageGuid>,
        reply: Reply<()>,
    },
    Confirm {
        uri: QueueUri,
        selector: ConfirmSelector,
        reply: Reply<()>,
    },
    State {
        uri: QueueUri,
        reply: oneshot::Sender<Option<HandleSnapshot>>,
    },
    Response {
        slot: usize,
        request_id: u64,
        outcome: Result<(), SessionError>,
    },
    RetryReopen {
        slot: usize,
        token: u64,
    },
    DataUnrouted {
        slot: usize,
        handle: HandleId,
        generation: u64,
        ops: Vec<DataOp>,
    },
}

/// Client-facing session. Cheap to clone; the actor stops when the last
/// clone is dropped.
///
/// ```
/// use bytes::Bytes;
/// use std::sync::Arc;
/// use wharf_broker::{
///     Broker, LocalAuthority, NodeRegistry, OpenOptions, QueueSessions, SessionConfig,
/// };
/// use wharf_common::{ConfirmSelector, DomainConfig, Message, NodeId, RoutingMode};
/// use wharf_consensus::AuthorityDirectory;
/// use wharf_storage::InMemoryStore;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let node = NodeId::from("node-1");
///     let directory = AuthorityDirectory::single(node.clone());
///     let broker = Arc::new(Broker::new(node, directory.clone(), Arc::new(InMemoryStore::new())));
///     broker
///         .register_domain(DomainConfig::new("orders", RoutingMode::Priority))
///         .await
///         .expect("domain");
///     let nodes = NodeRegistry::new();
///     nodes.register(Arc::new(LocalAuthority::new(broker)));
///
///     let consumer = QueueSessions::spawn(SessionConfig::default(), directory.clone(), nodes.clone());
///     let producer = QueueSessions::spawn(SessionConfig::default(), directory, nodes);
///     let uri = "wharf://orders/eu".parse().expect("uri");
///     let mut reader = consumer.open(&uri, OpenOptions::reader()).await.expect("reader");
///     producer.open(&uri, OpenOptions::writer()).await.expect("writer");
///     producer
///         .post_and_wait(&uri, Message::new(Bytes::from_static(b"hi")))
///         .await
///         .expect("ack");
///     let event = reader.pushes.recv().await.expect("push");
///     consumer
///         .confirm(&uri, ConfirmSelector::Guid(event.guid))
///         .await
///         .expect("confirm");
/// });
/// ```
#[derive(Debug, Clone)]
pub struct QueueSessions {
    client: ClientId,
    directory: AuthorityDirectory,
    nodes: NodeRegistry,
    commands: mpsc::UnboundedSender<Command>,
}

impl QueueSessions {
    pub fn spawn(config: SessionConfig, directory: AuthorityDirectory, nodes: NodeRegistry) -> Self {
        let client = ClientId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = SessionActor {
            client,
            config,
            directory: directory.clone(),
            nodes: nodes.clone(),
            handles: Slab::new(),
            index: HashMap::with_hasher(RandomState::new()),
            commands: rx,
            me: tx.downgrade(),
            next_id: 0,
        };
        tokio::spawn(actor.run());
        Self {
            client,
            directory,
            nodes,
            commands: tx,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client
    }

    pub fn directory(&self) -> &AuthorityDirectory {
        &self.directory
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }

    pub async fn open(&self, uri: &QueueUri, options: OpenOptions) -> Result<OpenedQueue, SessionError> {
        let uri = uri.clone();
        self.request(|reply| Command::Open {
            uri,
            options,
            reply,
        })
        .await
    }

    pub async fn configure(&self, uri: &QueueUri, params: ConsumerParams) -> Result<(), SessionError> {
        let uri = uri.clone();
        self.request(|reply| Command::Configure { uri, params, reply })
            .await
    }

    /// Always succeeds for an open handle, reachable authority or not.
    pub async fn close(&self, uri: &QueueUri) -> Result<(), SessionError> {
        let uri = uri.clone();
        self.request(|reply| Command::Close { uri, reply }).await
    }

    /// Queues a post and returns without waiting for the acknowledgement.
    pub async fn post(&self, uri: &QueueUri, message: Message) -> Result<PendingAck, SessionError> {
        let uri = uri.clone();
        let guid = message.guid;
        let (ack, rx) = oneshot::channel();
        self.request(|reply| Command::Post {
            uri,
            message,
            ack,
            reply,
        })
        .await?;
        Ok(PendingAck { guid, rx })
    }

    pub async fn post_and_wait(
        &self,
        uri: &QueueUri,
        message: Message,
    ) -> Result<MessageGuid, SessionError> {
        self.post(uri, message).await?.wait().await
    }

    pub async fn confirm(&self, uri: &QueueUri, selector: ConfirmSelector) -> Result<(), SessionError> {
        let uri = uri.clone();
        self.request(|reply| Command::Confirm {
            uri,
            selector,
            reply,
        })
        .await
    }

    pub async fn handle_state(&self, uri: &QueueUri) -> Option<HandleSnapshot> {
        let (reply, rx) = oneshot::channel();
        let uri = uri.clone();
        self.commands.send(Command::State { uri, reply }).ok()?;
        rx.await.ok().flatten()
    }
}

struct SessionActor {
    client: ClientId,
    config: SessionConfig,
    directory: AuthorityDirectory,
    nodes: NodeRegistry,
    handles: Slab<QueueHandle>,
    index: HashMap<QueueUri, usize, RandomState>,
    commands: mpsc::UnboundedReceiver<Command>,
    // Weak so the actor ends once every `QueueSessions` is dropped.
    me: mpsc::WeakUnboundedSender<Command>,
    next_id: u64,
}

impl SessionActor {
    async fn run(mut self) {
        let mut authority = self.directory.subscribe();
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                changed = authority.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.on_authority_change();
                }
            }
        }
        self.shutdown();
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open {
                uri,
                options,
                reply,
            } => self.open(uri, options, reply),
            Command::Configure { uri, params, reply } => self.configure(uri, params, reply),
            Command::Close { uri, reply } => self.close(uri, reply),
            Command::Post {
                uri,
                message,
                ack,
                reply,
            } => self.post(uri, message, ack, reply),
            Command::Confirm {
                uri,
                selector,
                reply,
            } => self.confirm(uri, selector, reply),
            Command::State { uri, reply } => {
                let snapshot = self
                    .index
                    .get(&uri)
                    .and_then(|slot| self.handles.get(*slot))
                    .map(QueueHandle::snapshot);
                let _ = reply.send(snapshot);
            }
            Command::Response {
                slot,
                request_id,
                outcome,
            } => self.on_response(slot, request_id, outcome),
            Command::RetryReopen { slot, token } => self.on_retry(slot, token),
            Command::DataUnrouted {
                slot,
                handle,
                generation,
                ops,
            } => self.on_unrouted(slot, handle, generation, ops),
        }
    }

    fn authority_for(&self, uri: &QueueUri) -> Option<(NodeId, Arc<dyn AuthorityClient>)> {
        let node = self.directory.current_authority(uri.key())?;
        let client = self.nodes.get(&node)?;
        Some((node, client))
    }

    fn authority_moved(&self, handle: &QueueHandle) -> bool {
        self.directory.current_authority(handle.uri.key()) != handle.bound
    }

    fn open(&mut self, uri: QueueUri, options: OpenOptions, reply: Reply<OpenedQueue>) {
        if let Err(err) = options.flags.validate().and(options.params.validate()) {
            let _ = reply.send(Err(SessionError::Rejected(err.to_string())));
            return;
        }
        if let Some(&slot) = self.index.get(&uri) {
            let handle = &mut self.handles[slot];
            if handle.state == HandleState::Closing {
                handle.parked.push_back(ParkedRequest::Open { options, reply });
            } else {
                let _ = reply.send(Err(SessionError::AlreadyOpen(uri)));
            }
            return;
        }
        let Some((node, client)) = self.authority_for(&uri) else {
            let _ = reply.send(Err(SessionError::RoutingUnavailable(format!(
                "no authority for {}",
                uri.key()
            ))));
            return;
        };

        let (sink, pushes) = PushSink::channel();
        let handle = QueueHandle::new(self.client, uri.clone(), &options, sink);
        let request = OpenRequest {
            handle: handle.id,
            client: self.client,
            uri: uri.clone(),
            flags: options.flags,
            params: options.params,
            sink: options.flags.read.then(|| handle.sink.clone()),
        };
        let slot = self.handles.insert(handle);
        self.index.insert(uri, slot);

        let request_id = self.next_id();
        let handle = &mut self.handles[slot];
        handle.state = HandleState::Opening;
        handle.in_flight = Some(InFlight {
            request_id,
            node,
            kind: RequestKind::Open { reply, pushes },
        });
        self.spawn_request(slot, request_id, self.config.open_timeout, async move {
            client.open_queue(request).await
        });
    }

    fn configure(&mut self, uri: QueueUri, params: ConsumerParams, reply: Reply<()>) {
        if let Err(err) = params.validate() {
            let _ = reply.send(Err(SessionError::Rejected(err.to_string())));
            return;
        }
        let Some(&slot) = self.index.get(&uri) else {
            let _ = reply.send(Err(SessionError::NotOpen(uri)));
            return;
        };
        let handle = &mut self.handles[slot];
        if handle.close_requested() {
            let _ = reply.send(Err(SessionError::NotOpen(uri)));
            return;
        }
        if handle.state == HandleState::Open && handle.is_idle() {
            self.send_configure(slot, params, reply);
        } else {
            handle.parked.push_back(ParkedRequest::Configure { params, reply });
        }
    }

    fn send_configure(&mut self, slot: usize, params: ConsumerParams, reply: Reply<()>) {
        let request_id = self.next_id();
        let Some(handle) = self.handles.get(slot) else {
            return;
        };
        let target = handle
            .bound
            .clone()
            .and_then(|node| self.nodes.get(&node).map(|client| (node, client)));
        let Some((node, client)) = target else {
            let _ = reply.send(Err(SessionError::RoutingUnavailable(format!(
                "handle for {} is not bound",
                handle.uri
            ))));
            return;
        };
        let id = handle.id;
        if let Some(handle) = self.handles.get_mut(slot) {
            handle.in_flight = Some(InFlight {
                request_id,
                node,
                kind: RequestKind::Configure { params, reply },
            });
        }
        self.spawn_request(slot, request_id, self.config.configure_timeout, async move {
            client.configure_queue(id, params).await
        });
    }

    fn close(&mut self, uri: QueueUri, reply: Reply<()>) {
        let Some(&slot) = self.index.get(&uri) else {
            let _ = reply.send(Err(SessionError::NotOpen(uri)));
            return;
        };
        let handle = &mut self.handles[slot];
        // Stop deliveries right away; the authority skips closed sinks.
        handle.sink.close();
        handle.parked.push_back(ParkedRequest::Close { reply });
        self.drain_parked(slot);
    }

    fn send_close(&mut self, slot: usize, reply: Reply<()>) {
        let request_id = self.next_id();
        let Some(handle) = self.handles.get_mut(slot) else {
            let _ = reply.send(Ok(()));
            return;
        };
        handle.state = HandleState::Closing;
        handle.retry_token = None;
        handle.sink.close();
        let id = handle.id;
        let barrier = handle.lane.take().and_then(|lane| {
            let (tx, rx) = oneshot::channel();
            lane.tx.send(DataOp::Barrier(tx)).ok().map(|_| rx)
        });
        let bound = handle.bound.clone();
        let target = bound
            .and_then(|node| self.nodes.get(&node).map(|client| (node, client)))
            .or_else(|| self.handles.get(slot).and_then(|h| self.authority_for(&h.uri)));
        let Some((node, client)) = target else {
            tracing::debug!(handle = %id, "no authority reachable, closing locally");
            let _ = reply.send(Ok(()));
            self.destroy(slot);
            return;
        };
        if let Some(handle) = self.handles.get_mut(slot) {
            handle.in_flight = Some(InFlight {
                request_id,
                node,
                kind: RequestKind::Close { reply },
            });
        }
        self.spawn_request(slot, request_id, self.config.close_timeout, async move {
            if let Some(barrier) = barrier {
                let _ = barrier.await;
            }
            client.close_queue(id).await
        });
    }

    fn post(&mut self, uri: QueueUri, message: Message, ack: Reply<MessageGuid>, reply: Reply<()>) {
        let Some(handle) = self.index.get(&uri).and_then(|slot| self.handles.get_mut(*slot)) else {
            let _ = reply.send(Err(SessionError::NotOpen(uri)));
            return;
        };
        if !handle.flags.write {
            let _ = reply.send(Err(SessionError::Rejected(format!(
                "{uri} is not open for writing"
            ))));
            return;
        }
        if handle.close_requested() {
            let _ = reply.send(Err(SessionError::NotOpen(uri)));
            return;
        }
        handle.submit(DataOp::Post { message, ack });
        let _ = reply.send(Ok(()));
    }

    fn confirm(&mut self, uri: QueueUri, selector: ConfirmSelector, reply: Reply<()>) {
        let Some(handle) = self.index.get(&uri).and_then(|slot| self.handles.get_mut(*slot)) else {
            let _ = reply.send(Err(SessionError::NotOpen(uri)));
            return;
        };
        if !handle.flags.read {
            let _ = reply.send(Err(SessionError::Rejected(format!(
                "{uri} is not open for reading"
            ))));
            return;
        }
        if handle.close_requested() {
            let _ = reply.send(Err(SessionError::NotOpen(uri)));
            return;
        }
        handle.submit(DataOp::Confirm { selector });
        let _ = reply.send(Ok(()));
    }

    /// Dispatches parked requests while the handle has nothing in flight.
    fn drain_parked(&mut self, slot: usize) {
        loop {
            let Some(handle) = self.handles.get_mut(slot) else {
                return;
            };
            if !handle.is_idle() {
                return;
            }
            let next = match handle.state {
                HandleState::Open => handle.parked.pop_front(),
                // Only a close gets a parked handle moving; requests queued
                // ahead of it fail.
                HandleState::Parked if handle.close_requested() => handle.parked.pop_front(),
                _ => None,
            };
            match next {
                None => return,
                Some(ParkedRequest::Configure { params, reply }) => {
                    if handle.state == HandleState::Open {
                        self.send_configure(slot, params, reply);
                    } else {
                        let _ = reply.send(Err(SessionError::NotOpen(handle.uri.clone())));
                    }
                }
                Some(ParkedRequest::Close { reply }) => self.send_close(slot, reply),
                Some(ParkedRequest::Open { reply, .. }) => {
                    let _ = reply.send(Err(SessionError::AlreadyOpen(handle.uri.clone())));
                }
            }
        }
    }

    fn spawn_request<F>(&self, slot: usize, request_id: u64, timeout: Duration, request: F)
    where
        F: Future<Output = Result<(), BrokerError>> + Send + 'static,
    {
        let me = self.me.clone();
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, request).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(SessionError::from(err)),
                Err(_) => Err(SessionError::Timeout),
            };
            if let Some(tx) = me.upgrade() {
                let _ = tx.send(Command::Response {
                    slot,
                    request_id,
                    outcome,
                });
            }
        });
    }

    fn on_response(&mut self, slot: usize, request_id: u64, outcome: Result<(), SessionError>) {
        let Some(handle) = self.handles.get_mut(slot) else {
            return;
        };
        let Some(in_flight) = handle
            .in_flight
            .take_if(|in_flight| in_flight.request_id == request_id)
        else {
            tracing::trace!(slot, request_id, "stale response ignored");
            return;
        };
        let node = in_flight.node;
        match in_flight.kind {
            RequestKind::Open { reply, pushes } => match outcome {
                Ok(()) => {
                    let opened = OpenedQueue {
                        handle_id: handle.id,
                        pushes,
                    };
                    tracing::debug!(handle = %handle.id, uri = %handle.uri, %node, "queue opened");
                    self.bind(slot, node);
                    if reply.send(Ok(opened)).is_err() {
                        // Caller went away; undo the open.
                        if let Some(handle) = self.handles.get_mut(slot) {
                            let (close, _) = oneshot::channel();
                            handle.parked.push_back(ParkedRequest::Close { reply: close });
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(handle = %handle.id, uri = %handle.uri, error = %err, "open failed");
                    if err == SessionError::Timeout
                        && let Some(client) = self.nodes.get(&node)
                    {
                        // The authority may have registered the handle after
                        // the deadline.
                        let id = handle.id;
                        tokio::spawn(async move {
                            let _ = client.close_queue(id).await;
                        });
                    }
                    let _ = reply.send(Err(err));
                    self.destroy(slot);
                    return;
                }
            },
            RequestKind::Configure { params, reply } => {
                if outcome.is_ok() {
                    handle.params = params;
                }
                let _ = reply.send(outcome);
            }
            RequestKind::Close { reply } => {
                if let Err(err) = &outcome {
                    tracing::debug!(handle = %handle.id, error = %err, "close completed locally");
                }
                let _ = reply.send(Ok(()));
                self.destroy(slot);
                return;
            }
            RequestKind::Reopen => match outcome {
                Ok(()) => {
                    tracing::info!(handle = %handle.id, uri = %handle.uri, %node, "queue reopened");
                    handle.reopen_attempts = 0;
                    self.bind(slot, node);
                }
                Err(err) => self.reopen_failed(slot, &node, err),
            },
        }
        self.after_request(slot);
    }

    // Runs after any control response that leaves the handle alive.
    fn after_request(&mut self, slot: usize) {
        let Some(handle) = self.handles.get(slot) else {
            return;
        };
        let reopen = matches!(handle.state, HandleState::Open | HandleState::Parked)
            && !handle.close_requested()
            && (handle.stale || (handle.state == HandleState::Open && self.authority_moved(handle)));
        if reopen {
            self.start_reopen(slot);
        } else {
            self.drain_parked(slot);
        }
    }

    /// Marks the handle open at `node` and starts a fresh data lane carrying
    /// everything held so far.
    fn bind(&mut self, slot: usize, node: NodeId) {
        let generation = self.next_id();
        let Some(client) = self.nodes.get(&node) else {
            return;
        };
        let Some(handle) = self.handles.get_mut(slot) else {
            return;
        };
        handle.state = HandleState::Open;
        handle.bound = Some(node);
        handle.stale = false;
        let (tx, rx) = mpsc::unbounded_channel();
        handle.lane = Some(Lane { generation, tx });
        let flushed = handle.flush_held();
        if flushed > 0 {
            tracing::debug!(handle = %handle.id, flushed, "held operations flushed");
        }
        tokio::spawn(run_lane(
            client,
            handle.id,
            slot,
            generation,
            rx,
            self.me.clone(),
        ));
    }

    fn start_reopen(&mut self, slot: usize) {
        let request_id = self.next_id();
        let Some(handle) = self.handles.get(slot) else {
            return;
        };
        let target = self.authority_for(&handle.uri);
        let Some(handle) = self.handles.get_mut(slot) else {
            return;
        };
        handle.lane = None;
        handle.bound = None;
        handle.retry_token = None;
        handle.stale = false;
        let Some((node, client)) = target else {
            tracing::debug!(handle = %handle.id, uri = %handle.uri, "no authority, handle parked");
            handle.state = HandleState::Parked;
            self.drain_parked(slot);
            return;
        };
        handle.state = HandleState::Reopening;
        let request = OpenRequest {
            handle: handle.id,
            client: handle.client,
            uri: handle.uri.clone(),
            flags: handle.flags,
            params: handle.params,
            sink: handle.flags.read.then(|| handle.sink.clone()),
        };
        handle.in_flight = Some(InFlight {
            request_id,
            node: node.clone(),
            kind: RequestKind::Reopen,
        });
        tracing::debug!(handle = %handle.id, uri = %handle.uri, %node, "reopening queue");
        metrics::counter!("wharf_reopen_total").increment(1);
        self.spawn_request(slot, request_id, self.config.open_timeout, async move {
            client.open_queue(request).await
        });
    }

    fn reopen_failed(&mut self, slot: usize, node: &NodeId, err: SessionError) {
        let token = self.next_id();
        let max_attempts = self.config.reopen_max_attempts;
        let interval = self.config.reopen_retry_interval;
        let Some(handle) = self.handles.get_mut(slot) else {
            return;
        };
        handle.state = HandleState::Parked;
        handle.reopen_attempts += 1;
        if handle.close_requested() {
            tracing::debug!(handle = %handle.id, error = %err, "reopen failed, close pending");
            return;
        }
        let current = self.directory.current_authority(handle.uri.key());
        if current.is_some() && current.as_ref() != Some(node) {
            // The authority moved while the request was in flight.
            handle.stale = true;
            return;
        }
        // Only limit rejections are bounded; an unreachable or slow
        // authority is retried until it answers.
        let exhausted = matches!(err, SessionError::LimitExceeded(_))
            && handle.reopen_attempts >= max_attempts;
        if !err.retryable() || exhausted {
            tracing::warn!(
                handle = %handle.id,
                uri = %handle.uri,
                attempts = handle.reopen_attempts,
                error = %err,
                "giving up reopening queue"
            );
            return;
        }
        tracing::debug!(
            handle = %handle.id,
            attempt = handle.reopen_attempts,
            error = %err,
            "reopen failed, retry scheduled"
        );
        handle.retry_token = Some(token);
        metrics::counter!("wharf_reopen_retry_total").increment(1);
        let me = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(tx) = me.upgrade() {
                let _ = tx.send(Command::RetryReopen { slot, token });
            }
        });
    }

    fn on_retry(&mut self, slot: usize, token: u64) {
        let Some(handle) = self.handles.get(slot) else {
            return;
        };
        let due = handle.state == HandleState::Parked
            && handle.is_idle()
            && handle.retry_token == Some(token)
            && !handle.close_requested();
        if due {
            self.start_reopen(slot);
        }
    }

    fn on_authority_change(&mut self) {
        let slots: Vec<usize> = self.handles.iter().map(|(slot, _)| slot).collect();
        for slot in slots {
            let Some(handle) = self.handles.get(slot) else {
                continue;
            };
            if !handle.is_idle() || handle.close_requested() {
                // Checked again when the response arrives.
                continue;
            }
            let reopen = match handle.state {
                HandleState::Open => self.authority_moved(handle),
                HandleState::Parked => self.authority_for(&handle.uri).is_some(),
                _ => false,
            };
            if reopen {
                if let Some(handle) = self.handles.get_mut(slot)
                    && handle.state == HandleState::Parked
                {
                    handle.reopen_attempts = 0;
                }
                self.start_reopen(slot);
            }
        }
    }

    fn on_unrouted(&mut self, slot: usize, id: HandleId, generation: u64, ops: Vec<DataOp>) {
        let Some(handle) = self.handles.get_mut(slot).filter(|handle| handle.id == id) else {
            nack_all(ops, "handle closed");
            return;
        };
        if handle
            .lane
            .as_ref()
            .is_some_and(|lane| lane.generation == generation)
        {
            handle.lane = None;
        }
        for op in ops.into_iter().rev() {
            handle.held.push_front(op);
        }
        tracing::debug!(handle = %handle.id, held = handle.held.len(), "data operations held");
        if handle.state != HandleState::Open {
            return;
        }
        if handle.lane.is_some() {
            // A newer lane is already bound.
            handle.flush_held();
        } else if handle.is_idle() {
            self.start_reopen(slot);
        } else {
            handle.stale = true;
        }
    }

    /// Drops the handle. Held posts are NACKed; parked requests are resolved
    /// as if they ran against a closed handle.
    fn destroy(&mut self, slot: usize) {
        let Some(handle) = self.handles.try_remove(slot) else {
            return;
        };
        self.index.remove(&handle.uri);
        handle.sink.close();
        nack_all(handle.held, "handle closed");
        for request in handle.parked {
            match request {
                ParkedRequest::Close { reply } => {
                    let _ = reply.send(Ok(()));
                }
                ParkedRequest::Configure { reply, .. } => {
                    let _ = reply.send(Err(SessionError::NotOpen(handle.uri.clone())));
                }
                ParkedRequest::Open { options, reply } => {
                    self.open(handle.uri.clone(), options, reply);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        for handle in self.handles.drain() {
            handle.sink.close();
            nack_all(handle.held, "session stopped");
        }
        self.index.clear();
    }
}

fn nack_all(ops: impl IntoIterator<Item = DataOp>, reason: &str) {
    for op in ops {
        match op {
            DataOp::Post { ack, .. } => {
                let _ = ack.send(Err(SessionError::Nack(reason.to_string())));
            }
            DataOp::Barrier(done) => {
                let _ = done.send(());
            }
            DataOp::Confirm { .. } => {}
        }
    }
}

// Sends data ops for one handle to one node, in order. On an unrouted error
// the lane stops and hands every op it still has back to the actor.
async fn run_lane(
    client: Arc<dyn AuthorityClient>,
    handle: HandleId,
    slot: usize,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<DataOp>,
    session: mpsc::WeakUnboundedSender<Command>,
) {
    while let Some(op) = rx.recv().await {
        let bounced = match op {
            DataOp::Post { message, ack } => match client.post(handle, message.clone()).await {
                Ok(_) => {
                    let _ = ack.send(Ok(message.guid));
                    None
                }
                Err(err) if unrouted(&err) => Some((DataOp::Post { message, ack }, err)),
                Err(err) => {
                    let _ = ack.send(Err(SessionError::Nack(err.to_string())));
                    None
                }
            },
            DataOp::Confirm { selector } => match client.confirm(handle, selector).await {
                Ok(_) => None,
                Err(err) if unrouted(&err) => Some((DataOp::Confirm { selector }, err)),
                Err(err) => {
                    tracing::warn!(%handle, error = %err, "confirm rejected");
                    None
                }
            },
            DataOp::Barrier(done) => {
                let _ = done.send(());
                None
            }
        };
        let Some((op, err)) = bounced else {
            continue;
        };
        tracing::debug!(%handle, node = %client.node_id(), error = %err, "data lane unrouted");
        rx.close();
        let mut ops = vec![op];
        while let Ok(op) = rx.try_recv() {
            match op {
                DataOp::Barrier(done) => {
                    let _ = done.send(());
                }
                op => ops.push(op),
            }
        }
        match session.upgrade() {
            Some(tx) => {
                let _ = tx.send(Command::DataUnrouted {
                    slot,
                    handle,
                    generation,
                    ops,
                });
            }
            None => nack_all(ops, "session stopped"),
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::LocalAuthority;
    use crate::Broker;
    use bytes::Bytes;
    use wharf_common::{DomainConfig, RoutingMode};
    use wharf_storage::InMemoryStore;

    struct Fixture {
        directory: AuthorityDirectory,
        nodes: NodeRegistry,
        node: Arc<LocalAuthority>,
    }

    async fn fixture() -> Fixture {
        let id = NodeId::from("n1");
        let directory = AuthorityDirectory::single(id.clone());
        let broker = Arc::new(Broker::new(id, directory.clone(), Arc::new(InMemoryStore::new())));
        broker
            .register_domain(DomainConfig::new("d", RoutingMode::Priority))
            .await
            .expect("domain");
        let node = Arc::new(LocalAuthority::new(broker));
        let nodes = NodeRegistry::new();
        nodes.register(node.clone());
        Fixture {
            directory,
            nodes,
            node,
        }
    }

    impl Fixture {
        fn session(&self) -> QueueSessions {
            QueueSessions::spawn(SessionConfig::default(), self.directory.clone(), self.nodes.clone())
        }
    }

    fn uri() -> QueueUri {
        "wharf://d/q".parse().expect("uri")
    }

    #[tokio::test]
    async fn open_twice_is_rejected() {
        let fixture = fixture().await;
        let session = fixture.session();
        session.open(&uri(), OpenOptions::reader()).await.expect("open");
        let err = session
            .open(&uri(), OpenOptions::reader())
            .await
            .expect_err("second open");
        assert_eq!(err, SessionError::AlreadyOpen(uri()));
    }

    #[tokio::test]
    async fn invalid_flags_are_rejected_locally() {
        let fixture = fixture().await;
        let session = fixture.session();
        let options = OpenOptions {
            flags: HandleFlags {
                ack: true,
                ..HandleFlags::default()
            },
            params: ConsumerParams::default(),
        };
        assert!(matches!(
            session.open(&uri(), options).await,
            Err(SessionError::Rejected(_))
        ));
        assert_eq!(fixture.node.requests().open, 0);
    }

    #[tokio::test]
    async fn unknown_domain_is_rejected() {
        let fixture = fixture().await;
        let session = fixture.session();
        let missing: QueueUri = "wharf://nope/q".parse().expect("uri");
        assert!(matches!(
            session.open(&missing, OpenOptions::reader()).await,
            Err(SessionError::Rejected(_))
        ));
        assert!(session.handle_state(&missing).await.is_none());
    }

    #[tokio::test]
    async fn configure_updates_effective_params() {
        let fixture = fixture().await;
        let session = fixture.session();
        session.open(&uri(), OpenOptions::reader()).await.expect("open");
        let params = ConsumerParams::default().with_priority(7);
        session.configure(&uri(), params).await.expect("configure");
        let state = session.handle_state(&uri()).await.expect("state");
        assert_eq!(state.state, HandleState::Open);
        assert_eq!(state.params.priority, 7);
    }

    #[tokio::test]
    async fn close_always_succeeds_when_node_is_down() {
        let fixture = fixture().await;
        let session = fixture.session();
        session.open(&uri(), OpenOptions::writer()).await.expect("open");
        fixture.node.stop();
        session.close(&uri()).await.expect("close");
        assert!(session.handle_state(&uri()).await.is_none());
        assert_eq!(
            session.close(&uri()).await,
            Err(SessionError::NotOpen(uri()))
        );
    }

    #[tokio::test]
    async fn post_is_acked_with_its_guid() {
        let fixture = fixture().await;
        let session = fixture.session();
        session.open(&uri(), OpenOptions::writer()).await.expect("open");
        let message = Message::new(Bytes::from_static(b"body"));
        let guid = message.guid;
        let pending = session.post(&uri(), message).await.expect("post");
        assert_eq!(pending.guid(), guid);
        assert_eq!(pending.wait().await, Ok(guid));
    }

    #[tokio::test]
    async fn posting_on_a_reader_is_rejected() {
        let fixture = fixture().await;
        let session = fixture.session();
        session.open(&uri(), OpenOptions::reader()).await.expect("open");
        let result = session
            .post(&uri(), Message::new(Bytes::from_static(b"x")))
            .await;
        assert!(matches!(result, Err(SessionError::Rejected(_))));
    }

    #[tokio::test]
    async fn open_after_close_gets_a_new_handle() {
        let fixture = fixture().await;
        let session = fixture.session();
        let first = session.open(&uri(), OpenOptions::reader()).await.expect("open");
        session.close(&uri()).await.expect("close");
        let second = session.open(&uri(), OpenOptions::reader()).await.expect("reopen");
        assert_ne!(first.handle_id, second.handle_id);
        assert_eq!(fixture.node.requests().close, 1);
    }
}
