// Request surface of an authority node as seen from the session layer and the
// admin executor. `LocalAuthority` is the in-process transport: it forwards to
// a `Broker` and can be suspended or stopped to model an unreachable node.
use ahash::RandomState;
use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use wharf_common::ids::HandleId;
use wharf_common::{AppSelector, ConfirmSelector, ConsumerParams, Message, NodeId, QueueKey};
use wharf_storage::PurgeOutcome;

use crate::{Broker, BrokerError, OpenRequest, QueuePurge, Result};

#[async_trait]
pub trait AuthorityClient: Send + Sync + Debug {
    fn node_id(&self) -> &NodeId;

    async fn open_queue(&self, request: OpenRequest) -> Result<()>;
    async fn configure_queue(&self, handle: HandleId, params: ConsumerParams) -> Result<()>;
    async fn close_queue(&self, handle: HandleId) -> Result<()>;
    async fn post(&self, handle: HandleId, message: Message) -> Result<usize>;
    async fn confirm(&self, handle: HandleId, selector: ConfirmSelector) -> Result<usize>;

    async fn open_handle_count(&self, domain: &str) -> Result<usize>;
    async fn domain_exists(&self, domain: &str) -> Result<bool>;
    async fn remove_domain(&self, domain: &str) -> Result<Vec<QueuePurge>>;
    async fn finalize_domain(&self, domain: &str) -> Result<()>;
    async fn purge_queue(&self, queue: &QueueKey, selector: &AppSelector) -> Result<PurgeOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Up,
    // Requests wait until the node is resumed or stopped.
    Suspended,
    Down,
}

/// Requests that reached the broker, per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCounts {
    pub open: u64,
    pub configure: u64,
    pub close: u64,
    pub post: u64,
}

#[derive(Debug, Default)]
struct Counters {
    open: AtomicU64,
    configure: AtomicU64,
    close: AtomicU64,
    post: AtomicU64,
}

#[derive(Debug)]
pub struct LocalAuthority {
    broker: Arc<Broker>,
    status: watch::Sender<NodeStatus>,
    counters: Counters,
}

impl LocalAuthority {
    pub fn new(broker: Arc<Broker>) -> Self {
        let (status, _rx) = watch::channel(NodeStatus::Up);
        Self {
            broker,
            status,
            counters: Counters::default(),
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.borrow()
    }

    pub fn suspend(&self) {
        self.set_status(NodeStatus::Suspended);
    }

    pub fn resume(&self) {
        self.set_status(NodeStatus::Up);
    }

    pub fn stop(&self) {
        self.set_status(NodeStatus::Down);
    }

    pub fn start(&self) {
        self.set_status(NodeStatus::Up);
    }

    fn set_status(&self, status: NodeStatus) {
        self.status.send_replace(status);
        tracing::info!(node = %self.broker.node_id(), ?status, "node status changed");
    }

    pub fn requests(&self) -> RequestCounts {
        RequestCounts {
            open: self.counters.open.load(Ordering::Relaxed),
            configure: self.counters.configure.load(Ordering::Relaxed),
            close: self.counters.close.load(Ordering::Relaxed),
            post: self.counters.post.load(Ordering::Relaxed),
        }
    }

    async fn admit(&self) -> Result<()> {
        let mut rx = self.status.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            match status {
                NodeStatus::Up => return Ok(()),
                NodeStatus::Down => {
                    return Err(BrokerError::Unreachable(self.broker.node_id().clone()));
                }
                NodeStatus::Suspended => {}
            }
            if rx.changed().await.is_err() {
                return Err(BrokerError::Unreachable(self.broker.node_id().clone()));
            }
        }
    }
}

#[async_trait]
impl AuthorityClient for LocalAuthority {
    fn node_id(&self) -> &NodeId {
        self.broker.node_id()
    }

    async fn open_queue(&self, request: OpenRequest) -> Result<()> {
        self.admit().await?;
        self.counters.open.fetch_add(1, Ordering::Relaxed);
        self.broker.open_handle(request).await
    }

    async fn configure_queue(&self, handle: HandleId, params: ConsumerParams) -> Result<()> {
        self.admit().await?;
        self.counters.configure.fetch_add(1, Ordering::Relaxed);
        self.broker.configure_handle(handle, params).await
    }

    async fn close_queue(&self, handle: HandleId) -> Result<()> {
        self.admit().await?;
        self.counters.close.fetch_add(1, Ordering::Relaxed);
        self.broker.close_handle(handle).await
    }

    async fn post(&self, handle: HandleId, message: Message) -> Result<usize> {
        self.admit().await?;
        self.counters.post.fetch_add(1, Ordering::Relaxed);
        self.broker.post(handle, message).await
    }

    async fn confirm(&self, handle: HandleId, selector: ConfirmSelector) -> Result<usize> {
        self.admit().await?;
        self.broker.confirm(handle, selector).await
    }

    async fn open_handle_count(&self, domain: &str) -> Result<usize> {
        self.admit().await?;
        Ok(self.broker.open_handle_count(domain).await)
    }

    async fn domain_exists(&self, domain: &str) -> Result<bool> {
        self.admit().await?;
        self.broker.domain_exists(domain).await
    }

    async fn remove_domain(&self, domain: &str) -> Result<Vec<QueuePurge>> {
        self.admit().await?;
        self.broker.remove_domain(domain).await
    }

    async fn finalize_domain(&self, domain: &str) -> Result<()> {
        self.admit().await?;
        self.broker.finalize_domain(domain).await
    }

    async fn purge_queue(&self, queue: &QueueKey, selector: &AppSelector) -> Result<PurgeOutcome> {
        self.admit().await?;
        self.broker.purge_queue(queue, selector).await
    }
}

/// Reachable authority nodes by id. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<NodeId, Arc<dyn AuthorityClient>, RandomState>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client: Arc<dyn AuthorityClient>) {
        let node = client.node_id().clone();
        self.nodes.write().insert(node, client);
    }

    pub fn get(&self, node: &NodeId) -> Option<Arc<dyn AuthorityClient>> {
        self.nodes.read().get(node).cloned()
    }

    /// All nodes, ordered by id.
    pub fn all(&self) -> Vec<Arc<dyn AuthorityClient>> {
        let mut nodes: Vec<_> = self.nodes.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id().cmp(b.node_id()));
        nodes
    }
}
