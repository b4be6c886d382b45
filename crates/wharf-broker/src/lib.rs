// Queue broker core: the authority-side delivery engine plus the session
// layer that drives client handles against whichever node is authority.
// The broker enforces domain existence and per-queue limits through the
// domain registry; storage and partition ownership are external.
use ahash::RandomState;
use hashbrown::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use wharf_common::ids::{ClientId, HandleId};
use wharf_common::{
    AppSelector, ConfirmSelector, ConsumerParams, DomainConfig, HandleFlags, Message, NodeId,
    QueueKey, QueueUri, RoutingMode,
};
use wharf_consensus::AuthorityDirectory;
use wharf_storage::{MessageStore, PurgeOutcome, StorageError};

pub mod admin;
pub mod authority;
pub mod domain;
pub mod flow_control;
pub mod handle;
pub mod push;
pub mod queue;
pub mod routing;
pub mod session;

pub use authority::{AuthorityClient, LocalAuthority, NodeRegistry, NodeStatus, RequestCounts};
pub use domain::{Domain, DomainRegistry};
pub use handle::{HandleSnapshot, HandleState};
pub use push::{PushSink, PushStream};
pub use queue::{BranchStats, QueueStats};
pub use session::{OpenOptions, OpenedQueue, PendingAck, QueueSessions, SessionConfig, SessionError};

use queue::QueueEngine;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("Domain '{0}' doesn't exist")]
    DomainNotFound(String),
    #[error("domain '{0}' has been removed")]
    DomainRemoved(String),
    #[error("Trying to remove the domain '{domain}' while there are queues open")]
    QueuesOpen { domain: String },
    #[error("unknown app id '{app_id}' for {queue}")]
    UnknownApp { queue: String, app_id: String },
    #[error("handle not found: {0}")]
    HandleNotFound(HandleId),
    #[error("{0}")]
    LimitExceeded(String),
    #[error("node {node} is not the authority for {queue}")]
    NotAuthority { queue: String, node: NodeId },
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<wharf_common::Error> for BrokerError {
    fn from(err: wharf_common::Error) -> Self {
        BrokerError::InvalidRequest(err.to_string())
    }
}

/// Open (or reopen) request as the authority receives it.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub handle: HandleId,
    pub client: ClientId,
    pub uri: QueueUri,
    pub flags: HandleFlags,
    pub params: ConsumerParams,
    // Required when `flags.read` is set.
    pub sink: Option<PushSink>,
}

/// Purge result for one queue of a removed domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePurge {
    pub queue: QueueKey,
    pub outcome: PurgeOutcome,
}

#[derive(Debug, Clone)]
struct HandleRecord {
    uri: QueueUri,
    flags: HandleFlags,
    client: ClientId,
}

impl HandleRecord {
    fn consumer(&self) -> bool {
        self.flags.read
    }

    fn producer(&self) -> bool {
        self.flags.write
    }
}

/// Authority-side broker node.
///
/// ```
/// use bytes::Bytes;
/// use std::sync::Arc;
/// use wharf_broker::{Broker, OpenRequest, PushSink};
/// use wharf_common::ids::{ClientId, HandleId};
/// use wharf_common::{ConsumerParams, DomainConfig, HandleFlags, Message, NodeId, RoutingMode};
/// use wharf_consensus::AuthorityDirectory;
/// use wharf_storage::InMemoryStore;
///
/// let node = NodeId::from("node-1");
/// let broker = Broker::new(
///     node.clone(),
///     AuthorityDirectory::single(node),
///     Arc::new(InMemoryStore::new()),
/// );
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     broker
///         .register_domain(DomainConfig::new("orders", RoutingMode::Priority))
///         .await
///         .expect("domain");
///     let uri = "wharf://orders/eu".parse().expect("uri");
///     let (sink, mut pushes) = PushSink::channel();
///     broker
///         .open_handle(OpenRequest {
///             handle: HandleId::new(),
///             client: ClientId::new(),
///             uri,
///             flags: HandleFlags::reader(),
///             params: ConsumerParams::default(),
///             sink: Some(sink),
///         })
///         .await
///         .expect("open consumer");
///     let producer = HandleId::new();
///     broker
///         .open_handle(OpenRequest {
///             handle: producer,
///             client: ClientId::new(),
///             uri: "wharf://orders/eu".parse().expect("uri"),
///             flags: HandleFlags::writer(),
///             params: ConsumerParams::default(),
///             sink: None,
///         })
///         .await
///         .expect("open producer");
///     broker
///         .post(producer, Message::new(Bytes::from_static(b"hello")))
///         .await
///         .expect("post");
///     let event = pushes.recv().await.expect("push");
///     assert_eq!(event.payload, Bytes::from_static(b"hello"));
/// });
/// ```
#[derive(Debug)]
pub struct Broker {
    node_id: NodeId,
    directory: AuthorityDirectory,
    store: Arc<dyn MessageStore>,
    domains: DomainRegistry,
    // Queue key -> delivery engine; created lazily from storage.
    queues: RwLock<HashMap<QueueKey, Arc<Mutex<QueueEngine>>, RandomState>>,
    // Handles registered at this node.
    handles: RwLock<HashMap<HandleId, HandleRecord, RandomState>>,
}

impl Broker {
    pub fn new(node_id: NodeId, directory: AuthorityDirectory, store: Arc<dyn MessageStore>) -> Self {
        Self {
            node_id,
            directory,
            store,
            domains: DomainRegistry::new(),
            queues: RwLock::new(HashMap::with_hasher(RandomState::new())),
            handles: RwLock::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn directory(&self) -> &AuthorityDirectory {
        &self.directory
    }

    pub async fn register_domain(&self, config: DomainConfig) -> Result<()> {
        if let RoutingMode::Fanout { app_ids } = &config.mode
            && app_ids.is_empty()
        {
            return Err(BrokerError::InvalidRequest(format!(
                "fanout domain '{}' needs at least one app id",
                config.name
            )));
        }
        self.store.register_domain(&config.name).await?;
        let name = config.name.clone();
        self.domains.register(config).await;
        tracing::info!(node = %self.node_id, domain = %name, "domain registered");
        Ok(())
    }

    pub async fn domain(&self, name: &str) -> Option<Arc<Domain>> {
        self.domains.get(name).await
    }

    pub async fn domain_exists(&self, name: &str) -> Result<bool> {
        if let Some(domain) = self.domains.get(name).await
            && !domain.is_removed()
        {
            return Ok(true);
        }
        Ok(self.store.domain_exists(name).await?)
    }

    pub async fn open_handle_count(&self, domain: &str) -> usize {
        self.domains
            .get(domain)
            .await
            .map(|domain| domain.open_handles())
            .unwrap_or(0)
    }

    pub fn is_authority(&self, queue: &QueueKey) -> bool {
        self.directory.current_authority(queue).as_ref() == Some(&self.node_id)
    }

    fn ensure_authority(&self, queue: &QueueKey) -> Result<()> {
        if self.is_authority(queue) {
            Ok(())
        } else {
            Err(BrokerError::NotAuthority {
                queue: queue.to_string(),
                node: self.node_id.clone(),
            })
        }
    }

    async fn live_domain(&self, name: &str) -> Result<Arc<Domain>> {
        let domain = self
            .domains
            .get(name)
            .await
            .ok_or_else(|| BrokerError::DomainNotFound(name.to_string()))?;
        if domain.is_removed() {
            return Err(BrokerError::DomainRemoved(name.to_string()));
        }
        Ok(domain)
    }

    async fn queue_engine(
        &self,
        key: &QueueKey,
        config: &DomainConfig,
    ) -> Result<Arc<Mutex<QueueEngine>>> {
        if let Some(engine) = self.queues.read().await.get(key) {
            return Ok(Arc::clone(engine));
        }
        // Recover outside the map lock; the first insert wins.
        let engine = QueueEngine::recover(key.clone(), config, Arc::clone(&self.store)).await?;
        let mut queues = self.queues.write().await;
        let engine = queues
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(engine)));
        Ok(Arc::clone(engine))
    }

    async fn existing_engine(&self, key: &QueueKey) -> Option<Arc<Mutex<QueueEngine>>> {
        self.queues.read().await.get(key).cloned()
    }

    async fn record(&self, handle: HandleId) -> Result<HandleRecord> {
        self.handles
            .read()
            .await
            .get(&handle)
            .cloned()
            .ok_or(BrokerError::HandleNotFound(handle))
    }

    /// Registers a handle. Re-sending an open for a handle already registered
    /// here (a reopen) refreshes its parameters and push sink.
    pub async fn open_handle(&self, request: OpenRequest) -> Result<()> {
        request.flags.validate()?;
        request.params.validate()?;
        let key = request.uri.key().clone();
        self.ensure_authority(&key)?;
        let domain = self.live_domain(request.uri.domain()).await?;
        let _admitted = domain.admit().await;
        if domain.is_removed() {
            return Err(BrokerError::DomainRemoved(request.uri.domain().to_string()));
        }
        let config = domain.config();
        let engine = self.queue_engine(&key, &config).await?;
        let mut engine = engine.lock().await;

        if request.flags.read {
            engine.validate_app(request.uri.app_id())?;
        } else if request.uri.app_id().is_some() {
            return Err(BrokerError::InvalidRequest(format!(
                "app id is only valid for readers: {}",
                request.uri
            )));
        }
        let sink = match (request.flags.read, request.sink) {
            (true, Some(sink)) => Some(sink),
            (true, None) => {
                return Err(BrokerError::InvalidRequest(
                    "reader handle without push sink".into(),
                ));
            }
            (false, _) => None,
        };

        let reopen = self.handles.read().await.contains_key(&request.handle);
        if request.flags.read
            && !engine.has_consumer(request.handle)
            && let Some(max) = config.max_consumers
            && engine.consumer_count() >= max
        {
            metrics::counter!("wharf_open_rejected_total", "reason" => "max_consumers")
                .increment(1);
            return Err(BrokerError::LimitExceeded(format!(
                "Client would exceed the limit of {max} consumer(s)"
            )));
        }
        if request.flags.write
            && !engine.has_producer(request.handle)
            && let Some(max) = config.max_producers
            && engine.producer_count() >= max
        {
            metrics::counter!("wharf_open_rejected_total", "reason" => "max_producers")
                .increment(1);
            return Err(BrokerError::LimitExceeded(format!(
                "Client would exceed the limit of {max} producer(s)"
            )));
        }

        if let Some(sink) = sink {
            engine.add_consumer(request.handle, request.uri.clone(), request.params, sink);
        }
        if request.flags.write {
            engine.add_producer(request.handle);
        }
        let record = HandleRecord {
            uri: request.uri,
            flags: request.flags,
            client: request.client,
        };
        if !reopen {
            domain.handle_opened(record.consumer(), record.producer());
        }
        tracing::debug!(
            node = %self.node_id,
            handle = %request.handle,
            client = %record.client,
            uri = %record.uri,
            reopen,
            "handle opened"
        );
        self.handles.write().await.insert(request.handle, record);
        Ok(())
    }

    pub async fn configure_handle(&self, handle: HandleId, params: ConsumerParams) -> Result<()> {
        params.validate()?;
        let record = self.record(handle).await?;
        self.ensure_authority(record.uri.key())?;
        let engine = self
            .existing_engine(record.uri.key())
            .await
            .ok_or(BrokerError::HandleNotFound(handle))?;
        engine.lock().await.configure(handle, params)
    }

    /// Closing a handle this node does not know is a successful no-op.
    pub async fn close_handle(&self, handle: HandleId) -> Result<()> {
        let Some(record) = self.handles.write().await.remove(&handle) else {
            tracing::debug!(node = %self.node_id, %handle, "close for unknown handle");
            return Ok(());
        };
        if let Some(engine) = self.existing_engine(record.uri.key()).await {
            engine.lock().await.remove_handle(handle);
        }
        if let Some(domain) = self.domains.get(record.uri.domain()).await {
            domain.handle_closed(record.consumer(), record.producer());
        }
        tracing::debug!(node = %self.node_id, %handle, uri = %record.uri, "handle closed");
        Ok(())
    }

    /// Appends and routes a message. Returns the number of pushes it caused.
    pub async fn post(&self, handle: HandleId, message: Message) -> Result<usize> {
        let record = self.record(handle).await?;
        if !record.flags.write {
            return Err(BrokerError::InvalidRequest(format!(
                "handle {handle} is not open for writing"
            )));
        }
        self.ensure_authority(record.uri.key())?;
        let domain = self.live_domain(record.uri.domain()).await?;
        let engine = self.queue_engine(record.uri.key(), &domain.config()).await?;
        let delivered = engine.lock().await.post(message).await?;
        metrics::counter!("wharf_post_total").increment(1);
        Ok(delivered)
    }

    pub async fn confirm(&self, handle: HandleId, selector: ConfirmSelector) -> Result<usize> {
        let record = self.record(handle).await?;
        self.ensure_authority(record.uri.key())?;
        let engine = self
            .existing_engine(record.uri.key())
            .await
            .ok_or(BrokerError::HandleNotFound(handle))?;
        let mut engine = engine.lock().await;
        engine.confirm(handle, selector).await
    }

    pub async fn purge_queue(&self, queue: &QueueKey, selector: &AppSelector) -> Result<PurgeOutcome> {
        if !self.domain_exists(&queue.domain).await? {
            return Err(BrokerError::DomainNotFound(queue.domain.clone()));
        }
        self.ensure_authority(queue)?;
        match self.domains.get(&queue.domain).await {
            Some(domain) => {
                let engine = self.queue_engine(queue, &domain.config()).await?;
                let mut engine = engine.lock().await;
                engine.purge(selector).await
            }
            None => Ok(self.store.purge(queue, selector, &[]).await?),
        }
    }

    /// Purges every queue of the domain this node is authority for and marks
    /// the domain removed. Fails while handles are open on the domain.
    pub async fn remove_domain(&self, name: &str) -> Result<Vec<QueuePurge>> {
        if !self.domain_exists(name).await? {
            return Err(BrokerError::DomainNotFound(name.to_string()));
        }
        let domain = self.domains.get(name).await;
        let _exclusive = match &domain {
            Some(domain) => Some(domain.exclusive().await),
            None => None,
        };
        if let Some(domain) = &domain
            && domain.open_handles() > 0
        {
            return Err(BrokerError::QueuesOpen {
                domain: name.to_string(),
            });
        }
        let mut purged = Vec::new();
        for queue in self.store.queues_in_domain(name).await? {
            if !self.is_authority(&queue) {
                continue;
            }
            let outcome = match self.existing_engine(&queue).await {
                Some(engine) => engine.lock().await.purge(&AppSelector::All).await?,
                None => self.store.purge(&queue, &AppSelector::All, &[]).await?,
            };
            if !outcome.is_empty() {
                purged.push(QueuePurge { queue, outcome });
            }
        }
        if let Some(domain) = &domain {
            domain.mark_removed();
        }
        tracing::info!(node = %self.node_id, domain = name, queues = purged.len(), "domain removed");
        Ok(purged)
    }

    /// Drops a removed domain from the registry and from storage.
    pub async fn finalize_domain(&self, name: &str) -> Result<()> {
        if let Some(domain) = self.domains.get(name).await
            && !domain.is_removed()
        {
            return Err(BrokerError::InvalidRequest(format!(
                "domain '{name}' must be removed before it is finalized"
            )));
        }
        self.domains.remove(name).await;
        self.queues.write().await.retain(|key, _| key.domain != name);
        self.store.remove_domain(name).await?;
        Ok(())
    }

    pub async fn queue_stats(&self, queue: &QueueKey) -> Option<QueueStats> {
        let engine = self.existing_engine(queue).await?;
        let engine = engine.lock().await;
        Some(engine.stats())
    }

    /// Forgets engines and handles for queues this node no longer owns.
    /// Storage keeps the pending messages for the next authority.
    pub async fn sync_authority(&self) {
        let dropped: Vec<QueueKey> = {
            let mut queues = self.queues.write().await;
            let dropped: Vec<QueueKey> = queues
                .keys()
                .filter(|key| !self.is_authority(key))
                .cloned()
                .collect();
            for key in &dropped {
                queues.remove(key);
            }
            dropped
        };
        let released: Vec<HandleRecord> = {
            let mut handles = self.handles.write().await;
            let stale: Vec<HandleId> = handles
                .iter()
                .filter(|(_, record)| !self.is_authority(record.uri.key()))
                .map(|(id, _)| *id)
                .collect();
            stale.iter().filter_map(|id| handles.remove(id)).collect()
        };
        for record in &released {
            if let Some(domain) = self.domains.get(record.uri.domain()).await {
                domain.handle_closed(record.consumer(), record.producer());
            }
        }
        if !dropped.is_empty() || !released.is_empty() {
            tracing::info!(
                node = %self.node_id,
                queues = dropped.len(),
                handles = released.len(),
                "released queues after authority change"
            );
        }
    }

    /// Keeps the broker in step with the directory until the directory goes
    /// away.
    pub fn follow_authority(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(self);
        let mut rx = broker.directory.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                broker.sync_authority().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use wharf_storage::InMemoryStore;

    fn broker(node: &str) -> Broker {
        let node = NodeId::from(node);
        Broker::new(
            node.clone(),
            AuthorityDirectory::single(node),
            Arc::new(InMemoryStore::new()),
        )
    }

    fn open(uri: &str, flags: HandleFlags, sink: Option<PushSink>) -> OpenRequest {
        OpenRequest {
            handle: HandleId::new(),
            client: ClientId::new(),
            uri: uri.parse().expect("uri"),
            flags,
            params: ConsumerParams::default(),
            sink,
        }
    }

    fn reader(uri: &str) -> (OpenRequest, PushStream) {
        let (sink, stream) = PushSink::channel();
        (open(uri, HandleFlags::reader(), Some(sink)), stream)
    }

    #[tokio::test]
    async fn open_requires_registered_domain() {
        let broker = broker("n1");
        let (request, _stream) = reader("wharf://missing/q");
        let err = broker.open_handle(request).await.expect_err("no domain");
        assert!(matches!(err, BrokerError::DomainNotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn max_consumers_is_enforced_per_queue() {
        let broker = broker("n1");
        broker
            .register_domain(DomainConfig::new("d", RoutingMode::Priority).with_max_consumers(1))
            .await
            .expect("domain");
        let (first, _s1) = reader("wharf://d/q");
        broker.open_handle(first.clone()).await.expect("first");
        let (second, _s2) = reader("wharf://d/q");
        let err = broker.open_handle(second).await.expect_err("limit");
        assert_eq!(
            err.to_string(),
            "Client would exceed the limit of 1 consumer(s)"
        );
        // Another queue in the same domain has its own count.
        let (other, _s3) = reader("wharf://d/other");
        broker.open_handle(other).await.expect("other queue");
        // Reopening the registered handle does not count twice.
        broker.open_handle(first).await.expect("reopen");
        assert_eq!(broker.open_handle_count("d").await, 2);
    }

    #[tokio::test]
    async fn fanout_readers_need_known_app_id() {
        let broker = broker("n1");
        broker
            .register_domain(DomainConfig::new(
                "fan",
                RoutingMode::Fanout {
                    app_ids: vec!["foo".into()],
                },
            ))
            .await
            .expect("domain");
        let (no_app, _s1) = reader("wharf://fan/q");
        assert!(matches!(
            broker.open_handle(no_app).await,
            Err(BrokerError::UnknownApp { .. })
        ));
        let (bad_app, _s2) = reader("wharf://fan/q?id=bar");
        assert!(broker.open_handle(bad_app).await.is_err());
        let (good, _s3) = reader("wharf://fan/q?id=foo");
        broker.open_handle(good).await.expect("foo");
    }

    #[tokio::test]
    async fn close_of_unknown_handle_succeeds() {
        let broker = broker("n1");
        broker.close_handle(HandleId::new()).await.expect("close");
    }

    #[tokio::test]
    async fn non_authority_rejects_requests() {
        let directory = AuthorityDirectory::single(NodeId::from("other"));
        let broker = Broker::new(
            NodeId::from("n1"),
            directory,
            Arc::new(InMemoryStore::new()),
        );
        broker
            .register_domain(DomainConfig::new("d", RoutingMode::Priority))
            .await
            .expect("domain");
        let (request, _stream) = reader("wharf://d/q");
        assert!(matches!(
            broker.open_handle(request).await,
            Err(BrokerError::NotAuthority { .. })
        ));
    }

    #[tokio::test]
    async fn remove_domain_requires_closed_handles() {
        let broker = broker("n1");
        broker
            .register_domain(DomainConfig::new("d", RoutingMode::Priority))
            .await
            .expect("domain");
        let producer = open("wharf://d/q", HandleFlags::writer(), None);
        let handle = producer.handle;
        broker.open_handle(producer).await.expect("open");
        for body in ["aaaa", "bbbb"] {
            broker
                .post(handle, Message::new(Bytes::from(body)))
                .await
                .expect("post");
        }
        let err = broker.remove_domain("d").await.expect_err("queues open");
        assert_eq!(
            err.to_string(),
            "Trying to remove the domain 'd' while there are queues open"
        );

        broker.close_handle(handle).await.expect("close");
        let purged = broker.remove_domain("d").await.expect("remove");
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].outcome, PurgeOutcome { messages: 2, bytes: 8 });
        assert!(broker.remove_domain("d").await.expect("again").is_empty());

        let (late, _stream) = reader("wharf://d/q");
        assert!(matches!(
            broker.open_handle(late).await,
            Err(BrokerError::DomainRemoved(_))
        ));
    }

    #[tokio::test]
    async fn open_waits_for_domain_removal_in_progress() {
        let broker = Arc::new(broker("n1"));
        broker
            .register_domain(DomainConfig::new("d", RoutingMode::Priority))
            .await
            .expect("domain");
        let domain = broker.domains.get("d").await.expect("registered");
        let removing = domain.exclusive().await;

        let open = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move {
                let (request, _stream) = reader("wharf://d/q");
                broker.open_handle(request).await
            }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!open.is_finished());

        domain.mark_removed();
        drop(removing);
        assert!(matches!(
            open.await.expect("join"),
            Err(BrokerError::DomainRemoved(_))
        ));
        assert_eq!(broker.open_handle_count("d").await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_open_and_remove_never_both_succeed() {
        for _ in 0..50 {
            let broker = Arc::new(broker("n1"));
            broker
                .register_domain(DomainConfig::new("d", RoutingMode::Priority))
                .await
                .expect("domain");
            let producer = open("wharf://d/q", HandleFlags::writer(), None);
            let handle = producer.handle;
            broker.open_handle(producer).await.expect("open");
            broker
                .post(handle, Message::new(Bytes::from_static(b"x")))
                .await
                .expect("post");
            broker.close_handle(handle).await.expect("close");

            let remove = tokio::spawn({
                let broker = Arc::clone(&broker);
                async move { broker.remove_domain("d").await }
            });
            let open = tokio::spawn({
                let broker = Arc::clone(&broker);
                async move {
                    let (request, _stream) = reader("wharf://d/q");
                    broker.open_handle(request).await
                }
            });
            let removed = remove.await.expect("join remove");
            let opened = open.await.expect("join open");
            match (removed, opened) {
                (Ok(_), Err(BrokerError::DomainRemoved(_))) => {
                    assert_eq!(broker.open_handle_count("d").await, 0);
                }
                (Err(BrokerError::QueuesOpen { .. }), Ok(())) => {
                    assert_eq!(broker.open_handle_count("d").await, 1);
                }
                other => panic!("open and removal overlapped: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn finalized_domain_no_longer_exists() {
        let broker = broker("n1");
        broker
            .register_domain(DomainConfig::new("d", RoutingMode::Priority))
            .await
            .expect("domain");
        assert!(broker.finalize_domain("d").await.is_err());
        broker.remove_domain("d").await.expect("remove");
        broker.finalize_domain("d").await.expect("finalize");
        assert!(!broker.domain_exists("d").await.expect("exists"));
        assert!(matches!(
            broker.remove_domain("d").await,
            Err(BrokerError::DomainNotFound(_))
        ));
    }

    #[tokio::test]
    async fn configure_moves_consumer_between_tiers() {
        let broker = broker("n1");
        broker
            .register_domain(DomainConfig::new("d", RoutingMode::Priority))
            .await
            .expect("domain");
        let (a, mut a_stream) = reader("wharf://d/q");
        let a_handle = a.handle;
        broker.open_handle(a).await.expect("a");
        let (b, mut b_stream) = reader("wharf://d/q");
        broker.open_handle(b).await.expect("b");
        broker
            .configure_handle(a_handle, ConsumerParams::default().with_priority(5))
            .await
            .expect("configure");
        let producer = open("wharf://d/q", HandleFlags::writer(), None);
        let producer_handle = producer.handle;
        broker.open_handle(producer).await.expect("producer");
        for _ in 0..3 {
            broker
                .post(producer_handle, Message::new(Bytes::from_static(b"x")))
                .await
                .expect("post");
        }
        for _ in 0..3 {
            a_stream.try_recv().expect("a receives");
        }
        assert!(b_stream.try_recv().is_err());
    }

    #[tokio::test]
    async fn sync_authority_releases_lost_queues() {
        let node = NodeId::from("n1");
        let directory = AuthorityDirectory::single(node.clone());
        let broker = Broker::new(node, directory.clone(), Arc::new(InMemoryStore::new()));
        broker
            .register_domain(DomainConfig::new("d", RoutingMode::Priority))
            .await
            .expect("domain");
        let (request, _stream) = reader("wharf://d/q");
        broker.open_handle(request).await.expect("open");
        assert_eq!(broker.open_handle_count("d").await, 1);

        directory.assign_all(Some(NodeId::from("n2")));
        broker.sync_authority().await;
        assert_eq!(broker.open_handle_count("d").await, 0);
        assert!(broker.queue_stats(&QueueKey::new("d", "q")).await.is_none());
    }
}
