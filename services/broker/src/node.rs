// Wires one broker node: store, authority directory, broker core and admin.
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use wharf_broker::admin::AdminExecutor;
use wharf_broker::{Broker, LocalAuthority, NodeRegistry, QueueSessions, SessionConfig};
use wharf_common::NodeId;
use wharf_consensus::AuthorityDirectory;
use wharf_storage::InMemoryStore;

use crate::config::BrokerConfig;

/// A single broker node that owns every partition of its directory.
pub struct BrokerNode {
    directory: AuthorityDirectory,
    nodes: NodeRegistry,
    authority: Arc<LocalAuthority>,
    session_config: SessionConfig,
    follower: JoinHandle<()>,
}

impl BrokerNode {
    pub async fn start(config: &BrokerConfig) -> Result<Self> {
        let node_id = NodeId::from(config.cluster.node_id.as_str());
        let directory = AuthorityDirectory::from_config(&config.cluster);
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(Broker::new(node_id.clone(), directory.clone(), store));
        for domain in &config.domains {
            broker
                .register_domain(domain.clone())
                .await
                .with_context(|| format!("register domain {}", domain.name))?;
        }
        let follower = broker.follow_authority();
        // Election is external; a standalone node claims every partition.
        directory.assign_all(Some(node_id.clone()));

        let authority = Arc::new(LocalAuthority::new(broker));
        let nodes = NodeRegistry::new();
        nodes.register(authority.clone());
        tracing::info!(
            node = %node_id,
            cluster = %config.cluster.cluster_id,
            partitions = directory.partitions(),
            domains = config.domains.len(),
            "broker node started"
        );
        Ok(Self {
            directory,
            nodes,
            authority,
            session_config: config.session_config(),
            follower,
        })
    }

    pub fn broker(&self) -> &Arc<Broker> {
        self.authority.broker()
    }

    pub fn authority(&self) -> &Arc<LocalAuthority> {
        &self.authority
    }

    pub fn directory(&self) -> &AuthorityDirectory {
        &self.directory
    }

    pub fn admin(&self) -> AdminExecutor {
        AdminExecutor::new(self.nodes.clone(), self.directory.clone())
    }

    /// Spawns a client session bound to this node's directory.
    pub fn sessions(&self) -> QueueSessions {
        QueueSessions::spawn(
            self.session_config.clone(),
            self.directory.clone(),
            self.nodes.clone(),
        )
    }

    pub fn shutdown(&self) {
        self.follower.abort();
        self.authority.stop();
    }
}

impl Drop for BrokerNode {
    fn drop(&mut self) {
        self.follower.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use wharf_broker::{NodeStatus, OpenOptions};
    use wharf_common::{DomainConfig, Message, QueueUri, RoutingMode};

    fn config() -> BrokerConfig {
        BrokerConfig {
            metrics_bind: "127.0.0.1:0".parse().expect("addr"),
            admin_bind: "127.0.0.1:0".parse().expect("addr"),
            cluster: Default::default(),
            domains: vec![DomainConfig::new("orders", RoutingMode::Priority)],
            open_timeout_ms: 1_000,
            configure_timeout_ms: 1_000,
            close_timeout_ms: 1_000,
            reopen_retry_interval_ms: 10,
            reopen_max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn node_owns_every_partition() {
        let node = BrokerNode::start(&config()).await.expect("start");
        assert!(node.directory().snapshot().is_healthy());
        assert!(node.broker().domain("orders").await.is_some());
    }

    #[tokio::test]
    async fn sessions_round_trip_through_the_node() {
        let node = BrokerNode::start(&config()).await.expect("start");
        let queue: QueueUri = "wharf://orders/new".parse().expect("uri");
        let consumer = node.sessions();
        let producer = node.sessions();
        let mut opened = consumer
            .open(&queue, OpenOptions::reader())
            .await
            .expect("open consumer");
        producer
            .open(&queue, OpenOptions::writer())
            .await
            .expect("open producer");
        producer
            .post_and_wait(&queue, Message::new(Bytes::from_static(b"hello")))
            .await
            .expect("ack");
        let push = opened.pushes.recv().await.expect("push");
        assert_eq!(push.payload, "hello");
    }

    #[tokio::test]
    async fn shutdown_stops_the_authority() {
        let node = BrokerNode::start(&config()).await.expect("start");
        node.shutdown();
        assert_eq!(node.authority().status(), NodeStatus::Down);
    }

    #[tokio::test]
    async fn fanout_domain_without_apps_fails_start() {
        let mut config = config();
        config.domains.push(DomainConfig::new(
            "events",
            RoutingMode::Fanout { app_ids: vec![] },
        ));
        assert!(BrokerNode::start(&config).await.is_err());
    }
}
