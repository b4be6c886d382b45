// Partition ownership as seen by the rest of the cluster.
// Election itself is external; this crate only publishes who the current
// authority is for each partition and notifies watchers when that changes.
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::watch;
use wharf_common::{NodeId, QueueKey};

/// Cluster configuration values for a simple local setup.
///
/// ```
/// use wharf_consensus::ClusterConfig;
///
/// let config = ClusterConfig::default();
/// assert!(config.election_timeout_ms > config.heartbeat_interval_ms);
/// assert!(config.partitions > 0);
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub cluster_id: String,
    pub node_id: String,
    pub partitions: u32,
    pub election_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        // Defaults are tuned for local development over correctness.
        Self {
            cluster_id: "wharf-local".into(),
            node_id: "node-1".into(),
            partitions: 4,
            election_timeout_ms: 1500,
            heartbeat_interval_ms: 300,
        }
    }
}

/// Authority assignment for every partition at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityView {
    // Bumped on every assignment change.
    pub term: u64,
    assignments: Vec<Option<NodeId>>,
}

impl AuthorityView {
    pub fn authority_for(&self, partition: u32) -> Option<&NodeId> {
        self.assignments
            .get(partition as usize)
            .and_then(|node| node.as_ref())
    }

    pub fn partitions(&self) -> u32 {
        self.assignments.len() as u32
    }

    // Healthy means every partition has an authority.
    pub fn is_healthy(&self) -> bool {
        self.assignments.iter().all(Option::is_some)
    }
}

/// Publishes partition authorities and change notifications.
///
/// ```
/// use wharf_common::{NodeId, QueueKey};
/// use wharf_consensus::AuthorityDirectory;
///
/// let directory = AuthorityDirectory::new(2);
/// let queue = QueueKey::new("orders", "eu");
/// assert_eq!(directory.current_authority(&queue), None);
/// directory.assign_all(Some(NodeId::from("node-1")));
/// assert_eq!(directory.current_authority(&queue), Some(NodeId::from("node-1")));
/// ```
#[derive(Debug, Clone)]
pub struct AuthorityDirectory {
    tx: Arc<watch::Sender<AuthorityView>>,
}

impl AuthorityDirectory {
    pub fn new(partitions: u32) -> Self {
        let partitions = partitions.max(1);
        let view = AuthorityView {
            term: 0,
            assignments: vec![None; partitions as usize],
        };
        let (tx, _rx) = watch::channel(view);
        Self { tx: Arc::new(tx) }
    }

    /// Single-partition directory already owned by `node`.
    pub fn single(node: NodeId) -> Self {
        let directory = Self::new(1);
        directory.assign_all(Some(node));
        directory
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(config.partitions)
    }

    pub fn partitions(&self) -> u32 {
        self.tx.borrow().partitions()
    }

    pub fn partition_for(&self, queue: &QueueKey) -> u32 {
        partition_of(queue, self.partitions())
    }

    pub fn current_authority(&self, queue: &QueueKey) -> Option<NodeId> {
        let view = self.tx.borrow();
        view.authority_for(partition_of(queue, view.partitions()))
            .cloned()
    }

    pub fn snapshot(&self) -> AuthorityView {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthorityView> {
        self.tx.subscribe()
    }

    pub fn assign(&self, partition: u32, node: Option<NodeId>) {
        self.tx.send_modify(|view| {
            if let Some(slot) = view.assignments.get_mut(partition as usize) {
                *slot = node.clone();
                view.term += 1;
            }
        });
        tracing::info!(partition, node = ?node, "partition authority changed");
    }

    pub fn assign_all(&self, node: Option<NodeId>) {
        self.tx.send_modify(|view| {
            for slot in view.assignments.iter_mut() {
                *slot = node.clone();
            }
            view.term += 1;
        });
        tracing::info!(node = ?node, "all partition authorities changed");
    }
}

// FNV-1a keeps queue placement stable across processes.
fn partition_of(queue: &QueueKey, partitions: u32) -> u32 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in queue
        .domain
        .bytes()
        .chain(std::iter::once(b'/'))
        .chain(queue.queue.bytes())
    {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    (hash % u64::from(partitions.max(1))) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = ClusterConfig::default();
        assert_eq!(config.cluster_id, "wharf-local");
        assert_eq!(config.node_id, "node-1");
        assert!(config.election_timeout_ms > config.heartbeat_interval_ms);
    }

    #[test]
    fn partition_assignment_is_stable() {
        let directory = AuthorityDirectory::new(8);
        let queue = QueueKey::new("d", "q");
        let first = directory.partition_for(&queue);
        assert_eq!(first, directory.partition_for(&queue));
        assert!(first < 8);
    }

    #[test]
    fn unassigned_partition_makes_view_unhealthy() {
        let directory = AuthorityDirectory::new(2);
        directory.assign(0, Some(NodeId::from("a")));
        let view = directory.snapshot();
        assert!(!view.is_healthy());
        assert_eq!(view.authority_for(0), Some(&NodeId::from("a")));
        directory.assign(1, Some(NodeId::from("b")));
        assert!(directory.snapshot().is_healthy());
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let directory = AuthorityDirectory::single(NodeId::from("a"));
        let mut rx = directory.subscribe();
        let term = rx.borrow().term;
        directory.assign_all(Some(NodeId::from("b")));
        rx.changed().await.expect("changed");
        let view = rx.borrow().clone();
        assert!(view.term > term);
        assert_eq!(view.authority_for(0), Some(&NodeId::from("b")));
    }
}
