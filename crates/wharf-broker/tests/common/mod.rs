#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use wharf_broker::{
    Broker, HandleSnapshot, HandleState, LocalAuthority, NodeRegistry, PushStream, QueueSessions,
    SessionConfig,
};
use wharf_common::{DomainConfig, NodeId, PushEvent, QueueUri};
use wharf_consensus::AuthorityDirectory;
use wharf_storage::InMemoryStore;

/// In-process cluster sharing one store and one directory. The first node
/// starts as authority for every partition.
pub struct Cluster {
    pub directory: AuthorityDirectory,
    pub store: Arc<InMemoryStore>,
    pub nodes: NodeRegistry,
    authorities: Vec<Arc<LocalAuthority>>,
}

impl Cluster {
    pub async fn start(names: &[&str], domains: &[DomainConfig]) -> Self {
        let directory = AuthorityDirectory::new(1);
        let store = Arc::new(InMemoryStore::new());
        let nodes = NodeRegistry::new();
        let mut authorities = Vec::new();
        for name in names {
            let broker = Arc::new(Broker::new(
                NodeId::from(*name),
                directory.clone(),
                store.clone(),
            ));
            for domain in domains {
                broker
                    .register_domain(domain.clone())
                    .await
                    .expect("register domain");
            }
            broker.follow_authority();
            let authority = Arc::new(LocalAuthority::new(broker));
            nodes.register(authority.clone());
            authorities.push(authority);
        }
        directory.assign_all(Some(NodeId::from(names[0])));
        Self {
            directory,
            store,
            nodes,
            authorities,
        }
    }

    pub fn node(&self, name: &str) -> &Arc<LocalAuthority> {
        self.authorities
            .iter()
            .find(|node| node.broker().node_id().as_str() == name)
            .expect("known node")
    }

    pub fn session(&self) -> QueueSessions {
        self.session_with(SessionConfig::default())
    }

    pub fn session_with(&self, config: SessionConfig) -> QueueSessions {
        QueueSessions::spawn(config, self.directory.clone(), self.nodes.clone())
    }

    pub fn fail_over(&self, to: &str) {
        self.directory.assign_all(Some(NodeId::from(to)));
    }
}

pub fn uri(text: &str) -> QueueUri {
    text.parse().expect("uri")
}

pub async fn next_push(stream: &mut PushStream) -> PushEvent {
    tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("push within deadline")
        .expect("push stream open")
}

/// Gives in-flight pushes a moment, then asserts none arrived.
pub async fn assert_no_push(stream: &mut PushStream) {
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(stream.try_recv().is_err(), "unexpected push");
}

pub async fn wait_for_state(
    session: &QueueSessions,
    uri: &QueueUri,
    state: HandleState,
) -> HandleSnapshot {
    for _ in 0..500 {
        if let Some(snapshot) = session.handle_state(uri).await
            && snapshot.state == state
        {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("handle for {uri} never reached {state:?}");
}
