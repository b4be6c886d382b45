// In-memory message store. Operations complete synchronously; the returned
// futures are already resolved.
use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;

use wharf_common::ids::MessageGuid;
use wharf_common::{AppSelector, Message, QueueKey};

use crate::store::{BoxFuture, MessageStore, Offset, PurgeOutcome, StoredMessage};
use crate::{Result, StorageError};

#[derive(Debug)]
struct Record {
    message: Message,
    // App ids that have not confirmed this message yet.
    pending: Vec<String>,
}

#[derive(Debug, Default)]
struct QueueLog {
    next_offset: Offset,
    records: BTreeMap<Offset, Record>,
    by_guid: HashMap<MessageGuid, Offset, RandomState>,
}

impl QueueLog {
    fn drop_record(&mut self, offset: Offset) {
        if let Some(record) = self.records.remove(&offset) {
            self.by_guid.remove(&record.message.guid);
        }
    }
}

type DomainQueues = HashMap<String, QueueLog, RandomState>;

/// Shared in-memory store.
///
/// ```
/// use bytes::Bytes;
/// use wharf_common::{Message, QueueKey};
/// use wharf_storage::{InMemoryStore, MessageStore};
///
/// let store = InMemoryStore::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     store.register_domain("orders").await.expect("domain");
///     let queue = QueueKey::new("orders", "eu");
///     let apps = vec!["__default".to_string()];
///     store
///         .append(&queue, Message::new(Bytes::from_static(b"m1")), &apps)
///         .await
///         .expect("append");
///     let pending = store.read_pending(&queue, "__default").await.expect("read");
///     assert_eq!(pending.len(), 1);
/// });
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    domains: Mutex<HashMap<String, DomainQueues, RandomState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn append_now(&self, queue: &QueueKey, message: Message, app_ids: &[String]) -> Result<Offset> {
        let mut domains = self.domains.lock();
        let queues = domains
            .get_mut(queue.domain.as_str())
            .ok_or_else(|| StorageError::UnknownDomain(queue.domain.clone()))?;
        let log = queues.entry(queue.queue.clone()).or_default();
        if let Some(offset) = log.by_guid.get(&message.guid) {
            return Ok(*offset);
        }
        let offset = log.next_offset;
        log.next_offset += 1;
        if app_ids.is_empty() {
            return Ok(offset);
        }
        log.by_guid.insert(message.guid, offset);
        log.records.insert(
            offset,
            Record {
                message,
                pending: app_ids.to_vec(),
            },
        );
        Ok(offset)
    }

    fn read_pending_now(&self, queue: &QueueKey, app_id: &str) -> Result<Vec<StoredMessage>> {
        let domains = self.domains.lock();
        let queues = domains
            .get(queue.domain.as_str())
            .ok_or_else(|| StorageError::UnknownDomain(queue.domain.clone()))?;
        let Some(log) = queues.get(queue.queue.as_str()) else {
            return Ok(Vec::new());
        };
        Ok(log
            .records
            .iter()
            .filter(|(_, record)| record.pending.iter().any(|app| app == app_id))
            .map(|(offset, record)| StoredMessage {
                offset: *offset,
                message: record.message.clone(),
            })
            .collect())
    }

    fn confirm_now(&self, queue: &QueueKey, app_id: &str, guid: MessageGuid) -> Result<bool> {
        let mut domains = self.domains.lock();
        let queues = domains
            .get_mut(queue.domain.as_str())
            .ok_or_else(|| StorageError::UnknownDomain(queue.domain.clone()))?;
        let Some(log) = queues.get_mut(queue.queue.as_str()) else {
            return Ok(false);
        };
        let Some(offset) = log.by_guid.get(&guid).copied() else {
            return Ok(false);
        };
        let Some(record) = log.records.get_mut(&offset) else {
            return Ok(false);
        };
        let before = record.pending.len();
        record.pending.retain(|app| app != app_id);
        let confirmed = record.pending.len() != before;
        if record.pending.is_empty() {
            log.drop_record(offset);
        }
        Ok(confirmed)
    }

    fn purge_now(
        &self,
        queue: &QueueKey,
        selector: &AppSelector,
        retain: &[(&str, MessageGuid)],
    ) -> Result<PurgeOutcome> {
        let mut domains = self.domains.lock();
        let queues = domains
            .get_mut(queue.domain.as_str())
            .ok_or_else(|| StorageError::UnknownDomain(queue.domain.clone()))?;
        let Some(log) = queues.get_mut(queue.queue.as_str()) else {
            return Ok(PurgeOutcome::default());
        };
        let mut outcome = PurgeOutcome::default();
        let mut emptied = Vec::new();
        for (offset, record) in log.records.iter_mut() {
            let guid = record.message.guid;
            let before = record.pending.len();
            record.pending.retain(|app| {
                !selector.matches(app) || retain.contains(&(app.as_str(), guid))
            });
            if record.pending.len() != before {
                outcome.messages += 1;
                outcome.bytes += record.message.size();
            }
            if record.pending.is_empty() {
                emptied.push(*offset);
            }
        }
        for offset in emptied {
            log.drop_record(offset);
        }
        Ok(outcome)
    }
}

impl MessageStore for InMemoryStore {
    fn register_domain(&self, domain: &str) -> BoxFuture<'_, Result<()>> {
        self.domains
            .lock()
            .entry(domain.to_string())
            .or_insert_with(|| HashMap::with_hasher(RandomState::new()));
        Box::pin(async { Ok(()) })
    }

    fn domain_exists(&self, domain: &str) -> BoxFuture<'_, Result<bool>> {
        let exists = self.domains.lock().contains_key(domain);
        Box::pin(async move { Ok(exists) })
    }

    fn remove_domain(&self, domain: &str) -> BoxFuture<'_, Result<()>> {
        let removed = self.domains.lock().remove(domain);
        if removed.is_some() {
            tracing::info!(domain, "domain removed from storage");
        }
        Box::pin(async { Ok(()) })
    }

    fn queues_in_domain(&self, domain: &str) -> BoxFuture<'_, Result<Vec<QueueKey>>> {
        let result = self
            .domains
            .lock()
            .get(domain)
            .map(|queues| {
                let mut keys: Vec<QueueKey> = queues
                    .keys()
                    .map(|queue| QueueKey::new(domain, queue.as_str()))
                    .collect();
                keys.sort();
                keys
            })
            .ok_or_else(|| StorageError::UnknownDomain(domain.to_string()));
        Box::pin(async move { result })
    }

    fn append(
        &self,
        queue: &QueueKey,
        message: Message,
        app_ids: &[String],
    ) -> BoxFuture<'_, Result<Offset>> {
        let result = self.append_now(queue, message, app_ids);
        Box::pin(async move { result })
    }

    fn contains(&self, queue: &QueueKey, guid: MessageGuid) -> BoxFuture<'_, Result<bool>> {
        let found = self
            .domains
            .lock()
            .get(queue.domain.as_str())
            .and_then(|queues| queues.get(queue.queue.as_str()))
            .is_some_and(|log| log.by_guid.contains_key(&guid));
        Box::pin(async move { Ok(found) })
    }

    fn read_pending(
        &self,
        queue: &QueueKey,
        app_id: &str,
    ) -> BoxFuture<'_, Result<Vec<StoredMessage>>> {
        let result = self.read_pending_now(queue, app_id);
        Box::pin(async move { result })
    }

    fn confirm(
        &self,
        queue: &QueueKey,
        app_id: &str,
        guid: MessageGuid,
    ) -> BoxFuture<'_, Result<bool>> {
        let result = self.confirm_now(queue, app_id, guid);
        Box::pin(async move { result })
    }

    fn purge(
        &self,
        queue: &QueueKey,
        selector: &AppSelector,
        retain: &[(&str, MessageGuid)],
    ) -> BoxFuture<'_, Result<PurgeOutcome>> {
        let result = self.purge_now(queue, selector, retain);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn apps(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    async fn store_with_domain() -> (InMemoryStore, QueueKey) {
        let store = InMemoryStore::new();
        store.register_domain("d").await.expect("domain");
        (store, QueueKey::new("d", "q"))
    }

    #[tokio::test]
    async fn append_requires_known_domain() {
        let store = InMemoryStore::new();
        let err = store
            .append(
                &QueueKey::new("missing", "q"),
                Message::new(Bytes::from_static(b"x")),
                &apps(&["a"]),
            )
            .await
            .expect_err("unknown domain");
        assert_eq!(err, StorageError::UnknownDomain("missing".into()));
    }

    #[tokio::test]
    async fn duplicate_guid_is_stored_once() {
        let (store, queue) = store_with_domain().await;
        let message = Message::new(Bytes::from_static(b"once"));
        let first = store
            .append(&queue, message.clone(), &apps(&["a"]))
            .await
            .expect("append");
        let second = store
            .append(&queue, message, &apps(&["a"]))
            .await
            .expect("append again");
        assert_eq!(first, second);
        assert_eq!(store.read_pending(&queue, "a").await.expect("read").len(), 1);
    }

    #[tokio::test]
    async fn confirm_is_tracked_per_app() {
        let (store, queue) = store_with_domain().await;
        let message = Message::new(Bytes::from_static(b"fan"));
        let guid = message.guid;
        store
            .append(&queue, message, &apps(&["foo", "bar"]))
            .await
            .expect("append");
        assert!(store.confirm(&queue, "foo", guid).await.expect("confirm"));
        assert!(store.read_pending(&queue, "foo").await.expect("foo").is_empty());
        assert_eq!(store.read_pending(&queue, "bar").await.expect("bar").len(), 1);
        assert!(store.contains(&queue, guid).await.expect("contains"));
        assert!(store.confirm(&queue, "bar", guid).await.expect("confirm"));
        assert!(!store.contains(&queue, guid).await.expect("contains"));
    }

    #[tokio::test]
    async fn purge_skips_retained_messages() {
        let (store, queue) = store_with_domain().await;
        let delivered = Message::new(Bytes::from_static(b"123"));
        let retained = delivered.guid;
        store
            .append(&queue, delivered, &apps(&["foo", "bar"]))
            .await
            .expect("append");
        store
            .append(&queue, Message::new(Bytes::from_static(b"45")), &apps(&["foo", "bar"]))
            .await
            .expect("append");

        let outcome = store
            .purge(&queue, &AppSelector::App("foo".into()), &[("foo", retained)])
            .await
            .expect("purge");
        assert_eq!(outcome, PurgeOutcome { messages: 1, bytes: 2 });
        assert_eq!(store.read_pending(&queue, "foo").await.expect("foo").len(), 1);
        assert_eq!(store.read_pending(&queue, "bar").await.expect("bar").len(), 2);

        let outcome = store
            .purge(&queue, &AppSelector::All, &[])
            .await
            .expect("purge all");
        assert_eq!(outcome, PurgeOutcome { messages: 2, bytes: 5 });
        let again = store
            .purge(&queue, &AppSelector::All, &[])
            .await
            .expect("purge again");
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn purge_all_retains_only_the_delivering_app() {
        let (store, queue) = store_with_domain().await;
        let delivered = Message::new(Bytes::from_static(b"abcd"));
        let guid = delivered.guid;
        store
            .append(&queue, delivered, &apps(&["foo", "bar"]))
            .await
            .expect("append");

        let outcome = store
            .purge(&queue, &AppSelector::All, &[("foo", guid)])
            .await
            .expect("purge");
        assert_eq!(outcome, PurgeOutcome { messages: 1, bytes: 4 });
        assert!(store.read_pending(&queue, "bar").await.expect("bar").is_empty());
        assert_eq!(store.read_pending(&queue, "foo").await.expect("foo").len(), 1);
        assert!(store.confirm(&queue, "foo", guid).await.expect("confirm"));
        assert!(!store.contains(&queue, guid).await.expect("contains"));
    }

    #[tokio::test]
    async fn remove_domain_forgets_queues() {
        let (store, queue) = store_with_domain().await;
        store
            .append(&queue, Message::new(Bytes::from_static(b"x")), &apps(&["a"]))
            .await
            .expect("append");
        assert_eq!(store.queues_in_domain("d").await.expect("queues"), vec![queue]);
        store.remove_domain("d").await.expect("remove");
        assert!(!store.domain_exists("d").await.expect("exists"));
        assert!(store.queues_in_domain("d").await.is_err());
    }
}
