use std::future::Future;
use std::pin::Pin;

use wharf_common::ids::MessageGuid;
use wharf_common::{AppSelector, Message, QueueKey};

use crate::Result;

pub type Offset = u64;
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub offset: Offset,
    pub message: Message,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub messages: u64,
    pub bytes: u64,
}

impl PurgeOutcome {
    pub fn is_empty(&self) -> bool {
        self.messages == 0
    }

    pub fn merge(&mut self, other: PurgeOutcome) {
        self.messages += other.messages;
        self.bytes += other.bytes;
    }
}

/// Durable pending-message store, one log per queue.
///
/// A message is pending for every app id it was appended with until each of
/// them confirms it or it is purged.
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    fn register_domain(&self, domain: &str) -> BoxFuture<'_, Result<()>>;
    fn domain_exists(&self, domain: &str) -> BoxFuture<'_, Result<bool>>;
    // Drops the domain and every queue log in it.
    fn remove_domain(&self, domain: &str) -> BoxFuture<'_, Result<()>>;
    fn queues_in_domain(&self, domain: &str) -> BoxFuture<'_, Result<Vec<QueueKey>>>;
    // Appending a GUID that is already stored returns the original offset.
    fn append(
        &self,
        queue: &QueueKey,
        message: Message,
        app_ids: &[String],
    ) -> BoxFuture<'_, Result<Offset>>;
    fn contains(&self, queue: &QueueKey, guid: MessageGuid) -> BoxFuture<'_, Result<bool>>;
    fn read_pending(
        &self,
        queue: &QueueKey,
        app_id: &str,
    ) -> BoxFuture<'_, Result<Vec<StoredMessage>>>;
    fn confirm(
        &self,
        queue: &QueueKey,
        app_id: &str,
        guid: MessageGuid,
    ) -> BoxFuture<'_, Result<bool>>;
    // `(app_id, guid)` pairs listed in `retain` stay pending for that app
    // only (delivered but unconfirmed).
    fn purge(
        &self,
        queue: &QueueKey,
        selector: &AppSelector,
        retain: &[(&str, MessageGuid)],
    ) -> BoxFuture<'_, Result<PurgeOutcome>>;
}
