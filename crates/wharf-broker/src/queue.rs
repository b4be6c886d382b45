// Delivery engine for one queue.
// The engine owns the consumer table, the routing table and the flow-control
// ledger for its queue. The broker keeps each engine behind a mutex, so every
// routing decision, ledger update and push happens in one critical section.
use ahash::RandomState;
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use wharf_common::ids::{HandleId, MessageGuid};
use wharf_common::{
    AppSelector, ConfirmSelector, ConsumerParams, DEFAULT_APP_ID, DomainConfig, Message,
    PushEvent, QueueKey, QueueUri, RoutingMode,
};
use wharf_storage::{MessageStore, PurgeOutcome};

use crate::flow_control::FlowControlLedger;
use crate::push::PushSink;
use crate::routing::RoutingTable;
use crate::{BrokerError, Result};

#[derive(Debug)]
struct Consumer {
    uri: QueueUri,
    app_id: String,
    sink: PushSink,
    // Delivered but unconfirmed, oldest first.
    unconfirmed: VecDeque<MessageGuid>,
}

#[derive(Debug, Default)]
struct Branch {
    backlog: VecDeque<MessageGuid>,
    in_flight: HashMap<MessageGuid, HandleId, RandomState>,
}

#[derive(Debug)]
struct Retained {
    message: Message,
    // Branches (or broadcast receivers) that still have to confirm.
    remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchStats {
    pub app_id: String,
    pub backlog: usize,
    pub unconfirmed: usize,
    pub consumers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub queue: QueueKey,
    pub mode: &'static str,
    pub consumers: usize,
    pub producers: usize,
    pub branches: Vec<BranchStats>,
}

impl QueueStats {
    pub fn branch(&self, app_id: &str) -> Option<&BranchStats> {
        self.branches.iter().find(|branch| branch.app_id == app_id)
    }
}

#[derive(Debug)]
pub(crate) struct QueueEngine {
    key: QueueKey,
    mode: RoutingMode,
    app_ids: Vec<String>,
    store: Arc<dyn MessageStore>,
    routing: RoutingTable,
    ledger: FlowControlLedger,
    consumers: HashMap<HandleId, Consumer, RandomState>,
    producers: HashMap<HandleId, (), RandomState>,
    branches: HashMap<String, Branch, RandomState>,
    messages: HashMap<MessageGuid, Retained, RandomState>,
}

impl QueueEngine {
    /// Builds the engine from whatever storage still holds as pending, so a
    /// new authority resumes delivery where the previous one stopped.
    pub(crate) async fn recover(
        key: QueueKey,
        config: &DomainConfig,
        store: Arc<dyn MessageStore>,
    ) -> Result<Self> {
        let mut engine = Self {
            key,
            mode: config.mode.clone(),
            app_ids: config.app_ids(),
            store,
            routing: RoutingTable::new(),
            ledger: FlowControlLedger::new(),
            consumers: HashMap::with_hasher(RandomState::new()),
            producers: HashMap::with_hasher(RandomState::new()),
            branches: HashMap::with_hasher(RandomState::new()),
            messages: HashMap::with_hasher(RandomState::new()),
        };
        for app_id in engine.app_ids.clone() {
            engine.branches.insert(app_id.clone(), Branch::default());
            if engine.is_broadcast() {
                continue;
            }
            let pending = engine.store.read_pending(&engine.key, &app_id).await?;
            for stored in pending {
                let guid = stored.message.guid;
                engine
                    .messages
                    .entry(guid)
                    .or_insert_with(|| Retained {
                        message: stored.message,
                        remaining: 0,
                    })
                    .remaining += 1;
                if let Some(branch) = engine.branches.get_mut(&app_id) {
                    branch.backlog.push_back(guid);
                }
            }
        }
        if !engine.messages.is_empty() {
            tracing::debug!(
                queue = %engine.key,
                messages = engine.messages.len(),
                "recovered pending messages"
            );
        }
        Ok(engine)
    }

    fn is_broadcast(&self) -> bool {
        matches!(self.mode, RoutingMode::Broadcast)
    }

    pub(crate) fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub(crate) fn producer_count(&self) -> usize {
        self.producers.len()
    }

    pub(crate) fn has_consumer(&self, handle: HandleId) -> bool {
        self.consumers.contains_key(&handle)
    }

    pub(crate) fn has_producer(&self, handle: HandleId) -> bool {
        self.producers.contains_key(&handle)
    }

    pub(crate) fn validate_app(&self, app_id: Option<&str>) -> Result<()> {
        let known = match (app_id, &self.mode) {
            (None, RoutingMode::Fanout { .. }) => false,
            (None, _) => true,
            (Some(app_id), RoutingMode::Fanout { app_ids }) => app_ids.iter().any(|a| a == app_id),
            (Some(_), _) => false,
        };
        if known {
            Ok(())
        } else {
            Err(BrokerError::UnknownApp {
                queue: self.key.to_string(),
                app_id: app_id.unwrap_or(DEFAULT_APP_ID).to_string(),
            })
        }
    }

    /// Registers (or re-registers, on reopen) a consumer and runs delivery for
    /// its branch.
    pub(crate) fn add_consumer(
        &mut self,
        handle: HandleId,
        uri: QueueUri,
        params: ConsumerParams,
        sink: PushSink,
    ) {
        let app_id = uri.branch().to_string();
        if let Some(existing) = self.consumers.get_mut(&handle) {
            existing.sink = sink;
            self.ledger.reconfigure(handle, &params);
        } else {
            self.ledger.register(handle, &params);
            self.consumers.insert(
                handle,
                Consumer {
                    uri,
                    app_id: app_id.clone(),
                    sink,
                    unconfirmed: VecDeque::new(),
                },
            );
        }
        self.apply_routing(handle, &app_id, &params);
        self.dispatch(&app_id);
    }

    pub(crate) fn add_producer(&mut self, handle: HandleId) {
        self.producers.insert(handle, ());
    }

    fn apply_routing(&mut self, handle: HandleId, app_id: &str, params: &ConsumerParams) {
        if params.accepts_deliveries() {
            self.routing.register(app_id, handle, params.priority);
        } else {
            self.routing.deregister(app_id, handle);
        }
    }

    /// Swaps priority and caps atomically with respect to delivery.
    pub(crate) fn configure(&mut self, handle: HandleId, params: ConsumerParams) -> Result<()> {
        let Some(consumer) = self.consumers.get(&handle) else {
            if self.producers.contains_key(&handle) {
                return Ok(());
            }
            return Err(BrokerError::HandleNotFound(handle));
        };
        let app_id = consumer.app_id.clone();
        if self.ledger.reconfigure(handle, &params) {
            record_handle_usable(&self.key, handle);
        }
        self.apply_routing(handle, &app_id, &params);
        self.dispatch(&app_id);
        Ok(())
    }

    /// Removes the handle; its unconfirmed messages go back to the front of
    /// the backlog and are offered to the remaining consumers.
    pub(crate) fn remove_handle(&mut self, handle: HandleId) -> bool {
        let was_producer = self.producers.remove(&handle).is_some();
        match self.detach_consumer(handle) {
            Some(app_id) => {
                self.dispatch(&app_id);
                true
            }
            None => was_producer,
        }
    }

    fn detach_consumer(&mut self, handle: HandleId) -> Option<String> {
        let consumer = self.consumers.remove(&handle)?;
        self.routing.deregister(&consumer.app_id, handle);
        self.ledger.remove(handle);
        let requeued = consumer.unconfirmed.len();
        if self.is_broadcast() {
            for guid in consumer.unconfirmed {
                self.release(guid);
            }
        } else if let Some(branch) = self.branches.get_mut(&consumer.app_id) {
            for guid in consumer.unconfirmed.into_iter().rev() {
                if branch.in_flight.remove(&guid).is_some() {
                    branch.backlog.push_front(guid);
                }
            }
        }
        if requeued > 0 {
            metrics::counter!("wharf_redelivery_total").increment(requeued as u64);
            tracing::debug!(queue = %self.key, %handle, requeued, "consumer detached");
        }
        Some(consumer.app_id)
    }

    // Detaches consumers of the branch whose clients went away or closed.
    fn detach_departed(&mut self, app_id: &str) {
        let departed: Vec<HandleId> = self
            .routing
            .all_handles(app_id)
            .into_iter()
            .filter(|handle| {
                self.consumers
                    .get(handle)
                    .is_some_and(|consumer| !consumer.sink.is_open())
            })
            .collect();
        for handle in departed {
            self.detach_consumer(handle);
        }
    }

    pub(crate) async fn post(&mut self, message: Message) -> Result<usize> {
        if self.messages.contains_key(&message.guid)
            || self.store.contains(&self.key, message.guid).await?
        {
            tracing::debug!(queue = %self.key, guid = %message.guid, "duplicate post ignored");
            return Ok(0);
        }
        if self.is_broadcast() {
            return Ok(self.broadcast(message));
        }
        self.store
            .append(&self.key, message.clone(), &self.app_ids)
            .await?;
        let guid = message.guid;
        self.messages.insert(
            guid,
            Retained {
                message,
                remaining: self.app_ids.len(),
            },
        );
        let mut delivered = 0;
        for app_id in self.app_ids.clone() {
            if let Some(branch) = self.branches.get_mut(&app_id) {
                branch.backlog.push_back(guid);
            }
            delivered += self.dispatch(&app_id);
        }
        Ok(delivered)
    }

    // Best effort: every consumer with room right now gets a copy, nothing is
    // kept for anyone else.
    fn broadcast(&mut self, message: Message) -> usize {
        let size = message.size();
        let targets = self.routing.all_handles(DEFAULT_APP_ID);
        let guid = message.guid;
        self.messages.insert(
            guid,
            Retained {
                message,
                remaining: 0,
            },
        );
        let mut delivered = 0;
        let mut departed = Vec::new();
        for handle in targets {
            if !self.ledger.can_accept(handle, size) {
                continue;
            }
            if self.deliver(handle, guid) {
                delivered += 1;
            } else {
                departed.push(handle);
            }
        }
        for handle in departed {
            self.detach_consumer(handle);
        }
        match self.messages.get_mut(&guid) {
            Some(retained) if delivered > 0 => retained.remaining = delivered,
            _ => {
                self.messages.remove(&guid);
            }
        }
        delivered
    }

    fn deliver(&mut self, handle: HandleId, guid: MessageGuid) -> bool {
        let Some(retained) = self.messages.get(&guid) else {
            return false;
        };
        let Some(consumer) = self.consumers.get_mut(&handle) else {
            return false;
        };
        let event = PushEvent {
            uri: consumer.uri.clone(),
            guid,
            payload: retained.message.payload.clone(),
            properties: retained.message.properties.clone(),
        };
        if !consumer.sink.push(event) {
            return false;
        }
        consumer.unconfirmed.push_back(guid);
        self.ledger.on_deliver(handle, retained.message.size());
        metrics::counter!("wharf_push_total").increment(1);
        true
    }

    /// Routes the branch backlog in order until it is empty or the head
    /// message has no eligible target. Returns the number of pushes.
    fn dispatch(&mut self, app_id: &str) -> usize {
        if self.is_broadcast() {
            return 0;
        }
        self.detach_departed(app_id);
        let mut delivered = 0;
        loop {
            let Some(guid) = self
                .branches
                .get(app_id)
                .and_then(|branch| branch.backlog.front().copied())
            else {
                return delivered;
            };
            let Some(size) = self.messages.get(&guid).map(|r| r.message.size()) else {
                if let Some(branch) = self.branches.get_mut(app_id) {
                    branch.backlog.pop_front();
                }
                continue;
            };
            let ledger = &self.ledger;
            let consumers = &self.consumers;
            let target = self.routing.select(app_id, |handle| {
                ledger.can_accept(handle, size)
                    && consumers
                        .get(&handle)
                        .is_some_and(|consumer| consumer.sink.is_open())
            });
            match target {
                Some(handle) => {
                    if let Some(branch) = self.branches.get_mut(app_id) {
                        branch.backlog.pop_front();
                    }
                    if self.deliver(handle, guid) {
                        if let Some(branch) = self.branches.get_mut(app_id) {
                            branch.in_flight.insert(guid, handle);
                        }
                        delivered += 1;
                    } else {
                        if let Some(branch) = self.branches.get_mut(app_id) {
                            branch.backlog.push_front(guid);
                        }
                        self.detach_consumer(handle);
                    }
                }
                None => return delivered,
            }
        }
    }

    pub(crate) async fn confirm(
        &mut self,
        handle: HandleId,
        selector: ConfirmSelector,
    ) -> Result<usize> {
        let Some(consumer) = self.consumers.get_mut(&handle) else {
            return Err(BrokerError::HandleNotFound(handle));
        };
        let app_id = consumer.app_id.clone();
        let guids: Vec<MessageGuid> = match selector {
            ConfirmSelector::Guid(guid) => {
                match consumer.unconfirmed.iter().position(|g| *g == guid) {
                    Some(index) => consumer.unconfirmed.remove(index).into_iter().collect(),
                    None => Vec::new(),
                }
            }
            ConfirmSelector::All => consumer.unconfirmed.drain(..).collect(),
            ConfirmSelector::Oldest(count) => {
                let count = count.min(consumer.unconfirmed.len());
                consumer.unconfirmed.drain(..count).collect()
            }
        };
        let mut usable = false;
        for guid in &guids {
            let size = self
                .messages
                .get(guid)
                .map(|retained| retained.message.size())
                .unwrap_or(0);
            usable |= self.ledger.on_confirm(handle, size);
            if !self.is_broadcast() {
                if let Some(branch) = self.branches.get_mut(&app_id) {
                    branch.in_flight.remove(guid);
                }
                self.store.confirm(&self.key, &app_id, *guid).await?;
            }
            self.release(*guid);
        }
        metrics::counter!("wharf_confirm_total").increment(guids.len() as u64);
        if usable {
            record_handle_usable(&self.key, handle);
        }
        self.dispatch(&app_id);
        Ok(guids.len())
    }

    fn release(&mut self, guid: MessageGuid) {
        if let Some(retained) = self.messages.get_mut(&guid) {
            retained.remaining = retained.remaining.saturating_sub(1);
            if retained.remaining == 0 {
                self.messages.remove(&guid);
            }
        }
    }

    /// Drops pending, undelivered messages of the selected branches.
    /// Delivered-but-unconfirmed messages are left alone.
    pub(crate) async fn purge(&mut self, selector: &AppSelector) -> Result<PurgeOutcome> {
        if let AppSelector::App(app_id) = selector {
            let default_branch =
                !matches!(self.mode, RoutingMode::Fanout { .. }) && app_id == DEFAULT_APP_ID;
            if !default_branch {
                self.validate_app(Some(app_id.as_str()))?;
            }
        }
        if self.is_broadcast() {
            return Ok(PurgeOutcome::default());
        }
        let retain: Vec<(&str, MessageGuid)> = self
            .branches
            .iter()
            .filter(|(app_id, _)| selector.matches(app_id))
            .flat_map(|(app_id, branch)| {
                branch
                    .in_flight
                    .keys()
                    .map(move |guid| (app_id.as_str(), *guid))
            })
            .collect();
        let outcome = self.store.purge(&self.key, selector, &retain).await?;
        let mut purged = Vec::new();
        for (app_id, branch) in self.branches.iter_mut() {
            if selector.matches(app_id) {
                purged.extend(branch.backlog.drain(..));
            }
        }
        for guid in purged {
            self.release(guid);
        }
        if !outcome.is_empty() {
            tracing::info!(
                queue = %self.key,
                app = %selector,
                messages = outcome.messages,
                bytes = outcome.bytes,
                "queue purged"
            );
        }
        Ok(outcome)
    }

    pub(crate) fn stats(&self) -> QueueStats {
        let mut branches: Vec<BranchStats> = self
            .branches
            .iter()
            .map(|(app_id, branch)| BranchStats {
                app_id: app_id.clone(),
                backlog: branch.backlog.len(),
                unconfirmed: branch.in_flight.len(),
                consumers: self
                    .consumers
                    .values()
                    .filter(|consumer| consumer.app_id == *app_id)
                    .count(),
            })
            .collect();
        branches.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        QueueStats {
            queue: self.key.clone(),
            mode: self.mode.name(),
            consumers: self.consumers.len(),
            producers: self.producers.len(),
            branches,
        }
    }

    // Unconfirmed count and bytes for one consumer, as the ledger sees it.
    pub(crate) fn outstanding(&self, handle: HandleId) -> Option<(u64, u64)> {
        self.ledger
            .entry(handle)
            .map(|entry| (entry.outstanding_messages, entry.outstanding_bytes))
    }
}

fn record_handle_usable(queue: &QueueKey, handle: HandleId) {
    metrics::counter!("wharf_handle_usable_total").increment(1);
    tracing::trace!(%queue, %handle, "handle usable");
}
