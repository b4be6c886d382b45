// Per-consumer admission control on unconfirmed messages and bytes.
// Every method is called under the owning queue's lock, so a routing
// decision and the matching `on_deliver` are one atomic step.
use ahash::RandomState;
use hashbrown::HashMap;
use wharf_common::ConsumerParams;
use wharf_common::ids::HandleId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlEntry {
    pub outstanding_messages: u64,
    pub outstanding_bytes: u64,
    pub max_messages: u64,
    pub max_bytes: u64,
}

impl FlowControlEntry {
    fn new(params: &ConsumerParams) -> Self {
        Self {
            outstanding_messages: 0,
            outstanding_bytes: 0,
            max_messages: params.max_unconfirmed_messages,
            max_bytes: params.max_unconfirmed_bytes,
        }
    }

    pub fn can_deliver(&self) -> bool {
        self.outstanding_messages < self.max_messages && self.outstanding_bytes < self.max_bytes
    }

    // An idle handle always takes one message, so a payload larger than the
    // byte cap cannot stall the branch forever.
    pub fn can_accept(&self, size: u64) -> bool {
        self.can_deliver()
            && (self.outstanding_messages == 0
                || self.outstanding_bytes.saturating_add(size) <= self.max_bytes)
    }
}

/// Outstanding-delivery counters for every consumer of one queue.
///
/// ```
/// use wharf_broker::flow_control::FlowControlLedger;
/// use wharf_common::ConsumerParams;
/// use wharf_common::ids::HandleId;
///
/// let mut ledger = FlowControlLedger::new();
/// let handle = HandleId::new();
/// ledger.register(handle, &ConsumerParams::default().with_caps(2, 3));
/// ledger.on_deliver(handle, 3);
/// assert!(!ledger.can_deliver(handle));
/// assert!(ledger.on_confirm(handle, 3));
/// assert!(ledger.can_deliver(handle));
/// ```
#[derive(Debug, Default)]
pub struct FlowControlLedger {
    entries: HashMap<HandleId, FlowControlEntry, RandomState>,
}

impl FlowControlLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handle: HandleId, params: &ConsumerParams) {
        self.entries.insert(handle, FlowControlEntry::new(params));
    }

    pub fn remove(&mut self, handle: HandleId) -> Option<FlowControlEntry> {
        self.entries.remove(&handle)
    }

    pub fn entry(&self, handle: HandleId) -> Option<&FlowControlEntry> {
        self.entries.get(&handle)
    }

    pub fn can_deliver(&self, handle: HandleId) -> bool {
        self.entries
            .get(&handle)
            .is_some_and(FlowControlEntry::can_deliver)
    }

    pub fn can_accept(&self, handle: HandleId, size: u64) -> bool {
        self.entries
            .get(&handle)
            .is_some_and(|entry| entry.can_accept(size))
    }

    pub fn on_deliver(&mut self, handle: HandleId, size: u64) {
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.outstanding_messages += 1;
            entry.outstanding_bytes += size;
        }
    }

    /// Returns true when the confirm moved the handle from throttled to usable.
    pub fn on_confirm(&mut self, handle: HandleId, size: u64) -> bool {
        let Some(entry) = self.entries.get_mut(&handle) else {
            return false;
        };
        let was_usable = entry.can_deliver();
        entry.outstanding_messages = entry.outstanding_messages.saturating_sub(1);
        entry.outstanding_bytes = entry.outstanding_bytes.saturating_sub(size);
        !was_usable && entry.can_deliver()
    }

    /// Swaps both caps at once. Outstanding counts are kept as they are; a
    /// tighter cap only blocks future deliveries. Returns true when the new
    /// caps made a throttled handle usable.
    pub fn reconfigure(&mut self, handle: HandleId, params: &ConsumerParams) -> bool {
        let Some(entry) = self.entries.get_mut(&handle) else {
            return false;
        };
        let was_usable = entry.can_deliver();
        entry.max_messages = params.max_unconfirmed_messages;
        entry.max_bytes = params.max_unconfirmed_bytes;
        !was_usable && entry.can_deliver()
    }
}
