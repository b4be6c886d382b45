// Routing membership for one queue: app id -> priority tiers -> handle keys.
// The table never owns consumer state; callers pass an eligibility check that
// consults the flow-control ledger under the same lock.
use ahash::RandomState;
use hashbrown::HashMap;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use wharf_common::ids::HandleId;

pub type Targets = SmallVec<[HandleId; 8]>;

#[derive(Debug, Default)]
struct Tier {
    handles: Vec<HandleId>,
    // Next index to try; advanced past the handle chosen on each attempt.
    cursor: usize,
}

impl Tier {
    fn remove(&mut self, handle: HandleId) -> bool {
        let Some(index) = self.handles.iter().position(|h| *h == handle) else {
            return false;
        };
        self.handles.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.handles.len() {
            self.cursor = 0;
        }
        true
    }

    fn select(&mut self, eligible: &mut impl FnMut(HandleId) -> bool) -> Option<HandleId> {
        let len = self.handles.len();
        for step in 0..len {
            let index = (self.cursor + step) % len;
            let handle = self.handles[index];
            if eligible(handle) {
                self.cursor = (index + 1) % len;
                return Some(handle);
            }
        }
        None
    }
}

#[derive(Debug, Default)]
pub struct RoutingEntry {
    // Keyed by priority; the last tier is the highest.
    tiers: BTreeMap<i32, Tier>,
}

impl RoutingEntry {
    fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    fn remove(&mut self, handle: HandleId) -> Option<i32> {
        let priority = self
            .tiers
            .iter()
            .find(|(_, tier)| tier.handles.contains(&handle))
            .map(|(priority, _)| *priority)?;
        if let Some(tier) = self.tiers.get_mut(&priority) {
            tier.remove(handle);
            if tier.handles.is_empty() {
                self.tiers.remove(&priority);
            }
        }
        Some(priority)
    }
}

/// Priority-tiered routing per app id.
///
/// ```
/// use wharf_broker::routing::RoutingTable;
/// use wharf_common::ids::HandleId;
///
/// let mut table = RoutingTable::new();
/// let (high, low) = (HandleId::new(), HandleId::new());
/// table.register("__default", high, 2);
/// table.register("__default", low, 1);
/// assert_eq!(table.select("__default", |_| true), Some(high));
/// // The top tier is saturated: lower tiers are not used as a fallback.
/// assert_eq!(table.select("__default", |h| h != high), None);
/// ```
#[derive(Debug, Default)]
pub struct RoutingTable {
    branches: HashMap<String, RoutingEntry, RandomState>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, app_id: &str, handle: HandleId, priority: i32) {
        let entry = self.branches.entry(app_id.to_string()).or_default();
        entry.remove(handle);
        entry.tiers.entry(priority).or_default().handles.push(handle);
    }

    pub fn deregister(&mut self, app_id: &str, handle: HandleId) -> bool {
        let Some(entry) = self.branches.get_mut(app_id) else {
            return false;
        };
        let removed = entry.remove(handle).is_some();
        if entry.is_empty() {
            self.branches.remove(app_id);
        }
        removed
    }

    pub fn contains(&self, app_id: &str, handle: HandleId) -> bool {
        self.priority_of(app_id, handle).is_some()
    }

    pub fn priority_of(&self, app_id: &str, handle: HandleId) -> Option<i32> {
        self.branches.get(app_id).and_then(|entry| {
            entry
                .tiers
                .iter()
                .find(|(_, tier)| tier.handles.contains(&handle))
                .map(|(priority, _)| *priority)
        })
    }

    /// Picks the next handle of the highest tier that passes `eligible`,
    /// rotating within the tier.
    pub fn select(
        &mut self,
        app_id: &str,
        mut eligible: impl FnMut(HandleId) -> bool,
    ) -> Option<HandleId> {
        let entry = self.branches.get_mut(app_id)?;
        let (_, top) = entry.tiers.iter_mut().next_back()?;
        top.select(&mut eligible)
    }

    // Every registered handle of the branch, highest tier first.
    pub fn all_handles(&self, app_id: &str) -> Targets {
        let mut targets = Targets::new();
        if let Some(entry) = self.branches.get(app_id) {
            for tier in entry.tiers.values().rev() {
                targets.extend(tier.handles.iter().copied());
            }
        }
        targets
    }

    pub fn top_priority(&self, app_id: &str) -> Option<i32> {
        self.branches
            .get(app_id)
            .and_then(|entry| entry.tiers.keys().next_back().copied())
    }

    pub fn handle_count(&self, app_id: &str) -> usize {
        self.branches
            .get(app_id)
            .map(|entry| entry.tiers.values().map(|tier| tier.handles.len()).sum())
            .unwrap_or(0)
    }
}
