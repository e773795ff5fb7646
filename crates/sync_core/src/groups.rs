use std::collections::{BTreeMap, BTreeSet};

use shared::protocol::GroupId;

#[derive(Debug, Default, Clone, Copy)]
struct PendingJoin {
    in_flight: u32,
    cancelled: bool,
}

/// Groups a transport channel has successfully joined and must rejoin after
/// a reconnect, plus joins still waiting for the hub.
#[derive(Debug, Default, Clone)]
pub struct GroupTracker {
    joined: BTreeSet<GroupId>,
    pending: BTreeMap<GroupId, PendingJoin>,
}

impl GroupTracker {
    pub fn contains(&self, group: &GroupId) -> bool {
        self.joined.contains(group)
    }

    /// Marks a join as sent. Returns `false` when the group is already
    /// joined and nothing needs sending.
    pub fn begin_join(&mut self, group: &GroupId) -> bool {
        if self.joined.contains(group) {
            return false;
        }
        let pending = self.pending.entry(group.clone()).or_default();
        pending.in_flight += 1;
        pending.cancelled = false;
        true
    }

    /// Settles a join started with [`begin_join`](Self::begin_join). Returns
    /// whether the group is now tracked; a successful join that a leave
    /// overtook returns `false` and must be undone on the hub.
    pub fn finish_join(&mut self, group: &GroupId, succeeded: bool) -> bool {
        let cancelled = match self.pending.get_mut(group) {
            Some(pending) => {
                pending.in_flight = pending.in_flight.saturating_sub(1);
                let cancelled = pending.cancelled;
                if pending.in_flight == 0 {
                    self.pending.remove(group);
                }
                cancelled
            }
            None => true,
        };
        if !succeeded || cancelled {
            return false;
        }
        self.joined.insert(group.clone());
        true
    }

    /// Returns `false` when the group was not joined. A join still in flight
    /// is cancelled either way.
    pub fn record_leave(&mut self, group: &GroupId) -> bool {
        if let Some(pending) = self.pending.get_mut(group) {
            pending.cancelled = true;
        }
        self.joined.remove(group)
    }

    pub fn snapshot(&self) -> Vec<GroupId> {
        self.joined.iter().cloned().collect()
    }

    pub fn drain(&mut self) -> Vec<GroupId> {
        for pending in self.pending.values_mut() {
            pending.cancelled = true;
        }
        std::mem::take(&mut self.joined).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.joined.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty()
    }
}
