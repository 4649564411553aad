//! Pending dependency tracker.
//!
//! Holds two registries keyed by group key. The chain-element registry maps a group to the chain
//! elements waiting on its creation, and the objective registry maps a top-level group to the
//! objectives waiting on its confirmation. Registrants accumulate and are never overwritten.
//! Objective registrations expire if their group is never confirmed.

mod expiry;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::chain::GroupChainElem;
use crate::error::ObjectiveResult;
use crate::models::{GroupId, GroupKey, NextGroup, NextObjective};

pub use expiry::ExpiryQueue;

/// An objective awaiting confirmation of its top-level group.
#[derive(Debug)]
pub struct PendingNextGroup {
    pub objective: Arc<NextObjective>,
    /// The chain representation to persist once confirmed.
    pub next_group: NextGroup,
    /// The id the top-level group was built with.
    pub top_id: GroupId,
    /// The originator's outcome channel.
    pub reply: Option<oneshot::Sender<ObjectiveResult>>,
}

/// The outcome of resolving a confirmed group key.
#[derive(Debug)]
pub enum Resolution {
    /// The key had waiting chain elements; these are the ones which are now ready.
    Advance(Vec<GroupChainElem>),
    /// The key completed the given objectives.
    Complete(Vec<PendingNextGroup>),
    /// Nothing was waiting on the key.
    Noop,
}

#[derive(Debug)]
struct PendingElem {
    elem: GroupChainElem,
    remaining: usize,
    /// The top-level key of the plan which registered this element.
    owner: GroupKey,
}

#[derive(Debug)]
struct PendingObjectives {
    generation: u64,
    registrants: Vec<PendingNextGroup>,
}

/// The pending dependency tracker of a group controller.
#[derive(Debug)]
pub struct PendingTracker {
    /// Registered chain elements, by element id.
    elems: HashMap<u64, PendingElem>,
    /// Group key to the ids of the elements waiting on it.
    groups: HashMap<GroupKey, BTreeSet<u64>>,
    /// Top-level group key to the objectives waiting on it.
    objectives: HashMap<GroupKey, PendingObjectives>,
    expiry: ExpiryQueue<GroupKey>,
    expiry_delay: Duration,
    next_elem_id: u64,
    next_generation: u64,
}

impl PendingTracker {
    /// Create a new instance where objective registrations expire after the given delay.
    pub fn new(expiry_delay: Duration) -> Self {
        Self {
            elems: HashMap::new(),
            groups: HashMap::new(),
            objectives: HashMap::new(),
            expiry: ExpiryQueue::default(),
            expiry_delay,
            next_elem_id: 0,
            next_generation: 0,
        }
    }

    /// Register a chain element against each of its prerequisites, on behalf of the plan whose
    /// top-level group is `owner`.
    ///
    /// An element without prerequisites is handed straight back, as it is ready now.
    pub fn register_elem(&mut self, elem: GroupChainElem, owner: &GroupKey) -> Option<GroupChainElem> {
        if elem.wait_on.is_empty() {
            return Some(elem);
        }
        let id = self.next_elem_id;
        self.next_elem_id += 1;
        for key in elem.wait_on.iter() {
            self.groups.entry(key.clone()).or_default().insert(id);
        }
        let remaining = elem.wait_on.len();
        self.elems.insert(
            id,
            PendingElem {
                elem,
                remaining,
                owner: owner.clone(),
            },
        );
        None
    }

    /// Register an objective against its top-level group key.
    ///
    /// Every registration pushes the expiry of its key out to a full delay from `now`.
    pub fn register_objective(&mut self, key: GroupKey, pending: PendingNextGroup, now: Instant) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.expiry.schedule(now + self.expiry_delay, generation, key.clone());
        let entry = self.objectives.entry(key).or_insert_with(|| PendingObjectives {
            generation,
            registrants: vec![],
        });
        entry.generation = generation;
        entry.registrants.push(pending);
    }

    /// Resolve a confirmed group key.
    ///
    /// The chain-element registry takes precedence. The objective registry is only consulted when
    /// no chain element was registered for the key. Resolving an absent key is a no-op.
    pub fn resolve(&mut self, key: &GroupKey) -> Resolution {
        if let Some(ids) = self.groups.remove(key) {
            let mut ready = vec![];
            for id in ids {
                let done = match self.elems.get_mut(&id) {
                    Some(pending) => {
                        pending.remaining = pending.remaining.saturating_sub(1);
                        pending.remaining == 0
                    }
                    None => false,
                };
                if done {
                    if let Some(pending) = self.elems.remove(&id) {
                        ready.push(pending.elem);
                    }
                }
            }
            return Resolution::Advance(ready);
        }
        match self.objectives.remove(key) {
            Some(entry) => Resolution::Complete(entry.registrants),
            None => Resolution::Noop,
        }
    }

    /// Remove and return every objective registration which expired at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<(GroupKey, Vec<PendingNextGroup>)> {
        let mut expired = vec![];
        for (generation, key) in self.expiry.pop_expired(now) {
            // A resolved key may since have been registered again under a new generation.
            let live = matches!(self.objectives.get(&key), Some(entry) if entry.generation == generation);
            if !live {
                continue;
            }
            if let Some(entry) = self.objectives.remove(&key) {
                self.purge_elems(&key);
                expired.push((key, entry.registrants));
            }
        }
        expired
    }

    /// Remove every registrant of the given objective, along with the chain elements of its key
    /// once no registrant is left there.
    pub fn take_objective(&mut self, next_id: u32) -> Vec<PendingNextGroup> {
        let keys: Vec<GroupKey> = self
            .objectives
            .iter()
            .filter(|(_, entry)| entry.registrants.iter().any(|pending| pending.objective.id == next_id))
            .map(|(key, _)| key.clone())
            .collect();
        let mut taken = vec![];
        for key in keys {
            let emptied = match self.objectives.get_mut(&key) {
                Some(entry) => {
                    let (matching, rest): (Vec<_>, Vec<_>) = entry.registrants.drain(..).partition(|pending| pending.objective.id == next_id);
                    entry.registrants = rest;
                    taken.extend(matching);
                    entry.registrants.is_empty()
                }
                None => false,
            };
            if emptied {
                self.objectives.remove(&key);
                self.purge_elems(&key);
            }
        }
        taken
    }

    /// Drop every chain element registered on behalf of the given top-level key.
    fn purge_elems(&mut self, owner: &GroupKey) {
        let ids: Vec<u64> = self.elems.iter().filter(|(_, pending)| &pending.owner == owner).map(|(id, _)| *id).collect();
        for id in ids {
            let pending = match self.elems.remove(&id) {
                Some(pending) => pending,
                None => continue,
            };
            for key in pending.elem.wait_on.iter() {
                let emptied = match self.groups.get_mut(key) {
                    Some(waiting) => {
                        waiting.remove(&id);
                        waiting.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    self.groups.remove(key);
                }
            }
        }
    }

    /// The earliest expiry deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.expiry.next_deadline()
    }

    /// Every key still pending in either registry.
    pub fn pending_keys(&self) -> BTreeSet<GroupKey> {
        self.groups.keys().chain(self.objectives.keys()).cloned().collect()
    }

    /// Check if an objective with the given id awaits confirmation.
    pub fn has_pending_objective(&self, next_id: u32) -> bool {
        self.objectives
            .values()
            .flat_map(|entry| entry.registrants.iter())
            .any(|pending| pending.objective.id == next_id)
    }

    /// Check if anything in either registry still waits on the given key.
    pub fn is_pending(&self, key: &GroupKey) -> bool {
        self.groups.contains_key(key) || self.objectives.contains_key(key)
    }

    /// The number of group keys with waiting chain elements.
    pub fn pending_group_count(&self) -> usize {
        self.groups.len()
    }

    /// The number of objectives awaiting confirmation.
    pub fn pending_objective_count(&self) -> usize {
        self.objectives.values().map(|entry| entry.registrants.len()).sum()
    }

    /// The remaining wait count of the pending element which creates the given group.
    pub fn wait_count(&self, key: &GroupKey) -> Option<usize> {
        self.elems.values().find(|pending| &pending.elem.descriptor.key == key).map(|pending| pending.remaining)
    }
}
