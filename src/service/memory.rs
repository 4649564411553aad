use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::models::{ApplicationId, DeviceId, GroupBucket, GroupDescriptor, GroupEvent, GroupEventKind, GroupKey};
use crate::service::GroupService;

/// The capacity of the group event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// A request received by the in-memory switch, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupOp {
    AddGroup(GroupDescriptor),
    AddBuckets { key: GroupKey, buckets: Vec<GroupBucket> },
    RemoveBuckets { key: GroupKey, buckets: Vec<GroupBucket> },
    RemoveGroup(GroupKey),
}

#[derive(Default)]
struct State {
    /// Groups which exist on the device.
    installed: HashMap<(DeviceId, GroupKey), GroupDescriptor>,
    /// Groups which were requested but not yet confirmed.
    requested: HashMap<(DeviceId, GroupKey), GroupDescriptor>,
    ops: Vec<GroupOp>,
}

/// A simulated group table.
///
/// In auto mode every group is confirmed as soon as it is requested. In manual mode requested
/// groups are held until they are confirmed, rejected or silently installed.
pub struct MemoryGroupService {
    state: Mutex<State>,
    events: broadcast::Sender<GroupEvent>,
    auto_confirm: bool,
}

impl MemoryGroupService {
    fn new(auto_confirm: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            events,
            auto_confirm,
        }
    }

    /// A switch which confirms every group immediately.
    pub fn auto() -> Self {
        Self::new(true)
    }

    /// A switch which holds requested groups until told otherwise.
    pub fn manual() -> Self {
        Self::new(false)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a requested group and emit its added event.
    pub fn confirm(&self, key: &GroupKey) -> bool {
        let installed = self.install(key);
        if installed {
            self.emit(GroupEvent {
                kind: GroupEventKind::Added,
                key: key.clone(),
            });
        }
        installed
    }

    /// Install a requested group without emitting any event, as if the event was lost.
    pub fn install_silently(&self, key: &GroupKey) -> bool {
        self.install(key)
    }

    /// Drop a requested group and emit an error event for it.
    pub fn reject(&self, key: &GroupKey) -> bool {
        let rejected = {
            let mut state = self.state();
            let before = state.requested.len();
            state.requested.retain(|(_, requested), _| requested != key);
            state.requested.len() != before
        };
        if rejected {
            self.emit(GroupEvent {
                kind: GroupEventKind::Error,
                key: key.clone(),
            });
        }
        rejected
    }

    /// Emit the given event as is.
    pub fn emit(&self, event: GroupEvent) {
        let _ = self.events.send(event);
    }

    /// Every request received so far.
    pub fn ops(&self) -> Vec<GroupOp> {
        self.state().ops.clone()
    }

    /// Every installed group.
    pub fn installed(&self) -> Vec<GroupDescriptor> {
        self.state().installed.values().cloned().collect()
    }

    /// The keys of every group awaiting confirmation.
    pub fn requested_keys(&self) -> Vec<GroupKey> {
        self.state().requested.keys().map(|(_, key)| key.clone()).collect()
    }

    fn install(&self, key: &GroupKey) -> bool {
        let mut state = self.state();
        let found = state.requested.keys().find(|(_, requested)| requested == key).cloned();
        match found.and_then(|id| state.requested.remove(&id).map(|group| (id, group))) {
            Some((id, group)) => {
                state.installed.insert(id, group);
                true
            }
            None => false,
        }
    }
}

impl GroupService for MemoryGroupService {
    fn add_group(&self, descriptor: GroupDescriptor) {
        let id = (descriptor.device_id.clone(), descriptor.key.clone());
        {
            let mut state = self.state();
            state.ops.push(GroupOp::AddGroup(descriptor.clone()));
            if self.auto_confirm {
                state.installed.insert(id.clone(), descriptor);
            } else {
                state.requested.insert(id.clone(), descriptor);
            }
        }
        tracing::trace!(device = %id.0, key = %id.1, "group requested");
        if self.auto_confirm {
            self.emit(GroupEvent {
                kind: GroupEventKind::Added,
                key: id.1,
            });
        }
    }

    fn add_buckets(&self, device: &DeviceId, key: &GroupKey, buckets: Vec<GroupBucket>, _app_id: &ApplicationId) {
        let mut state = self.state();
        state.ops.push(GroupOp::AddBuckets {
            key: key.clone(),
            buckets: buckets.clone(),
        });
        if let Some(group) = state.installed.get_mut(&(device.clone(), key.clone())) {
            group.buckets.extend(buckets);
        }
    }

    fn remove_buckets(&self, device: &DeviceId, key: &GroupKey, buckets: Vec<GroupBucket>, _app_id: &ApplicationId) {
        let mut state = self.state();
        state.ops.push(GroupOp::RemoveBuckets {
            key: key.clone(),
            buckets: buckets.clone(),
        });
        if let Some(group) = state.installed.get_mut(&(device.clone(), key.clone())) {
            group.buckets.retain(|bucket| !buckets.contains(bucket));
        }
    }

    fn remove_group(&self, device: &DeviceId, key: &GroupKey, _app_id: &ApplicationId) {
        let existed = {
            let mut state = self.state();
            state.ops.push(GroupOp::RemoveGroup(key.clone()));
            let id = (device.clone(), key.clone());
            let requested = state.requested.remove(&id).is_some();
            state.installed.remove(&id).is_some() || requested
        };
        if existed {
            self.emit(GroupEvent {
                kind: GroupEventKind::Removed,
                key: key.clone(),
            });
        }
    }

    fn get_group(&self, device: &DeviceId, key: &GroupKey) -> Option<GroupDescriptor> {
        self.state().installed.get(&(device.clone(), key.clone())).cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.events.subscribe()
    }
}
