//! The group-table service capability.

mod memory;

use tokio::sync::broadcast;

use crate::models::{ApplicationId, DeviceId, GroupBucket, GroupDescriptor, GroupEvent, GroupKey};

pub use memory::{GroupOp, MemoryGroupService};

/// A device group table.
///
/// Every mutation is fire-and-forget. Outcomes are reported later on the event stream.
pub trait GroupService: Send + Sync {
    /// Request creation of the described group.
    fn add_group(&self, descriptor: GroupDescriptor);

    /// Request that the given buckets be added to the group under `key`.
    fn add_buckets(&self, device: &DeviceId, key: &GroupKey, buckets: Vec<GroupBucket>, app_id: &ApplicationId);

    /// Request that the given buckets be removed from the group under `key`.
    fn remove_buckets(&self, device: &DeviceId, key: &GroupKey, buckets: Vec<GroupBucket>, app_id: &ApplicationId);

    /// Request removal of the group under `key`.
    fn remove_group(&self, device: &DeviceId, key: &GroupKey, app_id: &ApplicationId);

    /// Look up the group under `key`, if the device has it.
    fn get_group(&self, device: &DeviceId, key: &GroupKey) -> Option<GroupDescriptor>;

    /// Subscribe to the group event stream.
    fn subscribe(&self) -> broadcast::Receiver<GroupEvent>;
}
