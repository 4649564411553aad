//! Data models.

mod group;
mod next_group;
mod objective;
pub mod proto;

pub use group::{GroupBucket, GroupDescriptor, GroupEvent, GroupEventKind, GroupId, GroupKey, GroupType};
pub use next_group::NextGroup;
pub use objective::{
    ApplicationId, Criterion, DeviceId, Instruction, MacAddress, MplsLabel, NextObjective, NextType, PortNumber, Selector, Treatment, VlanId,
};
