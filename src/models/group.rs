//! Device group data model.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::{ApplicationId, DeviceId, Treatment};

/// The 32-bit hardware identifier of a group on a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// The controller-side identifier of a group, used for correlating requests and events.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(Vec<u8>);

impl GroupKey {
    /// Create a key from the big-endian bytes of the given value.
    pub fn from_u32(val: u32) -> Self {
        Self(val.to_be_bytes().to_vec())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// The type of a device group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GroupType {
    /// A single bucket group.
    Indirect,
    /// Replicate to every bucket.
    All,
    /// Select one bucket per flow.
    Select,
}

/// A single bucket of a group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupBucket {
    pub treatment: Treatment,
}

impl GroupBucket {
    pub fn new(treatment: Treatment) -> Self {
        Self { treatment }
    }
}

/// A request to create a group on a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupDescriptor {
    pub device_id: DeviceId,
    pub kind: GroupType,
    pub buckets: Vec<GroupBucket>,
    pub key: GroupKey,
    pub id: GroupId,
    pub app_id: ApplicationId,
}

/// The kind of a group event reported by a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupEventKind {
    Added,
    Removed,
    Error,
}

/// An asynchronous notification of a group state change on a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupEvent {
    pub kind: GroupEventKind,
    pub key: GroupKey,
}
