//! Next objective data model.

use std::convert::TryFrom;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ObjectiveError;
use crate::models::GroupId;

/// The identity of a device managed by a group controller.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity of the application which owns an objective and its groups.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationId(pub String);

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A 12-bit VLAN id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VlanId(pub u16);

impl VlanId {
    /// The VLAN id bits, with anything above the 12 bit range masked off.
    pub fn bits(&self) -> u32 {
        u32::from(self.0) & 0x0fff
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A device port number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortNumber(pub u64);

impl fmt::Display for PortNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 20-bit MPLS label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MplsLabel(pub u32);

/// An ethernet MAC address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const ZERO: MacAddress = MacAddress([0; 6]);
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

/// A single match-action instruction of a treatment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instruction {
    Output(PortNumber),
    SetEthSrc(MacAddress),
    SetEthDst(MacAddress),
    SetVlanId(VlanId),
    PopVlan,
    PushVlan,
    SetVlanPcp(u8),
    PushMpls,
    PopMpls,
    SetMplsLabel(MplsLabel),
    SetMplsBos(bool),
    DecMplsTtl,
    CopyTtlOut,
    Group(GroupId),
}

impl Instruction {
    /// Check if this instruction rewrites the L2 header.
    pub fn is_l2_modification(&self) -> bool {
        !matches!(self, Self::Output(_) | Self::CopyTtlOut | Self::Group(_))
    }
}

/// An ordered list of instructions describing forwarding behavior.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Treatment {
    pub instructions: Vec<Instruction>,
}

impl Treatment {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instruction> {
        self.instructions.iter()
    }

    /// The first output port of this treatment, if any.
    pub fn output_port(&self) -> Option<PortNumber> {
        self.iter().find_map(|ins| match ins {
            Instruction::Output(port) => Some(*port),
            _ => None,
        })
    }

    /// The VLAN id explicitly set by this treatment, if any.
    pub fn vlan_id(&self) -> Option<VlanId> {
        self.iter().find_map(|ins| match ins {
            Instruction::SetVlanId(vlan) => Some(*vlan),
            _ => None,
        })
    }

    /// Check if this treatment rewrites the source or destination MAC.
    pub fn rewrites_mac(&self) -> bool {
        self.iter().any(|ins| matches!(ins, Instruction::SetEthSrc(_) | Instruction::SetEthDst(_)))
    }
}

/// A single match criterion of a selector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    VlanVid(VlanId),
    InPort(PortNumber),
    EthType(u16),
}

/// A set of match criteria, used on next objectives as metadata hints.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selector {
    pub criteria: Vec<Criterion>,
}

impl Selector {
    pub fn new(criteria: Vec<Criterion>) -> Self {
        Self { criteria }
    }

    /// The VLAN id criterion of this selector, if any.
    pub fn vlan_id(&self) -> Option<VlanId> {
        self.criteria.iter().find_map(|crit| match crit {
            Criterion::VlanVid(vlan) => Some(*vlan),
            _ => None,
        })
    }
}

/// The type of a next objective.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NextType {
    /// Load balance across all buckets.
    Hashed,
    /// Replicate to all buckets.
    Broadcast,
    /// Use the first live bucket.
    Failover,
    /// A single bucket.
    Simple,
}

impl NextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hashed => "HASHED",
            Self::Broadcast => "BROADCAST",
            Self::Failover => "FAILOVER",
            Self::Simple => "SIMPLE",
        }
    }
}

impl fmt::Display for NextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for NextType {
    type Error = ObjectiveError;

    fn try_from(val: &str) -> Result<Self, Self::Error> {
        match val.to_ascii_uppercase().as_str() {
            "HASHED" => Ok(Self::Hashed),
            "BROADCAST" => Ok(Self::Broadcast),
            "FAILOVER" => Ok(Self::Failover),
            "SIMPLE" => Ok(Self::Simple),
            _ => Err(ObjectiveError::Unknown(val.into())),
        }
    }
}

impl TryFrom<String> for NextType {
    type Error = ObjectiveError;

    fn try_from(val: String) -> Result<Self, Self::Error> {
        Self::try_from(val.as_str())
    }
}

/// Wire codes follow the declaration order of the type.
impl TryFrom<u8> for NextType {
    type Error = ObjectiveError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Hashed),
            1 => Ok(Self::Broadcast),
            2 => Ok(Self::Failover),
            3 => Ok(Self::Simple),
            _ => Err(ObjectiveError::Unknown(format!("type code {}", code))),
        }
    }
}

impl From<NextType> for String {
    fn from(val: NextType) -> Self {
        val.as_str().into()
    }
}

/// An abstract description of forwarding behavior, independent of any group encoding.
///
/// Objectives are immutable once submitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextObjective {
    /// The id of this objective, unique per device.
    pub id: u32,
    /// The type of this objective.
    #[serde(rename = "type")]
    pub kind: NextType,
    /// The treatment buckets of this objective.
    pub treatments: Vec<Treatment>,
    /// The application which owns this objective.
    pub app_id: ApplicationId,
    /// Optional metadata hints, such as the egress VLAN.
    #[serde(default)]
    pub meta: Option<Selector>,
}

impl NextObjective {
    /// The VLAN id hinted by this objective's metadata, if any.
    pub fn meta_vlan(&self) -> Option<VlanId> {
        self.meta.as_ref().and_then(Selector::vlan_id)
    }
}
