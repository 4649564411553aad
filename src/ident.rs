//! Group identity & key derivation.
//!
//! Group ids are the hardware-facing identifiers of groups. The top 4 bits of an id select the
//! group type, and the remaining bits carry a type specific discriminant. Group keys are opaque
//! controller-side identifiers, derived independently of the id and never interpreted by the
//! device.

use std::hash::Hasher;

use seahash::SeaHasher;

use crate::models::{DeviceId, GroupId, GroupKey, MacAddress, PortNumber, VlanId};

/// The type tag of L2 interface groups.
pub const L2_INTERFACE_TYPE: u32 = 0x0000_0000;
/// The type tag of L3 unicast groups.
pub const L3_UNICAST_TYPE: u32 = 0x2000_0000;
/// The type tag of MPLS interface groups.
pub const MPLS_INTERFACE_TYPE: u32 = 0x9000_0000;
/// The type & subtype tag of MPLS L3 VPN groups.
pub const MPLS_L3VPN_SUBTYPE: u32 = 0x9200_0000;
/// The type tag of L3 ECMP groups.
pub const L3_ECMP_TYPE: u32 = 0x7000_0000;
/// The type tag of L2 flood groups.
pub const L2_FLOOD_TYPE: u32 = 0x4000_0000;

/// Masks off the 4-bit type tag.
pub const TYPE_MASK: u32 = 0x0fff_ffff;
/// Masks off the 4-bit type tag and the 4-bit MPLS subtype.
pub const SUBTYPE_MASK: u32 = 0x00ff_ffff;
/// The port bits which are kept verbatim in L2 interface group keys.
pub const PORT_LOWER_BITS_MASK: u64 = 0x3f;

const VLAN_MASK: u32 = 0x0fff;
const PORT_MASK: u32 = 0xffff;
const TYPE_SHIFT: u32 = 28;
const SUBTYPE_SHIFT: u32 = 24;

/// The id of the L2 interface group egressing `port` on `vlan`.
pub fn l2_interface_group_id(vlan: VlanId, port: PortNumber) -> GroupId {
    GroupId(L2_INTERFACE_TYPE | vlan.bits() << 16 | (port.0 as u32 & PORT_MASK))
}

/// The key of the L2 interface group egressing `port` on `vlan` of the given device.
///
/// The low port bits are kept verbatim, the high port bits are folded into a hash together with
/// the device and VLAN.
pub fn l2_interface_group_key(device: &DeviceId, vlan: VlanId, port: PortNumber) -> GroupKey {
    let port_low = (port.0 & PORT_LOWER_BITS_MASK) as u32;
    let port_high = port.0 & !PORT_LOWER_BITS_MASK;
    let hash = stable_hash(&[device.as_str().as_bytes(), &vlan.0.to_be_bytes(), &port_high.to_be_bytes()]);
    GroupKey::from_u32(L2_INTERFACE_TYPE | (TYPE_MASK & hash << 6) | port_low)
}

/// The id of the L3 unicast group rewriting to the given MAC pair and egressing `port`.
pub fn l3_unicast_group_id(src: MacAddress, dst: MacAddress, port: PortNumber) -> GroupId {
    let hash = stable_hash(&[&src.0, &dst.0, &port.0.to_be_bytes()]);
    GroupId(L3_UNICAST_TYPE | (TYPE_MASK & hash))
}

pub fn l3_unicast_group_key(device: &DeviceId, src: MacAddress, dst: MacAddress, port: PortNumber) -> GroupKey {
    let hash = stable_hash(&[device.as_str().as_bytes(), &src.0, &dst.0, &port.0.to_be_bytes()]);
    GroupKey::from_u32(L3_UNICAST_TYPE | (TYPE_MASK & hash))
}

/// The id of the MPLS interface group egressing `port`.
pub fn mpls_interface_group_id(port: PortNumber) -> GroupId {
    GroupId(MPLS_INTERFACE_TYPE | (port.0 as u32 & SUBTYPE_MASK))
}

pub fn mpls_interface_group_key(device: &DeviceId, port: PortNumber) -> GroupKey {
    let hash = stable_hash(&[device.as_str().as_bytes()]);
    GroupKey::from_u32(MPLS_INTERFACE_TYPE | (SUBTYPE_MASK & (hash << 8 | port.0 as u32)))
}

/// The id of the MPLS L3 VPN group allocated with the given index.
pub fn l3vpn_group_id(index: u32) -> GroupId {
    GroupId(MPLS_L3VPN_SUBTYPE | (index & SUBTYPE_MASK))
}

pub fn l3vpn_group_key(next_id: u32, index: u32) -> GroupKey {
    GroupKey::from_u32(MPLS_L3VPN_SUBTYPE | (SUBTYPE_MASK & (next_id << 12 | index)))
}

/// The id of the L3 ECMP group of the given next objective.
pub fn l3_ecmp_group_id(next_id: u32) -> GroupId {
    GroupId(L3_ECMP_TYPE | (TYPE_MASK & next_id << 12))
}

pub fn l3_ecmp_group_key(next_id: u32) -> GroupKey {
    GroupKey::from_u32(l3_ecmp_group_id(next_id).0)
}

/// The id of the L2 flood group of the given next objective on `vlan`.
pub fn l2_flood_group_id(vlan: VlanId, next_id: u32) -> GroupId {
    GroupId(L2_FLOOD_TYPE | vlan.bits() << 16 | (next_id & PORT_MASK))
}

pub fn l2_flood_group_key(next_id: u32) -> GroupKey {
    GroupKey::from_u32(L2_FLOOD_TYPE | (TYPE_MASK & next_id << 12))
}

/// The decoded layout of a group id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupIdLayout {
    L2Interface { vlan: u16, port: u32 },
    L3Unicast { index: u32 },
    MplsInterface { index: u32 },
    MplsL3Vpn { index: u32 },
    L3Ecmp { index: u32 },
    L2Flood { vlan: u16, index: u32 },
}

/// Decode the given group id into its tagged layout, if the type tag is known.
pub fn decode(id: GroupId) -> Option<GroupIdLayout> {
    let raw = id.0;
    let vlan = ((raw >> 16) & VLAN_MASK) as u16;
    match raw >> TYPE_SHIFT {
        0x0 => Some(GroupIdLayout::L2Interface { vlan, port: raw & PORT_MASK }),
        0x2 => Some(GroupIdLayout::L3Unicast { index: raw & TYPE_MASK }),
        0x4 => Some(GroupIdLayout::L2Flood { vlan, index: raw & PORT_MASK }),
        0x7 => Some(GroupIdLayout::L3Ecmp { index: (raw & TYPE_MASK) >> 12 }),
        0x9 => match (raw >> SUBTYPE_SHIFT) & 0xf {
            0x0 => Some(GroupIdLayout::MplsInterface { index: raw & SUBTYPE_MASK }),
            0x2 => Some(GroupIdLayout::MplsL3Vpn { index: raw & SUBTYPE_MASK }),
            _ => None,
        },
        _ => None,
    }
}

/// A hash which is stable across processes, folded to 32 bits.
///
/// Every part is length-prefixed so that adjacent parts can not alias.
fn stable_hash(parts: &[&[u8]]) -> u32 {
    let mut hasher = SeaHasher::new();
    for part in parts {
        hasher.write_u64(part.len() as u64);
        hasher.write(part);
    }
    let hash = hasher.finish();
    (hash ^ (hash >> 32)) as u32
}
