//! Chain builder.
//!
//! Decomposes a next objective into the group descriptors which implement it on an OFDPA
//! pipeline, along with the dependency edges which dictate their installation order. Groups are
//! built bottom-up, so every descriptor is final once created and outer groups simply refer to
//! the ids of the inner groups they point to.


use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::ObjectiveError;
use crate::ident;
use crate::models::{
    DeviceId, GroupBucket, GroupDescriptor, GroupId, GroupKey, GroupType, Instruction, MacAddress, NextGroup, NextObjective, NextType, PortNumber,
    Treatment, VlanId,
};

/// Errors raised while building a group chain, before anything is submitted to a device.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("next objective {0} carries no egress vlan, neither in its treatment nor in its metadata")]
    MissingVlan(u32),
    #[error("next objective {0} has a bucket without an output port")]
    MissingOutput(u32),
    #[error("next objective {0} pushes an mpls label without setting its value")]
    MissingMplsLabel(u32),
    #[error("next objective {next_id} pushes {count} mpls labels in one bucket, at most 1 is supported")]
    TooManyLabels { next_id: u32, count: usize },
    #[error("next objective {next_id} outputs to port {port} in more than one bucket")]
    DuplicatePort { next_id: u32, port: PortNumber },
    #[error("next objective {0} has no buckets")]
    EmptyBuckets(u32),
    #[error("next objective {next_id} has {count} buckets, exactly 1 is allowed")]
    TooManyBuckets { next_id: u32, count: usize },
    #[error("next objective {next_id} of type {kind} does not support bucket updates")]
    WrongType { next_id: u32, kind: NextType },
    #[error("next objective {next_id} has unsupported type {kind}")]
    UnsupportedType { next_id: u32, kind: NextType },
}

impl From<ChainError> for ObjectiveError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::TooManyLabels { .. } | ChainError::UnsupportedType { .. } => ObjectiveError::Unsupported(err.to_string()),
            _ => ObjectiveError::BadParams(err.to_string()),
        }
    }
}

/// A group which may only be sent to the device once all of the groups it waits on exist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupChainElem {
    /// The group to create, or the buckets to add to an existing group.
    pub descriptor: GroupDescriptor,
    /// The distinct keys of the groups this element waits on.
    pub wait_on: Vec<GroupKey>,
    /// If true, the descriptor's buckets are added to the existing group under its key.
    pub add_bucket: bool,
}

impl GroupChainElem {
    fn new(descriptor: GroupDescriptor, wait_on: Vec<GroupKey>, add_bucket: bool) -> Self {
        Self {
            descriptor,
            wait_on: dedup_keys(wait_on),
            add_bucket,
        }
    }

    /// The number of prerequisite groups of this element.
    pub fn wait_count(&self) -> usize {
        self.wait_on.len()
    }
}

/// The full installation plan of a next objective.
#[derive(Clone, Debug)]
pub struct ChainPlan {
    pub next_id: u32,
    /// Innermost groups which have no prerequisites, deduplicated by key.
    pub initial: Vec<GroupDescriptor>,
    /// Chain elements, inner to outer.
    pub elements: Vec<GroupChainElem>,
    /// The chain representation to persist once the top-level group is confirmed.
    pub next_group: NextGroup,
    /// The key of the top-level group.
    pub top_key: GroupKey,
    /// The id of the top-level group.
    pub top_id: GroupId,
}

impl ChainPlan {
    /// All descriptors of this plan, innermost first.
    pub fn descriptors(&self) -> impl Iterator<Item = &GroupDescriptor> {
        self.initial.iter().chain(self.elements.iter().map(|elem| &elem.descriptor))
    }

    /// All dependency edges of this plan, as `(prerequisite, dependent)` key pairs.
    pub fn edges(&self) -> Vec<(GroupKey, GroupKey)> {
        self.elements
            .iter()
            .flat_map(|elem| elem.wait_on.iter().map(move |key| (key.clone(), elem.descriptor.key.clone())))
            .collect()
    }
}

/// An L3 unicast or MPLS interface group on top of an L2 interface group.
struct L2L3Chain {
    inner: GroupDescriptor,
    outer: GroupDescriptor,
}

/// The groups implementing a single bucket of a hashed objective.
struct BucketChain {
    inner: GroupDescriptor,
    elements: Vec<GroupChainElem>,
    /// The outermost group of this bucket, which the ECMP group points to.
    head: GroupDescriptor,
    /// The keys of this bucket, outermost first.
    keys: Vec<GroupKey>,
}

/// A builder of group chains for a single device.
///
/// Clones share the L3 VPN index counter.
#[derive(Clone, Debug)]
pub struct ChainBuilder {
    device_id: DeviceId,
    vpn_index: Arc<AtomicU32>,
}

impl ChainBuilder {
    /// Create a new instance.
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            vpn_index: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Build the installation plan of the given objective.
    #[tracing::instrument(level = "trace", skip(self, obj), fields(next_id = obj.id, kind = %obj.kind))]
    pub fn build(&self, obj: &NextObjective) -> Result<ChainPlan, ChainError> {
        match obj.kind {
            NextType::Simple => self.build_simple(obj),
            NextType::Broadcast => self.build_broadcast(obj),
            NextType::Hashed => self.build_hashed(obj),
            NextType::Failover => Err(ChainError::UnsupportedType { next_id: obj.id, kind: obj.kind }),
        }
    }

    /// Build the plan of a single new bucket chain to be added to an existing hashed objective.
    ///
    /// The returned plan recreates the objective's ECMP descriptor, holding only the new select
    /// bucket, as an add-bucket element.
    #[tracing::instrument(level = "trace", skip(self, obj), fields(next_id = obj.id))]
    pub fn build_add_bucket(&self, obj: &NextObjective) -> Result<ChainPlan, ChainError> {
        if obj.kind != NextType::Hashed {
            return Err(ChainError::WrongType { next_id: obj.id, kind: obj.kind });
        }
        let treatment = single_treatment(obj)?;
        let chain = self.hashed_bucket_chain(obj, treatment)?;

        let (ecmp_key, ecmp_id) = (ident::l3_ecmp_group_key(obj.id), ident::l3_ecmp_group_id(obj.id));
        let ecmp = self.descriptor(obj, GroupType::Select, vec![group_bucket(chain.head.id)], ecmp_key.clone(), ecmp_id);
        tracing::debug!(next_id = obj.id, group_id = %ecmp_id, key = %ecmp_key, device = %self.device_id, "adding bucket to l3 ecmp group");

        let mut keys = vec![ecmp_key.clone()];
        keys.extend(chain.keys);
        let mut elements = chain.elements;
        elements.push(GroupChainElem::new(ecmp, vec![chain.head.key.clone()], true));
        Ok(ChainPlan {
            next_id: obj.id,
            initial: vec![chain.inner],
            elements,
            next_group: NextGroup::new(obj.id, vec![keys]),
            top_key: ecmp_key,
            top_id: ecmp_id,
        })
    }

    /// Find the output port of the single bucket to remove from a hashed objective.
    pub fn removal_port(&self, obj: &NextObjective) -> Result<PortNumber, ChainError> {
        if obj.kind != NextType::Hashed {
            return Err(ChainError::WrongType { next_id: obj.id, kind: obj.kind });
        }
        let treatment = obj.treatments.first().ok_or(ChainError::EmptyBuckets(obj.id))?;
        treatment.output_port().ok_or(ChainError::MissingOutput(obj.id))
    }

    fn build_simple(&self, obj: &NextObjective) -> Result<ChainPlan, ChainError> {
        let treatment = single_treatment(obj)?;

        // Without a MAC rewrite, a single L2 interface group suffices.
        if !treatment.rewrites_mac() {
            let vlan = treatment.vlan_id().or_else(|| obj.meta_vlan());
            let (group, _) = self.l2_interface_group(obj, treatment, vlan)?;
            return Ok(ChainPlan {
                next_id: obj.id,
                next_group: NextGroup::new(obj.id, vec![vec![group.key.clone()]]),
                top_key: group.key.clone(),
                top_id: group.id,
                initial: vec![group],
                elements: vec![],
            });
        }

        let L2L3Chain { inner, outer } = self.l2l3_chain(obj, treatment, false)?;
        Ok(ChainPlan {
            next_id: obj.id,
            next_group: NextGroup::new(obj.id, vec![vec![outer.key.clone(), inner.key.clone()]]),
            top_key: outer.key.clone(),
            top_id: outer.id,
            elements: vec![GroupChainElem::new(outer, vec![inner.key.clone()], false)],
            initial: vec![inner],
        })
    }

    fn build_broadcast(&self, obj: &NextObjective) -> Result<ChainPlan, ChainError> {
        if obj.treatments.is_empty() {
            return Err(ChainError::EmptyBuckets(obj.id));
        }
        let vlan = obj
            .meta_vlan()
            .or_else(|| obj.treatments.iter().find_map(Treatment::vlan_id))
            .ok_or(ChainError::MissingVlan(obj.id))?;

        let mut ports = HashSet::new();
        let mut groups = Vec::with_capacity(obj.treatments.len());
        for treatment in obj.treatments.iter() {
            let (group, port) = self.l2_interface_group(obj, treatment, Some(vlan))?;
            if !ports.insert(port) {
                return Err(ChainError::DuplicatePort { next_id: obj.id, port });
            }
            groups.push(group);
        }

        let (flood_key, flood_id) = (ident::l2_flood_group_key(obj.id), ident::l2_flood_group_id(vlan, obj.id));
        let buckets = groups.iter().map(|group| group_bucket(group.id)).collect();
        let flood = self.descriptor(obj, GroupType::All, buckets, flood_key.clone(), flood_id);
        tracing::debug!(next_id = obj.id, group_id = %flood_id, key = %flood_key, device = %self.device_id, "building l2 flood group");

        let chains = groups.iter().map(|group| vec![flood_key.clone(), group.key.clone()]).collect();
        let wait_on = groups.iter().map(|group| group.key.clone()).collect();
        Ok(ChainPlan {
            next_id: obj.id,
            initial: dedup_descriptors(groups),
            elements: vec![GroupChainElem::new(flood, wait_on, false)],
            next_group: NextGroup::new(obj.id, chains),
            top_key: flood_key,
            top_id: flood_id,
        })
    }

    fn build_hashed(&self, obj: &NextObjective) -> Result<ChainPlan, ChainError> {
        if obj.treatments.is_empty() {
            return Err(ChainError::EmptyBuckets(obj.id));
        }
        let chains = obj
            .treatments
            .iter()
            .map(|treatment| self.hashed_bucket_chain(obj, treatment))
            .collect::<Result<Vec<_>, _>>()?;

        let (ecmp_key, ecmp_id) = (ident::l3_ecmp_group_key(obj.id), ident::l3_ecmp_group_id(obj.id));
        let buckets = chains.iter().map(|chain| group_bucket(chain.head.id)).collect();
        let ecmp = self.descriptor(obj, GroupType::Select, buckets, ecmp_key.clone(), ecmp_id);
        tracing::debug!(next_id = obj.id, group_id = %ecmp_id, key = %ecmp_key, device = %self.device_id, "building l3 ecmp group");

        let wait_on = chains.iter().map(|chain| chain.head.key.clone()).collect();
        let (mut initial, mut elements, mut key_chains) = (vec![], vec![], vec![]);
        for chain in chains {
            let mut keys = vec![ecmp_key.clone()];
            keys.extend(chain.keys);
            key_chains.push(keys);
            elements.extend(chain.elements);
            initial.push(chain.inner);
        }
        elements.push(GroupChainElem::new(ecmp, wait_on, false));
        Ok(ChainPlan {
            next_id: obj.id,
            initial: dedup_descriptors(initial),
            elements,
            next_group: NextGroup::new(obj.id, key_chains),
            top_key: ecmp_key,
            top_id: ecmp_id,
        })
    }

    /// Build the groups of one hashed bucket, which depend on the number of MPLS labels pushed.
    fn hashed_bucket_chain(&self, obj: &NextObjective, treatment: &Treatment) -> Result<BucketChain, ChainError> {
        let pushes = treatment.iter().filter(|ins| matches!(ins, Instruction::PushMpls)).count();
        let label = treatment.iter().find_map(|ins| match ins {
            Instruction::SetMplsLabel(label) => Some(*label),
            _ => None,
        });

        match pushes {
            0 => {
                let L2L3Chain { inner, outer } = self.l2l3_chain(obj, treatment, false)?;
                Ok(BucketChain {
                    keys: vec![outer.key.clone(), inner.key.clone()],
                    elements: vec![GroupChainElem::new(outer.clone(), vec![inner.key.clone()], false)],
                    head: outer,
                    inner,
                })
            }
            1 => {
                let label = label.ok_or(ChainError::MissingMplsLabel(obj.id))?;
                let L2L3Chain { inner, outer } = self.l2l3_chain(obj, treatment, true)?;

                let index = self.vpn_index.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
                let (vpn_key, vpn_id) = (ident::l3vpn_group_key(obj.id, index), ident::l3vpn_group_id(index));
                let vpn_bucket = GroupBucket::new(Treatment::new(vec![
                    Instruction::PushMpls,
                    Instruction::SetMplsLabel(label),
                    Instruction::SetMplsBos(true),
                    Instruction::CopyTtlOut,
                    Instruction::Group(outer.id),
                ]));
                let vpn = self.descriptor(obj, GroupType::Indirect, vec![vpn_bucket], vpn_key.clone(), vpn_id);
                tracing::debug!(next_id = obj.id, group_id = %vpn_id, key = %vpn_key, device = %self.device_id, "building mpls l3 vpn group");

                Ok(BucketChain {
                    keys: vec![vpn_key, outer.key.clone(), inner.key.clone()],
                    elements: vec![
                        GroupChainElem::new(outer.clone(), vec![inner.key.clone()], false),
                        GroupChainElem::new(vpn.clone(), vec![outer.key], false),
                    ],
                    head: vpn,
                    inner,
                })
            }
            count => Err(ChainError::TooManyLabels { next_id: obj.id, count }),
        }
    }

    /// Build a plain L2 interface group, keeping only VLAN pop and output instructions.
    fn l2_interface_group(&self, obj: &NextObjective, treatment: &Treatment, vlan: Option<VlanId>) -> Result<(GroupDescriptor, PortNumber), ChainError> {
        let (mut instructions, mut port) = (vec![], None);
        for ins in treatment.iter() {
            match ins {
                Instruction::PopVlan => instructions.push(ins.clone()),
                Instruction::Output(out) => {
                    port = Some(*out);
                    instructions.push(ins.clone());
                }
                _ => tracing::debug!(next_id = obj.id, instruction = ?ins, "instruction not permitted in l2 interface group, dropping"),
            }
        }
        let port = port.ok_or(ChainError::MissingOutput(obj.id))?;
        let vlan = vlan.ok_or(ChainError::MissingVlan(obj.id))?;

        let (key, id) = (ident::l2_interface_group_key(&self.device_id, vlan, port), ident::l2_interface_group_id(vlan, port));
        tracing::debug!(next_id = obj.id, group_id = %id, key = %key, device = %self.device_id, "building l2 interface group");
        let group = self.descriptor(obj, GroupType::Indirect, vec![GroupBucket::new(Treatment::new(instructions))], key, id);
        Ok((group, port))
    }

    /// Split a treatment across an outer L3 unicast (or MPLS interface) group and an inner L2
    /// interface group.
    fn l2l3_chain(&self, obj: &NextObjective, treatment: &Treatment, mpls: bool) -> Result<L2L3Chain, ChainError> {
        let (mut outer_ins, mut inner_ins) = (vec![], vec![]);
        let (mut vlan, mut port) = (None, None);
        let (mut set_vlan, mut pop_vlan) = (false, false);
        let (mut src, mut dst) = (MacAddress::ZERO, MacAddress::ZERO);
        for ins in treatment.iter() {
            match ins {
                Instruction::SetEthDst(mac) => {
                    dst = *mac;
                    outer_ins.push(ins.clone());
                }
                Instruction::SetEthSrc(mac) => {
                    src = *mac;
                    outer_ins.push(ins.clone());
                }
                Instruction::SetVlanId(id) => {
                    vlan = Some(*id);
                    set_vlan = true;
                    outer_ins.push(ins.clone());
                }
                Instruction::PopVlan => {
                    pop_vlan = true;
                    inner_ins.push(ins.clone());
                }
                Instruction::Output(out) => {
                    port = Some(*out);
                    inner_ins.push(ins.clone());
                }
                _ if ins.is_l2_modification() => (),
                _ => tracing::warn!(next_id = obj.id, instruction = ?ins, "instruction not handled in group chains, ignoring"),
            }
        }

        if vlan.is_none() {
            if let Some(meta_vlan) = obj.meta_vlan() {
                vlan = Some(meta_vlan);
                outer_ins.push(Instruction::SetVlanId(meta_vlan));
            }
        }
        let vlan = vlan.ok_or(ChainError::MissingVlan(obj.id))?;
        let port = port.ok_or(ChainError::MissingOutput(obj.id))?;
        // Untagged egress.
        if !set_vlan && !pop_vlan {
            inner_ins.insert(0, Instruction::PopVlan);
        }

        let (l2_key, l2_id) = (ident::l2_interface_group_key(&self.device_id, vlan, port), ident::l2_interface_group_id(vlan, port));
        let inner = self.descriptor(obj, GroupType::Indirect, vec![GroupBucket::new(Treatment::new(inner_ins))], l2_key, l2_id);

        outer_ins.push(Instruction::Group(l2_id));
        let (outer_key, outer_id) = if mpls {
            (ident::mpls_interface_group_key(&self.device_id, port), ident::mpls_interface_group_id(port))
        } else {
            (ident::l3_unicast_group_key(&self.device_id, src, dst, port), ident::l3_unicast_group_id(src, dst, port))
        };
        tracing::debug!(
            next_id = obj.id,
            group_id = %outer_id,
            key = %outer_key,
            inner_group_id = %l2_id,
            device = %self.device_id,
            mpls,
            "building l2/l3 group chain"
        );
        let outer = self.descriptor(obj, GroupType::Indirect, vec![GroupBucket::new(Treatment::new(outer_ins))], outer_key, outer_id);
        Ok(L2L3Chain { inner, outer })
    }

    fn descriptor(&self, obj: &NextObjective, kind: GroupType, buckets: Vec<GroupBucket>, key: GroupKey, id: GroupId) -> GroupDescriptor {
        GroupDescriptor {
            device_id: self.device_id.clone(),
            kind,
            buckets,
            key,
            id,
            app_id: obj.app_id.clone(),
        }
    }
}

/// The single treatment of an objective which must carry exactly one bucket.
fn single_treatment(obj: &NextObjective) -> Result<&Treatment, ChainError> {
    match obj.treatments.as_slice() {
        [treatment] => Ok(treatment),
        [] => Err(ChainError::EmptyBuckets(obj.id)),
        treatments => Err(ChainError::TooManyBuckets {
            next_id: obj.id,
            count: treatments.len(),
        }),
    }
}

/// A bucket which forwards to the given group.
fn group_bucket(id: GroupId) -> GroupBucket {
    GroupBucket::new(Treatment::new(vec![Instruction::Group(id)]))
}

fn dedup_keys(keys: Vec<GroupKey>) -> Vec<GroupKey> {
    let mut seen = HashSet::new();
    keys.into_iter().filter(|key| seen.insert(key.clone())).collect()
}

fn dedup_descriptors(groups: Vec<GroupDescriptor>) -> Vec<GroupDescriptor> {
    let mut seen = HashSet::new();
    groups.into_iter().filter(|group| seen.insert(group.key.clone())).collect()
}
