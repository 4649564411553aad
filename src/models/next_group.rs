use anyhow::{Context, Result};

use crate::models::proto::{KeyChain, NextGroupRecord};
use crate::models::GroupKey;
use crate::utils;

/// The record of an installed next objective.
///
/// Each chain corresponds to one bucket of the objective and lists the group keys of that
/// bucket, outermost group first. Chains of multi-bucket objectives share their first key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NextGroup {
    pub next_id: u32,
    pub chains: Vec<Vec<GroupKey>>,
}

impl NextGroup {
    pub fn new(next_id: u32, chains: Vec<Vec<GroupKey>>) -> Self {
        Self { next_id, chains }
    }

    /// The key of the group which represents the whole objective.
    pub fn top_level_key(&self) -> Option<&GroupKey> {
        self.chains.first().and_then(|chain| chain.first())
    }

    /// All distinct keys across all chains, in first-seen order.
    pub fn distinct_keys(&self) -> Vec<GroupKey> {
        let mut keys: Vec<GroupKey> = Vec::new();
        for key in self.chains.iter().flatten() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    /// Encode this record for storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let record = NextGroupRecord {
            next_id: self.next_id,
            chains: self
                .chains
                .iter()
                .map(|chain| KeyChain {
                    keys: chain.iter().map(|key| key.as_bytes().to_vec()).collect(),
                })
                .collect(),
        };
        utils::encode_model(&record)
    }

    /// Decode a record from storage.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let record: NextGroupRecord = utils::decode_model(data).context("error decoding next group record")?;
        Ok(Self {
            next_id: record.next_id,
            chains: record
                .chains
                .into_iter()
                .map(|chain| chain.keys.into_iter().map(GroupKey::from_bytes).collect())
                .collect(),
        })
    }
}
