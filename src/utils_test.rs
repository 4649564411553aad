use anyhow::Result;

use crate::models::proto::{KeyChain, NextGroupRecord};
use crate::models::{GroupKey, NextGroup};
use crate::utils;

#[test]
fn u32_keys_preserve_numeric_sort_order() -> Result<()> {
    let mut keys: Vec<[u8; 4]> = [7u32, 0, 65_536, 255, 256, u32::MAX].iter().map(|val| utils::encode_u32(*val)).collect();
    keys.sort();
    let decoded = keys.iter().map(|key| utils::decode_u32(key)).collect::<Result<Vec<_>>>()?;
    assert_eq!(decoded, vec![0, 7, 255, 256, 65_536, u32::MAX], "expected byte order to match numeric order, got {:?}", decoded);
    Ok(())
}

#[test]
fn decode_u32_rejects_bad_len() {
    let res = utils::decode_u32(&[0, 1, 2]);
    assert!(res.is_err(), "expected decode of 3 bytes to fail, got {:?}", res);
}

#[test]
fn next_group_record_decodes_from_raw_model() -> Result<()> {
    let record = NextGroupRecord {
        next_id: 42,
        chains: vec![
            KeyChain { keys: vec![vec![0x70, 0, 0, 1], vec![0x20, 0, 0, 2], vec![0, 0x64, 0, 5]] },
            KeyChain { keys: vec![vec![0x70, 0, 0, 1], vec![0x20, 0, 0, 3], vec![0, 0x64, 0, 6]] },
        ],
    };
    let data = utils::encode_model(&record)?;

    let next_group = NextGroup::decode(&data)?;

    assert_eq!(next_group.next_id, 42, "expected next id 42 got {}", next_group.next_id);
    assert_eq!(next_group.chains.len(), 2, "expected 2 chains got {}", next_group.chains.len());
    let top = next_group.top_level_key().cloned();
    assert_eq!(top, Some(GroupKey::from_bytes(vec![0x70, 0, 0, 1])), "unexpected top level key {:?}", top);
    let distinct = next_group.distinct_keys();
    assert_eq!(distinct.len(), 5, "expected the shared head key to be counted once, got {:?}", distinct);
    Ok(())
}
