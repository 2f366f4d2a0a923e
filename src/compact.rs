use std::collections::HashMap;

use log::warn;

use crate::error::Error;
use crate::object::{FragmentType, NvmObject, ObjectType};
use crate::object_map::ObjectMap;
use crate::Result;

/// Replay an ordered object log into the live key→object map.
///
/// Later writes of a key supersede earlier ones, `Deleted` records remove the
/// key, and fragment chains are buffered until their last fragment arrives
/// and then reassembled in log order. Orphaned fragments (a next/last with no
/// open chain) are logged and ignored so a damaged image stays readable; a
/// chain that never completes is an error.
pub fn compact_objects<I>(objects: I) -> Result<ObjectMap>
where
    I: IntoIterator<Item = NvmObject>,
{
    let mut live = ObjectMap::new();
    let mut chains: HashMap<u32, NvmObject> = HashMap::new();

    for obj in objects {
        let key = obj.key;

        if obj.object_type == ObjectType::Deleted {
            live.remove(key);
            chains.remove(&key);
            continue;
        }

        match obj.fragment_type {
            FragmentType::None => {
                live.insert(obj);
                chains.remove(&key);
            }
            FragmentType::First => {
                if chains.insert(key, obj).is_some() {
                    warn!("discarding incomplete fragment chain for key {key:#07x} superseded by a new first fragment");
                }
            }
            FragmentType::Next | FragmentType::Last => {
                let is_last = obj.fragment_type == FragmentType::Last;
                match chains.get_mut(&key) {
                    None => {
                        warn!("ignoring {}", Error::OrphanedFragment { key });
                    }
                    Some(chain) => {
                        chain
                            .payload
                            .get_or_insert_with(Vec::new)
                            .extend(obj.payload.unwrap_or_default());
                        if is_last {
                            if let Some(mut assembled) = chains.remove(&key) {
                                assembled.fragment_type = FragmentType::None;
                                live.insert(assembled);
                            }
                        }
                    }
                }
            }
        }
    }

    if !chains.is_empty() {
        // Deterministic pick when several chains are left dangling.
        let key = chains.keys().min().copied().unwrap_or_default();
        return Err(Error::TruncatedObject { key });
    }

    Ok(live)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(key: u32, fragment_type: FragmentType, payload: &[u8]) -> NvmObject {
        NvmObject {
            key,
            object_type: ObjectType::DataLarge,
            fragment_type,
            payload: Some(payload.to_vec()),
        }
    }

    #[test]
    fn later_write_supersedes() {
        let live = compact_objects([
            NvmObject::data_small(1, vec![0x01]),
            NvmObject::data_small(1, vec![0x02]),
        ])
        .unwrap();

        assert_eq!(live.len(), 1);
        assert_eq!(live.get(1).unwrap().payload, Some(vec![0x02]));
    }

    #[test]
    fn delete_removes_the_key() {
        let live = compact_objects([
            NvmObject::data_small(1, vec![0x01]),
            NvmObject::data_small(1, vec![0x02]),
            NvmObject::deleted(1),
        ])
        .unwrap();

        assert!(live.is_empty());
    }

    #[test]
    fn write_after_delete_revives_the_key() {
        let live = compact_objects([
            NvmObject::data_small(1, vec![0x01]),
            NvmObject::deleted(1),
            NvmObject::data_small(1, vec![0x03]),
        ])
        .unwrap();

        assert_eq!(live.get(1).unwrap().payload, Some(vec![0x03]));
    }

    #[test]
    fn overwrites_preserve_first_insertion_order() {
        let live = compact_objects([
            NvmObject::data_small(10, vec![]),
            NvmObject::data_small(20, vec![]),
            NvmObject::data_small(10, vec![0xFF]),
        ])
        .unwrap();

        assert_eq!(live.keys().collect::<Vec<_>>(), vec![10, 20]);
    }

    #[test]
    fn fragments_reassemble_in_order() {
        let live = compact_objects([
            fragment(5, FragmentType::First, &[0xAA]),
            fragment(5, FragmentType::Next, &[0xBB]),
            fragment(5, FragmentType::Last, &[0xCC]),
        ])
        .unwrap();

        let obj = live.get(5).unwrap();
        assert_eq!(obj.fragment_type, FragmentType::None);
        assert_eq!(obj.payload, Some(vec![0xAA, 0xBB, 0xCC]));
    }

    #[test]
    fn new_first_fragment_discards_open_chain() {
        let live = compact_objects([
            fragment(5, FragmentType::First, &[0x01]),
            fragment(5, FragmentType::First, &[0x02]),
            fragment(5, FragmentType::Last, &[0x03]),
        ])
        .unwrap();

        assert_eq!(live.get(5).unwrap().payload, Some(vec![0x02, 0x03]));
    }

    #[test]
    fn orphaned_fragment_is_ignored() {
        let live = compact_objects([fragment(5, FragmentType::Next, &[0x01])]).unwrap();
        assert!(live.is_empty());
    }

    #[test]
    fn unterminated_chain_is_an_error() {
        let result = compact_objects([fragment(5, FragmentType::First, &[0x01])]);
        assert!(matches!(result, Err(Error::TruncatedObject { key: 5 })));
    }

    #[test]
    fn complete_write_supersedes_open_chain() {
        let live = compact_objects([
            fragment(5, FragmentType::First, &[0x01]),
            NvmObject::data_large(5, vec![0x09]),
        ])
        .unwrap();

        assert_eq!(live.get(5).unwrap().payload, Some(vec![0x09]));
    }

    #[test]
    fn delete_drops_open_chain() {
        let live = compact_objects([
            fragment(5, FragmentType::First, &[0x01]),
            NvmObject::deleted(5),
        ])
        .unwrap();

        assert!(live.is_empty());
    }
}
