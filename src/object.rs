use crate::checksum::crc16_ccitt;
use crate::consts::*;
use crate::error::Error;
use crate::Result;

/// On-media object types. Values 4 to 6 are unassigned and rejected.
#[derive(strum::FromRepr, strum::Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ObjectType {
    DataLarge = 0,
    CounterLarge = 1,
    CounterSmall = 2,
    Deleted = 3,
    DataSmall = 7,
}

impl ObjectType {
    /// Large objects carry an extended header word and may be fragmented.
    pub fn is_large(self) -> bool {
        matches!(self, ObjectType::DataLarge | ObjectType::CounterLarge)
    }

    /// Serialized header size for this type.
    pub fn header_size(self) -> usize {
        if self.is_large() {
            NVM3_OBJ_HEADER_SIZE_LARGE
        } else {
            NVM3_OBJ_HEADER_SIZE_SMALL
        }
    }
}

/// Position of a fragment within a large object's chain.
///
/// Small objects and unfragmented large objects are `None`.
#[derive(strum::FromRepr, strum::Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum FragmentType {
    #[default]
    None = 0,
    First = 1,
    Next = 2,
    Last = 3,
}

/// One logical write in the NVM3 log: a data blob, a counter, a tombstone, or
/// a single fragment of a large object.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NvmObject {
    /// 20-bit object key.
    pub key: u32,
    pub object_type: ObjectType,
    pub fragment_type: FragmentType,
    /// Absent for `Deleted`, exactly 4 bytes for counters.
    pub payload: Option<Vec<u8>>,
}

impl NvmObject {
    pub fn data_small(key: u32, payload: Vec<u8>) -> Self {
        Self {
            key,
            object_type: ObjectType::DataSmall,
            fragment_type: FragmentType::None,
            payload: Some(payload),
        }
    }

    pub fn data_large(key: u32, payload: Vec<u8>) -> Self {
        Self {
            key,
            object_type: ObjectType::DataLarge,
            fragment_type: FragmentType::None,
            payload: Some(payload),
        }
    }

    pub fn counter_small(key: u32, value: u32) -> Self {
        Self {
            key,
            object_type: ObjectType::CounterSmall,
            fragment_type: FragmentType::None,
            payload: Some(value.to_le_bytes().to_vec()),
        }
    }

    pub fn counter_large(key: u32, value: u32) -> Self {
        Self {
            key,
            object_type: ObjectType::CounterLarge,
            fragment_type: FragmentType::None,
            payload: Some(value.to_le_bytes().to_vec()),
        }
    }

    /// A tombstone marking `key` as deleted.
    pub fn deleted(key: u32) -> Self {
        Self {
            key,
            object_type: ObjectType::Deleted,
            fragment_type: FragmentType::None,
            payload: None,
        }
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Vec::len)
    }

    /// Bytes this object occupies on a page, including alignment padding.
    pub fn serialized_size(&self) -> usize {
        self.object_type.header_size() + align_to_word(self.payload_len())
    }

    /// The value of a counter object, if this is one with a 4-byte payload.
    pub fn counter_value(&self) -> Option<u32> {
        if !matches!(
            self.object_type,
            ObjectType::CounterSmall | ObjectType::CounterLarge
        ) {
            return None;
        }
        let payload = self.payload.as_deref()?;
        let bytes: [u8; NVM3_COUNTER_SIZE] = payload.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }
}

/// Round `n` up to the next word boundary.
pub(crate) fn align_to_word(n: usize) -> usize {
    (n + NVM3_WORD_SIZE - 1) & !(NVM3_WORD_SIZE - 1)
}

fn crc_of_large_header(hdr: u32, fragment_len: u16) -> u16 {
    let mut bytes = [0u8; 6];
    bytes[..4].copy_from_slice(&hdr.to_le_bytes());
    bytes[4..].copy_from_slice(&fragment_len.to_le_bytes());
    crc16_ccitt(&bytes)
}

/// Decode one object starting at `offset`.
///
/// Returns the object and the number of bytes it occupies including alignment
/// padding. The caller is responsible for not pointing this at erased space;
/// [`read_objects`] handles that check. Reported offsets are relative to
/// `buffer`.
pub fn read_object(buffer: &[u8], offset: usize) -> Result<(NvmObject, usize)> {
    let hdr = read_u32(buffer, offset)?;

    let raw_type = (hdr & NVM3_OBJ_TYPE_MASK) as u8;
    let object_type = ObjectType::from_repr(raw_type)
        .ok_or(Error::UnknownObjectType { offset, raw_type })?;
    let frag_bits = ((hdr >> NVM3_OBJ_FRAGTYPE_SHIFT) & NVM3_OBJ_FRAGTYPE_MASK) as u8;
    let key = (hdr >> NVM3_OBJ_KEY_SHIFT) & NVM3_OBJ_KEY_MASK;
    let small_len = ((hdr >> NVM3_OBJ_SMALL_LEN_SHIFT) & NVM3_OBJ_SMALL_LEN_MASK) as usize;

    match object_type {
        ObjectType::DataLarge | ObjectType::CounterLarge => {
            let ext = read_u32(buffer, offset + NVM3_WORD_SIZE)?;
            let fragment_len = (ext & NVM3_OBJ_LARGE_LEN_MASK) as usize;
            let stored = (ext >> 16) as u16;
            let computed = crc_of_large_header(hdr, fragment_len as u16);
            if stored != computed {
                return Err(Error::ObjectCrcMismatch {
                    offset,
                    key,
                    stored,
                    computed,
                });
            }

            let fragment_type = FragmentType::from_repr(frag_bits)
                .ok_or(Error::MalformedObjectHeader { offset })?;
            let payload =
                window(buffer, offset + NVM3_OBJ_HEADER_SIZE_LARGE, fragment_len)?.to_vec();

            Ok((
                NvmObject {
                    key,
                    object_type,
                    fragment_type,
                    payload: Some(payload),
                },
                NVM3_OBJ_HEADER_SIZE_LARGE + align_to_word(fragment_len),
            ))
        }
        small => {
            // The fragment bits of small types are never written. This also
            // keeps a fully-erased word from decoding as a DataSmall object.
            if frag_bits != 0 {
                return Err(Error::MalformedObjectHeader { offset });
            }

            let (payload, consumed) = match small {
                ObjectType::Deleted => (None, NVM3_OBJ_HEADER_SIZE_SMALL),
                ObjectType::CounterSmall => {
                    let payload = window(
                        buffer,
                        offset + NVM3_OBJ_HEADER_SIZE_SMALL,
                        NVM3_COUNTER_SIZE,
                    )?
                    .to_vec();
                    (
                        Some(payload),
                        NVM3_OBJ_HEADER_SIZE_SMALL + NVM3_COUNTER_SIZE,
                    )
                }
                _ => {
                    let payload =
                        window(buffer, offset + NVM3_OBJ_HEADER_SIZE_SMALL, small_len)?.to_vec();
                    (
                        Some(payload),
                        NVM3_OBJ_HEADER_SIZE_SMALL + align_to_word(small_len),
                    )
                }
            };

            Ok((
                NvmObject {
                    key,
                    object_type: small,
                    fragment_type: FragmentType::None,
                    payload,
                },
                consumed,
            ))
        }
    }
}

/// Decode the object stream of one page body.
///
/// Stops cleanly when the next word is the erased pattern or the body ends;
/// anything else that fails to decode is an error.
pub fn read_objects(body: &[u8]) -> Result<Vec<NvmObject>> {
    let mut objects = Vec::new();
    let mut offset = 0;

    while offset + NVM3_WORD_SIZE <= body.len() {
        let word = u32::from_le_bytes([
            body[offset],
            body[offset + 1],
            body[offset + 2],
            body[offset + 3],
        ]);
        if word == ERASED_WORD {
            break;
        }

        let (object, consumed) = read_object(body, offset)?;
        objects.push(object);
        offset += consumed;
    }

    Ok(objects)
}

/// Serialize one object: header word, extended word for large types, payload,
/// and 0xFF padding up to the next word boundary.
pub fn write_object(obj: &NvmObject) -> Result<Vec<u8>> {
    let data_len = obj.payload_len();

    let mut hdr = obj.object_type as u32 & NVM3_OBJ_TYPE_MASK;
    hdr |= (obj.key & NVM3_OBJ_KEY_MASK) << NVM3_OBJ_KEY_SHIFT;

    let mut out = Vec::with_capacity(obj.serialized_size());

    match obj.object_type {
        ObjectType::DataLarge | ObjectType::CounterLarge => {
            if matches!(obj.object_type, ObjectType::CounterLarge)
                && obj.fragment_type == FragmentType::None
                && data_len != NVM3_COUNTER_SIZE
            {
                return Err(Error::InvalidCounterSize {
                    key: obj.key,
                    size: data_len,
                });
            }
            if data_len > NVM3_OBJ_LARGE_LEN_MASK as usize {
                return Err(Error::ObjectTooLarge {
                    key: obj.key,
                    size: data_len,
                });
            }

            hdr |= (obj.fragment_type as u32) << NVM3_OBJ_FRAGTYPE_SHIFT;
            let crc = crc_of_large_header(hdr, data_len as u16);
            let ext = data_len as u32 | (crc as u32) << 16;

            out.extend_from_slice(&hdr.to_le_bytes());
            out.extend_from_slice(&ext.to_le_bytes());
        }
        ObjectType::DataSmall => {
            if data_len > NVM3_MAX_OBJ_SIZE_SMALL {
                return Err(Error::ObjectTooLarge {
                    key: obj.key,
                    size: data_len,
                });
            }
            hdr |= (data_len as u32) << NVM3_OBJ_SMALL_LEN_SHIFT;
            out.extend_from_slice(&hdr.to_le_bytes());
        }
        ObjectType::CounterSmall => {
            if data_len != NVM3_COUNTER_SIZE {
                return Err(Error::InvalidCounterSize {
                    key: obj.key,
                    size: data_len,
                });
            }
            out.extend_from_slice(&hdr.to_le_bytes());
        }
        ObjectType::Deleted => {
            out.extend_from_slice(&hdr.to_le_bytes());
        }
    }

    if let Some(payload) = &obj.payload {
        out.extend_from_slice(payload);
    }
    out.resize(obj.serialized_size(), ERASED_BYTE);

    Ok(out)
}

/// Split a large object so that the first fragment fits `first_fit` bytes and
/// every following fragment fits `subsequent_fit` bytes, headers included.
///
/// An object that fits `first_fit` whole is returned as a single unfragmented
/// entry. Both budgets must be at least [`NVM3_OBJ_MIN_FRAGMENT_SIZE`]; when
/// the remaining page space is below that, advance to the next page before
/// calling.
pub fn fragment_large_object(
    obj: &NvmObject,
    first_fit: usize,
    subsequent_fit: usize,
) -> Result<Vec<NvmObject>> {
    debug_assert!(obj.object_type.is_large());

    let data = obj.payload.as_deref().unwrap_or(&[]);
    if data.len() + NVM3_OBJ_HEADER_SIZE_LARGE <= first_fit {
        return Ok(vec![obj.clone()]);
    }

    if first_fit < NVM3_OBJ_MIN_FRAGMENT_SIZE || subsequent_fit < NVM3_OBJ_MIN_FRAGMENT_SIZE {
        return Err(Error::InvalidOption(format!(
            "fragment budgets {first_fit}/{subsequent_fit} are below the minimum fragment size \
             of {NVM3_OBJ_MIN_FRAGMENT_SIZE} bytes"
        )));
    }

    let mut fragments = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let fit = if offset == 0 { first_fit } else { subsequent_fit };
        let budget = fit - NVM3_OBJ_HEADER_SIZE_LARGE;
        let chunk = &data[offset..data.len().min(offset + budget)];

        let fragment_type = if offset == 0 {
            FragmentType::First
        } else if offset + chunk.len() < data.len() {
            FragmentType::Next
        } else {
            FragmentType::Last
        };

        fragments.push(NvmObject {
            key: obj.key,
            object_type: obj.object_type,
            fragment_type,
            payload: Some(chunk.to_vec()),
        });
        offset += chunk.len();
    }

    Ok(fragments)
}

fn window(buffer: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    buffer
        .get(offset..offset + len)
        .ok_or(Error::ShortBuffer {
            offset,
            needed: len,
            available: buffer.len().saturating_sub(offset),
        })
}

fn read_u32(buffer: &[u8], offset: usize) -> Result<u32> {
    let bytes = window(buffer, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_data_roundtrip() {
        let obj = NvmObject::data_small(0x00123, vec![1, 2, 3, 4, 5]);
        let bytes = write_object(&obj).unwrap();
        assert_eq!(bytes.len(), 12); // 4 header + 5 payload padded to 8

        let (parsed, consumed) = read_object(&bytes, 0).unwrap();
        assert_eq!(parsed, obj);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn empty_small_data_is_legal() {
        let obj = NvmObject::data_small(7, vec![]);
        let bytes = write_object(&obj).unwrap();
        assert_eq!(bytes.len(), NVM3_OBJ_HEADER_SIZE_SMALL);

        let (parsed, _) = read_object(&bytes, 0).unwrap();
        assert_eq!(parsed.payload, Some(vec![]));
    }

    #[test]
    fn deleted_is_header_only() {
        let obj = NvmObject::deleted(0xFFFFF);
        let bytes = write_object(&obj).unwrap();
        assert_eq!(bytes.len(), 4);

        let (parsed, consumed) = read_object(&bytes, 0).unwrap();
        assert_eq!(parsed, obj);
        assert_eq!(consumed, 4);
        assert_eq!(parsed.payload, None);
    }

    #[test]
    fn counter_roundtrip() {
        let obj = NvmObject::counter_small(42, 0xDEADBEEF);
        let bytes = write_object(&obj).unwrap();
        assert_eq!(bytes.len(), 8);

        let (parsed, _) = read_object(&bytes, 0).unwrap();
        assert_eq!(parsed.counter_value(), Some(0xDEADBEEF));
    }

    #[test]
    fn counter_payload_must_be_four_bytes() {
        let mut obj = NvmObject::counter_small(42, 0);
        obj.payload = Some(vec![1, 2, 3]);
        assert!(matches!(
            write_object(&obj),
            Err(Error::InvalidCounterSize { key: 42, size: 3 })
        ));
    }

    #[test]
    fn large_data_roundtrip() {
        let payload: Vec<u8> = (0..300).map(|i| (i % 256) as u8).collect();
        let obj = NvmObject::data_large(0x54321, payload);
        let bytes = write_object(&obj).unwrap();
        assert_eq!(bytes.len(), 308);

        let (parsed, consumed) = read_object(&bytes, 0).unwrap();
        assert_eq!(parsed, obj);
        assert_eq!(consumed, 308);
    }

    #[test]
    fn large_header_crc_is_checked() {
        let obj = NvmObject::data_large(9, vec![0xAB; 16]);
        let mut bytes = write_object(&obj).unwrap();
        bytes[6] ^= 0x01; // low byte of the stored CRC

        match read_object(&bytes, 0) {
            Err(Error::ObjectCrcMismatch { offset: 0, key: 9, .. }) => {}
            other => panic!("expected ObjectCrcMismatch, got {:?}", other.map(|r| r.0)),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let hdr: u32 = 4 | (1 << NVM3_OBJ_KEY_SHIFT);
        let bytes = hdr.to_le_bytes();
        assert!(matches!(
            read_object(&bytes, 0),
            Err(Error::UnknownObjectType {
                offset: 0,
                raw_type: 4
            })
        ));
    }

    #[test]
    fn erased_word_does_not_decode() {
        // 0xFFFFFFFF would otherwise look like a DataSmall header; the set
        // fragment bits make it malformed.
        let bytes = [0xFF; 8];
        assert!(matches!(
            read_object(&bytes, 0),
            Err(Error::MalformedObjectHeader { offset: 0 })
        ));
    }

    #[test]
    fn declared_length_must_fit_window() {
        let obj = NvmObject::data_small(1, vec![0; 50]);
        let bytes = write_object(&obj).unwrap();
        assert!(matches!(
            read_object(&bytes[..8], 0),
            Err(Error::ShortBuffer { .. })
        ));
    }

    #[test]
    fn read_objects_stops_on_erased_space() {
        let mut body = write_object(&NvmObject::data_small(1, vec![0xAA])).unwrap();
        body.extend_from_slice(&[0xFF; 12]);

        let objects = read_objects(&body).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].key, 1);
    }

    #[test]
    fn read_objects_walks_consecutive_objects() {
        let mut body = Vec::new();
        body.extend(write_object(&NvmObject::data_small(1, vec![1])).unwrap());
        body.extend(write_object(&NvmObject::counter_small(2, 7)).unwrap());
        body.extend(write_object(&NvmObject::deleted(3)).unwrap());

        let objects = read_objects(&body).unwrap();
        assert_eq!(
            objects.iter().map(|o| o.key).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn fragmentation_splits_and_labels() {
        let payload: Vec<u8> = (0..100).map(|i| i as u8).collect();
        let obj = NvmObject::data_large(5, payload.clone());

        let fragments = fragment_large_object(&obj, 50, 50).unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].fragment_type, FragmentType::First);
        assert_eq!(fragments[1].fragment_type, FragmentType::Next);
        assert_eq!(fragments[2].fragment_type, FragmentType::Last);
        assert_eq!(fragments[0].payload_len(), 42);
        assert_eq!(fragments[1].payload_len(), 42);
        assert_eq!(fragments[2].payload_len(), 16);

        let reassembled: Vec<u8> = fragments
            .iter()
            .flat_map(|f| f.payload.clone().unwrap())
            .collect();
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn fitting_object_is_not_fragmented() {
        let obj = NvmObject::data_large(5, vec![0; 40]);
        let fragments = fragment_large_object(&obj, 48, 48).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].fragment_type, FragmentType::None);
    }

    #[test]
    fn fragment_budget_below_minimum_is_rejected() {
        let obj = NvmObject::data_large(5, vec![0; 100]);
        assert!(fragment_large_object(&obj, 8, 50).is_err());
    }
}
