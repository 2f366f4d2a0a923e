//! Codec for the NVM3 flash key-value images used by Silicon Labs Z-Wave
//! controllers.
//!
//! An image is a flat byte buffer holding two independent regions
//! (application and protocol), each organized as a wear-leveled ring of
//! pages. Pages carry a Berger-protected erase counter that defines the ring
//! order, and a stream of self-describing objects: data blobs, monotonic
//! counters, tombstones, and fragments of large objects spanning pages.
//!
//! [`parse_nvm`] turns a buffer into pages in ring order plus the compacted
//! live objects of each region; [`encode_nvm`] builds a fresh image from two
//! live object maps. Both work purely in memory; reading and writing image
//! files is left to the caller.
//!
//! ```
//! use zwave_nvm3::{encode_nvm, parse_nvm, EncodeOptions, NvmObject, ObjectMap};
//!
//! let mut app = ObjectMap::new();
//! app.insert(NvmObject::data_small(0x123, vec![0xDE, 0xAD]));
//!
//! let image = encode_nvm(&app, &ObjectMap::new(), &EncodeOptions::default()).unwrap();
//! let parsed = parse_nvm(&image).unwrap();
//! assert_eq!(parsed.application_objects.get(0x123).unwrap().payload,
//!            Some(vec![0xDE, 0xAD]));
//! ```

pub mod checksum;
pub mod compact;
pub mod consts;
pub mod error;
pub mod generator;
pub mod object;
pub mod object_map;
pub mod page;
pub mod parser;

pub use compact::compact_objects;
pub use consts::Region;
pub use error::Error;
pub use generator::{encode_nvm, EncodeOptions};
pub use object::{
    fragment_large_object, read_object, read_objects, write_object, FragmentType, NvmObject,
    ObjectType,
};
pub use object_map::ObjectMap;
pub use page::{read_page, write_page_header, Page, PageHeader, PageStatus, PageWriteSize};
pub use parser::{parse_nvm, parse_nvm_with_options, ParseOptions, ParsedNvm};

pub type Result<T> = std::result::Result<T, Error>;
