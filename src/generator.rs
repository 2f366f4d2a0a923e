use log::debug;

use crate::consts::*;
use crate::error::Error;
use crate::object::{fragment_large_object, write_object, ObjectType};
use crate::object_map::ObjectMap;
use crate::page::{write_page_header, PageHeader, PageStatus, PageWriteSize};
use crate::Result;

/// Knobs for [`encode_nvm`]. The defaults match what Z-Wave 700-series
/// controllers format their NVM with.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EncodeOptions {
    /// Page size in bytes. Must be a power of two that divides both region
    /// sizes; values above the flash maximum are clamped to 2048.
    pub page_size: usize,
    /// 11-bit device family identifier written to every page header.
    pub device_family: u16,
    pub write_size: PageWriteSize,
    pub memory_mapped: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            page_size: FLASH_MAX_PAGE_SIZE,
            device_family: 2047,
            write_size: PageWriteSize::Write16,
            memory_mapped: true,
        }
    }
}

/// Encode live object maps into a fresh 0xF000-byte NVM3 image:
/// application region pages first, protocol region pages after.
///
/// All pages start with erase count 0 and status OK. Objects are placed in
/// map iteration order; `Deleted` entries are skipped, small objects that do
/// not fit the remaining page space move to the next page whole, and large
/// objects are fragmented with one fragment per page.
pub fn encode_nvm(
    application_objects: &ObjectMap,
    protocol_objects: &ObjectMap,
    options: &EncodeOptions,
) -> Result<Vec<u8>> {
    let page_size = options.page_size.min(FLASH_MAX_PAGE_SIZE);
    if !page_size.is_power_of_two() || page_size < NVM3_MIN_PAGE_SIZE {
        return Err(Error::InvalidOption(format!(
            "page size {} must be a power of two of at least {NVM3_MIN_PAGE_SIZE} bytes",
            options.page_size
        )));
    }
    if !NVM3_APPLICATION_NVM_SIZE.is_multiple_of(page_size)
        || !NVM3_PROTOCOL_NVM_SIZE.is_multiple_of(page_size)
    {
        return Err(Error::InvalidOption(format!(
            "page size {page_size} does not divide the region sizes"
        )));
    }
    if options.device_family > 0x7FF {
        return Err(Error::InvalidOption(format!(
            "device family {} does not fit 11 bits",
            options.device_family
        )));
    }

    let header = PageHeader {
        version: NVM3_PAGE_VERSION,
        erase_count: 0,
        status: PageStatus::Ok,
        encrypted: false,
        page_size,
        write_size: options.write_size,
        memory_mapped: options.memory_mapped,
        device_family: options.device_family,
    };
    let header_bytes = write_page_header(&header)?;

    let blank_region = |size: usize| -> Vec<Vec<u8>> {
        (0..size / page_size)
            .map(|_| {
                let mut page = vec![ERASED_BYTE; page_size];
                page[..NVM3_PAGE_HEADER_SIZE].copy_from_slice(&header_bytes);
                page
            })
            .collect()
    };
    let mut application_pages = blank_region(NVM3_APPLICATION_NVM_SIZE);
    let mut protocol_pages = blank_region(NVM3_PROTOCOL_NVM_SIZE);

    write_region(
        &mut application_pages,
        application_objects,
        page_size,
        Region::Application,
    )?;
    write_region(
        &mut protocol_pages,
        protocol_objects,
        page_size,
        Region::Protocol,
    )?;

    let mut out = Vec::with_capacity(NVM3_APPLICATION_NVM_SIZE + NVM3_PROTOCOL_NVM_SIZE);
    for page in application_pages.iter().chain(protocol_pages.iter()) {
        out.extend_from_slice(page);
    }
    Ok(out)
}

/// Write cursor over one region's pages.
struct RegionWriter<'a> {
    pages: &'a mut [Vec<u8>],
    page_size: usize,
    region: Region,
    page_index: usize,
    offset_in_page: usize,
}

impl<'a> RegionWriter<'a> {
    fn new(pages: &'a mut [Vec<u8>], page_size: usize, region: Region) -> Self {
        Self {
            pages,
            page_size,
            region,
            page_index: 0,
            offset_in_page: NVM3_PAGE_HEADER_SIZE,
        }
    }

    fn remaining(&self) -> usize {
        self.page_size - self.offset_in_page
    }

    fn advance_page(&mut self, key: u32) -> Result<()> {
        self.page_index += 1;
        if self.page_index >= self.pages.len() {
            return Err(Error::InsufficientSpace {
                region: self.region,
                key,
            });
        }
        self.offset_in_page = NVM3_PAGE_HEADER_SIZE;
        Ok(())
    }

    /// Copy one serialized fragment at the cursor. `bytes` is already padded
    /// to word alignment, so the offset stays aligned.
    fn write_fragment(&mut self, bytes: &[u8]) {
        let page = &mut self.pages[self.page_index];
        page[self.offset_in_page..self.offset_in_page + bytes.len()].copy_from_slice(bytes);
        self.offset_in_page += bytes.len();
    }
}

fn write_region(
    pages: &mut [Vec<u8>],
    objects: &ObjectMap,
    page_size: usize,
    region: Region,
) -> Result<()> {
    let mut writer = RegionWriter::new(pages, page_size, region);
    let mut written = 0usize;

    for obj in objects.iter() {
        match obj.object_type {
            // Tombstones carry no information in a fresh image.
            ObjectType::Deleted => continue,
            // Small objects never fragment: whenever one does not fit, the
            // rest of the page is left erased and it moves to the next page.
            ObjectType::CounterSmall => {
                if writer.remaining() < NVM3_OBJ_HEADER_SIZE_SMALL + NVM3_COUNTER_SIZE {
                    writer.advance_page(obj.key)?;
                }
            }
            ObjectType::DataSmall => {
                if writer.remaining() < NVM3_OBJ_HEADER_SIZE_SMALL + obj.payload_len() {
                    writer.advance_page(obj.key)?;
                }
            }
            ObjectType::DataLarge | ObjectType::CounterLarge => {
                if writer.remaining() < NVM3_OBJ_MIN_FRAGMENT_SIZE {
                    writer.advance_page(obj.key)?;
                }
            }
        }

        let fragments = if obj.object_type.is_large() {
            fragment_large_object(
                obj,
                writer.remaining(),
                page_size - NVM3_PAGE_HEADER_SIZE,
            )?
        } else {
            vec![obj.clone()]
        };

        let one_per_page = fragments.len() > 1;
        for fragment in &fragments {
            let bytes = write_object(fragment)?;
            writer.write_fragment(&bytes);
            if one_per_page {
                writer.advance_page(fragment.key)?;
            }
        }
        written += 1;
    }

    debug!(
        "placed {written} objects on {} of {} {region} pages",
        writer.page_index + 1,
        writer.pages.len()
    );
    Ok(())
}
