use std::cmp::Ordering;

use log::{debug, warn};

use crate::compact::compact_objects;
use crate::consts::*;
use crate::object_map::ObjectMap;
use crate::page::{read_page, Page};
use crate::Result;

/// Caller policy for pages that fail validation.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Continue past pages that fail header or object validation instead of
    /// aborting the parse. Skipped pages are logged with their offset. The
    /// default is fail-fast.
    pub skip_invalid_pages: bool,
}

/// Result of parsing a full NVM image: the pages of each region in ring
/// order, and the compacted live objects of each region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedNvm {
    pub application_pages: Vec<Page>,
    pub protocol_pages: Vec<Page>,
    pub application_objects: ObjectMap,
    pub protocol_objects: ObjectMap,
}

/// Parse an NVM3 image, failing fast on the first invalid page or object.
pub fn parse_nvm(buffer: &[u8]) -> Result<ParsedNvm> {
    parse_nvm_with_options(buffer, &ParseOptions::default())
}

/// Parse an NVM3 image with an explicit error-recovery policy.
pub fn parse_nvm_with_options(buffer: &[u8], options: &ParseOptions) -> Result<ParsedNvm> {
    let mut pages = Vec::new();
    let mut offset = 0;
    // Stride used to step over a page whose header cannot be trusted.
    let mut last_page_size = FLASH_MAX_PAGE_SIZE;

    while offset < buffer.len() {
        match read_page(buffer, offset) {
            Ok((page, bytes_read)) => {
                last_page_size = bytes_read;
                pages.push(page);
                offset += bytes_read;
            }
            Err(err) if options.skip_invalid_pages => {
                warn!("skipping invalid page at offset {offset:#x}: {err}");
                offset += last_page_size;
            }
            Err(err) => return Err(err),
        }
    }

    let (mut application_pages, mut protocol_pages): (Vec<Page>, Vec<Page>) = pages
        .into_iter()
        .partition(|page| page.offset < NVM3_APPLICATION_NVM_SIZE);

    // Each region is a wear-leveled ring without a stored head pointer: the
    // page with the lowest erase count is the logically oldest, and equal
    // counts fall back to physical order.
    application_pages.sort_by(ring_order);
    protocol_pages.sort_by(ring_order);

    debug!(
        "parsed {} application pages and {} protocol pages",
        application_pages.len(),
        protocol_pages.len()
    );

    let application_objects = compact_objects(
        application_pages
            .iter()
            .flat_map(|page| page.objects.iter().cloned()),
    )?;
    let protocol_objects = compact_objects(
        protocol_pages
            .iter()
            .flat_map(|page| page.objects.iter().cloned()),
    )?;

    Ok(ParsedNvm {
        application_pages,
        protocol_pages,
        application_objects,
        protocol_objects,
    })
}

fn ring_order(a: &Page, b: &Page) -> Ordering {
    a.header
        .erase_count
        .cmp(&b.header.erase_count)
        .then(a.offset.cmp(&b.offset))
}
