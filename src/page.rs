use crate::checksum::{berger_code, validate_berger};
use crate::consts::*;
use crate::error::Error;
use crate::object::{read_objects, NvmObject};
use crate::Result;

/// Lifecycle state stored in the page header.
#[derive(strum::FromRepr, strum::Display, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
pub enum PageStatus {
    Ok = 0xFFFF_FFFF,
    OkErasePending = 0xFFFF_A5A5,
    Bad = 0x0000_FFFF,
    BadErasePending = 0x0000_A5A5,
}

/// Flash write granularity the page was formatted for.
#[derive(strum::FromRepr, strum::Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum PageWriteSize {
    /// Each half-word is written once.
    #[default]
    Write16 = 0,
    /// Words may be written twice.
    Write32 = 1,
}

/// Decoded 20-byte page header.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageHeader {
    pub version: u16,
    /// 27-bit monotonic counter incremented on every page erase. Defines the
    /// ring order of a region.
    pub erase_count: u32,
    pub status: PageStatus,
    pub encrypted: bool,
    /// Page size as declared in the header. May exceed what the flash
    /// controller lays out; see [`PageHeader::actual_page_size`].
    pub page_size: usize,
    pub write_size: PageWriteSize,
    pub memory_mapped: bool,
    /// 11-bit device family identifier.
    pub device_family: u16,
}

impl PageHeader {
    /// The page size used for layout: the declared size clamped to the flash
    /// maximum.
    pub fn actual_page_size(&self) -> usize {
        self.page_size.min(FLASH_MAX_PAGE_SIZE)
    }
}

/// One parsed page: its position in the image, its header, and the objects
/// decoded from its body in write order.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Page {
    /// Byte offset of the page within the image. Parse-time only; the offset
    /// is not stored on media.
    pub offset: usize,
    pub header: PageHeader,
    pub objects: Vec<NvmObject>,
}

/// Decode and validate the page starting at `offset`, returning it together
/// with the number of bytes it occupies (the clamped page size).
pub fn read_page(buffer: &[u8], offset: usize) -> Result<(Page, usize)> {
    let version = read_u16(buffer, offset)?;
    let magic = read_u16(buffer, offset + 2)?;
    if magic != NVM3_PAGE_MAGIC {
        return Err(Error::BadMagic { offset, magic });
    }
    if version != NVM3_PAGE_VERSION {
        return Err(Error::UnsupportedVersion { offset, version });
    }

    let counter_word = read_u32(buffer, offset + 4)?;
    let erase_count = counter_word & NVM3_PAGE_COUNTER_MASK;
    let counter_code = counter_word >> NVM3_PAGE_COUNTER_SIZE;
    if !validate_berger(erase_count, counter_code, NVM3_PAGE_COUNTER_SIZE) {
        return Err(Error::BergerMismatch { offset });
    }

    let inverse_word = read_u32(buffer, offset + 8)?;
    let erase_count_inv = inverse_word & NVM3_PAGE_COUNTER_MASK;
    let inverse_code = inverse_word >> NVM3_PAGE_COUNTER_SIZE;
    if !validate_berger(erase_count_inv, inverse_code, NVM3_PAGE_COUNTER_SIZE) {
        return Err(Error::BergerMismatch { offset });
    }
    if erase_count != !erase_count_inv & NVM3_PAGE_COUNTER_MASK {
        return Err(Error::EraseCountComplementMismatch { offset });
    }

    let raw_status = read_u32(buffer, offset + 12)?;
    let status = PageStatus::from_repr(raw_status).ok_or(Error::InvalidPageStatus {
        offset,
        status: raw_status,
    })?;

    let device_info = read_u16(buffer, offset + 16)?;
    let device_family = device_info & 0x7FF;
    let write_size = if device_info & (1 << 11) == 0 {
        PageWriteSize::Write16
    } else {
        PageWriteSize::Write32
    };
    let memory_mapped = device_info & (1 << 12) != 0;
    let page_size = NVM3_MIN_PAGE_SIZE << ((device_info >> 13) & 0b111);

    let format_info = read_u16(buffer, offset + 18)?;
    let encrypted = format_info & 0b1 == 0;

    let header = PageHeader {
        version,
        erase_count,
        status,
        encrypted,
        page_size,
        write_size,
        memory_mapped,
        device_family,
    };

    let bytes_read = header.actual_page_size();
    let body = window(buffer, offset + NVM3_PAGE_HEADER_SIZE, bytes_read - NVM3_PAGE_HEADER_SIZE)?;
    let objects =
        read_objects(body).map_err(|e| e.offset_by(offset + NVM3_PAGE_HEADER_SIZE))?;

    Ok((
        Page {
            offset,
            header,
            objects,
        },
        bytes_read,
    ))
}

/// Serialize a page header with freshly computed Berger codes.
pub fn write_page_header(header: &PageHeader) -> Result<[u8; NVM3_PAGE_HEADER_SIZE]> {
    let page_size = header.page_size;
    if !page_size.is_power_of_two()
        || !(NVM3_MIN_PAGE_SIZE..=NVM3_MAX_PAGE_SIZE).contains(&page_size)
    {
        return Err(Error::InvalidOption(format!(
            "page size {page_size} must be a power of two between \
             {NVM3_MIN_PAGE_SIZE} and {NVM3_MAX_PAGE_SIZE}"
        )));
    }
    let size_code =
        (page_size.trailing_zeros() - NVM3_MIN_PAGE_SIZE.trailing_zeros()) as u16;

    let erase_count = header.erase_count & NVM3_PAGE_COUNTER_MASK;
    let counter_word =
        erase_count | berger_code(erase_count, NVM3_PAGE_COUNTER_SIZE) << NVM3_PAGE_COUNTER_SIZE;
    let erase_count_inv = !erase_count & NVM3_PAGE_COUNTER_MASK;
    let inverse_word = erase_count_inv
        | berger_code(erase_count_inv, NVM3_PAGE_COUNTER_SIZE) << NVM3_PAGE_COUNTER_SIZE;

    let mut device_info = header.device_family & 0x7FF;
    device_info |= (header.write_size as u16) << 11;
    if header.memory_mapped {
        device_info |= 1 << 12;
    }
    device_info |= size_code << 13;

    let format_info: u16 = if header.encrypted { 0xFFFE } else { 0xFFFF };

    let mut out = [0u8; NVM3_PAGE_HEADER_SIZE];
    out[0..2].copy_from_slice(&header.version.to_le_bytes());
    out[2..4].copy_from_slice(&NVM3_PAGE_MAGIC.to_le_bytes());
    out[4..8].copy_from_slice(&counter_word.to_le_bytes());
    out[8..12].copy_from_slice(&inverse_word.to_le_bytes());
    out[12..16].copy_from_slice(&(header.status as u32).to_le_bytes());
    out[16..18].copy_from_slice(&device_info.to_le_bytes());
    out[18..20].copy_from_slice(&format_info.to_le_bytes());

    Ok(out)
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

fn read_u16(buffer: &[u8], offset: usize) -> Result<u16> {
    let bytes = window(buffer, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buffer: &[u8], offset: usize) -> Result<u32> {
    let bytes = window(buffer, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
