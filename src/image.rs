//! RPRC firmware image parser and section loader.
//!
//! The binary format, preserved bit-exactly for interoperability with
//! existing remote firmware images:
//!
//! ```text
//! struct {
//!     char magic[4] = { 'R', 'P', 'R', 'C' };
//!     u32 version;
//!     u32 header_len;
//!     char header[...] = { header_len bytes of unformatted, textual header };
//!     struct section {
//!         u32 type;
//!         u64 da;
//!         u32 len;
//!         u8 content[...] = { len bytes of binary data };
//!     } [ no limit on number of sections ];
//! } __packed;
//! ```
//!
//! All integers are little-endian and packed (no padding).  A section of
//! type [`SectionType::Resource`] contains a table of 68-byte resource
//! descriptors; the loader extracts the boot address and up to two trace
//! buffers from it.
//!
//! [`Image::parse()`] is a zero-copy view over the blob; [`load()`] performs
//! the side effects: translating each section's device address and copying
//! its content through a [`MemoryIo`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::io::MemoryIo;
use crate::mem::{MemEntry, da_to_pa};
use crate::{Error, Result};

/// Magic bytes opening every firmware image
pub const IMAGE_MAGIC: [u8; 4] = *b"RPRC";

/// Fixed image header length: magic, version, header_len
pub const FW_HEADER_LEN: usize = 12;

/// Fixed section header length: type, da, len
pub const SECTION_HDR_LEN: usize = 16;

/// Length of one resource descriptor
pub const RSC_ENTRY_LEN: usize = 68;

/// Length of a resource descriptor's name field
pub const RSC_NAME_LEN: usize = 48;

/// Trace buffers collected per load; extra descriptors are skipped
pub const MAX_TRACE_BUFS: usize = 2;

/// Firmware section types
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum SectionType {
    /// Decodes into resource descriptors
    Resource = 0,
    Text = 1,
    Data = 2,
}

/// Resource descriptor types found inside a [`SectionType::Resource`] section
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum RscType {
    Memory = 0,
    Device = 1,
    Irq = 2,
    Service = 3,
    /// Trace buffer exposed for read-only inspection after the load
    Trace = 4,
    /// Address of the first instruction to execute
    BootAddr = 5,
    End = 6,
}

/// Parsed view of a firmware image.  Borrows the blob; nothing is copied
/// until [`load()`].
#[derive(Debug, Clone, Copy)]
pub struct Image<'a> {
    /// Image format version
    pub version: u32,
    /// Unformatted, textual header
    pub header: &'a [u8],
    sections: &'a [u8],
}

impl<'a> Image<'a> {
    /// Parse the fixed header of a firmware blob.
    ///
    /// Section payloads are validated lazily while iterating
    /// [`Image::sections()`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptImage`] if the blob is smaller than the fixed
    /// header or the magic is wrong, and [`Error::TruncatedImage`] if the
    /// declared textual header runs past the end of the blob.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < FW_HEADER_LEN {
            error!("image is too small ({} bytes)", data.len());
            return Err(Error::CorruptImage);
        }

        if data[..4] != IMAGE_MAGIC {
            error!("image is corrupted (bad magic)");
            return Err(Error::CorruptImage);
        }

        let version = read_u32(data, 4);
        let header_len = read_u32(data, 8) as usize;

        if header_len > data.len() - FW_HEADER_LEN {
            error!("image header is truncated");
            return Err(Error::TruncatedImage);
        }

        Ok(Self {
            version,
            header: &data[FW_HEADER_LEN..FW_HEADER_LEN + header_len],
            sections: &data[FW_HEADER_LEN + header_len..],
        })
    }

    /// Iterate the image's sections in file order.
    pub fn sections(&self) -> Sections<'a> {
        Sections {
            rest: self.sections,
            failed: false,
        }
    }
}

/// One firmware section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section<'a> {
    /// Raw section type; see [`SectionType`]
    pub stype: u32,
    /// Device address the content is loaded at
    pub da: u64,
    /// Section content
    pub content: &'a [u8],
}

/// Iterator over the sections of an [`Image`].
///
/// Yields `Err(TruncatedImage)` once and then ends if a section header or
/// its declared content runs past the end of the blob.
pub struct Sections<'a> {
    rest: &'a [u8],
    failed: bool,
}

impl<'a> Iterator for Sections<'a> {
    type Item = Result<Section<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }

        if self.rest.len() < SECTION_HDR_LEN {
            self.failed = true;
            error!("image is truncated (partial section header)");
            return Some(Err(Error::TruncatedImage));
        }

        let stype = read_u32(self.rest, 0);
        let da = read_u64(self.rest, 4);
        let len = read_u32(self.rest, 12) as usize;

        if self.rest.len() - SECTION_HDR_LEN < len {
            self.failed = true;
            error!("image is truncated (section content short by {} bytes)",
                len - (self.rest.len() - SECTION_HDR_LEN));
            return Some(Err(Error::TruncatedImage));
        }

        let content = &self.rest[SECTION_HDR_LEN..SECTION_HDR_LEN + len];
        self.rest = &self.rest[SECTION_HDR_LEN + len..];

        Some(Ok(Section { stype, da, content }))
    }
}

/// One decoded resource descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RscEntry {
    /// Raw descriptor type; see [`RscType`]
    pub rtype: u32,
    /// Device address of the resource
    pub da: u64,
    /// Length of the resource in bytes
    pub len: u32,
    /// Must be zero; nonzero values are logged and ignored
    pub reserved: u32,
    /// Descriptor name, up to the first NUL of the 48-byte field
    pub name: String,
}

/// Decode the descriptors of a resource-table section.
///
/// A trailing partial descriptor is ignored, matching what existing image
/// generators produce.
pub fn parse_resources(content: &[u8]) -> Vec<RscEntry> {
    let mut entries = Vec::with_capacity(content.len() / RSC_ENTRY_LEN);
    let mut rest = content;

    while rest.len() >= RSC_ENTRY_LEN {
        let name = &rest[20..20 + RSC_NAME_LEN];
        let nul = name.iter().position(|&b| b == 0).unwrap_or(RSC_NAME_LEN);

        entries.push(RscEntry {
            rtype: read_u32(rest, 0),
            da: read_u64(rest, 4),
            len: read_u32(rest, 12),
            reserved: read_u32(rest, 16),
            name: String::from_utf8_lossy(&name[..nul]).into_owned(),
        });

        rest = &rest[RSC_ENTRY_LEN..];
    }

    entries
}

/// A trace buffer surfaced by a resource table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceBuf {
    /// Physical address of the buffer
    pub pa: u64,
    /// Declared length of the buffer in bytes
    pub len: u32,
}

/// What a successful load hands back to the lifecycle manager.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Boot address from the resource table, as a device address; 0 if the
    /// image carries no boot-address descriptor
    pub bootaddr: u64,
    /// Trace buffers declared by the resource table, at most
    /// [`MAX_TRACE_BUFS`]
    pub traces: Vec<TraceBuf>,
}

/// Copy every section of `image` to its translated physical address and
/// decode the resource table.
///
/// Unknown section and descriptor types are skipped, not fatal.  Every
/// descriptor's device address is translated even when its type is skipped,
/// so a resource table referring outside the memory map fails the load.
///
/// # Errors
///
/// Returns [`Error::TruncatedImage`] for short sections,
/// [`Error::AddressNotMapped`] for untranslatable addresses, and passes
/// through [`MemoryIo`] failures.
pub fn load(image: &Image<'_>, maps: &[MemEntry], mem: &dyn MemoryIo) -> Result<LoadSummary> {
    let mut summary = LoadSummary::default();

    for section in image.sections() {
        let section = section?;

        debug!(
            "section: type {} da {:#x} len {:#x}",
            section.stype,
            section.da,
            section.content.len()
        );

        let pa = da_to_pa(maps, section.da)?;
        mem.write(pa, section.content)?;

        if SectionType::try_from(section.stype) == Ok(SectionType::Resource) {
            handle_resources(section.content, maps, &mut summary)?;
        }
    }

    Ok(summary)
}

fn handle_resources(content: &[u8], maps: &[MemEntry], summary: &mut LoadSummary) -> Result<()> {
    for rsc in parse_resources(content) {
        let pa = da_to_pa(maps, rsc.da).inspect_err(|_| {
            error!("resource {} has invalid device address {:#x}", rsc.name, rsc.da);
        })?;

        debug!(
            "resource: type {}, da {:#x}, pa {:#x}, len {:#x}, reserved {}, name {}",
            rsc.rtype, rsc.da, pa, rsc.len, rsc.reserved, rsc.name
        );

        if rsc.reserved != 0 {
            warn!("resource {} has nonzero reserved field", rsc.name);
        }

        match RscType::try_from(rsc.rtype) {
            Ok(RscType::Trace) => {
                if summary.traces.len() >= MAX_TRACE_BUFS {
                    warn!("skipping extra trace rsc {}", rsc.name);
                } else {
                    summary.traces.push(TraceBuf { pa, len: rsc.len });
                }
            }
            Ok(RscType::BootAddr) => summary.bootaddr = rsc.da,
            _ => debug!("unsupported resource type {}", rsc.rtype),
        }
    }

    Ok(())
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

fn read_u64(data: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(data[off..off + 8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RamIo;
    use proptest::prelude::*;

    const MAPS: &[MemEntry] = &[MemEntry {
        da: 0x0,
        pa: 0x9800_0000,
        size: 0x1_0000,
    }];

    fn image_header(version: u32, header: &[u8]) -> Vec<u8> {
        let mut data = IMAGE_MAGIC.to_vec();
        data.extend_from_slice(&version.to_le_bytes());
        data.extend_from_slice(&(header.len() as u32).to_le_bytes());
        data.extend_from_slice(header);
        data
    }

    fn push_section(data: &mut Vec<u8>, stype: u32, da: u64, content: &[u8]) {
        data.extend_from_slice(&stype.to_le_bytes());
        data.extend_from_slice(&da.to_le_bytes());
        data.extend_from_slice(&(content.len() as u32).to_le_bytes());
        data.extend_from_slice(content);
    }

    fn rsc_entry(rtype: u32, da: u64, len: u32, reserved: u32, name: &str) -> Vec<u8> {
        let mut e = Vec::with_capacity(RSC_ENTRY_LEN);
        e.extend_from_slice(&rtype.to_le_bytes());
        e.extend_from_slice(&da.to_le_bytes());
        e.extend_from_slice(&len.to_le_bytes());
        e.extend_from_slice(&reserved.to_le_bytes());
        let mut n = [0u8; RSC_NAME_LEN];
        n[..name.len()].copy_from_slice(name.as_bytes());
        e.extend_from_slice(&n);
        e
    }

    #[test]
    fn empty_image_parses_with_zero_sections() {
        let data = image_header(1, &[]);
        let image = Image::parse(&data).unwrap();

        assert_eq!(image.version, 1);
        assert_eq!(image.sections().count(), 0);

        let ram = RamIo::new(0x9800_0000, 0x1_0000);
        let summary = load(&image, MAPS, &ram).unwrap();
        assert_eq!(summary.bootaddr, 0);
        assert!(summary.traces.is_empty());
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let mut data = image_header(1, &[]);
        data[0] = b'X';
        assert_eq!(Image::parse(&data).unwrap_err(), Error::CorruptImage);
    }

    #[test]
    fn short_blob_is_corrupt() {
        assert_eq!(Image::parse(b"RPRC").unwrap_err(), Error::CorruptImage);
    }

    #[test]
    fn overlong_textual_header_is_truncated() {
        let mut data = image_header(1, b"hi");
        data[8] = 200;
        assert_eq!(Image::parse(&data).unwrap_err(), Error::TruncatedImage);
    }

    #[test]
    fn sections_parse_in_order() {
        let mut data = image_header(2, b"built by test");
        push_section(&mut data, SectionType::Text.into(), 0x100, &[1, 2, 3]);
        push_section(&mut data, SectionType::Data.into(), 0x200, &[4, 5]);

        let image = Image::parse(&data).unwrap();
        let sections: Vec<_> = image.sections().map(Result::unwrap).collect();

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].da, 0x100);
        assert_eq!(sections[0].content, &[1, 2, 3]);
        assert_eq!(sections[1].stype, u32::from(SectionType::Data));
    }

    #[test]
    fn short_section_content_is_truncated() {
        let mut data = image_header(1, &[]);
        push_section(&mut data, SectionType::Text.into(), 0x100, &[1, 2, 3, 4]);
        data.truncate(data.len() - 2);

        let image = Image::parse(&data).unwrap();
        let results: Vec<_> = image.sections().collect();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0], Err(Error::TruncatedImage));
    }

    #[test]
    fn partial_section_header_is_truncated() {
        let mut data = image_header(1, &[]);
        data.extend_from_slice(&[0u8; SECTION_HDR_LEN - 1]);

        let image = Image::parse(&data).unwrap();
        assert_eq!(image.sections().next(), Some(Err(Error::TruncatedImage)));
    }

    #[test]
    fn resource_table_round_trip() {
        let mut table = Vec::new();
        table.extend_from_slice(&rsc_entry(RscType::Trace.into(), 0x3000, 0x100, 0, "trace0"));
        table.extend_from_slice(&rsc_entry(99, 0x4000, 0x10, 0, "mystery"));
        table.extend_from_slice(&rsc_entry(RscType::BootAddr.into(), 0x1000, 0, 0, "entry"));

        let entries = parse_resources(&table);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "trace0");
        assert_eq!(entries[1].rtype, 99);
        assert_eq!(entries[2].da, 0x1000);

        // trailing partial descriptor is ignored
        table.extend_from_slice(&[0u8; RSC_ENTRY_LEN - 1]);
        assert_eq!(parse_resources(&table).len(), 3);
    }

    #[test]
    fn load_copies_sections_and_extracts_resources() {
        let mut table = Vec::new();
        table.extend_from_slice(&rsc_entry(RscType::BootAddr.into(), 0x1000, 0, 0, "entry"));
        table.extend_from_slice(&rsc_entry(RscType::Trace.into(), 0x3000, 0x40, 0, "trace0"));

        let mut data = image_header(1, &[]);
        push_section(&mut data, SectionType::Text.into(), 0x1000, &[0xde, 0xad]);
        push_section(&mut data, SectionType::Resource.into(), 0x2000, &table);

        let image = Image::parse(&data).unwrap();
        let ram = RamIo::new(0x9800_0000, 0x1_0000);
        let summary = load(&image, MAPS, &ram).unwrap();

        assert_eq!(summary.bootaddr, 0x1000);
        assert_eq!(
            summary.traces,
            vec![TraceBuf {
                pa: 0x9800_3000,
                len: 0x40
            }]
        );

        let mut buf = [0u8; 2];
        ram.read(0x9800_1000, &mut buf).unwrap();
        assert_eq!(buf, [0xde, 0xad]);
    }

    #[test]
    fn at_most_two_trace_buffers_are_collected() {
        let mut table = Vec::new();
        for (i, da) in [0x3000u64, 0x3100, 0x3200].iter().enumerate() {
            table.extend_from_slice(&rsc_entry(
                RscType::Trace.into(),
                *da,
                0x40,
                0,
                &format!("trace{i}"),
            ));
        }

        let mut data = image_header(1, &[]);
        push_section(&mut data, SectionType::Resource.into(), 0x2000, &table);

        let image = Image::parse(&data).unwrap();
        let ram = RamIo::new(0x9800_0000, 0x1_0000);
        let summary = load(&image, MAPS, &ram).unwrap();

        assert_eq!(summary.traces.len(), MAX_TRACE_BUFS);
        assert_eq!(summary.traces[1].pa, 0x9800_3100);
    }

    #[test]
    fn unmapped_section_address_fails_load() {
        let mut data = image_header(1, &[]);
        push_section(&mut data, SectionType::Text.into(), 0xdead_0000, &[1]);

        let image = Image::parse(&data).unwrap();
        let ram = RamIo::new(0x9800_0000, 0x1_0000);
        assert_eq!(load(&image, MAPS, &ram), Err(Error::AddressNotMapped));
    }

    #[test]
    fn unmapped_resource_address_fails_load() {
        let table = rsc_entry(RscType::Memory.into(), 0xdead_0000, 0, 0, "bad");

        let mut data = image_header(1, &[]);
        push_section(&mut data, SectionType::Resource.into(), 0x2000, &table);

        let image = Image::parse(&data).unwrap();
        let ram = RamIo::new(0x9800_0000, 0x1_0000);
        assert_eq!(load(&image, MAPS, &ram), Err(Error::AddressNotMapped));
    }

    proptest! {
        #[test]
        fn parse_and_load_never_panic(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            if let Ok(image) = Image::parse(&data) {
                let ram = RamIo::new(0x9800_0000, 0x1_0000);
                let _ = load(&image, MAPS, &ram);
            }
        }

        #[test]
        fn resource_decoding_is_total(data in proptest::collection::vec(any::<u8>(), 0..1024)) {
            let entries = parse_resources(&data);
            prop_assert_eq!(entries.len(), data.len() / RSC_ENTRY_LEN);
        }
    }
}
