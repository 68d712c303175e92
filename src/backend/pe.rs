//! PE backend.
//!
//! The compressed container lives in its own section, appended after the last one
//! by editing the section table directly. SEA and VFS blobs are `RT_RCDATA`
//! resources, which the runtime finds with `FindResource`; `editpe` rebuilds the
//! resource directory for those. Reading resources back goes through `object`'s
//! resource directory walker.
//!
//! Any edit invalidates an Authenticode signature, so the certificate table is
//! dropped up front.

use anyhow::{anyhow, Context, Result};
use editpe::constants::{LANGUAGE_ID_EN_US, RT_RCDATA};
use editpe::{Image, ResourceEntry, ResourceEntryName, ResourceTable};
use object::endian::{U16, U32};
use object::pe::{
    ImageDataDirectory, ImageDosHeader, ImageFileHeader, ImageOptionalHeader32, ImageOptionalHeader64,
    ImageSectionHeader, IMAGE_DIRECTORY_ENTRY_RESOURCE, IMAGE_DIRECTORY_ENTRY_SECURITY, IMAGE_DOS_SIGNATURE,
    IMAGE_NT_OPTIONAL_HDR32_MAGIC, IMAGE_NT_OPTIONAL_HDR64_MAGIC, IMAGE_NT_SIGNATURE, IMAGE_SCN_CNT_INITIALIZED_DATA,
    IMAGE_SCN_MEM_READ,
};
use object::pod::bytes_of;
use object::read::pe::{ResourceDirectory, ResourceDirectoryEntryData, ResourceNameOrId};
use object::LittleEndian as LE;
use std::mem::size_of;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, info};

use super::{Backend, InjectBatch, Resource};
use crate::error::{invalid_format, BinjectError};
use crate::format::Format;
use crate::fuse;
use crate::utils::{bytes_at, checked_align_up, pod_at, pod_at_mut, read_u16, read_u32, trim_name, write_u32};

/// Written as `.pressed`: image section names are at most 8 bytes.
pub const PRESSED_SECTION_NAME: &str = ".pressed_data";
const SECTION_NAME_LEN: usize = 8;
const SECTION_HEADER_SIZE: u64 = size_of::<ImageSectionHeader>() as u64;
const MAX_SECTIONS: u16 = 96;
/// Largest image this tool will produce.
pub const MAX_OUTPUT_SIZE: u64 = 200 * 1024 * 1024;

// Optional header field offsets shared by PE32 and PE32+.
const OPT_SIZE_OF_IMAGE: u64 = 56;

/// The on-disk form of a section name: truncated or zero padded to 8 bytes.
pub fn section_name(name: &str) -> [u8; SECTION_NAME_LEN] {
    let mut out = [0u8; SECTION_NAME_LEN];
    let bytes = name.as_bytes();
    let len = bytes.len().min(SECTION_NAME_LEN);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

#[derive(Debug, Clone)]
struct SectionInfo {
    name: [u8; SECTION_NAME_LEN],
    virtual_address: u64,
    virtual_size: u64,
    raw_ptr: u64,
    raw_size: u64,
}

impl SectionInfo {
    fn raw_range(&self) -> Range<usize> {
        self.raw_ptr as usize..(self.raw_ptr + self.raw_size) as usize
    }

    fn virtual_end(&self) -> u64 {
        self.virtual_address + self.virtual_size.max(self.raw_size)
    }
}

/// Validated view over the headers of a PE32 or PE32+ image.
struct PeLayout {
    file_header_offset: u64,
    optional_header_offset: u64,
    data_directories_offset: u64,
    number_of_rva_and_sizes: u32,
    section_alignment: u64,
    file_alignment: u64,
    size_of_headers: u64,
    section_table_offset: u64,
    sections: Vec<SectionInfo>,
}

impl PeLayout {
    fn parse(image: &[u8]) -> Result<Self> {
        let dos: &ImageDosHeader = pod_at(image, 0, "DOS header")?;
        if dos.e_magic.get(LE) != IMAGE_DOS_SIGNATURE {
            return Err(invalid_format("missing MZ signature"));
        }
        let nt_offset = dos.e_lfanew.get(LE) as u64;
        if nt_offset == 0 || nt_offset >= image.len() as u64 {
            return Err(invalid_format(format!("e_lfanew 0x{:x} is outside the file", nt_offset)));
        }
        if read_u32(image, nt_offset)? != IMAGE_NT_SIGNATURE {
            return Err(invalid_format("missing PE signature"));
        }

        let file_header_offset = nt_offset + 4;
        let file_header: &ImageFileHeader = pod_at(image, file_header_offset, "COFF file header")?;
        let number_of_sections = file_header.number_of_sections.get(LE);
        let optional_size = file_header.size_of_optional_header.get(LE) as u64;
        if number_of_sections > MAX_SECTIONS {
            return Err(invalid_format(format!("{} sections (limit {})", number_of_sections, MAX_SECTIONS)));
        }

        let optional_header_offset = file_header_offset + size_of::<ImageFileHeader>() as u64;
        bytes_at(image, optional_header_offset, optional_size, "optional header")?;
        let (section_alignment, file_alignment, size_of_headers, number_of_rva_and_sizes, fixed_size) =
            match read_u16(image, optional_header_offset)? {
                IMAGE_NT_OPTIONAL_HDR64_MAGIC => {
                    let h: &ImageOptionalHeader64 = pod_at(image, optional_header_offset, "optional header")?;
                    (
                        h.section_alignment.get(LE),
                        h.file_alignment.get(LE),
                        h.size_of_headers.get(LE),
                        h.number_of_rva_and_sizes.get(LE),
                        size_of::<ImageOptionalHeader64>(),
                    )
                }
                IMAGE_NT_OPTIONAL_HDR32_MAGIC => {
                    let h: &ImageOptionalHeader32 = pod_at(image, optional_header_offset, "optional header")?;
                    (
                        h.section_alignment.get(LE),
                        h.file_alignment.get(LE),
                        h.size_of_headers.get(LE),
                        h.number_of_rva_and_sizes.get(LE),
                        size_of::<ImageOptionalHeader32>(),
                    )
                }
                other => return Err(invalid_format(format!("unknown optional header magic 0x{:x}", other))),
            };
        let dirs_size = number_of_rva_and_sizes as u64 * size_of::<ImageDataDirectory>() as u64;
        if fixed_size as u64 + dirs_size > optional_size {
            return Err(invalid_format("data directories overrun the optional header"));
        }
        for (what, align) in [("SectionAlignment", section_alignment), ("FileAlignment", file_alignment)] {
            if align == 0 || !align.is_power_of_two() {
                return Err(invalid_format(format!("{} {} is not a power of two", what, align)));
            }
        }

        let section_table_offset = optional_header_offset + optional_size;
        let mut sections = Vec::with_capacity(number_of_sections as usize);
        for i in 0..number_of_sections as u64 {
            let h: &ImageSectionHeader = pod_at(image, section_table_offset + i * SECTION_HEADER_SIZE, "section header")?;
            sections.push(SectionInfo {
                name: h.name,
                virtual_address: h.virtual_address.get(LE) as u64,
                virtual_size: h.virtual_size.get(LE) as u64,
                raw_ptr: h.pointer_to_raw_data.get(LE) as u64,
                raw_size: h.size_of_raw_data.get(LE) as u64,
            });
        }

        Ok(Self {
            file_header_offset,
            optional_header_offset,
            data_directories_offset: optional_header_offset + fixed_size as u64,
            number_of_rva_and_sizes,
            section_alignment: section_alignment as u64,
            file_alignment: file_alignment as u64,
            size_of_headers: size_of_headers as u64,
            section_table_offset,
            sections,
        })
    }

    fn find_section(&self, name: &str) -> Option<usize> {
        let wanted = section_name(name);
        self.sections.iter().position(|s| s.name == wanted)
    }

    fn data_directory_offset(&self, index: usize) -> Option<u64> {
        (index < self.number_of_rva_and_sizes as usize)
            .then(|| self.data_directories_offset + (index * size_of::<ImageDataDirectory>()) as u64)
    }

    fn data_directory(&self, image: &[u8], index: usize) -> Result<Option<(u64, u64)>> {
        let Some(offset) = self.data_directory_offset(index) else {
            return Ok(None);
        };
        let dir: &ImageDataDirectory = pod_at(image, offset, "data directory")?;
        let (address, size) = (dir.virtual_address.get(LE) as u64, dir.size.get(LE) as u64);
        Ok((address != 0 && size != 0).then_some((address, size)))
    }

    /// File range backing `rva`, up to the end of its section's raw data.
    fn rva_to_file(&self, rva: u64) -> Option<Range<u64>> {
        self.sections.iter().find_map(|s| {
            let end = s.virtual_address + s.raw_size;
            (rva >= s.virtual_address && rva < end).then(|| s.raw_ptr + (rva - s.virtual_address)..s.raw_ptr + s.raw_size)
        })
    }

    fn section_ranges(&self, file_len: usize) -> Vec<Range<usize>> {
        self.sections
            .iter()
            .filter(|s| s.raw_ptr != 0 && s.raw_size != 0)
            .map(|s| {
                let r = s.raw_range();
                r.start.min(file_len)..r.end.min(file_len)
            })
            .collect()
    }

    fn set_number_of_sections(&self, image: &mut [u8], count: usize) -> Result<()> {
        let h: &mut ImageFileHeader = pod_at_mut(image, self.file_header_offset, "COFF file header")?;
        h.number_of_sections.set(LE, count as u16);
        Ok(())
    }
}

/// Where a new section lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_ptr: u32,
    pub raw_size: u32,
    pub size_of_image: u32,
}

/// Compute a new section's addresses with overflow-checked alignment.
///
/// `virtual_end` is where the highest existing section ends in memory and
/// `file_end` is the effective end of file.
pub fn place_section(
    virtual_end: u64,
    section_alignment: u64,
    file_end: u64,
    file_alignment: u64,
    size: u64,
) -> Result<Placement> {
    let narrow = |value: u64, what: &str| -> Result<u32> {
        u32::try_from(value).map_err(|_| invalid_format(format!("{} 0x{:x} does not fit in 32 bits", what, value)))
    };
    let virtual_address = checked_align_up(virtual_end, section_alignment)?;
    let raw_ptr = checked_align_up(file_end, file_alignment)?;
    let raw_size = checked_align_up(size, file_alignment)?;
    let virtual_end = virtual_address
        .checked_add(size)
        .ok_or_else(|| invalid_format("section end overflows"))?;
    let size_of_image = checked_align_up(virtual_end, section_alignment)?;
    Ok(Placement {
        virtual_address: narrow(virtual_address, "VirtualAddress")?,
        virtual_size: narrow(size, "VirtualSize")?,
        raw_ptr: narrow(raw_ptr, "PointerToRawData")?,
        raw_size: narrow(raw_size, "SizeOfRawData")?,
        size_of_image: narrow(size_of_image, "SizeOfImage")?,
    })
}

/// Drop the Authenticode certificate table. Returns whether one was present.
pub fn strip_certificate(image: &mut Vec<u8>) -> Result<bool> {
    let layout = PeLayout::parse(image)?;
    let Some((offset, size)) = layout.data_directory(image, IMAGE_DIRECTORY_ENTRY_SECURITY)? else {
        return Ok(false);
    };
    if let Some(dir_offset) = layout.data_directory_offset(IMAGE_DIRECTORY_ENTRY_SECURITY) {
        let dir: &mut ImageDataDirectory = pod_at_mut(image, dir_offset, "security directory")?;
        dir.virtual_address.set(LE, 0);
        dir.size.set(LE, 0);
    }
    // The security directory holds a file offset, not an RVA.
    if offset + size >= image.len() as u64 && offset < image.len() as u64 {
        image.truncate(offset as usize);
        debug!("truncated 0x{:x} byte certificate table", size);
    }
    info!("removed certificate table");
    Ok(true)
}

fn check_output_size(len: u64) -> Result<()> {
    if len > MAX_OUTPUT_SIZE {
        return Err(BinjectError::InvalidArgs(format!("output would be {} bytes (limit {})", len, MAX_OUTPUT_SIZE)).into());
    }
    Ok(())
}

/// Remove section `index`: zero its data, close the gap in the table and drop
/// its bytes when they end the file. Returns the new effective file size.
fn remove_section(image: &mut Vec<u8>, layout: &PeLayout, index: usize) -> Result<u64> {
    let count = layout.sections.len();
    if count <= 1 {
        let name = String::from_utf8_lossy(trim_name(&layout.sections[index].name)).into_owned();
        return Err(BinjectError::SectionExists(format!("{} is the only section and cannot be replaced", name)).into());
    }
    let section = &layout.sections[index];
    if section.raw_ptr != 0 && section.raw_size != 0 {
        let range = section.raw_range();
        let end = range.end.min(image.len());
        image[range.start.min(end)..end].fill(0);
    }

    let table = layout.section_table_offset as usize;
    let entry = SECTION_HEADER_SIZE as usize;
    let start = table + index * entry;
    let end = table + count * entry;
    image.copy_within(start + entry..end, start);
    image[end - entry..end].fill(0);
    layout.set_number_of_sections(image, count - 1)?;

    if section.raw_ptr != 0 && section.raw_ptr + section.raw_size >= image.len() as u64 {
        image.truncate(section.raw_ptr as usize);
    }
    debug!("removed section {}", String::from_utf8_lossy(trim_name(&section.name)));
    Ok(image.len() as u64)
}

/// Add section `name` holding `data`, replacing any section with the same name.
pub fn add_section(image: Vec<u8>, name: &str, data: &[u8]) -> Result<Vec<u8>> {
    let mut image = image;
    let mut layout = PeLayout::parse(&image)?;
    if let Some(index) = layout.find_section(name) {
        info!("replacing existing section {}", name);
        remove_section(&mut image, &layout, index)?;
        layout = PeLayout::parse(&image)?;
    }
    if layout.sections.is_empty() {
        return Err(invalid_format("PE has no sections"));
    }

    let table_end = layout.section_table_offset + layout.sections.len() as u64 * SECTION_HEADER_SIZE;
    let first_raw = layout
        .sections
        .iter()
        .filter(|s| s.raw_ptr != 0 && s.raw_size != 0)
        .map(|s| s.raw_ptr)
        .min()
        .unwrap_or(u64::MAX);
    if table_end + SECTION_HEADER_SIZE > layout.size_of_headers.min(first_raw) {
        return Err(invalid_format(format!("no room in the headers for another section header ({})", name)));
    }

    let virtual_end = layout.sections.iter().map(SectionInfo::virtual_end).max().unwrap_or(0);
    let placement = place_section(
        virtual_end,
        layout.section_alignment,
        image.len() as u64,
        layout.file_alignment,
        data.len() as u64,
    )?;
    let new_len = placement.raw_ptr as u64 + placement.raw_size as u64;
    check_output_size(new_len)?;

    let header = ImageSectionHeader {
        name: section_name(name),
        virtual_size: U32::new(LE, placement.virtual_size),
        virtual_address: U32::new(LE, placement.virtual_address),
        size_of_raw_data: U32::new(LE, placement.raw_size),
        pointer_to_raw_data: U32::new(LE, placement.raw_ptr),
        pointer_to_relocations: U32::new(LE, 0),
        pointer_to_linenumbers: U32::new(LE, 0),
        number_of_relocations: U16::new(LE, 0),
        number_of_linenumbers: U16::new(LE, 0),
        characteristics: U32::new(LE, IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ),
    };
    image[table_end as usize..(table_end + SECTION_HEADER_SIZE) as usize].copy_from_slice(bytes_of(&header));
    layout.set_number_of_sections(&mut image, layout.sections.len() + 1)?;
    write_u32(&mut image, layout.optional_header_offset + OPT_SIZE_OF_IMAGE, placement.size_of_image)?;

    image.resize(placement.raw_ptr as usize, 0);
    image.extend_from_slice(data);
    image.resize(new_len as usize, 0);

    info!(
        "added section {} at 0x{:x} (rva 0x{:x}, 0x{:x} bytes)",
        name, placement.raw_ptr, placement.virtual_address, placement.virtual_size
    );
    Ok(image)
}

/// Stretch the resource data directory over the rest of its section's raw data.
///
/// `editpe` assumes the directory size is never smaller than the section's raw
/// size when the rebuilt directory fits inside the section.
fn widen_resource_directory(image: &mut [u8], layout: &PeLayout) -> Result<()> {
    let Some((rva, size)) = layout.data_directory(image, IMAGE_DIRECTORY_ENTRY_RESOURCE)? else {
        return Ok(());
    };
    let (Some(range), Some(offset)) = (
        layout.rva_to_file(rva),
        layout.data_directory_offset(IMAGE_DIRECTORY_ENTRY_RESOURCE),
    ) else {
        return Ok(());
    };
    let available = range.end - range.start;
    if available > size {
        let dir: &mut ImageDataDirectory = pod_at_mut(image, offset, "resource directory")?;
        dir.size.set(LE, available as u32);
        debug!("resource directory size 0x{:x} -> 0x{:x}", size, available);
    }
    Ok(())
}

/// Write `entries` as `RT_RCDATA/<name>/en-US` resources, replacing same-named ones.
fn write_resources(image: &[u8], entries: &[(Resource, &[u8])]) -> Result<Vec<u8>> {
    let mut pe = Image::parse(image).map_err(|e| anyhow!("failed to parse PE for resource editing: {e:?}"))?;
    let mut resources = pe.resource_directory().cloned().unwrap_or_default();
    let root = resources.root_mut();
    if root.get(ResourceEntryName::ID(RT_RCDATA as u32)).is_none() {
        root.insert(
            ResourceEntryName::ID(RT_RCDATA as u32),
            ResourceEntry::Table(ResourceTable::default()),
        );
    }
    let Some(ResourceEntry::Table(rc_table)) = root.get_mut(ResourceEntryName::ID(RT_RCDATA as u32)) else {
        return Err(invalid_format("RT_RCDATA resource entry is not a table"));
    };

    for (resource, data) in entries {
        let name = ResourceEntryName::from_string(resource.note_name());
        let mut languages = ResourceTable::default();
        let mut entry = editpe::ResourceData::default();
        entry.set_data(data.to_vec());
        languages.insert(ResourceEntryName::ID(LANGUAGE_ID_EN_US as u32), ResourceEntry::Data(entry));
        rc_table.insert(name, ResourceEntry::Table(languages));
        debug!("staged resource {} ({} bytes)", resource.note_name(), data.len());
    }

    let rebuilt = panic::catch_unwind(AssertUnwindSafe(|| pe.set_resource_directory(resources)))
        .map_err(|_| invalid_format("resource directory layout is not supported"))?;
    rebuilt.map_err(|e| anyhow!("failed to rebuild PE resources: {e:?}"))?;
    Ok(pe.data().to_vec())
}

/// Look up `RT_RCDATA/<name>` and return the first language's bytes.
fn find_resource<'a>(image: &'a [u8], layout: &PeLayout, name: &str) -> Result<Option<&'a [u8]>> {
    let Some((rva, _)) = layout.data_directory(image, IMAGE_DIRECTORY_ENTRY_RESOURCE)? else {
        return Ok(None);
    };
    let Some(range) = layout.rva_to_file(rva) else {
        return Err(invalid_format(format!("resource directory rva 0x{:x} is not in any section", rva)));
    };
    let section = bytes_at(image, range.start, range.end - range.start, "resource directory")?;
    let directory = ResourceDirectory::new(section);

    let root = directory.root().context("failed to read resource directory")?;
    let Some(rcdata) = root
        .entries
        .iter()
        .find(|e| matches!(e.name_or_id(), ResourceNameOrId::Id(id) if id as u32 == RT_RCDATA as u32))
    else {
        return Ok(None);
    };
    let ResourceDirectoryEntryData::Table(types) = rcdata.data(directory)? else {
        return Ok(None);
    };

    for entry in types.entries {
        let ResourceNameOrId::Name(entry_name) = entry.name_or_id() else {
            continue;
        };
        if !entry_name.to_string_lossy(directory)?.eq_ignore_ascii_case(name) {
            continue;
        }
        let mut data = entry.data(directory)?;
        // Descend through the language level to the first data leaf.
        loop {
            match data {
                ResourceDirectoryEntryData::Data(leaf) => {
                    let rva = leaf.offset_to_data.get(LE) as u64;
                    let size = leaf.size.get(LE) as u64;
                    let range = layout
                        .rva_to_file(rva)
                        .ok_or_else(|| invalid_format(format!("resource {} data rva 0x{:x} is unmapped", name, rva)))?;
                    return Ok(Some(bytes_at(image, range.start, size, "resource data")?));
                }
                ResourceDirectoryEntryData::Table(table) => {
                    let Some(first) = table.entries.first() else {
                        return Ok(None);
                    };
                    data = first.data(directory)?;
                }
            }
        }
    }
    Ok(None)
}

pub struct PeBackend;

impl Backend for PeBackend {
    fn format(&self) -> Format {
        Format::Pe
    }

    fn inject(&self, image: Vec<u8>, batch: &InjectBatch) -> Result<Vec<u8>> {
        let mut image = image;
        strip_certificate(&mut image)?;

        let layout = PeLayout::parse(&image)?;
        widen_resource_directory(&mut image, &layout)?;
        let reinjection = find_resource(&image, &layout, Resource::Sea.note_name())?.is_some();
        if reinjection {
            info!("{} resource exists; leaving the fuse alone", Resource::Sea.note_name());
        } else if batch.sea.is_some() {
            let ranges = layout.section_ranges(image.len());
            fuse::flip_in_ranges(&mut image, &ranges);
        }

        let image = write_resources(&image, &batch.entries())?;
        check_output_size(image.len() as u64)?;
        Ok(image)
    }

    fn embed_container(&self, image: Vec<u8>, container: &[u8]) -> Result<Vec<u8>> {
        let mut image = image;
        strip_certificate(&mut image)?;
        add_section(image, PRESSED_SECTION_NAME, container)
    }

    fn find<'a>(&self, image: &'a [u8], resource: Resource) -> Result<Option<(String, &'a [u8])>> {
        let layout = PeLayout::parse(image)?;
        if resource == Resource::Pressed {
            let Some(index) = layout.find_section(PRESSED_SECTION_NAME) else {
                return Ok(None);
            };
            let s = &layout.sections[index];
            // Raw data is padded to FileAlignment; the container is self-delimiting.
            let end = (s.raw_ptr + s.raw_size).min(image.len() as u64);
            let data = bytes_at(image, s.raw_ptr, end.saturating_sub(s.raw_ptr), "section data")?;
            let name = String::from_utf8_lossy(trim_name(&s.name)).into_owned();
            return Ok(Some((format!("section {}", name), data)));
        }
        let name = resource.note_name();
        Ok(find_resource(image, &layout, name)?.map(|data| (format!("resource RCDATA/{}", name), data)))
    }
}
