//! ELF backend.
//!
//! Payloads live in notes. Rather than growing the program header table (which a
//! static binary locates through its own load address and cannot have moved), the
//! last `PT_NOTE` entry is repointed at a fresh note blob appended to the file:
//!
//! 1. parse and validate the ELF header and program headers;
//! 2. build the incoming note records;
//! 3. carry forward every existing note whose name is not being replaced;
//! 4. optionally extend the last `PT_LOAD` so the loader maps the new notes. A
//!    zero-fill (`.bss`) tail is first written out as zeros, and whatever the file
//!    held past the segment moves down to make room;
//! 5. rewrite the `PT_NOTE` entry and append the blob.
//!
//! Only 64-bit little-endian files are handled.

use anyhow::Result;
use object::elf::{
    FileHeader64, ProgramHeader64, SectionHeader64, ELFCLASS64, ELFDATA2LSB, ELFMAG, PF_R, PT_INTERP, PT_LOAD, PT_NOTE,
    SHT_NOBITS,
};
use object::read::elf::ElfFile64;
use object::{LittleEndian as LE, Object, ObjectSection};
use std::mem::size_of;
use std::ops::Range;
use tracing::{debug, info, warn};

use super::{Backend, InjectBatch, Resource};
use crate::error::invalid_format;
use crate::format::Format;
use crate::fuse;
use crate::utils::{align_up, bytes_at, pod_at, pod_at_mut};

/// Owner name of the compression-marker note.
pub const PRESSED_NOTE_NAME: &str = "pressed_data";
/// Section name used by section-header based stubs.
pub const PRESSED_SECTION_NAME: &str = ".pressed_data";

const NOTE_HEADER_LEN: u64 = 12;
const NOTE_ALIGN: u64 = 4;
const PAGE_SIZE: u64 = 0x1000;
/// Notes that are not mapped get a vaddr well above anything a loader would place.
const UNMAPPED_NOTE_BASE: u64 = 0x1000_0000;

/// A note to add.
#[derive(Debug, Clone, Copy)]
pub struct NewNote<'a> {
    pub name: &'a str,
    pub desc: &'a [u8],
}

/// Whether appended notes get mapped by extending the last `PT_LOAD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPolicy {
    /// Extend only for dynamically linked images, and never for the compression marker.
    #[default]
    Auto,
    Never,
}

/// Knobs for [`reuse_ptnote`].
///
/// The default changes nothing beyond the `PT_NOTE` entry it repoints and, under
/// [`LoadPolicy::Auto`], the last `PT_LOAD` entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReuseOptions {
    pub load_policy: LoadPolicy,
    /// Drop a note blob this tool previously appended at end of file before appending the new one.
    pub reclaim_trailing: bool,
}

/// What [`reuse_ptnote`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReuseReport {
    pub note_offset: u64,
    pub note_vaddr: u64,
    pub notes_len: u64,
    pub preserved: usize,
    pub load_extended: bool,
    /// Zero-fill bytes of the last `PT_LOAD` now backed by the file.
    pub zero_filled: u64,
    pub reclaimed: u64,
}

/// Copied-out program header values.
#[derive(Debug, Clone, Copy)]
struct Phdr {
    p_type: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
}

impl Phdr {
    fn file_end(&self) -> u64 {
        self.offset.saturating_add(self.filesz)
    }
}

/// Validated view of the ELF header and program header table.
struct ElfLayout {
    phoff: u64,
    phentsize: u64,
    phdrs: Vec<Phdr>,
    shoff: u64,
    shentsize: u64,
    shnum: u64,
    /// End of the section header table in the file, or 0 without one.
    shdrs_end: u64,
}

impl ElfLayout {
    fn parse(image: &[u8]) -> Result<Self> {
        let header: &FileHeader64<LE> = pod_at(image, 0, "ELF header")?;
        let ident = &header.e_ident;
        if ident.magic != ELFMAG {
            return Err(invalid_format("not an ELF file"));
        }
        if ident.class != ELFCLASS64 {
            return Err(invalid_format("only 64-bit ELF is supported"));
        }
        if ident.data != ELFDATA2LSB {
            return Err(invalid_format("only little-endian ELF is supported"));
        }

        let phoff = header.e_phoff.get(LE);
        let phentsize = header.e_phentsize.get(LE) as u64;
        let phnum = header.e_phnum.get(LE) as u64;
        if phnum == 0 {
            return Err(invalid_format("ELF has no program headers"));
        }
        if phentsize < size_of::<ProgramHeader64<LE>>() as u64 {
            return Err(invalid_format(format!("program header entry size {} too small", phentsize)));
        }

        let mut phdrs = Vec::with_capacity(phnum as usize);
        for index in 0..phnum {
            let ph: &ProgramHeader64<LE> = pod_at(image, phoff + index * phentsize, "program header")?;
            phdrs.push(Phdr {
                p_type: ph.p_type.get(LE),
                offset: ph.p_offset.get(LE),
                vaddr: ph.p_vaddr.get(LE),
                filesz: ph.p_filesz.get(LE),
                memsz: ph.p_memsz.get(LE),
            });
        }

        let shoff = header.e_shoff.get(LE);
        let shentsize = header.e_shentsize.get(LE) as u64;
        let shnum = if shoff == 0 { 0 } else { header.e_shnum.get(LE) as u64 };
        let shdrs_end = if shoff == 0 {
            0
        } else {
            shoff.saturating_add(shnum * shentsize)
        };

        Ok(Self {
            phoff,
            phentsize,
            phdrs,
            shoff,
            shentsize,
            shnum,
            shdrs_end,
        })
    }

    fn phdr_offset(&self, index: usize) -> u64 {
        self.phoff + index as u64 * self.phentsize
    }

    fn last_of_type(&self, p_type: u32) -> Option<usize> {
        self.phdrs.iter().rposition(|ph| ph.p_type == p_type)
    }

    /// The `PT_LOAD` whose file extent ends last. Ties go to the later entry.
    fn last_load(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (index, ph) in self.phdrs.iter().enumerate() {
            if ph.p_type != PT_LOAD {
                continue;
            }
            match best {
                Some(b) if ph.file_end() < self.phdrs[b].file_end() => {}
                _ => best = Some(index),
            }
        }
        best
    }

    fn phdrs_end(&self) -> u64 {
        self.phoff + self.phentsize * self.phdrs.len() as u64
    }

    fn is_dynamic(&self) -> bool {
        self.phdrs.iter().any(|ph| ph.p_type == PT_INTERP)
    }

    fn note_region<'a>(&self, image: &'a [u8], index: usize) -> Result<&'a [u8]> {
        let ph = &self.phdrs[index];
        bytes_at(image, ph.offset, ph.filesz, "PT_NOTE contents")
    }
}

/// A parsed note record inside a `PT_NOTE` region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteRecord<'a> {
    /// Owner name without the trailing NUL.
    pub name: &'a [u8],
    pub note_type: u32,
    pub desc: &'a [u8],
    /// The whole padded record, header included.
    pub raw: &'a [u8],
}

fn le32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Walk note records in `region`. Stops quietly at the first record that would
/// run past the end of the region.
pub fn parse_notes(region: &[u8]) -> Vec<NoteRecord<'_>> {
    let mut notes = Vec::new();
    let len = region.len() as u64;
    let mut pos = 0u64;
    while pos + NOTE_HEADER_LEN <= len {
        let at = pos as usize;
        let namesz = le32(region, at) as u64;
        let descsz = le32(region, at + 4) as u64;
        let note_type = le32(region, at + 8);
        let total = NOTE_HEADER_LEN + align_up(namesz, NOTE_ALIGN) + align_up(descsz, NOTE_ALIGN);
        if pos + total > len {
            debug!("note at +0x{:x} overruns PT_NOTE ({} > {}); stopping", pos, pos + total, len);
            break;
        }
        let name_start = at + NOTE_HEADER_LEN as usize;
        let name = &region[name_start..name_start + namesz.saturating_sub(1) as usize];
        let desc_start = name_start + align_up(namesz, NOTE_ALIGN) as usize;
        notes.push(NoteRecord {
            name,
            note_type,
            desc: &region[desc_start..desc_start + descsz as usize],
            raw: &region[at..at + total as usize],
        });
        pos += total;
    }
    notes
}

/// Serialize one note record with 4-byte aligned name and description.
pub fn build_note(out: &mut Vec<u8>, name: &str, note_type: u32, desc: &[u8]) {
    let namesz = name.len() + 1;
    out.extend_from_slice(&(namesz as u32).to_le_bytes());
    out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
    out.extend_from_slice(&note_type.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out.resize(out.len() + (align_up(namesz as u64, NOTE_ALIGN) as usize - namesz), 0);
    out.extend_from_slice(desc);
    out.resize(out.len() + (align_up(desc.len() as u64, NOTE_ALIGN) as usize - desc.len()), 0);
}

/// Repoint the last `PT_NOTE` at a new note blob appended to the file.
///
/// `patch` runs on the working copy before any header is rewritten (the SEA fuse
/// flip uses it). Validation failures return before anything is produced.
pub fn reuse_ptnote(
    image: &[u8],
    notes: &[NewNote],
    options: ReuseOptions,
    patch: impl FnOnce(&mut [u8]),
) -> Result<(Vec<u8>, ReuseReport)> {
    // Parsed
    let layout = ElfLayout::parse(image)?;
    let load_index = layout
        .last_load()
        .ok_or_else(|| invalid_format("ELF has no PT_LOAD segment"))?;
    let note_index = layout
        .last_of_type(PT_NOTE)
        .ok_or_else(|| invalid_format("ELF has no PT_NOTE segment to reuse"))?;
    let existing = layout.note_region(image, note_index)?;
    let load = layout.phdrs[load_index];
    debug!(
        "PT_NOTE[{}] at 0x{:x} (0x{:x} bytes), last PT_LOAD[{}] ends at 0x{:x}",
        note_index,
        layout.phdrs[note_index].offset,
        existing.len(),
        load_index,
        load.file_end()
    );

    // NotesCollected
    let mut incoming = Vec::new();
    for note in notes {
        build_note(&mut incoming, note.name, 0, note.desc);
    }

    // NotesDeduplicated
    let mut blob = Vec::with_capacity(existing.len() + incoming.len());
    let mut preserved = 0;
    for record in parse_notes(existing) {
        if notes.iter().any(|n| n.name.as_bytes() == record.name) {
            debug!("replacing note {:?}", String::from_utf8_lossy(record.name));
            continue;
        }
        blob.extend_from_slice(record.raw);
        preserved += 1;
    }
    blob.extend_from_slice(&incoming);
    let notes_len = blob.len() as u64;
    debug!("{} preserved note(s), {} new, 0x{:x} bytes", preserved, notes.len(), notes_len);

    let mut input_size = image.len() as u64;
    let mut reclaimed = 0;
    if options.reclaim_trailing && is_trailing_blob(&layout, note_index, input_size) {
        let start = layout.phdrs[note_index].offset;
        reclaimed = input_size - start;
        input_size = start;
        debug!("reclaiming 0x{:x} trailing bytes of the previous note blob", reclaimed);
    }

    let gap = input_size
        .checked_sub(load.file_end())
        .ok_or_else(|| invalid_format("last PT_LOAD extends past end of file"))?;

    // LoadExtended
    let is_marker = notes.iter().any(|n| n.name == PRESSED_NOTE_NAME);
    let extend = options.load_policy == LoadPolicy::Auto && layout.is_dynamic() && !is_marker;
    let zero_filled = if extend { load.memsz.saturating_sub(load.filesz) } else { 0 };
    let note_offset = input_size + zero_filled;
    let note_vaddr = if extend {
        load.vaddr + load.filesz + zero_filled + gap
    } else {
        UNMAPPED_NOTE_BASE + align_up(input_size, PAGE_SIZE)
    };

    let mut out = image.to_vec();
    patch(&mut out);
    out.truncate(input_size as usize);

    if zero_filled > 0 {
        fill_zero_tail(&mut out, &layout, load.file_end(), zero_filled)?;
    }
    if extend {
        let size = note_offset - load.offset + notes_len;
        let ph: &mut ProgramHeader64<LE> = pod_at_mut(&mut out, layout.phdr_offset(load_index), "PT_LOAD")?;
        ph.p_filesz.set(LE, size);
        ph.p_memsz.set(LE, size.max(load.memsz));
        debug!(
            "extended PT_LOAD[{}] to 0x{:x} bytes (0x{:x} zero-fill written out)",
            load_index, size, zero_filled
        );
    }

    // NoteEntryRewritten
    let ph: &mut ProgramHeader64<LE> = pod_at_mut(&mut out, layout.phdr_offset(note_index), "PT_NOTE")?;
    ph.p_flags.set(LE, PF_R);
    ph.p_offset.set(LE, note_offset);
    ph.p_vaddr.set(LE, note_vaddr);
    ph.p_paddr.set(LE, note_vaddr);
    ph.p_filesz.set(LE, notes_len);
    ph.p_memsz.set(LE, notes_len);
    ph.p_align.set(LE, NOTE_ALIGN);

    // Written
    out.extend_from_slice(&blob);

    Ok((
        out,
        ReuseReport {
            note_offset,
            note_vaddr,
            notes_len,
            preserved,
            load_extended: extend,
            zero_filled,
            reclaimed,
        },
    ))
}

/// Insert `len` zero bytes at `split` (the file end of the last `PT_LOAD`) and
/// move every file offset at or past it down by the same amount.
///
/// Only non-loaded content (section data, the section header table, stray
/// segments) can sit past `split`, so nothing mapped changes address.
fn fill_zero_tail(out: &mut Vec<u8>, layout: &ElfLayout, split: u64, len: u64) -> Result<()> {
    if layout.phdrs_end() > split {
        return Err(invalid_format("program header table lies past the last PT_LOAD"));
    }
    let at = split as usize;
    out.splice(at..at, std::iter::repeat(0u8).take(len as usize));

    for (index, ph) in layout.phdrs.iter().enumerate() {
        if ph.p_type != PT_LOAD && ph.filesz > 0 && ph.offset >= split {
            let entry: &mut ProgramHeader64<LE> = pod_at_mut(out, layout.phdr_offset(index), "program header")?;
            entry.p_offset.set(LE, ph.offset + len);
        }
    }

    if layout.shoff == 0 {
        return Ok(());
    }
    let shoff = if layout.shoff >= split { layout.shoff + len } else { layout.shoff };
    let header: &mut FileHeader64<LE> = pod_at_mut(out, 0, "ELF header")?;
    header.e_shoff.set(LE, shoff);
    if layout.shentsize < size_of::<SectionHeader64<LE>>() as u64 {
        return Err(invalid_format(format!("section header entry size {} too small", layout.shentsize)));
    }
    let mut moved = 0;
    for index in 0..layout.shnum {
        let sh: &mut SectionHeader64<LE> = pod_at_mut(out, shoff + index * layout.shentsize, "section header")?;
        let offset = sh.sh_offset.get(LE);
        if sh.sh_type.get(LE) != SHT_NOBITS && offset >= split && sh.sh_size.get(LE) > 0 {
            sh.sh_offset.set(LE, offset + len);
            moved += 1;
        }
    }
    debug!("wrote 0x{:x} zero-fill bytes at 0x{:x}; moved {} section(s)", len, split, moved);
    Ok(())
}

/// The note region sits at end of file, past everything else the headers reference.
fn is_trailing_blob(layout: &ElfLayout, note_index: usize, file_len: u64) -> bool {
    let note = &layout.phdrs[note_index];
    if note.filesz == 0 || note.file_end() != file_len {
        return false;
    }
    let table_end = layout.phdrs_end();
    let others_end = layout
        .phdrs
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != note_index)
        .map(|(_, ph)| ph.file_end())
        .chain([table_end, layout.shdrs_end])
        .max()
        .unwrap_or(0);
    note.offset >= others_end
}

/// Notes in the reuse target (the last `PT_NOTE`), plus its file range.
pub fn read_notes(image: &[u8]) -> Result<(Range<u64>, Vec<NoteRecord<'_>>)> {
    let layout = ElfLayout::parse(image)?;
    let note_index = layout
        .last_of_type(PT_NOTE)
        .ok_or_else(|| invalid_format("ELF has no PT_NOTE segment"))?;
    let ph = layout.phdrs[note_index];
    let region = layout.note_region(image, note_index)?;
    Ok((ph.offset..ph.file_end(), parse_notes(region)))
}

fn find_note<'a>(image: &'a [u8], name: &str) -> Result<Option<&'a [u8]>> {
    let layout = ElfLayout::parse(image)?;
    // Later entries win; the reuse target is the last PT_NOTE.
    for (index, ph) in layout.phdrs.iter().enumerate().rev() {
        if ph.p_type != PT_NOTE {
            continue;
        }
        let region = layout.note_region(image, index)?;
        if let Some(note) = parse_notes(region).into_iter().find(|n| n.name == name.as_bytes()) {
            return Ok(Some(note.desc));
        }
    }
    Ok(None)
}

fn find_section<'a>(image: &'a [u8], name: &str) -> Option<&'a [u8]> {
    let file = ElfFile64::<LE>::parse(image).ok()?;
    let section = file.section_by_name(name)?;
    section.data().ok()
}

pub struct ElfBackend;

impl Backend for ElfBackend {
    fn format(&self) -> Format {
        Format::Elf
    }

    fn inject(&self, image: Vec<u8>, batch: &InjectBatch) -> Result<Vec<u8>> {
        let entries = batch.entries();
        let notes: Vec<NewNote> = entries
            .iter()
            .map(|(resource, desc)| NewNote {
                name: resource.note_name(),
                desc,
            })
            .collect();

        let reinjection = find_note(&image, Resource::Sea.note_name())?.is_some();
        let flip = batch.sea.is_some() && !reinjection;
        if reinjection {
            info!("existing {} note found; replacing it and leaving the fuse alone", Resource::Sea.note_name());
        }

        let (out, report) = reuse_ptnote(&image, &notes, ReuseOptions::default(), |data| {
            if flip {
                fuse::flip(data);
            }
        })?;
        info!(
            "wrote {} note(s) at 0x{:x} (vaddr 0x{:x}, {} bytes{})",
            notes.len() + report.preserved,
            report.note_offset,
            report.note_vaddr,
            report.notes_len,
            if report.load_extended { ", mapped" } else { "" }
        );
        Ok(out)
    }

    fn embed_container(&self, image: Vec<u8>, container: &[u8]) -> Result<Vec<u8>> {
        let note = NewNote {
            name: PRESSED_NOTE_NAME,
            desc: container,
        };
        let options = ReuseOptions {
            load_policy: LoadPolicy::Never,
            reclaim_trailing: true,
        };
        let (out, report) = reuse_ptnote(&image, &[note], options, |_| {})?;
        if report.preserved == 0 {
            warn!("no notes preserved from the stub's PT_NOTE; build-id is gone");
        }
        info!(
            "embedded {} byte container in note {:?} at 0x{:x}",
            container.len(),
            PRESSED_NOTE_NAME,
            report.note_offset
        );
        Ok(out)
    }

    fn find<'a>(&self, image: &'a [u8], resource: Resource) -> Result<Option<(String, &'a [u8])>> {
        let name = resource.note_name();
        if let Some(desc) = find_note(image, name)? {
            return Ok(Some((format!("PT_NOTE {}", name), desc)));
        }
        if resource == Resource::Pressed {
            if let Some(data) = find_section(image, PRESSED_SECTION_NAME) {
                return Ok(Some((format!("section {}", PRESSED_SECTION_NAME), data)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_records_are_aligned() {
        let mut out = Vec::new();
        build_note(&mut out, "GNU", 3, &[1, 2, 3, 4, 5]);
        // 12 header + 4 name + 8 desc
        assert_eq!(out.len(), 24);
        assert_eq!(&out[..12], &[4, 0, 0, 0, 5, 0, 0, 0, 3, 0, 0, 0]);
        assert_eq!(&out[12..16], b"GNU\0");
        assert_eq!(&out[16..24], &[1, 2, 3, 4, 5, 0, 0, 0]);

        let parsed = parse_notes(&out);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, b"GNU");
        assert_eq!(parsed[0].note_type, 3);
        assert_eq!(parsed[0].desc, &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn parse_stops_at_overrun() {
        let mut out = Vec::new();
        build_note(&mut out, "A", 0, b"1234");
        build_note(&mut out, "B", 0, b"5678");
        // Chop into the second record.
        let parsed = parse_notes(&out[..out.len() - 2]);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, b"A");
    }

    #[test]
    fn rejects_non_elf() {
        assert!(reuse_ptnote(b"MZ not an elf at all, but long enough to hold a header.......", &[], ReuseOptions::default(), |_| {}).is_err());
    }
}
