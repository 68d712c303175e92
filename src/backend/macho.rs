//! Mach-O backend.
//!
//! Payload segments are placed directly in front of `__LINKEDIT`, which always
//! stays the last segment. Inserting one means:
//!
//! - writing a new `LC_SEGMENT_64` into the header padding, just before the
//!   `__LINKEDIT` load command;
//! - inserting the segment's page-aligned contents at `__LINKEDIT`'s old file offset;
//! - sliding `__LINKEDIT` up in both file and VM space, along with every load command
//!   field that points into it.
//!
//! Removal is the exact inverse and is how existing payload segments get resized:
//! always remove and recreate, never grow in place. The code signature is dropped
//! after all segment edits; signing again is the [`Signer`](crate::signer::Signer)'s job.
//!
//! Chained fixups are left as they are: `seg_count` may be smaller than the number
//! of segments as long as the uncovered segments carry no fixups. Segment indexes
//! from the edit point on shift by one, so every per-segment start from there on
//! must be empty; [`check_chained_fixups`] refuses the edit otherwise.

use anyhow::{Context, Result};
use object::endian::{U32, U64};
use object::macho::{
    DyldInfoCommand, DysymtabCommand, LinkeditDataCommand, MachHeader64, Section64, SegmentCommand64, SymtabCommand,
    CPU_TYPE_ARM64, FAT_CIGAM, FAT_MAGIC, LC_CODE_SIGNATURE, LC_DATA_IN_CODE, LC_DYLD_CHAINED_FIXUPS,
    LC_DYLD_EXPORTS_TRIE, LC_DYLD_INFO, LC_DYLD_INFO_ONLY, LC_DYLIB_CODE_SIGN_DRS, LC_DYSYMTAB, LC_FUNCTION_STARTS,
    LC_LINKER_OPTIMIZATION_HINT, LC_NOTE, LC_SEGMENT_64, LC_SEGMENT_SPLIT_INFO, LC_SYMTAB, MH_CIGAM, MH_CIGAM_64,
    MH_MAGIC, MH_MAGIC_64, SECTION_TYPE, S_GB_ZEROFILL, S_REGULAR, S_THREAD_LOCAL_ZEROFILL, S_ZEROFILL,
    VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE,
};
use object::pod::bytes_of;
use object::read::macho::MachOFile64;
use object::{LittleEndian as LE, Object, ObjectSection};
use std::mem::size_of;
use std::ops::Range;
use tracing::{debug, info};

use super::{Backend, InjectBatch, Resource};
use crate::error::invalid_format;
use crate::format::Format;
use crate::fuse::{self, FuseState};
use crate::utils::{align_up, bytes_at, fixed_name, pod_at, pod_at_mut, read_u32, read_u64, trim_name, write_u64};

const HEADER_SIZE: u64 = size_of::<MachHeader64<LE>>() as u64;
const SEGMENT_CMD_SIZE: u64 = size_of::<SegmentCommand64<LE>>() as u64;
const SECTION_SIZE: u64 = size_of::<Section64<LE>>() as u64;

const MAX_NCMDS: u32 = 10_000;
const MIN_CMDSIZE: u32 = 8;
const MAX_CMDSIZE: u32 = 65_536;

const LINKEDIT: &str = "__LINKEDIT";
/// Segments this tool creates. Only these may be moved to close a gap.
const PAYLOAD_SEGMENTS: [&str; 2] = ["SMOL", "NODE_SEA"];
/// log2 of section alignment for payload sections.
const PAYLOAD_SECTION_ALIGN: u32 = 2;

/// Copied-out section header.
#[derive(Debug, Clone)]
struct SectionInfo {
    header_offset: u64,
    name: [u8; 16],
    addr: u64,
    size: u64,
    offset: u32,
    flags: u32,
}

impl SectionInfo {
    fn has_file_data(&self) -> bool {
        let kind = self.flags & SECTION_TYPE;
        self.offset != 0 && kind != S_ZEROFILL && kind != S_GB_ZEROFILL && kind != S_THREAD_LOCAL_ZEROFILL
    }

    fn file_range(&self) -> Range<usize> {
        self.offset as usize..(self.offset as u64 + self.size) as usize
    }
}

/// Copied-out segment command.
#[derive(Debug, Clone)]
struct SegmentInfo {
    cmd_index: usize,
    name: [u8; 16],
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    sections: Vec<SectionInfo>,
}

impl SegmentInfo {
    fn is(&self, name: &str) -> bool {
        trim_name(&self.name) == name.as_bytes()
    }

    fn display_name(&self) -> String {
        String::from_utf8_lossy(trim_name(&self.name)).into_owned()
    }
}

#[derive(Debug, Clone, Copy)]
struct LoadCmd {
    offset: u64,
    cmd: u32,
    cmdsize: u32,
}

/// Validated header, load commands and segments of a thin 64-bit Mach-O.
struct MachOLayout {
    cputype: u32,
    sizeofcmds: u64,
    commands: Vec<LoadCmd>,
    segments: Vec<SegmentInfo>,
}

impl MachOLayout {
    fn parse(image: &[u8]) -> Result<Self> {
        let magic = read_u32(image, 0)?;
        match magic {
            MH_MAGIC_64 => {}
            FAT_MAGIC | FAT_CIGAM => {
                return Err(invalid_format(
                    "fat Mach-O binaries are not supported; extract one slice with `lipo -thin <arch>` first",
                ))
            }
            MH_MAGIC | MH_CIGAM => return Err(invalid_format("32-bit Mach-O binaries are not supported")),
            MH_CIGAM_64 => return Err(invalid_format("big-endian Mach-O binaries are not supported")),
            other => return Err(invalid_format(format!("bad Mach-O magic 0x{:08x}", other))),
        }

        let header: &MachHeader64<LE> = pod_at(image, 0, "Mach-O header")?;
        let ncmds = header.ncmds.get(LE);
        let sizeofcmds = header.sizeofcmds.get(LE) as u64;
        if ncmds > MAX_NCMDS {
            return Err(invalid_format(format!("{} load commands (limit {})", ncmds, MAX_NCMDS)));
        }
        let commands_end = HEADER_SIZE + sizeofcmds;
        if commands_end > image.len() as u64 {
            return Err(invalid_format("load commands run past end of file"));
        }

        let mut commands = Vec::with_capacity(ncmds as usize);
        let mut segments = Vec::new();
        let mut offset = HEADER_SIZE;
        for index in 0..ncmds as usize {
            let cmd = read_u32(image, offset)?;
            let cmdsize = read_u32(image, offset + 4)?;
            if !(MIN_CMDSIZE..=MAX_CMDSIZE).contains(&cmdsize) {
                return Err(invalid_format(format!("load command {} has size {}", index, cmdsize)));
            }
            if offset + cmdsize as u64 > commands_end {
                return Err(invalid_format(format!("load command {} overruns sizeofcmds", index)));
            }
            if cmd == LC_SEGMENT_64 {
                segments.push(Self::parse_segment(image, offset, cmdsize, index)?);
            }
            commands.push(LoadCmd { offset, cmd, cmdsize });
            offset += cmdsize as u64;
        }

        Ok(Self {
            cputype: header.cputype.get(LE),
            sizeofcmds,
            commands,
            segments,
        })
    }

    fn parse_segment(image: &[u8], offset: u64, cmdsize: u32, cmd_index: usize) -> Result<SegmentInfo> {
        let seg: &SegmentCommand64<LE> = pod_at(image, offset, "segment command")?;
        let nsects = seg.nsects.get(LE) as u64;
        if SEGMENT_CMD_SIZE + nsects * SECTION_SIZE > cmdsize as u64 {
            return Err(invalid_format(format!("segment command at 0x{:x} claims {} sections", offset, nsects)));
        }
        let mut sections = Vec::with_capacity(nsects as usize);
        for i in 0..nsects {
            let header_offset = offset + SEGMENT_CMD_SIZE + i * SECTION_SIZE;
            let sect: &Section64<LE> = pod_at(image, header_offset, "section header")?;
            sections.push(SectionInfo {
                header_offset,
                name: sect.sectname,
                addr: sect.addr.get(LE),
                size: sect.size.get(LE),
                offset: sect.offset.get(LE),
                flags: sect.flags.get(LE),
            });
        }
        Ok(SegmentInfo {
            cmd_index,
            name: seg.segname,
            vmaddr: seg.vmaddr.get(LE),
            vmsize: seg.vmsize.get(LE),
            fileoff: seg.fileoff.get(LE),
            filesize: seg.filesize.get(LE),
            sections,
        })
    }

    fn commands_end(&self) -> u64 {
        HEADER_SIZE + self.sizeofcmds
    }

    fn page_size(&self) -> u64 {
        if self.cputype == CPU_TYPE_ARM64 {
            0x4000
        } else {
            0x1000
        }
    }

    fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segments.iter().find(|s| s.is(name))
    }

    /// `__LINKEDIT`, checked to be the last segment in file, VM and command order.
    fn linkedit(&self) -> Result<&SegmentInfo> {
        let linkedit = self
            .segment(LINKEDIT)
            .ok_or_else(|| invalid_format("Mach-O has no __LINKEDIT segment"))?;
        for seg in &self.segments {
            if seg.is(LINKEDIT) {
                continue;
            }
            if seg.cmd_index > linkedit.cmd_index
                || seg.vmaddr >= linkedit.vmaddr
                || (seg.filesize > 0 && seg.fileoff >= linkedit.fileoff)
            {
                return Err(invalid_format(format!("segment {} comes after __LINKEDIT", seg.display_name())));
            }
        }
        Ok(linkedit)
    }

    /// First file offset holding segment content; load commands must end before it.
    fn first_content_offset(&self, file_len: u64) -> u64 {
        let sections = self
            .segments
            .iter()
            .flat_map(|s| &s.sections)
            .filter(|s| s.has_file_data() && s.size > 0)
            .map(|s| s.offset as u64);
        let segments = self
            .segments
            .iter()
            .filter(|s| s.filesize > 0 && s.fileoff > 0)
            .map(|s| s.fileoff);
        sections.chain(segments).min().unwrap_or(file_len)
    }

    /// File ranges of every section with contents, for the fuse scan.
    fn section_ranges(&self) -> Vec<Range<usize>> {
        self.segments
            .iter()
            .flat_map(|s| &s.sections)
            .filter(|s| s.has_file_data())
            .map(SectionInfo::file_range)
            .collect()
    }

    fn find_command(&self, cmd: u32) -> Option<LoadCmd> {
        self.commands.iter().copied().find(|c| c.cmd == cmd)
    }
}

fn shift32(field: &mut U32<LE>, threshold: u64, delta: i64) -> Result<()> {
    let value = field.get(LE) as u64;
    if value == 0 || value < threshold {
        return Ok(());
    }
    let shifted = value as i64 + delta;
    if shifted < 0 || shifted > u32::MAX as i64 {
        return Err(invalid_format(format!("linkedit offset 0x{:x} cannot move by {}", value, delta)));
    }
    field.set(LE, shifted as u32);
    Ok(())
}

/// Move every load-command file offset at or past `threshold` by `delta`.
fn shift_linkedit_offsets(image: &mut [u8], layout: &MachOLayout, threshold: u64, delta: i64) -> Result<()> {
    for lc in &layout.commands {
        match lc.cmd {
            LC_SYMTAB => {
                let c: &mut SymtabCommand<LE> = pod_at_mut(image, lc.offset, "LC_SYMTAB")?;
                shift32(&mut c.symoff, threshold, delta)?;
                shift32(&mut c.stroff, threshold, delta)?;
            }
            LC_DYSYMTAB => {
                let c: &mut DysymtabCommand<LE> = pod_at_mut(image, lc.offset, "LC_DYSYMTAB")?;
                shift32(&mut c.tocoff, threshold, delta)?;
                shift32(&mut c.modtaboff, threshold, delta)?;
                shift32(&mut c.extrefsymoff, threshold, delta)?;
                shift32(&mut c.indirectsymoff, threshold, delta)?;
                shift32(&mut c.extreloff, threshold, delta)?;
                shift32(&mut c.locreloff, threshold, delta)?;
            }
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                let c: &mut DyldInfoCommand<LE> = pod_at_mut(image, lc.offset, "LC_DYLD_INFO")?;
                shift32(&mut c.rebase_off, threshold, delta)?;
                shift32(&mut c.bind_off, threshold, delta)?;
                shift32(&mut c.weak_bind_off, threshold, delta)?;
                shift32(&mut c.lazy_bind_off, threshold, delta)?;
                shift32(&mut c.export_off, threshold, delta)?;
            }
            LC_CODE_SIGNATURE
            | LC_SEGMENT_SPLIT_INFO
            | LC_FUNCTION_STARTS
            | LC_DATA_IN_CODE
            | LC_DYLIB_CODE_SIGN_DRS
            | LC_LINKER_OPTIMIZATION_HINT
            | LC_DYLD_EXPORTS_TRIE
            | LC_DYLD_CHAINED_FIXUPS => {
                let c: &mut LinkeditDataCommand<LE> = pod_at_mut(image, lc.offset, "linkedit data command")?;
                shift32(&mut c.dataoff, threshold, delta)?;
            }
            LC_NOTE => {
                // note_command: cmd, cmdsize, data_owner[16], offset u64, size u64
                let at = lc.offset + 24;
                let value = read_u64(image, at)?;
                if value != 0 && value >= threshold {
                    write_u64(image, at, (value as i64 + delta) as u64)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Move a segment and its sections by the given file and VM deltas.
fn shift_segment(image: &mut [u8], layout: &MachOLayout, seg: &SegmentInfo, file_delta: i64, vm_delta: i64) -> Result<()> {
    let cmd = layout.commands[seg.cmd_index];
    let s: &mut SegmentCommand64<LE> = pod_at_mut(image, cmd.offset, "segment command")?;
    s.fileoff.set(LE, (seg.fileoff as i64 + file_delta) as u64);
    s.vmaddr.set(LE, (seg.vmaddr as i64 + vm_delta) as u64);
    for sect in &seg.sections {
        let h: &mut Section64<LE> = pod_at_mut(image, sect.header_offset, "section header")?;
        if sect.offset != 0 {
            h.offset.set(LE, (sect.offset as i64 + file_delta) as u32);
        }
        h.addr.set(LE, (sect.addr as i64 + vm_delta) as u64);
    }
    Ok(())
}

fn set_command_totals(image: &mut [u8], ncmds_delta: i64, size_delta: i64) -> Result<()> {
    let header: &mut MachHeader64<LE> = pod_at_mut(image, 0, "Mach-O header")?;
    let ncmds = header.ncmds.get(LE) as i64 + ncmds_delta;
    let sizeofcmds = header.sizeofcmds.get(LE) as i64 + size_delta;
    header.ncmds.set(LE, ncmds as u32);
    header.sizeofcmds.set(LE, sizeofcmds as u32);
    Ok(())
}

/// Cut one load command out of the command area, zeroing the freed tail.
fn remove_command(image: &mut [u8], commands_end: u64, cmd: LoadCmd) -> Result<()> {
    let start = cmd.offset as usize;
    let size = cmd.cmdsize as usize;
    let end = commands_end as usize;
    bytes_at(image, cmd.offset, (end - start) as u64, "load commands")?;
    image.copy_within(start + size..end, start);
    image[end - size..end].fill(0);
    set_command_totals(image, -1, -(size as i64))
}

/// Insert a load command at `at`, using header padding. Room must already be checked.
fn insert_command(image: &mut [u8], commands_end: u64, at: u64, bytes: &[u8]) -> Result<()> {
    let at = at as usize;
    let end = commands_end as usize;
    bytes_at(image, at as u64, (end - at + bytes.len()) as u64, "load command padding")?;
    image.copy_within(at..end, at + bytes.len());
    image[at..at + bytes.len()].copy_from_slice(bytes);
    set_command_totals(image, 1, bytes.len() as i64)
}

/// `seg_info_offset` for each segment covered by `LC_DYLD_CHAINED_FIXUPS`.
fn chained_fixup_starts(image: &[u8], layout: &MachOLayout) -> Result<Option<Vec<u32>>> {
    let Some(cmd) = layout.find_command(LC_DYLD_CHAINED_FIXUPS) else {
        return Ok(None);
    };
    let c: &LinkeditDataCommand<LE> = pod_at(image, cmd.offset, "LC_DYLD_CHAINED_FIXUPS")?;
    let blob = bytes_at(image, c.dataoff.get(LE) as u64, c.datasize.get(LE) as u64, "chained fixups")?;
    // dyld_chained_fixups_header.starts_offset -> dyld_chained_starts_in_image
    let starts = read_u32(blob, 4)? as u64;
    let seg_count = read_u32(blob, starts)? as u64;
    if seg_count > layout.segments.len() as u64 {
        return Err(invalid_format(format!(
            "chained fixups cover {} segments, image has {}",
            seg_count,
            layout.segments.len()
        )));
    }
    let offsets = (0..seg_count)
        .map(|i| read_u32(blob, starts + 4 + 4 * i))
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(offsets))
}

/// Segment indexes from `first` on are about to shift; none of them may carry
/// fixups, and `seg_count` must not end up above `segments_after`.
fn check_chained_fixups(image: &[u8], layout: &MachOLayout, first: usize, segments_after: usize) -> Result<()> {
    let Some(starts) = chained_fixup_starts(image, layout)? else {
        return Ok(());
    };
    if let Some(index) = starts.iter().skip(first).position(|&offset| offset != 0) {
        let name = layout.segments[first + index].display_name();
        return Err(invalid_format(format!(
            "segment {} has chained fixups and cannot change index",
            name
        )));
    }
    if starts.len() > segments_after {
        return Err(invalid_format(format!(
            "chained fixups cover {} segments, {} would remain",
            starts.len(),
            segments_after
        )));
    }
    debug!("chained fixups cover {} segment(s); unchanged", starts.len());
    Ok(())
}

/// One section of a segment to create.
#[derive(Debug, Clone)]
pub struct SectionSpec {
    pub name: String,
    pub data: Vec<u8>,
}

/// A segment to create in front of `__LINKEDIT`.
#[derive(Debug, Clone)]
pub struct SegmentSpec {
    pub name: String,
    /// Used for both `initprot` and `maxprot`.
    pub prot: u32,
    pub sections: Vec<SectionSpec>,
}

/// Append a segment right before `__LINKEDIT`.
pub fn add_segment(image: Vec<u8>, spec: &SegmentSpec) -> Result<Vec<u8>> {
    let layout = MachOLayout::parse(&image)?;
    if layout.segment(&spec.name).is_some() {
        return Err(invalid_format(format!("segment {} already exists", spec.name)));
    }
    let linkedit = layout.linkedit()?.clone();
    let page = layout.page_size();

    let cmdsize = SEGMENT_CMD_SIZE + spec.sections.len() as u64 * SECTION_SIZE;
    let room = layout.first_content_offset(image.len() as u64);
    if layout.commands_end() + cmdsize > room {
        return Err(invalid_format(format!(
            "not enough load command space for {} (need 0x{:x} bytes, 0x{:x} free); relink with -headerpad",
            spec.name,
            cmdsize,
            room.saturating_sub(layout.commands_end())
        )));
    }

    // Lay sections out back to back from the old __LINKEDIT position.
    let fileoff = linkedit.fileoff;
    let vmaddr = linkedit.vmaddr;
    let mut contents = Vec::new();
    let mut sections = Vec::with_capacity(spec.sections.len());
    for sect in &spec.sections {
        let rel = align_up(contents.len() as u64, 1 << PAYLOAD_SECTION_ALIGN);
        contents.resize(rel as usize, 0);
        contents.extend_from_slice(&sect.data);
        sections.push(Section64::<LE> {
            sectname: fixed_name(&sect.name)?,
            segname: fixed_name(&spec.name)?,
            addr: U64::new(LE, vmaddr + rel),
            size: U64::new(LE, sect.data.len() as u64),
            offset: U32::new(LE, (fileoff + rel) as u32),
            align: U32::new(LE, PAYLOAD_SECTION_ALIGN),
            reloff: U32::new(LE, 0),
            nreloc: U32::new(LE, 0),
            flags: U32::new(LE, S_REGULAR),
            reserved1: U32::new(LE, 0),
            reserved2: U32::new(LE, 0),
            reserved3: U32::new(LE, 0),
        });
    }
    let size = align_up((contents.len() as u64).max(1), page);
    contents.resize(size as usize, 0);
    if fileoff + size > u32::MAX as u64 {
        return Err(invalid_format("segment would push __LINKEDIT past 4 GiB"));
    }

    let segment = SegmentCommand64::<LE> {
        cmd: U32::new(LE, LC_SEGMENT_64),
        cmdsize: U32::new(LE, cmdsize as u32),
        segname: fixed_name(&spec.name)?,
        vmaddr: U64::new(LE, vmaddr),
        vmsize: U64::new(LE, size),
        fileoff: U64::new(LE, fileoff),
        filesize: U64::new(LE, size),
        maxprot: U32::new(LE, spec.prot),
        initprot: U32::new(LE, spec.prot),
        nsects: U32::new(LE, spec.sections.len() as u32),
        flags: U32::new(LE, 0),
    };
    let mut command = bytes_of(&segment).to_vec();
    for sect in &sections {
        command.extend_from_slice(bytes_of(sect));
    }

    let linkedit_index = layout
        .segments
        .iter()
        .position(|s| s.is(LINKEDIT))
        .unwrap_or(layout.segments.len());
    check_chained_fixups(&image, &layout, linkedit_index, layout.segments.len() + 1)?;

    let mut image = image;
    shift_linkedit_offsets(&mut image, &layout, linkedit.fileoff, size as i64)?;
    shift_segment(&mut image, &layout, &linkedit, size as i64, size as i64)?;
    let at = layout.commands[linkedit.cmd_index].offset;
    insert_command(&mut image, layout.commands_end(), at, &command)?;

    let tail = image.split_off(fileoff as usize);
    image.extend_from_slice(&contents);
    image.extend_from_slice(&tail);

    info!(
        "inserted segment {} at 0x{:x} (vmaddr 0x{:x}, 0x{:x} bytes, {} section(s))",
        spec.name,
        fileoff,
        vmaddr,
        size,
        spec.sections.len()
    );
    Ok(image)
}

/// Remove a payload segment and close the gap it leaves.
pub fn remove_segment(image: Vec<u8>, name: &str) -> Result<Vec<u8>> {
    if !PAYLOAD_SEGMENTS.contains(&name) {
        return Err(invalid_format(format!("refusing to remove non-payload segment {}", name)));
    }
    let layout = MachOLayout::parse(&image)?;
    let seg = layout
        .segment(name)
        .cloned()
        .ok_or_else(|| invalid_format(format!("segment {} not found", name)))?;
    layout.linkedit()?;

    let file_end = seg.fileoff + seg.filesize;
    let vm_end = seg.vmaddr + seg.vmsize;
    let followers: Vec<&SegmentInfo> = layout
        .segments
        .iter()
        .filter(|s| !s.is(name) && (s.vmaddr >= vm_end || (s.filesize > 0 && s.fileoff >= file_end)))
        .collect();
    for s in &followers {
        if !s.is(LINKEDIT) && !PAYLOAD_SEGMENTS.iter().any(|p| s.is(p)) {
            return Err(invalid_format(format!(
                "segment {} follows {}; refusing to move it",
                s.display_name(),
                name
            )));
        }
    }

    let index = layout
        .segments
        .iter()
        .position(|s| s.is(name))
        .unwrap_or(layout.segments.len());
    check_chained_fixups(&image, &layout, index, layout.segments.len() - 1)?;

    let file_delta = -(seg.filesize as i64);
    let vm_delta = -(seg.vmsize as i64);
    let mut image = image;
    shift_linkedit_offsets(&mut image, &layout, file_end, file_delta)?;
    for s in &followers {
        shift_segment(&mut image, &layout, s, file_delta, vm_delta)?;
    }
    remove_command(&mut image, layout.commands_end(), layout.commands[seg.cmd_index])?;

    bytes_at(&image, seg.fileoff, seg.filesize, "segment contents")?;
    image.drain(seg.fileoff as usize..file_end as usize);

    info!("removed segment {} (0x{:x} bytes)", name, seg.filesize);
    Ok(image)
}

/// Drop `LC_CODE_SIGNATURE`, truncating the signature blob when it ends the file.
///
/// Returns whether a signature was present.
pub fn remove_code_signature(image: Vec<u8>) -> Result<(Vec<u8>, bool)> {
    let layout = MachOLayout::parse(&image)?;
    let Some(cmd) = layout.find_command(LC_CODE_SIGNATURE) else {
        return Ok((image, false));
    };
    let sig: &LinkeditDataCommand<LE> = pod_at(&image, cmd.offset, "LC_CODE_SIGNATURE")?;
    let dataoff = sig.dataoff.get(LE) as u64;
    let datasize = sig.datasize.get(LE) as u64;
    let linkedit = layout.linkedit()?.clone();

    let mut image = image;
    remove_command(&mut image, layout.commands_end(), cmd)?;

    let linkedit_end = linkedit.fileoff + linkedit.filesize;
    if dataoff >= linkedit.fileoff && dataoff + datasize >= linkedit_end && linkedit_end == image.len() as u64 {
        let filesize = dataoff - linkedit.fileoff;
        // LC_CODE_SIGNATURE sat before __LINKEDIT's command, so it moved down by cmdsize.
        let seg_offset = layout.commands[linkedit.cmd_index].offset
            - if cmd.offset < layout.commands[linkedit.cmd_index].offset { cmd.cmdsize as u64 } else { 0 };
        let s: &mut SegmentCommand64<LE> = pod_at_mut(&mut image, seg_offset, "__LINKEDIT")?;
        s.filesize.set(LE, filesize);
        s.vmsize.set(LE, align_up(filesize, layout.page_size()));
        image.truncate(dataoff as usize);
        debug!("truncated 0x{:x} byte signature", datasize);
    }
    info!("removed code signature");
    Ok((image, true))
}

/// Section contents of an existing segment, for carrying forward across a rebuild.
fn section_contents(image: &[u8], layout: &MachOLayout, segment: &str) -> Result<Vec<SectionSpec>> {
    let Some(seg) = layout.segment(segment) else {
        return Ok(Vec::new());
    };
    seg.sections
        .iter()
        .map(|s| {
            let data = if s.has_file_data() {
                bytes_at(image, s.offset as u64, s.size, "section contents")?.to_vec()
            } else {
                Vec::new()
            };
            Ok(SectionSpec {
                name: String::from_utf8_lossy(trim_name(&s.name)).into_owned(),
                data,
            })
        })
        .collect()
}

/// Replace or create `segment` so it holds `updates`, keeping sections not named there.
fn rebuild_segment(image: Vec<u8>, segment: &str, prot: u32, updates: Vec<SectionSpec>) -> Result<Vec<u8>> {
    let layout = MachOLayout::parse(&image)?;
    let mut sections = section_contents(&image, &layout, segment)?;
    for update in updates {
        match sections.iter_mut().find(|s| s.name == update.name) {
            Some(existing) => existing.data = update.data,
            None => sections.push(update),
        }
    }

    let image = if layout.segment(segment).is_some() {
        remove_segment(image, segment)?
    } else {
        image
    };
    let spec = SegmentSpec {
        name: segment.to_string(),
        prot,
        sections,
    };
    add_segment(image, &spec)
}

pub struct MachOBackend;

impl Backend for MachOBackend {
    fn format(&self) -> Format {
        Format::MachO
    }

    fn inject(&self, image: Vec<u8>, batch: &InjectBatch) -> Result<Vec<u8>> {
        let (segment, _) = Resource::Sea.macho_location();
        let layout = MachOLayout::parse(&image)?;
        let reinjection = layout.segment(segment).is_some();

        let mut image = image;
        if reinjection {
            info!("{} segment exists; rebuilding it and leaving the fuse alone", segment);
        } else if batch.sea.is_some() {
            let ranges = layout.section_ranges();
            if fuse::flip_in_ranges(&mut image, &ranges) == FuseState::NotFound {
                debug!("no fuse in {} section(s)", ranges.len());
            }
        }

        let updates = batch
            .entries()
            .into_iter()
            .map(|(resource, data)| SectionSpec {
                name: resource.macho_location().1.to_string(),
                data: data.to_vec(),
            })
            .collect();
        let image = rebuild_segment(image, segment, VM_PROT_READ | VM_PROT_WRITE | VM_PROT_EXECUTE, updates)?;
        let (image, _) = remove_code_signature(image)?;
        Ok(image)
    }

    fn embed_container(&self, image: Vec<u8>, container: &[u8]) -> Result<Vec<u8>> {
        let (segment, section) = Resource::Pressed.macho_location();
        let layout = MachOLayout::parse(&image)?;
        let image = if layout.segment(segment).is_some() {
            remove_segment(image, segment)?
        } else {
            image
        };
        let spec = SegmentSpec {
            name: segment.to_string(),
            prot: VM_PROT_READ,
            sections: vec![SectionSpec {
                name: section.to_string(),
                data: container.to_vec(),
            }],
        };
        let image = add_segment(image, &spec)?;
        let (image, _) = remove_code_signature(image)?;
        Ok(image)
    }

    fn find<'a>(&self, image: &'a [u8], resource: Resource) -> Result<Option<(String, &'a [u8])>> {
        // Reject fat and 32-bit files with a useful message before handing off.
        MachOLayout::parse(image)?;
        let file = MachOFile64::<LE>::parse(image).context("failed to parse Mach-O")?;
        let (segment, section) = resource.macho_location();
        for sect in file.sections() {
            if sect.name().ok() != Some(section) || sect.segment_name().ok().flatten() != Some(segment) {
                continue;
            }
            let data = sect.data().context("failed to read Mach-O section")?;
            return Ok(Some((format!("{},{}", segment, section), data)));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_fat_and_32_bit() {
        let mut fat = vec![0u8; 64];
        fat[..4].copy_from_slice(&[0xca, 0xfe, 0xba, 0xbe]);
        let err = MachOLayout::parse(&fat).err().unwrap();
        assert!(err.to_string().contains("lipo"));

        let mut thin32 = vec![0u8; 64];
        thin32[..4].copy_from_slice(&MH_MAGIC.to_le_bytes());
        assert!(MachOLayout::parse(&thin32).is_err());
    }

    #[test]
    fn shift_skips_zero_and_low_offsets() {
        let mut field = U32::new(LE, 0);
        shift32(&mut field, 0x100, 0x40).unwrap();
        assert_eq!(field.get(LE), 0);

        let mut field = U32::new(LE, 0x80);
        shift32(&mut field, 0x100, 0x40).unwrap();
        assert_eq!(field.get(LE), 0x80);

        let mut field = U32::new(LE, 0x100);
        shift32(&mut field, 0x100, 0x40).unwrap();
        assert_eq!(field.get(LE), 0x140);

        let mut field = U32::new(LE, 0x140);
        shift32(&mut field, 0x100, -0x40).unwrap();
        assert_eq!(field.get(LE), 0x100);
    }
}
