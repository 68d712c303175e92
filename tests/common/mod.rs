//! Minimal executables built in memory for the integration tests.
//!
//! None of these run; they carry just enough structure for the backends and
//! for `object`'s parsers.

#![allow(dead_code)]

use object::elf::{
    FileHeader64, Ident, ProgramHeader64, SectionHeader64, ELFCLASS64, ELFDATA2LSB, ELFMAG, ELFOSABI_SYSV, EM_X86_64,
    ET_EXEC, EV_CURRENT, NT_GNU_BUILD_ID, PF_R, PF_X, PT_INTERP, PT_LOAD, PT_NOTE, SHT_PROGBITS, SHT_STRTAB,
};
use object::endian::{BigEndian, U16, U32, U64};
use object::macho::{
    LinkeditDataCommand, MachHeader64, Section64, SegmentCommand64, SymtabCommand, CPU_TYPE_ARM64, LC_CODE_SIGNATURE,
    LC_DYLD_CHAINED_FIXUPS, LC_SEGMENT_64, LC_SYMTAB, MH_CIGAM_64, MH_EXECUTE, S_CSTRING_LITERALS, S_REGULAR,
    VM_PROT_EXECUTE, VM_PROT_READ,
};
use object::pod::bytes_of;
use object::LittleEndian as LE;

use binject::fuse::sentinel;

fn put(buf: &mut Vec<u8>, offset: usize, bytes: &[u8]) {
    if buf.len() < offset + bytes.len() {
        buf.resize(offset + bytes.len(), 0);
    }
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn put_u16(buf: &mut Vec<u8>, offset: usize, value: u16) {
    put(buf, offset, &value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, offset: usize, value: u32) {
    put(buf, offset, &value.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, offset: usize, value: u64) {
    put(buf, offset, &value.to_le_bytes());
}

fn name16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

// ---------------------------------------------------------------------------
// ELF

pub const ELF_BASE: u64 = 0x400000;
pub const ELF_PHOFF: u64 = 64;
pub const ELF_BUILD_ID_OFFSET: usize = 0x200;
pub const ELF_TEXT_OFFSET: usize = 0x240;
pub const ELF_LOAD_END: usize = 0x300;
const INTERP: &[u8] = b"/lib64/ld-linux-x86-64.so.2\0";

#[derive(Debug, Clone, Default)]
pub struct ElfFixture {
    /// Adds `PT_INTERP`, which makes the image dynamically linked.
    pub dynamic: bool,
    /// Gives the last `PT_LOAD` a zero-fill tail.
    pub bss: u64,
    /// Adds a `.pressed_data` section holding these bytes.
    pub pressed_section: Option<Vec<u8>>,
}

impl ElfFixture {
    pub fn build(&self) -> Vec<u8> {
        let phnum = if self.dynamic { 3 } else { 2 };
        let mut image = vec![0u8; ELF_LOAD_END];

        let mut build_id = Vec::new();
        binject::backend::elf::build_note(&mut build_id, "GNU", NT_GNU_BUILD_ID, &[0xab; 20]);
        put(&mut image, ELF_BUILD_ID_OFFSET, &build_id);
        put(&mut image, ELF_TEXT_OFFSET, &sentinel());
        put(&mut image, 0x180, INTERP);

        let phdr = |p_type: u32, flags: u32, offset: u64, filesz: u64, memsz: u64, align: u64| ProgramHeader64::<LE> {
            p_type: U32::new(LE, p_type),
            p_flags: U32::new(LE, flags),
            p_offset: U64::new(LE, offset),
            p_vaddr: U64::new(LE, ELF_BASE + offset),
            p_paddr: U64::new(LE, ELF_BASE + offset),
            p_filesz: U64::new(LE, filesz),
            p_memsz: U64::new(LE, memsz),
            p_align: U64::new(LE, align),
        };
        let load_len = ELF_LOAD_END as u64;
        let mut phdrs = vec![
            phdr(PT_LOAD, PF_R | PF_X, 0, load_len, load_len + self.bss, 0x1000),
            phdr(PT_NOTE, PF_R, ELF_BUILD_ID_OFFSET as u64, build_id.len() as u64, build_id.len() as u64, 4),
        ];
        if self.dynamic {
            phdrs.insert(0, phdr(PT_INTERP, PF_R, 0x180, INTERP.len() as u64, INTERP.len() as u64, 1));
        }
        for (i, ph) in phdrs.iter().enumerate() {
            put(&mut image, ELF_PHOFF as usize + i * 56, bytes_of(ph));
        }

        let (shoff, shnum, shstrndx) = match &self.pressed_section {
            Some(data) => self.append_sections(&mut image, data),
            None => (0, 0, 0),
        };

        let header = FileHeader64::<LE> {
            e_ident: Ident {
                magic: ELFMAG,
                class: ELFCLASS64,
                data: ELFDATA2LSB,
                version: EV_CURRENT,
                os_abi: ELFOSABI_SYSV,
                abi_version: 0,
                padding: [0; 7],
            },
            e_type: U16::new(LE, ET_EXEC),
            e_machine: U16::new(LE, EM_X86_64),
            e_version: U32::new(LE, EV_CURRENT as u32),
            e_entry: U64::new(LE, ELF_BASE + ELF_TEXT_OFFSET as u64),
            e_phoff: U64::new(LE, ELF_PHOFF),
            e_shoff: U64::new(LE, shoff),
            e_flags: U32::new(LE, 0),
            e_ehsize: U16::new(LE, 64),
            e_phentsize: U16::new(LE, 56),
            e_phnum: U16::new(LE, phnum),
            e_shentsize: U16::new(LE, if shnum == 0 { 0 } else { 64 }),
            e_shnum: U16::new(LE, shnum),
            e_shstrndx: U16::new(LE, shstrndx),
        };
        put(&mut image, 0, bytes_of(&header));
        image
    }

    /// Null section, `.pressed_data`, `.shstrtab`; returns (shoff, shnum, shstrndx).
    fn append_sections(&self, image: &mut Vec<u8>, data: &[u8]) -> (u64, u16, u16) {
        let data_offset = image.len();
        image.extend_from_slice(data);
        let strtab_offset = image.len();
        let strtab = b"\0.pressed_data\0.shstrtab\0";
        image.extend_from_slice(strtab);
        image.resize((image.len() + 7) & !7, 0);
        let shoff = image.len();

        let section = |name: u32, sh_type: u32, offset: usize, size: usize| SectionHeader64::<LE> {
            sh_name: U32::new(LE, name),
            sh_type: U32::new(LE, sh_type),
            sh_flags: U64::new(LE, 0),
            sh_addr: U64::new(LE, 0),
            sh_offset: U64::new(LE, offset as u64),
            sh_size: U64::new(LE, size as u64),
            sh_link: U32::new(LE, 0),
            sh_info: U32::new(LE, 0),
            sh_addralign: U64::new(LE, 1),
            sh_entsize: U64::new(LE, 0),
        };
        let headers = [
            section(0, 0, 0, 0),
            section(1, SHT_PROGBITS, data_offset, data.len()),
            section(15, SHT_STRTAB, strtab_offset, strtab.len()),
        ];
        for header in &headers {
            image.extend_from_slice(bytes_of(header));
        }
        (shoff as u64, headers.len() as u16, 2)
    }
}

pub fn static_elf() -> Vec<u8> {
    ElfFixture::default().build()
}

pub fn dynamic_elf() -> Vec<u8> {
    ElfFixture {
        dynamic: true,
        ..Default::default()
    }
    .build()
}

// ---------------------------------------------------------------------------
// Mach-O

pub const MACHO_BASE: u64 = 0x1_0000_0000;
pub const MACHO_PAGE: u64 = 0x4000;
pub const MACHO_TEXT_OFFSET: u64 = 0x1000;
pub const MACHO_CSTRING_OFFSET: u64 = 0x1040;
pub const MACHO_LINKEDIT_OFFSET: u64 = 0x4000;

/// Size of the chained fixups blob [`macho_with_chained_fixups`] puts after the string table.
pub const MACHO_FIXUPS_LEN: u64 = 0x30;

/// A thin arm64 executable: `__TEXT` (with `__text` and `__cstring`), `__LINKEDIT`,
/// `LC_SYMTAB`, and optionally an `LC_CODE_SIGNATURE` blob at the end of the file.
pub fn macho_image(signed: bool) -> Vec<u8> {
    build_macho(signed, None)
}

/// Unsigned, with `LC_DYLD_CHAINED_FIXUPS` covering `__TEXT` (no fixups) and
/// `__LINKEDIT`, whose `seg_info_offset` is `linkedit_starts`.
pub fn macho_with_chained_fixups(linkedit_starts: u32) -> Vec<u8> {
    build_macho(false, Some(linkedit_starts))
}

fn build_macho(signed: bool, chained_fixups: Option<u32>) -> Vec<u8> {
    let fixups_len = if chained_fixups.is_some() { MACHO_FIXUPS_LEN } else { 0 };
    let signature_offset = MACHO_LINKEDIT_OFFSET + 0x20 + fixups_len;
    let linkedit_len: u64 = 0x20 + fixups_len + if signed { 0x20 } else { 0 };
    let mut image = vec![0u8; (MACHO_LINKEDIT_OFFSET + linkedit_len) as usize];

    let section = |name: &str, offset: u64, size: u64, flags: u32| Section64::<LE> {
        sectname: name16(name),
        segname: name16("__TEXT"),
        addr: U64::new(LE, MACHO_BASE + offset),
        size: U64::new(LE, size),
        offset: U32::new(LE, offset as u32),
        align: U32::new(LE, 2),
        reloff: U32::new(LE, 0),
        nreloc: U32::new(LE, 0),
        flags: U32::new(LE, flags),
        reserved1: U32::new(LE, 0),
        reserved2: U32::new(LE, 0),
        reserved3: U32::new(LE, 0),
    };
    let segment = |name: &str, vmaddr: u64, fileoff: u64, filesize: u64, prot: u32, nsects: u32| SegmentCommand64::<LE> {
        cmd: U32::new(LE, LC_SEGMENT_64),
        cmdsize: U32::new(LE, 72 + 80 * nsects),
        segname: name16(name),
        vmaddr: U64::new(LE, vmaddr),
        vmsize: U64::new(LE, (filesize + MACHO_PAGE - 1) & !(MACHO_PAGE - 1)),
        fileoff: U64::new(LE, fileoff),
        filesize: U64::new(LE, filesize),
        maxprot: U32::new(LE, prot),
        initprot: U32::new(LE, prot),
        nsects: U32::new(LE, nsects),
        flags: U32::new(LE, 0),
    };

    let mut commands = Vec::new();
    commands.extend_from_slice(bytes_of(&segment(
        "__TEXT",
        MACHO_BASE,
        0,
        MACHO_LINKEDIT_OFFSET,
        VM_PROT_READ | VM_PROT_EXECUTE,
        2,
    )));
    commands.extend_from_slice(bytes_of(&section("__text", MACHO_TEXT_OFFSET, 0x40, S_REGULAR)));
    commands.extend_from_slice(bytes_of(&section("__cstring", MACHO_CSTRING_OFFSET, 0x40, S_CSTRING_LITERALS)));
    commands.extend_from_slice(bytes_of(&segment(
        "__LINKEDIT",
        MACHO_BASE + MACHO_LINKEDIT_OFFSET,
        MACHO_LINKEDIT_OFFSET,
        linkedit_len,
        VM_PROT_READ,
        0,
    )));
    let symtab = SymtabCommand::<LE> {
        cmd: U32::new(LE, LC_SYMTAB),
        cmdsize: U32::new(LE, 24),
        symoff: U32::new(LE, MACHO_LINKEDIT_OFFSET as u32),
        nsyms: U32::new(LE, 1),
        stroff: U32::new(LE, MACHO_LINKEDIT_OFFSET as u32 + 0x10),
        strsize: U32::new(LE, 0x10),
    };
    commands.extend_from_slice(bytes_of(&symtab));
    let mut ncmds = 3;
    if let Some(linkedit_starts) = chained_fixups {
        let fixups = LinkeditDataCommand::<LE> {
            cmd: U32::new(LE, LC_DYLD_CHAINED_FIXUPS),
            cmdsize: U32::new(LE, 16),
            dataoff: U32::new(LE, MACHO_LINKEDIT_OFFSET as u32 + 0x20),
            datasize: U32::new(LE, MACHO_FIXUPS_LEN as u32),
        };
        commands.extend_from_slice(bytes_of(&fixups));
        ncmds += 1;

        // dyld_chained_fixups_header, then dyld_chained_starts_in_image at +0x20.
        let blob = (MACHO_LINKEDIT_OFFSET + 0x20) as usize;
        put_u32(&mut image, blob + 4, 0x20);
        put_u32(&mut image, blob + 8, 0x2c);
        put_u32(&mut image, blob + 12, 0x2c);
        put_u32(&mut image, blob + 20, 1);
        put_u32(&mut image, blob + 0x20, 2);
        put_u32(&mut image, blob + 0x28, linkedit_starts);
    }
    if signed {
        let signature = LinkeditDataCommand::<LE> {
            cmd: U32::new(LE, LC_CODE_SIGNATURE),
            cmdsize: U32::new(LE, 16),
            dataoff: U32::new(LE, signature_offset as u32),
            datasize: U32::new(LE, 0x20),
        };
        commands.extend_from_slice(bytes_of(&signature));
        ncmds += 1;
        put(&mut image, signature_offset as usize, &[0xfa, 0xde, 0x0c, 0xc0]);
    }

    let header = MachHeader64::<LE> {
        // The magic field is declared big-endian; this stores CF FA ED FE.
        magic: U32::new(BigEndian, MH_CIGAM_64),
        cputype: U32::new(LE, CPU_TYPE_ARM64),
        cpusubtype: U32::new(LE, 0),
        filetype: U32::new(LE, MH_EXECUTE),
        ncmds: U32::new(LE, ncmds),
        sizeofcmds: U32::new(LE, commands.len() as u32),
        flags: U32::new(LE, 0),
        reserved: U32::new(LE, 0),
    };
    put(&mut image, 0, bytes_of(&header));
    put(&mut image, 32, &commands);
    put(&mut image, MACHO_TEXT_OFFSET as usize, &[0x1f, 0x20, 0x03, 0xd5]);
    put(&mut image, MACHO_CSTRING_OFFSET as usize, &sentinel());
    // String table: index 0 is the empty string, then "_main".
    put(&mut image, (MACHO_LINKEDIT_OFFSET + 0x11) as usize, b"_main\0");
    image
}

/// A fat header; backends must refuse it.
pub fn fat_macho() -> Vec<u8> {
    let mut image = vec![0u8; 0x1000];
    put(&mut image, 0, &[0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 1]);
    image
}

// ---------------------------------------------------------------------------
// PE

pub const PE_NT_OFFSET: usize = 0x80;
pub const PE_OPT_OFFSET: usize = PE_NT_OFFSET + 24;
pub const PE_SECTION_TABLE: usize = PE_OPT_OFFSET + 240;
pub const PE_SECTION_ALIGNMENT: u32 = 0x1000;
pub const PE_FILE_ALIGNMENT: u32 = 0x200;
pub const PE_HEADERS_SIZE: u32 = 0x400;
const RT_RCDATA: u32 = 10;

#[derive(Debug, Clone, Default)]
pub struct PeFixture {
    /// Appends a fake certificate table and points the security directory at it.
    pub certificate: bool,
    /// Adds an `.rsrc` section with `RT_RCDATA/<name>` holding these bytes.
    pub rcdata: Option<(String, Vec<u8>)>,
}

struct PeSection {
    name: &'static [u8],
    va: u32,
    vsize: u32,
    raw: u32,
    raw_size: u32,
}

impl PeFixture {
    pub fn build(&self) -> Vec<u8> {
        let mut image = vec![0u8; PE_HEADERS_SIZE as usize];
        put(&mut image, 0, b"MZ");
        put_u32(&mut image, 0x3c, PE_NT_OFFSET as u32);
        put(&mut image, PE_NT_OFFSET, b"PE\0\0");

        // .text with the fuse in it.
        let mut sections = vec![PeSection {
            name: b".text",
            va: 0x1000,
            vsize: 0x100,
            raw: PE_HEADERS_SIZE,
            raw_size: PE_FILE_ALIGNMENT,
        }];
        image.resize((PE_HEADERS_SIZE + PE_FILE_ALIGNMENT) as usize, 0);
        put(&mut image, PE_HEADERS_SIZE as usize + 0x10, &sentinel());

        let mut resource_dir = None;
        if let Some((name, data)) = &self.rcdata {
            let va = 0x2000;
            let raw = image.len() as u32;
            let rsrc = resource_section(va, name, data);
            let raw_size = (rsrc.len() as u32 + PE_FILE_ALIGNMENT - 1) & !(PE_FILE_ALIGNMENT - 1);
            image.extend_from_slice(&rsrc);
            image.resize((raw + raw_size) as usize, 0);
            sections.push(PeSection {
                name: b".rsrc",
                va,
                vsize: rsrc.len() as u32,
                raw,
                raw_size,
            });
            resource_dir = Some((va, rsrc.len() as u32));
        }

        // COFF file header.
        let fh = PE_NT_OFFSET + 4;
        put_u16(&mut image, fh, 0x8664);
        put_u16(&mut image, fh + 2, sections.len() as u16);
        put_u16(&mut image, fh + 16, 240);
        put_u16(&mut image, fh + 18, 0x0022);

        // PE32+ optional header.
        let opt = PE_OPT_OFFSET;
        let last = &sections[sections.len() - 1];
        let size_of_image = (last.va + last.vsize + PE_SECTION_ALIGNMENT - 1) & !(PE_SECTION_ALIGNMENT - 1);
        put_u16(&mut image, opt, 0x20b);
        put_u32(&mut image, opt + 16, 0x1000);
        put_u64(&mut image, opt + 24, 0x1_4000_0000);
        put_u32(&mut image, opt + 32, PE_SECTION_ALIGNMENT);
        put_u32(&mut image, opt + 36, PE_FILE_ALIGNMENT);
        put_u32(&mut image, opt + 56, size_of_image);
        put_u32(&mut image, opt + 60, PE_HEADERS_SIZE);
        put_u16(&mut image, opt + 68, 3);
        put_u32(&mut image, opt + 108, 16);
        if let Some((va, size)) = resource_dir {
            put_u32(&mut image, opt + 112 + 2 * 8, va);
            put_u32(&mut image, opt + 112 + 2 * 8 + 4, size);
        }

        for (i, s) in sections.iter().enumerate() {
            let at = PE_SECTION_TABLE + i * 40;
            put(&mut image, at, s.name);
            put_u32(&mut image, at + 8, s.vsize);
            put_u32(&mut image, at + 12, s.va);
            put_u32(&mut image, at + 16, s.raw_size);
            put_u32(&mut image, at + 20, s.raw);
            put_u32(&mut image, at + 36, 0x6000_0020);
        }

        if self.certificate {
            let offset = image.len() as u32;
            image.extend_from_slice(&[0x5a; 0x20]);
            put_u32(&mut image, opt + 112 + 4 * 8, offset);
            put_u32(&mut image, opt + 112 + 4 * 8 + 4, 0x20);
        }
        image
    }
}

pub fn pe_image() -> Vec<u8> {
    PeFixture::default().build()
}

/// `.rsrc` contents: root -> RT_RCDATA -> `name` -> language 0x409 -> data.
fn resource_section(va: u32, name: &str, data: &[u8]) -> Vec<u8> {
    const SUBDIR: u32 = 0x8000_0000;
    let mut rsrc = Vec::new();
    let dir = |rsrc: &mut Vec<u8>, at: usize, named: u16, ids: u16| {
        put_u16(rsrc, at + 12, named);
        put_u16(rsrc, at + 14, ids);
    };

    // Root directory with one id entry.
    dir(&mut rsrc, 0x00, 0, 1);
    put_u32(&mut rsrc, 0x10, RT_RCDATA);
    put_u32(&mut rsrc, 0x14, SUBDIR | 0x18);
    // Type directory with one named entry.
    dir(&mut rsrc, 0x18, 1, 0);
    put_u32(&mut rsrc, 0x28, SUBDIR | 0x58);
    put_u32(&mut rsrc, 0x2c, SUBDIR | 0x30);
    // Language directory.
    dir(&mut rsrc, 0x30, 0, 1);
    put_u32(&mut rsrc, 0x40, 0x409);
    put_u32(&mut rsrc, 0x44, 0x48);
    // Data entry.
    let name_units: Vec<u16> = name.encode_utf16().collect();
    let data_offset = (0x58 + 2 + name_units.len() * 2 + 7) & !7;
    put_u32(&mut rsrc, 0x48, va + data_offset as u32);
    put_u32(&mut rsrc, 0x4c, data.len() as u32);
    // Name string.
    put_u16(&mut rsrc, 0x58, name_units.len() as u16);
    for (i, unit) in name_units.iter().enumerate() {
        put_u16(&mut rsrc, 0x5a + i * 2, *unit);
    }
    put(&mut rsrc, data_offset, data);
    rsrc
}
