//! Executable format sniffing.

use std::fmt;

/// Container format of an executable, derived once from its leading magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Unknown,
    Elf,
    MachO,
    Pe,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Format::Unknown => "unknown",
            Format::Elf => "ELF",
            Format::MachO => "Mach-O",
            Format::Pe => "PE",
        };
        f.write_str(name)
    }
}

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

const MACHO_MAGICS: [[u8; 4]; 6] = [
    [0xfe, 0xed, 0xfa, 0xce], // 32-bit, big-endian
    [0xce, 0xfa, 0xed, 0xfe], // 32-bit, little-endian
    [0xfe, 0xed, 0xfa, 0xcf], // 64-bit, big-endian
    [0xcf, 0xfa, 0xed, 0xfe], // 64-bit, little-endian
    [0xca, 0xfe, 0xba, 0xbe], // fat
    [0xbe, 0xba, 0xfe, 0xca], // fat, swapped
];

/// Classify a buffer by its first four bytes.
///
/// Anything shorter than four bytes is [`Format::Unknown`].
pub fn detect_format(bytes: &[u8]) -> Format {
    let Some(magic) = bytes.get(..4) else {
        return Format::Unknown;
    };
    if magic == ELF_MAGIC {
        Format::Elf
    } else if MACHO_MAGICS.iter().any(|m| m == magic) {
        Format::MachO
    } else if magic.starts_with(b"MZ") {
        Format::Pe
    } else {
        Format::Unknown
    }
}
