//! UEFI Firmware Storage
//!
//! The hierarchical core: firmware volumes contain file systems, file systems contain
//! files, files contain sections, and sections may encapsulate further sections or whole
//! nested volumes. Layouts follow the UEFI Platform Initialization (PI) Specification
//! V1.8A Section 3, Firmware Storage Code Definitions.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

pub mod file;
pub mod filesystem;
pub mod guids;
pub mod nvar;
pub mod section;
pub mod volume;

/// Display name and dump extension for an FFS file type.
pub fn file_type_name(file_type: u8) -> (&'static str, &'static str) {
    match file_type {
        0x00 => ("unknown", "none"),
        0x01 => ("raw", "raw"),
        0x02 => ("freeform", "freeform"),
        0x03 => ("security core", "sec"),
        0x04 => ("pei core", "pei.core"),
        0x05 => ("dxe core", "dxe.core"),
        0x06 => ("pei module", "peim"),
        0x07 => ("driver", "dxe"),
        0x08 => ("combined pei module/driver", "peim.dxe"),
        0x09 => ("application", "app"),
        0x0a => ("system management", "smm"),
        0x0b => ("firmware volume image", "vol"),
        0x0c => ("combined smm/driver", "smm.dxe"),
        0x0d => ("smm core", "smm.core"),
        0xf0 => ("ffs padding", "pad"),
        _ => ("unknown", "unknown"),
    }
}

/// Display name and dump extension for an FFS section type.
pub fn section_type_name(section_type: u8) -> (&'static str, &'static str) {
    match section_type {
        0x01 => ("Compression", "compressed"),
        0x02 => ("Guid Defined", "guid"),
        0x03 => ("Disposable", "disposable"),
        0x10 => ("PE32 image", "pe"),
        0x11 => ("PE32+ PIC image", "pic.pe"),
        0x12 => ("Terse executable (TE)", "te"),
        0x13 => ("DXE dependency expression", "dxe.depex"),
        0x14 => ("Version section", "version"),
        0x15 => ("User interface name", "ui"),
        0x16 => ("IA-32 16-bit image", "ia32.16bit"),
        0x17 => ("Firmware volume image", "fv"),
        0x18 => ("Free-form GUID", "freeform.guid"),
        0x19 => ("Raw", "raw"),
        0x1b => ("PEI dependency expression", "pei.depex"),
        0x1c => ("SMM dependency expression", "smm.depex"),
        _ => ("unknown", "unknown.bin"),
    }
}

/// Decode the UTF-16LE string name used by UI and version sections.
///
/// Stops at the first NUL; rejects empty names and names with code units above 0x80, which
/// in practice indicate a mis-tagged section rather than a real name.
pub fn uefi_name(data: &[u8]) -> Option<String> {
    let mut units = Vec::new();
    for pair in data.chunks_exact(2) {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        if unit == 0 {
            break;
        }
        if unit > 128 {
            return None;
        }
        units.push(unit);
    }
    if units.is_empty() {
        return None;
    }
    String::from_utf16(&units).ok()
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    fn utf16le(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(u16::to_le_bytes).collect()
    }

    #[test]
    fn uefi_name_stops_at_nul() {
        let mut bytes = utf16le("Setup");
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&utf16le("junk"));
        assert_eq!(uefi_name(&bytes).as_deref(), Some("Setup"));
    }

    #[test]
    fn uefi_name_rejects_non_ascii_and_empty() {
        assert_eq!(uefi_name(&utf16le("Café")), None);
        assert_eq!(uefi_name(&[0, 0]), None);
        assert_eq!(uefi_name(&[]), None);
    }

    #[test]
    fn type_tables_cover_known_values() {
        assert_eq!(file_type_name(0x07).0, "driver");
        assert_eq!(file_type_name(0xf0).1, "pad");
        assert_eq!(section_type_name(0x15).0, "User interface name");
        assert_eq!(section_type_name(0x42).1, "unknown.bin");
    }
}
