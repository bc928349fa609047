//! Well-Known Firmware Storage GUIDs
//!
//! Immutable constants: the file-system GUIDs a firmware volume header may carry, the
//! guided-section GUIDs that select decompression or nesting behavior, and the freeform
//! label GUID. Stored as [`efi::Guid`] so comparisons work directly against on-disk bytes.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use r_efi::efi;

pub use crate::guid::matches;

/// EFI_FIRMWARE_FILE_SYSTEM_GUID (FFSv1)
pub const EFI_FIRMWARE_FILE_SYSTEM1_GUID: efi::Guid =
    efi::Guid::from_fields(0x7a9354d9, 0x0468, 0x444a, 0x81, 0xce, &[0x0b, 0xf6, 0x17, 0xd8, 0x90, 0xdf]);

/// EFI_FIRMWARE_FILE_SYSTEM2_GUID
pub const EFI_FIRMWARE_FILE_SYSTEM2_GUID: efi::Guid =
    efi::Guid::from_fields(0x8c8ce578, 0x8a3d, 0x4f1c, 0x99, 0x35, &[0x89, 0x61, 0x85, 0xc3, 0x2d, 0xd3]);

/// EFI_FIRMWARE_FILE_SYSTEM3_GUID
pub const EFI_FIRMWARE_FILE_SYSTEM3_GUID: efi::Guid =
    efi::Guid::from_fields(0x5473c07a, 0x3dcb, 0x4dca, 0xbd, 0x6f, &[0x1e, 0x96, 0x89, 0xe7, 0x34, 0x9a]);

/// EVSA NVRAM volume
pub const EVSA_NVRAM_GUID: efi::Guid =
    efi::Guid::from_fields(0xfff12b8d, 0x7696, 0x4c8b, 0xa9, 0x85, &[0x27, 0x47, 0x07, 0x5b, 0x4f, 0x50]);

/// Alternate EVSA NVRAM volume GUID seen on some vendors
pub const EVSA2_NVRAM_GUID: efi::Guid =
    efi::Guid::from_fields(0x00504624, 0x8a59, 0x4eeb, 0xbd, 0x0f, &[0x6b, 0x36, 0xe9, 0x61, 0x28, 0xe0]);

/// NVAR variable store file name GUID
pub const NVAR_NVRAM_GUID: efi::Guid =
    efi::Guid::from_fields(0xcef5b9a3, 0x476d, 0x497f, 0x9f, 0xdc, &[0xe9, 0x81, 0x43, 0xe0, 0x42, 0x2c]);

/// Apple boot volume
pub const APPLE_BOOT_VOLUME_GUID: efi::Guid =
    efi::Guid::from_fields(0x04adeead, 0x61ff, 0x4d31, 0xb6, 0xba, &[0x64, 0xf8, 0xbf, 0x90, 0x1f, 0x5a]);

/// Guided section holding an LZMA stream
pub const LZMA_COMPRESSED_SECTION_GUID: efi::Guid =
    efi::Guid::from_fields(0xee4e5898, 0x3914, 0x4259, 0x9d, 0x6e, &[0xdc, 0x7b, 0xd7, 0x94, 0x03, 0xcf]);

/// Guided section holding a Tiano-compressed stream
pub const TIANO_COMPRESSED_SECTION_GUID: efi::Guid =
    efi::Guid::from_fields(0xa31280ad, 0x481e, 0x41b6, 0x95, 0xe8, &[0x12, 0x7f, 0x4c, 0x98, 0x47, 0x79]);

/// Guided section wrapping a firmware volume
pub const FIRMWARE_VOLUME_SECTION_GUID: efi::Guid =
    efi::Guid::from_fields(0x24400798, 0x3807, 0x4a42, 0xb4, 0x13, &[0xa1, 0xec, 0xee, 0x20, 0x5d, 0xd8]);

/// Guided section used as a plain container of further sections
pub const STATIC_CONTAINER_SECTION_GUID: efi::Guid =
    efi::Guid::from_fields(0xfc1bcdb0, 0x7d31, 0x49aa, 0x93, 0x6a, &[0xa4, 0x60, 0x0d, 0x9d, 0xd0, 0x83]);

/// Freeform-GUID section carrying a labeled character description
pub const CHAR_GUID: efi::Guid =
    efi::Guid::from_fields(0x059ef06e, 0xc652, 0x4a45, 0x9f, 0xbe, &[0x59, 0x75, 0xe3, 0x69, 0x46, 0x1c]);

/// The full set of file-system GUIDs a valid volume header may carry.
pub const KNOWN_VOLUME_GUIDS: &[efi::Guid] = &[
    EFI_FIRMWARE_FILE_SYSTEM1_GUID,
    EFI_FIRMWARE_FILE_SYSTEM2_GUID,
    EFI_FIRMWARE_FILE_SYSTEM3_GUID,
    EVSA_NVRAM_GUID,
    EVSA2_NVRAM_GUID,
    NVAR_NVRAM_GUID,
    APPLE_BOOT_VOLUME_GUID,
];

/// True when `raw` names one of the known volume file systems.
pub fn is_volume_guid(raw: &[u8; 16]) -> bool {
    KNOWN_VOLUME_GUIDS.iter().any(|guid| guid.as_bytes() == raw)
}

/// True when `raw` names a file system that contains FFS files.
pub fn is_ffs_guid(raw: &[u8; 16]) -> bool {
    [EFI_FIRMWARE_FILE_SYSTEM1_GUID, EFI_FIRMWARE_FILE_SYSTEM2_GUID, EFI_FIRMWARE_FILE_SYSTEM3_GUID]
        .iter()
        .any(|guid| guid.as_bytes() == raw)
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::guid::guid_string;

    #[test]
    fn constants_render_as_expected_strings() {
        assert_eq!(guid_string(EFI_FIRMWARE_FILE_SYSTEM2_GUID.as_bytes()), "8c8ce578-8a3d-4f1c-9935-896185c32dd3");
        assert_eq!(guid_string(LZMA_COMPRESSED_SECTION_GUID.as_bytes()), "ee4e5898-3914-4259-9d6e-dc7bd79403cf");
        assert_eq!(guid_string(NVAR_NVRAM_GUID.as_bytes()), "cef5b9a3-476d-497f-9fdc-e98143e0422c");
    }

    #[test]
    fn ffs_guids_are_a_subset_of_volume_guids() {
        assert!(is_ffs_guid(EFI_FIRMWARE_FILE_SYSTEM3_GUID.as_bytes()));
        assert!(is_volume_guid(EVSA_NVRAM_GUID.as_bytes()));
        assert!(!is_ffs_guid(EVSA_NVRAM_GUID.as_bytes()));
        assert!(!is_volume_guid(&[0xa5; 16]));
    }
}
