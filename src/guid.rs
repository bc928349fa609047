//! GUID Codec
//!
//! Firmware structures store RFC4122 GUIDs in the on-disk mixed-endian form: the first
//! three groups little-endian, the final eight bytes in order. Conversion between the raw
//! 16 bytes, the hyphenated string form, and the int-array form used by GUID name tables
//! goes through [`uuid::Uuid`], the same way `mu_pi` renders volume names.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use r_efi::efi;
use uuid::Uuid;

use crate::error::Error;

/// Hyphenated lowercase string form of an on-disk GUID.
pub fn guid_string(raw: &[u8; 16]) -> String {
    Uuid::from_bytes_le(*raw).to_string()
}

/// Parse a hyphenated GUID string back to the on-disk byte form.
pub fn guid_parse(s: &str) -> Result<[u8; 16], Error> {
    let uuid = Uuid::parse_str(s).map_err(|_| Error::MalformedGuid(s.to_string()))?;
    Ok(uuid.to_bytes_le())
}

/// Int-array form: `[time_low, time_mid, time_hi, node0..node7]`.
pub fn guid_array(raw: &[u8; 16]) -> [u32; 11] {
    let uuid = Uuid::from_bytes_le(*raw);
    let (time_low, time_mid, time_hi, node) = uuid.as_fields();
    let mut out = [0u32; 11];
    out[0] = time_low;
    out[1] = time_mid as u32;
    out[2] = time_hi as u32;
    for (slot, byte) in out[3..].iter_mut().zip(node) {
        *slot = *byte as u32;
    }
    out
}

/// Rebuild the on-disk byte form from the int-array form.
pub fn guid_from_array(fields: &[u32; 11]) -> [u8; 16] {
    let mut node = [0u8; 8];
    for (byte, field) in node.iter_mut().zip(&fields[3..]) {
        *byte = *field as u8;
    }
    Uuid::from_fields(fields[0], fields[1] as u16, fields[2] as u16, &node).to_bytes_le()
}

/// On-disk bytes of a [`efi::Guid`] constant.
pub fn efi_guid_bytes(guid: &efi::Guid) -> [u8; 16] {
    *guid.as_bytes()
}

/// Compare on-disk GUID bytes against a [`efi::Guid`] constant.
pub fn matches(raw: &[u8; 16], guid: &efi::Guid) -> bool {
    raw == guid.as_bytes()
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    const FFS2_STR: &str = "8c8ce578-8a3d-4f1c-9935-896185c32dd3";

    #[test]
    fn string_round_trip() {
        let raw = guid_parse(FFS2_STR).unwrap();
        // mixed-endian layout: first group byte-swapped on disk
        assert_eq!(&raw[..4], &[0x78, 0xe5, 0x8c, 0x8c]);
        assert_eq!(guid_string(&raw), FFS2_STR);
    }

    #[test]
    fn array_round_trip() {
        let raw = guid_parse(FFS2_STR).unwrap();
        let fields = guid_array(&raw);
        assert_eq!(fields[0], 0x8c8ce578);
        assert_eq!(fields[1], 0x8a3d);
        assert_eq!(fields[3], 0x99);
        assert_eq!(guid_from_array(&fields), raw);
    }

    #[test]
    fn malformed_strings_are_rejected() {
        assert!(matches!(guid_parse("not-a-guid"), Err(Error::MalformedGuid(_))));
        assert!(matches!(guid_parse(""), Err(Error::MalformedGuid(_))));
    }

    #[test]
    fn efi_guid_constant_matches_disk_bytes() {
        let ffs2 = r_efi::efi::Guid::from_fields(
            0x8c8ce578,
            0x8a3d,
            0x4f1c,
            0x99,
            0x35,
            &[0x89, 0x61, 0x85, 0xc3, 0x2d, 0xd3],
        );
        let raw = guid_parse(FFS2_STR).unwrap();
        assert!(matches(&raw, &ffs2));
    }
}
