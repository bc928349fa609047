//! EFI Capsule Wrappers
//!
//! A capsule opens with one of three well-known GUIDs, each selecting a different header
//! layout behind it. All three end up locating a firmware volume body. At least one
//! vendor measures the body offset from the end of the header rather than the start of
//! the capsule, so volume discovery retries with the alternate interpretation before
//! giving up.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use std::io::{self, Write};
use std::path::Path;

use r_efi::efi;

use crate::error::Error;
use crate::fw_fs::volume::FirmwareVolume;
use crate::guid::guid_string;
use crate::object::{FirmwareObject, ParseContext, ts, write_file};
use crate::reader::{clamped, read_array, read_u16, read_u32};

/// EFI capsule (the original layout with the full offset table).
pub const EFI_CAPSULE_GUID: efi::Guid =
    efi::Guid::from_fields(0x3b6686bd, 0x0d76, 0x4030, 0xb7, 0x0e, &[0xb5, 0x51, 0x9e, 0x2f, 0xc5, 0xa0]);

/// EFI capsule v2.
pub const EFI2_CAPSULE_GUID: efi::Guid =
    efi::Guid::from_fields(0x4a3ca68b, 0x7723, 0x48fb, 0x3d, 0x80, &[0x57, 0x8c, 0xc1, 0xfe, 0xc4, 0x4d]);

/// UEFI capsule.
pub const UEFI_CAPSULE_GUID: efi::Guid =
    efi::Guid::from_fields(0x539182b9, 0xabb5, 0x4391, 0xb6, 0x9a, &[0xe3, 0xa9, 0x43, 0xf7, 0x2f, 0xcc]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CapsuleKind {
    Efi,
    Efi2,
    Uefi,
}

/// Offsets into the capsule body, as read from the layout the GUID selected. Zero means
/// the layout does not carry that field.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapsuleOffsets {
    pub capsule_body: u32,
    pub split_info: u32,
    pub oem_header: u32,
    pub author_info: u32,
    pub revision_info: u32,
    pub short_description: u32,
    pub long_description: u32,
    pub compatibility: u32,
}

pub struct FirmwareCapsule {
    name: String,
    data: Vec<u8>,
    kind: CapsuleKind,
    capsule_guid: [u8; 16],
    instance_guid: Option<[u8; 16]>,
    header_size: u32,
    flags: u32,
    image_size: u32,
    offsets: CapsuleOffsets,
    /// Where the discovered volume actually starts in the capsule.
    body_offset: Option<usize>,
    body: Option<FirmwareVolume>,
}

impl FirmwareCapsule {
    pub fn match_prefix(prefix: &[u8]) -> bool {
        prefix.len() >= 16
            && [EFI_CAPSULE_GUID, EFI2_CAPSULE_GUID, UEFI_CAPSULE_GUID]
                .iter()
                .any(|guid| guid.as_bytes() == &prefix[..16])
    }

    pub fn new(data: &[u8], name: impl Into<String>) -> Result<FirmwareCapsule, Error> {
        Error::check_len(data, 28)?;
        let capsule_guid: [u8; 16] = read_array(data, 0)?;

        let kind = if capsule_guid == *EFI_CAPSULE_GUID.as_bytes() {
            CapsuleKind::Efi
        } else if capsule_guid == *EFI2_CAPSULE_GUID.as_bytes() {
            CapsuleKind::Efi2
        } else if capsule_guid == *UEFI_CAPSULE_GUID.as_bytes() {
            CapsuleKind::Uefi
        } else {
            return Err(Error::InvalidHeader("unknown capsule GUID"));
        };

        let header_size = read_u32(data, 16)?;
        let flags = read_u32(data, 20)?;
        let image_size = read_u32(data, 24)?;
        let mut instance_guid = None;
        let mut offsets = CapsuleOffsets::default();

        match kind {
            CapsuleKind::Efi => {
                Error::check_len(data, 80)?;
                instance_guid = Some(read_array(data, 32)?);
                offsets.split_info = read_u32(data, 48)?;
                offsets.capsule_body = read_u32(data, 52)?;
                offsets.oem_header = read_u32(data, 56)?;
                offsets.author_info = read_u32(data, 60)?;
                offsets.revision_info = read_u32(data, 64)?;
                offsets.short_description = read_u32(data, 68)?;
                offsets.long_description = read_u32(data, 72)?;
                offsets.compatibility = read_u32(data, 76)?;
            }
            CapsuleKind::Efi2 => {
                Error::check_len(data, 32)?;
                offsets.capsule_body = read_u16(data, 28)? as u32;
                offsets.oem_header = read_u16(data, 30)? as u32;
            }
            CapsuleKind::Uefi => {
                offsets.capsule_body = header_size;
            }
        }

        Ok(FirmwareCapsule {
            name: name.into(),
            data: data.to_vec(),
            kind,
            capsule_guid,
            instance_guid,
            header_size,
            flags,
            image_size,
            offsets,
            body_offset: None,
            body: None,
        })
    }

    pub fn offsets(&self) -> &CapsuleOffsets {
        &self.offsets
    }

    pub fn volume(&self) -> Option<&FirmwareVolume> {
        self.body.as_ref()
    }

    fn body_start(&self) -> usize {
        self.header_size as usize + self.offsets.capsule_body as usize
    }
}

impl FirmwareObject for FirmwareCapsule {
    fn process(&mut self, ctx: &ParseContext) -> bool {
        let Some(child_ctx) = ctx.descend() else {
            log::warn!("maximum parse depth exceeded in capsule");
            return false;
        };

        // body offset from end of header, retrying from the start of the capsule
        let candidates = [self.body_start(), self.offsets.capsule_body as usize];
        for start in candidates {
            let region = clamped(&self.data, start, self.data.len());
            if let Ok(mut volume) = FirmwareVolume::new(region, self.name.clone()) {
                volume.process(&child_ctx);
                self.body_offset = Some(start);
                self.body = Some(volume);
                return true;
            }
        }
        log::warn!("capsule {} holds no parseable firmware volume", guid_string(&self.capsule_guid));
        false
    }

    fn build(&self, generate_checksum: bool) -> Vec<u8> {
        match (&self.body, self.body_offset) {
            (Some(volume), Some(start)) => {
                // header and preamble verbatim, rebuilt volume, verbatim tail
                let mut out = self.data[..start.min(self.data.len())].to_vec();
                out.extend(volume.build(generate_checksum));
                let consumed = start + volume.byte_len();
                out.extend_from_slice(clamped(&self.data, consumed, self.data.len()));
                out
            }
            _ => self.data.clone(),
        }
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "FirmwareCapsule"
    }

    fn label(&self) -> String {
        self.name.clone()
    }

    fn guid(&self) -> Option<[u8; 16]> {
        Some(self.capsule_guid)
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        let kind = match self.kind {
            CapsuleKind::Efi => "EFI",
            CapsuleKind::Efi2 => "EFI2",
            CapsuleKind::Uefi => "UEFI",
        };
        let mut attrs = vec![
            ("kind", kind.to_string()),
            ("flags", format!("{:#010x}", self.flags)),
            ("header_size", format!("{:#x}", self.header_size)),
            ("image_size", format!("{:#x}", self.image_size)),
            ("body_offset", format!("{:#x}", self.offsets.capsule_body)),
        ];
        if let Some(instance) = &self.instance_guid {
            attrs.push(("instance", guid_string(instance)));
        }
        attrs
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        self.body.as_ref().map(|v| v as &dyn FirmwareObject).into_iter().collect()
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        writeln!(
            out,
            "{}Firmware Capsule: {} flags {:#010x}, size {:#x} ({} bytes)",
            ts(indent),
            guid_string(&self.capsule_guid),
            self.flags,
            self.image_size,
            self.image_size
        )?;
        writeln!(
            out,
            "{}Details: header= {:#x} body= {:#x}, oem= {:#x}, author= {:#x}",
            ts(indent + 1),
            self.header_size,
            self.offsets.capsule_body,
            self.offsets.oem_header,
            self.offsets.author_info
        )?;
        if let Some(volume) = &self.body {
            volume.show(out, indent, None)?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, _index: usize) {
        if self.data.is_empty() {
            return;
        }
        write_file(&dir.join(format!("capsule-{}.cap", self.name)), &self.data);
        if let Some(volume) = &self.body {
            volume.dump(&dir.join(format!("capsule-{}", self.name)), 0);
        }
    }
}
