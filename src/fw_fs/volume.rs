//! Firmware Volume (FV) Parsing and Rebuild
//!
//! A volume opens with the 56-byte header (16 reserved bytes, file-system GUID, u64
//! length, `_FVH` signature, attributes, header length, checksum, revision) followed by
//! `(num_blocks, block_size)` pairs terminated by `(0, 0)`. Block spans are handed to a
//! file-system walker, an NVAR store, or kept opaque depending on the file-system GUID.
//!
//! The header checksum is not verified on read and is copied verbatim on rebuild.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use std::io::{self, Write};
use std::path::Path;

use crate::error::Error;
use crate::fw_fs::filesystem::FirmwareFileSystem;
use crate::fw_fs::guids;
use crate::fw_fs::nvar::NvarStore;
use crate::guid::guid_string;
use crate::object::{FirmwareObject, ParseContext, RawObject, ts, write_file};
use crate::reader::{clamped, read_array, read_u8, read_u16, read_u32, read_u64};

/// Offset of the `_FVH` signature within the volume header.
pub const FVH_SIGNATURE_OFFSET: usize = 0x28;

const HEADER_SIZE: usize = 0x38;

/// One block span of a volume, typed by the volume's file-system GUID.
enum VolumeRegion {
    FileSystem(FirmwareFileSystem),
    Nvram(NvarStore),
    Opaque(RawObject),
}

impl VolumeRegion {
    fn as_object(&self) -> &dyn FirmwareObject {
        match self {
            VolumeRegion::FileSystem(fs) => fs,
            VolumeRegion::Nvram(store) => store,
            VolumeRegion::Opaque(raw) => raw,
        }
    }
}

/// A firmware volume and the file systems inside it.
pub struct FirmwareVolume {
    name: String,
    zero_vector: [u8; 16],
    guid: [u8; 16],
    fv_length: u64,
    attributes: u32,
    header_length: u16,
    checksum: u16,
    reserved: [u8; 3],
    revision: u8,
    /// Captured block map bytes (including the terminator), re-emitted verbatim.
    block_map: Vec<u8>,
    blocks: Vec<(u32, u32)>,
    data: Vec<u8>,
    regions: Vec<VolumeRegion>,
}

impl FirmwareVolume {
    /// True when the prefix carries the `_FVH` signature where a volume header would
    /// place it.
    pub fn match_prefix(prefix: &[u8]) -> bool {
        prefix.len() >= FVH_SIGNATURE_OFFSET + 4 && &prefix[FVH_SIGNATURE_OFFSET..FVH_SIGNATURE_OFFSET + 4] == b"_FVH"
    }

    /// Decode and validate the header; clamp the owned range to the declared length.
    /// `name` labels the volume in display and dump output (callers typically pass an
    /// offset or the containing file's GUID).
    pub fn new(data: &[u8], name: impl Into<String>) -> Result<FirmwareVolume, Error> {
        Error::check_len(data, HEADER_SIZE)?;

        let zero_vector: [u8; 16] = read_array(data, 0)?;
        let guid: [u8; 16] = read_array(data, 16)?;
        let fv_length = read_u64(data, 32)?;
        let signature: [u8; 4] = read_array(data, 40)?;
        let attributes = read_u32(data, 44)?;
        let header_length = read_u16(data, 48)?;
        let checksum = read_u16(data, 50)?;
        let reserved: [u8; 3] = read_array(data, 52)?;
        let revision = read_u8(data, 55)?;

        if &signature != b"_FVH" {
            return Err(Error::InvalidHeader("volume signature"));
        }
        if !guids::is_volume_guid(&guid) {
            return Err(Error::InvalidHeader("unknown volume file-system GUID"));
        }
        if (header_length as usize) < HEADER_SIZE {
            return Err(Error::InvalidHeader("volume header length"));
        }

        let data = clamped(data, 0, fv_length as usize).to_vec();
        let block_map = clamped(&data, HEADER_SIZE, header_length as usize - HEADER_SIZE).to_vec();

        Ok(FirmwareVolume {
            name: name.into(),
            zero_vector,
            guid,
            fv_length,
            attributes,
            header_length,
            checksum,
            reserved,
            revision,
            block_map,
            blocks: Vec::new(),
            data,
            regions: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fv_length(&self) -> u64 {
        self.fv_length
    }

    pub fn blocks(&self) -> &[(u32, u32)] {
        &self.blocks
    }

    pub fn file_systems(&self) -> impl Iterator<Item = &FirmwareFileSystem> {
        self.regions.iter().filter_map(|region| match region {
            VolumeRegion::FileSystem(fs) => Some(fs),
            _ => None,
        })
    }
}

impl FirmwareObject for FirmwareVolume {
    fn process(&mut self, ctx: &ParseContext) -> bool {
        self.blocks.clear();
        for pair in self.block_map.chunks_exact(8) {
            let num_blocks = u32::from_le_bytes(pair[..4].try_into().unwrap());
            let block_size = u32::from_le_bytes(pair[4..].try_into().unwrap());
            if (num_blocks, block_size) == (0, 0) {
                break;
            }
            self.blocks.push((num_blocks, block_size));
        }
        if self.blocks.is_empty() {
            log::warn!("firmware volume {} has an empty block map", self.name);
            return false;
        }

        let body = clamped(&self.data, self.header_length as usize, usize::MAX).to_vec();
        let mut status = true;
        let mut offset = 0usize;
        self.regions.clear();
        for (num_blocks, block_size) in self.blocks.clone() {
            let span = (num_blocks as usize).saturating_mul(block_size as usize);
            let region_data = clamped(&body, offset, span);
            if guids::is_ffs_guid(&self.guid) {
                let mut fs = FirmwareFileSystem::new(region_data);
                status &= fs.process(ctx);
                self.regions.push(VolumeRegion::FileSystem(fs));
            } else if guids::matches(&self.guid, &guids::EVSA_NVRAM_GUID)
                || guids::matches(&self.guid, &guids::EVSA2_NVRAM_GUID)
            {
                match NvarStore::new(region_data) {
                    Ok(mut store) => {
                        status &= store.process(ctx);
                        self.regions.push(VolumeRegion::Nvram(store));
                    }
                    Err(_) => self.regions.push(VolumeRegion::Opaque(RawObject::new(region_data))),
                }
            } else {
                self.regions.push(VolumeRegion::Opaque(RawObject::new(region_data)));
            }
            offset += span;
        }
        status
    }

    fn build(&self, generate_checksum: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len());
        out.extend_from_slice(&self.zero_vector);
        out.extend_from_slice(&self.guid);
        out.extend_from_slice(&self.fv_length.to_le_bytes());
        out.extend_from_slice(b"_FVH");
        out.extend_from_slice(&self.attributes.to_le_bytes());
        out.extend_from_slice(&self.header_length.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out.extend_from_slice(&self.reserved);
        out.push(self.revision);
        out.extend_from_slice(&self.block_map);
        for region in &self.regions {
            out.extend(region.as_object().build(generate_checksum));
        }
        out
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "FirmwareVolume"
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        self.regions.iter().map(VolumeRegion::as_object).collect()
    }

    fn label(&self) -> String {
        self.name.clone()
    }

    fn guid(&self) -> Option<[u8; 16]> {
        Some(self.guid)
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("attributes", format!("{:#010x}", self.attributes)),
            ("revision", format!("{}", self.revision)),
            ("checksum", format!("{:#x}", self.checksum)),
            ("size", format!("{:#x}", self.fv_length)),
        ]
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        writeln!(
            out,
            "{}Firmware Volume: {} attr {:#010x}, rev {}, cksum {:#x}, size {:#x} ({} bytes)",
            ts(indent),
            guid_string(&self.guid),
            self.attributes,
            self.revision,
            self.checksum,
            self.fv_length,
            self.fv_length
        )?;
        write!(out, "{}Firmware Volume Blocks: ", ts(indent + 1))?;
        for (num_blocks, block_size) in &self.blocks {
            write!(out, "({num_blocks}, {block_size:#x})")?;
        }
        writeln!(out)?;
        for region in &self.regions {
            region.as_object().show(out, indent + 1, None)?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, _index: usize) {
        if self.data.is_empty() {
            return;
        }
        write_file(&dir.join(format!("volume-{}.fv", self.name)), &self.data);
        let child_dir = dir.join(format!("volume-{}", self.name));
        for (index, region) in self.regions.iter().enumerate() {
            region.as_object().dump(&child_dir, index);
        }
    }
}

/// Scan `data` for embedded firmware volumes, emitting interleaved raw spans so the
/// result re-concatenates to the input. Used for raw file bodies where vendors stash
/// volumes behind proprietary headers.
pub fn find_volumes(data: &[u8], ctx: &ParseContext) -> Vec<Box<dyn FirmwareObject>> {
    let mut objects: Vec<Box<dyn FirmwareObject>> = Vec::new();
    let mut consumed = 0usize;
    let mut search = 0usize;

    while search + 4 <= data.len() {
        let Some(found) = data[search..].windows(4).position(|w| w == b"_FVH") else {
            break;
        };
        let magic = search + found;
        if magic < FVH_SIGNATURE_OFFSET {
            search = magic + 4;
            continue;
        }
        let start = magic - FVH_SIGNATURE_OFFSET;
        match FirmwareVolume::new(&data[start..], format!("{start:#x}")) {
            Ok(mut volume) => {
                volume.process(ctx);
                if start > consumed {
                    objects.push(Box::new(RawObject::new(&data[consumed..start])));
                }
                consumed = start + volume.byte_len().max(HEADER_SIZE);
                search = consumed;
                objects.push(Box::new(volume));
            }
            Err(_) => search = magic + 4,
        }
    }

    if consumed < data.len() {
        objects.push(Box::new(RawObject::new(&data[consumed..])));
    }
    objects
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Synthetic image construction shared by the firmware-storage tests.

    use crate::fw_fs::guids;

    /// A minimal FFSv2 volume: header, one `(1, body_len)` block, body.
    pub fn volume(body: &[u8]) -> Vec<u8> {
        volume_with_guid(guids::EFI_FIRMWARE_FILE_SYSTEM2_GUID.as_bytes(), body)
    }

    pub fn volume_with_guid(guid: &[u8; 16], body: &[u8]) -> Vec<u8> {
        let header_length = 0x48u16;
        let total = header_length as u64 + body.len() as u64;
        let mut out = Vec::new();
        out.extend_from_slice(&[0u8; 16]);
        out.extend_from_slice(guid);
        out.extend_from_slice(&total.to_le_bytes());
        out.extend_from_slice(b"_FVH");
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&header_length.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&[0u8; 3]);
        out.push(2);
        // block map: one block covering the body, then the terminator
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(body);
        out
    }

    /// An FFS file header + body with the given type.
    pub fn ffs_file(guid: &[u8; 16], file_type: u8, body: &[u8]) -> Vec<u8> {
        let size = 24 + body.len() as u32;
        let mut out = Vec::new();
        out.extend_from_slice(guid);
        out.extend_from_slice(&0u16.to_le_bytes());
        out.push(file_type);
        out.push(0x00);
        out.extend_from_slice(&size.to_le_bytes()[..3]);
        out.push(0xF8);
        out.extend_from_slice(body);
        out
    }

    /// A section with the given type around `body`.
    pub fn section(section_type: u8, body: &[u8]) -> Vec<u8> {
        let size = 4 + body.len() as u32;
        let mut out = Vec::new();
        out.extend_from_slice(&size.to_le_bytes()[..3]);
        out.push(section_type);
        out.extend_from_slice(body);
        out
    }
}

#[cfg(test)]
mod unit_tests {
    use super::test_support::{ffs_file, section, volume, volume_with_guid};
    use super::*;
    use crate::fw_fs::guids::EFI_FIRMWARE_FILE_SYSTEM2_GUID;
    use crate::object::show_tree;

    #[test]
    fn minimal_volume_parses_and_rebuilds() {
        let bytes = volume(&[]);
        assert_eq!(bytes.len(), 0x48);

        let mut fv = FirmwareVolume::new(&bytes, "volume").unwrap();
        assert!(fv.process(&ParseContext::default()));
        assert_eq!(fv.blocks(), &[(1, 0)]);
        assert_eq!(fv.file_systems().count(), 1);
        assert_eq!(fv.build(false), bytes);
    }

    #[test]
    fn declared_block_beyond_capture_is_tolerated() {
        // header-only volume whose single block claims 0x40 bytes that are not present
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0u8; 16]);
        bytes.extend_from_slice(guids::EFI_FIRMWARE_FILE_SYSTEM2_GUID.as_bytes());
        bytes.extend_from_slice(&0x48u64.to_le_bytes());
        bytes.extend_from_slice(b"_FVH");
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0x48u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 3]);
        bytes.push(2);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0x40u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        assert_eq!(bytes.len(), 0x48);

        let mut fv = FirmwareVolume::new(&bytes, "volume").unwrap();
        assert!(fv.process(&ParseContext::default()));
        assert_eq!(fv.blocks(), &[(1, 0x40)]);
        let fs = fv.file_systems().next().unwrap();
        assert!(fs.files().is_empty());
        assert_eq!(fv.build(false), bytes);
    }

    #[test]
    fn volume_with_padding_file() {
        let file = ffs_file(&[0xAA; 16], 0xF0, &[0u8; 8]);
        let bytes = volume(&file);

        let mut fv = FirmwareVolume::new(&bytes, "volume").unwrap();
        assert!(fv.process(&ParseContext::default()));
        let fs = fv.file_systems().next().unwrap();
        assert_eq!(fs.files().len(), 1);
        assert_eq!(fs.files()[0].file_type(), 0xF0);
        assert!(fs.files()[0].objects().is_empty());
        assert_eq!(fv.build(false), bytes);
    }

    #[test]
    fn bad_signature_and_guid_are_invalid_headers() {
        let mut bytes = volume(&[]);
        bytes[0x28] = b'X';
        assert!(matches!(FirmwareVolume::new(&bytes, "v"), Err(Error::InvalidHeader(_))));

        let bytes = volume_with_guid(&[0xa5; 16], &[]);
        assert!(matches!(FirmwareVolume::new(&bytes, "v"), Err(Error::InvalidHeader(_))));

        assert!(matches!(FirmwareVolume::new(&[0u8; 16], "v"), Err(Error::TruncatedInput { .. })));
    }

    #[test]
    fn empty_block_map_fails_process() {
        // header claims 0x48 bytes of header but the map opens with the terminator
        let mut bytes = volume(&[]);
        bytes[0x38..0x40].fill(0);
        let mut fv = FirmwareVolume::new(&bytes, "v").unwrap();
        assert!(!fv.process(&ParseContext::default()));
    }

    #[test]
    fn volume_iteration_matches_parse_order() {
        let file_a = ffs_file(&[0x01; 16], 0xF0, &[0u8; 8]);
        let file_b = ffs_file(&[0x02; 16], 0xF0, &[0u8; 16]);
        let mut body = file_a.clone();
        // 8-byte alignment between files
        while body.len() % 8 != 0 {
            body.push(0xFF);
        }
        body.extend(&file_b);
        let bytes = volume(&body);

        let mut fv = FirmwareVolume::new(&bytes, "volume").unwrap();
        assert!(fv.process(&ParseContext::default()));

        let infos = crate::object::iterate(&fv, false);
        assert_eq!(infos.len(), 1); // one file system
        assert_eq!(infos[0].children.len(), 2);
        assert_eq!(infos[0].children[0].guid, crate::guid::guid_string(&[0x01; 16]));
        assert_eq!(infos[0].children[1].guid, crate::guid::guid_string(&[0x02; 16]));
        let flat = crate::object::flatten(&infos);
        assert_eq!(flat.len(), 3);
        assert_eq!(flat[1].parent, Some(0));

        assert_eq!(fv.build(false), bytes);
    }

    #[test]
    fn nested_volume_section_round_trips() {
        let inner = volume(&[]);
        let fv_section = section(0x17, &inner);
        let mut body = ffs_file(&[0xBB; 16], 0x0B, &fv_section);
        // erased fill out to the file-system alignment boundary
        while body.len() % 8 != 0 {
            body.push(0xFF);
        }
        let bytes = volume(&body);

        let mut fv = FirmwareVolume::new(&bytes, "outer").unwrap();
        assert!(fv.process(&ParseContext::default()));

        let tree = show_tree(&fv);
        assert_eq!(tree.matches("Firmware Volume:").count(), 2);
        assert_eq!(fv.build(false), bytes);
    }

    #[test]
    fn find_volumes_interleaves_raw_spans() {
        let fv_bytes = volume(&[]);
        let mut data = vec![0xABu8; 64];
        data.extend(&fv_bytes);
        data.extend(vec![0xCDu8; 16]);

        let objects = find_volumes(&data, &ParseContext::default());
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[0].type_name(), "RawObject");
        assert_eq!(objects[0].byte_len(), 64);
        assert_eq!(objects[1].type_name(), "FirmwareVolume");
        assert_eq!(objects[2].byte_len(), 16);

        let total: usize = objects.iter().map(|o| o.byte_len()).sum();
        assert_eq!(total, data.len());
    }

    #[test]
    fn find_volumes_skips_false_magic() {
        // an _FVH string with no valid header around it
        let mut data = vec![0u8; 128];
        data[60..64].copy_from_slice(b"_FVH");
        let objects = find_volumes(&data, &ParseContext::default());
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].byte_len(), data.len());
    }

    #[test]
    fn ffs2_guid_is_known() {
        let bytes = volume(&[]);
        let fv = FirmwareVolume::new(&bytes, "v").unwrap();
        assert_eq!(fv.guid().unwrap(), *EFI_FIRMWARE_FILE_SYSTEM2_GUID.as_bytes());
    }
}
