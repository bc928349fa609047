//! Dell PFS Update Containers
//!
//! A PFS update opens with `PFS.HDR.` (spec u32, body size u32) and closes with a
//! `PFS.FTR.` trailer. The body is a chain of sections with 0x48-byte headers: a UUID,
//! a spec number, an `A`/`N`-typed version group, the payload size, and the sizes of the
//! three signature chunks that follow the payload. A section whose payload itself starts
//! with `PFS.HDR.` is a partitioned ROM whose chunks are reassembled before volume
//! discovery; the firmware-volumes UUID selects a chain of firmware volumes; everything
//! else is auto-parsed.
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

use crate::auto::AutoRaw;
use crate::error::Error;
use crate::fw_fs::volume::FirmwareVolume;
use crate::guid::{guid_string, matches};
use crate::object::{FirmwareObject, ParseContext, RawObject, ts, write_file};
use crate::reader::{clamped, read_array, read_u32};

const PFS_HEADER: &[u8; 8] = b"PFS.HDR.";
const PFS_FOOTER: &[u8; 8] = b"PFS.FTR.";
const SECTION_HEADER_SIZE: usize = 0x48;

/// PFS section UUID marking a chain of firmware volumes.
pub const PFS_FIRMWARE_VOLUMES_GUID: efi::Guid =
    efi::Guid::from_fields(0x7ec6c2b0, 0x3fe3, 0x42a0, 0xa3, 0x16, &[0x22, 0xdd, 0x05, 0x17, 0xc1, 0xe8]);

/// PFS section UUID holding an Intel ME update payload.
pub const PFS_INTEL_ME_GUID: efi::Guid =
    efi::Guid::from_fields(0x7439ed9e, 0x70d3, 0x4b65, 0x9e, 0x33, &[0x19, 0x63, 0xa7, 0xad, 0x3c, 0x37]);

/// Parse a run of consecutive firmware volumes from `data`. Returns `None` when a volume
/// header is valid but its contents fail to parse.
fn discover_volumes(data: &[u8], ctx: &ParseContext) -> Option<Vec<FirmwareVolume>> {
    let mut volumes = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        let mut volume = match FirmwareVolume::new(&data[offset..], format!("{offset:#x}")) {
            Ok(volume) => volume,
            Err(_) => break,
        };
        if !volume.process(ctx) {
            return None;
        }
        let advance = volume.byte_len();
        if advance == 0 {
            break;
        }
        offset += advance;
        volumes.push(volume);
    }
    Some(volumes)
}

/// A section whose payload is itself a `PFS.HDR.` chain split across chunks: the chunk
/// payloads are concatenated (each chunk hides a 0x248-byte variable block) and the
/// result is scanned for volumes.
pub struct PfsPartitionedSection {
    uuid: [u8; 16],
    data: Vec<u8>,
    partitions: u32,
    section_data: Vec<u8>,
    children: Vec<FirmwareVolume>,
}

impl PfsPartitionedSection {
    const DATA_OFFSET: usize = 0x248;

    pub fn new(data: &[u8]) -> Result<PfsPartitionedSection, Error> {
        Error::check_len(data, 0x20)?;
        Ok(PfsPartitionedSection {
            uuid: read_array(data, 0)?,
            data: data.to_vec(),
            partitions: 0,
            section_data: Vec::new(),
            children: Vec::new(),
        })
    }
}

impl FirmwareObject for PfsPartitionedSection {
    fn process(&mut self, ctx: &ParseContext) -> bool {
        let body_end = self.data.len().saturating_sub(0x10);
        let mut step = 0x10usize; // past the leading UUID

        self.partitions = 0;
        self.section_data.clear();
        while step + SECTION_HEADER_SIZE <= body_end {
            let header = &self.data[step..step + SECTION_HEADER_SIZE];
            self.partitions += 1;
            let size = read_u32(header, 0x28).unwrap_or(0) as usize;
            let sig1 = read_u32(header, 0x2C).unwrap_or(0) as usize;
            let trp = read_u32(header, 0x30).unwrap_or(0) as usize;
            let sig2 = read_u32(header, 0x34).unwrap_or(0) as usize;

            step += SECTION_HEADER_SIZE;
            if size <= Self::DATA_OFFSET {
                log::warn!("partitioned PFS chunk too small: {size:#x}");
                return false;
            }
            self.section_data
                .extend_from_slice(clamped(&self.data, step + Self::DATA_OFFSET, size - Self::DATA_OFFSET));
            step += size + sig1 + trp + sig2;
        }

        match discover_volumes(&self.section_data, ctx) {
            Some(volumes) => {
                self.children = volumes;
                true
            }
            None => false,
        }
    }

    fn build(&self, _generate_checksum: bool) -> Vec<u8> {
        // chunk reassembly is lossy; the partitioned section re-emits its captured bytes
        self.data.clone()
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "PFSPartitionedSection"
    }

    fn guid(&self) -> Option<[u8; 16]> {
        Some(self.uuid)
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("partitions", format!("{}", self.partitions)),
            ("reassembled_size", format!("{:#x}", self.section_data.len())),
        ]
    }

    fn content(&self) -> &[u8] {
        &self.section_data
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        self.children.iter().map(|v| v as &dyn FirmwareObject).collect()
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        writeln!(
            out,
            "{}Dell PFSPartitionedSection: {} partitions {} size {:#x} ({} bytes)",
            ts(indent),
            guid_string(&self.uuid),
            self.partitions,
            self.section_data.len(),
            self.section_data.len()
        )?;
        for child in &self.children {
            child.show(out, indent + 1, None)?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, _index: usize) {
        write_file(&dir.join(format!("{}.data", guid_string(&self.uuid))), &self.section_data);
        let child_dir = dir.join(format!("section-{}", guid_string(&self.uuid)));
        for (index, child) in self.children.iter().enumerate() {
            child.dump(&child_dir, index);
        }
    }
}

/// One PFS body section: header, payload, and three signature chunks.
pub struct PfsSection {
    uuid: [u8; 16],
    header: Vec<u8>,
    spec: u32,
    version: String,
    crcs: Vec<u8>,
    section_data: Vec<u8>,
    rsa1: RawObject,
    pmim: RawObject,
    rsa2: RawObject,
    total_size: usize,
    children: Vec<Box<dyn FirmwareObject>>,
}

impl PfsSection {
    pub fn new(data: &[u8]) -> Result<PfsSection, Error> {
        Error::check_len(data, SECTION_HEADER_SIZE)?;
        let header = data[..SECTION_HEADER_SIZE].to_vec();
        let uuid: [u8; 16] = read_array(&header, 0)?;
        let spec = read_u32(&header, 0x10)?;

        // version groups: 'A' renders hex without a separator, 'N' renders ".<dec>"
        let version_type: [u8; 4] = read_array(&header, 0x14)?;
        let mut version = String::new();
        for (index, kind) in version_type.iter().enumerate() {
            let group = u16::from_le_bytes([header[0x18 + index * 2], header[0x18 + index * 2 + 1]]);
            match kind {
                b'A' => version.push_str(&format!("{group:X}")),
                b'N' => version.push_str(&format!(".{group}")),
                _ => {}
            }
        }

        let section_size = read_u32(&header, 0x28)? as usize;
        let rsa1_size = read_u32(&header, 0x2C)? as usize;
        let pmim_size = read_u32(&header, 0x30)? as usize;
        let rsa2_size = read_u32(&header, 0x34)? as usize;
        let crcs = header[0x38..SECTION_HEADER_SIZE].to_vec();

        let section_data = clamped(data, SECTION_HEADER_SIZE, section_size).to_vec();
        let rsa1_offset = SECTION_HEADER_SIZE + section_size;
        let pmim_offset = rsa1_offset + rsa1_size;
        let rsa2_offset = pmim_offset + pmim_size;

        Ok(PfsSection {
            uuid,
            header,
            spec,
            version,
            crcs,
            rsa1: RawObject::new(clamped(data, rsa1_offset, rsa1_size)),
            pmim: RawObject::new(clamped(data, pmim_offset, pmim_size)),
            rsa2: RawObject::new(clamped(data, rsa2_offset, rsa2_size)),
            total_size: SECTION_HEADER_SIZE + section_size + rsa1_size + pmim_size + rsa2_size,
            section_data,
            children: Vec::new(),
        })
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl FirmwareObject for PfsSection {
    fn process(&mut self, ctx: &ParseContext) -> bool {
        self.children.clear();

        if self.section_data.starts_with(PFS_HEADER) {
            match PfsPartitionedSection::new(&self.section_data) {
                Ok(mut rom) => {
                    let status = rom.process(ctx);
                    self.children.push(Box::new(rom));
                    return status;
                }
                Err(err) => {
                    log::warn!("partitioned PFS section: {err}");
                    return false;
                }
            }
        }

        if matches(&self.uuid, &PFS_FIRMWARE_VOLUMES_GUID) {
            return match discover_volumes(&self.section_data, ctx) {
                Some(volumes) => {
                    self.children.extend(volumes.into_iter().map(|v| Box::new(v) as Box<dyn FirmwareObject>));
                    true
                }
                None => false,
            };
        }

        let mut auto = AutoRaw::new(self.section_data.clone());
        auto.process(ctx);
        self.children.push(Box::new(auto));
        true
    }

    fn build(&self, generate_checksum: bool) -> Vec<u8> {
        let mut body = Vec::new();
        for child in &self.children {
            body.extend(child.build(generate_checksum));
        }
        if body.len() != self.section_data.len() {
            if !self.children.is_empty() {
                log::warn!(
                    "PFS section {} rebuild size mismatch (old {:#x} new {:#x}); emitting captured payload",
                    guid_string(&self.uuid),
                    self.section_data.len(),
                    body.len()
                );
            }
            body = self.section_data.clone();
        }

        let mut out = Vec::with_capacity(self.total_size);
        out.extend_from_slice(&self.header);
        out.extend(body);
        out.extend(self.rsa1.build(generate_checksum));
        out.extend(self.pmim.build(generate_checksum));
        out.extend(self.rsa2.build(generate_checksum));
        out
    }

    fn byte_len(&self) -> usize {
        self.total_size
    }

    fn type_name(&self) -> &'static str {
        "PFSSection"
    }

    fn guid(&self) -> Option<[u8; 16]> {
        Some(self.uuid)
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("spec", format!("{}", self.spec)),
            ("version", self.version.clone()),
            ("size", format!("{:#x}", self.total_size)),
            ("crcs", self.crcs.iter().map(|b| format!("{b:02x}")).collect()),
        ]
    }

    fn content(&self) -> &[u8] {
        &self.section_data
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        let mut children: Vec<&dyn FirmwareObject> =
            self.children.iter().map(|c| c.as_ref() as &dyn FirmwareObject).collect();
        children.push(&self.rsa1);
        children.push(&self.pmim);
        children.push(&self.rsa2);
        children
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        writeln!(
            out,
            "{}Dell PFSSection: {} spec {} version {} size {:#x} ({} bytes)",
            ts(indent),
            guid_string(&self.uuid),
            self.spec,
            self.version,
            self.total_size,
            self.total_size
        )?;
        for child in &self.children {
            child.show(out, indent + 1, None)?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, _index: usize) {
        let base = dir.join(guid_string(&self.uuid));
        write_file(&base.with_extension("data"), &self.section_data);
        if !self.rsa1.data().is_empty() {
            write_file(&base.with_extension("rsa1"), self.rsa1.data());
        }
        if !self.pmim.data().is_empty() {
            write_file(&base.with_extension("pmim"), self.pmim.data());
        }
        if !self.rsa2.data().is_empty() {
            write_file(&base.with_extension("rsa2"), self.rsa2.data());
        }
        let child_dir = dir.join(format!("section-{}", guid_string(&self.uuid)));
        for (index, child) in self.children.iter().enumerate() {
            child.dump(&child_dir, index);
        }
    }
}

/// The outer PFS container.
pub struct PfsFile {
    data: Vec<u8>,
    spec: u32,
    body_size: u32,
    sections: Vec<PfsSection>,
}

impl PfsFile {
    pub fn match_prefix(prefix: &[u8]) -> bool {
        prefix.len() >= 8 && &prefix[..8] == PFS_HEADER
    }

    pub fn new(data: &[u8]) -> Result<PfsFile, Error> {
        Error::check_len(data, 32)?;
        if &data[..8] != PFS_HEADER {
            return Err(Error::InvalidHeader("PFS header magic"));
        }
        let spec = read_u32(data, 8)?;
        let body_size = read_u32(data, 12)?;

        let footer_offset = body_size as usize + 0x10;
        let footer = clamped(data, footer_offset, 0x10);
        if footer.len() < 0x10 || &footer[8..16] != PFS_FOOTER {
            return Err(Error::InvalidHeader("PFS footer magic"));
        }

        Ok(PfsFile { data: data.to_vec(), spec, body_size, sections: Vec::new() })
    }

    pub fn sections(&self) -> &[PfsSection] {
        &self.sections
    }
}

impl FirmwareObject for PfsFile {
    fn process(&mut self, ctx: &ParseContext) -> bool {
        let body = clamped(&self.data, 0x10, self.body_size as usize).to_vec();
        let mut offset = 0usize;
        let mut status = true;
        self.sections.clear();

        while offset < body.len() {
            let mut section = match PfsSection::new(&body[offset..]) {
                Ok(section) => section,
                Err(err) => {
                    log::warn!("malformed PFS section at {offset:#x}: {err}");
                    status = false;
                    break;
                }
            };
            status &= section.process(ctx);
            let advance = section.total_size();
            self.sections.push(section);
            if advance == 0 {
                log::warn!("zero-sized PFS section at {offset:#x}");
                status = false;
                break;
            }
            offset += advance;
            if body.len() - offset.min(body.len()) < 64 {
                break;
            }
        }
        status
    }

    fn build(&self, generate_checksum: bool) -> Vec<u8> {
        let mut out = self.data[..0x10].to_vec();
        for section in &self.sections {
            out.extend(section.build(generate_checksum));
        }
        // body bytes past the last parsed section, then the footer
        let consumed: usize = 0x10 + self.sections.iter().map(|s| s.total_size()).sum::<usize>();
        out.extend_from_slice(clamped(&self.data, consumed, self.data.len()));
        out
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "PFSFile"
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        vec![("spec", format!("{:#x}", self.spec)), ("size", format!("{:#x}", self.body_size))]
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        self.sections.iter().map(|s| s as &dyn FirmwareObject).collect()
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        writeln!(
            out,
            "{}DellPFS: spec {:#x} size {:#x} ({} bytes)",
            ts(indent),
            self.spec,
            self.body_size,
            self.body_size
        )?;
        for section in &self.sections {
            section.show(out, indent + 1, None)?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, _index: usize) {
        write_file(&dir.join("pfsobject.pfs"), &self.data);
        let child_dir = dir.join("pfsobject");
        for (index, section) in self.sections.iter().enumerate() {
            section.dump(&child_dir, index);
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::fw_fs::volume::test_support::volume;

    fn pfs_section_bytes(uuid: &[u8; 16], payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; SECTION_HEADER_SIZE];
        out[..16].copy_from_slice(uuid);
        out[0x10..0x14].copy_from_slice(&1u32.to_le_bytes());
        out[0x14..0x18].copy_from_slice(b"ANNN");
        out[0x18..0x1A].copy_from_slice(&0x0Au16.to_le_bytes());
        out[0x1A..0x1C].copy_from_slice(&2u16.to_le_bytes());
        out[0x28..0x2C].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        // no signature chunks
        out.extend_from_slice(payload);
        out
    }

    fn pfs_image(sections: &[Vec<u8>]) -> Vec<u8> {
        let body: Vec<u8> = sections.concat();
        let mut out = Vec::new();
        out.extend_from_slice(PFS_HEADER);
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend(&body);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(PFS_FOOTER);
        out
    }

    #[test]
    fn pfs_with_volume_section_parses_and_rebuilds() {
        let fv = volume(&[]);
        let section = pfs_section_bytes(PFS_FIRMWARE_VOLUMES_GUID.as_bytes(), &fv);
        let image = pfs_image(&[section]);

        assert!(PfsFile::match_prefix(&image));
        let mut pfs = PfsFile::new(&image).unwrap();
        assert!(pfs.process(&ParseContext::default()));
        assert_eq!(pfs.sections().len(), 1);
        assert_eq!(pfs.sections()[0].version(), "A.2.0.0");

        let section_children = pfs.sections()[0].objects();
        assert_eq!(section_children[0].type_name(), "FirmwareVolume");

        assert_eq!(pfs.build(false), image);
    }

    #[test]
    fn missing_footer_is_invalid() {
        let mut image = pfs_image(&[]);
        let len = image.len();
        image[len - 8..].copy_from_slice(b"XXXXXXXX");
        assert!(matches!(PfsFile::new(&image), Err(Error::InvalidHeader(_))));
    }

    #[test]
    fn opaque_section_payload_round_trips() {
        let section = pfs_section_bytes(&[0x77; 16], &[0xAB; 0x80]);
        let image = pfs_image(&[section]);
        let mut pfs = PfsFile::new(&image).unwrap();
        assert!(pfs.process(&ParseContext::default()));
        assert_eq!(pfs.build(false), image);
    }
}
