//! Firmware Files
//!
//! 24-byte header: name GUID, 16-bit checksum, type, attributes, 24-bit size (header
//! included), state. The state byte is stored inverted and displayed XOR 0xFF. Most file
//! types hold a section chain; raw files hide nested volumes or flash descriptors behind
//! vendor headers, and a file named with the NVAR GUID holds a variable store instead.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use std::io::{self, Write};
use std::path::Path;

use crate::auto::AutoRaw;
use crate::error::Error;
use crate::flash::{FLASH_HEADER, FlashDescriptor};
use crate::fw_fs::file_type_name;
use crate::fw_fs::guids;
use crate::fw_fs::nvar::NvarStore;
use crate::fw_fs::section::Section;
use crate::fw_fs::volume::{FirmwareVolume, find_volumes};
use crate::guid::guid_string;
use crate::object::{FirmwareObject, ParseContext, RawObject, ts, write_file};
use crate::reader::{clamped, read_array, read_u8, read_u16, read_u24};

const HEADER_SIZE: usize = 0x18;

pub struct FirmwareFile {
    guid: [u8; 16],
    checksum: u16,
    file_type: u8,
    attributes: u8,
    size: u32,
    state: u8,
    data: Vec<u8>,
    sections: Vec<Section>,
    blobs: Vec<Box<dyn FirmwareObject>>,
}

impl FirmwareFile {
    pub fn new(data: &[u8]) -> Result<FirmwareFile, Error> {
        Error::check_len(data, HEADER_SIZE)?;
        let size = read_u24(data, 20)?;
        Ok(FirmwareFile {
            guid: read_array(data, 0)?,
            checksum: read_u16(data, 16)?,
            file_type: read_u8(data, 18)?,
            attributes: read_u8(data, 19)?,
            size,
            state: read_u8(data, 23)?,
            data: clamped(data, 0, size as usize).to_vec(),
            sections: Vec::new(),
            blobs: Vec::new(),
        })
    }

    /// Declared file size, header included.
    pub fn file_size(&self) -> u32 {
        self.size
    }

    pub fn file_type(&self) -> u8 {
        self.file_type
    }

    pub fn file_guid(&self) -> [u8; 16] {
        self.guid
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn sections_mut(&mut self) -> &mut [Section] {
        &mut self.sections
    }

    fn body(&self) -> &[u8] {
        clamped(&self.data, HEADER_SIZE, self.data.len())
    }

    /// Replace the owned bytes and re-parse.
    pub fn regen(&mut self, data: Vec<u8>, ctx: &ParseContext) -> Result<bool, Error> {
        *self = FirmwareFile::new(&data)?;
        Ok(self.process(ctx))
    }

    /// Raw files hide other structures: a nested volume, a flash descriptor behind a
    /// 16-byte vendor header, or arbitrarily placed volumes among opaque spans.
    fn find_objects(&mut self, ctx: &ParseContext) -> bool {
        let body = self.body().to_vec();

        if let Ok(mut volume) = FirmwareVolume::new(&body, guid_string(&self.guid)) {
            let status = volume.process(ctx);
            self.blobs.push(Box::new(volume));
            return status;
        }

        if body.len() >= 0x14 && body[0x10..0x14] == FLASH_HEADER {
            if let Ok(mut flash) = FlashDescriptor::new(&body) {
                let status = flash.process(ctx);
                self.blobs.push(Box::new(flash));
                return status;
            }
        }

        self.blobs.extend(find_volumes(&body, ctx));
        true
    }
}

impl FirmwareObject for FirmwareFile {
    fn process(&mut self, ctx: &ParseContext) -> bool {
        self.sections.clear();
        self.blobs.clear();

        // padding files carry no sections
        if self.file_type == 0xF0 {
            return true;
        }

        if guids::matches(&self.guid, &guids::NVAR_NVRAM_GUID) {
            let body = self.body().to_vec();
            return match NvarStore::new(&body) {
                Ok(mut store) => {
                    let status = store.process(ctx);
                    let consumed = store.byte_len();
                    self.blobs.push(Box::new(store));
                    if consumed < body.len() {
                        self.blobs.push(Box::new(RawObject::new(&body[consumed..])));
                    }
                    status
                }
                Err(_) => {
                    let mut auto = AutoRaw::new(self.body().to_vec());
                    auto.process(ctx);
                    self.blobs.push(Box::new(auto));
                    true
                }
            };
        }

        if self.file_type == 0x01 {
            return self.find_objects(ctx);
        }

        if self.file_type == 0x00 {
            let mut auto = AutoRaw::new(self.body().to_vec());
            auto.process(ctx);
            self.blobs.push(Box::new(auto));
            return true;
        }

        let body = self.body().to_vec();
        let mut status = true;
        let mut offset = 0usize;
        while offset + 4 <= body.len() {
            let mut section = match Section::new(&body[offset..], self.guid) {
                Ok(section) => section,
                Err(err) => {
                    log::warn!("invalid section header in file {}: {err}", guid_string(&self.guid));
                    return false;
                }
            };
            if section.declared_size() == 0 {
                log::warn!("zero-sized section in file {}", guid_string(&self.guid));
                return false;
            }
            status &= section.process(ctx);
            offset += ((section.declared_size() as usize) + 3) & !3;
            self.sections.push(section);
        }
        status
    }

    fn build(&self, generate_checksum: bool) -> Vec<u8> {
        let mut body = Vec::new();
        for (index, section) in self.sections.iter().enumerate() {
            let built = section.build(generate_checksum);
            let built_len = built.len();
            body.extend(built);
            if index + 1 < self.sections.len() {
                let aligned = (built_len + 3) & !3;
                body.extend(std::iter::repeat_n(0x00u8, aligned - built_len));
            }
        }
        for blob in &self.blobs {
            body.extend(blob.build(generate_checksum));
        }
        if self.sections.is_empty() && self.blobs.is_empty() {
            body = self.body().to_vec();
        }

        let mut size = self.size as usize;
        let declared_body = size.saturating_sub(HEADER_SIZE);
        if body.len() < declared_body {
            body.resize(declared_body, 0x00);
        } else if body.len() > declared_body {
            size = body.len() + HEADER_SIZE;
            log::warn!(
                "file {} grew by {} bytes on rebuild",
                guid_string(&self.guid),
                body.len() - declared_body
            );
        }

        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.extend_from_slice(&self.guid);
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out.push(self.file_type);
        out.push(self.attributes);
        out.extend_from_slice(&(size as u32).to_le_bytes()[..3]);
        out.push(self.state);
        out.extend(body);
        out
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "FirmwareFile"
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        let mut children: Vec<&dyn FirmwareObject> =
            self.sections.iter().map(|s| s as &dyn FirmwareObject).collect();
        children.extend(self.blobs.iter().map(|b| b.as_ref() as &dyn FirmwareObject));
        children
    }

    fn guid(&self) -> Option<[u8; 16]> {
        Some(self.guid)
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("size", format!("{:#x}", self.size)),
            ("type", format!("{:#04x}", self.file_type)),
            ("attributes", format!("{:#04x}", self.attributes)),
            ("state", format!("{:#04x}", self.state ^ 0xFF)),
            ("type_name", file_type_name(self.file_type).0.to_string()),
        ]
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn show(&self, out: &mut dyn Write, indent: usize, index: Option<usize>) -> io::Result<()> {
        writeln!(
            out,
            "{}File {}: {} type {:#04x}, attr {:#04x}, state {:#04x}, size {:#x} ({} bytes), ({})",
            ts(indent),
            index.unwrap_or(0),
            guid_string(&self.guid),
            self.file_type,
            self.attributes,
            self.state ^ 0xFF,
            self.size,
            self.size,
            file_type_name(self.file_type).0
        )?;
        for (child_index, blob) in self.blobs.iter().enumerate() {
            blob.show(out, indent + 1, Some(child_index))?;
        }
        for (child_index, section) in self.sections.iter().enumerate() {
            section.show(out, indent + 1, Some(child_index))?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, _index: usize) {
        let parent = dir.join(format!("file-{}", guid_string(&self.guid)));
        write_file(&parent.join("file.obj"), &self.data);
        for (index, blob) in self.blobs.iter().enumerate() {
            blob.dump(&parent, index);
        }
        for (index, section) in self.sections.iter().enumerate() {
            section.dump(&parent, index);
        }
    }
}
