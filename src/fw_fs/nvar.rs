//! NVAR Variable Stores
//!
//! NVRAM regions tagged with the NVAR GUID hold a bare chain of variable records, each
//! opening with the `NVAR` magic, a 16-bit total size, three reserved bytes, and an
//! attribute byte. The attribute bits select the optional fields that follow: a vendor
//! GUID, and an ASCII or UTF-16LE name unless the record is data-only.
//!
//! Variable records rebuild from their captured bytes; nothing inside a store is
//! recomputed.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use std::io::{self, Write};
use std::path::Path;

use bitflags::bitflags;

use crate::error::Error;
use crate::fw_fs::uefi_name;
use crate::guid::guid_string;
use crate::object::{FirmwareObject, ParseContext, ts, write_file};
use crate::reader::{clamped, read_array, read_u8, read_u16};

/// Magic + u16 total size + 3 reserved + attribute byte.
const HEADER_SIZE: usize = 10;

bitflags! {
    /// NVAR record attribute bits.
    pub struct NvarAttributes: u8 {
        const RUNTIME         = 0x01;
        const DESC_ASCII      = 0x02;
        const GUID            = 0x04;
        const DATA            = 0x08;
        const EXT_HEADER      = 0x10;
        const HW_ERROR_RECORD = 0x20;
        const AUTH_WRITE      = 0x40;
        const VALID           = 0x80;
    }
}

/// One NVAR record.
pub struct NvarVariable {
    total_size: u16,
    attributes: NvarAttributes,
    guid: Option<[u8; 16]>,
    name: Option<String>,
    data: Vec<u8>,
    value_offset: usize,
}

impl NvarVariable {
    pub fn new(data: &[u8]) -> Result<NvarVariable, Error> {
        Error::check_len(data, HEADER_SIZE)?;
        if &data[..4] != b"NVAR" {
            return Err(Error::InvalidHeader("NVAR record magic"));
        }
        let total_size = read_u16(data, 4)?;
        let attributes = NvarAttributes::from_bits_truncate(read_u8(data, 9)?);
        Ok(NvarVariable {
            total_size,
            attributes,
            guid: None,
            name: None,
            data: clamped(data, 0, total_size as usize).to_vec(),
            value_offset: HEADER_SIZE,
        })
    }

    pub fn total_size(&self) -> u16 {
        self.total_size
    }

    pub fn attributes(&self) -> NvarAttributes {
        self.attributes
    }

    pub fn vendor_guid(&self) -> Option<[u8; 16]> {
        self.guid
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Bytes after the optional GUID and name fields.
    pub fn value(&self) -> &[u8] {
        clamped(&self.data, self.value_offset, self.data.len())
    }

    fn parse_name(&self, data: &[u8]) -> Option<(String, usize)> {
        if self.attributes.contains(NvarAttributes::DESC_ASCII) {
            let end = data.iter().position(|&b| b == 0)?;
            let name = String::from_utf8_lossy(&data[..end]).into_owned();
            if name.is_empty() {
                return None;
            }
            Some((name, end + 1))
        } else {
            let end = data.chunks_exact(2).position(|pair| pair == [0, 0])?;
            let name = uefi_name(&data[..end * 2 + 2])?;
            Some((name, end * 2 + 2))
        }
    }
}

impl FirmwareObject for NvarVariable {
    fn process(&mut self, _ctx: &ParseContext) -> bool {
        let mut offset = HEADER_SIZE;
        if self.attributes.contains(NvarAttributes::GUID) {
            match read_array::<16>(&self.data, offset) {
                Ok(guid) => {
                    self.guid = Some(guid);
                    offset += 16;
                }
                Err(_) => return false,
            }
        } else {
            // a one-byte GUID-store index sits where the GUID would be
            offset += 1;
        }

        if !self.attributes.contains(NvarAttributes::DATA) {
            if let Some((name, consumed)) = self.parse_name(clamped(&self.data, offset, self.data.len())) {
                self.name = Some(name);
                offset += consumed;
            }
        }

        self.value_offset = offset.min(self.data.len());
        true
    }

    fn build(&self, _generate_checksum: bool) -> Vec<u8> {
        self.data.clone()
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "NVARVariable"
    }

    fn label(&self) -> String {
        self.name.clone().unwrap_or_default()
    }

    fn guid(&self) -> Option<[u8; 16]> {
        self.guid
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        vec![("attrs", format!("{:#04x}", self.attributes.bits()))]
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        if let (Some(guid), Some(name)) = (&self.guid, &self.name) {
            writeln!(
                out,
                "{}Variable: {} {} attrs= {:#04x}",
                ts(indent),
                guid_string(guid),
                name,
                self.attributes.bits()
            )?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, index: usize) {
        write_file(&dir.join(format!("variable{index}.nvar")), &self.data);
    }
}

/// A chain of NVAR records; there is no store header.
pub struct NvarStore {
    data: Vec<u8>,
    variables: Vec<NvarVariable>,
}

impl NvarStore {
    pub fn new(data: &[u8]) -> Result<NvarStore, Error> {
        if data.len() < 4 || &data[..4] != b"NVAR" {
            return Err(Error::InvalidHeader("NVAR store magic"));
        }
        Ok(NvarStore { data: data.to_vec(), variables: Vec::new() })
    }

    pub fn variables(&self) -> &[NvarVariable] {
        &self.variables
    }
}

impl FirmwareObject for NvarStore {
    fn process(&mut self, ctx: &ParseContext) -> bool {
        let mut offset = 0usize;
        self.variables.clear();

        while self.data.len() > offset + 4 {
            let mut variable = match NvarVariable::new(&self.data[offset..]) {
                Ok(variable) => variable,
                Err(_) => break,
            };
            if !variable.process(ctx) {
                break;
            }
            let advance = variable.total_size() as usize;
            if advance < HEADER_SIZE {
                break;
            }
            offset += advance;
            self.variables.push(variable);
        }

        // scope the store to the parsed records
        self.data.truncate(offset);
        true
    }

    fn build(&self, generate_checksum: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len());
        for variable in &self.variables {
            out.extend(variable.build(generate_checksum));
        }
        out
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "NVARVariableStore"
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        self.variables.iter().map(|v| v as &dyn FirmwareObject).collect()
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        vec![("variables", format!("{}", self.variables.len()))]
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        writeln!(out, "{}NVAR Variable Store: variables: {}", ts(indent), self.variables.len())?;
        for (index, variable) in self.variables.iter().enumerate() {
            variable.show(out, indent + 1, Some(index))?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, _index: usize) {
        write_file(&dir.join("nvar.vars"), &self.data);
        for (index, variable) in self.variables.iter().enumerate() {
            variable.dump(dir, index);
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    fn nvar_record(attributes: u8, meta: &[u8], value: &[u8]) -> Vec<u8> {
        let total = HEADER_SIZE + meta.len() + value.len();
        let mut out = Vec::new();
        out.extend_from_slice(b"NVAR");
        out.extend_from_slice(&(total as u16).to_le_bytes());
        out.extend_from_slice(&[0u8; 3]);
        out.push(attributes);
        out.extend_from_slice(meta);
        out.extend_from_slice(value);
        out
    }

    #[test]
    fn guid_and_ascii_name_record() {
        let mut meta = vec![0xCC; 16]; // vendor guid
        meta.extend(b"Setup\0");
        let record = nvar_record(0x04 | 0x02, &meta, &[1, 2, 3]);

        let mut variable = NvarVariable::new(&record).unwrap();
        assert!(variable.process(&ParseContext::default()));
        assert_eq!(variable.vendor_guid(), Some([0xCC; 16]));
        assert_eq!(variable.name(), Some("Setup"));
        assert_eq!(variable.value(), &[1, 2, 3]);
        assert_eq!(variable.build(false), record);
    }

    #[test]
    fn utf16_name_record() {
        let name: Vec<u8> = "Lang\0".encode_utf16().flat_map(u16::to_le_bytes).collect();
        let mut meta = vec![0x00]; // skip byte in place of the guid
        meta.extend(&name);
        let record = nvar_record(0x00, &meta, &[9]);

        let mut variable = NvarVariable::new(&record).unwrap();
        assert!(variable.process(&ParseContext::default()));
        assert_eq!(variable.vendor_guid(), None);
        assert_eq!(variable.name(), Some("Lang"));
        assert_eq!(variable.value(), &[9]);
    }

    #[test]
    fn store_with_guid_and_data_only_records() {
        let mut meta = vec![0xAB; 16];
        meta.extend(b"Boot\0");
        let first = nvar_record(0x04 | 0x02, &meta, &[0x01]);
        let second = nvar_record(0x08, &[0x00], &[0x55, 0x66]); // DATA bit: no name
        let mut region = first.clone();
        region.extend(&second);
        region.extend([0xFF; 6]); // erased tail, not a record

        let mut store = NvarStore::new(&region).unwrap();
        assert!(store.process(&ParseContext::default()));
        assert_eq!(store.variables().len(), 2);
        assert!(store.variables()[0].vendor_guid().is_some());
        assert!(store.variables()[0].name().is_some());
        assert!(store.variables()[1].vendor_guid().is_none());
        assert!(store.variables()[1].name().is_none());

        // store scopes itself to the parsed records
        assert_eq!(store.byte_len(), first.len() + second.len());
        let rebuilt = store.build(false);
        assert_eq!(rebuilt, region[..rebuilt.len()]);
    }

    #[test]
    fn non_nvar_region_is_rejected() {
        assert!(matches!(NvarStore::new(&[0xFF; 32]), Err(Error::InvalidHeader(_))));
        assert!(matches!(NvarVariable::new(b"EVSA\x10\x00\x00\x00\x00\x00"), Err(Error::InvalidHeader(_))));
    }
}
