//! Intel Management Engine Containers
//!
//! An ME image carries a `$FPT` partition table at +0x10 (optionally preceded by the ROM
//! bypass header). Each 0x20-byte entry names a partition, its owner, offset, size, and
//! flags; the low seven flag bits give the partition type. Partitions with content open
//! with either a `$CPD` directory (newer ME) or a `$MN2`/`$MAN` manifest (older ME) whose
//! modules are Huffman-, LZMA-, or un-compressed.
//!
//! Container and partition payloads re-emit their captured bytes on rebuild; module
//! payload decompression is left to the codec facade's callers.
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
use crate::guid::guid_string;
use crate::object::{FirmwareObject, ParseContext, ts, write_file};
use crate::reader::{clamped, read_array, read_u8, read_u16, read_u32};

/// ROM bypass header some images place before the partition table.
const ME_ROM_BYPASS_HEADER: [u8; 8] = [0x20, 0x20, 0x80, 0x0F, 0x40, 0x00, 0x00, 0x24];

/// `$MN2`/`$MAN` manifest magic (module type 4, subtype 0, header length 0xA1 dwords).
const MANIFEST_MAGIC: [u8; 8] = [0x04, 0x00, 0x00, 0x00, 0xA1, 0x00, 0x00, 0x00];

const FPT_ENTRY_SIZE: usize = 0x20;
const FPT_ENTRIES_OFFSET: usize = 0x30;

fn trimmed_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0 || b == 0xFF).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Partition type from the low seven flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MePartitionType {
    Code,
    BlockIo,
    Nvram,
    Generic,
    Effs,
    Rom,
    Unknown(u8),
}

impl MePartitionType {
    fn from_flags(flags: u32) -> MePartitionType {
        match (flags & 0x7F) as u8 {
            0 => MePartitionType::Code,
            1 => MePartitionType::BlockIo,
            2 => MePartitionType::Nvram,
            3 => MePartitionType::Generic,
            4 => MePartitionType::Effs,
            5 => MePartitionType::Rom,
            other => MePartitionType::Unknown(other),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            MePartitionType::Code => "code",
            MePartitionType::BlockIo => "block-io",
            MePartitionType::Nvram => "nvram",
            MePartitionType::Generic => "generic",
            MePartitionType::Effs => "effs",
            MePartitionType::Rom => "rom",
            MePartitionType::Unknown(_) => "unknown",
        }
    }
}

/// Module payload compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeCompressionType {
    Uncompressed,
    Huffman,
    Lzma,
}

impl MeCompressionType {
    fn name(&self) -> &'static str {
        match self {
            MeCompressionType::Uncompressed => "uncompressed",
            MeCompressionType::Huffman => "huffman",
            MeCompressionType::Lzma => "lzma",
        }
    }
}

/// Which module header layout a manifest uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModuleHeaderKind {
    /// `$MAN` manifests: GUID + version header, 0x50 bytes.
    Header1,
    /// `$MN2` manifests: hash + offset header, 0x60 bytes.
    Header2,
}

impl ModuleHeaderKind {
    fn size(&self) -> usize {
        match self {
            ModuleHeaderKind::Header1 => 0x50,
            ModuleHeaderKind::Header2 => 0x60,
        }
    }
}

/// One `$MME` module inside a manifest.
pub struct MeModule {
    name: String,
    guid: Option<[u8; 16]>,
    version: Option<String>,
    offset: u32,
    size: u32,
    flags: u32,
    compression: MeCompressionType,
    data: Vec<u8>,
}

impl MeModule {
    fn new(
        manifest: &[u8],
        module_offset: usize,
        kind: ModuleHeaderKind,
        partition_offset: usize,
    ) -> Result<MeModule, Error> {
        let header = clamped(manifest, partition_offset + module_offset, kind.size());
        Error::check_len(header, kind.size())?;

        match kind {
            ModuleHeaderKind::Header1 => {
                let size = read_u32(header, 0x40)?;
                let flags = read_u32(header, 0x44)?;
                let version = format!(
                    "{}.{}.{}.{}",
                    read_u16(header, 0x14)?,
                    read_u16(header, 0x16)?,
                    read_u16(header, 0x18)?,
                    read_u16(header, 0x1A)?
                );
                Ok(MeModule {
                    name: trimmed_name(&header[0x1C..0x2C]),
                    guid: Some(read_array(header, 0x04)?),
                    version: Some(version),
                    offset: (partition_offset + module_offset) as u32,
                    size,
                    flags,
                    compression: MeCompressionType::Uncompressed,
                    data: clamped(manifest, partition_offset + module_offset, size as usize).to_vec(),
                })
            }
            ModuleHeaderKind::Header2 => {
                let offset = read_u32(header, 0x38)?;
                let size = read_u32(header, 0x40)?;
                let flags = read_u32(header, 0x50)?;
                let compression = match (flags >> 4) & 7 {
                    1 => MeCompressionType::Huffman,
                    2 => MeCompressionType::Lzma,
                    _ => MeCompressionType::Uncompressed,
                };
                Ok(MeModule {
                    name: trimmed_name(&header[0x04..0x14]),
                    guid: None,
                    version: None,
                    offset,
                    size,
                    flags,
                    compression,
                    data: clamped(manifest, offset as usize, size as usize).to_vec(),
                })
            }
        }
    }

    pub fn compression(&self) -> MeCompressionType {
        self.compression
    }

    pub fn module_name(&self) -> &str {
        &self.name
    }
}

impl FirmwareObject for MeModule {
    fn process(&mut self, _ctx: &ParseContext) -> bool {
        true
    }

    fn build(&self, _generate_checksum: bool) -> Vec<u8> {
        self.data.clone()
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "MeModule"
    }

    fn label(&self) -> String {
        self.name.clone()
    }

    fn guid(&self) -> Option<[u8; 16]> {
        self.guid
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        let mut attrs = vec![
            ("module_size", format!("{:#x}", self.size)),
            ("flags", format!("{:#x}", self.flags)),
            ("compression", self.compression.name().to_string()),
        ];
        if let Some(version) = &self.version {
            attrs.push(("version", version.clone()));
        }
        attrs
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        let guid = match &self.guid {
            Some(guid) => guid_string(guid),
            None => "(none)".to_string(),
        };
        writeln!(
            out,
            "{}ME Module name= {}, guid= {}, size= {:#x} ({})",
            ts(indent),
            self.name,
            guid,
            self.size,
            self.compression.name()
        )
    }

    fn dump(&self, dir: &Path, _index: usize) {
        let extension = match self.compression {
            MeCompressionType::Lzma => "module.lzma",
            MeCompressionType::Huffman => "module.huffman",
            MeCompressionType::Uncompressed => "module",
        };
        write_file(&dir.join(format!("{}.{extension}", self.name)), &self.data);
    }
}

/// A `$`-tagged variable-length record after the module headers ($SKU, $UVR, $MCP, ...).
pub struct MeVariableModule {
    tag: String,
    data: Vec<u8>,
}

impl MeVariableModule {
    const HEADER_SIZE: usize = 8;

    /// Two little-endian u32 values from the record body, for tags that carry them.
    fn values(&self) -> (u32, u32) {
        let first = read_u32(&self.data, 0).unwrap_or(0);
        let second = read_u32(&self.data, 4).unwrap_or(0);
        (first, second)
    }
}

impl FirmwareObject for MeVariableModule {
    fn process(&mut self, _ctx: &ParseContext) -> bool {
        true
    }

    fn build(&self, _generate_checksum: bool) -> Vec<u8> {
        self.data.clone()
    }

    fn byte_len(&self) -> usize {
        Self::HEADER_SIZE + self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "MeVariableModule"
    }

    fn label(&self) -> String {
        self.tag.clone()
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        vec![("tag", self.tag.clone()), ("size", format!("{}", self.data.len()))]
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        writeln!(out, "{}VModule tag= {}, size= {}", ts(indent), self.tag, self.data.len())
    }

    fn dump(&self, dir: &Path, index: usize) {
        write_file(&dir.join(format!("vmodule{index}.bin")), &self.data);
    }
}

/// `$MN2`/`$MAN` manifest: versioned header, module table, variable records.
pub struct MeManifest {
    data: Vec<u8>,
    header_len: u32,
    flags: u32,
    vendor: u32,
    date: u32,
    size_dwords: u32,
    tag: String,
    num_modules: u32,
    version: String,
    partition_name: String,
    partition_end: u32,
    modules: Vec<MeModule>,
    variable_modules: Vec<MeVariableModule>,
}

impl MeManifest {
    pub fn match_prefix(prefix: &[u8]) -> bool {
        prefix.len() >= 8 && prefix[..8] == MANIFEST_MAGIC
    }

    pub fn new(data: &[u8]) -> Result<MeManifest, Error> {
        Error::check_len(data, 0x290)?;
        if data[..8] != MANIFEST_MAGIC {
            return Err(Error::InvalidHeader("ME manifest magic"));
        }
        let version = format!(
            "{}.{}.{}.{}",
            read_u16(data, 0x24)?,
            read_u16(data, 0x26)?,
            read_u16(data, 0x28)?,
            read_u16(data, 0x2A)?
        );
        Ok(MeManifest {
            header_len: read_u32(data, 0x04)?,
            flags: read_u32(data, 0x0C)?,
            vendor: read_u32(data, 0x10)?,
            date: read_u32(data, 0x14)?,
            size_dwords: read_u32(data, 0x18)?,
            tag: trimmed_name(&data[0x1C..0x20]),
            num_modules: read_u32(data, 0x20)?,
            version,
            partition_name: trimmed_name(&data[0x284..0x290]),
            partition_end: 0,
            data: data.to_vec(),
            modules: Vec::new(),
            variable_modules: Vec::new(),
        })
    }

    /// Offset of the module table from the manifest start.
    fn partition_offset(&self) -> usize {
        self.header_len as usize * 4 + 12
    }

    fn parse_variable_modules(&mut self, mut offset: usize) -> bool {
        let body_end = self.size_dwords as usize * 4;
        while offset + MeVariableModule::HEADER_SIZE <= body_end.min(self.data.len()) {
            let base = self.partition_offset() + offset;
            let header = clamped(&self.data, base, MeVariableModule::HEADER_SIZE);
            if header.len() < MeVariableModule::HEADER_SIZE {
                break;
            }
            if header == [0xFF; 8] {
                offset += MeVariableModule::HEADER_SIZE;
                continue;
            }
            if header[0] != b'$' {
                break;
            }
            let tag = trimmed_name(&header[..4]);
            let declared = read_u32(header, 4).unwrap_or(0) as usize;
            let size = (declared * 4).saturating_sub(MeVariableModule::HEADER_SIZE);
            let module = MeVariableModule {
                tag: tag.clone(),
                data: clamped(&self.data, base + MeVariableModule::HEADER_SIZE, size).to_vec(),
            };
            if tag == "$MCP" {
                let (start, length) = module.values();
                self.partition_end = start.saturating_add(length);
            }
            self.variable_modules.push(module);
            offset += MeVariableModule::HEADER_SIZE + size;
            if size == 0 && declared == 0 {
                break;
            }
        }
        true
    }
}

impl FirmwareObject for MeManifest {
    fn process(&mut self, ctx: &ParseContext) -> bool {
        let kind = match self.tag.as_str() {
            "$MN2" => ModuleHeaderKind::Header2,
            "$MAN" => ModuleHeaderKind::Header1,
            _ => {
                log::warn!("unknown ME manifest tag: {}", self.tag);
                return false;
            }
        };

        self.modules.clear();
        self.variable_modules.clear();
        let mut module_offset = 0usize;
        for _ in 0..self.num_modules {
            let mut module = match MeModule::new(&self.data, module_offset, kind, self.partition_offset()) {
                Ok(module) => module,
                Err(err) => {
                    log::warn!("truncated ME module table: {err}");
                    return false;
                }
            };
            module.process(ctx);
            module_offset += kind.size();
            self.modules.push(module);
        }

        if kind == ModuleHeaderKind::Header2 {
            self.parse_variable_modules(module_offset);
        }
        true
    }

    fn build(&self, _generate_checksum: bool) -> Vec<u8> {
        self.data.clone()
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "MeManifest"
    }

    fn label(&self) -> String {
        self.partition_name.clone()
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("version", self.version.clone()),
            ("flags", format!("{:#010x}", self.flags)),
            ("module_vendor", format!("{:#06x}", self.vendor)),
            ("date", format!("{:08x}", self.date)),
            ("tag", self.tag.clone()),
            ("partition_end", format!("{:#x}", self.partition_end)),
        ]
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        let mut children: Vec<&dyn FirmwareObject> =
            self.modules.iter().map(|m| m as &dyn FirmwareObject).collect();
        children.extend(self.variable_modules.iter().map(|m| m as &dyn FirmwareObject));
        children
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        writeln!(
            out,
            "{}ME Module Manifest tag= {}, partition name= {}, version= {}",
            ts(indent),
            self.tag,
            self.partition_name,
            self.version
        )?;
        for module in &self.modules {
            module.show(out, indent + 1, None)?;
        }
        for module in &self.variable_modules {
            module.show(out, indent + 1, None)?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, _index: usize) {
        for module in &self.modules {
            module.dump(dir, 0);
        }
        for (index, module) in self.variable_modules.iter().enumerate() {
            module.dump(dir, index);
        }
    }
}

/// One `$CPD` directory entry.
pub struct CpdEntry {
    name: String,
    offset: u32,
    size: u32,
    flags: u32,
    compression: MeCompressionType,
    data: Vec<u8>,
}

impl CpdEntry {
    fn new(partition: &[u8], header_offset: usize) -> Result<CpdEntry, Error> {
        let header = clamped(partition, header_offset, 0x18);
        Error::check_len(header, 0x18)?;
        let name = trimmed_name(&header[..12]);
        let offset = read_u32(header, 12)?;
        let size = read_u32(header, 16)?;
        let flags = read_u32(header, 20)?;

        // The top byte of the offset doubles as the compression tag; `.met` metadata
        // entries are always stored uncompressed. Empirical, may need widening.
        let compression = if name.contains(".met") {
            MeCompressionType::Uncompressed
        } else {
            match offset >> 24 {
                0x02 => MeCompressionType::Huffman,
                0x00 => MeCompressionType::Lzma,
                _ => MeCompressionType::Uncompressed,
            }
        };

        let payload_offset = (offset & 0x00FF_FFFF) as usize;
        if payload_offset > partition.len() || payload_offset.saturating_add(size as usize) > partition.len() {
            return Err(Error::InvalidHeader("CPD entry bounds"));
        }

        Ok(CpdEntry {
            name,
            offset,
            size,
            flags,
            compression,
            data: clamped(partition, payload_offset, size as usize).to_vec(),
        })
    }

    pub fn compression(&self) -> MeCompressionType {
        self.compression
    }

    pub fn entry_name(&self) -> &str {
        &self.name
    }
}

impl FirmwareObject for CpdEntry {
    fn process(&mut self, _ctx: &ParseContext) -> bool {
        true
    }

    fn build(&self, _generate_checksum: bool) -> Vec<u8> {
        self.data.clone()
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "CpdEntry"
    }

    fn label(&self) -> String {
        self.name.clone()
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("offset", format!("{:#x}", self.offset)),
            ("size", format!("{:#x}", self.size)),
            ("flags", format!("{:#x}", self.flags)),
            ("compression", self.compression.name().to_string()),
        ]
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        writeln!(
            out,
            "{}ME CPD Entry name= {} offset= {:#x} size= {:#x} ({} bytes) flags= {:#x} ({})",
            ts(indent),
            self.name,
            self.offset,
            self.size,
            self.size,
            self.flags,
            self.compression.name()
        )
    }

    fn dump(&self, dir: &Path, _index: usize) {
        write_file(&dir.join(format!("{}.bin", self.name)), &self.data);
    }
}

/// `$CPD` code partition directory.
pub struct CpdManifest {
    data: Vec<u8>,
    num_modules: u32,
    flags: u32,
    partition_name: String,
    entries: Vec<CpdEntry>,
}

impl CpdManifest {
    const HEADER_SIZE: usize = 0x10;
    const ENTRY_SIZE: usize = 0x18;

    pub fn new(data: &[u8]) -> Result<CpdManifest, Error> {
        Error::check_len(data, Self::HEADER_SIZE)?;
        if &data[..4] != b"$CPD" {
            return Err(Error::InvalidHeader("CPD magic"));
        }
        Ok(CpdManifest {
            num_modules: read_u32(data, 4)?,
            flags: read_u32(data, 8)?,
            partition_name: trimmed_name(&data[12..16]),
            data: data.to_vec(),
            entries: Vec::new(),
        })
    }
}

impl FirmwareObject for CpdManifest {
    fn process(&mut self, _ctx: &ParseContext) -> bool {
        self.entries.clear();
        let mut offset = Self::HEADER_SIZE;
        for _ in 1..self.num_modules.max(1) {
            offset += Self::ENTRY_SIZE;
            match CpdEntry::new(&self.data, offset) {
                Ok(entry) => self.entries.push(entry),
                Err(_) => continue,
            }
        }
        true
    }

    fn build(&self, _generate_checksum: bool) -> Vec<u8> {
        self.data.clone()
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "CpdManifest"
    }

    fn label(&self) -> String {
        self.partition_name.clone()
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        vec![("modules", format!("{}", self.num_modules)), ("flags", format!("{:#x}", self.flags))]
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        self.entries.iter().map(|e| e as &dyn FirmwareObject).collect()
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        writeln!(
            out,
            "{}ME CPD name= {} modules= {} flags= {:#x}",
            ts(indent),
            self.partition_name,
            self.num_modules,
            self.flags
        )?;
        for entry in &self.entries {
            entry.show(out, indent + 1, None)?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, _index: usize) {
        for entry in &self.entries {
            entry.dump(dir, 0);
        }
    }
}

/// One `$FPT` partition entry.
pub struct MePartitionEntry {
    name: String,
    owner: String,
    offset: u32,
    size: u32,
    flags: u32,
    partition_type: MePartitionType,
    has_content: bool,
    data: Vec<u8>,
    manifest: Option<Box<dyn FirmwareObject>>,
}

impl MePartitionEntry {
    fn new(container: &[u8], entry_offset: usize) -> Result<MePartitionEntry, Error> {
        let header = clamped(container, entry_offset, FPT_ENTRY_SIZE);
        Error::check_len(header, FPT_ENTRY_SIZE)?;

        let offset = read_u32(header, 8)?;
        let size = read_u32(header, 12)?;
        let flags = read_u32(header, 28)?;

        let mut has_content = offset != 0xFFFF_FFFF;
        if has_content
            && (offset as usize > container.len()
                || (offset as usize).saturating_add(size as usize) > container.len())
        {
            has_content = false;
        }

        Ok(MePartitionEntry {
            name: trimmed_name(&header[..4]),
            owner: trimmed_name(&header[4..8]),
            offset,
            size,
            flags,
            partition_type: MePartitionType::from_flags(flags),
            has_content,
            data: if has_content {
                clamped(container, offset as usize, size as usize).to_vec()
            } else {
                Vec::new()
            },
            manifest: None,
        })
    }

    pub fn partition_type(&self) -> MePartitionType {
        self.partition_type
    }

    pub fn partition_name(&self) -> &str {
        &self.name
    }
}

impl FirmwareObject for MePartitionEntry {
    fn process(&mut self, ctx: &ParseContext) -> bool {
        if !self.has_content {
            return true;
        }
        if self.data.len() >= 4 && &self.data[..4] == b"$CPD" {
            if let Ok(mut cpd) = CpdManifest::new(&self.data) {
                cpd.process(ctx);
                self.manifest = Some(Box::new(cpd));
            }
        } else if let Ok(mut manifest) = MeManifest::new(&self.data) {
            if manifest.process(ctx) {
                self.manifest = Some(Box::new(manifest));
            }
        }
        true
    }

    fn build(&self, _generate_checksum: bool) -> Vec<u8> {
        self.data.clone()
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "MePartitionEntry"
    }

    fn label(&self) -> String {
        self.name.clone()
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("owner", self.owner.clone()),
            ("offset", format!("{:#x}", self.offset)),
            ("size", format!("{:#x}", self.size)),
            ("flags", format!("{:#x}", self.flags)),
            ("type", self.partition_type.name().to_string()),
        ]
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        self.manifest.as_deref().into_iter().collect()
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        writeln!(
            out,
            "{}ME Partition Entry name= {} owner= {} offset= {:#x} size= {:#x} ({} bytes) type= {}",
            ts(indent),
            self.name,
            self.owner,
            self.offset,
            self.size,
            self.size,
            self.partition_type.name()
        )?;
        if let Some(manifest) = &self.manifest {
            manifest.show(out, indent + 1, None)?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, _index: usize) {
        if self.has_content {
            write_file(&dir.join(format!("{}.partition", self.name)), &self.data);
        }
        if let Some(manifest) = &self.manifest {
            manifest.dump(&dir.join(&self.name), 0);
        }
    }
}

/// `$FPT` container: partition table plus entries.
pub struct MeContainer {
    data: Vec<u8>,
    entries: u32,
    version: u8,
    table_type: u8,
    flags: u32,
    partitions: Vec<MePartitionEntry>,
}

impl MeContainer {
    pub fn match_prefix(prefix: &[u8]) -> bool {
        (prefix.len() >= 8 && prefix[..8] == ME_ROM_BYPASS_HEADER)
            || (prefix.len() >= 0x14 && &prefix[0x10..0x14] == b"$FPT")
    }

    pub fn new(data: &[u8]) -> Result<MeContainer, Error> {
        Error::check_len(data, FPT_ENTRIES_OFFSET)?;
        if !Self::match_prefix(data) {
            return Err(Error::InvalidHeader("ME container magic"));
        }
        Ok(MeContainer {
            entries: read_u32(data, 0x14)?,
            version: read_u8(data, 0x18)?,
            table_type: read_u8(data, 0x19)?,
            flags: read_u32(data, 0x24)?,
            data: data.to_vec(),
            partitions: Vec::new(),
        })
    }

    pub fn partitions(&self) -> &[MePartitionEntry] {
        &self.partitions
    }
}

impl FirmwareObject for MeContainer {
    fn process(&mut self, ctx: &ParseContext) -> bool {
        self.partitions.clear();
        for index in 0..self.entries {
            let entry_offset = FPT_ENTRIES_OFFSET + index as usize * FPT_ENTRY_SIZE;
            match MePartitionEntry::new(&self.data, entry_offset) {
                Ok(mut entry) => {
                    if entry.process(ctx) {
                        self.partitions.push(entry);
                    }
                }
                Err(err) => {
                    log::warn!("truncated ME partition table: {err}");
                    return false;
                }
            }
        }
        true
    }

    fn build(&self, _generate_checksum: bool) -> Vec<u8> {
        self.data.clone()
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "MeContainer"
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("entries", format!("{}", self.entries)),
            ("version", format!("{:#x}", self.version)),
            ("type", format!("{:#x}", self.table_type)),
            ("flags", format!("{:#x}", self.flags)),
        ]
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        self.partitions.iter().map(|p| p as &dyn FirmwareObject).collect()
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        writeln!(
            out,
            "{}ME Container version= {:#x} entries= {} flags= {:#x}",
            ts(indent),
            self.version,
            self.entries,
            self.flags
        )?;
        for partition in &self.partitions {
            partition.show(out, indent + 1, None)?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, _index: usize) {
        write_file(&dir.join("me-container.me"), &self.data);
        for partition in &self.partitions {
            partition.dump(&dir.join("partitions"), 0);
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    fn fpt_container(partition_data: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; 0x1000];
        data[0x10..0x14].copy_from_slice(b"$FPT");
        data[0x14..0x18].copy_from_slice(&1u32.to_le_bytes()); // one entry
        data[0x18] = 0x21; // version
        // entry 0 @0x30: name, owner blank, offset 0x100, size, flags type=code
        data[0x30..0x34].copy_from_slice(b"FTPR");
        data[0x34..0x38].copy_from_slice(&[0xFF; 4]);
        data[0x38..0x3C].copy_from_slice(&0x100u32.to_le_bytes());
        data[0x3C..0x40].copy_from_slice(&(partition_data.len() as u32).to_le_bytes());
        data[0x4C..0x50].copy_from_slice(&0u32.to_le_bytes());
        data[0x100..0x100 + partition_data.len()].copy_from_slice(partition_data);
        data
    }

    #[test]
    fn fpt_table_and_entry_parse() {
        let image = fpt_container(&[0xAB; 0x40]);
        assert!(MeContainer::match_prefix(&image));

        let mut me = MeContainer::new(&image).unwrap();
        assert!(me.process(&ParseContext::default()));
        assert_eq!(me.partitions().len(), 1);
        let entry = &me.partitions()[0];
        assert_eq!(entry.partition_name(), "FTPR");
        assert_eq!(entry.partition_type(), MePartitionType::Code);
        assert_eq!(entry.byte_len(), 0x40);
        assert_eq!(me.build(false), image);
    }

    #[test]
    fn blank_offset_entry_has_no_content() {
        let mut image = fpt_container(&[]);
        image[0x38..0x3C].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        let mut me = MeContainer::new(&image).unwrap();
        assert!(me.process(&ParseContext::default()));
        assert_eq!(me.partitions()[0].byte_len(), 0);
    }

    #[test]
    fn cpd_partition_dispatches_with_compression_heuristic() {
        // $CPD with 3 modules: entry table starts after the 0x10 header; the first
        // 0x18-byte slot is skipped (it describes the directory itself).
        let mut partition = vec![0u8; 0x400];
        partition[..4].copy_from_slice(b"$CPD");
        partition[4..8].copy_from_slice(&3u32.to_le_bytes());
        partition[12..16].copy_from_slice(b"FTPR");

        // entry at 0x28: huffman (offset top byte 0x02)
        partition[0x28..0x2F].copy_from_slice(b"kernel\0");
        partition[0x34..0x38].copy_from_slice(&0x0200_0100u32.to_le_bytes());
        partition[0x38..0x3C].copy_from_slice(&8u32.to_le_bytes());
        // entry at 0x40: metadata, uncompressed by name
        partition[0x40..0x4A].copy_from_slice(b"kernel.met");
        partition[0x4C..0x50].copy_from_slice(&0x200u32.to_le_bytes());
        partition[0x50..0x54].copy_from_slice(&4u32.to_le_bytes());

        let image = fpt_container(&partition);
        let mut me = MeContainer::new(&image).unwrap();
        assert!(me.process(&ParseContext::default()));

        let children = me.partitions()[0].objects();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].type_name(), "CpdManifest");
        let entries = children[0].objects();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].label(), "kernel");
        assert_eq!(entries[1].label(), "kernel.met");
        let attrs: Vec<_> = entries.iter().map(|e| e.attrs()).collect();
        assert!(attrs[0].iter().any(|(k, v)| *k == "compression" && v == "huffman"));
        assert!(attrs[1].iter().any(|(k, v)| *k == "compression" && v == "uncompressed"));
    }

    #[test]
    fn mn2_manifest_parses_modules() {
        // header_len 0xA1 dwords puts the module table at 0x290
        let mut manifest = vec![0u8; 0x2F8];
        manifest[..8].copy_from_slice(&MANIFEST_MAGIC);
        manifest[0x18..0x1C].copy_from_slice(&0u32.to_le_bytes()); // no variable records
        manifest[0x1C..0x20].copy_from_slice(b"$MN2");
        manifest[0x20..0x24].copy_from_slice(&1u32.to_le_bytes());
        manifest[0x24..0x26].copy_from_slice(&11u16.to_le_bytes());
        manifest[0x284..0x288].copy_from_slice(b"FTPR");
        // module header at 0x290: name, payload offset/size, lzma flags
        manifest[0x290..0x294].copy_from_slice(b"$MME");
        manifest[0x294..0x29A].copy_from_slice(b"kernel");
        manifest[0x2C8..0x2CC].copy_from_slice(&0x2F0u32.to_le_bytes()); // offset
        manifest[0x2D0..0x2D4].copy_from_slice(&8u32.to_le_bytes()); // size
        manifest[0x2E0..0x2E4].copy_from_slice(&0x20u32.to_le_bytes()); // compression: lzma

        let mut parsed = MeManifest::new(&manifest).unwrap();
        assert!(parsed.process(&ParseContext::default()));
        assert_eq!(parsed.label(), "FTPR");
        let modules = parsed.objects();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].label(), "kernel");
        assert_eq!(modules[0].byte_len(), 8);
        let attrs = modules[0].attrs();
        assert!(attrs.iter().any(|(k, v)| *k == "compression" && v == "lzma"));
    }

    #[test]
    fn rom_bypass_header_matches() {
        let mut data = vec![0u8; 0x30];
        data[..8].copy_from_slice(&ME_ROM_BYPASS_HEADER);
        assert!(MeContainer::match_prefix(&data));
        assert!(!MeContainer::match_prefix(&[0u8; 0x30]));
    }
}
