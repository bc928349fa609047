//! Firmware File Sections
//!
//! A file's body is a chain of sections, each opening with the common 4-byte header
//! (24-bit size, 8-bit type) and aligned to 4 bytes relative to its predecessor.
//! Compression (0x01) and GUID-defined (0x02) sections encapsulate further sections;
//! firmware-volume-image sections (0x17) nest whole volumes; the remaining recognized
//! types decorate the tree with names or opaque payloads.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use crate::auto::AutoRaw;
use crate::codec::{CompressionAlgorithm, CompressionCodecs, try_decompress};
use crate::error::Error;
use crate::fw_fs::guids;
use crate::fw_fs::volume::FirmwareVolume;
use crate::fw_fs::{section_type_name, uefi_name};
use crate::guid::guid_string;
use crate::object::{FirmwareObject, ParseContext, ts, write_file};
use crate::reader::{clamped, read_array, read_u16, read_u24, read_u32, read_u8};

/// Nested-volume marker some HP images place at the head of a raw section.
const HP_NESTED_FV_PREFIX: &[u8] = b"123456789A";

/// A firmware file section: common header plus (possibly encapsulated) payload.
pub struct Section {
    size: u32,
    section_type: u8,
    guid: [u8; 16],
    data: Vec<u8>,
    name: Option<String>,
    parsed: Option<Box<dyn FirmwareObject>>,
    parsed_offset: usize,
}

impl Section {
    /// Read the common header and clamp the owned range to the declared size. The parent
    /// file's GUID is retained so encapsulated payloads can be traced to their file.
    pub fn new(data: &[u8], parent_guid: [u8; 16]) -> Result<Section, Error> {
        if data.len() < 4 {
            return Err(Error::InvalidHeader("section header"));
        }
        let size = read_u24(data, 0)?;
        let section_type = read_u8(data, 3)?;
        Ok(Section {
            size,
            section_type,
            guid: parent_guid,
            data: clamped(data, 0, size as usize).to_vec(),
            name: None,
            parsed: None,
            parsed_offset: 0,
        })
    }

    /// Declared size from the common header, including the header itself.
    pub fn declared_size(&self) -> u32 {
        self.size
    }

    pub fn section_type(&self) -> u8 {
        self.section_type
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn parsed_object(&self) -> Option<&dyn FirmwareObject> {
        self.parsed.as_deref()
    }

    fn body(&self) -> &[u8] {
        clamped(&self.data, 4, self.data.len())
    }

    /// Replace the owned bytes and re-parse. The new declared size is read from the
    /// replacement bytes; the enclosing file's `build` propagates any growth upward.
    pub fn regen(&mut self, data: Vec<u8>, ctx: &ParseContext) -> Result<bool, Error> {
        *self = Section::new(&data, self.guid)?;
        Ok(FirmwareObject::process(self, ctx))
    }
}

impl FirmwareObject for Section {
    fn process(&mut self, ctx: &ParseContext) -> bool {
        self.parsed = None;
        self.name = None;
        self.parsed_offset = 0;

        match self.section_type {
            0x01 => {
                let Some(child_ctx) = ctx.descend() else {
                    log::warn!("maximum parse depth exceeded in compression section");
                    return false;
                };
                match CompressedSection::new(self.body(), self.guid, ctx) {
                    Ok(mut compressed) => {
                        let status = FirmwareObject::process(&mut compressed, &child_ctx);
                        self.parsed = Some(Box::new(compressed));
                        status
                    }
                    Err(err) => {
                        log::warn!("malformed compression section: {err}");
                        false
                    }
                }
            }
            0x02 => {
                let Some(child_ctx) = ctx.descend() else {
                    log::warn!("maximum parse depth exceeded in guid-defined section");
                    return false;
                };
                match GuidDefinedSection::new(self.body(), ctx) {
                    Ok(mut guided) => {
                        let status = FirmwareObject::process(&mut guided, &child_ctx);
                        self.parsed = Some(Box::new(guided));
                        status
                    }
                    Err(err) => {
                        log::warn!("malformed guid-defined section: {err}");
                        false
                    }
                }
            }
            0x14 | 0x15 => {
                self.name = uefi_name(self.body());
                true
            }
            0x17 => {
                let Some(child_ctx) = ctx.descend() else {
                    log::warn!("maximum parse depth exceeded in volume-image section");
                    return false;
                };
                let name = guid_string(&self.guid);
                let (volume, offset) = match FirmwareVolume::new(self.body(), name.clone()) {
                    Ok(volume) => (Some(volume), 0),
                    // FFSv3 images prefix the volume with 4 extra bytes
                    Err(_) => match FirmwareVolume::new(clamped(self.body(), 4, usize::MAX), name) {
                        Ok(volume) => (Some(volume), 4),
                        Err(_) => (None, 0),
                    },
                };
                match volume {
                    Some(mut volume) => {
                        let status = FirmwareObject::process(&mut volume, &child_ctx);
                        self.parsed = Some(Box::new(volume));
                        self.parsed_offset = offset;
                        status
                    }
                    None => true,
                }
            }
            0x18 => match FreeformGuidSection::new(self.body()) {
                Ok(mut freeform) => {
                    let status = FirmwareObject::process(&mut freeform, ctx);
                    self.parsed = Some(Box::new(freeform));
                    status
                }
                Err(err) => {
                    log::warn!("malformed freeform-guid section: {err}");
                    false
                }
            },
            0x19 => {
                let Some(child_ctx) = ctx.descend() else {
                    log::warn!("maximum parse depth exceeded in raw section");
                    return false;
                };
                let body = self.body();
                if body.starts_with(HP_NESTED_FV_PREFIX) {
                    if let Ok(mut volume) =
                        FirmwareVolume::new(clamped(body, 12, usize::MAX), guid_string(&self.guid))
                    {
                        let status = FirmwareObject::process(&mut volume, &child_ctx);
                        self.parsed = Some(Box::new(volume));
                        self.parsed_offset = 12;
                        return status;
                    }
                }
                let mut auto = AutoRaw::new(body.to_vec());
                if FirmwareObject::process(&mut auto, &child_ctx) {
                    self.parsed = auto.into_object();
                }
                true
            }
            _ => true,
        }
    }

    fn build(&self, generate_checksum: bool) -> Vec<u8> {
        let mut body = match &self.parsed {
            Some(parsed) => {
                let mut out = self.body()[..self.parsed_offset.min(self.body().len())].to_vec();
                out.extend(parsed.build(generate_checksum));
                out
            }
            None => self.body().to_vec(),
        };

        let mut size = self.size as usize;
        let declared_body = size.saturating_sub(4);
        if body.len() < declared_body {
            body.resize(declared_body, 0x00);
        } else if body.len() > declared_body {
            size = body.len() + 4;
            log::warn!(
                "section (file {}) grew from {:#x} to {:#x} bytes",
                guid_string(&self.guid),
                self.size,
                size
            );
        }

        let size_bytes = (size as u32).to_le_bytes();
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&size_bytes[..3]);
        out.push(self.section_type);
        out.extend(body);
        out
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "FirmwareFileSystemSection"
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        self.parsed.as_deref().into_iter().collect()
    }

    fn label(&self) -> String {
        self.name.clone().unwrap_or_default()
    }

    fn guid(&self) -> Option<[u8; 16]> {
        Some(self.guid)
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("type", format!("{:#04x}", self.section_type)),
            ("size", format!("{:#x}", self.size)),
            ("type_name", section_type_name(self.section_type).0.to_string()),
        ]
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn show(&self, out: &mut dyn Write, indent: usize, index: Option<usize>) -> io::Result<()> {
        writeln!(
            out,
            "{}Section {}: type {:#04x}, size {:#x} ({} bytes) ({} section)",
            ts(indent),
            index.unwrap_or(0),
            self.section_type,
            self.size,
            self.size,
            section_type_name(self.section_type).0
        )?;
        if let Some(name) = &self.name {
            writeln!(out, "{}Name: {}", ts(indent), name)?;
        }
        if let Some(parsed) = &self.parsed {
            parsed.show(out, indent + 1, None)?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, index: usize) {
        let extension = section_type_name(self.section_type).1;
        write_file(&dir.join(format!("section{index}.{extension}")), self.body());
        if let Some(parsed) = &self.parsed {
            parsed.dump(&dir.join(format!("section{index}")), 0);
        }
    }
}

/// Walk `data` as a chain of sections, 4-byte aligning between entries and terminating on
/// the first zero-sized section. Returns the sections and the AND-ed child status.
pub(crate) fn process_subsections(
    data: &[u8],
    parent_guid: [u8; 16],
    ctx: &ParseContext,
) -> (Vec<Section>, bool) {
    let mut sections = Vec::new();
    let mut status = true;
    let mut offset = 0usize;

    while offset < data.len() {
        if offset % 4 != 0 {
            offset += 4 - offset % 4;
        }
        if offset >= data.len() {
            break;
        }
        let section = match Section::new(&data[offset..], parent_guid) {
            Ok(section) => section,
            Err(_) => return (sections, false),
        };
        if section.declared_size() == 0 {
            break;
        }
        offset += section.declared_size() as usize;
        let mut section = section;
        status &= FirmwareObject::process(&mut section, ctx);
        sections.push(section);
    }
    (sections, status)
}

/// Rebuild a subsection chain: section builds with 4-byte inter-section zero padding,
/// zero-padded out to `pad_to` (the pre-compression stream length).
pub(crate) fn build_subsections(sections: &[Section], pad_to: usize, generate_checksum: bool) -> Vec<u8> {
    let mut out = Vec::new();
    for (index, section) in sections.iter().enumerate() {
        let built = section.build(generate_checksum);
        let built_len = built.len();
        out.extend(built);
        if index + 1 < sections.len() {
            let aligned = (built_len + 3) & !3;
            out.extend(std::iter::repeat_n(0x00u8, aligned - built_len));
        }
    }
    if out.len() < pad_to {
        out.resize(pad_to, 0x00);
    }
    out
}

/// Compression section payload: 4-byte decompressed size, 1-byte algorithm tag, stream.
pub struct CompressedSection {
    guid: [u8; 16],
    decompressed_size: u32,
    compression_type: u8,
    subtype: Option<CompressionAlgorithm>,
    compressed_data: Vec<u8>,
    /// Skipped vendor prefix bytes preceding the real stream (Intel LZMA quirk).
    stream_offset: usize,
    plain: Option<Vec<u8>>,
    subsections: Vec<Section>,
    fallback: Option<AutoRaw>,
    codecs: Arc<dyn CompressionCodecs>,
}

impl CompressedSection {
    pub fn new(data: &[u8], guid: [u8; 16], ctx: &ParseContext) -> Result<CompressedSection, Error> {
        Error::check_len(data, 5)?;
        Ok(CompressedSection {
            guid,
            decompressed_size: read_u32(data, 0)?,
            compression_type: read_u8(data, 4)?,
            subtype: None,
            compressed_data: data[5..].to_vec(),
            stream_offset: 0,
            plain: None,
            subsections: Vec::new(),
            fallback: None,
            codecs: ctx.codecs_arc(),
        })
    }

    pub fn compression_type(&self) -> u8 {
        self.compression_type
    }

    /// The algorithm that actually decompressed the stream. Tag 1 is ambiguous between
    /// EFI and Tiano; this records which one won.
    pub fn compression_subtype(&self) -> Option<CompressionAlgorithm> {
        self.subtype
    }

    pub fn subsections(&self) -> &[Section] {
        &self.subsections
    }

    pub fn subsections_mut(&mut self) -> &mut [Section] {
        &mut self.subsections
    }

    fn decompress(&mut self) -> Option<Vec<u8>> {
        let codecs = self.codecs.clone();
        match self.compression_type {
            0x01 => {
                // EFI and Tiano share the tag; EFI wins ties.
                let candidates = [CompressionAlgorithm::Efi, CompressionAlgorithm::Tiano];
                let (index, plain) = try_decompress(codecs.as_ref(), &candidates, &self.compressed_data)?;
                self.subtype = Some(candidates[index]);
                Some(plain)
            }
            0x02 => {
                let candidates =
                    [CompressionAlgorithm::Lzma, CompressionAlgorithm::Tiano, CompressionAlgorithm::Efi];
                if let Some((index, plain)) =
                    try_decompress(codecs.as_ref(), &candidates, &self.compressed_data)
                {
                    self.subtype = Some(candidates[index]);
                    return Some(plain);
                }
                // Some vendors prefix the stream with 4 extra bytes.
                if self.compressed_data.len() > 4 {
                    if let Some((index, plain)) =
                        try_decompress(codecs.as_ref(), &candidates, &self.compressed_data[4..])
                    {
                        self.subtype = Some(candidates[index]);
                        self.stream_offset = 4;
                        return Some(plain);
                    }
                }
                None
            }
            _ => None,
        }
    }
}

impl FirmwareObject for CompressedSection {
    fn process(&mut self, ctx: &ParseContext) -> bool {
        if self.compression_type == 0x00 {
            self.plain = Some(self.compressed_data.clone());
        } else {
            match self.decompress() {
                Some(plain) => self.plain = Some(plain),
                None => {
                    log::error!(
                        "cannot decompress section (file {}), type= {}, decompressed_size= {}",
                        guid_string(&self.guid),
                        self.compression_type,
                        self.decompressed_size
                    );
                    let mut fallback = AutoRaw::new(self.compressed_data.clone());
                    FirmwareObject::process(&mut fallback, ctx);
                    self.fallback = Some(fallback);
                    return true;
                }
            }
        }

        let plain = self.plain.clone().unwrap_or_default();
        let (sections, status) = process_subsections(&plain, self.guid, ctx);
        self.subsections = sections;
        status
    }

    fn build(&self, generate_checksum: bool) -> Vec<u8> {
        let payload = match (&self.plain, self.subsections.is_empty()) {
            (Some(plain), false) => {
                let rebuilt = build_subsections(&self.subsections, plain.len(), generate_checksum);
                if rebuilt == *plain {
                    self.compressed_data.clone()
                } else if self.compression_type == 0x00 {
                    rebuilt
                } else {
                    match self.subtype.map(|algorithm| self.codecs.compress(algorithm, &rebuilt)) {
                        Some(Ok(packed)) => {
                            let mut out = self.compressed_data[..self.stream_offset].to_vec();
                            out.extend(packed);
                            out
                        }
                        _ => {
                            log::warn!(
                                "cannot re-compress modified section (file {}); emitting captured stream",
                                guid_string(&self.guid)
                            );
                            self.compressed_data.clone()
                        }
                    }
                }
            }
            _ => self.compressed_data.clone(),
        };

        let mut out = Vec::with_capacity(5 + payload.len());
        out.extend_from_slice(&self.decompressed_size.to_le_bytes());
        out.push(self.compression_type);
        out.extend(payload);
        out
    }

    fn byte_len(&self) -> usize {
        5 + self.compressed_data.len()
    }

    fn type_name(&self) -> &'static str {
        "CompressedSection"
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        let mut children: Vec<&dyn FirmwareObject> =
            self.subsections.iter().map(|s| s as &dyn FirmwareObject).collect();
        if let Some(fallback) = &self.fallback {
            children.push(fallback);
        }
        children
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        let mut attrs = vec![
            ("decompressed_size", format!("{:#x}", self.decompressed_size)),
            ("type", format!("{}", self.compression_type)),
        ];
        if let Some(subtype) = self.subtype {
            attrs.push(("subtype", subtype.name().to_string()));
        }
        attrs
    }

    fn content(&self) -> &[u8] {
        match &self.plain {
            Some(plain) => plain,
            None => &self.compressed_data,
        }
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        for (index, section) in self.subsections.iter().enumerate() {
            section.show(out, indent, Some(index))?;
        }
        if let Some(fallback) = &self.fallback {
            fallback.show(out, indent, None)?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, _index: usize) {
        for (index, section) in self.subsections.iter().enumerate() {
            section.dump(dir, index);
        }
        if let Some(fallback) = &self.fallback {
            fallback.dump(dir, 0);
        }
    }
}

/// Payload of a GUID-defined section.
enum GuidPayload {
    None,
    Sections(Vec<Section>),
    Volume(FirmwareVolume),
    Auto(AutoRaw),
}

/// GUID-defined section: 16-byte GUID, 16-bit data offset, 16-bit attribute mask, a
/// preamble of GUID-specific bytes, then the payload the GUID describes.
pub struct GuidDefinedSection {
    guid: [u8; 16],
    data_offset: u16,
    attr_mask: u16,
    preamble: Vec<u8>,
    data: Vec<u8>,
    /// Decompressed payload when the GUID selects a codec.
    plain: Option<Vec<u8>>,
    subtype: Option<CompressionAlgorithm>,
    /// Static-container walk source (payload re-prefixed with the preamble tail).
    shifted: Option<Vec<u8>>,
    payload: GuidPayload,
    codecs: Arc<dyn CompressionCodecs>,
}

impl GuidDefinedSection {
    pub const ATTR_PROCESSING_REQUIRED: u16 = 0x01;
    pub const ATTR_AUTH_STATUS_VALID: u16 = 0x02;

    pub fn new(data: &[u8], ctx: &ParseContext) -> Result<GuidDefinedSection, Error> {
        Error::check_len(data, 20)?;
        let guid: [u8; 16] = read_array(data, 0)?;
        let data_offset = read_u16(data, 16)?;
        let attr_mask = read_u16(data, 18)?;
        let preamble = clamped(data, 20, (data_offset as usize).saturating_sub(20)).to_vec();
        Ok(GuidDefinedSection {
            guid,
            data_offset,
            attr_mask,
            preamble,
            data: clamped(data, (data_offset as usize).max(20), usize::MAX).to_vec(),
            plain: None,
            subtype: None,
            shifted: None,
            payload: GuidPayload::None,
            codecs: ctx.codecs_arc(),
        })
    }

    pub fn section_guid(&self) -> [u8; 16] {
        self.guid
    }

    pub fn compression_subtype(&self) -> Option<CompressionAlgorithm> {
        self.subtype
    }

    fn decompress_guided(&mut self, algorithm: CompressionAlgorithm) -> bool {
        let codecs = self.codecs.clone();
        // The data offset is not always trustworthy: try the stream with the preamble
        // attached, then without it.
        let mut stream: Vec<u8> = self.preamble.clone();
        stream.extend_from_slice(&self.data);
        if let Ok(plain) = codecs.decompress(algorithm, &stream) {
            self.plain = Some(plain);
            self.subtype = Some(algorithm);
            return true;
        }
        if let Ok(plain) = codecs.decompress(algorithm, &self.data) {
            self.plain = Some(plain);
            self.subtype = Some(algorithm);
            return true;
        }
        false
    }

    /// Interpret an uncompressed or decompressed payload: a section chain where one
    /// parses, a nested volume otherwise.
    fn parse_payload(&mut self, source: &[u8], require: bool, ctx: &ParseContext) -> bool {
        let (sections, status) = process_subsections(source, self.guid, ctx);
        if !sections.is_empty() {
            self.payload = GuidPayload::Sections(sections);
            return status;
        }
        match FirmwareVolume::new(source, guid_string(&self.guid)) {
            Ok(mut volume) => {
                let status = FirmwareObject::process(&mut volume, ctx);
                self.payload = GuidPayload::Volume(volume);
                status
            }
            Err(_) => !require,
        }
    }
}

impl FirmwareObject for GuidDefinedSection {
    fn process(&mut self, ctx: &ParseContext) -> bool {
        if guids::matches(&self.guid, &guids::LZMA_COMPRESSED_SECTION_GUID) {
            if !self.decompress_guided(CompressionAlgorithm::Lzma) {
                return false;
            }
            let plain = self.plain.clone().unwrap_or_default();
            return self.parse_payload(&plain, false, ctx);
        }
        if guids::matches(&self.guid, &guids::TIANO_COMPRESSED_SECTION_GUID) {
            if !self.decompress_guided(CompressionAlgorithm::Tiano) {
                return false;
            }
            let plain = self.plain.clone().unwrap_or_default();
            return self.parse_payload(&plain, false, ctx);
        }
        if guids::matches(&self.guid, &guids::STATIC_CONTAINER_SECTION_GUID) {
            // The section chain starts inside the preamble tail on these containers.
            let mut shifted = self.preamble[self.preamble.len().saturating_sub(4)..].to_vec();
            shifted.extend_from_slice(&self.data);
            let status = {
                let source = shifted.clone();
                let (sections, status) = process_subsections(&source, self.guid, ctx);
                if !sections.is_empty() {
                    self.payload = GuidPayload::Sections(sections);
                    status
                } else if let Ok(mut volume) = FirmwareVolume::new(&source, guid_string(&self.guid)) {
                    let status = FirmwareObject::process(&mut volume, ctx);
                    self.payload = GuidPayload::Volume(volume);
                    status
                } else {
                    let mut auto = AutoRaw::new(source);
                    FirmwareObject::process(&mut auto, ctx);
                    self.payload = GuidPayload::Auto(auto);
                    false
                }
            };
            self.shifted = Some(shifted);
            return status;
        }
        if guids::matches(&self.guid, &guids::FIRMWARE_VOLUME_SECTION_GUID) {
            let data = self.data.clone();
            return self.parse_payload(&data, true, ctx);
        }
        // Unknown guided sections: best-effort "treat as volume", never fatal.
        let data = self.data.clone();
        match FirmwareVolume::new(&data, guid_string(&self.guid)) {
            Ok(mut volume) => {
                FirmwareObject::process(&mut volume, ctx);
                self.payload = GuidPayload::Volume(volume);
            }
            Err(_) => self.payload = GuidPayload::None,
        }
        true
    }

    fn build(&self, generate_checksum: bool) -> Vec<u8> {
        // Baseline: the byte stream the children were parsed from.
        let baseline: &[u8] = match (&self.plain, &self.shifted) {
            (Some(plain), _) => plain,
            (None, Some(shifted)) => shifted,
            (None, None) => &self.data,
        };

        let rebuilt = match &self.payload {
            GuidPayload::Sections(sections) => {
                Some(build_subsections(sections, baseline.len(), generate_checksum))
            }
            GuidPayload::Volume(volume) => Some(volume.build(generate_checksum)),
            GuidPayload::Auto(_) | GuidPayload::None => None,
        };

        let body: Vec<u8> = match rebuilt {
            Some(rebuilt) if rebuilt != baseline => {
                // Children changed: re-emit through the codec when the GUID mandates one.
                let rebuilt = match &self.shifted {
                    // drop the duplicated preamble tail before emitting
                    Some(_) => rebuilt[4.min(rebuilt.len())..].to_vec(),
                    None => rebuilt,
                };
                match self.subtype {
                    Some(algorithm) => match self.codecs.compress(algorithm, &rebuilt) {
                        Ok(packed) => packed,
                        Err(_) => {
                            log::warn!(
                                "cannot re-compress modified guided section {}; emitting captured bytes",
                                guid_string(&self.guid)
                            );
                            self.data.clone()
                        }
                    },
                    None => rebuilt,
                }
            }
            _ => self.data.clone(),
        };

        let mut out = Vec::with_capacity(20 + self.preamble.len() + body.len());
        out.extend_from_slice(&self.guid);
        out.extend_from_slice(&self.data_offset.to_le_bytes());
        out.extend_from_slice(&self.attr_mask.to_le_bytes());
        out.extend_from_slice(&self.preamble);
        out.extend(body);
        out
    }

    fn byte_len(&self) -> usize {
        20 + self.preamble.len() + self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "GuidDefinedSection"
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        match &self.payload {
            GuidPayload::Sections(sections) => sections.iter().map(|s| s as &dyn FirmwareObject).collect(),
            GuidPayload::Volume(volume) => vec![volume],
            GuidPayload::Auto(auto) => vec![auto],
            GuidPayload::None => Vec::new(),
        }
    }

    fn guid(&self) -> Option<[u8; 16]> {
        Some(self.guid)
    }

    fn attrs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("offset", format!("{:#x}", self.data_offset)),
            ("attrs", format!("{:#x}", self.attr_mask)),
        ]
    }

    fn content(&self) -> &[u8] {
        match &self.plain {
            Some(plain) => plain,
            None => &self.data,
        }
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        let auth_status = if self.attr_mask == Self::ATTR_AUTH_STATUS_VALID {
            "AUTH_VALID"
        } else if self.attr_mask == Self::ATTR_PROCESSING_REQUIRED {
            "PROCESSING_REQUIRED"
        } else {
            "ATTR_UNKNOWN"
        };
        writeln!(
            out,
            "{}Guid-Defined: {} offset= {:#x} attrs= {:#x} ({})",
            ts(indent),
            guid_string(&self.guid),
            self.data_offset,
            self.attr_mask,
            auth_status
        )?;
        for (index, child) in self.objects().iter().enumerate() {
            child.show(out, indent + 1, Some(index))?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, _index: usize) {
        for (index, child) in self.objects().iter().enumerate() {
            child.dump(dir, index);
        }
        write_file(&dir.join("guided.preamble"), &self.preamble);
    }
}

/// Freeform-GUID section: a subtype GUID followed by opaque bytes; only the well-known
/// character-description label GUID is interpreted.
pub struct FreeformGuidSection {
    guid: [u8; 16],
    data: Vec<u8>,
    name: Option<String>,
}

impl FreeformGuidSection {
    pub fn new(data: &[u8]) -> Result<FreeformGuidSection, Error> {
        Error::check_len(data, 16)?;
        Ok(FreeformGuidSection { guid: read_array(data, 0)?, data: data[16..].to_vec(), name: None })
    }
}

impl FirmwareObject for FreeformGuidSection {
    fn process(&mut self, _ctx: &ParseContext) -> bool {
        if guids::matches(&self.guid, &guids::CHAR_GUID) {
            self.name = uefi_name(clamped(&self.data, 12, usize::MAX));
        }
        true
    }

    fn build(&self, _generate_checksum: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.data.len());
        out.extend_from_slice(&self.guid);
        out.extend_from_slice(&self.data);
        out
    }

    fn byte_len(&self) -> usize {
        16 + self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "FreeformGuidSection"
    }

    fn label(&self) -> String {
        self.name.clone().unwrap_or_default()
    }

    fn guid(&self) -> Option<[u8; 16]> {
        Some(self.guid)
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        if let Some(name) = &self.name {
            writeln!(out, "{}GUID Description: {}", ts(indent), name)?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, index: usize) {
        write_file(&dir.join(format!("freeform{index}.guid")), &self.data);
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::codec::StandardCodecs;
    use crate::fw_fs::volume::test_support::{section, volume};
    use std::sync::Arc;

    const FILE_GUID: [u8; 16] = [0x42; 16];

    /// Codec set that must never be consulted.
    struct PanicCodecs;
    impl CompressionCodecs for PanicCodecs {
        fn decompress(&self, _a: CompressionAlgorithm, _d: &[u8]) -> Result<Vec<u8>, crate::error::Error> {
            panic!("codec invoked for an uncompressed stream");
        }
        fn compress(&self, _a: CompressionAlgorithm, _d: &[u8]) -> Result<Vec<u8>, crate::error::Error> {
            panic!("codec invoked for an uncompressed stream");
        }
    }

    /// Codec set with scripted outcomes per algorithm.
    struct MockCodecs {
        efi: Option<Vec<u8>>,
        tiano: Option<Vec<u8>>,
        lzma: Option<Vec<u8>>,
        lzma_wants_offset: bool,
    }

    impl MockCodecs {
        fn none() -> MockCodecs {
            MockCodecs { efi: None, tiano: None, lzma: None, lzma_wants_offset: false }
        }
    }

    impl CompressionCodecs for MockCodecs {
        fn decompress(&self, algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>, crate::error::Error> {
            if self.lzma_wants_offset && algorithm == CompressionAlgorithm::Lzma && data.first() == Some(&0xEE) {
                return Err(crate::error::Error::DecompressionFailed);
            }
            let out = match algorithm {
                CompressionAlgorithm::Efi => &self.efi,
                CompressionAlgorithm::Tiano => &self.tiano,
                CompressionAlgorithm::Lzma => &self.lzma,
            };
            out.clone().ok_or(crate::error::Error::DecompressionFailed)
        }
        fn compress(&self, _algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>, crate::error::Error> {
            // "compression" that tags the stream so tests can spot a re-compress
            let mut out = b"packed:".to_vec();
            out.extend_from_slice(data);
            Ok(out)
        }
    }

    fn ctx_with(codecs: impl CompressionCodecs + 'static) -> ParseContext {
        ParseContext::new(Arc::new(codecs))
    }

    /// A subsection stream: one raw section holding four bytes.
    fn inner_stream() -> Vec<u8> {
        section(0x19, &[0xAA, 0xBB, 0xCC, 0xDD])
    }

    fn compression_section(tag: u8, payload: &[u8], decompressed_size: u32) -> Vec<u8> {
        let mut body = decompressed_size.to_le_bytes().to_vec();
        body.push(tag);
        body.extend_from_slice(payload);
        section(0x01, &body)
    }

    #[test]
    fn tag_zero_round_trips_without_touching_a_codec() {
        let stream = inner_stream();
        let bytes = compression_section(0x00, &stream, stream.len() as u32);
        let mut sec = Section::new(&bytes, FILE_GUID).unwrap();
        assert!(FirmwareObject::process(&mut sec, &ctx_with(PanicCodecs)));

        let parsed = sec.parsed_object().unwrap();
        assert_eq!(parsed.type_name(), "CompressedSection");
        assert_eq!(parsed.objects().len(), 1);
        assert_eq!(sec.build(false), bytes);
    }

    #[test]
    fn tag_one_prefers_efi_over_tiano() {
        let stream = inner_stream();
        let codecs = MockCodecs { efi: Some(stream.clone()), tiano: Some(vec![0u8; 8]), ..MockCodecs::none() };
        let bytes = compression_section(0x01, b"opaque-compressed", stream.len() as u32);

        let mut sec = Section::new(&bytes, FILE_GUID).unwrap();
        assert!(FirmwareObject::process(&mut sec, &ctx_with(codecs)));
        let attrs = sec.parsed_object().unwrap().attrs();
        assert!(attrs.iter().any(|(k, v)| *k == "subtype" && v == "efi"));
    }

    #[test]
    fn tag_one_falls_back_to_tiano_when_efi_fails() {
        let stream = inner_stream();
        let codecs = MockCodecs { tiano: Some(stream.clone()), ..MockCodecs::none() };
        let bytes = compression_section(0x01, b"opaque-compressed", stream.len() as u32);

        let mut sec = Section::new(&bytes, FILE_GUID).unwrap();
        assert!(FirmwareObject::process(&mut sec, &ctx_with(codecs)));
        let parsed = sec.parsed_object().unwrap();
        let attrs = parsed.attrs();
        assert!(attrs.iter().any(|(k, v)| *k == "subtype" && v == "tiano"));
        assert_eq!(parsed.objects().len(), 1);
        assert_eq!(sec.build(false), bytes);
    }

    #[test]
    fn tag_two_retries_past_a_four_byte_vendor_prefix() {
        let stream = inner_stream();
        // payload opens with a marker byte the mock rejects; the +4 retry strips it
        let mut payload = vec![0xEE, 0x00, 0x00, 0x00];
        payload.extend(b"lzma-bytes");
        let codecs = MockCodecs {
            lzma: Some(stream.clone()),
            lzma_wants_offset: true,
            ..MockCodecs::none()
        };
        let bytes = compression_section(0x02, &payload, stream.len() as u32);

        let mut sec = Section::new(&bytes, FILE_GUID).unwrap();
        assert!(FirmwareObject::process(&mut sec, &ctx_with(codecs)));
        let attrs = sec.parsed_object().unwrap().attrs();
        assert!(attrs.iter().any(|(k, v)| *k == "subtype" && v == "lzma"));
        assert_eq!(sec.build(false), bytes);
    }

    #[test]
    fn failed_decompression_exposes_raw_fallback_child() {
        let bytes = compression_section(0x01, b"not-a-stream", 64);
        let mut sec = Section::new(&bytes, FILE_GUID).unwrap();
        // non-fatal: the tree keeps the compressed payload as a raw child
        assert!(FirmwareObject::process(&mut sec, &ctx_with(MockCodecs::none())));
        let parsed = sec.parsed_object().unwrap();
        assert_eq!(parsed.objects().len(), 1);
        assert_eq!(sec.build(false), bytes);
    }

    #[test]
    fn modified_subsection_forces_recompression() {
        let stream = inner_stream();
        let body_payload = b"old-compressed".to_vec();
        let mut cs = {
            let mut body = (stream.len() as u32).to_le_bytes().to_vec();
            body.push(0x02);
            body.extend_from_slice(&body_payload);
            CompressedSection::new(&body, FILE_GUID, &ctx_with(MockCodecs {
                lzma: Some(stream.clone()),
                ..MockCodecs::none()
            }))
            .unwrap()
        };
        let ctx = ctx_with(MockCodecs { lzma: Some(stream.clone()), ..MockCodecs::none() });
        assert!(FirmwareObject::process(&mut cs, &ctx));

        // unmodified: captured compressed bytes are re-emitted
        assert_eq!(&cs.build(false)[5..], &body_payload[..]);

        // swap the subsection payload; the rebuild goes back through the codec
        let replacement = section(0x19, &[0x11, 0x22, 0x33, 0x44]);
        assert!(cs.subsections_mut()[0].regen(replacement, &ctx).unwrap());
        let rebuilt = cs.build(false);
        assert!(rebuilt[5..].starts_with(b"packed:"));
    }

    #[test]
    fn guided_lzma_yields_nested_volume() {
        let fv_bytes = volume(&[]);
        let codecs = MockCodecs { lzma: Some(fv_bytes.clone()), ..MockCodecs::none() };

        let mut body = guids::LZMA_COMPRESSED_SECTION_GUID.as_bytes().to_vec();
        body.extend_from_slice(&20u16.to_le_bytes()); // data offset: no preamble
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(b"opaque-lzma-blob");
        let bytes = section(0x02, &body);

        let mut sec = Section::new(&bytes, FILE_GUID).unwrap();
        assert!(FirmwareObject::process(&mut sec, &ctx_with(codecs)));
        let guided = sec.parsed_object().unwrap();
        assert_eq!(guided.objects().len(), 1);
        assert_eq!(guided.objects()[0].type_name(), "FirmwareVolume");
        // unmodified round trip
        assert_eq!(sec.build(false), bytes);
    }

    #[test]
    fn unknown_guided_section_is_tolerated() {
        let mut body = vec![0x5A; 16]; // unknown guid
        body.extend_from_slice(&20u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&[0x77; 24]);
        let bytes = section(0x02, &body);

        let mut sec = Section::new(&bytes, FILE_GUID).unwrap();
        assert!(FirmwareObject::process(&mut sec, &ctx_with(PanicCodecs)));
        assert!(sec.parsed_object().unwrap().objects().is_empty());
        assert_eq!(sec.build(false), bytes);
    }

    #[test]
    fn volume_image_section_retries_at_offset_four() {
        let fv_bytes = volume(&[]);
        let mut body = vec![0u8; 4]; // FFSv3 prefix
        body.extend(&fv_bytes);
        let bytes = section(0x17, &body);

        let mut sec = Section::new(&bytes, FILE_GUID).unwrap();
        assert!(FirmwareObject::process(&mut sec, &ctx_with(PanicCodecs)));
        assert_eq!(sec.objects()[0].type_name(), "FirmwareVolume");
        assert_eq!(sec.build(false), bytes);
    }

    #[test]
    fn ui_section_decodes_name() {
        let name: Vec<u8> = "FullShell\0".encode_utf16().flat_map(u16::to_le_bytes).collect();
        let bytes = section(0x15, &name);
        let mut sec = Section::new(&bytes, FILE_GUID).unwrap();
        assert!(FirmwareObject::process(&mut sec, &ctx_with(PanicCodecs)));
        assert_eq!(sec.name(), Some("FullShell"));
        assert_eq!(sec.label(), "FullShell");
        assert_eq!(sec.build(false), bytes);
    }

    #[test]
    fn freeform_char_guid_carries_description() {
        let mut body = guids::CHAR_GUID.as_bytes().to_vec();
        body.extend_from_slice(&[0u8; 12]); // label header
        body.extend("BiosInfo\0".encode_utf16().flat_map(u16::to_le_bytes).collect::<Vec<u8>>());
        let bytes = section(0x18, &body);

        let mut sec = Section::new(&bytes, FILE_GUID).unwrap();
        assert!(FirmwareObject::process(&mut sec, &ctx_with(PanicCodecs)));
        assert_eq!(sec.parsed_object().unwrap().label(), "BiosInfo");
        assert_eq!(sec.build(false), bytes);
    }

    #[test]
    fn nesting_deeper_than_the_budget_fails() {
        // three levels of tag-0 compression sections
        let mut bytes = section(0x19, &[0x00; 4]);
        for _ in 0..3 {
            let mut body = (bytes.len() as u32).to_le_bytes().to_vec();
            body.push(0x00);
            body.extend_from_slice(&bytes);
            bytes = section(0x01, &body);
        }

        let shallow = ParseContext::with_max_depth(Arc::new(StandardCodecs), 2);
        let mut sec = Section::new(&bytes, FILE_GUID).unwrap();
        assert!(!FirmwareObject::process(&mut sec, &shallow));

        let deep = ParseContext::with_max_depth(Arc::new(StandardCodecs), 8);
        let mut sec = Section::new(&bytes, FILE_GUID).unwrap();
        assert!(FirmwareObject::process(&mut sec, &deep));
    }

    #[test]
    fn zero_sized_subsection_terminates_the_walk() {
        let mut stream = inner_stream();
        stream.extend_from_slice(&[0u8; 8]); // zero-sized section header then junk
        let bytes = compression_section(0x00, &stream, stream.len() as u32);

        let mut sec = Section::new(&bytes, FILE_GUID).unwrap();
        assert!(FirmwareObject::process(&mut sec, &ctx_with(PanicCodecs)));
        assert_eq!(sec.parsed_object().unwrap().objects().len(), 1);
    }

    #[test]
    fn short_header_is_invalid() {
        assert!(matches!(Section::new(&[0x01, 0x02], FILE_GUID), Err(Error::InvalidHeader(_))));
    }
}
