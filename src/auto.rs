//! Format Auto-Detection and Concatenated-Image Walking
//!
//! [`AutoParser`] inspects an input's first bytes against the ordered recognizer list
//! (capsules, Intel ME, Dell PFS, flash descriptor, firmware volume), parses the primary
//! object, then keeps walking the tail: further recognized objects, stacked volumes found
//! by magic scan, and finally an opaque remainder. Leading 0xFF padding is skipped in
//! 1024-byte steps and re-synthesized so rebuilds keep the input length.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use std::io::{self, Write};
use std::path::Path;

use crate::capsule::FirmwareCapsule;
use crate::error::Error;
use crate::flash::FlashDescriptor;
use crate::fw_fs::volume::{FVH_SIGNATURE_OFFSET, FirmwareVolume};
use crate::me::MeContainer;
use crate::object::{FirmwareObject, ParseContext, RawObject};
use crate::pfs::PfsFile;

/// How many of the input's first bytes recognizers may inspect.
const MATCH_PREFIX_LEN: usize = 100;

/// Step used when skipping leading erased (0xFF) flash content.
const PAD_STEP: usize = 1024;

/// The file formats the auto-parser can detect, in match order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Capsule,
    MeContainer,
    PfsFile,
    FlashDescriptor,
    FirmwareVolume,
}

impl ImageKind {
    pub fn name(&self) -> &'static str {
        match self {
            ImageKind::Capsule => "capsule",
            ImageKind::MeContainer => "intel_me",
            ImageKind::PfsFile => "dell_pfs",
            ImageKind::FlashDescriptor => "flash_descriptor",
            ImageKind::FirmwareVolume => "firmware_volume",
        }
    }
}

/// Match `prefix` against the ordered recognizer list.
pub fn match_kind(prefix: &[u8]) -> Option<ImageKind> {
    if FirmwareCapsule::match_prefix(prefix) {
        return Some(ImageKind::Capsule);
    }
    if MeContainer::match_prefix(prefix) {
        return Some(ImageKind::MeContainer);
    }
    if PfsFile::match_prefix(prefix) {
        return Some(ImageKind::PfsFile);
    }
    if FlashDescriptor::match_prefix(prefix) {
        return Some(ImageKind::FlashDescriptor);
    }
    if FirmwareVolume::match_prefix(prefix) {
        return Some(ImageKind::FirmwareVolume);
    }
    None
}

fn construct(kind: ImageKind, data: &[u8]) -> Result<Box<dyn FirmwareObject>, Error> {
    Ok(match kind {
        ImageKind::Capsule => Box::new(FirmwareCapsule::new(data, "capsule")?),
        ImageKind::MeContainer => Box::new(MeContainer::new(data)?),
        ImageKind::PfsFile => Box::new(PfsFile::new(data)?),
        ImageKind::FlashDescriptor => Box::new(FlashDescriptor::new(data)?),
        ImageKind::FirmwareVolume => Box::new(FirmwareVolume::new(data, "volume")?),
    })
}

/// Opaque bytes that may turn out to be a recognized structure. `process` reports whether
/// a recognizer claimed the bytes; `build` falls back to the raw bytes either way.
pub struct AutoRaw {
    data: Vec<u8>,
    object: Option<Box<dyn FirmwareObject>>,
}

impl AutoRaw {
    pub fn new(data: Vec<u8>) -> AutoRaw {
        AutoRaw { data, object: None }
    }

    /// The recognized inner object, if any, giving up ownership.
    pub fn into_object(self) -> Option<Box<dyn FirmwareObject>> {
        self.object
    }

    pub fn object(&self) -> Option<&dyn FirmwareObject> {
        self.object.as_deref()
    }
}

impl FirmwareObject for AutoRaw {
    fn process(&mut self, ctx: &ParseContext) -> bool {
        let prefix = &self.data[..self.data.len().min(MATCH_PREFIX_LEN)];
        let Some(kind) = match_kind(prefix) else {
            return false;
        };
        let Ok(mut object) = construct(kind, &self.data) else {
            return false;
        };
        if !object.process(ctx) {
            return false;
        }
        self.object = Some(object);
        true
    }

    fn build(&self, generate_checksum: bool) -> Vec<u8> {
        match &self.object {
            Some(object) => object.build(generate_checksum),
            None => self.data.clone(),
        }
    }

    fn byte_len(&self) -> usize {
        match &self.object {
            Some(object) => object.byte_len(),
            None => self.data.len(),
        }
    }

    fn type_name(&self) -> &'static str {
        "AutoRawObject"
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        self.object.as_deref().into_iter().collect()
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn show(&self, out: &mut dyn Write, indent: usize, index: Option<usize>) -> io::Result<()> {
        match &self.object {
            Some(object) => object.show(out, indent, index),
            None => writeln!(out, "{}RawObject: size= {}", crate::object::ts(indent), self.data.len()),
        }
    }

    fn dump(&self, dir: &Path, index: usize) {
        match &self.object {
            Some(object) => object.dump(dir, index),
            None => {
                crate::object::write_file(&dir.join(format!("object{index}.raw")), &self.data);
            }
        }
    }
}

/// Ordered list of top-level objects found in one input.
pub struct MultiObject {
    objects: Vec<Box<dyn FirmwareObject>>,
}

impl MultiObject {
    pub fn new(objects: Vec<Box<dyn FirmwareObject>>) -> MultiObject {
        MultiObject { objects }
    }
}

impl FirmwareObject for MultiObject {
    fn process(&mut self, _ctx: &ParseContext) -> bool {
        true
    }

    fn build(&self, generate_checksum: bool) -> Vec<u8> {
        let mut out = Vec::new();
        for object in &self.objects {
            out.extend(object.build(generate_checksum));
        }
        out
    }

    fn byte_len(&self) -> usize {
        self.objects.iter().map(|o| o.byte_len()).sum()
    }

    fn type_name(&self) -> &'static str {
        "MultiObject"
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        self.objects.iter().map(|o| o.as_ref() as &dyn FirmwareObject).collect()
    }

    fn content(&self) -> &[u8] {
        &[]
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        for (index, object) in self.objects.iter().enumerate() {
            object.show(out, indent, Some(index))?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, _index: usize) {
        for (index, object) in self.objects.iter().enumerate() {
            object.dump(dir, index);
        }
    }
}

/// Scan for `_FVH` signatures on 16-byte alignment (plus the 8-byte half step), starting
/// past the first possible header. Returns signature offsets.
pub fn search_firmware_volumes(data: &[u8]) -> Vec<usize> {
    let mut hits = Vec::new();
    let mut aligned = 32usize;
    while aligned + 4 <= data.len() {
        if &data[aligned..aligned + 4] == b"_FVH" {
            hits.push(aligned);
        }
        let half = aligned + 8;
        if half + 4 <= data.len() && &data[half..half + 4] == b"_FVH" {
            hits.push(half);
        }
        aligned += 16;
    }
    hits
}

/// Brute-mode candidates: each `_FVH` hit reported at the volume header start
/// (signature offset minus the 40-byte header prefix).
pub fn find_volume_candidates(data: &[u8]) -> Vec<usize> {
    search_firmware_volumes(data)
        .into_iter()
        .filter(|&hit| hit >= FVH_SIGNATURE_OFFSET)
        .map(|hit| hit - FVH_SIGNATURE_OFFSET)
        .collect()
}

/// Stacked volumes discovered behind a primary object that do not cleanly abut it.
/// Gaps between the discovered volumes are kept as raw spans so the container covers its
/// whole input when any volume is found.
pub struct MultiVolumeContainer {
    data: Vec<u8>,
    indexes: Vec<usize>,
    objects: Vec<Box<dyn FirmwareObject>>,
    found_volumes: usize,
}

impl MultiVolumeContainer {
    pub fn new(data: Vec<u8>) -> MultiVolumeContainer {
        let indexes = search_firmware_volumes(&data);
        MultiVolumeContainer { data, indexes, objects: Vec::new(), found_volumes: 0 }
    }

    pub fn has_indexes(&self) -> bool {
        !self.indexes.is_empty()
    }

    /// Bytes covered once `process` succeeds: the entire input.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn into_objects(self) -> Vec<Box<dyn FirmwareObject>> {
        self.objects
    }

    pub fn process(&mut self, ctx: &ParseContext) -> bool {
        let mut consumed = 0usize;
        for &index in &self.indexes {
            let Some(start) = index.checked_sub(FVH_SIGNATURE_OFFSET) else {
                continue;
            };
            if start < consumed {
                // inside a span already claimed by an earlier hit
                continue;
            }
            if let Ok(mut volume) = FirmwareVolume::new(&self.data[start..], format!("{start:#x}")) {
                if volume.process(ctx) {
                    if start > consumed {
                        self.objects.push(Box::new(RawObject::new(&self.data[consumed..start])));
                    }
                    consumed = start + volume.byte_len();
                    self.objects.push(Box::new(volume));
                    self.found_volumes += 1;
                }
            }
        }
        if self.found_volumes == 0 {
            return false;
        }
        if consumed < self.data.len() {
            self.objects.push(Box::new(RawObject::new(&self.data[consumed..])));
        }
        true
    }
}

/// Detect and parse a whole input image.
pub struct AutoParser {
    data: Vec<u8>,
    /// Bytes of leading 0xFF padding that were skipped.
    offset: usize,
    kind: Option<ImageKind>,
}

impl AutoParser {
    /// `search` enables both the leading-padding skip and tail walking.
    pub fn new(data: &[u8], search: bool) -> AutoParser {
        let mut offset = 0usize;
        if search {
            while data[offset..].len() >= PAD_STEP && data[offset..offset + PAD_STEP] == [0xFF; PAD_STEP] {
                offset += PAD_STEP;
            }
        }
        let data = data[offset..].to_vec();
        let prefix = &data[..data.len().min(MATCH_PREFIX_LEN)];
        AutoParser { kind: match_kind(prefix), data, offset }
    }

    /// The detected primary format, if any.
    pub fn kind(&self) -> Option<ImageKind> {
        self.kind
    }

    /// Parse the primary object and walk the remainder. Returns `None` when no recognizer
    /// matches or the primary parse fails outright.
    pub fn parse(self, ctx: &ParseContext) -> Option<Box<dyn FirmwareObject>> {
        let kind = self.kind?;
        let mut primary = construct(kind, &self.data).ok()?;
        if !primary.process(ctx) {
            return None;
        }

        let mut size = primary.byte_len();
        let mut objects: Vec<Box<dyn FirmwareObject>> = vec![primary];

        // concatenated images directly behind the primary object
        while size < self.data.len() {
            let mut auto = AutoRaw::new(self.data[size..].to_vec());
            if !auto.process(ctx) {
                break;
            }
            let advance = auto.byte_len();
            if advance == 0 {
                break;
            }
            size += advance;
            match auto.into_object() {
                Some(object) => objects.push(object),
                None => break,
            }
        }

        // stacked volumes that do not cleanly abut
        let mut container = MultiVolumeContainer::new(self.data[size..].to_vec());
        if container.has_indexes() && container.process(ctx) {
            size += container.size();
            objects.extend(container.into_objects());
        }

        if size < self.data.len() {
            objects.push(Box::new(RawObject::new(&self.data[size..])));
        }

        if self.offset > 0 {
            objects.insert(0, Box::new(RawObject::new(vec![0xFFu8; self.offset])));
        }

        if objects.len() == 1 {
            return objects.pop();
        }
        Some(Box::new(MultiObject::new(objects)))
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::fw_fs::volume::test_support::volume;

    #[test]
    fn plain_volume_is_returned_unwrapped() {
        let fv = volume(&[]);
        let parser = AutoParser::new(&fv, true);
        assert_eq!(parser.kind(), Some(ImageKind::FirmwareVolume));
        let object = parser.parse(&ParseContext::default()).unwrap();
        assert_eq!(object.type_name(), "FirmwareVolume");
        assert_eq!(object.build(false), fv);
    }

    #[test]
    fn leading_padding_and_trailing_raw_become_a_multi_object() {
        let fv = volume(&vec![0xFF; 0xB8]);
        assert_eq!(fv.len(), 0x100);
        let mut image = vec![0xFFu8; 2048];
        image.extend(&fv);
        image.extend([0xAB; 16]);

        let object = AutoParser::new(&image, true).parse(&ParseContext::default()).unwrap();
        assert_eq!(object.type_name(), "MultiObject");
        let children = object.objects();
        assert_eq!(children.len(), 3);
        assert_eq!(children[0].type_name(), "RawObject");
        assert_eq!(children[0].byte_len(), 2048);
        assert_eq!(children[1].type_name(), "FirmwareVolume");
        assert_eq!(children[2].byte_len(), 16);

        // total rebuild length 2048 + 256 + 16
        assert_eq!(object.build(false).len(), image.len());
        assert_eq!(object.build(false), image);
    }

    #[test]
    fn concatenated_volumes_are_walked() {
        let first = volume(&[]);
        let second = volume(&vec![0xFF; 8]);
        let mut image = first.clone();
        image.extend(&second);

        let object = AutoParser::new(&image, true).parse(&ParseContext::default()).unwrap();
        assert_eq!(object.type_name(), "MultiObject");
        let children = object.objects();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.type_name() == "FirmwareVolume"));
        assert_eq!(object.build(false), image);
    }

    #[test]
    fn stacked_volume_behind_junk_is_found_by_magic_scan() {
        let first = volume(&[]);
        let second = volume(&[]);
        let mut image = first.clone();
        image.extend(vec![0u8; 192]); // junk the tail walker cannot recognize
        image.extend(&second);

        let object = AutoParser::new(&image, true).parse(&ParseContext::default()).unwrap();
        let children = object.objects();
        let volume_count = children.iter().filter(|c| c.type_name() == "FirmwareVolume").count();
        assert_eq!(volume_count, 2);
        assert_eq!(object.build(false), image);
    }

    #[test]
    fn unknown_input_parses_to_none() {
        let parser = AutoParser::new(&[0u8; 4096], true);
        assert_eq!(parser.kind(), None);
        assert!(parser.parse(&ParseContext::default()).is_none());
    }

    #[test]
    fn search_finds_aligned_and_half_aligned_magic() {
        let mut data = vec![0u8; 256];
        data[48..52].copy_from_slice(b"_FVH");
        data[72..76].copy_from_slice(b"_FVH"); // 8-byte half step
        let hits = search_firmware_volumes(&data);
        assert_eq!(hits, vec![48, 72]);
        assert_eq!(find_volume_candidates(&data), vec![8, 32]);
    }
}
