//! Firmware File System (FFS) Walker
//!
//! A block region of a volume whose GUID tags it as holding files. Files are walked on
//! 8-byte alignment until a 24-byte run of 0xFF (erased space) or the end of the region;
//! whatever trails the last file is captured verbatim so rebuilds are lossless.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use std::io::{self, Write};
use std::path::Path;

use crate::fw_fs::file::FirmwareFile;
use crate::object::{FirmwareObject, ParseContext, write_file};

pub struct FirmwareFileSystem {
    data: Vec<u8>,
    files: Vec<FirmwareFile>,
    overflow_data: Vec<u8>,
}

impl FirmwareFileSystem {
    pub fn new(data: &[u8]) -> FirmwareFileSystem {
        FirmwareFileSystem { data: data.to_vec(), files: Vec::new(), overflow_data: Vec::new() }
    }

    pub fn files(&self) -> &[FirmwareFile] {
        &self.files
    }

    pub fn files_mut(&mut self) -> &mut [FirmwareFile] {
        &mut self.files
    }

    pub fn overflow_data(&self) -> &[u8] {
        &self.overflow_data
    }
}

impl FirmwareObject for FirmwareFileSystem {
    fn process(&mut self, ctx: &ParseContext) -> bool {
        let mut status = true;
        let mut offset = 0usize;
        self.files.clear();

        while offset + 24 <= self.data.len() && self.data[offset..offset + 24] != [0xFF; 24] {
            let mut file = match FirmwareFile::new(&self.data[offset..]) {
                Ok(file) => file,
                Err(err) => {
                    log::warn!("malformed firmware file at offset {offset:#x}: {err}");
                    status = false;
                    break;
                }
            };
            if file.file_size() < 24 {
                log::warn!("corrupt firmware file size {:#x} at offset {offset:#x}", file.file_size());
                break;
            }
            status &= file.process(ctx);
            offset += ((file.file_size() as usize) + 7) & !7;
            self.files.push(file);
        }

        self.overflow_data = self.data.get(offset..).unwrap_or_default().to_vec();
        status
    }

    fn build(&self, generate_checksum: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len());
        for file in &self.files {
            let built = file.build(generate_checksum);
            let built_len = built.len();
            out.extend(built);
            let aligned = (built_len + 7) & !7;
            out.extend(std::iter::repeat_n(0xFFu8, aligned - built_len));
        }
        out.extend_from_slice(&self.overflow_data);

        if out.len() != self.data.len() {
            log::warn!("file system size mismatch: old={} new={}", self.data.len(), out.len());
        }
        out
    }

    fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn type_name(&self) -> &'static str {
        "FirmwareFileSystem"
    }

    fn objects(&self) -> Vec<&dyn FirmwareObject> {
        self.files.iter().map(|f| f as &dyn FirmwareObject).collect()
    }

    fn content(&self) -> &[u8] {
        &self.data
    }

    fn show(&self, out: &mut dyn Write, indent: usize, _index: Option<usize>) -> io::Result<()> {
        for (index, file) in self.files.iter().enumerate() {
            file.show(out, indent, Some(index))?;
        }
        Ok(())
    }

    fn dump(&self, dir: &Path, _index: usize) {
        write_file(&dir.join("filesystem.ffs"), &self.data);
        for file in &self.files {
            file.dump(dir, 0);
        }
    }
}
