//! Platform Firmware Image Parsing, Extraction, and Rebuild
//!
//! This crate discovers the hierarchy of containers inside a raw firmware blob (UEFI
//! firmware volumes, file systems, files, and sections, plus Intel flash descriptors,
//! Intel ME containers, Dell PFS updates, and EFI capsule wrappers), decodes each header,
//! recursively decompresses compressed payloads, and can reassemble a byte-faithful image
//! after selective payload replacement.
//!
//! Every parsed structure implements the [`FirmwareObject`] contract: `process` parses
//! children, `build` reserializes, `show`/`info` describe, and `dump` writes the tree to
//! disk. [`AutoParser`] detects the input format; [`iterate`]/[`flatten`] expose the tree
//! to external tools.
//!
//! ## Example
//! ```no_run
//! use fw_image::{FirmwareObject, parse_image};
//!
//! let data = std::fs::read("firmware.rom").unwrap();
//! if let Some(image) = parse_image(&data) {
//!     print!("{}", fw_image::show_tree(image.as_ref()));
//!     assert_eq!(image.build(false).len(), data.len());
//! }
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

pub mod auto;
pub mod capsule;
pub mod codec;
pub mod error;
pub mod flash;
pub mod fw_fs;
pub mod guid;
pub mod me;
pub mod object;
pub mod pfs;
pub mod reader;
#[cfg(feature = "serde")]
pub mod serializable;

pub use auto::{AutoParser, AutoRaw, ImageKind, MultiObject, MultiVolumeContainer, find_volume_candidates};
pub use codec::{CompressionAlgorithm, CompressionCodecs, StandardCodecs, try_decompress};
pub use error::Error;
pub use object::{
    DEFAULT_MAX_DEPTH, FirmwareObject, FlatNode, NodeInfo, ParseContext, RawObject, flatten, iterate,
    show_tree,
};

/// Detect and parse `data` with the default codec set and depth bound.
///
/// Returns `None` when no recognizer matches (or the matched parse fails outright); see
/// [`AutoParser`] for the format list and tail-walking behavior.
pub fn parse_image(data: &[u8]) -> Option<Box<dyn FirmwareObject>> {
    parse_image_with(data, &ParseContext::default())
}

/// [`parse_image`] with a caller-supplied parse context (codec set, depth bound).
pub fn parse_image_with(data: &[u8], ctx: &ParseContext) -> Option<Box<dyn FirmwareObject>> {
    AutoParser::new(data, true).parse(ctx)
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::fw_fs::volume::test_support::{ffs_file, section, volume};
    use indoc::indoc;

    #[test]
    fn parse_image_round_trips_a_volume() {
        let file = ffs_file(&[0xA0; 16], 0xF0, &[0u8; 8]);
        let bytes = volume(&file);
        let image = parse_image(&bytes).unwrap();
        assert_eq!(image.build(false), bytes);
    }

    #[test]
    fn show_tree_renders_nested_structure() {
        let ui_name: Vec<u8> = "Setup\0".encode_utf16().flat_map(u16::to_le_bytes).collect();
        let file = ffs_file(&[0x11; 16], 0x07, &section(0x15, &ui_name));
        let bytes = volume(&file);

        let image = parse_image(&bytes).unwrap();
        let rendered = show_tree(image.as_ref());
        let expected = indoc! {"
            Firmware Volume: 8c8ce578-8a3d-4f1c-9935-896185c32dd3 attr 0x00000000, rev 2, cksum 0x0, size 0x70 (112 bytes)
              Firmware Volume Blocks: (1, 0x28)
              File 0: 11111111-1111-1111-1111-111111111111 type 0x07, attr 0x00, state 0x07, size 0x28 (40 bytes), (driver)
                Section 0: type 0x15, size 0x10 (16 bytes) (User interface name section)
                Name: Setup
        "};
        assert_eq!(rendered, expected);
    }

    #[test]
    fn flatten_covers_every_parsed_node() {
        let file = ffs_file(&[0xB0; 16], 0xF0, &[0u8; 8]);
        let bytes = volume(&file);
        let image = parse_image(&bytes).unwrap();

        let infos = iterate(image.as_ref(), false);
        let flat = flatten(&infos);
        // file system -> file
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[1].parent, Some(0));
    }
}
