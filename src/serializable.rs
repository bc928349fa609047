//! Serializable Views of Parsed Firmware
//!
//! Gated behind the `serde` feature. [`crate::object::NodeInfo`] derives `Serialize` so
//! a parsed tree can be exported to JSON for external tooling; byte sizes serialize as
//! `0x`-prefixed hex strings via [`hex_format`], matching how firmware offsets and sizes
//! are conventionally displayed.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// Helper functions for serializing numbers as hex strings.
pub mod hex_format;

#[cfg(test)]
mod unit_tests {
    use crate::object::NodeInfo;

    #[test]
    fn node_info_serializes_sizes_as_hex() {
        let info = NodeInfo {
            type_name: "FirmwareVolume".into(),
            guid: "8c8ce578-8a3d-4f1c-9935-896185c32dd3".into(),
            size: 0x48,
            ..Default::default()
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains(r#""size":"0x48""#));
        assert!(json.contains(r#""type_name":"FirmwareVolume""#));
        // content is omitted when not captured
        assert!(!json.contains("content"));
    }
}
