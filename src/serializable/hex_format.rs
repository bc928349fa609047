//! Hex Format Utilities
//!
//! Serialize sizes and offsets as `0x`-prefixed hex strings. Firmware structures are
//! universally discussed in hex; emitting decimal JSON would force every consumer to
//! convert back.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use core::fmt::LowerHex;

use serde::{Deserialize, Deserializer, Serializer, de};

/// Serialize a number as a hex string with a "0x" prefix.
pub fn serialize<T, S>(num: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: LowerHex,
    S: Serializer,
{
    serializer.serialize_str(&format!("0x{num:x}"))
}

/// Deserialize a number from a "0x"-prefixed hex string.
pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: TryFrom<u64>,
    D: Deserializer<'de>,
{
    let s: &str = Deserialize::deserialize(deserializer)?;
    let digits = s.strip_prefix("0x").ok_or_else(|| de::Error::custom("missing '0x' prefix"))?;
    let value = u64::from_str_radix(digits, 16).map_err(de::Error::custom)?;
    T::try_from(value).map_err(|_| de::Error::custom("hex value out of range"))
}

#[cfg(test)]
mod unit_tests {
    use serde::{Deserialize, Serialize};

    use crate::serializable::hex_format;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Span {
        #[serde(with = "hex_format")]
        offset: usize,
        #[serde(with = "hex_format")]
        size: u32,
    }

    #[test]
    fn round_trip() {
        let span = Span { offset: 0x1000, size: 0x48 };
        let json = serde_json::to_string(&span).unwrap();
        assert_eq!(json, r#"{"offset":"0x1000","size":"0x48"}"#);
        assert_eq!(serde_json::from_str::<Span>(&json).unwrap(), span);
    }

    #[test]
    fn missing_prefix_is_rejected() {
        assert!(serde_json::from_str::<Span>(r#"{"offset":"1000","size":"0x48"}"#).is_err());
    }

    #[test]
    fn out_of_range_is_rejected() {
        assert!(serde_json::from_str::<Span>(r#"{"offset":"0x0","size":"0x1ffffffff"}"#).is_err());
    }
}
