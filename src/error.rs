//! Parse and Rebuild Error Definitions
//!
//! Failures during parsing are values, not panics: recognizers report "not mine" with
//! [`Error::InvalidHeader`], structural under-runs with [`Error::TruncatedInput`], and the
//! tree is retained on partial failure so callers can inspect whatever did parse.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use thiserror::Error;

/// Errors produced while parsing, rebuilding, or dumping firmware structures.
#[derive(Debug, Error)]
pub enum Error {
    /// A recognizer's magic, GUID, or length checks failed; the input is not this structure.
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    /// The input slice is shorter than the structure it claims to hold.
    #[error("truncated input: needed {needed} bytes, had {available}")]
    TruncatedInput { needed: usize, available: usize },

    /// A GUID string was not in RFC4122 hyphenated form.
    #[error("malformed GUID string: {0}")]
    MalformedGuid(String),

    /// No codec in the candidate list produced output.
    #[error("decompression failed for all candidate codecs")]
    DecompressionFailed,

    /// The requested codec operation has no backing implementation.
    #[error("codec operation not supported: {0}")]
    CodecUnsupported(&'static str),

    /// Nesting exceeded the configured maximum parse depth.
    #[error("maximum parse depth exceeded")]
    DepthExceeded,

    /// An output path could not be created or written during `dump`.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for length checks against a declared structure size.
    pub fn check_len(data: &[u8], needed: usize) -> Result<(), Error> {
        if data.len() < needed {
            return Err(Error::TruncatedInput { needed, available: data.len() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn check_len_reports_both_sizes() {
        let err = Error::check_len(&[0u8; 4], 24).unwrap_err();
        match err {
            Error::TruncatedInput { needed, available } => {
                assert_eq!(needed, 24);
                assert_eq!(available, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn check_len_passes_exact() {
        assert!(Error::check_len(&[0u8; 24], 24).is_ok());
    }
}
