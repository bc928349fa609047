//! Compression Codec Facade
//!
//! Firmware sections are compressed with one of three algorithms: the UEFI ("EFI 1.1")
//! scheme, the EDK II Tiano variant, or raw LZMA. The compression tag stored on disk does
//! not always identify the algorithm (tag 1 is used for both EFI and Tiano streams), so
//! callers hand an ordered candidate list to [`try_decompress`] and take the first codec
//! that produces output.
//!
//! The codec set is a capability: parsers receive it through the parse context, and an
//! alternate implementation can be injected to swap the backends. [`StandardCodecs`] backs
//! LZMA onto `lzma-rs` and EFI/Tiano decompression onto `mu_rust_helpers`.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use std::io::Cursor;

use mu_rust_helpers::uefi_decompress::{DecompressionAlgorithm, decompress_into_with_algo};

use crate::error::Error;

/// Upper bound on a declared decompressed size. Anything larger is treated as a corrupt
/// stream rather than an allocation request.
const MAX_DECOMPRESSED_SIZE: usize = 0x1000_0000;

/// The three codec pairs used inside firmware sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    Efi,
    Tiano,
    Lzma,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Efi => "efi",
            CompressionAlgorithm::Tiano => "tiano",
            CompressionAlgorithm::Lzma => "lzma",
        }
    }
}

/// Pluggable compressor/decompressor set.
pub trait CompressionCodecs: Send + Sync {
    fn decompress(&self, algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>, Error>;
    fn compress(&self, algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>, Error>;
}

/// Attempt each candidate in order; return the index of the first codec that succeeds
/// along with the plaintext. `None` means every candidate failed; the caller decides
/// whether to synthesize a raw fallback child.
pub fn try_decompress(
    codecs: &dyn CompressionCodecs,
    candidates: &[CompressionAlgorithm],
    data: &[u8],
) -> Option<(usize, Vec<u8>)> {
    for (index, algorithm) in candidates.iter().enumerate() {
        match codecs.decompress(*algorithm, data) {
            Ok(plain) => return Some((index, plain)),
            Err(_) => continue,
        }
    }
    None
}

/// Default codec set.
///
/// EFI/Tiano compression has no backing implementation in the ecosystem; those pairs
/// report [`Error::CodecUnsupported`] and the rebuilder falls back to the captured
/// compressed bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardCodecs;

impl StandardCodecs {
    fn uefi_decompress(&self, data: &[u8], algorithm: DecompressionAlgorithm) -> Result<Vec<u8>, Error> {
        // The stream opens with its own sizes: u32 compressed size, u32 decompressed size.
        Error::check_len(data, 8)?;
        let compressed_size = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        if compressed_size > data.len() {
            return Err(Error::DecompressionFailed);
        }
        let decompressed_size = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        if decompressed_size > MAX_DECOMPRESSED_SIZE {
            return Err(Error::DecompressionFailed);
        }
        let mut plain = vec![0u8; decompressed_size];
        decompress_into_with_algo(data, &mut plain, algorithm).map_err(|_| Error::DecompressionFailed)?;
        Ok(plain)
    }
}

impl CompressionCodecs for StandardCodecs {
    fn decompress(&self, algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>, Error> {
        match algorithm {
            CompressionAlgorithm::Efi => self.uefi_decompress(data, DecompressionAlgorithm::UefiDecompress),
            CompressionAlgorithm::Tiano => self.uefi_decompress(data, DecompressionAlgorithm::TianoDecompress),
            CompressionAlgorithm::Lzma => {
                let mut plain = Vec::new();
                lzma_rs::lzma_decompress(&mut Cursor::new(data), &mut plain)
                    .map_err(|_| Error::DecompressionFailed)?;
                Ok(plain)
            }
        }
    }

    fn compress(&self, algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Vec<u8>, Error> {
        match algorithm {
            CompressionAlgorithm::Efi => Err(Error::CodecUnsupported("efi compress")),
            CompressionAlgorithm::Tiano => Err(Error::CodecUnsupported("tiano compress")),
            CompressionAlgorithm::Lzma => {
                let mut packed = Vec::new();
                lzma_rs::lzma_compress(&mut Cursor::new(data), &mut packed)?;
                Ok(packed)
            }
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn lzma_round_trip() {
        let codecs = StandardCodecs;
        let plain = b"firmware sections compress reasonably well well well well".to_vec();
        let packed = codecs.compress(CompressionAlgorithm::Lzma, &plain).unwrap();
        let unpacked = codecs.decompress(CompressionAlgorithm::Lzma, &packed).unwrap();
        assert_eq!(unpacked, plain);
    }

    #[test]
    fn uefi_decompress_rejects_short_streams() {
        let codecs = StandardCodecs;
        assert!(codecs.decompress(CompressionAlgorithm::Efi, &[0u8; 4]).is_err());
    }

    #[test]
    fn uefi_decompress_rejects_bogus_sizes() {
        let codecs = StandardCodecs;
        // compressed size claims more bytes than the stream holds
        let mut stream = vec![0u8; 16];
        stream[0..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(codecs.decompress(CompressionAlgorithm::Tiano, &stream).is_err());
    }

    #[test]
    fn tiano_and_efi_compress_are_unsupported() {
        let codecs = StandardCodecs;
        assert!(matches!(
            codecs.compress(CompressionAlgorithm::Tiano, b"x"),
            Err(Error::CodecUnsupported(_))
        ));
        assert!(matches!(codecs.compress(CompressionAlgorithm::Efi, b"x"), Err(Error::CodecUnsupported(_))));
    }

    #[test]
    fn try_decompress_returns_first_success() {
        struct OnlySecond;
        impl CompressionCodecs for OnlySecond {
            fn decompress(&self, algorithm: CompressionAlgorithm, _data: &[u8]) -> Result<Vec<u8>, Error> {
                match algorithm {
                    CompressionAlgorithm::Tiano => Ok(b"plain".to_vec()),
                    _ => Err(Error::DecompressionFailed),
                }
            }
            fn compress(&self, _algorithm: CompressionAlgorithm, _data: &[u8]) -> Result<Vec<u8>, Error> {
                Err(Error::CodecUnsupported("test"))
            }
        }

        let result = try_decompress(
            &OnlySecond,
            &[CompressionAlgorithm::Efi, CompressionAlgorithm::Tiano],
            b"ignored",
        );
        let (index, plain) = result.unwrap();
        assert_eq!(index, 1);
        assert_eq!(plain, b"plain");

        assert!(try_decompress(&OnlySecond, &[CompressionAlgorithm::Lzma], b"ignored").is_none());
    }
}
