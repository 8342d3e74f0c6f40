//! Codecs for encoded regions.
//!
//! An encoded region owns an opaque byte window; a [`Codec`] turns it into
//! plain bytes (and back) so a child region can be parsed over a synthetic
//! in-memory source. Zlib and raw deflate ship by default; bzip2 and LZMA
//! plug in behind cargo features through the same trait.

use std::io::{Read, Write};
use std::rc::Rc;

use flate2::read::{DeflateDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, ZlibEncoder};
use flate2::Compression;

use crate::err::{Error, Result};

pub trait Codec {
    fn name(&self) -> &'static str;

    /// Opaque window bytes to plain bytes.
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Plain bytes back to an opaque window. `encode(decode(w))` need not
    /// reproduce `w` byte-for-byte, only decode to the same plain bytes.
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>>;
}

fn codec_err(codec: &'static str, e: impl std::fmt::Display) -> Error {
    Error::Codec {
        codec,
        message: e.to_string(),
    }
}

pub struct ZlibCodec;

impl ZlibCodec {
    pub fn shared() -> Rc<dyn Codec> {
        Rc::new(ZlibCodec)
    }
}

impl Codec for ZlibCodec {
    fn name(&self) -> &'static str {
        "zlib"
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| codec_err("zlib", e))?;
        Ok(out)
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).map_err(|e| codec_err("zlib", e))?;
        encoder.finish().map_err(|e| codec_err("zlib", e))
    }
}

pub struct DeflateCodec;

impl DeflateCodec {
    pub fn shared() -> Rc<dyn Codec> {
        Rc::new(DeflateCodec)
    }
}

impl Codec for DeflateCodec {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        DeflateDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| codec_err("deflate", e))?;
        Ok(out)
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).map_err(|e| codec_err("deflate", e))?;
        encoder.finish().map_err(|e| codec_err("deflate", e))
    }
}

#[cfg(feature = "bzip2-codec")]
pub struct Bzip2Codec;

#[cfg(feature = "bzip2-codec")]
impl Bzip2Codec {
    pub fn shared() -> Rc<dyn Codec> {
        Rc::new(Bzip2Codec)
    }
}

#[cfg(feature = "bzip2-codec")]
impl Codec for Bzip2Codec {
    fn name(&self) -> &'static str {
        "bzip2"
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        bzip2::read::BzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| codec_err("bzip2", e))?;
        Ok(out)
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::best());
        encoder.write_all(data).map_err(|e| codec_err("bzip2", e))?;
        encoder.finish().map_err(|e| codec_err("bzip2", e))
    }
}

#[cfg(feature = "lzma-codec")]
pub struct XzCodec;

#[cfg(feature = "lzma-codec")]
impl XzCodec {
    pub fn shared() -> Rc<dyn Codec> {
        Rc::new(XzCodec)
    }
}

#[cfg(feature = "lzma-codec")]
impl Codec for XzCodec {
    fn name(&self) -> &'static str {
        "xz"
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        xz2::read::XzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| codec_err("xz", e))?;
        Ok(out)
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        encoder.write_all(data).map_err(|e| codec_err("xz", e))?;
        encoder.finish().map_err(|e| codec_err("xz", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_zlib_round_trip() {
        let codec = ZlibCodec;
        let plain = b"the quick brown fox jumps over the lazy dog".to_vec();
        let encoded = codec.encode(&plain).unwrap();
        assert_eq!(codec.decode(&encoded).unwrap(), plain);
    }

    #[test]
    fn test_deflate_round_trip() {
        let codec = DeflateCodec;
        let plain = vec![0u8; 1024];
        let encoded = codec.encode(&plain).unwrap();
        assert!(encoded.len() < plain.len());
        assert_eq!(codec.decode(&encoded).unwrap(), plain);
    }

    #[test]
    fn test_zlib_rejects_garbage() {
        let codec = ZlibCodec;
        let err = codec.decode(&[0xde, 0xad, 0xbe, 0xef]).unwrap_err();
        assert!(matches!(err, Error::Codec { codec: "zlib", .. }));
    }
}
