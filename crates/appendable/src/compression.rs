use std::io::{Read, Write};

use crate::{Error, Result};

/// Per-chunk compression codec of an appendable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompressionFormat {
    #[default]
    None,
    /// Raw DEFLATE stream.
    Flate,
    Gzip,
    Lz,
    Zlib,
}

impl CompressionFormat {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            CompressionFormat::None => 0,
            CompressionFormat::Flate => 1,
            CompressionFormat::Gzip => 2,
            CompressionFormat::Lz => 3,
            CompressionFormat::Zlib => 4,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(CompressionFormat::None),
            1 => Ok(CompressionFormat::Flate),
            2 => Ok(CompressionFormat::Gzip),
            3 => Ok(CompressionFormat::Lz),
            4 => Ok(CompressionFormat::Zlib),
            _ => Err(Error::Corrupted(format!("unknown compression format: {b}"))),
        }
    }
}

/// Codec-specific effort setting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompressionLevel {
    #[default]
    Default,
    BestSpeed,
    BestCompression,
}

impl CompressionLevel {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            CompressionLevel::Default => 0,
            CompressionLevel::BestSpeed => 1,
            CompressionLevel::BestCompression => 2,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(CompressionLevel::Default),
            1 => Ok(CompressionLevel::BestSpeed),
            2 => Ok(CompressionLevel::BestCompression),
            _ => Err(Error::Corrupted(format!("unknown compression level: {b}"))),
        }
    }

    fn flate2(self) -> flate2::Compression {
        match self {
            CompressionLevel::Default => flate2::Compression::default(),
            CompressionLevel::BestSpeed => flate2::Compression::fast(),
            CompressionLevel::BestCompression => flate2::Compression::best(),
        }
    }

    fn lz4(self) -> lz4::block::CompressionMode {
        use lz4::block::CompressionMode;
        match self {
            CompressionLevel::Default => CompressionMode::DEFAULT,
            CompressionLevel::BestSpeed => CompressionMode::FAST(1),
            CompressionLevel::BestCompression => CompressionMode::HIGHCOMPRESSION(9),
        }
    }
}

/// Compress one chunk. `format` must not be `None`.
pub(crate) fn compress(format: CompressionFormat, level: CompressionLevel, src: &[u8]) -> Result<Vec<u8>> {
    let out = match format {
        CompressionFormat::None => return Err(Error::IllegalArguments("compression format")),
        CompressionFormat::Flate => {
            let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), level.flate2());
            enc.write_all(src)?;
            enc.finish()?
        }
        CompressionFormat::Gzip => {
            let mut enc = flate2::write::GzEncoder::new(Vec::new(), level.flate2());
            enc.write_all(src)?;
            enc.finish()?
        }
        CompressionFormat::Zlib => {
            let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), level.flate2());
            enc.write_all(src)?;
            enc.finish()?
        }
        CompressionFormat::Lz => lz4::block::compress(src, Some(level.lz4()), true)?,
    };
    Ok(out)
}

/// Decompress one chunk produced by [`compress`]. `raw_len` is the expected
/// uncompressed length recorded in the chunk frame.
pub(crate) fn decompress(format: CompressionFormat, src: &[u8], raw_len: usize) -> Result<Vec<u8>> {
    let out = match format {
        CompressionFormat::None => return Err(Error::IllegalArguments("compression format")),
        CompressionFormat::Flate => {
            let mut out = Vec::with_capacity(raw_len);
            flate2::read::DeflateDecoder::new(src).read_to_end(&mut out)?;
            out
        }
        CompressionFormat::Gzip => {
            let mut out = Vec::with_capacity(raw_len);
            flate2::read::GzDecoder::new(src).read_to_end(&mut out)?;
            out
        }
        CompressionFormat::Zlib => {
            let mut out = Vec::with_capacity(raw_len);
            flate2::read::ZlibDecoder::new(src).read_to_end(&mut out)?;
            out
        }
        CompressionFormat::Lz => lz4::block::decompress(src, None)?,
    };
    if out.len() != raw_len {
        return Err(Error::Corrupted(format!(
            "chunk decompressed to {} bytes, expected {}",
            out.len(),
            raw_len
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_formats() {
        let payload: Vec<u8> = (0..4096u32).flat_map(|i| (i % 251).to_be_bytes()).collect();

        for format in [
            CompressionFormat::Flate,
            CompressionFormat::Gzip,
            CompressionFormat::Lz,
            CompressionFormat::Zlib,
        ] {
            for level in [
                CompressionLevel::Default,
                CompressionLevel::BestSpeed,
                CompressionLevel::BestCompression,
            ] {
                let stored = compress(format, level, &payload).unwrap();
                let raw = decompress(format, &stored, payload.len()).unwrap();
                assert_eq!(raw, payload, "{format:?}/{level:?}");
            }
        }
    }

    #[test]
    fn format_bytes_roundtrip() {
        for format in [
            CompressionFormat::None,
            CompressionFormat::Flate,
            CompressionFormat::Gzip,
            CompressionFormat::Lz,
            CompressionFormat::Zlib,
        ] {
            assert_eq!(CompressionFormat::from_byte(format.to_byte()).unwrap(), format);
        }
        assert!(CompressionFormat::from_byte(9).is_err());
    }
}
