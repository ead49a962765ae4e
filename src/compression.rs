//! Message compression for the OP_COMPRESSED envelope.
//!
//! Each algorithm is gated behind its own feature flag. The no-op compressor is always available:
//! it is what the server uses when it declines to compress a reply, and it lets frames be wrapped
//! without pulling in a codec.


use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::error::{Error, ErrorKind, Result};

/// The wire identifier of a compression algorithm, as carried in the OP_COMPRESSED header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
#[non_exhaustive]
pub enum CompressorId {
    /// The payload is stored uncompressed.
    Noop = 0,
    /// `snappy` compression.
    Snappy = 1,
    /// `zlib` compression.
    Zlib = 2,
    /// `zstd` compression.
    Zstd = 3,
}

impl CompressorId {
    pub(crate) fn from_u8(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Self::Noop),
            1 => Ok(Self::Snappy),
            2 => Ok(Self::Zlib),
            3 => Ok(Self::Zstd),
            other => Err(Error::invalid_response(format!(
                "Unsupported compressor ID returned from the server: {other}"
            ))),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Snappy => "snappy",
            Self::Zlib => "zlib",
            Self::Zstd => "zstd",
        }
    }
}

impl fmt::Display for CompressorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The compressors that may be used to compress messages sent to and decompress messages returned
/// from the server. Each real algorithm requires enabling a corresponding feature flag.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[non_exhaustive]
pub enum Compressor {
    /// Frames the payload in an OP_COMPRESSED envelope without compressing it.
    Noop,
    /// `zstd` compression. If no level is specified, [zstd::DEFAULT_COMPRESSION_LEVEL] is used.
    #[cfg(feature = "zstd-compression")]
    Zstd {
        /// Must be within [zstd::compression_level_range].
        level: Option<i32>,
    },
    /// `zlib` compression. If no level is specified, [flate2::Compression::default] is used.
    #[cfg(feature = "zlib-compression")]
    Zlib {
        /// Must be between 0 and 9 inclusive.
        level: Option<u32>,
    },
    /// `snappy` compression.
    #[cfg(feature = "snappy-compression")]
    Snappy,
}

impl Compressor {
    /// The name advertised for this compressor in the handshake.
    pub fn name(&self) -> &'static str {
        self.id().name()
    }

    pub(crate) fn id(&self) -> CompressorId {
        match self {
            Self::Noop => CompressorId::Noop,
            #[cfg(feature = "zstd-compression")]
            Self::Zstd { .. } => CompressorId::Zstd,
            #[cfg(feature = "zlib-compression")]
            Self::Zlib { .. } => CompressorId::Zlib,
            #[cfg(feature = "snappy-compression")]
            Self::Snappy => CompressorId::Snappy,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        #[cfg(feature = "zstd-compression")]
        if let Self::Zstd { level: Some(level) } = self {
            let valid_levels = zstd::compression_level_range();
            if !valid_levels.contains(level) {
                return Err(Error::invalid_argument(format!(
                    "Invalid zstd compression level {level}: compression level must be within \
                     the range {valid_levels:?}"
                )));
            }
        }

        #[cfg(feature = "zlib-compression")]
        if let Self::Zlib { level: Some(level) } = self {
            if *level > 9 {
                return Err(Error::invalid_argument(format!(
                    "Invalid zlib compression level {level}: compression level must be between 0 \
                     and 9 (inclusive)"
                )));
            }
        }

        Ok(())
    }

    /// Compresses `payload`, the body of an encoded message with its header stripped.
    pub fn compress(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let result = match *self {
            Self::Noop => Ok(payload.to_vec()),
            #[cfg(feature = "zstd-compression")]
            Self::Zstd { level } => compress_zstd(level, payload),
            #[cfg(feature = "zlib-compression")]
            Self::Zlib { level } => compress_zlib(level, payload),
            #[cfg(feature = "snappy-compression")]
            Self::Snappy => compress_snappy(payload),
        };

        result.map_err(|error: std::io::Error| {
            Error::internal(format!(
                "Failed to compress message with {} compression: {error}",
                self.name()
            ))
        })
    }
}

impl FromStr for Compressor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "noop" => Ok(Self::Noop),
            #[cfg(feature = "zstd-compression")]
            "zstd" => Ok(Self::Zstd { level: None }),
            #[cfg(feature = "zlib-compression")]
            "zlib" => Ok(Self::Zlib { level: None }),
            #[cfg(feature = "snappy-compression")]
            "snappy" => Ok(Self::Snappy),
            other if matches!(other, "zstd" | "zlib" | "snappy") => Err(Error::invalid_argument(format!(
                "Enable the {other}-compression feature flag to use {other} compression"
            ))),
            other => Err(Error::invalid_argument(format!(
                "Unsupported compressor: {other}"
            ))),
        }
    }
}

/// Picks the first of the client's compressors that the server also listed in its handshake
/// reply.
pub(crate) fn negotiate(client: &[Compressor], server: &[String]) -> Option<Compressor> {
    client
        .iter()
        .find(|c| server.iter().any(|name| name == c.name()))
        .cloned()
}

/// Decompresses `payload` with the algorithm identified by `id`.
pub fn decompress_message(payload: &[u8], id: CompressorId) -> Result<Vec<u8>> {
    match id {
        CompressorId::Noop => Ok(payload.to_vec()),
        #[cfg(feature = "zstd-compression")]
        CompressorId::Zstd => decompress_zstd(payload),
        #[cfg(feature = "zlib-compression")]
        CompressorId::Zlib => decompress_zlib(payload),
        #[cfg(feature = "snappy-compression")]
        CompressorId::Snappy => decompress_snappy(payload),
        #[allow(unreachable_patterns)]
        other => Err(ErrorKind::InvalidResponse {
            message: format!("Server compressed a reply with {other}, which is not enabled"),
        }
        .into()),
    }
}

#[cfg(feature = "zstd-compression")]
fn compress_zstd(level: Option<i32>, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Write;

    use zstd::{Encoder, DEFAULT_COMPRESSION_LEVEL};

    let mut encoder = Encoder::new(Vec::new(), level.unwrap_or(DEFAULT_COMPRESSION_LEVEL))?;
    encoder.write_all(payload)?;
    encoder.finish()
}

#[cfg(feature = "zlib-compression")]
fn compress_zlib(level: Option<u32>, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Write;

    use flate2::{write::ZlibEncoder, Compression};

    let level = level.map(Compression::new).unwrap_or_default();
    let mut encoder = ZlibEncoder::new(Vec::new(), level);
    encoder.write_all(payload)?;
    encoder.finish()
}

#[cfg(feature = "snappy-compression")]
fn compress_snappy(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    Ok(snap::raw::Encoder::new().compress_vec(payload)?)
}

#[cfg(feature = "zstd-compression")]
fn decompress_zstd(payload: &[u8]) -> Result<Vec<u8>> {
    let mut decompressed = Vec::new();
    zstd::stream::copy_decode(payload, &mut decompressed).map_err(|error| {
        Error::invalid_response(format!("Could not decompress message with zstd: {error}"))
    })?;
    Ok(decompressed)
}

#[cfg(feature = "zlib-compression")]
fn decompress_zlib(payload: &[u8]) -> Result<Vec<u8>> {
    use std::io::Write;

    use flate2::write::ZlibDecoder;

    let mut decoder = ZlibDecoder::new(Vec::new());
    decoder.write_all(payload)?;
    decoder.finish().map_err(|error| {
        Error::invalid_response(format!("Could not decompress message with zlib: {error}"))
    })
}

#[cfg(feature = "snappy-compression")]
fn decompress_snappy(payload: &[u8]) -> Result<Vec<u8>> {
    snap::raw::Decoder::new()
        .decompress_vec(payload)
        .map_err(|error| {
            Error::invalid_response(format!("Could not decompress message with snappy: {error}"))
        })
}
