//! Block compression codecs
//!
//! Compressed images store every block as an independent LZMA stream so that a
//! single block can be decoded, patched and re-encoded without touching its
//! neighbours.

use crate::error::{PatchError, PatchResult};
use crate::format::CompressionFormat;
use liblzma::read::XzDecoder;
use liblzma::stream::{Filters, LzmaOptions, Stream};
use liblzma::write::XzEncoder;
use std::io::{Read, Write};

/// Block encoder/decoder used for compressed images
pub trait CompressionCodec {
    /// Format this codec implements
    fn format(&self) -> CompressionFormat;

    /// Encode one uncompressed block of at most `blocksize` bytes
    fn encode(&self, data: &[u8], blocksize: u32) -> PatchResult<Vec<u8>>;

    /// Decode one encoded block, failing if it expands past `blocksize` bytes
    fn decode(&self, data: &[u8], blocksize: u32) -> PatchResult<Vec<u8>>;
}

/// Look up the codec for an image compression format
///
/// Returns `None` for uncompressed images.
pub fn codec_for(format: CompressionFormat) -> Option<Box<dyn CompressionCodec>> {
    match format {
        CompressionFormat::None => None,
        CompressionFormat::Lzma => Some(Box::new(LzmaCodec::default())),
    }
}

/// LZMA block codec
///
/// Each block is `[5-byte properties][raw LZMA1 stream]`. The properties
/// carry the `lc`/`lp`/`pb` byte followed by the little-endian dictionary
/// size, matching the LZMA SDK's block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LzmaCodec {
    dict_size: u32,
    literal_context_bits: u32,
    literal_position_bits: u32,
    position_bits: u32,
}

impl Default for LzmaCodec {
    fn default() -> Self {
        Self {
            dict_size: Self::DEFAULT_DICT_SIZE,
            literal_context_bits: 3,
            literal_position_bits: 0,
            position_bits: 2,
        }
    }
}

impl LzmaCodec {
    /// Size of the properties header preceding every stream
    pub const HEADER_SIZE: usize = 5;

    /// Dictionary size used when encoding
    pub const DEFAULT_DICT_SIZE: u32 = 1 << 13;

    /// Smallest dictionary liblzma accepts
    pub const MIN_DICT_SIZE: u32 = 4096;

    fn properties(&self) -> [u8; Self::HEADER_SIZE] {
        let mut props = [0u8; Self::HEADER_SIZE];
        props[0] = ((self.position_bits * 5 + self.literal_position_bits) * 9
            + self.literal_context_bits) as u8;
        props[1..].copy_from_slice(&self.dict_size.to_le_bytes());
        props
    }

    fn from_properties(props: &[u8]) -> PatchResult<Self> {
        let [byte, d0, d1, d2, d3] = props else {
            return Err(PatchError::compression("truncated LZMA properties"));
        };

        let mut byte = u32::from(*byte);
        if byte >= 9 * 5 * 5 {
            return Err(PatchError::compression(format!(
                "invalid LZMA properties byte {byte:#04x}"
            )));
        }
        let literal_context_bits = byte % 9;
        byte /= 9;
        let literal_position_bits = byte % 5;
        let position_bits = byte / 5;

        let dict_size = u32::from_le_bytes([*d0, *d1, *d2, *d3]).max(Self::MIN_DICT_SIZE);

        Ok(Self {
            dict_size,
            literal_context_bits,
            literal_position_bits,
            position_bits,
        })
    }

    fn filters(&self) -> PatchResult<Filters> {
        let mut options = LzmaOptions::new_preset(0)
            .map_err(|e| PatchError::compression(format!("LZMA options: {e}")))?;
        options
            .dict_size(self.dict_size)
            .literal_context_bits(self.literal_context_bits)
            .literal_position_bits(self.literal_position_bits)
            .position_bits(self.position_bits);

        let mut filters = Filters::new();
        filters.lzma1(&options);
        Ok(filters)
    }
}

impl CompressionCodec for LzmaCodec {
    fn format(&self) -> CompressionFormat {
        CompressionFormat::Lzma
    }

    fn encode(&self, data: &[u8], blocksize: u32) -> PatchResult<Vec<u8>> {
        if data.len() > blocksize as usize {
            return Err(PatchError::compression(format!(
                "block of {} bytes exceeds blocksize {blocksize}",
                data.len()
            )));
        }

        let stream = Stream::new_raw_encoder(&self.filters()?)
            .map_err(|e| PatchError::compression(format!("LZMA encoder init: {e}")))?;

        let mut output = Vec::with_capacity(Self::HEADER_SIZE + data.len() / 2);
        output.extend_from_slice(&self.properties());

        let mut encoder = XzEncoder::new_stream(output, stream);
        encoder
            .write_all(data)
            .map_err(|e| PatchError::compression(format!("LZMA encode: {e}")))?;
        encoder
            .finish()
            .map_err(|e| PatchError::compression(format!("LZMA encode: {e}")))
    }

    fn decode(&self, data: &[u8], blocksize: u32) -> PatchResult<Vec<u8>> {
        if data.len() < Self::HEADER_SIZE {
            return Err(PatchError::compression(format!(
                "LZMA block of {} bytes is shorter than its header",
                data.len()
            )));
        }
        let (props, body) = data.split_at(Self::HEADER_SIZE);
        let block_codec = Self::from_properties(props)?;

        let stream = Stream::new_raw_decoder(&block_codec.filters()?)
            .map_err(|e| PatchError::compression(format!("LZMA decoder init: {e}")))?;

        let limit = u64::from(blocksize) + 1;
        let mut decoded = Vec::with_capacity(blocksize as usize);
        XzDecoder::new_stream(body, stream)
            .take(limit)
            .read_to_end(&mut decoded)
            .map_err(|e| PatchError::compression(format!("LZMA decode: {e}")))?;

        if decoded.len() > blocksize as usize {
            return Err(PatchError::compression(format!(
                "LZMA block expands past blocksize {blocksize}"
            )));
        }

        Ok(decoded)
    }
}
