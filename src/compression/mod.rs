//! chunk 级压缩/解压（LZ4 / None）

use crate::common::{EngineError, Result};

/// 压缩方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    None,
    #[default]
    Lz4,
}

impl CompressionType {
    pub(crate) fn to_u8(self) -> u8 {
        match self { Self::None => 0, Self::Lz4 => 1 }
    }

    pub(crate) fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            _ => Err(EngineError::SegmentIo(format!("unknown compression tag {b}"))),
        }
    }
}

pub fn compress(data: &[u8], codec: CompressionType) -> Result<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4  =>
            lz4::block::compress(data, None, false)
                .map_err(|e| EngineError::Compression(e.to_string())),
    }
}

pub fn decompress(
    data:             &[u8],
    codec:            CompressionType,
    uncompressed_len: usize,
) -> Result<Vec<u8>> {
    let raw = match codec {
        CompressionType::None => data.to_vec(),
        CompressionType::Lz4  =>
            lz4::block::decompress(data, Some(uncompressed_len as i32))
                .map_err(|e| EngineError::Compression(e.to_string()))?,
    };
    if raw.len() != uncompressed_len {
        return Err(EngineError::Compression(format!(
            "expected {uncompressed_len} bytes after decompression, got {}", raw.len()
        )));
    }
    Ok(raw)
}
