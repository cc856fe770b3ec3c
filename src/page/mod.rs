//! Chunk 读写
//!
//! 每个 chunk 独立压缩，解码任何一个 chunk 都不依赖相邻 chunk。
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ value_count  (u32 LE)            │
//! │ uncomp_size  (u32 LE)            │
//! │ payload      (values, 列字节序,   │
//! │               再按列压缩方式压缩)  │
//! │ CRC32        (u32 LE)            │
//! └──────────────────────────────────┘
//! ```

use byteorder::{ByteOrder as Endian, LittleEndian};

use crate::common::{ByteOrder, EngineError, Result};
use crate::compression::{self, CompressionType};
use crate::field_type::{decode_values, encode_values, ChunkValue};

const HEADER_LEN: usize = 8;
const CRC_LEN:    usize = 4;

// ── ChunkBuilder ──────────────────────────────────────────────────────────────

/// 尚未封口的 chunk（列写入器的尾部缓冲）
#[derive(Debug, Clone)]
pub struct ChunkBuilder<T> {
    capacity: usize,
    values:   Vec<T>,
}

impl<T: ChunkValue> ChunkBuilder<T> {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, values: Vec::with_capacity(capacity) }
    }

    pub fn add(&mut self, v: T) {
        self.values.push(v);
    }

    pub fn len(&self)      -> usize { self.values.len() }
    pub fn is_empty(&self) -> bool  { self.values.is_empty() }
    pub fn is_full(&self)  -> bool  { self.values.len() >= self.capacity }
    pub fn values(&self)   -> &[T]  { &self.values }

    /// 序列化为 chunk 字节（encode → compress → 加 header+CRC），不消耗缓冲
    pub fn build(&self, order: ByteOrder, codec: CompressionType) -> Result<Vec<u8>> {
        let encoded    = encode_values(&self.values, order);
        let compressed = compression::compress(&encoded, codec)?;

        let mut chunk = vec![0u8; HEADER_LEN];
        LittleEndian::write_u32(&mut chunk[0..4], self.values.len() as u32);
        LittleEndian::write_u32(&mut chunk[4..8], encoded.len() as u32);
        chunk.extend_from_slice(&compressed);

        let crc = crc32fast::hash(&chunk);
        chunk.extend_from_slice(&crc.to_le_bytes());
        Ok(chunk)
    }

    /// 封口：返回 chunk 字节并清空缓冲
    pub fn flush(&mut self, order: ByteOrder, codec: CompressionType) -> Result<Vec<u8>> {
        let bytes = self.build(order, codec)?;
        self.values.clear();
        Ok(bytes)
    }
}

// ── ChunkDecoder ──────────────────────────────────────────────────────────────

pub struct ChunkDecoder;

impl ChunkDecoder {
    /// 读取 chunk 头部记录的值个数（不解压）
    pub fn value_count(chunk: &[u8]) -> Result<usize> {
        if chunk.len() < HEADER_LEN + CRC_LEN {
            return Err(EngineError::SegmentIo("chunk data too short".into()));
        }
        Ok(LittleEndian::read_u32(&chunk[0..4]) as usize)
    }

    /// 校验并解码整个 chunk，结果写入 `out`（先清空）
    pub fn decode_into<T: ChunkValue>(
        chunk: &[u8],
        order: ByteOrder,
        codec: CompressionType,
        out:   &mut Vec<T>,
    ) -> Result<()> {
        let value_count = Self::value_count(chunk)?;
        let uncomp_size = LittleEndian::read_u32(&chunk[4..8]) as usize;
        let payload_end = chunk.len() - CRC_LEN;

        let stored_crc = LittleEndian::read_u32(&chunk[payload_end..]);
        if stored_crc != crc32fast::hash(&chunk[..payload_end]) {
            return Err(EngineError::ChecksumMismatch);
        }
        if uncomp_size != value_count * T::WIDTH {
            return Err(EngineError::SegmentIo(format!(
                "chunk holds {value_count} values but {uncomp_size} payload bytes"
            )));
        }

        let raw = compression::decompress(&chunk[HEADER_LEN..payload_end], codec, uncomp_size)?;
        out.clear();
        decode_values(&raw, order, out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_round_trip_through_lz4() {
        let mut b = ChunkBuilder::<i64>::new(4);
        for v in [7, -3, 1 << 40, 0] { b.add(v); }
        assert!(b.is_full());

        let bytes = b.flush(ByteOrder::Big, CompressionType::Lz4).unwrap();
        assert!(b.is_empty());
        assert_eq!(ChunkDecoder::value_count(&bytes).unwrap(), 4);

        let mut out = Vec::<i64>::new();
        ChunkDecoder::decode_into(&bytes, ByteOrder::Big, CompressionType::Lz4, &mut out).unwrap();
        assert_eq!(out, vec![7, -3, 1 << 40, 0]);
    }

    #[test]
    fn corrupted_chunk_fails_crc() {
        let mut b = ChunkBuilder::<f32>::new(2);
        b.add(1.0);
        b.add(2.0);
        let mut bytes = b.build(ByteOrder::Little, CompressionType::None).unwrap();
        bytes[9] ^= 0xff;

        let mut out = Vec::<f32>::new();
        let err = ChunkDecoder::decode_into(&bytes, ByteOrder::Little, CompressionType::None, &mut out)
            .unwrap_err();
        assert!(matches!(err, EngineError::ChecksumMismatch));
    }
}
