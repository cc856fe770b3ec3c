//! 列的物理数值类型与列级配置

use byteorder::{BigEndian, ByteOrder as Endian, LittleEndian};

use crate::common::{ByteOrder, EngineError, Result};
use crate::compression::CompressionType;

/// 默认每个 chunk 的值个数
pub const DEFAULT_CHUNK_SIZE: usize = 0x2000;

/// 可存入压缩列的定长数值类型
pub trait ChunkValue: Copy + Default + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    /// 编码后的字节宽度
    const WIDTH: usize;
    /// 写入列头的类型标记
    const TYPE_TAG: u8;

    fn write_to<E: Endian>(self, dst: &mut [u8]);
    fn read_from<E: Endian>(src: &[u8]) -> Self;
}

impl ChunkValue for f32 {
    const WIDTH: usize = 4;
    const TYPE_TAG: u8 = 1;

    fn write_to<E: Endian>(self, dst: &mut [u8]) { E::write_f32(dst, self) }
    fn read_from<E: Endian>(src: &[u8]) -> Self { E::read_f32(src) }
}

impl ChunkValue for f64 {
    const WIDTH: usize = 8;
    const TYPE_TAG: u8 = 2;

    fn write_to<E: Endian>(self, dst: &mut [u8]) { E::write_f64(dst, self) }
    fn read_from<E: Endian>(src: &[u8]) -> Self { E::read_f64(src) }
}

impl ChunkValue for i64 {
    const WIDTH: usize = 8;
    const TYPE_TAG: u8 = 3;

    fn write_to<E: Endian>(self, dst: &mut [u8]) { E::write_i64(dst, self) }
    fn read_from<E: Endian>(src: &[u8]) -> Self { E::read_i64(src) }
}

/// 按字节序把一段值编码为连续字节
pub fn encode_values<T: ChunkValue>(values: &[T], order: ByteOrder) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * T::WIDTH];
    for (v, dst) in values.iter().zip(out.chunks_exact_mut(T::WIDTH)) {
        match order {
            ByteOrder::Little => v.write_to::<LittleEndian>(dst),
            ByteOrder::Big    => v.write_to::<BigEndian>(dst),
        }
    }
    out
}

/// `encode_values` 的逆操作，追加到 `out`
pub fn decode_values<T: ChunkValue>(raw: &[u8], order: ByteOrder, out: &mut Vec<T>) {
    out.extend(raw.chunks_exact(T::WIDTH).map(|src| match order {
        ByteOrder::Little => T::read_from::<LittleEndian>(src),
        ByteOrder::Big    => T::read_from::<BigEndian>(src),
    }));
}

// ── 列配置 ────────────────────────────────────────────────────────────────────

/// 单列的写入参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnOptions {
    pub chunk_size:  usize,
    pub compression: CompressionType,
    pub byte_order:  ByteOrder,
}

impl Default for ColumnOptions {
    fn default() -> Self {
        Self {
            chunk_size:  DEFAULT_CHUNK_SIZE,
            compression: CompressionType::Lz4,
            byte_order:  ByteOrder::native(),
        }
    }
}

impl ColumnOptions {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size; self
    }
    pub fn with_compression(mut self, comp: CompressionType) -> Self {
        self.compression = comp; self
    }
    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order; self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > u32::MAX as usize {
            return Err(EngineError::InvalidInput(format!(
                "chunk size must be in 1..=u32::MAX, got {}", self.chunk_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_and_little_endian_disagree_on_bytes_not_values() {
        let vals = [1.5f32, -0.25, 1e9];
        let le = encode_values(&vals, ByteOrder::Little);
        let be = encode_values(&vals, ByteOrder::Big);
        assert_ne!(le, be);

        let mut back = Vec::new();
        decode_values::<f32>(&be, ByteOrder::Big, &mut back);
        assert_eq!(back, vals);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let err = ColumnOptions::default().with_chunk_size(0).validate().unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
