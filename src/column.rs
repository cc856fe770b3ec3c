//! 压缩数值列
//!
//! 三种形态共享同一套 chunk 布局：
//!   - `CompressedColumnBuilder`：段构建期追加写入，满一个 chunk 就压缩封口
//!   - `CompressedColumn`：冻结后的不可变列，可跨线程共享
//!   - `QueryableColumn`：单个读者的随机访问视图，缓存最近解码的 chunk
//!
//! 列序列化格式：
//! ```text
//! ┌──────────────────────────────────┐
//! │ MAGIC        (8 bytes) "SEGCOL\0\0"│
//! │ type_tag     (u8)                │
//! │ byte_order   (u8)                │
//! │ compression  (u8)                │
//! │ chunk_size   (u32 LE)            │
//! │ row_count    (u64 LE)            │
//! │ chunk_count  (u32 LE)            │
//! │ [chunk_len (u32 LE) + chunk] × N │
//! │ CRC32        (u32 LE)            │
//! └──────────────────────────────────┘
//! ```

use std::io::{Cursor, Read};
use std::marker::PhantomData;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::common::{ByteOrder, EngineError, Result};
use crate::compression::CompressionType;
use crate::field_type::{ChunkValue, ColumnOptions};
use crate::page::{ChunkBuilder, ChunkDecoder};
use crate::pool::BufferPool;

const MAGIC: &[u8; 8] = b"SEGCOL\0\0";

/// 冻结列与视图共享的不可变数据
#[derive(Debug)]
struct ColumnData {
    options: ColumnOptions,
    len:     usize,
    /// 除最后一个外，每个 chunk 恰好 chunk_size 个值
    chunks:  Vec<Arc<[u8]>>,
}

impl ColumnData {
    fn decode_chunk<T: ChunkValue>(&self, chunk_idx: usize, out: &mut Vec<T>) -> Result<()> {
        ChunkDecoder::decode_into(
            &self.chunks[chunk_idx],
            self.options.byte_order,
            self.options.compression,
            out,
        )
    }
}

/// 越界检查：`[start, start+len)` 必须落在 `[0, size)` 内
fn check_span(start: usize, len: usize, size: usize) -> Result<()> {
    match start.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(EngineError::out_of_range(start, len, size)),
    }
}

/// 批量解码的公共实现：每个涉及的 chunk 只解码一次，再整段拷贝。
/// `tail` 是尚未压缩的尾部值（仅构建器有），紧接在 `chunks` 之后。
fn fill_span<T: ChunkValue>(
    options: &ColumnOptions,
    chunks:  &[Arc<[u8]>],
    tail:    &[T],
    start:   usize,
    out:     &mut [T],
    scratch: &mut Vec<T>,
) -> Result<()> {
    let chunk_size = options.chunk_size;
    let mut pos     = start;
    let mut written = 0usize;
    while written < out.len() {
        let chunk_idx = pos / chunk_size;
        let within    = pos % chunk_size;
        let src: &[T] = if chunk_idx < chunks.len() {
            ChunkDecoder::decode_into(
                &chunks[chunk_idx], options.byte_order, options.compression, scratch,
            )?;
            scratch
        } else {
            tail
        };
        let n = (src.len() - within).min(out.len() - written);
        out[written..written + n].copy_from_slice(&src[within..within + n]);
        written += n;
        pos     += n;
    }
    Ok(())
}

// ── CompressedColumnBuilder ───────────────────────────────────────────────────

pub struct CompressedColumnBuilder<T: ChunkValue> {
    options: ColumnOptions,
    chunks:  Vec<Arc<[u8]>>,
    tail:    ChunkBuilder<T>,
    len:     usize,
}

impl<T: ChunkValue> CompressedColumnBuilder<T> {
    pub fn new(options: ColumnOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            chunks: Vec::new(),
            tail:   ChunkBuilder::new(options.chunk_size),
            len:    0,
        })
    }

    /// 追加一个值，返回其行号
    pub fn add(&mut self, value: T) -> Result<usize> {
        let index = self.len;
        self.tail.add(value);
        self.len += 1;

        if self.tail.is_full() {
            let bytes = self.tail.flush(self.options.byte_order, self.options.compression)?;
            tracing::trace!(chunk = self.chunks.len(), bytes = bytes.len(), "sealed column chunk");
            self.chunks.push(bytes.into());
        }
        Ok(index)
    }

    pub fn size(&self) -> usize { self.len }

    pub fn options(&self) -> &ColumnOptions { &self.options }

    pub fn get(&self, index: usize) -> Result<T> {
        if index >= self.len {
            return Err(EngineError::out_of_range(index, 1, self.len));
        }
        let chunk_size = self.options.chunk_size;
        let chunk_idx  = index / chunk_size;
        if chunk_idx < self.chunks.len() {
            let mut buf = Vec::with_capacity(chunk_size);
            ChunkDecoder::decode_into(
                &self.chunks[chunk_idx], self.options.byte_order, self.options.compression, &mut buf,
            )?;
            Ok(buf[index % chunk_size])
        } else {
            Ok(self.tail.values()[index % chunk_size])
        }
    }

    pub fn fill(&self, start: usize, out: &mut [T]) -> Result<()> {
        check_span(start, out.len(), self.len)?;
        let mut scratch = Vec::with_capacity(self.options.chunk_size);
        fill_span(&self.options, &self.chunks, self.tail.values(), start, out, &mut scratch)
    }

    /// 已封口 chunk 加上压缩后的尾部
    fn snapshot(&self) -> Result<ColumnData> {
        let mut chunks = self.chunks.clone();
        if !self.tail.is_empty() {
            let bytes = self.tail.build(self.options.byte_order, self.options.compression)?;
            chunks.push(bytes.into());
        }
        Ok(ColumnData { options: self.options, len: self.len, chunks })
    }

    /// 生成与构建器并存的只读视图
    pub fn to_queryable_view(&self) -> Result<QueryableColumn<T>> {
        let data = self.snapshot()
            .map_err(|e| EngineError::Resource(format!("cannot snapshot column: {e}")))?;
        let pool = BufferPool::new(self.options.chunk_size);
        QueryableColumn::open(Arc::new(data), pool)
    }

    /// 冻结：消耗构建器，之后不能再追加
    pub fn freeze(self) -> Result<CompressedColumn<T>> {
        let data = self.snapshot()?;
        tracing::debug!(rows = data.len, chunks = data.chunks.len(), "froze compressed column");
        Ok(CompressedColumn::from_data(data))
    }
}

// ── CompressedColumn ──────────────────────────────────────────────────────────

/// 冻结后的不可变列；克隆只增加引用计数
pub struct CompressedColumn<T: ChunkValue> {
    data:    Arc<ColumnData>,
    pool:    BufferPool<T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ChunkValue> Clone for CompressedColumn<T> {
    fn clone(&self) -> Self {
        Self { data: Arc::clone(&self.data), pool: self.pool.clone(), _marker: PhantomData }
    }
}

impl<T: ChunkValue> std::fmt::Debug for CompressedColumn<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedColumn")
            .field("rows", &self.data.len)
            .field("chunks", &self.data.chunks.len())
            .field("options", &self.data.options)
            .finish()
    }
}

impl<T: ChunkValue> CompressedColumn<T> {
    fn from_data(data: ColumnData) -> Self {
        let pool = BufferPool::new(data.options.chunk_size);
        Self { data: Arc::new(data), pool, _marker: PhantomData }
    }

    /// 从完整的值序列一次性构建
    pub fn from_values(values: &[T], options: ColumnOptions) -> Result<Self> {
        let mut builder = CompressedColumnBuilder::new(options)?;
        for &v in values {
            builder.add(v)?;
        }
        builder.freeze()
    }

    pub fn size(&self)        -> usize          { self.data.len }
    pub fn chunk_count(&self) -> usize          { self.data.chunks.len() }
    pub fn options(&self)     -> &ColumnOptions { &self.data.options }

    pub fn get(&self, index: usize) -> Result<T> {
        if index >= self.data.len {
            return Err(EngineError::out_of_range(index, 1, self.data.len));
        }
        let chunk_size = self.data.options.chunk_size;
        let mut buf = Vec::with_capacity(chunk_size);
        self.data.decode_chunk(index / chunk_size, &mut buf)?;
        Ok(buf[index % chunk_size])
    }

    pub fn fill(&self, start: usize, out: &mut [T]) -> Result<()> {
        check_span(start, out.len(), self.data.len)?;
        let mut scratch = self.pool.take()?;
        let res = fill_span(&self.data.options, &self.data.chunks, &[], start, out, &mut scratch);
        self.pool.give_back(scratch)?;
        res
    }

    pub fn to_queryable_view(&self) -> Result<QueryableColumn<T>> {
        QueryableColumn::open(Arc::clone(&self.data), self.pool.clone())
    }

    /// 空闲解码缓冲数（视图关闭后应回到池中）
    pub fn idle_buffers(&self) -> usize { self.pool.idle_count() }

    pub fn to_bytes(&self) -> Vec<u8> {
        let d = &self.data;
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(T::TYPE_TAG);
        out.push(d.options.byte_order.to_u8());
        out.push(d.options.compression.to_u8());
        // Vec<u8> 的写入不会失败
        let _ = out.write_u32::<LittleEndian>(d.options.chunk_size as u32);
        let _ = out.write_u64::<LittleEndian>(d.len as u64);
        let _ = out.write_u32::<LittleEndian>(d.chunks.len() as u32);
        for chunk in &d.chunks {
            let _ = out.write_u32::<LittleEndian>(chunk.len() as u32);
            out.extend_from_slice(chunk);
        }
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MAGIC.len() + 4 || &bytes[..MAGIC.len()] != MAGIC {
            return Err(EngineError::SegmentIo("invalid column magic".into()));
        }
        let body_end   = bytes.len() - 4;
        let stored_crc = u32::from_le_bytes([
            bytes[body_end], bytes[body_end + 1], bytes[body_end + 2], bytes[body_end + 3],
        ]);
        if crc32fast::hash(&bytes[..body_end]) != stored_crc {
            return Err(EngineError::ChecksumMismatch);
        }

        let mut cur = Cursor::new(&bytes[MAGIC.len()..body_end]);
        let tag = cur.read_u8()?;
        if tag != T::TYPE_TAG {
            return Err(EngineError::InvalidInput(format!(
                "column holds value type {tag}, expected {}", T::TYPE_TAG
            )));
        }
        let byte_order  = ByteOrder::from_u8(cur.read_u8()?)?;
        let compression = CompressionType::from_u8(cur.read_u8()?)?;
        let chunk_size  = cur.read_u32::<LittleEndian>()? as usize;
        let len         = cur.read_u64::<LittleEndian>()? as usize;
        let n_chunks    = cur.read_u32::<LittleEndian>()? as usize;

        let options = ColumnOptions { chunk_size, compression, byte_order };
        options.validate()?;

        // 随机访问按 index / chunk_size 定位，块数与每块行数必须与头部吻合
        let expected_chunks = len.div_ceil(chunk_size);
        if n_chunks != expected_chunks {
            return Err(EngineError::SegmentIo(format!(
                "column declares {len} rows in chunks of {chunk_size} but stores {n_chunks} chunks"
            )));
        }

        let mut chunks = Vec::with_capacity(n_chunks);
        let mut total  = 0usize;
        for i in 0..n_chunks {
            let chunk_len = cur.read_u32::<LittleEndian>()? as usize;
            let remaining = cur.get_ref().len().saturating_sub(cur.position() as usize);
            if chunk_len > remaining {
                return Err(EngineError::SegmentIo(format!(
                    "chunk {i} claims {chunk_len} bytes but only {remaining} remain"
                )));
            }
            let mut chunk = vec![0u8; chunk_len];
            cur.read_exact(&mut chunk)?;

            let count = ChunkDecoder::value_count(&chunk)?;
            let fits = if i + 1 < n_chunks {
                count == chunk_size
            } else {
                (1..=chunk_size).contains(&count)
            };
            if !fits {
                return Err(EngineError::SegmentIo(format!(
                    "chunk {i} holds {count} values, chunk size is {chunk_size}"
                )));
            }
            total += count;
            chunks.push(Arc::from(chunk));
        }
        if total != len {
            return Err(EngineError::SegmentIo(format!(
                "column declares {len} rows but chunks hold {total}"
            )));
        }
        Ok(Self::from_data(ColumnData { options, len, chunks }))
    }
}

// ── QueryableColumn ───────────────────────────────────────────────────────────

/// 单个读者持有的随机访问视图
pub struct QueryableColumn<T: ChunkValue> {
    data:         Arc<ColumnData>,
    pool:         BufferPool<T>,
    decoded:      Option<Vec<T>>,
    cached_chunk: Option<usize>,
}

impl<T: ChunkValue> QueryableColumn<T> {
    fn open(data: Arc<ColumnData>, pool: BufferPool<T>) -> Result<Self> {
        let decoded = pool.take()?;
        Ok(Self { data, pool, decoded: Some(decoded), cached_chunk: None })
    }

    pub fn size(&self) -> usize { self.data.len }

    fn buffer(&mut self) -> Result<&mut Vec<T>> {
        self.decoded.as_mut()
            .ok_or_else(|| EngineError::Resource("column view already released".into()))
    }

    fn load_chunk(&mut self, chunk_idx: usize) -> Result<()> {
        if self.cached_chunk == Some(chunk_idx) {
            return Ok(());
        }
        self.cached_chunk = None;
        let data = Arc::clone(&self.data);
        data.decode_chunk(chunk_idx, self.buffer()?)?;
        self.cached_chunk = Some(chunk_idx);
        Ok(())
    }

    pub fn get(&mut self, index: usize) -> Result<T> {
        if index >= self.data.len {
            return Err(EngineError::out_of_range(index, 1, self.data.len));
        }
        let chunk_size = self.data.options.chunk_size;
        self.load_chunk(index / chunk_size)?;
        Ok(self.buffer()?[index % chunk_size])
    }

    pub fn fill(&mut self, start: usize, out: &mut [T]) -> Result<()> {
        check_span(start, out.len(), self.data.len)?;
        let chunk_size = self.data.options.chunk_size;
        let mut pos     = start;
        let mut written = 0usize;
        while written < out.len() {
            self.load_chunk(pos / chunk_size)?;
            let within = pos % chunk_size;
            let src    = self.buffer()?;
            let n      = (src.len() - within).min(out.len() - written);
            out[written..written + n].copy_from_slice(&src[within..within + n]);
            written += n;
            pos     += n;
        }
        Ok(())
    }

    /// 归还解码缓冲；即使归还失败缓冲也会被释放
    pub fn close(mut self) -> Result<()> {
        match self.decoded.take() {
            Some(buf) => self.pool.give_back(buf),
            None      => Ok(()),
        }
    }
}

impl<T: ChunkValue> Drop for QueryableColumn<T> {
    fn drop(&mut self) {
        if let Some(buf) = self.decoded.take() {
            if let Err(e) = self.pool.give_back(buf) {
                tracing::warn!(error = %e, "dropping column view without returning its buffer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(chunk: usize) -> ColumnOptions {
        ColumnOptions::default().with_chunk_size(chunk)
    }

    #[test]
    fn builder_get_spans_sealed_and_tail() {
        let mut b = CompressedColumnBuilder::<i64>::new(options(3)).unwrap();
        for i in 0..8 {
            assert_eq!(b.add(i * 10).unwrap(), i as usize);
        }
        assert_eq!(b.size(), 8);
        assert_eq!(b.get(2).unwrap(), 20);
        assert_eq!(b.get(7).unwrap(), 70);
        assert!(matches!(b.get(8), Err(EngineError::OutOfRange { .. })));
    }

    #[test]
    fn view_is_independent_of_later_appends() {
        let mut b = CompressedColumnBuilder::<f64>::new(options(4)).unwrap();
        for i in 0..5 { b.add(i as f64).unwrap(); }
        let mut view = b.to_queryable_view().unwrap();
        b.add(99.0).unwrap();

        assert_eq!(view.size(), 5);
        assert_eq!(view.get(4).unwrap(), 4.0);
        assert!(view.get(5).is_err());
        assert_eq!(b.get(5).unwrap(), 99.0);
        view.close().unwrap();
    }

    #[test]
    fn closing_a_view_returns_its_buffer() {
        let col = CompressedColumn::from_values(&[1.0f32, 2.0, 3.0], options(2)).unwrap();
        let mut view = col.to_queryable_view().unwrap();
        assert_eq!(view.get(2).unwrap(), 3.0);
        assert_eq!(col.idle_buffers(), 0);
        view.close().unwrap();
        assert_eq!(col.idle_buffers(), 1);

        drop(col.to_queryable_view().unwrap());
        assert_eq!(col.idle_buffers(), 1);
    }

    #[test]
    fn close_on_poisoned_pool_is_a_resource_error() {
        let col = CompressedColumn::from_values(&[1i64, 2], options(2)).unwrap();
        let view = col.to_queryable_view().unwrap();
        col.pool.poison();
        assert!(matches!(view.close(), Err(EngineError::Resource(_))));
        assert!(matches!(col.to_queryable_view(), Err(EngineError::Resource(_))));
    }

    #[test]
    fn serialized_column_round_trips() {
        let vals: Vec<i64> = (0..1000).map(|i| i * i - 500).collect();
        let col = CompressedColumn::from_values(&vals, options(64).with_byte_order(ByteOrder::Big))
            .unwrap();
        let bytes = col.to_bytes();
        let back  = CompressedColumn::<i64>::from_bytes(&bytes).unwrap();
        assert_eq!(back.size(), 1000);
        assert_eq!(back.chunk_count(), col.chunk_count());

        let mut out = vec![0i64; 1000];
        back.fill(0, &mut out).unwrap();
        assert_eq!(out, vals);

        assert!(matches!(
            CompressedColumn::<f32>::from_bytes(&bytes),
            Err(EngineError::InvalidInput(_))
        ));
    }

    /// 改写头部字段后重算 CRC，模拟内容自洽但语义错误的文件
    fn reseal(bytes: &mut Vec<u8>) {
        let body_end = bytes.len() - 4;
        let crc = crc32fast::hash(&bytes[..body_end]);
        bytes[body_end..].copy_from_slice(&crc.to_le_bytes());
    }

    // MAGIC(8) tag order compression │ chunk_size u32 │ len u64 │ n_chunks u32 │ chunk_len u32
    const CHUNK_SIZE_AT: usize = 11;
    const FIRST_CHUNK_LEN_AT: usize = 27;

    #[test]
    fn chunk_size_disagreeing_with_chunks_is_rejected() {
        let col = CompressedColumn::from_values(&[1.0f32, 2.0, 3.0, 4.0], options(2)).unwrap();
        let mut bytes = col.to_bytes();
        bytes[CHUNK_SIZE_AT..CHUNK_SIZE_AT + 4].copy_from_slice(&3u32.to_le_bytes());
        reseal(&mut bytes);
        // ceil(4 / 3) 仍是 2 块，由逐块行数检查拦下
        assert!(matches!(
            CompressedColumn::<f32>::from_bytes(&bytes),
            Err(EngineError::SegmentIo(_))
        ));

        let mut bytes = col.to_bytes();
        bytes[CHUNK_SIZE_AT..CHUNK_SIZE_AT + 4].copy_from_slice(&1u32.to_le_bytes());
        reseal(&mut bytes);
        assert!(matches!(
            CompressedColumn::<f32>::from_bytes(&bytes),
            Err(EngineError::SegmentIo(_))
        ));
    }

    #[test]
    fn oversized_chunk_length_is_rejected_before_allocating() {
        let col = CompressedColumn::from_values(&[7i64, 8, 9], options(4)).unwrap();
        let mut bytes = col.to_bytes();
        bytes[FIRST_CHUNK_LEN_AT..FIRST_CHUNK_LEN_AT + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        reseal(&mut bytes);
        assert!(matches!(
            CompressedColumn::<i64>::from_bytes(&bytes),
            Err(EngineError::SegmentIo(_))
        ));
    }

    #[test]
    fn flipped_byte_in_serialized_column_is_detected() {
        let col = CompressedColumn::from_values(&[5.0f32; 10], options(4)).unwrap();
        let mut bytes = col.to_bytes();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        assert!(matches!(
            CompressedColumn::<f32>::from_bytes(&bytes),
            Err(EngineError::ChecksumMismatch)
        ));
    }
}
