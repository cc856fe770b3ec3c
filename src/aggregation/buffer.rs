//! 缓冲聚合器与分配区
//!
//! 每种聚合器独占 `[offset, offset + width)` 字节区间，布局（大端）：
//!
//! ```text
//! count / longSum : i64
//! doubleSum       : f64
//! min / max       : f64   初值 +∞ / −∞
//! histogram       : i64 × (B+1) 桶计数 │ f32 min │ f32 max
//! ```
//!
//! `AggregationArena` 是单块分配的字节区，按追加顺序（bump）为分组分配
//! 互不重叠的 `Slot`；不同分组的区间可以同时被不同线程写入。

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder as Endian};

use crate::aggregation::histogram::{bucket_index, Histogram};
use crate::aggregation::{AggValue, AggregatorSpec, FloatSelector};
use crate::common::{EngineError, Result};

const LONG_BYTES:  usize = 8;
const FLOAT_BYTES: usize = 4;

/// 直方图状态宽度：`8*(B+1)` 字节计数 + min + max
pub(crate) fn histogram_width(num_breaks: usize) -> usize {
    LONG_BYTES * (num_breaks + 1) + 2 * FLOAT_BYTES
}

#[derive(Debug, Clone)]
enum Kind {
    Count,
    LongSum,
    DoubleSum,
    Min,
    Max,
    Histogram { breaks: Vec<f32>, min_offset: usize, max_offset: usize },
}

pub struct BufferAggregator {
    name:     String,
    kind:     Kind,
    selector: Option<Arc<dyn FloatSelector>>,
}

impl BufferAggregator {
    pub(crate) fn new(spec: &AggregatorSpec, selector: Option<Arc<dyn FloatSelector>>) -> Self {
        let kind = match spec {
            AggregatorSpec::Count { .. }     => Kind::Count,
            AggregatorSpec::LongSum { .. }   => Kind::LongSum,
            AggregatorSpec::DoubleSum { .. } => Kind::DoubleSum,
            AggregatorSpec::Min { .. }       => Kind::Min,
            AggregatorSpec::Max { .. }       => Kind::Max,
            AggregatorSpec::Histogram { breaks, .. } => {
                let min_offset = LONG_BYTES * (breaks.len() + 1);
                Kind::Histogram {
                    breaks: breaks.clone(),
                    min_offset,
                    max_offset: min_offset + FLOAT_BYTES,
                }
            }
        };
        Self { name: spec.name().to_owned(), kind, selector }
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn width(&self) -> usize {
        match &self.kind {
            Kind::Histogram { breaks, .. } => histogram_width(breaks.len()),
            _ => LONG_BYTES,
        }
    }

    fn current(&self) -> f32 {
        self.selector.as_ref().map(|s| s.get()).unwrap_or(0.0)
    }

    // 调用方约定：`offset + width() <= buf.len()`，区间由 `AggregationArena` 分配时天然满足。
    // 违反约定属于编程错误，直接 panic。
    fn region<'b>(&self, buf: &'b [u8], offset: usize) -> &'b [u8] {
        let width = self.width();
        debug_assert!(
            offset + width <= buf.len(),
            "aggregator [{}] region {offset}+{width} exceeds buffer of {} bytes", self.name, buf.len()
        );
        &buf[offset..offset + width]
    }

    fn region_mut<'b>(&self, buf: &'b mut [u8], offset: usize) -> &'b mut [u8] {
        let width = self.width();
        debug_assert!(
            offset + width <= buf.len(),
            "aggregator [{}] region {offset}+{width} exceeds buffer of {} bytes", self.name, buf.len()
        );
        &mut buf[offset..offset + width]
    }

    /// 写入初始状态；只触碰本聚合器的区间
    ///
    /// `init`、`aggregate`、`get` 都要求 `buf` 在 `offset` 之后至少还有 `width()` 字节，
    /// 否则 panic。
    pub fn init(&self, buf: &mut [u8], offset: usize) {
        let r = self.region_mut(buf, offset);
        match &self.kind {
            Kind::Count | Kind::LongSum => BigEndian::write_i64(r, 0),
            Kind::DoubleSum             => BigEndian::write_f64(r, 0.0),
            Kind::Min                   => BigEndian::write_f64(r, f64::INFINITY),
            Kind::Max                   => BigEndian::write_f64(r, f64::NEG_INFINITY),
            Kind::Histogram { min_offset, max_offset, .. } => {
                r[..*min_offset].fill(0);
                BigEndian::write_f32(&mut r[*min_offset..], f32::INFINITY);
                BigEndian::write_f32(&mut r[*max_offset..], f32::NEG_INFINITY);
            }
        }
    }

    /// 读取当前行并原地更新区间内的状态
    pub fn aggregate(&self, buf: &mut [u8], offset: usize) {
        let v = self.current();
        let r = self.region_mut(buf, offset);
        match &self.kind {
            Kind::Count => {
                let n = BigEndian::read_i64(r);
                BigEndian::write_i64(r, n + 1);
            }
            Kind::LongSum => {
                let s = BigEndian::read_i64(r);
                BigEndian::write_i64(r, s.wrapping_add(v as i64));
            }
            Kind::DoubleSum => {
                let s = BigEndian::read_f64(r);
                BigEndian::write_f64(r, s + v as f64);
            }
            Kind::Min => {
                let m = BigEndian::read_f64(r);
                BigEndian::write_f64(r, m.min(v as f64));
            }
            Kind::Max => {
                let m = BigEndian::read_f64(r);
                BigEndian::write_f64(r, m.max(v as f64));
            }
            Kind::Histogram { breaks, min_offset, max_offset } => {
                if v < BigEndian::read_f32(&r[*min_offset..]) {
                    BigEndian::write_f32(&mut r[*min_offset..], v);
                }
                if v > BigEndian::read_f32(&r[*max_offset..]) {
                    BigEndian::write_f32(&mut r[*max_offset..], v);
                }
                let at = bucket_index(breaks, v) * LONG_BYTES;
                let count = BigEndian::read_i64(&r[at..]);
                BigEndian::write_i64(&mut r[at..], count + 1);
            }
        }
    }

    /// 解码区间内的状态，不修改缓冲
    pub fn get(&self, buf: &[u8], offset: usize) -> AggValue {
        let r = self.region(buf, offset);
        match &self.kind {
            Kind::Count | Kind::LongSum => AggValue::Long(BigEndian::read_i64(r)),
            Kind::DoubleSum | Kind::Min | Kind::Max => AggValue::Double(BigEndian::read_f64(r)),
            Kind::Histogram { breaks, min_offset, max_offset } => {
                let bins = r[..*min_offset]
                    .chunks_exact(LONG_BYTES)
                    .map(BigEndian::read_i64)
                    .collect();
                AggValue::Histogram(Histogram {
                    breaks: breaks.clone(),
                    bins,
                    min: BigEndian::read_f32(&r[*min_offset..]),
                    max: BigEndian::read_f32(&r[*max_offset..]),
                })
            }
        }
    }

    pub fn get_as_float(&self, buf: &[u8], offset: usize) -> Result<f32> {
        match self.get(buf, offset) {
            AggValue::Long(v)   => Ok(v as f32),
            AggValue::Float(v)  => Ok(v),
            AggValue::Double(v) => Ok(v as f32),
            AggValue::Histogram(_) => Err(EngineError::UnsupportedOperation(format!(
                "histogram buffer aggregator [{}] does not support get_as_float", self.name
            ))),
        }
    }
}

impl std::fmt::Debug for BufferAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAggregator")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

// ── AggregationArena ──────────────────────────────────────────────────────────

/// 分配区内的一段字节区间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    pub offset: usize,
    pub width:  usize,
}

impl Slot {
    pub fn end(&self) -> usize { self.offset + self.width }
}

/// 查询上下文持有的单块聚合缓冲
#[derive(Debug, Default)]
pub struct AggregationArena {
    buf:   Vec<u8>,
    slots: Vec<Slot>,
}

impl AggregationArena {
    pub fn new() -> Self { Self::default() }

    pub fn with_capacity(bytes: usize) -> Self {
        Self { buf: Vec::with_capacity(bytes), slots: Vec::new() }
    }

    /// 在末尾追加一段全零区间；已分配的 offset 保持不变
    pub fn allocate(&mut self, width: usize) -> Slot {
        let slot = Slot { offset: self.buf.len(), width };
        self.buf.resize(slot.end(), 0);
        self.slots.push(slot);
        slot
    }

    pub fn slots(&self)      -> &[Slot]     { &self.slots }
    pub fn len_bytes(&self)  -> usize       { self.buf.len() }
    pub fn buffer(&self)     -> &[u8]       { &self.buf }
    pub fn buffer_mut(&mut self) -> &mut [u8] { &mut self.buf }

    pub fn region(&self, slot: Slot) -> &[u8] {
        &self.buf[slot.offset..slot.end()]
    }

    pub fn region_mut(&mut self, slot: Slot) -> &mut [u8] {
        &mut self.buf[slot.offset..slot.end()]
    }

    /// 按分配顺序拆出每个分组各自的可变区间，可分发给不同线程并发写
    pub fn regions_mut(&mut self) -> Vec<(Slot, &mut [u8])> {
        let mut out  = Vec::with_capacity(self.slots.len());
        let mut rest = self.buf.as_mut_slice();
        for &slot in &self.slots {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(slot.width);
            out.push((slot, head));
            rest = tail;
        }
        out
    }
}
