//! 段的构建与段文件读写
//!
//! 段是不可变的扫描单位：一列时间戳、若干压缩度量列、若干维度列（含位图索引）。
//!
//! 文件格式：
//! ```text
//! ┌────────────────────────────────────┐
//! │  MAGIC  (8 bytes) "SCANSEG\0"      │
//! │  Version(4 bytes) = 1              │
//! ├────────────────────────────────────┤
//! │  DATA REGION                       │
//! │    [time column]                   │ ← 压缩列序列化（自带 CRC）
//! │    [metric column × M]             │
//! │    [dimension column × D]          │ ← 字典 + 行取值 + 位图索引
//! ├────────────────────────────────────┤
//! │  FOOTER                            │
//! │    num_rows      (u32)             │
//! │    section_count (u32)             │
//! │    [kind u8, name, offset, size]×N │
//! │    Footer CRC32  (4 bytes)         │
//! │    Footer length (4 bytes)         │
//! │    MAGIC         (8 bytes)         │
//! └────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::column::{CompressedColumn, CompressedColumnBuilder};
use crate::common::{EngineError, Result, RowId, TIME_COLUMN};
use crate::dimension::{DimensionColumn, DimensionColumnBuilder};
use crate::field_type::ColumnOptions;
use crate::index::{BitmapIndex, BitmapIndexSelector};
use crate::row::{InputRow, RowSource};

const MAGIC: &[u8; 8] = b"SCANSEG\0";
const VERSION: u32     = 1;

// ── 配置 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SegmentOptions {
    pub column:               ColumnOptions,
    /// 度量列名；行里缺失的度量记为 0
    pub metrics:              Vec<String>,
    /// 不建位图索引的维度（过滤时走逐行路径）
    pub unindexed_dimensions: BTreeSet<String>,
}

impl SegmentOptions {
    pub fn new(metrics: &[&str]) -> Self {
        Self {
            metrics: metrics.iter().map(|m| (*m).to_owned()).collect(),
            ..Self::default()
        }
    }

    pub fn with_column_options(mut self, column: ColumnOptions) -> Self {
        self.column = column; self
    }
    pub fn without_index(mut self, dimension: &str) -> Self {
        self.unindexed_dimensions.insert(dimension.into()); self
    }
}

// ── SegmentBuilder ────────────────────────────────────────────────────────────

pub struct SegmentBuilder {
    options:    SegmentOptions,
    time:       CompressedColumnBuilder<i64>,
    metrics:    Vec<CompressedColumnBuilder<f32>>,
    dimensions: Vec<DimensionColumnBuilder>,
    dim_pos:    HashMap<String, usize>,
    num_rows:   usize,
}

impl SegmentBuilder {
    pub fn new(options: SegmentOptions) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for m in &options.metrics {
            if m == TIME_COLUMN || !seen.insert(m.as_str()) {
                return Err(EngineError::InvalidInput(format!("duplicate or reserved metric [{m}]")));
            }
        }
        let time    = CompressedColumnBuilder::new(options.column)?;
        let metrics = options.metrics.iter()
            .map(|_| CompressedColumnBuilder::new(options.column))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            options, time, metrics,
            dimensions: Vec::new(),
            dim_pos:    HashMap::new(),
            num_rows:   0,
        })
    }

    /// 追加一行，返回行号
    pub fn add_row(&mut self, row: &impl InputRow) -> Result<RowId> {
        if self.num_rows >= RowId::MAX as usize {
            return Err(EngineError::InvalidInput("segment row limit reached".into()));
        }
        let row_id = self.num_rows as RowId;

        self.time.add(row.timestamp_millis())?;
        for (name, col) in self.options.metrics.iter().zip(self.metrics.iter_mut()) {
            col.add(row.metric(name).unwrap_or(0.0))?;
        }

        for dim in row.dimensions() {
            if !self.dim_pos.contains_key(dim) {
                let indexed = !self.options.unindexed_dimensions.contains(dim);
                let mut b   = DimensionColumnBuilder::new(dim, indexed);
                b.pad_to(self.num_rows);
                self.dim_pos.insert(dim.clone(), self.dimensions.len());
                self.dimensions.push(b);
            }
        }
        for b in &mut self.dimensions {
            // 本行未携带的维度记为空行
            b.pad_to(self.num_rows);
        }
        for dim in row.dimensions() {
            if let Some(&pos) = self.dim_pos.get(dim) {
                let b = &mut self.dimensions[pos];
                if b.num_rows() == self.num_rows {
                    b.add_row(row.dimension_values(dim));
                }
            }
        }

        self.num_rows += 1;
        Ok(row_id)
    }

    /// 拉空行源，返回追加的行数
    pub fn add_all<S: RowSource>(&mut self, source: &mut S) -> Result<usize> {
        let mut n = 0;
        while source.has_more() {
            let row = source.next_row()?;
            self.add_row(&row)?;
            n += 1;
        }
        Ok(n)
    }

    pub fn num_rows(&self) -> usize { self.num_rows }

    pub fn build(self) -> Result<Segment> {
        let num_rows = self.num_rows;
        let time     = self.time.freeze()?;
        let mut metrics = BTreeMap::new();
        for (name, col) in self.options.metrics.into_iter().zip(self.metrics) {
            metrics.insert(name, col.freeze()?);
        }
        let dimensions = self.dimensions.into_iter()
            .map(|mut b| { b.pad_to(num_rows); b.build() })
            .collect();

        tracing::debug!(rows = num_rows, metrics = metrics.len(), "built segment");
        Segment::assemble(num_rows as u32, time, metrics, dimensions)
    }
}

// ── Segment ───────────────────────────────────────────────────────────────────

/// 冻结后的段；所有部件不可变，可被多个扫描线程共享
#[derive(Debug, Clone)]
pub struct Segment {
    num_rows:   u32,
    time:       CompressedColumn<i64>,
    metrics:    BTreeMap<String, CompressedColumn<f32>>,
    dimensions: Vec<DimensionColumn>,
    dim_pos:    HashMap<String, usize>,
}

impl Segment {
    fn assemble(
        num_rows:   u32,
        time:       CompressedColumn<i64>,
        metrics:    BTreeMap<String, CompressedColumn<f32>>,
        dimensions: Vec<DimensionColumn>,
    ) -> Result<Self> {
        let consistent = time.size() == num_rows as usize
            && metrics.values().all(|c| c.size() == num_rows as usize)
            && dimensions.iter().all(|d| d.num_rows() == num_rows as usize);
        if !consistent {
            return Err(EngineError::SegmentIo("columns disagree on row count".into()));
        }
        let mut dim_pos = HashMap::with_capacity(dimensions.len());
        for (i, d) in dimensions.iter().enumerate() {
            if dim_pos.insert(d.name().to_owned(), i).is_some() {
                return Err(EngineError::SegmentIo(format!("dimension [{}] appears twice", d.name())));
            }
        }
        Ok(Self { num_rows, time, metrics, dimensions, dim_pos })
    }

    pub fn num_rows(&self) -> u32 { self.num_rows }

    pub fn time_column(&self) -> &CompressedColumn<i64> { &self.time }

    pub fn metric(&self, name: &str) -> Option<&CompressedColumn<f32>> {
        self.metrics.get(name)
    }

    pub fn metric_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.metrics.keys().map(String::as_str)
    }

    pub fn dimension(&self, name: &str) -> Option<&DimensionColumn> {
        self.dim_pos.get(name).map(|&i| &self.dimensions[i])
    }

    pub fn dimension_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.dimensions.iter().map(DimensionColumn::name)
    }

    // ── 文件写入 ──────────────────────────────────────────────────────────────

    /// 将整个段序列化到字节流，返回写入的字节数
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<u64> {
        let mut pos: u64 = 0;
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        pos += 12;

        let mut sections: Vec<(SectionKind, String, u64, u64)> = Vec::new();
        let mut emit = |writer: &mut W, kind, name: &str, bytes: Vec<u8>| -> Result<()> {
            writer.write_all(&bytes)?;
            sections.push((kind, name.to_owned(), pos, bytes.len() as u64));
            pos += bytes.len() as u64;
            Ok(())
        };

        emit(&mut writer, SectionKind::Time, TIME_COLUMN, self.time.to_bytes())?;
        for (name, col) in &self.metrics {
            emit(&mut writer, SectionKind::Metric, name, col.to_bytes())?;
        }
        for dim in &self.dimensions {
            emit(&mut writer, SectionKind::Dimension, dim.name(), encode_dimension(dim)?)?;
        }

        let mut footer = Vec::new();
        footer.write_u32::<LittleEndian>(self.num_rows)?;
        footer.write_u32::<LittleEndian>(sections.len() as u32)?;
        for (kind, name, offset, size) in &sections {
            footer.write_u8(*kind as u8)?;
            footer.write_u32::<LittleEndian>(name.len() as u32)?;
            footer.extend_from_slice(name.as_bytes());
            footer.write_u64::<LittleEndian>(*offset)?;
            footer.write_u64::<LittleEndian>(*size)?;
        }
        let footer_crc = crc32fast::hash(&footer);

        writer.write_all(&footer)?;
        writer.write_all(&footer_crc.to_le_bytes())?;
        writer.write_all(&(footer.len() as u32).to_le_bytes())?;
        writer.write_all(MAGIC)?;
        let total = pos + footer.len() as u64 + 16;

        tracing::debug!(bytes = total, sections = sections.len(), "wrote segment");
        Ok(total)
    }

    // ── 文件读取 ──────────────────────────────────────────────────────────────

    /// 从内存字节解析段
    pub fn open(data: &[u8]) -> Result<Self> {
        let n = data.len();
        if n < 28 || &data[..8] != MAGIC || &data[n - 8..] != MAGIC {
            return Err(EngineError::SegmentIo("invalid segment magic".into()));
        }
        let version = (&data[8..12]).read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(EngineError::SegmentIo(format!("unsupported segment version {version}")));
        }

        let footer_len = (&data[n - 12..n - 8]).read_u32::<LittleEndian>()? as usize;
        let footer_crc = (&data[n - 16..n - 12]).read_u32::<LittleEndian>()?;
        let footer_start = (n - 16).checked_sub(footer_len)
            .filter(|&s| s >= 12)
            .ok_or_else(|| EngineError::SegmentIo("footer length out of bounds".into()))?;
        let footer_bytes = &data[footer_start..n - 16];
        if crc32fast::hash(footer_bytes) != footer_crc {
            return Err(EngineError::ChecksumMismatch);
        }

        let mut cur = Cursor::new(footer_bytes);
        let num_rows = cur.read_u32::<LittleEndian>()?;
        let count    = cur.read_u32::<LittleEndian>()? as usize;

        let mut time       = None;
        let mut metrics    = BTreeMap::new();
        let mut dimensions = Vec::new();
        for _ in 0..count {
            let kind   = SectionKind::from_u8(cur.read_u8()?)?;
            let name   = read_string(&mut cur)?;
            let offset = cur.read_u64::<LittleEndian>()? as usize;
            let size   = cur.read_u64::<LittleEndian>()? as usize;
            let bytes  = offset.checked_add(size)
                .filter(|&end| offset >= 12 && end <= footer_start)
                .map(|end| &data[offset..end])
                .ok_or_else(|| EngineError::SegmentIo(format!("section [{name}] out of bounds")))?;

            match kind {
                SectionKind::Time => {
                    if time.replace(CompressedColumn::from_bytes(bytes)?).is_some() {
                        return Err(EngineError::SegmentIo("segment has two time columns".into()));
                    }
                }
                SectionKind::Metric => {
                    let col = CompressedColumn::from_bytes(bytes)?;
                    if metrics.insert(name.clone(), col).is_some() {
                        return Err(EngineError::SegmentIo(format!("metric [{name}] appears twice")));
                    }
                }
                SectionKind::Dimension => dimensions.push(decode_dimension(name, bytes)?),
            }
        }
        let time = time.ok_or_else(|| EngineError::SegmentIo("segment has no time column".into()))?;

        tracing::debug!(rows = num_rows, metrics = metrics.len(), dimensions = dimensions.len(), "opened segment");
        Self::assemble(num_rows, time, metrics, dimensions)
    }
}

impl BitmapIndexSelector for Segment {
    fn num_rows(&self) -> u32 { self.num_rows }

    fn bitmap_index(&self, dimension: &str) -> Option<&BitmapIndex> {
        self.dimension(dimension).and_then(DimensionColumn::index)
    }
}

// ── 段内编码辅助 ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    Time      = 0,
    Metric    = 1,
    Dimension = 2,
}

impl SectionKind {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::Time),
            1 => Ok(Self::Metric),
            2 => Ok(Self::Dimension),
            _ => Err(EngineError::SegmentIo(format!("unknown section kind {b}"))),
        }
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) -> Result<()> {
    out.write_u32::<LittleEndian>(s.len() as u32)?;
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut raw = vec![0u8; len];
    r.read_exact(&mut raw)?;
    String::from_utf8(raw).map_err(|e| EngineError::SegmentIo(format!("name is not utf8: {e}")))
}

fn write_u32s(out: &mut Vec<u8>, vals: &[u32]) -> Result<()> {
    out.write_u32::<LittleEndian>(vals.len() as u32)?;
    for &v in vals {
        out.write_u32::<LittleEndian>(v)?;
    }
    Ok(())
}

fn read_u32s<R: Read>(r: &mut R) -> Result<Vec<u32>> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    (0..len).map(|_| Ok(r.read_u32::<LittleEndian>()?)).collect()
}

/// 维度列：字典 │ offsets │ ids │ has_index │ [index_len + index]，末尾 CRC32
fn encode_dimension(dim: &DimensionColumn) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(dim.dictionary().len() as u32)?;
    for v in dim.dictionary() {
        write_string(&mut out, v)?;
    }
    write_u32s(&mut out, dim.offsets())?;
    write_u32s(&mut out, dim.ids())?;
    match dim.index() {
        Some(index) => {
            let bytes = index.serialize()?;
            out.write_u8(1)?;
            out.write_u32::<LittleEndian>(bytes.len() as u32)?;
            out.extend_from_slice(&bytes);
        }
        None => out.write_u8(0)?,
    }
    let crc = crc32fast::hash(&out);
    out.write_u32::<LittleEndian>(crc)?;
    Ok(out)
}

fn decode_dimension(name: String, bytes: &[u8]) -> Result<DimensionColumn> {
    if bytes.len() < 4 {
        return Err(EngineError::SegmentIo(format!("dimension [{name}] too short")));
    }
    let body_end = bytes.len() - 4;
    if crc32fast::hash(&bytes[..body_end]) != (&bytes[body_end..]).read_u32::<LittleEndian>()? {
        return Err(EngineError::ChecksumMismatch);
    }

    let mut cur = Cursor::new(&bytes[..body_end]);
    let dict_len = cur.read_u32::<LittleEndian>()? as usize;
    let dictionary = (0..dict_len).map(|_| read_string(&mut cur)).collect::<Result<Vec<_>>>()?;
    let offsets = read_u32s(&mut cur)?;
    let ids     = read_u32s(&mut cur)?;
    let index = match cur.read_u8()? {
        0 => None,
        _ => {
            let len = cur.read_u32::<LittleEndian>()? as usize;
            let mut raw = vec![0u8; len];
            cur.read_exact(&mut raw)?;
            Some(BitmapIndex::deserialize(&raw)?)
        }
    };
    DimensionColumn::from_parts(name, dictionary, offsets, ids, index)
}
