//! # segment-scan
//!
//! 单段列存查询引擎：压缩度量列、位图索引过滤、堆上/缓冲两种聚合器、后聚合表达式。
//!
//! ## 整体架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          run_query                           │
//! │   Filter ──► BitmapIndexSelector (位图路径)                  │
//! │         └──► ValueMatcherFactory (逐行路径)                  │
//! │                         │ 行号                               │
//! │                         ▼                                    │
//! │   QueryableColumn<f32> ──► FloatSelector ──► Aggregator      │
//! │                                         └──► BufferAggregator│
//! │                                               (AggregationArena)
//! │                         │ NamedValues                        │
//! │                         ▼                                    │
//! │                  PostAggregator × N ──► ResultRow            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Segment                                                     │
//! │   ├─ __time      CompressedColumn<i64>                       │
//! │   ├─ metrics     CompressedColumn<f32> × M                   │
//! │   │    └─ chunk: count │ raw_len │ LZ4 payload │ CRC32       │
//! │   └─ dimensions  DimensionColumn × D                         │
//! │        └─ 排序字典 + 行取值 + BitmapIndex (roaring)          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

// ── 基础 ──────────────────────────────────────────────────────────────────────
pub mod common;
pub mod field_type;
pub mod compression;

// ── 列存 ──────────────────────────────────────────────────────────────────────
pub mod page;
pub mod pool;
pub mod column;
pub mod dimension;
pub mod index;
pub mod segment;

// ── 查询 ──────────────────────────────────────────────────────────────────────
pub mod row;
pub mod filter;
pub mod aggregation;
pub mod post_aggregation;
pub mod query;

pub use aggregation::{AggValue, AggregatorSpec, NamedValues};
pub use column::{CompressedColumn, CompressedColumnBuilder, QueryableColumn};
pub use common::{ByteOrder, EngineError, Result, RowId};
pub use compression::CompressionType;
pub use field_type::ColumnOptions;
pub use filter::{BoundFilter, Filter};
pub use post_aggregation::PostAggregator;
pub use query::{
    merge_results, run_query, scan_segments, CancellationToken, Query, QueryOptions, ResultRow,
};
pub use row::{InputRow, MapBasedRow, RowSource, VecRowSource};
pub use segment::{Segment, SegmentBuilder, SegmentOptions};
