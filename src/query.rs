//! 单段查询执行
//!
//! ```text
//! filter ──► 位图路径（全部维度有索引） ─┐
//!        └─► 逐行匹配路径               ─┴─► 行号流 ─► 按批填充度量窗口 ─► 聚合（按分组）
//!                                                                           │
//!                                                   后聚合（逐结果行） ◄────┘
//! ```
//!
//! 一次扫描在单线程内同步完成；多个段可以用 [`scan_segments`] 并发扫描。

use std::cell::RefCell;
use std::collections::btree_map::{BTreeMap, Entry};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use roaring::RoaringBitmap;

use crate::aggregation::{
    AggValue, AggregationArena, Aggregator, AggregatorSpec, BufferAggregator,
    ColumnSelectorFactory, FloatSelector, NamedValues, Slot,
};
use crate::column::QueryableColumn;
use crate::common::{EngineError, Result, RowId};
use crate::dimension::DimensionColumn;
use crate::filter::{Filter, ValueMatcher, ValueMatcherFactory};
use crate::post_aggregation::PostAggregator;
use crate::segment::Segment;

pub const DEFAULT_BATCH_SIZE: usize = 4096;

// ── 查询描述 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter:           Option<Filter>,
    pub group_by:         Option<String>,
    pub aggregators:      Vec<AggregatorSpec>,
    pub post_aggregators: Vec<PostAggregator>,
    /// 时间区间 `[start, end)`，毫秒
    pub interval:         Option<(i64, i64)>,
}

impl Query {
    pub fn new(aggregators: Vec<AggregatorSpec>) -> Self {
        Self { aggregators, ..Self::default() }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter); self
    }
    pub fn with_group_by(mut self, dimension: &str) -> Self {
        self.group_by = Some(dimension.into()); self
    }
    pub fn with_post_aggregator(mut self, post: PostAggregator) -> Self {
        self.post_aggregators.push(post); self
    }
    pub fn with_interval(mut self, start: i64, end: i64) -> Self {
        self.interval = Some((start, end)); self
    }

    /// 聚合器名唯一；后聚合只能引用聚合器或更早的后聚合器
    pub fn validate(&self) -> Result<()> {
        let mut known: Vec<&str> = Vec::new();
        for spec in &self.aggregators {
            spec.validate()?;
            if known.contains(&spec.name()) {
                return Err(EngineError::InvalidInput(format!("duplicate output name [{}]", spec.name())));
            }
            known.push(spec.name());
        }
        for post in &self.post_aggregators {
            if let Some(missing) = post.dependent_fields().into_iter().find(|f| !known.contains(f)) {
                return Err(EngineError::InvalidInput(format!(
                    "post-aggregator [{}] references unknown field [{missing}]", post.name()
                )));
            }
            if known.contains(&post.name()) {
                return Err(EngineError::InvalidInput(format!("duplicate output name [{}]", post.name())));
            }
            known.push(post.name());
        }
        if let Some((start, end)) = self.interval {
            if start > end {
                return Err(EngineError::InvalidInput(format!("interval [{start}, {end}) is reversed")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// 每批行数；取消标志在批与批之间检查
    pub batch_size: usize,
}

impl Default for QueryOptions {
    fn default() -> Self { Self { batch_size: DEFAULT_BATCH_SIZE } }
}

impl QueryOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size; self
    }
}

/// 一个结果行；未分组时 key 为 None，分组时 None 表示"无取值"的行
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub key:     Option<String>,
    pub metrics: NamedValues,
}

#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self { Self::default() }
    pub fn cancel(&self) { self.0.store(true, Ordering::Release) }
    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::Acquire) }
}

// ── 扫描上下文 ────────────────────────────────────────────────────────────────

/// 扫描当前所在行；selector 与谓词共享同一个游标
#[derive(Clone, Default)]
struct RowCursor(Arc<AtomicU32>);

impl RowCursor {
    fn get(&self) -> RowId { self.0.load(Ordering::Relaxed) }
    fn set(&self, row: RowId) { self.0.store(row, Ordering::Relaxed) }
}

/// 一批行的度量值；selector 按游标从窗口里读
#[derive(Default)]
struct MetricWindow {
    start:  AtomicUsize,
    values: RwLock<Vec<f32>>,
}

struct WindowSelector {
    window: Arc<MetricWindow>,
    cursor: RowCursor,
}

impl FloatSelector for WindowSelector {
    fn get(&self) -> f32 {
        let idx = (self.cursor.get() as usize).wrapping_sub(self.window.start.load(Ordering::Relaxed));
        self.window.values.read()
            .map(|values| values.get(idx).copied().unwrap_or_default())
            .unwrap_or_default()
    }
}

/// 把段绑定到一个行游标上，同时充当度量 selector 工厂和谓词工厂
struct ScanContext<'a> {
    segment: &'a Segment,
    cursor:  RowCursor,
    windows: RefCell<BTreeMap<String, Arc<MetricWindow>>>,
}

impl<'a> ScanContext<'a> {
    fn new(segment: &'a Segment) -> Self {
        Self { segment, cursor: RowCursor::default(), windows: RefCell::default() }
    }

    fn dimension(&self, name: &str) -> Option<&'a DimensionColumn> {
        self.segment.dimension(name)
    }

    /// 为每个被引用的度量打开一个列视图
    fn open_views(&self) -> Result<Vec<(QueryableColumn<f32>, Arc<MetricWindow>)>> {
        self.windows.borrow().iter()
            .map(|(name, window)| {
                let col = self.segment.metric(name)
                    .ok_or_else(|| EngineError::InvalidInput(format!("unknown metric [{name}]")))?;
                Ok((col.to_queryable_view()?, Arc::clone(window)))
            })
            .collect()
    }
}

impl ColumnSelectorFactory for ScanContext<'_> {
    fn make_float_selector(&self, metric: &str) -> Result<Arc<dyn FloatSelector>> {
        if self.segment.metric(metric).is_none() {
            return Err(EngineError::InvalidInput(format!("unknown metric [{metric}]")));
        }
        let window = Arc::clone(self.windows.borrow_mut().entry(metric.to_owned()).or_default());
        Ok(Arc::new(WindowSelector { window, cursor: self.cursor.clone() }))
    }
}

impl<'a> ValueMatcherFactory<'a> for ScanContext<'a> {
    fn make_value_matcher(&self, dimension: &str, value: &str) -> ValueMatcher<'a> {
        let Some(col) = self.dimension(dimension) else {
            return ValueMatcher::Constant(false);
        };
        let Some(id) = col.lookup(value) else {
            return ValueMatcher::Constant(false);
        };
        let cursor = self.cursor.clone();
        ValueMatcher::Predicate(Box::new(move || col.row_ids(cursor.get()).contains(&id)))
    }

    fn make_predicate_matcher(
        &self,
        dimension: &str,
        predicate: Box<dyn Fn(&str) -> bool + 'a>,
    ) -> ValueMatcher<'a> {
        let Some(col) = self.dimension(dimension) else {
            return ValueMatcher::Constant(false);
        };
        // 谓词对字典求值一次，逐行只查表
        let accepted: Vec<bool> = col.dictionary().iter().map(|v| predicate(v)).collect();
        if !accepted.contains(&true) {
            return ValueMatcher::Constant(false);
        }
        let cursor = self.cursor.clone();
        ValueMatcher::Predicate(Box::new(move || {
            col.row_ids(cursor.get()).iter().any(|&id| accepted[id as usize])
        }))
    }
}

// ── 行选择 ────────────────────────────────────────────────────────────────────

enum RowSelection<'a> {
    All,
    Bitmap(RoaringBitmap),
    Matcher(ValueMatcher<'a>),
}

impl<'a> RowSelection<'a> {
    fn plan(filter: Option<&Filter>, ctx: &ScanContext<'a>) -> Self {
        match filter {
            None => Self::All,
            Some(f) if f.supports_bitmap_index(ctx.segment) => {
                Self::Bitmap(f.evaluate_as_bitmap(ctx.segment))
            }
            Some(f) => Self::Matcher(f.make_matcher(ctx)),
        }
    }

    fn path(&self) -> &'static str {
        match self {
            Self::All        => "all",
            Self::Bitmap(_)  => "bitmap",
            Self::Matcher(_) => "matcher",
        }
    }
}

// ── 聚合目标 ──────────────────────────────────────────────────────────────────

enum Accumulators {
    Total(Vec<Aggregator>),
    Grouped(GroupedState),
}

/// 每个分组在 arena 中占一个 slot，slot 内按聚合器顺序排列
struct GroupedState {
    aggs:      Vec<(BufferAggregator, usize)>,
    width:     usize,
    arena:     AggregationArena,
    by_id:     Vec<Option<Slot>>,
    none_slot: Option<Slot>,
}

impl Accumulators {
    fn total(specs: &[AggregatorSpec], ctx: &ScanContext<'_>) -> Result<Self> {
        let aggs = specs.iter().map(|s| s.factorize(ctx)).collect::<Result<Vec<_>>>()?;
        Ok(Self::Total(aggs))
    }

    /// `cardinality` 为分组维度的字典大小；维度不存在时为 0，所有行落入 None 组
    fn grouped(specs: &[AggregatorSpec], ctx: &ScanContext<'_>, cardinality: usize) -> Result<Self> {
        let mut aggs  = Vec::with_capacity(specs.len());
        let mut width = 0;
        for spec in specs {
            let agg = spec.factorize_buffered(ctx)?;
            let w   = agg.width();
            aggs.push((agg, width));
            width += w;
        }
        Ok(Self::Grouped(GroupedState {
            aggs,
            width,
            arena:     AggregationArena::new(),
            by_id:     vec![None; cardinality],
            none_slot: None,
        }))
    }
}

impl GroupedState {
    fn allocate(&mut self) -> Slot {
        let slot = self.arena.allocate(self.width);
        let buf  = self.arena.buffer_mut();
        for (agg, inner) in &self.aggs {
            agg.init(buf, slot.offset + inner);
        }
        slot
    }

    fn aggregate_into(&mut self, slot: Slot) {
        let buf = self.arena.buffer_mut();
        for (agg, inner) in &self.aggs {
            agg.aggregate(buf, slot.offset + inner);
        }
    }

    fn aggregate_row(&mut self, ids: &[u32]) {
        if ids.is_empty() {
            let slot = match self.none_slot {
                Some(s) => s,
                None => {
                    let s = self.allocate();
                    self.none_slot = Some(s);
                    s
                }
            };
            self.aggregate_into(slot);
            return;
        }
        for &id in ids {
            let slot = match self.by_id[id as usize] {
                Some(s) => s,
                None => {
                    let s = self.allocate();
                    self.by_id[id as usize] = Some(s);
                    s
                }
            };
            self.aggregate_into(slot);
        }
    }

    fn read(&self, slot: Slot) -> NamedValues {
        let buf = self.arena.buffer();
        self.aggs.iter()
            .map(|(agg, inner)| (agg.name().to_owned(), agg.get(buf, slot.offset + inner)))
            .collect()
    }
}

// ── 执行 ──────────────────────────────────────────────────────────────────────

/// 在单个段上执行查询
pub fn run_query(
    segment: &Segment,
    query:   &Query,
    options: &QueryOptions,
    cancel:  &CancellationToken,
) -> Result<Vec<ResultRow>> {
    query.validate()?;
    if options.batch_size == 0 {
        return Err(EngineError::InvalidInput("batch size must be > 0".into()));
    }

    let ctx = ScanContext::new(segment);
    let group_col = query.group_by.as_deref().and_then(|d| ctx.dimension(d));
    let mut accumulators = match &query.group_by {
        None    => Accumulators::total(&query.aggregators, &ctx)?,
        Some(_) => {
            let cardinality = group_col.map(|c| c.dictionary().len()).unwrap_or(0);
            Accumulators::grouped(&query.aggregators, &ctx, cardinality)?
        }
    };
    let selection = RowSelection::plan(query.filter.as_ref(), &ctx);
    tracing::debug!(
        rows = segment.num_rows(),
        path = selection.path(),
        grouped = query.group_by.is_some(),
        "scanning segment"
    );

    let mut views = ctx.open_views()?;
    let mut time_view = match query.interval {
        Some(_) => Some(segment.time_column().to_queryable_view()?),
        None    => None,
    };
    let mut times: Vec<i64> = Vec::new();

    let mut bitmap_iter = match &selection {
        RowSelection::Bitmap(b) => Some(b.iter().peekable()),
        _ => None,
    };

    let num_rows = segment.num_rows() as usize;
    let mut scanned = 0usize;
    let mut matched = 0usize;
    let mut start   = 0usize;
    while start < num_rows {
        if cancel.is_cancelled() {
            tracing::debug!(rows_scanned = scanned, "scan cancelled");
            return Err(EngineError::Cancelled { rows_scanned: scanned });
        }
        let end = (start + options.batch_size).min(num_rows);

        let batch: Vec<RowId> = match (&selection, bitmap_iter.as_mut()) {
            (RowSelection::Bitmap(_), Some(it)) => {
                let mut rows = Vec::new();
                while let Some(row) = it.next_if(|&r| (r as usize) < end) {
                    rows.push(row);
                }
                rows
            }
            (RowSelection::Matcher(m), _) => (start as RowId..end as RowId)
                .filter(|&r| { ctx.cursor.set(r); m.matches() })
                .collect(),
            _ => (start as RowId..end as RowId).collect(),
        };

        if !batch.is_empty() {
            for (view, window) in views.iter_mut() {
                let mut values = window.values.write()
                    .map_err(|_| EngineError::Resource("metric window lock poisoned".into()))?;
                values.resize(end - start, 0.0);
                view.fill(start, &mut values[..])?;
                window.start.store(start, Ordering::Relaxed);
            }
            if let Some(view) = time_view.as_mut() {
                times.resize(end - start, 0);
                view.fill(start, &mut times)?;
            }
        }

        for row in batch {
            if let Some((lo, hi)) = query.interval {
                let ts = times[row as usize - start];
                if ts < lo || ts >= hi {
                    continue;
                }
            }
            ctx.cursor.set(row);
            matched += 1;
            match &mut accumulators {
                Accumulators::Total(aggs) => aggs.iter_mut().for_each(Aggregator::aggregate),
                Accumulators::Grouped(g)  => {
                    let ids = group_col.map(|c| c.row_ids(row)).unwrap_or(&[]);
                    g.aggregate_row(ids);
                }
            }
        }
        scanned += end - start;
        start = end;
    }

    for (view, _) in views {
        view.close()?;
    }
    if let Some(view) = time_view {
        view.close()?;
    }

    let rows = match accumulators {
        Accumulators::Total(aggs) => vec![ResultRow {
            key:     None,
            metrics: aggs.iter().map(|a| (a.name().to_owned(), a.get())).collect(),
        }],
        Accumulators::Grouped(g) => {
            let mut rows = Vec::new();
            if let Some(slot) = g.none_slot {
                rows.push(ResultRow { key: None, metrics: g.read(slot) });
            }
            // 字典有序，按编号输出即按取值排序
            for (id, slot) in g.by_id.iter().enumerate() {
                if let (Some(slot), Some(col)) = (slot, group_col) {
                    rows.push(ResultRow { key: Some(col.dictionary()[id].clone()), metrics: g.read(*slot) });
                }
            }
            rows
        }
    };

    let rows = apply_post_aggregators(query, rows)?;
    tracing::debug!(matched, groups = rows.len(), "scan finished");
    Ok(rows)
}

/// 按声明顺序计算后聚合，后者可引用前者
fn apply_post_aggregators(query: &Query, rows: Vec<ResultRow>) -> Result<Vec<ResultRow>> {
    rows.into_iter()
        .map(|mut row| {
            for post in &query.post_aggregators {
                let v = post.compute(&row.metrics)?;
                row.metrics.insert(post.name().to_owned(), AggValue::Double(v));
            }
            Ok(row)
        })
        .collect()
}

/// 把多个段的结果按分组键合并，再重新计算后聚合
///
/// 输出按键排序，None 组在最前。
pub fn merge_results(query: &Query, partials: Vec<Vec<ResultRow>>) -> Result<Vec<ResultRow>> {
    let mut merged: BTreeMap<Option<String>, NamedValues> = BTreeMap::new();
    for row in partials.into_iter().flatten() {
        let mut metrics = NamedValues::new();
        for spec in &query.aggregators {
            let value = row.metrics.get(spec.name()).ok_or_else(|| {
                EngineError::InvalidInput(format!("partial result lacks aggregator [{}]", spec.name()))
            })?;
            metrics.insert(spec.name().to_owned(), value.clone());
        }
        match merged.entry(row.key) {
            Entry::Vacant(e) => {
                e.insert(metrics);
            }
            Entry::Occupied(mut e) => {
                let acc = e.get_mut();
                for spec in &query.aggregators {
                    let name = spec.name();
                    let combined = spec.combine(&acc[name], &metrics[name])?;
                    acc.insert(name.to_owned(), combined);
                }
            }
        }
    }
    let rows = merged.into_iter().map(|(key, metrics)| ResultRow { key, metrics }).collect();
    apply_post_aggregators(query, rows)
}

/// 并发扫描多个段，每个段一个线程；任一段失败则返回第一个错误
pub fn scan_segments(
    segments: &[Segment],
    query:    &Query,
    options:  &QueryOptions,
    cancel:   &CancellationToken,
) -> Result<Vec<Vec<ResultRow>>> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = segments.iter()
            .map(|seg| scope.spawn(move || run_query(seg, query, options, cancel)))
            .collect();
        handles.into_iter()
            .map(|h| h.join().map_err(|_| EngineError::Resource("scan thread panicked".into()))?)
            .collect()
    })
}
