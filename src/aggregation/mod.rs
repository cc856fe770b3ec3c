//! 聚合框架
//!
//! 同一组聚合规格（`AggregatorSpec`）可以实例化为两种形态：
//! - **堆上聚合器** `Aggregator`：每个分组一个实例，状态在实例字段里
//! - **缓冲聚合器** `BufferAggregator`：状态按固定宽度打包进共享字节区，
//!   由 `AggregationArena` 为每个分组分配互不重叠的区间
//!
//! 两者都通过注入的 `FloatSelector` 读取"当前行"的度量值。

mod buffer;
mod heap;
pub mod histogram;

use std::collections::BTreeMap;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::common::{EngineError, Result};

pub use buffer::{AggregationArena, BufferAggregator, Slot};
pub use heap::Aggregator;
pub use histogram::Histogram;

// ── 聚合结果 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum AggValue {
    Long(i64),
    Float(f32),
    Double(f64),
    Histogram(Histogram),
}

impl AggValue {
    /// 数值投影；直方图没有单一数值
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Long(v)      => Some(*v as f64),
            Self::Float(v)     => Some(*v as f64),
            Self::Double(v)    => Some(*v),
            Self::Histogram(_) => None,
        }
    }
}

impl std::fmt::Display for AggValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long(v)      => write!(f, "{v}"),
            Self::Float(v)     => write!(f, "{v}"),
            Self::Double(v)    => write!(f, "{v}"),
            Self::Histogram(h) => write!(f, "histogram{:?} min={} max={}", h.bins, h.min, h.max),
        }
    }
}

/// 名称 → 聚合结果
pub type NamedValues = BTreeMap<String, AggValue>;

// ── 取值注入 ──────────────────────────────────────────────────────────────────

/// 读取扫描游标当前行的浮点度量
///
/// 要求 `Send + Sync`：聚合器持有 selector，分组区间可交给不同线程聚合。
pub trait FloatSelector: Send + Sync {
    fn get(&self) -> f32;
}

/// 聚合器实例化时按度量名索取 selector
pub trait ColumnSelectorFactory {
    fn make_float_selector(&self, metric: &str) -> Result<Arc<dyn FloatSelector>>;
}

// ── AggregatorSpec ────────────────────────────────────────────────────────────

/// 聚合规格：解析一次，按分组多次实例化
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorSpec {
    Count     { name: String },
    LongSum   { name: String, field_name: String },
    DoubleSum { name: String, field_name: String },
    Min       { name: String, field_name: String },
    Max       { name: String, field_name: String },
    Histogram { name: String, field_name: String, breaks: Vec<f32> },
}

impl AggregatorSpec {
    pub fn count(name: &str) -> Self {
        Self::Count { name: name.into() }
    }
    pub fn long_sum(name: &str, field_name: &str) -> Self {
        Self::LongSum { name: name.into(), field_name: field_name.into() }
    }
    pub fn double_sum(name: &str, field_name: &str) -> Self {
        Self::DoubleSum { name: name.into(), field_name: field_name.into() }
    }
    pub fn min(name: &str, field_name: &str) -> Self {
        Self::Min { name: name.into(), field_name: field_name.into() }
    }
    pub fn max(name: &str, field_name: &str) -> Self {
        Self::Max { name: name.into(), field_name: field_name.into() }
    }
    pub fn histogram(name: &str, field_name: &str, breaks: Vec<f32>) -> Result<Self> {
        histogram::validate_breaks(&breaks)?;
        Ok(Self::Histogram { name: name.into(), field_name: field_name.into(), breaks })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Count { name }
            | Self::LongSum { name, .. }
            | Self::DoubleSum { name, .. }
            | Self::Min { name, .. }
            | Self::Max { name, .. }
            | Self::Histogram { name, .. } => name,
        }
    }

    /// 读取的度量列；count 不读列
    pub fn field_name(&self) -> Option<&str> {
        match self {
            Self::Count { .. } => None,
            Self::LongSum { field_name, .. }
            | Self::DoubleSum { field_name, .. }
            | Self::Min { field_name, .. }
            | Self::Max { field_name, .. }
            | Self::Histogram { field_name, .. } => Some(field_name),
        }
    }

    /// 规格直接构造时（绕过 `histogram()`）也要校验
    pub fn validate(&self) -> Result<()> {
        if self.name().is_empty() {
            return Err(EngineError::InvalidInput("aggregator name must not be empty".into()));
        }
        if let Self::Histogram { breaks, .. } = self {
            histogram::validate_breaks(breaks)?;
        }
        Ok(())
    }

    fn selector(&self, factory: &dyn ColumnSelectorFactory) -> Result<Option<Arc<dyn FloatSelector>>> {
        self.field_name().map(|f| factory.make_float_selector(f)).transpose()
    }

    /// 实例化为堆上聚合器
    pub fn factorize(&self, factory: &dyn ColumnSelectorFactory) -> Result<Aggregator> {
        self.validate()?;
        let selector = self.selector(factory)?;
        Ok(Aggregator::new(self, selector))
    }

    /// 实例化为缓冲聚合器
    pub fn factorize_buffered(&self, factory: &dyn ColumnSelectorFactory) -> Result<BufferAggregator> {
        self.validate()?;
        let selector = self.selector(factory)?;
        Ok(BufferAggregator::new(self, selector))
    }

    /// 缓冲形态下每个分组占用的字节数
    pub fn max_intermediate_size(&self) -> usize {
        match self {
            Self::Histogram { breaks, .. } => buffer::histogram_width(breaks.len()),
            _ => 8,
        }
    }

    /// 合并同一聚合器在两个分片（例如两个段）上的部分结果
    pub fn combine(&self, lhs: &AggValue, rhs: &AggValue) -> Result<AggValue> {
        let merged = match (self, lhs, rhs) {
            (Self::Count { .. } | Self::LongSum { .. }, AggValue::Long(a), AggValue::Long(b)) => {
                AggValue::Long(a.wrapping_add(*b))
            }
            (Self::DoubleSum { .. }, AggValue::Double(a), AggValue::Double(b)) => AggValue::Double(a + b),
            (Self::Min { .. }, AggValue::Double(a), AggValue::Double(b)) => AggValue::Double(a.min(*b)),
            (Self::Max { .. }, AggValue::Double(a), AggValue::Double(b)) => AggValue::Double(a.max(*b)),
            (Self::Histogram { breaks, .. }, AggValue::Histogram(a), AggValue::Histogram(b)) => {
                if &a.breaks != breaks || &b.breaks != breaks {
                    return Err(EngineError::InvalidInput(format!(
                        "histogram [{}] cannot combine values with different breaks", self.name()
                    )));
                }
                let mut out = a.clone();
                out.merge(b);
                AggValue::Histogram(out)
            }
            _ => {
                return Err(EngineError::InvalidInput(format!(
                    "aggregator [{}] cannot combine {lhs:?} with {rhs:?}", self.name()
                )));
            }
        };
        Ok(merged)
    }

    /// 结果排序比较器：数值按 `f64::total_cmp`，直方图按样本总数
    pub fn compare(&self, lhs: &AggValue, rhs: &AggValue) -> Ordering {
        let key = |v: &AggValue| match (self, v) {
            (Self::Histogram { .. }, AggValue::Histogram(h)) => h.count() as f64,
            _ => v.as_f64().unwrap_or(f64::NAN),
        };
        key(lhs).total_cmp(&key(rhs))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// 测试用：值由测试代码直接设置（按 f32 位模式存放）
    #[derive(Default)]
    pub struct SettableSelector(pub AtomicU32);

    impl SettableSelector {
        pub fn set(&self, v: f32) { self.0.store(v.to_bits(), Ordering::Relaxed) }
    }

    impl FloatSelector for SettableSelector {
        fn get(&self) -> f32 { f32::from_bits(self.0.load(Ordering::Relaxed)) }
    }

    #[derive(Default)]
    pub struct SettableFactory {
        pub selectors: HashMap<String, Arc<SettableSelector>>,
    }

    impl SettableFactory {
        pub fn with_metric(mut self, name: &str) -> Self {
            self.selectors.insert(name.into(), Arc::default());
            self
        }
        pub fn set(&self, name: &str, v: f32) {
            self.selectors[name].set(v);
        }
    }

    impl ColumnSelectorFactory for SettableFactory {
        fn make_float_selector(&self, metric: &str) -> Result<Arc<dyn FloatSelector>> {
            match self.selectors.get(metric) {
                Some(s) => Ok(Arc::clone(s) as Arc<dyn FloatSelector>),
                None => Err(EngineError::InvalidInput(format!("unknown metric [{metric}]"))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::SettableFactory;
    use super::*;

    #[test]
    fn histogram_spec_validates_breaks() {
        assert!(AggregatorSpec::histogram("h", "m", vec![3.0, 1.0]).is_err());
        let raw = AggregatorSpec::Histogram { name: "h".into(), field_name: "m".into(), breaks: vec![] };
        assert!(raw.validate().is_err());
    }

    #[test]
    fn unknown_metric_fails_before_any_row() {
        let factory = SettableFactory::default();
        let err = AggregatorSpec::double_sum("s", "missing").factorize(&factory).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        // count 不读列
        assert!(AggregatorSpec::count("rows").factorize(&factory).is_ok());
    }

    #[test]
    fn intermediate_sizes() {
        assert_eq!(AggregatorSpec::count("c").max_intermediate_size(), 8);
        let h = AggregatorSpec::histogram("h", "m", vec![0.0, 10.0, 20.0]).unwrap();
        assert_eq!(h.max_intermediate_size(), 8 * 4 + 8);
    }

    #[test]
    fn combine_follows_each_kind() {
        let long = |v| AggValue::Long(v);
        let dbl  = |v| AggValue::Double(v);
        assert_eq!(AggregatorSpec::count("c").combine(&long(3), &long(4)).unwrap(), long(7));
        assert_eq!(AggregatorSpec::long_sum("s", "m").combine(&long(i64::MAX), &long(1)).unwrap(), long(i64::MIN));
        assert_eq!(AggregatorSpec::double_sum("s", "m").combine(&dbl(1.5), &dbl(2.0)).unwrap(), dbl(3.5));
        assert_eq!(AggregatorSpec::min("lo", "m").combine(&dbl(1.5), &dbl(-2.0)).unwrap(), dbl(-2.0));
        assert_eq!(AggregatorSpec::max("hi", "m").combine(&dbl(f64::NEG_INFINITY), &dbl(-2.0)).unwrap(), dbl(-2.0));

        let err = AggregatorSpec::count("c").combine(&long(1), &dbl(1.0)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn combine_histograms_bin_by_bin() {
        let spec = AggregatorSpec::histogram("h", "m", vec![0.0, 10.0]).unwrap();
        let mut a = Histogram::empty(&[0.0, 10.0]);
        [-1.0, 5.0].into_iter().for_each(|v| a.offer(v));
        let mut b = Histogram::empty(&[0.0, 10.0]);
        [5.0, 12.0, 7.0].into_iter().for_each(|v| b.offer(v));

        match spec.combine(&AggValue::Histogram(a.clone()), &AggValue::Histogram(b)).unwrap() {
            AggValue::Histogram(h) => {
                assert_eq!(h.bins, vec![1, 3, 1]);
                assert_eq!((h.min, h.max), (-1.0, 12.0));
            }
            other => panic!("unexpected {other:?}"),
        }

        let empty = AggValue::Histogram(Histogram::empty(&[0.0, 10.0]));
        assert_eq!(spec.combine(&AggValue::Histogram(a.clone()), &empty).unwrap(), AggValue::Histogram(a.clone()));

        let other = AggValue::Histogram(Histogram::empty(&[0.0, 20.0]));
        assert!(spec.combine(&AggValue::Histogram(a), &other).is_err());
    }

    #[test]
    fn compare_orders_numbers_and_histogram_counts() {
        let sum = AggregatorSpec::double_sum("s", "m");
        assert_eq!(sum.compare(&AggValue::Double(1.0), &AggValue::Double(2.0)), Ordering::Less);
        assert_eq!(sum.compare(&AggValue::Double(f64::NAN), &AggValue::Double(2.0)), Ordering::Greater);
        let count = AggregatorSpec::count("c");
        assert_eq!(count.compare(&AggValue::Long(5), &AggValue::Long(5)), Ordering::Equal);

        let spec = AggregatorSpec::histogram("h", "m", vec![0.0]).unwrap();
        let mut small = Histogram::empty(&[0.0]);
        small.offer(100.0);
        let mut big = Histogram::empty(&[0.0]);
        big.offer(-1.0);
        big.offer(-2.0);
        assert_eq!(
            spec.compare(&AggValue::Histogram(small), &AggValue::Histogram(big)),
            Ordering::Less
        );
    }
}
