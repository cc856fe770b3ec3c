//! 堆上聚合器：每个分组一个实例，由单个扫描线程独占驱动

use std::sync::Arc;

use crate::aggregation::{AggValue, AggregatorSpec, FloatSelector, Histogram};
use crate::common::{EngineError, Result};

enum State {
    Count(i64),
    LongSum(i64),
    DoubleSum(f64),
    Min(f64),
    Max(f64),
    Histogram(Histogram),
}

impl State {
    fn initial(spec: &AggregatorSpec) -> Self {
        match spec {
            AggregatorSpec::Count { .. }     => Self::Count(0),
            AggregatorSpec::LongSum { .. }   => Self::LongSum(0),
            AggregatorSpec::DoubleSum { .. } => Self::DoubleSum(0.0),
            AggregatorSpec::Min { .. }       => Self::Min(f64::INFINITY),
            AggregatorSpec::Max { .. }       => Self::Max(f64::NEG_INFINITY),
            AggregatorSpec::Histogram { breaks, .. } => Self::Histogram(Histogram::empty(breaks)),
        }
    }
}

pub struct Aggregator {
    spec:     AggregatorSpec,
    selector: Option<Arc<dyn FloatSelector>>,
    state:    State,
}

impl Aggregator {
    pub(crate) fn new(spec: &AggregatorSpec, selector: Option<Arc<dyn FloatSelector>>) -> Self {
        Self { spec: spec.clone(), selector, state: State::initial(spec) }
    }

    pub fn name(&self) -> &str { self.spec.name() }

    fn current(&self) -> f32 {
        self.selector.as_ref().map(|s| s.get()).unwrap_or(0.0)
    }

    /// 读取当前行并原地更新状态
    pub fn aggregate(&mut self) {
        let v = self.current();
        match &mut self.state {
            State::Count(n)     => *n += 1,
            State::LongSum(s)   => *s = s.wrapping_add(v as i64),
            State::DoubleSum(s) => *s += v as f64,
            State::Min(m)       => *m = m.min(v as f64),
            State::Max(m)       => *m = m.max(v as f64),
            State::Histogram(h) => h.offer(v),
        }
    }

    pub fn reset(&mut self) {
        self.state = State::initial(&self.spec);
    }

    pub fn get(&self) -> AggValue {
        match &self.state {
            State::Count(n) | State::LongSum(n) => AggValue::Long(*n),
            State::DoubleSum(v) | State::Min(v) | State::Max(v) => AggValue::Double(*v),
            State::Histogram(h) => AggValue::Histogram(h.clone()),
        }
    }

    pub fn get_as_float(&self) -> Result<f32> {
        match &self.state {
            State::Count(n) | State::LongSum(n) => Ok(*n as f32),
            State::DoubleSum(v) | State::Min(v) | State::Max(v) => Ok(*v as f32),
            State::Histogram(_) => Err(EngineError::UnsupportedOperation(format!(
                "histogram aggregator [{}] has no float projection", self.name()
            ))),
        }
    }

    /// 同名同类型、状态归零的新实例，共享同一个 selector
    pub fn duplicate(&self) -> Self {
        Self::new(&self.spec, self.selector.clone())
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("spec", &self.spec)
            .field("value", &self.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::testing::SettableFactory;

    #[test]
    fn count_aggregate_reset_duplicate() {
        let factory = SettableFactory::default();
        let mut agg = AggregatorSpec::count("rows").factorize(&factory).unwrap();
        for _ in 0..5 {
            agg.aggregate();
        }
        assert_eq!(agg.get(), AggValue::Long(5));
        assert_eq!(agg.get_as_float().unwrap(), 5.0);

        let mut dup = agg.duplicate();
        assert_eq!(dup.name(), "rows");
        assert_eq!(dup.get(), AggValue::Long(0));
        dup.aggregate();
        dup.aggregate();
        assert_eq!(dup.get(), AggValue::Long(2));
        assert_eq!(agg.get(), AggValue::Long(5));

        agg.reset();
        assert_eq!(agg.get(), AggValue::Long(0));
        assert_eq!(dup.get(), AggValue::Long(2));
    }

    #[test]
    fn sums_min_max_read_the_selector() {
        let factory = SettableFactory::default().with_metric("m");
        let specs = [
            AggregatorSpec::long_sum("ls", "m"),
            AggregatorSpec::double_sum("ds", "m"),
            AggregatorSpec::min("lo", "m"),
            AggregatorSpec::max("hi", "m"),
        ];
        let mut aggs: Vec<_> = specs.iter().map(|s| s.factorize(&factory).unwrap()).collect();
        for v in [2.5f32, -1.0, 4.0] {
            factory.set("m", v);
            aggs.iter_mut().for_each(Aggregator::aggregate);
        }
        // longSum 逐行截断：2 + (-1) + 4
        assert_eq!(aggs[0].get(), AggValue::Long(5));
        assert_eq!(aggs[1].get(), AggValue::Double(5.5));
        assert_eq!(aggs[2].get(), AggValue::Double(-1.0));
        assert_eq!(aggs[3].get(), AggValue::Double(4.0));
    }

    #[test]
    fn histogram_has_no_float_projection() {
        let factory = SettableFactory::default().with_metric("m");
        let mut agg = AggregatorSpec::histogram("h", "m", vec![1.0]).unwrap()
            .factorize(&factory).unwrap();
        factory.set("m", 3.0);
        agg.aggregate();
        match agg.get() {
            AggValue::Histogram(h) => assert_eq!(h.bins, vec![0, 1]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(agg.get_as_float(), Err(EngineError::UnsupportedOperation(_))));
    }
}
