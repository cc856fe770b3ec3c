//! 后聚合表达式：在聚合完成后，对每个结果行按名称引用聚合值计算派生指标。
//! 纯函数，无状态，可重复求值。

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::aggregation::NamedValues;
use crate::common::{EngineError, Result};

// ── 算术运算 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl ArithmeticOp {
    const ALL: [Self; 4] = [Self::Add, Self::Subtract, Self::Multiply, Self::Divide];

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add      => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide   => "/",
        }
    }

    pub fn parse(fn_name: &str) -> Result<Self> {
        Self::ALL.into_iter()
            .find(|op| op.symbol() == fn_name)
            .ok_or_else(|| EngineError::InvalidInput(format!(
                "unknown operation [{fn_name}], known operations [+, -, *, /]"
            )))
    }

    /// 除数为 0 时结果为 0
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Self::Add      => lhs + rhs,
            Self::Subtract => lhs - rhs,
            Self::Multiply => lhs * rhs,
            Self::Divide   => if rhs == 0.0 { 0.0 } else { lhs / rhs },
        }
    }
}

// ── ArithmeticPostAggregator ──────────────────────────────────────────────────

/// 对子表达式从左到右折叠；构造时保证至少两个子表达式
#[derive(Debug, Clone, PartialEq)]
pub struct ArithmeticPostAggregator {
    name:   String,
    op:     ArithmeticOp,
    fields: Vec<PostAggregator>,
}

impl ArithmeticPostAggregator {
    pub fn new(name: &str, fn_name: &str, fields: Vec<PostAggregator>) -> Result<Self> {
        if fields.len() <= 1 {
            return Err(EngineError::InvalidInput(format!(
                "illegal number of fields [{}], must be > 1", fields.len()
            )));
        }
        let op = ArithmeticOp::parse(fn_name)?;
        Ok(Self { name: name.into(), op, fields })
    }

    pub fn op(&self) -> ArithmeticOp { self.op }
    pub fn fields(&self) -> &[PostAggregator] { &self.fields }

    fn compute(&self, values: &NamedValues) -> Result<f64> {
        let (first, rest) = self.fields.split_first()
            .ok_or_else(|| EngineError::InvalidInput("arithmetic without fields".into()))?;
        let mut acc = first.compute(values)?;
        for f in rest {
            acc = self.op.apply(acc, f.compute(values)?);
        }
        Ok(acc)
    }
}

// ── PostAggregator ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PostAggregator {
    Arithmetic(ArithmeticPostAggregator),
    /// 引用一个聚合器（或更早的后聚合器）的结果
    FieldAccess { name: String, field_name: String },
    Constant { name: String, value: f64 },
}

impl PostAggregator {
    pub fn arithmetic(name: &str, fn_name: &str, fields: Vec<PostAggregator>) -> Result<Self> {
        ArithmeticPostAggregator::new(name, fn_name, fields).map(Self::Arithmetic)
    }

    pub fn field_access(name: &str, field_name: &str) -> Self {
        Self::FieldAccess { name: name.into(), field_name: field_name.into() }
    }

    pub fn constant(name: &str, value: f64) -> Self {
        Self::Constant { name: name.into(), value }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Arithmetic(a)          => &a.name,
            Self::FieldAccess { name, .. } => name,
            Self::Constant { name, .. }  => name,
        }
    }

    pub fn compute(&self, values: &NamedValues) -> Result<f64> {
        match self {
            Self::Arithmetic(a) => a.compute(values),
            Self::FieldAccess { field_name, .. } => {
                let v = values.get(field_name).ok_or_else(|| {
                    EngineError::InvalidInput(format!("unknown field [{field_name}]"))
                })?;
                v.as_f64().ok_or_else(|| EngineError::UnsupportedOperation(format!(
                    "field [{field_name}] has no numeric value"
                )))
            }
            Self::Constant { value, .. } => Ok(*value),
        }
    }

    /// 表达式引用的所有字段名
    pub fn dependent_fields(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'s>(&'s self, out: &mut BTreeSet<&'s str>) {
        match self {
            Self::Arithmetic(a) => a.fields.iter().for_each(|f| f.collect_fields(out)),
            Self::FieldAccess { field_name, .. } => { out.insert(field_name.as_str()); }
            Self::Constant { .. } => {}
        }
    }

    /// 结果排序比较器
    pub fn compare(lhs: f64, rhs: f64) -> Ordering {
        lhs.total_cmp(&rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{AggValue, Histogram};

    fn values() -> NamedValues {
        let mut v = NamedValues::new();
        v.insert("rows".into(), AggValue::Long(4));
        v.insert("sum".into(), AggValue::Double(10.0));
        v.insert("h".into(), AggValue::Histogram(Histogram::empty(&[1.0])));
        v
    }

    #[test]
    fn construction_rejects_bad_input() {
        let one = vec![PostAggregator::constant("a", 1.0)];
        assert!(matches!(
            PostAggregator::arithmetic("x", "+", one),
            Err(EngineError::InvalidInput(_))
        ));
        let two = vec![PostAggregator::constant("a", 1.0), PostAggregator::constant("b", 2.0)];
        assert!(matches!(
            PostAggregator::arithmetic("x", "%", two),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn nested_expressions_and_dependencies() {
        let avg = PostAggregator::arithmetic("avg", "/", vec![
            PostAggregator::field_access("s", "sum"),
            PostAggregator::field_access("r", "rows"),
        ]).unwrap();
        let scaled = PostAggregator::arithmetic("scaled", "*", vec![
            avg,
            PostAggregator::constant("hundred", 100.0),
        ]).unwrap();
        assert_eq!(scaled.compute(&values()).unwrap(), 250.0);
        assert_eq!(scaled.compute(&values()).unwrap(), 250.0);
        assert_eq!(scaled.dependent_fields().into_iter().collect::<Vec<_>>(), vec!["rows", "sum"]);
    }

    #[test]
    fn missing_or_non_numeric_fields() {
        let missing = PostAggregator::field_access("x", "nope");
        assert!(matches!(missing.compute(&values()), Err(EngineError::InvalidInput(_))));
        let hist = PostAggregator::field_access("x", "h");
        assert!(matches!(hist.compute(&values()), Err(EngineError::UnsupportedOperation(_))));
    }

    #[test]
    fn compare_orders_nan_last() {
        assert_eq!(PostAggregator::compare(1.0, 2.0), Ordering::Less);
        assert_eq!(PostAggregator::compare(f64::NAN, 2.0), Ordering::Greater);
    }
}
