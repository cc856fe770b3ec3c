//! 过滤表达式
//!
//! 两条求值路径：
//!   - **位图路径** `evaluate_as_bitmap`：所有叶子维度都有位图索引时，直接做集合运算
//!   - **逐行路径** `make_matcher`：存在未建索引的维度时，逐行判断
//!
//! 零元 AND 在两条路径上语义不同：位图路径返回全集，逐行路径返回恒假。
//! 两者都按现有行为保留，调用方不要依赖空子句列表的含义。

use std::cmp::Ordering;

use roaring::RoaringBitmap;

use crate::common::{EngineError, Result};
use crate::index::BitmapIndexSelector;

// ── Filter ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    /// 维度等于某个取值
    Selector { dimension: String, value: String },
    /// 维度取值落在区间内
    Bound(BoundFilter),
}

impl Filter {
    pub fn and(filters: Vec<Filter>) -> Self { Self::And(filters) }
    pub fn or(filters: Vec<Filter>)  -> Self { Self::Or(filters) }
    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter)       -> Self { Self::Not(Box::new(filter)) }

    pub fn selector(dimension: &str, value: &str) -> Self {
        Self::Selector { dimension: dimension.into(), value: value.into() }
    }

    /// 所有叶子是否都能走位图路径
    pub fn supports_bitmap_index(&self, selector: &dyn BitmapIndexSelector) -> bool {
        match self {
            Self::And(fs) | Self::Or(fs) => fs.iter().all(|f| f.supports_bitmap_index(selector)),
            Self::Not(f)                 => f.supports_bitmap_index(selector),
            Self::Selector { dimension, .. } => selector.has_bitmap_index(dimension),
            Self::Bound(b)               => selector.has_bitmap_index(&b.dimension),
        }
    }

    pub fn evaluate_as_bitmap(&self, selector: &dyn BitmapIndexSelector) -> RoaringBitmap {
        match self {
            Self::And(fs) => match fs.as_slice() {
                []       => selector.all_rows(),
                [single] => single.evaluate_as_bitmap(selector),
                [first, rest @ ..] => {
                    let mut acc = first.evaluate_as_bitmap(selector);
                    for f in rest {
                        acc &= f.evaluate_as_bitmap(selector);
                    }
                    acc
                }
            },
            Self::Or(fs) => {
                let mut acc = RoaringBitmap::new();
                for f in fs {
                    acc |= f.evaluate_as_bitmap(selector);
                }
                acc
            }
            Self::Not(f) => selector.all_rows() - f.evaluate_as_bitmap(selector),
            Self::Selector { dimension, value } => selector.bitmap_for(dimension, value),
            Self::Bound(b) => {
                let mut acc = RoaringBitmap::new();
                if let Some(index) = selector.bitmap_index(&b.dimension) {
                    for (value, bitmap) in index.iter() {
                        if b.contains(value) {
                            acc |= bitmap;
                        }
                    }
                }
                acc
            }
        }
    }

    pub fn make_matcher<'a>(&self, factory: &dyn ValueMatcherFactory<'a>) -> ValueMatcher<'a> {
        match self {
            Self::And(fs) => {
                if fs.is_empty() {
                    return ValueMatcher::Constant(false);
                }
                let mut matchers: Vec<_> = fs.iter().map(|f| f.make_matcher(factory)).collect();
                if matchers.len() == 1 {
                    return matchers.remove(0);
                }
                ValueMatcher::And(matchers)
            }
            Self::Or(fs) => {
                let mut matchers: Vec<_> = fs.iter().map(|f| f.make_matcher(factory)).collect();
                match matchers.len() {
                    0 => ValueMatcher::Constant(false),
                    1 => matchers.remove(0),
                    _ => ValueMatcher::Or(matchers),
                }
            }
            Self::Not(f) => ValueMatcher::Not(Box::new(f.make_matcher(factory))),
            Self::Selector { dimension, value } => factory.make_value_matcher(dimension, value),
            Self::Bound(b) => {
                let bound = b.clone();
                factory.make_predicate_matcher(&b.dimension, Box::new(move |v| bound.contains(v)))
            }
        }
    }
}

// ── Bound ─────────────────────────────────────────────────────────────────────

/// 区间比较方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundOrdering {
    Lexicographic,
    Numeric,
}

impl BoundOrdering {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "lexicographic" => Ok(Self::Lexicographic),
            "numeric"       => Ok(Self::Numeric),
            other => Err(EngineError::InvalidInput(format!(
                "unknown bound ordering [{other}], known orderings [lexicographic, numeric]"
            ))),
        }
    }

    fn compare(self, value: &str, bound: &str) -> Option<Ordering> {
        match self {
            Self::Lexicographic => Some(value.cmp(bound)),
            Self::Numeric => {
                let v: f64 = value.trim().parse().ok()?;
                let b: f64 = bound.trim().parse().ok()?;
                v.partial_cmp(&b)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundFilter {
    pub dimension:    String,
    pub lower:        Option<String>,
    pub upper:        Option<String>,
    pub lower_strict: bool,
    pub upper_strict: bool,
    pub ordering:     BoundOrdering,
}

impl BoundFilter {
    /// `ordering` 取 "lexicographic" 或 "numeric"；数值比较时上下界必须能解析为数字
    pub fn new(
        dimension:    &str,
        lower:        Option<&str>,
        upper:        Option<&str>,
        lower_strict: bool,
        upper_strict: bool,
        ordering:     &str,
    ) -> Result<Self> {
        let ordering = BoundOrdering::parse(ordering)?;
        if lower.is_none() && upper.is_none() {
            return Err(EngineError::InvalidInput(format!(
                "bound filter on [{dimension}] needs a lower or upper bound"
            )));
        }
        if ordering == BoundOrdering::Numeric {
            for b in lower.iter().chain(upper.iter()) {
                if b.trim().parse::<f64>().is_err() {
                    return Err(EngineError::InvalidInput(format!(
                        "numeric bound [{b}] on [{dimension}] is not a number"
                    )));
                }
            }
        }
        Ok(Self {
            dimension: dimension.into(),
            lower:     lower.map(str::to_owned),
            upper:     upper.map(str::to_owned),
            lower_strict,
            upper_strict,
            ordering,
        })
    }

    pub fn contains(&self, value: &str) -> bool {
        if let Some(lo) = &self.lower {
            match self.ordering.compare(value, lo) {
                Some(Ordering::Greater)                     => {}
                Some(Ordering::Equal) if !self.lower_strict => {}
                _ => return false,
            }
        }
        if let Some(hi) = &self.upper {
            match self.ordering.compare(value, hi) {
                Some(Ordering::Less)                        => {}
                Some(Ordering::Equal) if !self.upper_strict => {}
                _ => return false,
            }
        }
        true
    }
}

impl From<BoundFilter> for Filter {
    fn from(b: BoundFilter) -> Self { Filter::Bound(b) }
}

// ── ValueMatcher ──────────────────────────────────────────────────────────────

/// 逐行谓词；`matches` 针对扫描游标当前所在的行
pub enum ValueMatcher<'a> {
    Constant(bool),
    Predicate(Box<dyn Fn() -> bool + 'a>),
    /// 从左到右求值，遇到 false 立即返回
    And(Vec<ValueMatcher<'a>>),
    /// 从左到右求值，遇到 true 立即返回
    Or(Vec<ValueMatcher<'a>>),
    Not(Box<ValueMatcher<'a>>),
}

impl ValueMatcher<'_> {
    pub fn matches(&self) -> bool {
        match self {
            Self::Constant(b)  => *b,
            Self::Predicate(f) => f(),
            Self::And(ms)      => ms.iter().all(|m| m.matches()),
            Self::Or(ms)       => ms.iter().any(|m| m.matches()),
            Self::Not(m)       => !m.matches(),
        }
    }
}

impl std::fmt::Debug for ValueMatcher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Constant(b)  => write!(f, "Constant({b})"),
            Self::Predicate(_) => write!(f, "Predicate"),
            Self::And(ms)      => f.debug_tuple("And").field(ms).finish(),
            Self::Or(ms)       => f.debug_tuple("Or").field(ms).finish(),
            Self::Not(m)       => f.debug_tuple("Not").field(m).finish(),
        }
    }
}

/// 逐行路径所需的谓词工厂，由扫描器绑定到当前行游标
pub trait ValueMatcherFactory<'a> {
    fn make_value_matcher(&self, dimension: &str, value: &str) -> ValueMatcher<'a>;

    fn make_predicate_matcher(
        &self,
        dimension: &str,
        predicate: Box<dyn Fn(&str) -> bool + 'a>,
    ) -> ValueMatcher<'a>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_bound_ordering_is_invalid_input() {
        let err = BoundFilter::new("d", Some("a"), None, false, false, "alphanumeric").unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn numeric_bound_requires_numbers() {
        assert!(BoundFilter::new("d", Some("abc"), None, false, false, "numeric").is_err());
        assert!(BoundFilter::new("d", None, None, false, false, "lexicographic").is_err());
    }

    #[test]
    fn bound_contains_respects_strictness() {
        let b = BoundFilter::new("d", Some("2"), Some("10"), true, false, "numeric").unwrap();
        assert!(!b.contains("2"));
        assert!(b.contains("2.5"));
        assert!(b.contains("10"));
        assert!(!b.contains("11"));
        assert!(!b.contains("n/a"));

        let lex = BoundFilter::new("d", Some("2"), Some("10"), false, false, "lexicographic").unwrap();
        // "10" < "2" 按字典序
        assert!(!lex.contains("5"));
    }

    #[test]
    fn or_and_not_matchers_short_circuit() {
        let m = ValueMatcher::Or(vec![
            ValueMatcher::Constant(true),
            ValueMatcher::Predicate(Box::new(|| panic!("must not be evaluated"))),
        ]);
        assert!(m.matches());
        assert!(!ValueMatcher::Not(Box::new(m)).matches());
    }
}
