//! 固定分桶直方图
//!
//! `breaks` 为 B 个严格递增的边界，划分出 B+1 个桶。取值恰好等于某个边界时
//! 落在该边界的下标对应的桶，否则落在二分查找的插入点。

use crate::common::{EngineError, Result};

/// 校验分桶边界：非空、无 NaN、严格递增
pub fn validate_breaks(breaks: &[f32]) -> Result<()> {
    if breaks.is_empty() {
        return Err(EngineError::InvalidInput("histogram needs at least one break".into()));
    }
    if breaks.iter().any(|b| b.is_nan()) {
        return Err(EngineError::InvalidInput("histogram breaks must not be NaN".into()));
    }
    if breaks.windows(2).any(|w| w[0] >= w[1]) {
        return Err(EngineError::InvalidInput(format!(
            "histogram breaks must be strictly ascending: {breaks:?}"
        )));
    }
    Ok(())
}

/// 取值所属的桶下标，范围 `[0, breaks.len()]`
pub fn bucket_index(breaks: &[f32], value: f32) -> usize {
    match breaks.binary_search_by(|b| b.total_cmp(&value)) {
        Ok(i)  => i,
        Err(i) => i,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub breaks: Vec<f32>,
    pub bins:   Vec<i64>,
    pub min:    f32,
    pub max:    f32,
}

impl Histogram {
    /// 空直方图：计数全零，min = +∞，max = −∞
    pub fn empty(breaks: &[f32]) -> Self {
        Self {
            breaks: breaks.to_vec(),
            bins:   vec![0; breaks.len() + 1],
            min:    f32::INFINITY,
            max:    f32::NEG_INFINITY,
        }
    }

    pub fn offer(&mut self, value: f32) {
        if value < self.min { self.min = value; }
        if value > self.max { self.max = value; }
        self.bins[bucket_index(&self.breaks, value)] += 1;
    }

    /// 样本总数
    pub fn count(&self) -> i64 { self.bins.iter().sum() }

    /// 逐桶相加并合并极值；调用方保证两者的 `breaks` 相同
    pub fn merge(&mut self, other: &Histogram) {
        for (bin, n) in self.bins.iter_mut().zip(&other.bins) {
            *bin += n;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_break_lands_on_its_own_index() {
        let breaks = [0.0, 10.0, 20.0];
        assert_eq!(bucket_index(&breaks, -1.0), 0);
        assert_eq!(bucket_index(&breaks, 0.0), 0);
        assert_eq!(bucket_index(&breaks, 0.5), 1);
        assert_eq!(bucket_index(&breaks, 10.0), 1);
        assert_eq!(bucket_index(&breaks, 20.0), 2);
        assert_eq!(bucket_index(&breaks, 20.5), 3);
    }

    #[test]
    fn breaks_must_ascend() {
        assert!(validate_breaks(&[1.0, 1.0]).is_err());
        assert!(validate_breaks(&[2.0, 1.0]).is_err());
        assert!(validate_breaks(&[f32::NAN]).is_err());
        assert!(validate_breaks(&[]).is_err());
        assert!(validate_breaks(&[-1.0, 3.5]).is_ok());
    }

    #[test]
    fn offer_tracks_min_max_and_count() {
        let mut h = Histogram::empty(&[0.0, 10.0, 20.0]);
        for v in [-5.0, 5.0, 15.0, 25.0, 10.0] {
            h.offer(v);
        }
        assert_eq!(h.bins, vec![1, 2, 1, 1]);
        assert_eq!(h.count(), 5);
        assert_eq!((h.min, h.max), (-5.0, 25.0));
    }
}
