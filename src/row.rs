//! 输入行与行源
//!
//! 行源由外部摄取层提供（拉模式）；本模块只定义边界契约和一个内存实现。

use std::collections::{HashMap, VecDeque};

use crate::common::{EngineError, Result};

/// 一行原始数据：时间戳 + 有序维度名 + 按名取值
pub trait InputRow {
    fn timestamp_millis(&self) -> i64;

    /// 本行携带的维度名（有序）
    fn dimensions(&self) -> &[String];

    /// 维度取值；多值维度返回多个
    fn dimension_values(&self, dimension: &str) -> Vec<&str>;

    /// 度量取值；缺失或无法解析为数字时为 None
    fn metric(&self, name: &str) -> Option<f32>;
}

/// 拉模式行源
pub trait RowSource {
    type Row: InputRow;

    fn has_more(&mut self) -> bool;
    fn next_row(&mut self) -> Result<Self::Row>;
}

// ── MapBasedRow ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    Str(String),
    List(Vec<String>),
    Number(f64),
}

impl From<&str> for RowValue {
    fn from(s: &str) -> Self { Self::Str(s.into()) }
}

impl From<f64> for RowValue {
    fn from(v: f64) -> Self { Self::Number(v) }
}

impl From<Vec<&str>> for RowValue {
    fn from(vs: Vec<&str>) -> Self { Self::List(vs.into_iter().map(str::to_owned).collect()) }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapBasedRow {
    timestamp:  i64,
    dimensions: Vec<String>,
    event:      HashMap<String, RowValue>,
}

impl MapBasedRow {
    pub fn new(timestamp: i64, dimensions: &[&str]) -> Self {
        Self {
            timestamp,
            dimensions: dimensions.iter().map(|d| (*d).to_owned()).collect(),
            event:      HashMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<RowValue>) -> Self {
        self.event.insert(key.into(), value.into());
        self
    }
}

impl InputRow for MapBasedRow {
    fn timestamp_millis(&self) -> i64 { self.timestamp }

    fn dimensions(&self) -> &[String] { &self.dimensions }

    fn dimension_values(&self, dimension: &str) -> Vec<&str> {
        match self.event.get(dimension) {
            Some(RowValue::Str(s))  => vec![s.as_str()],
            Some(RowValue::List(l)) => l.iter().map(String::as_str).collect(),
            // 数值不作为维度取值
            Some(RowValue::Number(_)) | None => Vec::new(),
        }
    }

    fn metric(&self, name: &str) -> Option<f32> {
        match self.event.get(name)? {
            RowValue::Number(v) => Some(*v as f32),
            RowValue::Str(s)    => s.trim().parse().ok(),
            RowValue::List(_)   => None,
        }
    }
}

// ── VecRowSource ──────────────────────────────────────────────────────────────

/// 内存行源，按插入顺序吐出
#[derive(Debug, Default)]
pub struct VecRowSource<R> {
    rows: VecDeque<R>,
}

impl<R: InputRow> VecRowSource<R> {
    pub fn new(rows: impl IntoIterator<Item = R>) -> Self {
        Self { rows: rows.into_iter().collect() }
    }
}

impl<R: InputRow> RowSource for VecRowSource<R> {
    type Row = R;

    fn has_more(&mut self) -> bool { !self.rows.is_empty() }

    fn next_row(&mut self) -> Result<R> {
        self.rows.pop_front()
            .ok_or_else(|| EngineError::InvalidInput("row source is exhausted".into()))
    }
}
