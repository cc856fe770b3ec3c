//! 维度列：排序字典 + 每行取值编号列表（支持多值）

use std::collections::BTreeSet;

use crate::common::{EngineError, Result, RowId};
use crate::index::{BitmapIndex, BitmapIndexBuilder};

#[derive(Debug, Clone, PartialEq)]
pub struct DimensionColumn {
    name:       String,
    dictionary: Vec<String>,
    /// 第 r 行的取值编号是 `ids[offsets[r]..offsets[r+1]]`
    offsets:    Vec<u32>,
    ids:        Vec<u32>,
    index:      Option<BitmapIndex>,
}

impl DimensionColumn {
    /// 由已编码的部件重建；用于段文件读取
    pub(crate) fn from_parts(
        name:       String,
        dictionary: Vec<String>,
        offsets:    Vec<u32>,
        ids:        Vec<u32>,
        index:      Option<BitmapIndex>,
    ) -> Result<Self> {
        let consistent = !offsets.is_empty()
            && offsets.windows(2).all(|w| w[0] <= w[1])
            && offsets.last().map(|&end| end as usize == ids.len()).unwrap_or(false)
            && ids.iter().all(|&id| (id as usize) < dictionary.len());
        if !consistent {
            return Err(EngineError::SegmentIo(format!("dimension '{name}' is malformed")));
        }
        Ok(Self { name, dictionary, offsets, ids, index })
    }

    pub fn name(&self)       -> &str           { &self.name }
    pub fn num_rows(&self)   -> usize          { self.offsets.len() - 1 }
    pub fn dictionary(&self) -> &[String]      { &self.dictionary }
    pub fn index(&self)      -> Option<&BitmapIndex> { self.index.as_ref() }
    pub(crate) fn offsets(&self) -> &[u32]     { &self.offsets }
    pub(crate) fn ids(&self)     -> &[u32]     { &self.ids }

    /// 第 `row` 行的取值编号；越界行返回空
    pub fn row_ids(&self, row: RowId) -> &[u32] {
        let r = row as usize;
        if r + 1 >= self.offsets.len() {
            return &[];
        }
        &self.ids[self.offsets[r] as usize..self.offsets[r + 1] as usize]
    }

    pub fn row_values(&self, row: RowId) -> impl Iterator<Item = &str> + '_ {
        self.row_ids(row).iter().map(move |&id| self.dictionary[id as usize].as_str())
    }

    pub fn lookup(&self, value: &str) -> Option<u32> {
        self.dictionary
            .binary_search_by(|v| v.as_str().cmp(value))
            .ok()
            .map(|i| i as u32)
    }
}

// ── DimensionColumnBuilder ────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DimensionColumnBuilder {
    name:    String,
    indexed: bool,
    values:  Vec<String>,
    offsets: Vec<u32>,
    seen:    BTreeSet<String>,
}

impl DimensionColumnBuilder {
    pub fn new(name: &str, indexed: bool) -> Self {
        Self {
            name:    name.into(),
            indexed,
            values:  Vec::new(),
            offsets: vec![0],
            seen:    BTreeSet::new(),
        }
    }

    pub fn num_rows(&self) -> usize { self.offsets.len() - 1 }

    /// 补空行直到行数达到 `rows`（维度首次出现之前的行）
    pub fn pad_to(&mut self, rows: usize) {
        while self.num_rows() < rows {
            self.offsets.push(self.values.len() as u32);
        }
    }

    /// 追加一行的全部取值；同一行内重复的取值只记一次
    pub fn add_row<'a>(&mut self, values: impl IntoIterator<Item = &'a str>) {
        let start = self.values.len();
        for v in values {
            if self.values[start..].iter().any(|seen| seen == v) {
                continue;
            }
            if !self.seen.contains(v) {
                self.seen.insert(v.to_owned());
            }
            self.values.push(v.to_owned());
        }
        self.offsets.push(self.values.len() as u32);
    }

    pub fn build(self) -> DimensionColumn {
        let dictionary: Vec<String> = self.seen.into_iter().collect();
        let ids: Vec<u32> = self.values.iter()
            .map(|v| dictionary.binary_search(v).map(|i| i as u32).unwrap_or_default())
            .collect();

        let index = self.indexed.then(|| {
            let mut b = BitmapIndexBuilder::new();
            for row in 0..self.offsets.len() - 1 {
                let (lo, hi) = (self.offsets[row] as usize, self.offsets[row + 1] as usize);
                for &id in &ids[lo..hi] {
                    b.add(&dictionary[id as usize], row as RowId);
                }
            }
            b.build()
        });

        tracing::debug!(
            dimension = %self.name,
            cardinality = dictionary.len(),
            indexed = self.indexed,
            "built dimension column"
        );
        DimensionColumn { name: self.name, dictionary, offsets: self.offsets, ids, index }
    }
}
