//! 维度值倒排位图索引
//!
//! 每个维度的每个取值对应一个 RoaringBitmap，记录包含该取值的行号集合。
//! 多值维度下同一行可以出现在多个取值的位图里。构建完成后索引不可变，
//! 可被任意多个扫描线程无锁共享。
//!
//! 序列化格式：
//! ```text
//! entry_count (u32 LE)
//! [value_len (u32 LE) + value utf8 + bitmap_len (u32 LE) + roaring bytes] × N
//! CRC32 (u32 LE)
//! ```

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use roaring::RoaringBitmap;

use crate::common::{EngineError, Result, RowId};

// ── BitmapIndex ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, PartialEq)]
pub struct BitmapIndex {
    bitmaps: BTreeMap<String, RoaringBitmap>,
}

impl BitmapIndex {
    /// 取值对应的行集合；取值从未出现时返回 None
    pub fn bitmap(&self, value: &str) -> Option<&RoaringBitmap> {
        self.bitmaps.get(value)
    }

    /// 按取值升序遍历
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RoaringBitmap)> + '_ {
        self.bitmaps.iter().map(|(v, b)| (v.as_str(), b))
    }

    pub fn cardinality(&self) -> usize { self.bitmaps.len() }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(self.bitmaps.len() as u32)?;
        for (value, bitmap) in &self.bitmaps {
            out.write_u32::<LittleEndian>(value.len() as u32)?;
            out.extend_from_slice(value.as_bytes());
            out.write_u32::<LittleEndian>(bitmap.serialized_size() as u32)?;
            bitmap.serialize_into(&mut out)?;
        }
        let crc = crc32fast::hash(&out);
        out.write_u32::<LittleEndian>(crc)?;
        Ok(out)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(EngineError::SegmentIo("bitmap index data too short".into()));
        }
        let body_end   = data.len() - 4;
        let stored_crc = (&data[body_end..]).read_u32::<LittleEndian>()?;
        if crc32fast::hash(&data[..body_end]) != stored_crc {
            return Err(EngineError::ChecksumMismatch);
        }

        let mut cur = Cursor::new(&data[..body_end]);
        let n = cur.read_u32::<LittleEndian>()? as usize;
        let mut bitmaps = BTreeMap::new();
        for _ in 0..n {
            let vlen = cur.read_u32::<LittleEndian>()? as usize;
            let mut raw = vec![0u8; vlen];
            cur.read_exact(&mut raw)?;
            let value = String::from_utf8(raw)
                .map_err(|e| EngineError::SegmentIo(format!("dimension value is not utf8: {e}")))?;

            let blen = cur.read_u32::<LittleEndian>()? as usize;
            let mut raw = vec![0u8; blen];
            cur.read_exact(&mut raw)?;
            let bitmap = RoaringBitmap::deserialize_from(&raw[..])?;
            bitmaps.insert(value, bitmap);
        }
        Ok(Self { bitmaps })
    }
}

// ── BitmapIndexBuilder ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct BitmapIndexBuilder {
    bitmaps: BTreeMap<String, RoaringBitmap>,
}

impl BitmapIndexBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, value: &str, row: RowId) {
        match self.bitmaps.get_mut(value) {
            Some(b) => { b.insert(row); }
            None    => {
                let mut b = RoaringBitmap::new();
                b.insert(row);
                self.bitmaps.insert(value.to_owned(), b);
            }
        }
    }

    pub fn build(self) -> BitmapIndex {
        BitmapIndex { bitmaps: self.bitmaps }
    }
}

// ── BitmapIndexSelector ───────────────────────────────────────────────────────

/// 过滤器位图求值所需的段视图
pub trait BitmapIndexSelector {
    /// 段的总行数（NOT 求补与零元 AND 的全集）
    fn num_rows(&self) -> u32;

    /// 维度的位图索引；维度不存在或未建索引时为 None
    fn bitmap_index(&self, dimension: &str) -> Option<&BitmapIndex>;

    /// 维度是否可走位图路径
    fn has_bitmap_index(&self, dimension: &str) -> bool {
        self.bitmap_index(dimension).is_some()
    }

    /// 取值对应的行集合；取值未出现时返回显式空集
    fn bitmap_for(&self, dimension: &str, value: &str) -> RoaringBitmap {
        self.bitmap_index(dimension)
            .and_then(|idx| idx.bitmap(value))
            .cloned()
            .unwrap_or_default()
    }

    /// `[0, num_rows)` 全集
    fn all_rows(&self) -> RoaringBitmap {
        let mut full = RoaringBitmap::new();
        full.insert_range(0..self.num_rows());
        full
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BitmapIndex {
        let mut b = BitmapIndexBuilder::new();
        for (row, v) in ["x", "y", "x", "z", "x"].iter().enumerate() {
            b.add(v, row as RowId);
        }
        b.add("y", 4);
        b.build()
    }

    #[test]
    fn rows_are_grouped_by_value() {
        let idx = sample();
        assert_eq!(idx.cardinality(), 3);
        assert_eq!(idx.bitmap("x").unwrap().iter().collect::<Vec<_>>(), vec![0, 2, 4]);
        assert_eq!(idx.bitmap("y").unwrap().iter().collect::<Vec<_>>(), vec![1, 4]);
        assert!(idx.bitmap("w").is_none());

        let values: Vec<&str> = idx.iter().map(|(v, _)| v).collect();
        assert_eq!(values, vec!["x", "y", "z"]);
    }

    #[test]
    fn serialized_index_round_trips() {
        let idx   = sample();
        let bytes = idx.serialize().unwrap();
        assert_eq!(BitmapIndex::deserialize(&bytes).unwrap(), idx);
    }

    #[test]
    fn corrupted_index_is_rejected() {
        let mut bytes = sample().serialize().unwrap();
        bytes[5] ^= 0x40;
        assert!(matches!(BitmapIndex::deserialize(&bytes), Err(EngineError::ChecksumMismatch)));
    }
}
