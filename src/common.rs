//! 全局基础类型与错误定义

use thiserror::Error;

// ── ID 类型别名 ───────────────────────────────────────────────────────────────

/// 段内行号（从 0 开始连续递增）
pub type RowId = u32;

/// 时间列名称
pub const TIME_COLUMN: &str = "__time";

// ── 字节序 ────────────────────────────────────────────────────────────────────

/// 列 chunk 中数值的字节序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") { Self::Big } else { Self::Little }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self { Self::Little => 0, Self::Big => 1 }
    }

    pub(crate) fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::Little),
            1 => Ok(Self::Big),
            _ => Err(EngineError::SegmentIo(format!("unknown byte order tag {b}"))),
        }
    }
}

impl Default for ByteOrder {
    fn default() -> Self { Self::native() }
}

// ── 错误 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("index out of range: {index} (+{len}) exceeds size {size}")]
    OutOfRange { index: usize, len: usize, size: usize },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("resource error: {0}")]
    Resource(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("segment I/O error: {0}")]
    SegmentIo(String),
    #[error("scan cancelled after {rows_scanned} rows")]
    Cancelled { rows_scanned: usize },
}

impl EngineError {
    pub(crate) fn out_of_range(index: usize, len: usize, size: usize) -> Self {
        Self::OutOfRange { index, len, size }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::SegmentIo(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
