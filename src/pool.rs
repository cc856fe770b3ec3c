//! chunk 解码缓冲池
//!
//! 查询视图打开时借出一块解码缓冲，`close` 时归还。池本身是共享的
//! `Arc<Mutex<Vec<_>>>`，锁中毒时借出/归还都报 `Resource`，缓冲直接丢弃。

use std::sync::{Arc, Mutex};

use crate::common::{EngineError, Result};

/// 池中最多保留的空闲缓冲数
pub const DEFAULT_MAX_IDLE: usize = 8;

pub struct BufferPool<T> {
    idle:     Arc<Mutex<Vec<Vec<T>>>>,
    capacity: usize,
    max_idle: usize,
}

impl<T> Clone for BufferPool<T> {
    fn clone(&self) -> Self {
        Self { idle: Arc::clone(&self.idle), capacity: self.capacity, max_idle: self.max_idle }
    }
}

impl<T> std::fmt::Debug for BufferPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity)
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

impl<T> BufferPool<T> {
    /// `capacity` 为新建缓冲的预留元素数（通常等于 chunk_size）
    pub fn new(capacity: usize) -> Self {
        Self::with_max_idle(capacity, DEFAULT_MAX_IDLE)
    }

    pub fn with_max_idle(capacity: usize, max_idle: usize) -> Self {
        Self { idle: Arc::new(Mutex::new(Vec::new())), capacity, max_idle }
    }

    /// 借出一块空缓冲，池空时新分配
    pub fn take(&self) -> Result<Vec<T>> {
        let mut idle = self.idle.lock()
            .map_err(|_| EngineError::Resource("decode buffer pool poisoned on acquire".into()))?;
        Ok(idle.pop().unwrap_or_else(|| Vec::with_capacity(self.capacity)))
    }

    /// 归还缓冲；池已满时直接释放
    pub fn give_back(&self, mut buf: Vec<T>) -> Result<()> {
        buf.clear();
        let mut idle = self.idle.lock()
            .map_err(|_| EngineError::Resource("decode buffer pool poisoned on release".into()))?;
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
        Ok(())
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn poison(&self)
    where
        T: Send + 'static,
    {
        let idle = Arc::clone(&self.idle);
        let _ = std::thread::spawn(move || {
            let _guard = idle.lock();
            panic!("poisoning decode buffer pool");
        })
        .join();
    }
}
