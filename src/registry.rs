use crate::error::LaunchError;
use crate::state::{lock, StreamId, StreamRecord};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// `ensure_with` 的结果
pub enum Ensure {
    /// 已有存活的进程，刷新活跃时间后复用
    Running(Arc<StreamRecord>),
    /// 本次调用新启动的进程
    Launched(Arc<StreamRecord>),
    /// 旧进程已退出，记录已移出注册表，调用方需在锁外回收后重试
    Dead(Arc<StreamRecord>),
}

/// 活跃流表 (Stream Id -> Record)
///
/// 所有增删都在同一把锁内完成，保证同一 id 不会启动两个进程。
/// `get` / `touch` 只短暂持锁取出记录，时间戳本身无锁更新。
#[derive(Default)]
pub struct Registry {
    streams: Mutex<HashMap<StreamId, Arc<StreamRecord>>>,
}

impl Registry {
    pub fn get(&self, id: &StreamId) -> Option<Arc<StreamRecord>> {
        lock(&self.streams).get(id).cloned()
    }

    pub fn touch(&self, id: &StreamId) -> bool {
        match self.get(id) {
            Some(record) => {
                record.touch();
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        lock(&self.streams).len()
    }

    /// 当前所有记录，按 id 排序
    pub fn snapshot(&self) -> Vec<Arc<StreamRecord>> {
        let mut records: Vec<_> = lock(&self.streams).values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// 注册表中该 id 仍指向同一次启动的记录
    pub fn is_current(&self, record: &Arc<StreamRecord>) -> bool {
        lock(&self.streams)
            .get(&record.id)
            .is_some_and(|current| Arc::ptr_eq(current, record))
    }

    /// 在锁内检查并按需启动。`launch` 只做目录准备与 spawn，都是瞬时操作
    pub fn ensure_with<F>(
        &self,
        id: &StreamId,
        source: &str,
        launch: F,
    ) -> Result<Ensure, LaunchError>
    where
        F: FnOnce() -> Result<StreamRecord, LaunchError>,
    {
        let mut streams = lock(&self.streams);

        if let Some(existing) = streams.get(id) {
            if existing.is_alive() {
                if existing.source != source {
                    warn!(
                        "Stream [{}] already running from {}, ignoring new source {}",
                        id, existing.source, source
                    );
                }
                existing.touch();
                return Ok(Ensure::Running(existing.clone()));
            }
            if let Some(dead) = streams.remove(id) {
                return Ok(Ensure::Dead(dead));
            }
        }

        let record = Arc::new(launch()?);
        streams.insert(id.clone(), record.clone());
        Ok(Ensure::Launched(record))
    }

    pub fn remove(&self, id: &StreamId) -> Option<Arc<StreamRecord>> {
        lock(&self.streams).remove(id)
    }

    /// 只有当注册表中仍是同一条记录时才移除，避免误删新启动的实例
    pub fn remove_exact(&self, record: &Arc<StreamRecord>) -> bool {
        let mut streams = lock(&self.streams);
        let same = streams
            .get(&record.id)
            .is_some_and(|current| Arc::ptr_eq(current, record));
        if same {
            streams.remove(&record.id);
        }
        same
    }

    pub fn take_all(&self) -> Vec<Arc<StreamRecord>> {
        lock(&self.streams).drain().map(|(_, record)| record).collect()
    }
}
