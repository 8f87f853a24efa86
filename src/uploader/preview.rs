// 预览资源管理
//
// 为图片类型的候选文件和被拒绝文件生成本地临时引用（blob URL 形式），
// 文件从两个集合中都消失后立即撤销，会话结束时撤销全部。
// 本地文件只记录路径，解析时才读取内容

use crate::uploader::candidate::{CandidateId, SelectedFile};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// 预览 URL 前缀
pub const PREVIEW_URL_SCHEME: &str = "blob:media-upload/";

/// 预览数据来源
#[derive(Debug, Clone)]
enum PreviewData {
    Memory(Bytes),
    File(PathBuf),
}

impl PreviewData {
    fn from_file(file: &SelectedFile) -> Option<Self> {
        if !file.payload.is_empty() {
            return Some(PreviewData::Memory(file.payload.clone()));
        }
        file.source.clone().map(PreviewData::File)
    }
}

/// 预览数据存储：URL -> 图片数据
///
/// 可被多个读取方并发解析
#[derive(Debug, Default)]
pub struct PreviewStore {
    entries: DashMap<String, PreviewData>,
}

impl PreviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建新的引用
    fn create(&self, data: PreviewData) -> String {
        let url = format!("{}{}", PREVIEW_URL_SCHEME, Uuid::new_v4());
        self.entries.insert(url.clone(), data);
        url
    }

    /// 解析引用
    pub fn resolve(&self, url: &str) -> Option<Bytes> {
        let data = self.entries.get(url)?.value().clone();
        match data {
            PreviewData::Memory(bytes) => Some(bytes),
            PreviewData::File(path) => match std::fs::read(&path) {
                Ok(bytes) => Some(Bytes::from(bytes)),
                Err(e) => {
                    warn!("读取预览文件失败: {:?}, 错误: {}", path, e);
                    None
                }
            },
        }
    }

    /// 内存中持有的预览字节数
    pub fn resident_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| match entry.value() {
                PreviewData::Memory(bytes) => bytes.len(),
                PreviewData::File(_) => 0,
            })
            .sum()
    }

    /// 撤销引用，返回是否存在
    fn revoke(&self, url: &str) -> bool {
        self.entries.remove(url).is_some()
    }

    /// 当前存活的引用数
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
enum PreviewEntry {
    Live(String),
    /// 解码失败，界面退回通用图标，不再重新生成
    Errored,
}

/// 一次同步的结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PreviewSyncReport {
    pub created: usize,
    pub revoked: usize,
    pub reused: usize,
}

/// 解码后的预览信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewImage {
    pub width: u32,
    pub height: u32,
}

/// 预览资源管理器
///
/// 独占持有所有引用，本身不加锁，由上传队列控制器串行调用
#[derive(Debug)]
pub struct PreviewManager {
    store: Arc<PreviewStore>,
    entries: HashMap<CandidateId, PreviewEntry>,
}

impl PreviewManager {
    pub fn new() -> Self {
        Self {
            store: Arc::new(PreviewStore::new()),
            entries: HashMap::new(),
        }
    }

    /// 共享的存储（只读解析用）
    pub fn store(&self) -> Arc<PreviewStore> {
        self.store.clone()
    }

    /// 与当前文件集合同步
    ///
    /// - 不再存在的键：撤销
    /// - 新出现的图片键：创建
    /// - 已存在的键：复用（不重新生成）
    pub fn sync(&mut self, sources: &[(CandidateId, SelectedFile)]) -> PreviewSyncReport {
        let mut report = PreviewSyncReport::default();
        let live: HashSet<CandidateId> = sources
            .iter()
            .filter(|(_, file)| file.is_image())
            .map(|(id, _)| *id)
            .collect();

        let stale: Vec<CandidateId> = self
            .entries
            .keys()
            .filter(|id| !live.contains(id))
            .copied()
            .collect();
        for id in stale {
            if let Some(PreviewEntry::Live(url)) = self.entries.remove(&id) {
                self.store.revoke(&url);
                report.revoked += 1;
                debug!("撤销预览: key={}, url={}", id, url);
            }
        }

        for (id, file) in sources.iter().filter(|(_, file)| file.is_image()) {
            if self.entries.contains_key(id) {
                report.reused += 1;
                continue;
            }
            // 内容已释放（超过大小限制）的文件不生成预览
            let Some(data) = PreviewData::from_file(file) else {
                continue;
            };
            let url = self.store.create(data);
            debug!("创建预览: key={}, name={}, url={}", id, file.name, url);
            self.entries.insert(*id, PreviewEntry::Live(url));
            report.created += 1;
        }

        report
    }

    /// 键对应的预览 URL（解码失败过的键返回 None）
    pub fn url(&self, key: &CandidateId) -> Option<&str> {
        match self.entries.get(key)? {
            PreviewEntry::Live(url) => Some(url.as_str()),
            PreviewEntry::Errored => None,
        }
    }

    pub fn resolve(&self, url: &str) -> Option<Bytes> {
        self.store.resolve(url)
    }

    pub fn is_errored(&self, key: &CandidateId) -> bool {
        matches!(self.entries.get(key), Some(PreviewEntry::Errored))
    }

    /// 标记为解码失败并撤销引用
    pub fn mark_errored(&mut self, key: &CandidateId) {
        if let Some(entry) = self.entries.get_mut(key) {
            if let PreviewEntry::Live(url) = std::mem::replace(entry, PreviewEntry::Errored) {
                self.store.revoke(&url);
            }
        }
    }

    /// 解码预览图片
    ///
    /// 解码失败时标记该键，之后不再尝试
    pub fn decode(&mut self, key: &CandidateId) -> Option<PreviewImage> {
        let url = self.url(key)?.to_string();
        let Some(data) = self.store.resolve(&url) else {
            self.mark_errored(key);
            return None;
        };

        match image::load_from_memory(&data) {
            Ok(img) => Some(PreviewImage {
                width: img.width(),
                height: img.height(),
            }),
            Err(e) => {
                warn!("预览解码失败: key={}, 错误: {}", key, e);
                self.mark_errored(key);
                None
            }
        }
    }

    /// 撤销全部引用
    pub fn revoke_all(&mut self) -> usize {
        let mut revoked = 0;
        for (_, entry) in self.entries.drain() {
            if let PreviewEntry::Live(url) = entry {
                if self.store.revoke(&url) {
                    revoked += 1;
                }
            }
        }
        if revoked > 0 {
            debug!("撤销全部预览: {} 个", revoked);
        }
        revoked
    }

    /// 当前管理的键数量（含解码失败的键）
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PreviewManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreviewManager {
    fn drop(&mut self) {
        self.revoke_all();
    }
}
