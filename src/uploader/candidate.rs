// 上传候选文件定义
//
// 复用 UploadTask 的设计模式：状态 + 标记方法，所有状态变更统一经过 QueueState

use crate::uploader::validation::{ValidationCode, ValidationError};
use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 候选文件标识
///
/// 在文件被接受（或拒绝）时一次性生成，之后作为不透明令牌传递，不再重新计算
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(Uuid);

impl CandidateId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CandidateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for CandidateId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// 用户选择的文件
///
/// 内容有两种来源：内存中的 payload，或本地路径（上传开始时才读取）
#[derive(Clone, Serialize)]
pub struct SelectedFile {
    /// 文件名
    pub name: String,
    /// 声明的大小（字节）
    pub size: u64,
    /// 声明的 MIME 类型
    pub mime_type: String,
    /// 最后修改时间 (Unix timestamp, 毫秒)
    pub last_modified: Option<i64>,
    /// 文件内容（本地文件为空，按需读取）
    #[serde(skip)]
    pub payload: Bytes,
    /// 本地文件路径
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl fmt::Debug for SelectedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedFile")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("mime_type", &self.mime_type)
            .field("last_modified", &self.last_modified)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl SelectedFile {
    /// 从内存数据创建
    pub fn from_bytes(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        let payload = payload.into();
        Self {
            name: name.into(),
            size: payload.len() as u64,
            mime_type: mime_type.into(),
            last_modified: None,
            payload,
            source: None,
        }
    }

    /// 从本地文件创建
    ///
    /// 只读取元数据，大小和 MIME 类型（按扩展名推断，无法识别时为
    /// application/octet-stream）在校验前即可确定，内容在上传时才读取
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("无法获取文件元数据: {:?}", path))?;

        if metadata.is_dir() {
            anyhow::bail!("不支持直接添加目录: {:?}", path);
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());

        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string();

        let last_modified = metadata
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis());

        Ok(Self {
            name,
            size: metadata.len(),
            mime_type,
            last_modified,
            payload: Bytes::new(),
            source: Some(path.to_path_buf()),
        })
    }

    /// 是否还持有可用的内容（内存或本地路径）
    pub fn has_content(&self) -> bool {
        !self.payload.is_empty() || self.source.is_some()
    }

    /// 读取上传内容
    pub async fn read_payload(&self) -> Result<Bytes> {
        match &self.source {
            Some(path) if self.payload.is_empty() => {
                let data = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("读取文件失败: {:?}", path))?;
                Ok(Bytes::from(data))
            }
            _ => Ok(self.payload.clone()),
        }
    }

    /// 释放内容，之后既不能上传也不能生成预览
    pub(crate) fn release_content(&mut self) {
        self.payload = Bytes::new();
        self.source = None;
    }

    /// 是否为图片类型（用于生成预览）
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// 候选文件状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// 等待中（已选择或已排队）
    Pending,
    /// 上传中
    Uploading,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl UploadStatus {
    /// 是否为终态（completed/failed/cancelled）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Cancelled
        )
    }

    /// 是否允许重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadStatus::Failed | UploadStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 服务器返回的媒体信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedMedia {
    pub id: String,
    pub url: String,
}

/// 上传候选文件
#[derive(Debug, Clone, Serialize)]
pub struct UploadCandidate {
    /// 候选文件ID
    pub id: CandidateId,
    /// 文件信息
    pub file: SelectedFile,
    /// 当前状态
    pub status: UploadStatus,
    /// 进度 0-100
    pub progress: u8,
    /// 错误信息（仅 failed）
    pub error_message: Option<String>,
    /// 上传成功后服务器返回的结果
    pub media: Option<UploadedMedia>,
    /// 上传尝试次数，每次准入 +1
    pub attempt: u32,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 本次上传开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 取消句柄，仅在 uploading 状态下存在
    #[serde(skip)]
    pub(crate) cancel_token: Option<CancellationToken>,
}

impl UploadCandidate {
    /// 创建新的候选文件（状态 pending，进度 0）
    pub fn new(file: SelectedFile) -> Self {
        Self {
            id: CandidateId::new(),
            file,
            status: UploadStatus::Pending,
            progress: 0,
            error_message: None,
            media: None,
            attempt: 0,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            cancel_token: None,
        }
    }

    /// 是否持有取消句柄
    pub fn has_cancel_handle(&self) -> bool {
        self.cancel_token.is_some()
    }

    /// 标记为上传中，返回本次尝试的取消令牌
    pub(crate) fn mark_uploading(&mut self) -> CancellationToken {
        let token = CancellationToken::new();
        self.status = UploadStatus::Uploading;
        self.attempt += 1;
        self.progress = 0;
        self.started_at = Some(chrono::Utc::now().timestamp());
        self.cancel_token = Some(token.clone());
        token
    }

    /// 更新进度（只增不减），返回是否发生变化
    pub(crate) fn advance_progress(&mut self, percent: u8) -> bool {
        let percent = percent.min(100);
        if percent > self.progress {
            self.progress = percent;
            true
        } else {
            false
        }
    }

    /// 标记为已完成
    pub(crate) fn mark_completed(&mut self, media: UploadedMedia) {
        self.status = UploadStatus::Completed;
        self.progress = 100;
        self.media = Some(media);
        self.error_message = None;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.cancel_token = None;
    }

    /// 标记为失败
    pub(crate) fn mark_failed(&mut self, error: String) {
        self.status = UploadStatus::Failed;
        self.error_message = Some(error);
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.cancel_token = None;
    }

    /// 标记为已取消，若正在上传则发出取消信号
    ///
    /// 进度保留最后的值
    pub(crate) fn mark_cancelled(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        self.status = UploadStatus::Cancelled;
        self.error_message = None;
    }

    /// 重置为 pending（重试）
    pub(crate) fn reset_for_retry(&mut self) {
        self.status = UploadStatus::Pending;
        self.progress = 0;
        self.error_message = None;
        self.media = None;
        self.started_at = None;
        self.completed_at = None;
        self.cancel_token = None;
    }
}

/// 未通过客户端校验的文件
///
/// 创建后不可变，只能由用户显式移除。超过大小限制的文件不保留内容
#[derive(Debug, Clone, Serialize)]
pub struct RejectedCandidate {
    pub id: CandidateId,
    pub file: SelectedFile,
    pub errors: Vec<ValidationError>,
}

impl RejectedCandidate {
    pub fn new(mut file: SelectedFile, errors: Vec<ValidationError>) -> Self {
        if errors.iter().any(|e| e.code == ValidationCode::FileTooLarge) {
            file.release_content();
        }
        Self {
            id: CandidateId::new(),
            file,
            errors,
        }
    }
}
