//! 上传事件类型定义
//!
//! 由 UploadQueueController 通过 broadcast 通道发布给界面层

use crate::uploader::candidate::{CandidateId, UploadStatus, UploadedMedia};
use crate::uploader::validation::ValidationError;
use serde::{Deserialize, Serialize};

/// 批次完成结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub successful: usize,
    pub failed: usize,
}

/// 上传事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 文件通过校验，进入候选集
    Added {
        id: CandidateId,
        name: String,
        size: u64,
    },
    /// 文件未通过校验
    Rejected {
        id: CandidateId,
        name: String,
        errors: Vec<ValidationError>,
    },
    /// 进度更新
    Progress { id: CandidateId, progress: u8 },
    /// 状态变更
    StatusChanged {
        id: CandidateId,
        old_status: UploadStatus,
        new_status: UploadStatus,
    },
    /// 上传完成
    Completed { id: CandidateId, media: UploadedMedia },
    /// 上传失败
    Failed { id: CandidateId, error: String },
    /// 已取消
    Cancelled { id: CandidateId },
    /// 已从候选集（或拒绝列表）中移除
    Removed { id: CandidateId },
    /// 批次完成
    BatchCompleted { result: BatchResult },
    /// 队列已清空
    Cleared,
}

impl UploadEvent {
    /// 获取关联的候选文件 ID
    pub fn candidate_id(&self) -> Option<CandidateId> {
        match self {
            UploadEvent::Added { id, .. }
            | UploadEvent::Rejected { id, .. }
            | UploadEvent::Progress { id, .. }
            | UploadEvent::StatusChanged { id, .. }
            | UploadEvent::Completed { id, .. }
            | UploadEvent::Failed { id, .. }
            | UploadEvent::Cancelled { id }
            | UploadEvent::Removed { id } => Some(*id),
            UploadEvent::BatchCompleted { .. } | UploadEvent::Cleared => None,
        }
    }
}
