// 上传队列错误类型

use crate::uploader::candidate::{CandidateId, UploadStatus};
use std::time::Duration;
use thiserror::Error;

/// 传输失败时展示给用户的通用信息
pub const GENERIC_UPLOAD_ERROR: &str = "Upload failed";

/// 队列操作错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// 候选文件不存在
    #[error("候选文件不存在: {0}")]
    CandidateNotFound(CandidateId),
    /// 被拒绝文件不存在
    #[error("被拒绝文件不存在: {0}")]
    RejectedNotFound(CandidateId),
    /// 当前状态不允许该操作
    #[error("候选文件 {id} 当前状态 {status} 不支持 {action}")]
    InvalidTransition {
        id: CandidateId,
        status: UploadStatus,
        action: &'static str,
    },
}

/// 传输层错误
///
/// `Cancelled` 不是失败：它对应用户主动取消，候选文件进入 cancelled 而非 failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// 用户取消
    #[error("上传已取消")]
    Cancelled,
    /// 请求超时
    #[error("上传超时 ({0:?})")]
    Timeout(Duration),
    /// 服务器返回非 2xx
    #[error("服务器返回错误 {status}: {}", .message.as_deref().unwrap_or("-"))]
    Http { status: u16, message: Option<String> },
    /// 网络错误
    #[error("网络错误: {0}")]
    Network(String),
    /// 响应无法解析
    #[error("响应解析失败: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// 是否为取消结果
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }

    /// 记录到候选文件上的错误信息
    ///
    /// 服务器带了 message 时原样返回，否则使用通用信息
    pub fn user_message(&self) -> String {
        match self {
            TransportError::Http {
                message: Some(message),
                ..
            } if !message.trim().is_empty() => message.clone(),
            TransportError::Timeout(_) => "Upload timed out".to_string(),
            _ => GENERIC_UPLOAD_ERROR.to_string(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            TransportError::InvalidResponse(e.to_string())
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message() {
        let server = TransportError::Http {
            status: 413,
            message: Some("File exceeds quota".to_string()),
        };
        assert_eq!(server.user_message(), "File exceeds quota");

        let bare = TransportError::Http {
            status: 500,
            message: None,
        };
        assert_eq!(bare.user_message(), GENERIC_UPLOAD_ERROR);

        let network = TransportError::Network("connection reset".to_string());
        assert_eq!(network.user_message(), GENERIC_UPLOAD_ERROR);

        assert!(TransportError::Cancelled.is_cancelled());
        assert!(!TransportError::Timeout(Duration::from_secs(1)).is_cancelled());
    }
}
