//! 客户端预校验
//!
//! 在文件进入候选集之前检查大小、类型和数量限制，
//! 未通过的文件成为 RejectedCandidate，不参与任何上传生命周期

use crate::config::UploadConfig;
use crate::uploader::candidate::{RejectedCandidate, SelectedFile};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 校验错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationCode {
    /// 0 字节文件
    FileEmpty,
    /// 超过最大文件大小
    FileTooLarge,
    /// MIME 类型不在允许列表中
    FileInvalidType,
    /// 超过最大文件数量
    TooManyFiles,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::FileEmpty => "file-empty",
            ValidationCode::FileTooLarge => "file-too-large",
            ValidationCode::FileInvalidType => "file-invalid-type",
            ValidationCode::TooManyFiles => "too-many-files",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单条校验错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub code: ValidationCode,
    pub message: String,
}

impl ValidationError {
    fn new(code: ValidationCode, message: String) -> Self {
        Self { code, message }
    }
}

/// 校验结果：按原始顺序拆分为接受和拒绝两组
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub accepted: Vec<SelectedFile>,
    pub rejected: Vec<RejectedCandidate>,
}

/// 文件校验器
#[derive(Debug, Clone)]
pub struct FileValidator {
    max_file_size: u64,
    max_files: usize,
    accepted_mime_types: Vec<String>,
}

impl FileValidator {
    pub fn new(max_file_size: u64, max_files: usize, accepted_mime_types: Vec<String>) -> Self {
        Self {
            max_file_size,
            max_files,
            accepted_mime_types: accepted_mime_types
                .into_iter()
                .map(|m| m.trim().to_ascii_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(
            config.max_file_size,
            config.max_files,
            config.accepted_mime_types.clone(),
        )
    }

    /// MIME 类型是否被接受（支持 `image/*` 通配，列表为空时全部接受）
    pub fn accepts_mime(&self, mime_type: &str) -> bool {
        if self.accepted_mime_types.is_empty() {
            return true;
        }
        let mime_type = mime_type.trim().to_ascii_lowercase();
        self.accepted_mime_types.iter().any(|pattern| {
            match pattern.strip_suffix("/*") {
                Some(prefix) => mime_type
                    .split_once('/')
                    .map(|(major, _)| major == prefix)
                    .unwrap_or(false),
                None => *pattern == mime_type,
            }
        })
    }

    /// 检查单个文件本身的约束（不含数量）
    pub fn check_file(&self, file: &SelectedFile) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if file.size == 0 {
            errors.push(ValidationError::new(
                ValidationCode::FileEmpty,
                format!("File {} is empty", file.name),
            ));
        } else if file.size > self.max_file_size {
            errors.push(ValidationError::new(
                ValidationCode::FileTooLarge,
                format!(
                    "File is larger than {} bytes ({} bytes)",
                    self.max_file_size, file.size
                ),
            ));
        }

        if !self.accepts_mime(&file.mime_type) {
            errors.push(ValidationError::new(
                ValidationCode::FileInvalidType,
                format!(
                    "File type {} is not accepted (allowed: {})",
                    file.mime_type,
                    self.accepted_mime_types.join(", ")
                ),
            ));
        }

        errors
    }

    /// 校验一批文件
    ///
    /// # 参数
    /// * `files` - 新选择的文件
    /// * `existing` - 候选集中已有的文件数（计入 max_files）
    pub fn partition(&self, files: Vec<SelectedFile>, existing: usize) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();
        let mut remaining = if self.max_files == 0 {
            usize::MAX
        } else {
            self.max_files.saturating_sub(existing)
        };

        for file in files {
            let mut errors = self.check_file(&file);

            if errors.is_empty() {
                if remaining == 0 {
                    errors.push(ValidationError::new(
                        ValidationCode::TooManyFiles,
                        format!("Too many files (maximum {})", self.max_files),
                    ));
                } else {
                    remaining -= 1;
                }
            }

            if errors.is_empty() {
                outcome.accepted.push(file);
            } else {
                outcome.rejected.push(RejectedCandidate::new(file, errors));
            }
        }

        outcome
    }
}
