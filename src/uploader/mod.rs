// 上传队列模块
//
// - candidate: 候选文件与状态
// - validation: 客户端预校验
// - state: 文件生命周期状态存储（单一 reducer）
// - manager: 有界并发的上传队列控制器
// - transport: HTTP multipart 传输适配器
// - preview: 图片预览资源管理

pub mod candidate;
pub mod error;
pub mod folder;
pub mod manager;
pub mod preview;
pub mod state;
pub mod token;
pub mod transport;
pub mod validation;

pub use candidate::{
    CandidateId, RejectedCandidate, SelectedFile, UploadCandidate, UploadStatus, UploadedMedia,
};
pub use error::{QueueError, TransportError, GENERIC_UPLOAD_ERROR};
pub use folder::{FolderScanner, ScanOptions, ScannedFile};
pub use manager::{AddFilesResult, UploadQueueController, UploadQueueOptions};
pub use preview::{PreviewImage, PreviewManager, PreviewStore, PreviewSyncReport};
pub use state::{Dispatch, QueueAction, QueueState, QueueStats, Transition};
pub use token::CsrfTokenProvider;
pub use transport::{
    HttpUploadTransport, ProgressCallback, ProgressReporter, UploadRequest, UploadTransport,
};
pub use validation::{FileValidator, ValidationCode, ValidationError, ValidationOutcome};
