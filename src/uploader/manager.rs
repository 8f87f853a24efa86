// 上传队列控制器
//
// 负责管理一个会话内的全部候选文件：
// - 校验并接受/拒绝文件
// - 有界并发准入（FIFO）
// - 取消/重试/移除
// - 批次完成报告与延迟清理
// - 预览资源同步
//
// 所有状态修改都经过 QueueState::apply，锁在 await 之前释放

use crate::config::UploadConfig;
use crate::events::{BatchResult, ProgressThrottler, UploadEvent, DEFAULT_THROTTLE_INTERVAL_MS};
use crate::uploader::candidate::{CandidateId, RejectedCandidate, SelectedFile, UploadCandidate};
use crate::uploader::error::{QueueError, GENERIC_UPLOAD_ERROR};
use crate::uploader::preview::{PreviewImage, PreviewManager, PreviewStore};
use crate::uploader::state::{Dispatch, QueueAction, QueueState, QueueStats, Transition};
use crate::uploader::transport::{ProgressCallback, UploadRequest, UploadTransport};
use crate::uploader::validation::{FileValidator, ValidationError};
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// 事件通道容量
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 控制器选项
#[derive(Debug, Clone)]
pub struct UploadQueueOptions {
    /// 最大同时上传数（小于 1 时按 1 处理）
    pub max_concurrent_uploads: usize,
    /// 单文件最大字节数
    pub max_file_size: u64,
    /// 最大文件数（0 表示不限制）
    pub max_files: usize,
    /// 允许的 MIME 类型
    pub accepted_mime_types: Vec<String>,
    /// 批次完成后到清理 completed/failed 文件的间隔
    pub batch_grace_period: Duration,
    /// 进度写入节流间隔
    pub progress_interval: Duration,
}

impl From<&UploadConfig> for UploadQueueOptions {
    fn from(config: &UploadConfig) -> Self {
        Self {
            max_concurrent_uploads: config.concurrency_limit(),
            max_file_size: config.max_file_size,
            max_files: config.max_files,
            accepted_mime_types: config.accepted_mime_types.clone(),
            batch_grace_period: config.batch_grace_period(),
            progress_interval: Duration::from_millis(DEFAULT_THROTTLE_INTERVAL_MS),
        }
    }
}

/// `add_files` 的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddFilesResult {
    pub accepted: Vec<CandidateId>,
    pub rejected: Vec<CandidateId>,
}

struct ControllerInner {
    state: Mutex<QueueState>,
    previews: Mutex<PreviewManager>,
    validator: FileValidator,
    transport: Arc<dyn UploadTransport>,
    event_tx: broadcast::Sender<UploadEvent>,
    grace_period: Duration,
    progress_interval: Duration,
    /// 每次批次完成 +1，只有最新一次批次的清理会执行
    sweep_generation: AtomicU64,
}

/// 上传队列控制器
///
/// 可廉价克隆，所有克隆共享同一个队列；最后一个句柄释放时取消全部上传并撤销预览
#[derive(Clone)]
pub struct UploadQueueController {
    inner: Arc<ControllerInner>,
}

impl UploadQueueController {
    pub fn new(config: &UploadConfig, transport: Arc<dyn UploadTransport>) -> Self {
        Self::new_with_options(UploadQueueOptions::from(config), transport)
    }

    pub fn new_with_options(options: UploadQueueOptions, transport: Arc<dyn UploadTransport>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let validator = FileValidator::new(
            options.max_file_size,
            options.max_files,
            options.accepted_mime_types,
        );

        info!(
            "创建上传队列控制器: 最大并发={}, 清理延迟={:?}",
            options.max_concurrent_uploads.max(1),
            options.batch_grace_period
        );

        Self {
            inner: Arc::new(ControllerInner {
                state: Mutex::new(QueueState::new(options.max_concurrent_uploads)),
                previews: Mutex::new(PreviewManager::new()),
                validator,
                transport,
                event_tx,
                grace_period: options.batch_grace_period,
                progress_interval: options.progress_interval,
                sweep_generation: AtomicU64::new(0),
            }),
        }
    }

    // =====================================================
    // 文件选择
    // =====================================================

    /// 校验并加入一批文件
    ///
    /// 通过校验的文件成为 pending 候选文件（不会自动开始上传），其余成为被拒绝文件
    pub async fn add_files(&self, files: Vec<SelectedFile>) -> AddFilesResult {
        let mut result = AddFilesResult::default();
        let validator = &self.inner.validator;

        let _ = self.inner.transact(|state| {
            let outcome = validator.partition(files, state.accepted_count());

            let accepted: Vec<UploadCandidate> =
                outcome.accepted.into_iter().map(UploadCandidate::new).collect();
            result.accepted = accepted.iter().map(|c| c.id).collect();
            result.rejected = outcome.rejected.iter().map(|r| r.id).collect();

            for rejected in &outcome.rejected {
                let codes: Vec<&str> = rejected.errors.iter().map(|e| e.code.as_str()).collect();
                warn!("文件未通过校验: name={}, 错误: {:?}", rejected.file.name, codes);
            }

            let mut t = state.apply(QueueAction::AddAccepted(accepted))?;
            t.merge(state.apply(QueueAction::AddRejected(outcome.rejected))?);
            Ok(t)
        });

        info!(
            "加入文件: 接受 {} 个, 拒绝 {} 个",
            result.accepted.len(),
            result.rejected.len()
        );
        result
    }

    /// 直接加入已通过校验的文件
    pub async fn add_accepted(&self, files: Vec<SelectedFile>) -> Vec<CandidateId> {
        let candidates: Vec<UploadCandidate> = files.into_iter().map(UploadCandidate::new).collect();
        let ids = candidates.iter().map(|c| c.id).collect();
        let _ = self
            .inner
            .transact(|state| state.apply(QueueAction::AddAccepted(candidates)));
        ids
    }

    /// 原样加入校验失败的文件
    pub async fn add_rejected(
        &self,
        files: Vec<(SelectedFile, Vec<ValidationError>)>,
    ) -> Vec<CandidateId> {
        let rejected: Vec<RejectedCandidate> = files
            .into_iter()
            .map(|(file, errors)| RejectedCandidate::new(file, errors))
            .collect();
        let ids = rejected.iter().map(|r| r.id).collect();
        let _ = self
            .inner
            .transact(|state| state.apply(QueueAction::AddRejected(rejected)));
        ids
    }

    // =====================================================
    // 上传控制
    // =====================================================

    /// 将指定 pending 文件放入上传队列（幂等）
    pub async fn enqueue_for_upload(&self, ids: &[CandidateId]) {
        let _ = self
            .inner
            .transact(|state| state.apply(QueueAction::Enqueue(ids.to_vec())));
    }

    /// 上传全部 pending 文件
    pub async fn upload_all(&self) {
        let _ = self
            .inner
            .transact(|state| state.apply(QueueAction::EnqueueAllPending));
    }

    /// 取消单个文件
    pub async fn cancel(&self, id: CandidateId) -> Result<(), QueueError> {
        self.inner.transact(|state| state.apply(QueueAction::Cancel(id)))
    }

    /// 取消所有上传中和等待中的文件
    pub async fn cancel_all(&self) {
        let _ = self.inner.transact(|state| state.apply(QueueAction::CancelAll));
    }

    /// 重试 failed/cancelled 文件
    pub async fn retry(&self, id: CandidateId) -> Result<(), QueueError> {
        self.inner.transact(|state| state.apply(QueueAction::Retry(id)))
    }

    /// 移除候选文件（上传中会先取消）
    pub async fn remove(&self, id: CandidateId) -> Result<(), QueueError> {
        self.inner.transact(|state| state.apply(QueueAction::Remove(id)))
    }

    /// 移除被拒绝文件
    pub async fn remove_rejected(&self, id: CandidateId) -> Result<(), QueueError> {
        self.inner
            .transact(|state| state.apply(QueueAction::RemoveRejected(id)))
    }

    /// 清除已完成文件
    pub async fn clear_completed(&self) {
        let _ = self
            .inner
            .transact(|state| state.apply(QueueAction::ClearCompleted));
    }

    /// 取消并清空一切
    pub async fn clear_all(&self) {
        let _ = self.inner.transact(|state| state.apply(QueueAction::ClearAll));
    }

    /// 会话结束：取消全部上传并撤销全部预览
    pub async fn shutdown(&self) {
        self.clear_all().await;
        let revoked = self.inner.previews.lock().revoke_all();
        info!("上传队列已关闭, 撤销预览 {} 个", revoked);
    }

    // =====================================================
    // 查询
    // =====================================================

    /// 按加入顺序返回所有候选文件
    pub fn snapshot(&self) -> Vec<UploadCandidate> {
        self.inner.state.lock().candidates().cloned().collect()
    }

    pub fn candidate(&self, id: &CandidateId) -> Option<UploadCandidate> {
        self.inner.state.lock().candidate(id).cloned()
    }

    pub fn rejected(&self) -> Vec<RejectedCandidate> {
        self.inner.state.lock().rejected().to_vec()
    }

    pub fn active_ids(&self) -> Vec<CandidateId> {
        self.inner.state.lock().active_ids()
    }

    pub fn error_messages(&self) -> HashMap<CandidateId, String> {
        self.inner.state.lock().error_messages()
    }

    pub fn batch_result(&self) -> Option<BatchResult> {
        self.inner.state.lock().batch_result()
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.state.lock().stats()
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.event_tx.subscribe()
    }

    /// 等待下一次批次完成
    ///
    /// 如果队列已空闲且最近一次批次已报告，立即返回该结果；通道关闭时返回 None
    pub async fn wait_for_batch(&self) -> Option<BatchResult> {
        let mut rx = self.subscribe();

        {
            let state = self.inner.state.lock();
            if state.active_count() == 0 && state.queued_count() == 0 {
                if let Some(result) = state.batch_result() {
                    return Some(result);
                }
            }
        }

        loop {
            match rx.recv().await {
                Ok(UploadEvent::BatchCompleted { result }) => return Some(result),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("批次等待跳过 {} 个事件", skipped);
                    // 跳过的事件里可能包含批次完成
                    if let Some(result) = self.batch_result() {
                        return Some(result);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    // =====================================================
    // 预览
    // =====================================================

    pub fn preview_url(&self, key: &CandidateId) -> Option<String> {
        self.inner.previews.lock().url(key).map(str::to_string)
    }

    pub fn resolve_preview(&self, url: &str) -> Option<Bytes> {
        self.inner.previews.lock().resolve(url)
    }

    /// 解码预览图片，失败时标记该键
    pub fn decode_preview(&self, key: &CandidateId) -> Option<PreviewImage> {
        self.inner.previews.lock().decode(key)
    }

    pub fn mark_preview_errored(&self, key: &CandidateId) {
        self.inner.previews.lock().mark_errored(key);
    }

    pub fn is_preview_errored(&self, key: &CandidateId) -> bool {
        self.inner.previews.lock().is_errored(key)
    }

    /// 预览存储（供界面层直接解析 URL）
    pub fn preview_store(&self) -> Arc<PreviewStore> {
        self.inner.previews.lock().store()
    }
}

impl ControllerInner {
    /// 在一次加锁内执行状态修改并发布事件，然后在锁外派发上传
    ///
    /// 事件在锁内发送，订阅方看到的顺序与状态变更顺序一致
    fn transact<F>(self: &Arc<Self>, f: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut QueueState) -> Result<Transition, QueueError>,
    {
        let transition = {
            let mut state = self.state.lock();
            let mut transition = f(&mut state)?;
            for event in transition.events.drain(..) {
                // 没有订阅者时发送失败，忽略
                let _ = self.event_tx.send(event);
            }
            if transition.membership_changed {
                let sources = state.preview_sources();
                let report = self.previews.lock().sync(&sources);
                if report.created > 0 || report.revoked > 0 {
                    debug!(
                        "预览同步: 新建 {}, 撤销 {}, 复用 {}",
                        report.created, report.revoked, report.reused
                    );
                }
            }
            transition
        };

        self.finish(transition);
        Ok(())
    }

    fn finish(self: &Arc<Self>, transition: Transition) {
        for dispatch in transition.dispatches {
            self.spawn_upload(dispatch);
        }

        if transition.batch.is_some() {
            self.schedule_sweep();
        }
    }

    /// 为一次准入启动传输调用
    fn spawn_upload(self: &Arc<Self>, dispatch: Dispatch) {
        let Dispatch {
            id,
            attempt,
            file,
            cancel_token,
        } = dispatch;

        // 上传任务只持有弱引用，控制器释放后结果直接丢弃
        let weak = Arc::downgrade(self);
        let transport = self.transport.clone();
        let throttler = ProgressThrottler::new(self.progress_interval);

        info!(
            "开始上传: id={}, name={}, size={}, attempt={}",
            id, file.name, file.size, attempt
        );

        tokio::spawn(async move {
            let progress_target = weak.clone();
            let progress: ProgressCallback = Arc::new(move |percent| {
                if !throttler.should_emit_progress(percent) {
                    return;
                }
                if let Some(inner) = progress_target.upgrade() {
                    let _ = inner.transact(|state| {
                        state.apply(QueueAction::Progress {
                            id,
                            attempt,
                            percent,
                        })
                    });
                }
            });

            // 本地文件在这里才读入内存，上传结束后随任务释放
            let payload = match file.read_payload().await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("读取上传内容失败: id={}, 错误: {:#}", id, e);
                    report_outcome(
                        &weak,
                        QueueAction::Failed {
                            id,
                            attempt,
                            message: GENERIC_UPLOAD_ERROR.to_string(),
                        },
                    );
                    return;
                }
            };

            let request = UploadRequest::new(&file, payload);
            let outcome = AssertUnwindSafe(transport.upload(request, progress, cancel_token.clone()))
                .catch_unwind()
                .await;

            let action = match outcome {
                Ok(Ok(media)) => QueueAction::Succeeded { id, attempt, media },
                Ok(Err(e)) if e.is_cancelled() && cancel_token.is_cancelled() => {
                    // 状态已在取消时切换
                    debug!("上传已取消: id={}, attempt={}", id, attempt);
                    return;
                }
                Ok(Err(e)) => {
                    warn!("上传失败: id={}, attempt={}, 错误: {}", id, attempt, e);
                    QueueAction::Failed {
                        id,
                        attempt,
                        message: e.user_message(),
                    }
                }
                Err(_) => {
                    error!("上传传输层异常退出: id={}, attempt={}", id, attempt);
                    QueueAction::Failed {
                        id,
                        attempt,
                        message: GENERIC_UPLOAD_ERROR.to_string(),
                    }
                }
            };

            report_outcome(&weak, action);
        });
    }

    /// 批次完成后延迟清理 completed/failed 文件
    fn schedule_sweep(self: &Arc<Self>) {
        let generation = self.sweep_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        let grace = self.grace_period;

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.sweep_generation.load(Ordering::SeqCst) != generation {
                return;
            }

            let _ = inner.transact(|state| {
                // 新批次已开始时不清理
                if state.batch_result().is_none() {
                    return Ok(Transition::default());
                }
                debug!("批次清理: 移除已完成和失败的文件");
                state.apply(QueueAction::SweepSettled)
            });
        });
    }
}

fn report_outcome(weak: &Weak<ControllerInner>, action: QueueAction) {
    if let Some(inner) = weak.upgrade() {
        if let Err(e) = inner.transact(|state| state.apply(action)) {
            warn!("上传结果写回失败: {}", e);
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        // 取消仍在进行的上传；预览由 PreviewManager 自身释放
        let _ = self.state.get_mut().apply(QueueAction::ClearAll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::candidate::{UploadStatus, UploadedMedia};
    use crate::uploader::error::TransportError;
    use crate::uploader::validation::ValidationCode;
    use async_trait::async_trait;
    use tokio::sync::{mpsc, oneshot};
    use tokio_util::sync::CancellationToken;

    /// 被测试脚本控制的一次传输调用
    struct Call {
        name: String,
        payload_len: usize,
        progress: ProgressCallback,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<UploadedMedia, TransportError>>,
    }

    impl Call {
        fn succeed(self, media_id: &str) {
            let _ = self.reply.send(Ok(UploadedMedia {
                id: media_id.to_string(),
                url: format!("https://cdn.example.com/{}", media_id),
            }));
        }

        fn fail(self, message: &str) {
            let _ = self.reply.send(Err(TransportError::Http {
                status: 500,
                message: Some(message.to_string()),
            }));
        }
    }

    struct ScriptedTransport {
        calls: mpsc::UnboundedSender<Call>,
    }

    #[async_trait]
    impl UploadTransport for ScriptedTransport {
        async fn upload(
            &self,
            request: UploadRequest,
            progress: ProgressCallback,
            cancel: CancellationToken,
        ) -> Result<UploadedMedia, TransportError> {
            let (reply, rx) = oneshot::channel();
            let _ = self.calls.send(Call {
                name: request.file_name,
                payload_len: request.payload.len(),
                progress,
                cancel: cancel.clone(),
                reply,
            });
            tokio::select! {
                _ = cancel.cancelled() => Err(TransportError::Cancelled),
                result = rx => result.unwrap_or_else(|_| Err(TransportError::Network("dropped".to_string()))),
            }
        }
    }

    struct PanickingTransport;

    #[async_trait]
    impl UploadTransport for PanickingTransport {
        async fn upload(
            &self,
            _request: UploadRequest,
            _progress: ProgressCallback,
            _cancel: CancellationToken,
        ) -> Result<UploadedMedia, TransportError> {
            panic!("adapter bug");
        }
    }

    fn options(max: usize) -> UploadQueueOptions {
        UploadQueueOptions {
            max_concurrent_uploads: max,
            max_file_size: 1024 * 1024,
            max_files: 10,
            accepted_mime_types: vec!["image/*".to_string(), "application/pdf".to_string()],
            batch_grace_period: Duration::from_millis(50),
            progress_interval: Duration::ZERO,
        }
    }

    fn setup(max: usize) -> (UploadQueueController, mpsc::UnboundedReceiver<Call>) {
        setup_with(options(max))
    }

    /// 清理延迟足够长，测试期间不会触发批次清理
    fn setup_without_sweep(max: usize) -> (UploadQueueController, mpsc::UnboundedReceiver<Call>) {
        setup_with(UploadQueueOptions {
            batch_grace_period: Duration::from_secs(600),
            ..options(max)
        })
    }

    fn setup_with(
        options: UploadQueueOptions,
    ) -> (UploadQueueController, mpsc::UnboundedReceiver<Call>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = UploadQueueController::new_with_options(
            options,
            Arc::new(ScriptedTransport { calls: tx }),
        );
        (controller, rx)
    }

    fn png(name: &str) -> SelectedFile {
        SelectedFile::from_bytes(name, "image/png", vec![1u8; 64])
    }

    fn pdf(name: &str) -> SelectedFile {
        SelectedFile::from_bytes(name, "application/pdf", vec![1u8; 64])
    }

    async fn next_call(rx: &mut mpsc::UnboundedReceiver<Call>) -> Call {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("等待传输调用超时")
            .expect("传输通道已关闭")
    }

    /// 让已派发的任务运行，确认没有多余的传输调用
    async fn assert_no_call(rx: &mut mpsc::UnboundedReceiver<Call>) {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(rx.try_recv().is_err(), "出现了多余的传输调用");
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("等待条件超时");
    }

    #[tokio::test]
    async fn test_add_files_validates() {
        let (controller, _rx) = setup(3);
        let result = controller
            .add_files(vec![
                png("ok.png"),
                SelectedFile::from_bytes("empty.png", "image/png", Vec::new()),
                SelectedFile::from_bytes("big.png", "image/png", vec![0u8; 2 * 1024 * 1024]),
                SelectedFile::from_bytes("app.zip", "application/zip", vec![1u8; 10]),
            ])
            .await;

        assert_eq!(result.accepted.len(), 1);
        assert_eq!(result.rejected.len(), 3);

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, UploadStatus::Pending);
        assert_eq!(snapshot[0].progress, 0);

        let codes: Vec<ValidationCode> = controller
            .rejected()
            .iter()
            .map(|r| r.errors[0].code)
            .collect();
        assert_eq!(
            codes,
            vec![
                ValidationCode::FileEmpty,
                ValidationCode::FileTooLarge,
                ValidationCode::FileInvalidType
            ]
        );

        // 仅选择不会触发上传
        assert!(controller.active_ids().is_empty());
    }

    #[tokio::test]
    async fn test_local_files_are_not_buffered_until_upload() {
        let (controller, mut rx) = setup_with(UploadQueueOptions {
            max_file_size: 1024,
            ..options(3)
        });
        let dir = tempfile::TempDir::new().unwrap();
        let huge = dir.path().join("huge.png");
        let small = dir.path().join("small.png");
        std::fs::write(&huge, vec![0u8; 4 * 1024 * 1024]).unwrap();
        std::fs::write(&small, vec![0u8; 512]).unwrap();

        let files = vec![
            SelectedFile::from_path(&huge).await.unwrap(),
            SelectedFile::from_path(&small).await.unwrap(),
        ];
        let result = controller.add_files(files).await;
        assert_eq!(result.accepted.len(), 1);

        let rejected = controller.rejected();
        assert_eq!(rejected[0].errors[0].code, ValidationCode::FileTooLarge);
        assert!(!rejected[0].file.has_content());
        assert!(controller.preview_url(&rejected[0].id).is_none());

        let store = controller.preview_store();
        assert_eq!(store.len(), 1);
        assert_eq!(store.resident_bytes(), 0);
        assert!(controller.snapshot()[0].file.payload.is_empty());

        controller.upload_all().await;
        let call = next_call(&mut rx).await;
        assert_eq!(call.name, "small.png");
        assert_eq!(call.payload_len, 512);
    }

    #[tokio::test]
    async fn test_unreadable_local_file_fails() {
        let (controller, mut rx) = setup_without_sweep(3);
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gone.png");
        std::fs::write(&path, vec![0u8; 64]).unwrap();

        let file = SelectedFile::from_path(&path).await.unwrap();
        let id = controller.add_files(vec![file]).await.accepted[0];
        std::fs::remove_file(&path).unwrap();

        controller.upload_all().await;
        wait_until(|| {
            controller
                .candidate(&id)
                .map(|c| c.status == UploadStatus::Failed)
                .unwrap_or(false)
        })
        .await;
        assert_eq!(
            controller.candidate(&id).unwrap().error_message.as_deref(),
            Some(GENERIC_UPLOAD_ERROR)
        );
        assert_no_call(&mut rx).await;
    }

    #[tokio::test]
    async fn test_max_files_counts_existing_candidates() {
        let (controller, _rx) = setup(3);
        let first: Vec<_> = (0..8).map(|i| png(&format!("a{}.png", i))).collect();
        controller.add_files(first).await;

        let second: Vec<_> = (0..4).map(|i| png(&format!("b{}.png", i))).collect();
        let result = controller.add_files(second).await;
        assert_eq!(result.accepted.len(), 2);
        assert_eq!(result.rejected.len(), 2);
        assert!(controller
            .rejected()
            .iter()
            .all(|r| r.errors[0].code == ValidationCode::TooManyFiles));
    }

    #[tokio::test]
    async fn test_bounded_admission() {
        let (controller, mut rx) = setup(3);
        let files: Vec<_> = (0..5).map(|i| png(&format!("f{}.png", i))).collect();
        let ids = controller.add_files(files).await.accepted;

        controller.enqueue_for_upload(&ids).await;
        controller.enqueue_for_upload(&ids).await;

        // 持有调用，回复端被释放会让上传以失败结束并空出槽位
        let mut calls = Vec::new();
        for _ in 0..3 {
            calls.push(next_call(&mut rx).await);
        }
        let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["f0.png", "f1.png", "f2.png"]);
        assert_no_call(&mut rx).await;

        let stats = controller.stats();
        assert_eq!(stats.uploading, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(controller.active_ids(), ids[..3].to_vec());
    }

    #[tokio::test]
    async fn test_cancel_mid_upload_admits_next() {
        let (controller, mut rx) = setup(3);
        let files: Vec<_> = (0..5).map(|i| png(&format!("f{}.png", i))).collect();
        let ids = controller.add_files(files).await.accepted;
        controller.upload_all().await;

        let mut calls = Vec::new();
        for _ in 0..3 {
            calls.push(next_call(&mut rx).await);
        }

        (calls[1].progress)(42);
        assert_eq!(controller.candidate(&ids[1]).unwrap().progress, 42);

        controller.cancel(ids[1]).await.unwrap();
        assert!(calls[1].cancel.is_cancelled());

        let cancelled = controller.candidate(&ids[1]).unwrap();
        assert_eq!(cancelled.status, UploadStatus::Cancelled);
        assert_eq!(cancelled.progress, 42);
        assert!(cancelled.error_message.is_none());

        // 空出的位置交给 f3
        let next = next_call(&mut rx).await;
        assert_eq!(next.name, "f3.png");
        assert_eq!(controller.active_ids().len(), 3);

        // 取消后迟到的进度被丢弃
        (calls[1].progress)(80);
        let cancelled = controller.candidate(&ids[1]).unwrap();
        assert_eq!(cancelled.status, UploadStatus::Cancelled);
        assert_eq!(cancelled.progress, 42);
    }

    #[tokio::test]
    async fn test_batch_completion_and_sweep() {
        let (controller, mut rx) = setup(3);
        let files: Vec<_> = (0..5).map(|i| png(&format!("f{}.png", i))).collect();
        controller.add_files(files).await;

        let mut events = controller.subscribe();
        controller.upload_all().await;

        let outcomes = [true, true, false, true, false];
        for ok in outcomes {
            let call = next_call(&mut rx).await;
            if ok {
                let name = call.name.clone();
                call.succeed(&name);
            } else {
                call.fail("Server exploded");
            }
        }

        let result = tokio::time::timeout(Duration::from_secs(2), controller.wait_for_batch())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            result,
            BatchResult {
                successful: 3,
                failed: 2
            }
        );

        // 批次完成只报告一次
        let mut batch_events = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, UploadEvent::BatchCompleted { .. }) {
                batch_events += 1;
            }
        }
        assert_eq!(batch_events, 1);
        assert_eq!(controller.error_messages().len(), 2);

        // 等待清理
        wait_until(|| controller.snapshot().is_empty()).await;
        assert_eq!(controller.batch_result(), Some(result));
    }

    #[tokio::test]
    async fn test_sweep_keeps_cancelled() {
        let (controller, mut rx) = setup(2);
        let ids = controller
            .add_files(vec![png("a.png"), png("b.png")])
            .await
            .accepted;
        controller.upload_all().await;

        let a = next_call(&mut rx).await;
        let _b = next_call(&mut rx).await;
        controller.cancel(ids[1]).await.unwrap();
        a.succeed("m-a");

        wait_until(|| controller.snapshot().len() == 1).await;
        let remaining = controller.snapshot();
        assert_eq!(remaining[0].id, ids[1]);
        assert_eq!(remaining[0].status, UploadStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_remove_while_uploading() {
        let (controller, mut rx) = setup(1);
        let ids = controller
            .add_files(vec![png("a.png"), png("b.png")])
            .await
            .accepted;
        controller.upload_all().await;

        let a = next_call(&mut rx).await;
        controller.remove(ids[0]).await.unwrap();

        assert!(a.cancel.is_cancelled());
        assert!(controller.candidate(&ids[0]).is_none());
        assert!(!controller.active_ids().contains(&ids[0]));

        let b = next_call(&mut rx).await;
        assert_eq!(b.name, "b.png");

        assert_eq!(
            controller.remove(ids[0]).await.unwrap_err(),
            QueueError::CandidateNotFound(ids[0])
        );
    }

    #[tokio::test]
    async fn test_retry_after_failure() {
        let (controller, mut rx) = setup_without_sweep(1);
        let ids = controller.add_files(vec![png("a.png")]).await.accepted;
        controller.upload_all().await;

        let call = next_call(&mut rx).await;
        (call.progress)(60);
        call.fail("Quota exceeded");

        wait_until(|| {
            controller
                .candidate(&ids[0])
                .map(|c| c.status == UploadStatus::Failed)
                .unwrap_or(false)
        })
        .await;
        assert_eq!(
            controller.error_messages().get(&ids[0]).map(String::as_str),
            Some("Quota exceeded")
        );

        controller.retry(ids[0]).await.unwrap();
        let retried = next_call(&mut rx).await;
        assert_eq!(retried.name, "a.png");

        let c = controller.candidate(&ids[0]).unwrap();
        assert_eq!(c.status, UploadStatus::Uploading);
        assert_eq!(c.progress, 0);
        assert_eq!(c.attempt, 2);
        assert!(c.error_message.is_none());

        retried.succeed("m-1");
        wait_until(|| {
            controller
                .candidate(&ids[0])
                .map(|c| c.status == UploadStatus::Completed)
                .unwrap_or(false)
        })
        .await;
        assert!(controller.error_messages().is_empty());
    }

    #[tokio::test]
    async fn test_retry_rejects_completed() {
        let (controller, mut rx) = setup_without_sweep(1);
        let ids = controller.add_files(vec![png("a.png")]).await.accepted;
        assert!(controller.retry(ids[0]).await.is_err());

        controller.upload_all().await;
        next_call(&mut rx).await.succeed("m");
        wait_until(|| controller.batch_result().is_some()).await;

        assert!(matches!(
            controller.retry(ids[0]).await,
            Err(QueueError::InvalidTransition {
                status: UploadStatus::Completed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let (controller, mut rx) = setup(2);
        let files: Vec<_> = (0..4).map(|i| png(&format!("f{}.png", i))).collect();
        let ids = controller.add_files(files).await.accepted;
        controller.upload_all().await;

        let a = next_call(&mut rx).await;
        let b = next_call(&mut rx).await;
        controller.cancel_all().await;

        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
        assert!(controller.active_ids().is_empty());
        assert!(ids.iter().all(|id| {
            controller.candidate(id).unwrap().status == UploadStatus::Cancelled
        }));
        assert_no_call(&mut rx).await;
        // 只有取消时不报告批次
        assert!(controller.batch_result().is_none());
    }

    #[tokio::test]
    async fn test_adapter_panic_becomes_failure() {
        let controller =
            UploadQueueController::new_with_options(options(1), Arc::new(PanickingTransport));
        let ids = controller.add_files(vec![pdf("doc.pdf")]).await.accepted;
        controller.upload_all().await;

        wait_until(|| {
            controller
                .candidate(&ids[0])
                .map(|c| c.status == UploadStatus::Failed)
                .unwrap_or(false)
        })
        .await;
        assert_eq!(
            controller.error_messages().get(&ids[0]).map(String::as_str),
            Some(GENERIC_UPLOAD_ERROR)
        );
    }

    #[tokio::test]
    async fn test_previews_follow_membership() {
        let (controller, _rx) = setup_with(UploadQueueOptions {
            accepted_mime_types: vec!["image/png".to_string(), "application/pdf".to_string()],
            ..options(1)
        });
        let result = controller
            .add_files(vec![
                png("a.png"),
                pdf("doc.pdf"),
                SelectedFile::from_bytes("anim.gif", "image/gif", vec![1u8; 32]),
                SelectedFile::from_bytes("empty.png", "image/png", Vec::new()),
            ])
            .await;
        let store = controller.preview_store();

        let image_id = result.accepted[0];
        let pdf_id = result.accepted[1];
        let rejected_id = result.rejected[0];
        let empty_id = result.rejected[1];

        let url = controller.preview_url(&image_id).unwrap();
        assert!(controller.resolve_preview(&url).is_some());
        assert!(controller.preview_url(&pdf_id).is_none());
        assert!(controller.preview_url(&rejected_id).is_some());
        assert!(controller.preview_url(&empty_id).is_none());
        assert_eq!(store.len(), 2);

        // 无效图片数据：解码失败后标记
        assert!(controller.decode_preview(&image_id).is_none());
        assert!(controller.is_preview_errored(&image_id));

        controller.remove_rejected(rejected_id).await.unwrap();
        assert!(controller.preview_url(&rejected_id).is_none());
        assert!(store.is_empty());

        controller.shutdown().await;
        assert!(controller.snapshot().is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_drop_cancels_and_revokes() {
        let (controller, mut rx) = setup(1);
        controller.add_files(vec![png("a.png")]).await;
        let store = controller.preview_store();
        assert_eq!(store.len(), 1);

        controller.upload_all().await;
        let call = next_call(&mut rx).await;

        drop(controller);
        assert!(call.cancel.is_cancelled());
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_events_follow_state_order() {
        let (controller, mut rx) = setup_without_sweep(3);
        let mut events = controller.subscribe();
        let files: Vec<_> = (0..3).map(|i| png(&format!("f{}.png", i))).collect();
        controller.add_files(files).await;
        controller.upload_all().await;

        // 进度回调在其他线程上与完成结果并发写入
        let mut workers = Vec::new();
        for _ in 0..3 {
            let call = next_call(&mut rx).await;
            let progress = call.progress.clone();
            workers.push(tokio::task::spawn_blocking(move || {
                for percent in 1..=40u8 {
                    progress(percent);
                }
            }));
            let name = call.name.clone();
            workers.push(tokio::spawn(async move { call.succeed(&name) }));
        }
        for worker in workers {
            worker.await.unwrap();
        }
        controller.wait_for_batch().await.unwrap();

        let mut completed = std::collections::HashSet::new();
        let mut batch_seen = false;
        while let Ok(event) = events.try_recv() {
            assert!(!batch_seen, "批次完成之后还有事件: {:?}", event);
            match event {
                UploadEvent::Progress { id, .. } => {
                    assert!(!completed.contains(&id), "完成之后出现进度事件")
                }
                UploadEvent::Completed { id, .. } => {
                    completed.insert(id);
                }
                UploadEvent::BatchCompleted { .. } => {
                    assert_eq!(completed.len(), 3);
                    batch_seen = true;
                }
                _ => {}
            }
        }
        assert!(batch_seen);
    }

    #[tokio::test]
    async fn test_events_published() {
        let (controller, mut rx) = setup(1);
        let mut events = controller.subscribe();
        let ids = controller.add_files(vec![png("a.png")]).await.accepted;
        controller.upload_all().await;
        next_call(&mut rx).await.succeed("m-1");

        let mut kinds = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.unwrap();
                let done = matches!(event, UploadEvent::BatchCompleted { .. });
                kinds.push(event);
                if done {
                    break;
                }
            }
        })
        .await
        .unwrap();

        assert!(matches!(kinds[0], UploadEvent::Added { id, .. } if id == ids[0]));
        assert!(kinds.iter().any(|e| matches!(
            e,
            UploadEvent::StatusChanged {
                new_status: UploadStatus::Uploading,
                ..
            }
        )));
        assert!(kinds
            .iter()
            .any(|e| matches!(e, UploadEvent::Completed { media, .. } if media.id == "m-1")));
    }
}
