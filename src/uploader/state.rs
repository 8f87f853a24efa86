// 文件生命周期状态存储
//
// 队列的全部可变状态集中在 QueueState 中，所有修改只能通过 `apply` 进行：
// - 每个 QueueAction 按候选文件ID + 事件类型执行一次显式状态转换
// - 转换结束后在同一次调用内执行准入（pending -> uploading + 加入活跃集合）和批次完成检查
// - 调用方持锁执行 `apply`，因此 "检查空位 + 准入" 是一个原子步骤，不会重复准入
//
// 状态机：
//   pending -> uploading -> {completed | failed | cancelled}
//   failed/cancelled -> pending（重试）

use crate::events::{BatchResult, UploadEvent};
use crate::uploader::candidate::{
    CandidateId, RejectedCandidate, SelectedFile, UploadCandidate, UploadStatus, UploadedMedia,
};
use crate::uploader::error::QueueError;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 队列动作
#[derive(Debug)]
pub enum QueueAction {
    /// 加入通过校验的文件（不会自动开始上传）
    AddAccepted(Vec<UploadCandidate>),
    /// 加入未通过校验的文件
    AddRejected(Vec<RejectedCandidate>),
    /// 将指定 pending 文件放入上传队列（幂等）
    Enqueue(Vec<CandidateId>),
    /// 将所有尚未排队的 pending 文件放入上传队列
    EnqueueAllPending,
    /// 传输层进度
    Progress {
        id: CandidateId,
        attempt: u32,
        percent: u8,
    },
    /// 传输层成功
    Succeeded {
        id: CandidateId,
        attempt: u32,
        media: UploadedMedia,
    },
    /// 传输层失败（非取消）
    Failed {
        id: CandidateId,
        attempt: u32,
        message: String,
    },
    /// 取消单个文件
    Cancel(CandidateId),
    /// 取消所有上传中/等待中的文件
    CancelAll,
    /// 重试 failed/cancelled 文件
    Retry(CandidateId),
    /// 移除候选文件（上传中会先取消）
    Remove(CandidateId),
    /// 移除被拒绝文件
    RemoveRejected(CandidateId),
    /// 清除已完成文件
    ClearCompleted,
    /// 取消并清空一切
    ClearAll,
    /// 批次结束后清理 completed/failed 文件（cancelled 保留以便重试）
    SweepSettled,
}

impl QueueAction {
    /// 动作名称（用于错误信息和日志）
    pub fn name(&self) -> &'static str {
        match self {
            QueueAction::AddAccepted(_) => "add_accepted",
            QueueAction::AddRejected(_) => "add_rejected",
            QueueAction::Enqueue(_) => "enqueue",
            QueueAction::EnqueueAllPending => "enqueue_all_pending",
            QueueAction::Progress { .. } => "progress",
            QueueAction::Succeeded { .. } => "succeeded",
            QueueAction::Failed { .. } => "failed",
            QueueAction::Cancel(_) => "cancel",
            QueueAction::CancelAll => "cancel_all",
            QueueAction::Retry(_) => "retry",
            QueueAction::Remove(_) => "remove",
            QueueAction::RemoveRejected(_) => "remove_rejected",
            QueueAction::ClearCompleted => "clear_completed",
            QueueAction::ClearAll => "clear_all",
            QueueAction::SweepSettled => "sweep_settled",
        }
    }
}

/// 一次准入产生的上传派发
///
/// 调用方释放锁后，为每个派发启动一次传输调用
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub id: CandidateId,
    pub attempt: u32,
    pub file: SelectedFile,
    pub cancel_token: CancellationToken,
}

/// 一次 `apply` 的结果
#[derive(Debug, Default)]
pub struct Transition {
    /// 需要发布的事件（按发生顺序）
    pub events: Vec<UploadEvent>,
    /// 新准入的上传
    pub dispatches: Vec<Dispatch>,
    /// 本次转换触发的批次完成结果
    pub batch: Option<BatchResult>,
    /// 候选集或拒绝集的成员发生了变化（预览需要重新同步）
    pub membership_changed: bool,
}

impl Transition {
    /// 合并同一次加锁内的多个转换结果
    pub fn merge(&mut self, other: Transition) {
        self.events.extend(other.events);
        self.dispatches.extend(other.dispatches);
        if other.batch.is_some() {
            self.batch = other.batch;
        }
        self.membership_changed |= other.membership_changed;
    }
}

/// 队列统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub queued: usize,
    pub uploading: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub rejected: usize,
    /// 候选文件总字节数
    pub total_bytes: u64,
    /// 按进度估算的已上传字节数
    pub uploaded_bytes: u64,
}

impl QueueStats {
    /// 整体进度百分比（按字节加权）
    pub fn overall_progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.uploaded_bytes as f64 / self.total_bytes as f64) * 100.0
    }
}

/// 上传队列状态
#[derive(Debug)]
pub struct QueueState {
    /// 最大同时上传数
    max_concurrent: usize,
    /// 所有候选文件
    candidates: HashMap<CandidateId, UploadCandidate>,
    /// 候选文件的加入顺序（用于展示）
    order: Vec<CandidateId>,
    /// 被拒绝文件
    rejected: Vec<RejectedCandidate>,
    /// 等待准入的队列（FIFO）
    queue: VecDeque<CandidateId>,
    /// 正在上传的候选文件
    active: HashSet<CandidateId>,
    /// 自上次批次报告以来进入终态的计数
    settled: BatchResult,
    /// 最近一次批次结果
    batch_result: Option<BatchResult>,
}

impl QueueState {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            candidates: HashMap::new(),
            order: Vec::new(),
            rejected: Vec::new(),
            queue: VecDeque::new(),
            active: HashSet::new(),
            settled: BatchResult::default(),
            batch_result: None,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// 执行一个动作
    ///
    /// 返回 Err 时状态未被修改
    pub fn apply(&mut self, action: QueueAction) -> Result<Transition, QueueError> {
        let mut t = Transition::default();

        match action {
            QueueAction::AddAccepted(candidates) => self.add_accepted(candidates, &mut t),
            QueueAction::AddRejected(rejected) => self.add_rejected(rejected, &mut t),
            QueueAction::Enqueue(ids) => self.enqueue(ids),
            QueueAction::EnqueueAllPending => {
                let ids = self
                    .order
                    .iter()
                    .copied()
                    .filter(|id| {
                        self.candidates
                            .get(id)
                            .map(|c| c.status == UploadStatus::Pending)
                            .unwrap_or(false)
                    })
                    .collect();
                self.enqueue(ids);
            }
            QueueAction::Progress {
                id,
                attempt,
                percent,
            } => self.progress(id, attempt, percent, &mut t),
            QueueAction::Succeeded { id, attempt, media } => {
                self.settle(id, attempt, Ok(media), &mut t)
            }
            QueueAction::Failed {
                id,
                attempt,
                message,
            } => self.settle(id, attempt, Err(message), &mut t),
            QueueAction::Cancel(id) => self.cancel(id, &mut t)?,
            QueueAction::CancelAll => self.cancel_all(&mut t),
            QueueAction::Retry(id) => self.retry(id, &mut t)?,
            QueueAction::Remove(id) => self.remove(id, &mut t)?,
            QueueAction::RemoveRejected(id) => self.remove_rejected(id, &mut t)?,
            QueueAction::ClearCompleted => {
                self.remove_where(|c| c.status == UploadStatus::Completed, &mut t)
            }
            QueueAction::ClearAll => self.clear_all(&mut t),
            QueueAction::SweepSettled => self.remove_where(
                |c| matches!(c.status, UploadStatus::Completed | UploadStatus::Failed),
                &mut t,
            ),
        }

        self.admit(&mut t);
        self.check_batch_completion(&mut t);

        Ok(t)
    }

    fn add_accepted(&mut self, candidates: Vec<UploadCandidate>, t: &mut Transition) {
        for mut candidate in candidates {
            // 新加入的文件一律从 pending/0 开始
            candidate.reset_for_retry();
            candidate.attempt = 0;

            let id = candidate.id;
            if self.candidates.contains_key(&id) {
                debug!("候选文件已存在，忽略重复加入: {}", id);
                continue;
            }
            t.events.push(UploadEvent::Added {
                id,
                name: candidate.file.name.clone(),
                size: candidate.file.size,
            });
            self.order.push(id);
            self.candidates.insert(id, candidate);
            t.membership_changed = true;
        }
    }

    fn add_rejected(&mut self, rejected: Vec<RejectedCandidate>, t: &mut Transition) {
        for item in rejected {
            t.events.push(UploadEvent::Rejected {
                id: item.id,
                name: item.file.name.clone(),
                errors: item.errors.clone(),
            });
            self.rejected.push(item);
            t.membership_changed = true;
        }
    }

    fn enqueue(&mut self, ids: Vec<CandidateId>) {
        let mut queued_any = false;
        for id in ids {
            let Some(candidate) = self.candidates.get(&id) else {
                debug!("入队时候选文件不存在，忽略: {}", id);
                continue;
            };
            if candidate.status != UploadStatus::Pending
                || self.active.contains(&id)
                || self.queue.contains(&id)
            {
                continue;
            }
            self.queue.push_back(id);
            queued_any = true;
        }

        if queued_any {
            // 新批次开始
            self.batch_result = None;
        }
    }

    fn progress(&mut self, id: CandidateId, attempt: u32, percent: u8, t: &mut Transition) {
        let Some(candidate) = self.candidates.get_mut(&id) else {
            return;
        };
        if candidate.status != UploadStatus::Uploading || candidate.attempt != attempt {
            debug!(
                "丢弃过期进度: id={}, status={}, attempt={}/{}",
                id, candidate.status, attempt, candidate.attempt
            );
            return;
        }
        if candidate.advance_progress(percent) {
            t.events.push(UploadEvent::Progress {
                id,
                progress: candidate.progress,
            });
        }
    }

    fn settle(
        &mut self,
        id: CandidateId,
        attempt: u32,
        outcome: Result<UploadedMedia, String>,
        t: &mut Transition,
    ) {
        let Some(candidate) = self.candidates.get_mut(&id) else {
            return;
        };
        if candidate.status != UploadStatus::Uploading || candidate.attempt != attempt {
            debug!(
                "丢弃过期上传结果: id={}, status={}, attempt={}/{}",
                id, candidate.status, attempt, candidate.attempt
            );
            return;
        }

        self.active.remove(&id);

        match outcome {
            Ok(media) => {
                info!("上传完成: id={}, name={}, url={}", id, candidate.file.name, media.url);
                candidate.mark_completed(media.clone());
                self.settled.successful += 1;
                t.events.push(UploadEvent::StatusChanged {
                    id,
                    old_status: UploadStatus::Uploading,
                    new_status: UploadStatus::Completed,
                });
                t.events.push(UploadEvent::Completed { id, media });
            }
            Err(message) => {
                info!("上传失败: id={}, name={}, 错误: {}", id, candidate.file.name, message);
                candidate.mark_failed(message.clone());
                self.settled.failed += 1;
                t.events.push(UploadEvent::StatusChanged {
                    id,
                    old_status: UploadStatus::Uploading,
                    new_status: UploadStatus::Failed,
                });
                t.events.push(UploadEvent::Failed { id, error: message });
            }
        }
    }

    fn cancel(&mut self, id: CandidateId, t: &mut Transition) -> Result<(), QueueError> {
        let candidate = self
            .candidates
            .get_mut(&id)
            .ok_or(QueueError::CandidateNotFound(id))?;

        let old_status = candidate.status;
        match old_status {
            UploadStatus::Uploading => {
                self.active.remove(&id);
            }
            UploadStatus::Pending => {
                self.queue.retain(|queued| *queued != id);
            }
            UploadStatus::Cancelled => return Ok(()),
            UploadStatus::Completed | UploadStatus::Failed => {
                return Err(QueueError::InvalidTransition {
                    id,
                    status: old_status,
                    action: "cancel",
                });
            }
        }

        candidate.mark_cancelled();
        info!("取消上传: id={}, name={}", id, candidate.file.name);

        t.events.push(UploadEvent::StatusChanged {
            id,
            old_status,
            new_status: UploadStatus::Cancelled,
        });
        t.events.push(UploadEvent::Cancelled { id });
        Ok(())
    }

    fn cancel_all(&mut self, t: &mut Transition) {
        let ids: Vec<CandidateId> = self
            .order
            .iter()
            .copied()
            .filter(|id| {
                self.candidates
                    .get(id)
                    .map(|c| matches!(c.status, UploadStatus::Pending | UploadStatus::Uploading))
                    .unwrap_or(false)
            })
            .collect();

        for id in ids {
            // 上面已过滤为可取消状态，这里不会失败
            let _ = self.cancel(id, t);
        }
        self.queue.clear();
    }

    fn retry(&mut self, id: CandidateId, t: &mut Transition) -> Result<(), QueueError> {
        let candidate = self
            .candidates
            .get_mut(&id)
            .ok_or(QueueError::CandidateNotFound(id))?;

        let old_status = candidate.status;
        if !old_status.is_retryable() {
            return Err(QueueError::InvalidTransition {
                id,
                status: old_status,
                action: "retry",
            });
        }

        candidate.reset_for_retry();
        info!("重试上传: id={}, name={}", id, candidate.file.name);
        t.events.push(UploadEvent::StatusChanged {
            id,
            old_status,
            new_status: UploadStatus::Pending,
        });

        self.enqueue(vec![id]);
        Ok(())
    }

    fn remove(&mut self, id: CandidateId, t: &mut Transition) -> Result<(), QueueError> {
        let mut candidate = self
            .candidates
            .remove(&id)
            .ok_or(QueueError::CandidateNotFound(id))?;

        if candidate.status == UploadStatus::Uploading {
            // 先取消正在进行的传输
            candidate.mark_cancelled();
        }
        self.active.remove(&id);
        self.queue.retain(|queued| *queued != id);
        self.order.retain(|existing| *existing != id);

        info!("移除候选文件: id={}, name={}", id, candidate.file.name);
        t.events.push(UploadEvent::Removed { id });
        t.membership_changed = true;
        Ok(())
    }

    fn remove_rejected(&mut self, id: CandidateId, t: &mut Transition) -> Result<(), QueueError> {
        let index = self
            .rejected
            .iter()
            .position(|r| r.id == id)
            .ok_or(QueueError::RejectedNotFound(id))?;
        self.rejected.remove(index);
        t.events.push(UploadEvent::Removed { id });
        t.membership_changed = true;
        Ok(())
    }

    /// 移除满足条件的候选文件（仅用于终态文件）
    fn remove_where(&mut self, predicate: impl Fn(&UploadCandidate) -> bool, t: &mut Transition) {
        let ids: Vec<CandidateId> = self
            .order
            .iter()
            .copied()
            .filter(|id| self.candidates.get(id).map(&predicate).unwrap_or(false))
            .collect();

        for id in ids {
            let _ = self.remove(id, t);
        }
    }

    fn clear_all(&mut self, t: &mut Transition) {
        for candidate in self.candidates.values_mut() {
            if candidate.status == UploadStatus::Uploading {
                candidate.mark_cancelled();
            }
        }
        let removed = self.candidates.len() + self.rejected.len();

        self.candidates.clear();
        self.order.clear();
        self.rejected.clear();
        self.queue.clear();
        self.active.clear();
        self.settled = BatchResult::default();
        self.batch_result = None;

        info!("清空上传队列: 移除 {} 个文件", removed);
        t.events.push(UploadEvent::Cleared);
        t.membership_changed = true;
    }

    /// 准入：空位 = 最大并发 - 活跃数，按 FIFO 从队列中取 pending 文件
    fn admit(&mut self, t: &mut Transition) {
        while self.active.len() < self.max_concurrent {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            let Some(candidate) = self.candidates.get_mut(&id) else {
                continue;
            };
            if candidate.status != UploadStatus::Pending || self.active.contains(&id) {
                continue;
            }

            let cancel_token = candidate.mark_uploading();
            self.active.insert(id);

            debug!(
                "准入上传: id={}, name={}, attempt={}, 活跃数={}/{}",
                id,
                candidate.file.name,
                candidate.attempt,
                self.active.len(),
                self.max_concurrent
            );

            t.events.push(UploadEvent::StatusChanged {
                id,
                old_status: UploadStatus::Pending,
                new_status: UploadStatus::Uploading,
            });
            t.dispatches.push(Dispatch {
                id,
                attempt: candidate.attempt,
                file: candidate.file.clone(),
                cancel_token,
            });
        }
    }

    /// 活跃集合与等待队列都为空，且自上次报告后有文件进入 completed/failed 时，报告一次批次结果
    fn check_batch_completion(&mut self, t: &mut Transition) {
        if !self.active.is_empty() || !self.queue.is_empty() {
            return;
        }
        if self.settled.successful + self.settled.failed == 0 {
            return;
        }

        let result = std::mem::take(&mut self.settled);
        info!(
            "批次上传完成: 成功 {} 个, 失败 {} 个",
            result.successful, result.failed
        );
        self.batch_result = Some(result);
        t.batch = Some(result);
        t.events.push(UploadEvent::BatchCompleted { result });
    }

    // =====================================================
    // 查询
    // =====================================================

    /// 按加入顺序返回所有候选文件
    pub fn candidates(&self) -> impl Iterator<Item = &UploadCandidate> {
        self.order.iter().filter_map(|id| self.candidates.get(id))
    }

    pub fn candidate(&self, id: &CandidateId) -> Option<&UploadCandidate> {
        self.candidates.get(id)
    }

    pub fn rejected(&self) -> &[RejectedCandidate] {
        &self.rejected
    }

    /// 正在上传的候选文件ID（按加入顺序）
    pub fn active_ids(&self) -> Vec<CandidateId> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.active.contains(id))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// 等待准入的队列长度
    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub fn is_queued(&self, id: &CandidateId) -> bool {
        self.queue.contains(id)
    }

    /// 候选文件数（计入 max_files）
    pub fn accepted_count(&self) -> usize {
        self.candidates.len()
    }

    /// 候选文件ID -> 最近一次错误信息
    pub fn error_messages(&self) -> HashMap<CandidateId, String> {
        self.candidates
            .values()
            .filter_map(|c| c.error_message.clone().map(|msg| (c.id, msg)))
            .collect()
    }

    pub fn batch_result(&self) -> Option<BatchResult> {
        self.batch_result
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total: self.candidates.len(),
            queued: self.queue.len(),
            rejected: self.rejected.len(),
            ..Default::default()
        };

        for c in self.candidates.values() {
            match c.status {
                UploadStatus::Pending => stats.pending += 1,
                UploadStatus::Uploading => stats.uploading += 1,
                UploadStatus::Completed => stats.completed += 1,
                UploadStatus::Failed => stats.failed += 1,
                UploadStatus::Cancelled => stats.cancelled += 1,
            }
            stats.total_bytes += c.file.size;
            stats.uploaded_bytes += c.file.size * c.progress as u64 / 100;
        }

        stats
    }

    /// 需要预览的键：候选文件与被拒绝文件中的图片
    pub fn preview_sources(&self) -> Vec<(CandidateId, SelectedFile)> {
        self.candidates()
            .map(|c| (c.id, &c.file))
            .chain(self.rejected.iter().map(|r| (r.id, &r.file)))
            .filter(|(_, file)| file.is_image())
            .map(|(id, file)| (id, file.clone()))
            .collect()
    }

    /// 一致性检查
    ///
    /// - 活跃数不超过最大并发
    /// - 活跃集合与 uploading 状态一一对应
    /// - 取消句柄存在当且仅当 uploading
    pub fn verify_invariants(&self) -> Result<(), String> {
        if self.active.len() > self.max_concurrent {
            return Err(format!(
                "活跃数 {} 超过上限 {}",
                self.active.len(),
                self.max_concurrent
            ));
        }

        for id in &self.active {
            match self.candidates.get(id) {
                Some(c) if c.status == UploadStatus::Uploading => {}
                Some(c) => return Err(format!("活跃文件 {} 状态为 {}", id, c.status)),
                None => return Err(format!("活跃文件 {} 不在候选集中", id)),
            }
        }

        for c in self.candidates.values() {
            let uploading = c.status == UploadStatus::Uploading;
            if uploading != self.active.contains(&c.id) {
                return Err(format!("文件 {} 状态 {} 与活跃集合不一致", c.id, c.status));
            }
            if uploading != c.has_cancel_handle() {
                return Err(format!("文件 {} 状态 {} 与取消句柄不一致", c.id, c.status));
            }
        }

        for id in &self.queue {
            if !self.candidates.contains_key(id) {
                return Err(format!("队列中的文件 {} 不在候选集中", id));
            }
        }

        if self.order.len() != self.candidates.len() {
            return Err("顺序列表与候选集不一致".to_string());
        }

        Ok(())
    }
}
