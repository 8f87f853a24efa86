use anyhow::{Context, Result};
use clap::Parser;
use media_upload_queue::{
    logging, AppConfig, BatchResult, CandidateId, FolderScanner, HttpUploadTransport,
    ScanOptions, SelectedFile, UploadEvent, UploadQueueController,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// 被中断时的退出码（128 + SIGINT）
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "media-upload")]
#[command(about = "Upload local media files to a media library endpoint")]
struct Args {
    /// 配置文件路径
    #[arg(long, default_value = "config/app.toml")]
    config: String,

    /// 覆盖配置中的上传地址
    #[arg(long, value_name = "URL")]
    endpoint: Option<String>,

    /// 扫描文件夹时包含隐藏文件
    #[arg(long)]
    include_hidden: bool,

    /// 要上传的文件或文件夹
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let mut config = AppConfig::load_or_default(&args.config).await;
    if let Some(endpoint) = args.endpoint {
        config.upload.upload_endpoint = endpoint;
    }

    // 保持守卫存活直到程序结束
    let _log_guard = logging::init_logging(&config.log);

    config.upload.validate().context("上传配置无效")?;
    info!("上传地址: {}", config.upload.upload_endpoint);

    let transport = HttpUploadTransport::from_config(&config.upload).context("创建 HTTP 客户端失败")?;
    let controller = UploadQueueController::new(&config.upload, Arc::new(transport));

    // 展开文件夹
    let scanner = FolderScanner::with_options(ScanOptions {
        skip_hidden: !args.include_hidden,
        ..Default::default()
    });
    let paths = scanner.expand_paths(&args.paths)?;

    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        match SelectedFile::from_path(path).await {
            Ok(file) => files.push(file),
            Err(e) => warn!("跳过文件 {}: {:#}", path.display(), e),
        }
    }

    let added = controller.add_files(files).await;
    for rejected in controller.rejected() {
        for err in &rejected.errors {
            warn!("❌ {} [{}] {}", rejected.file.name, err.code, err.message);
        }
    }

    if added.accepted.is_empty() {
        anyhow::bail!("没有可上传的文件");
    }

    // 事件日志
    let events = controller.subscribe();
    let names: HashMap<_, _> = controller
        .snapshot()
        .into_iter()
        .map(|c| (c.id, c.file.name))
        .collect();
    tokio::spawn(log_events(events, names));

    // Ctrl-C 取消全部
    let interrupted = Arc::new(AtomicBool::new(false));
    let ctrl_c_controller = controller.clone();
    let ctrl_c_flag = interrupted.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，取消全部上传");
            ctrl_c_flag.store(true, Ordering::SeqCst);
            ctrl_c_controller.cancel_all().await;
        }
    });

    controller.upload_all().await;

    let stats_before_wait = controller.stats();
    info!(
        "开始上传 {} 个文件 (最大并发 {})",
        stats_before_wait.total,
        config.upload.concurrency_limit()
    );

    let code = tokio::select! {
        result = controller.wait_for_batch() => {
            match result {
                Some(result) => {
                    info!("批次完成: 成功 {} 个, 失败 {} 个", result.successful, result.failed);
                    let cancelled = controller.stats().cancelled;
                    if cancelled > 0 {
                        warn!("有 {} 个文件被取消", cancelled);
                    }
                    ExitCode::from(batch_exit_code(
                        &result,
                        interrupted.load(Ordering::SeqCst),
                        cancelled,
                    ))
                }
                None => anyhow::bail!("事件通道已关闭"),
            }
        }
        _ = wait_all_cancelled(&controller) => {
            warn!("全部上传已取消");
            ExitCode::from(EXIT_INTERRUPTED)
        }
    };

    controller.shutdown().await;
    Ok(code)
}

/// 所有候选文件都已取消（没有批次结果可等）
async fn wait_all_cancelled(controller: &UploadQueueController) {
    let mut events = controller.subscribe();
    loop {
        let stats = controller.stats();
        if stats.total > 0 && stats.cancelled == stats.total {
            return;
        }
        match events.recv().await {
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// 批次结束后的退出码：中断导致有文件被取消时为 130，有失败时为 1
fn batch_exit_code(result: &BatchResult, interrupted: bool, cancelled: usize) -> u8 {
    if interrupted && cancelled > 0 {
        EXIT_INTERRUPTED
    } else if result.failed > 0 {
        1
    } else {
        0
    }
}

/// 把上传事件写入日志，直到通道关闭；返回处理的事件数
async fn log_events(
    mut events: broadcast::Receiver<UploadEvent>,
    names: HashMap<CandidateId, String>,
) -> usize {
    let mut handled = 0;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("事件日志落后, 跳过 {} 个事件", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return handled,
        };
        handled += 1;

        let name = event
            .candidate_id()
            .and_then(|id| names.get(&id).cloned())
            .unwrap_or_default();
        match event {
            UploadEvent::Progress { progress, .. } => info!("{} {}%", name, progress),
            UploadEvent::Completed { media, .. } => info!("✅ {} -> {}", name, media.url),
            UploadEvent::Failed { error, .. } => error!("❌ {}: {}", name, error),
            UploadEvent::Cancelled { .. } => warn!("⏹ {} 已取消", name),
            _ => {}
        }
    }
}
