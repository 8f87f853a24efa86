// 传输适配器
//
// 上传队列与 HTTP 客户端之间的边界：
// - 每次上传尝试恰好发起一次网络请求，重试是全新的请求
// - 进度来自已发送字节数 / 总字节数，只增不减
// - 取消与失败可区分：取消返回 TransportError::Cancelled，超时返回 Timeout（属于失败）

use crate::config::UploadConfig;
use crate::uploader::candidate::{SelectedFile, UploadedMedia};
use crate::uploader::error::TransportError;
use crate::uploader::token::CsrfTokenProvider;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::multipart;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 请求体分块大小
pub const UPLOAD_STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// 进度回调（百分比 0-100）
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// 一次上传请求
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_name: String,
    pub mime_type: String,
    pub payload: Bytes,
}

impl UploadRequest {
    /// 由文件信息和已读取的内容组成请求
    pub fn new(file: &SelectedFile, payload: Bytes) -> Self {
        Self {
            file_name: file.name.clone(),
            mime_type: file.mime_type.clone(),
            payload,
        }
    }
}

/// 上传传输层
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// 上传单个文件
    ///
    /// `cancel` 被触发后应尽快返回 `TransportError::Cancelled` 并中止底层请求
    async fn upload(
        &self,
        request: UploadRequest,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<UploadedMedia, TransportError>;
}

/// 字节进度 -> 百分比
///
/// 只在百分比增加时触发回调
pub struct ProgressReporter {
    total: u64,
    sent: AtomicU64,
    last_percent: AtomicU8,
    callback: ProgressCallback,
}

impl ProgressReporter {
    pub fn new(total: u64, callback: ProgressCallback) -> Self {
        Self {
            total,
            sent: AtomicU64::new(0),
            last_percent: AtomicU8::new(0),
            callback,
        }
    }

    /// 记录新发送的字节数
    pub fn advance(&self, bytes: u64) {
        let sent = self.sent.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let percent = if self.total == 0 {
            100
        } else {
            (sent.min(self.total) * 100 / self.total) as u8
        };

        let previous = self.last_percent.fetch_max(percent, Ordering::Relaxed);
        if percent > previous {
            (self.callback)(percent);
        }
    }

    pub fn percent(&self) -> u8 {
        self.last_percent.load(Ordering::Relaxed)
    }
}

/// 基于 reqwest multipart 的上传实现
pub struct HttpUploadTransport {
    client: reqwest::Client,
    endpoint: String,
    timeout: Option<Duration>,
    csrf: Option<CsrfTokenProvider>,
}

impl HttpUploadTransport {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout: None,
            csrf: None,
        }
    }

    /// 单次请求超时（None 表示不限制）
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_csrf(mut self, csrf: CsrfTokenProvider) -> Self {
        self.csrf = Some(csrf);
        self
    }

    pub fn from_config(config: &UploadConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("media-upload/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let mut transport =
            Self::new(client.clone(), config.upload_endpoint.clone()).with_timeout(config.request_timeout());
        if let Some(csrf) = CsrfTokenProvider::from_config(client, config) {
            transport = transport.with_csrf(csrf);
        }
        Ok(transport)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// 构建 multipart 表单：`file`（流式）+ `fileName`
    fn build_form(
        request: &UploadRequest,
        progress: ProgressCallback,
    ) -> Result<multipart::Form, TransportError> {
        let total = request.payload.len() as u64;
        let reporter = Arc::new(ProgressReporter::new(total, progress));

        let chunks: Vec<Bytes> = (0..request.payload.len())
            .step_by(UPLOAD_STREAM_CHUNK_SIZE)
            .map(|start| {
                let end = (start + UPLOAD_STREAM_CHUNK_SIZE).min(request.payload.len());
                request.payload.slice(start..end)
            })
            .collect();

        let stream = futures::stream::iter(chunks).map(move |chunk| {
            reporter.advance(chunk.len() as u64);
            Ok::<Bytes, std::io::Error>(chunk)
        });

        let mime_type = if request.mime_type.parse::<mime_guess::Mime>().is_ok() {
            request.mime_type.clone()
        } else {
            "application/octet-stream".to_string()
        };

        let part = multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), total)
            .file_name(request.file_name.clone())
            .mime_str(&mime_type)?;

        Ok(multipart::Form::new()
            .part("file", part)
            .text("fileName", request.file_name.clone()))
    }

    /// 发送一次请求并解析响应
    async fn send_once(
        &self,
        request: UploadRequest,
        progress: ProgressCallback,
    ) -> Result<UploadedMedia, TransportError> {
        let form = Self::build_form(&request, progress)?;
        let mut builder = self.client.post(&self.endpoint).multipart(form);

        if let Some(csrf) = &self.csrf {
            let token = csrf
                .token()
                .await
                .map_err(|e| TransportError::Network(e.to_string()))?;
            builder = builder.header(csrf.header_name(), token);
        }

        debug!(
            "发送上传请求: name={}, size={}, endpoint={}",
            request.file_name,
            request.payload.len(),
            self.endpoint
        );

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status == reqwest::StatusCode::FORBIDDEN {
            if let Some(csrf) = &self.csrf {
                warn!("上传返回 403，作废 CSRF 令牌");
                csrf.invalidate();
            }
        }

        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: parse_error_message(&body),
            });
        }

        parse_media(&body)
    }
}

#[async_trait]
impl UploadTransport for HttpUploadTransport {
    async fn upload(
        &self,
        request: UploadRequest,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<UploadedMedia, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let exchange = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, self.send_once(request, progress))
                    .await
                    .map_err(|_| TransportError::Timeout(limit))?,
                None => self.send_once(request, progress).await,
            }
        };

        // 取消时丢弃请求 future，连接随之关闭
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = exchange => result,
        }
    }
}

/// 解析成功响应：`{id, url}` 或 `{data: {id, url}}`，id 可以是字符串或数字
fn parse_media(body: &str) -> Result<UploadedMedia, TransportError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| TransportError::InvalidResponse(format!("{}: {}", e, truncate(body))))?;

    let media = [Some(&value), value.get("data")]
        .into_iter()
        .flatten()
        .find_map(|v| {
            let id = match v.get("id")? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            let url = v.get("url")?.as_str()?.to_string();
            Some(UploadedMedia { id, url })
        });

    media.ok_or_else(|| TransportError::InvalidResponse(format!("缺少 id/url: {}", truncate(body))))
}

/// 从错误响应中提取 message / error 字段
fn parse_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let message = match (value.get("message"), value.get("error")) {
        (Some(Value::String(s)), _) => s.clone(),
        (_, Some(Value::String(s))) => s.clone(),
        (_, Some(Value::Object(obj))) => obj.get("message")?.as_str()?.to_string(),
        _ => return None,
    };
    let message = message.trim().to_string();
    (!message.is_empty()).then_some(message)
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}
