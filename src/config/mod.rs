// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 上传配置
///
/// 上传队列只消费这些参数，不负责修改
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 上传接口地址（multipart/form-data POST）
    #[serde(default = "default_upload_endpoint")]
    pub upload_endpoint: String,
    /// 单个文件最大大小（字节）
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// 队列中最多容纳的文件数，0 表示不限制
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    /// 最大同时上传文件数
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    /// 允许的 MIME 类型，支持 `image/*` 通配，空列表表示不限制
    #[serde(default = "default_accepted_mime_types")]
    pub accepted_mime_types: Vec<String>,
    /// 单次请求超时（秒），0 表示不超时
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 批次完成后保留已完成/失败文件的时间（毫秒）
    #[serde(default = "default_batch_grace_period_ms")]
    pub batch_grace_period_ms: u64,
    /// CSRF 令牌获取地址（可选）
    #[serde(default)]
    pub csrf_endpoint: Option<String>,
    /// CSRF 令牌请求头名称
    #[serde(default = "default_csrf_header")]
    pub csrf_header: String,
    /// CSRF 令牌缓存时间（秒）
    #[serde(default = "default_csrf_ttl_secs")]
    pub csrf_ttl_secs: u64,
}

fn default_upload_endpoint() -> String {
    "http://127.0.0.1:3000/api/media/upload".to_string()
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

fn default_max_files() -> usize {
    20
}

fn default_max_concurrent_uploads() -> usize {
    3
}

fn default_accepted_mime_types() -> Vec<String> {
    vec![
        "image/*".to_string(),
        "video/*".to_string(),
        "audio/*".to_string(),
        "application/pdf".to_string(),
    ]
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_batch_grace_period_ms() -> u64 {
    3000
}

fn default_csrf_header() -> String {
    "X-CSRF-Token".to_string()
}

fn default_csrf_ttl_secs() -> u64 {
    600
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            upload_endpoint: default_upload_endpoint(),
            max_file_size: default_max_file_size(),
            max_files: default_max_files(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            accepted_mime_types: default_accepted_mime_types(),
            request_timeout_secs: default_request_timeout_secs(),
            batch_grace_period_ms: default_batch_grace_period_ms(),
            csrf_endpoint: None,
            csrf_header: default_csrf_header(),
            csrf_ttl_secs: default_csrf_ttl_secs(),
        }
    }
}

impl UploadConfig {
    /// 实际生效的并发上限（至少为 1）
    pub fn concurrency_limit(&self) -> usize {
        self.max_concurrent_uploads.max(1)
    }

    /// 请求超时，0 表示不超时
    pub fn request_timeout(&self) -> Option<Duration> {
        if self.request_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.request_timeout_secs))
        }
    }

    pub fn batch_grace_period(&self) -> Duration {
        Duration::from_millis(self.batch_grace_period_ms)
    }

    pub fn csrf_ttl(&self) -> Duration {
        Duration::from_secs(self.csrf_ttl_secs)
    }

    /// 验证配置是否可用
    pub fn validate(&self) -> Result<()> {
        if self.upload_endpoint.trim().is_empty() {
            anyhow::bail!("上传接口地址不能为空");
        }
        if self.max_file_size == 0 {
            anyhow::bail!("max_file_size 必须大于 0");
        }
        if let Some(endpoint) = &self.csrf_endpoint {
            if endpoint.trim().is_empty() {
                anyhow::bail!("csrf_endpoint 不能为空字符串");
            }
        }
        Ok(())
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.upload
            .validate()
            .context("保存配置失败：上传配置无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();

                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upload.max_concurrent_uploads, 3);
        assert_eq!(config.upload.max_files, 20);
        assert_eq!(config.upload.max_file_size, 50 * 1024 * 1024);
        assert!(config.upload.csrf_endpoint.is_none());
        assert!(config.log.enabled);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.max_concurrent_uploads = 5;
        config.upload.accepted_mime_types = vec!["image/png".to_string()];
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.upload.max_concurrent_uploads, 5);
        assert_eq!(loaded.upload.accepted_mime_types, vec!["image/png"]);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [upload]
            max_concurrent_uploads = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.upload.max_concurrent_uploads, 2);
        assert_eq!(config.upload.max_files, 20);
        assert_eq!(config.upload.csrf_header, "X-CSRF-Token");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_limits() {
        let mut config = UploadConfig::default();
        config.max_concurrent_uploads = 0;
        assert_eq!(config.concurrency_limit(), 1);

        config.request_timeout_secs = 0;
        assert!(config.request_timeout().is_none());

        config.request_timeout_secs = 30;
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_validate() {
        let mut config = UploadConfig::default();
        assert!(config.validate().is_ok());

        config.upload_endpoint = "  ".to_string();
        assert!(config.validate().is_err());

        let config = UploadConfig {
            max_file_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_or_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let path = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path).await;
        assert_eq!(config.upload.max_concurrent_uploads, 3);
        assert!(std::path::Path::new(path).exists());
    }
}
