// CSRF 令牌提供者
//
// 并发上传共用一次令牌请求（RequestCoalescer），令牌在 TTL 内复用

use crate::common::{CoalesceError, RequestCoalescer};
use crate::config::UploadConfig;
use anyhow::Context;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "csrfToken", alias = "csrf_token")]
    token: String,
}

/// CSRF 令牌提供者
pub struct CsrfTokenProvider {
    client: reqwest::Client,
    endpoint: String,
    header_name: String,
    cache: RequestCoalescer<String>,
}

impl CsrfTokenProvider {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        header_name: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            header_name: header_name.into(),
            cache: RequestCoalescer::new(Some(ttl)),
        }
    }

    /// 根据配置创建，未配置令牌端点时返回 None
    pub fn from_config(client: reqwest::Client, config: &UploadConfig) -> Option<Self> {
        let endpoint = config.csrf_endpoint.as_deref()?.trim();
        if endpoint.is_empty() {
            return None;
        }
        Some(Self::new(
            client,
            endpoint,
            config.csrf_header.clone(),
            config.csrf_ttl(),
        ))
    }

    /// 请求头名称
    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    /// 获取令牌（缓存有效时直接返回）
    pub async fn token(&self) -> Result<String, CoalesceError> {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();

        self.cache
            .get_or_fetch(move || async move {
                debug!("获取 CSRF 令牌: {}", endpoint);
                let response = client
                    .get(&endpoint)
                    .send()
                    .await
                    .context("CSRF 令牌请求失败")?
                    .error_for_status()
                    .context("CSRF 令牌端点返回错误状态")?;

                let body: TokenResponse = response.json().await.context("CSRF 令牌响应解析失败")?;
                if body.token.is_empty() {
                    anyhow::bail!("CSRF 令牌为空");
                }
                info!("CSRF 令牌已刷新");
                Ok(body.token)
            })
            .await
    }

    /// 作废缓存的令牌（服务器返回 403 时调用）
    pub fn invalidate(&self) {
        debug!("作废 CSRF 令牌缓存");
        self.cache.invalidate();
    }
}
