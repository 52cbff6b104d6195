//! 积分计算服务 HTTP 客户端
//!
//! 通过 AccrualClient trait 抽象外部调用，便于测试时注入脚本化的实现。
//! 客户端只负责把 HTTP 响应原样带回，解释响应是分类器的职责。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use tracing::debug;

use crate::error::{AccrualError, Result};

/// 一次请求的原始响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccrualResponse {
    pub status: u16,
    pub retry_after: Option<String>,
    pub body: String,
}

impl AccrualResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn with_retry_after(mut self, retry_after: impl Into<String>) -> Self {
        self.retry_after = Some(retry_after.into());
        self
    }
}

/// 积分计算服务的抽象接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccrualClient: Send + Sync {
    /// GET {base_url}/api/orders/{order}
    ///
    /// 只有传输层失败才返回 Err，任何 HTTP 状态码都作为响应返回
    async fn fetch(&self, order: &str) -> Result<AccrualResponse>;
}

/// 基于 reqwest 的实现
///
/// 所有请求共享同一个 reqwest::Client 以复用连接，clone 是廉价操作。
#[derive(Clone)]
pub struct HttpAccrualClient {
    client: reqwest::Client,
    base_url: reqwest::Url,
}

impl HttpAccrualClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = reqwest::Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| AccrualError::Config(format!("无效的积分服务地址 {base_url}: {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(AccrualError::Config(format!(
                "积分服务地址必须使用 http 或 https: {base_url}"
            )));
        }
        if base_url.cannot_be_a_base() || base_url.host_str().is_none_or(str::is_empty) {
            return Err(AccrualError::Config(format!(
                "积分服务地址缺少主机名: {base_url}"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AccrualError::Config(format!("创建 HTTP 客户端失败: {e}")))?;

        Ok(Self { client, base_url })
    }

    /// 拼接订单查询地址
    pub fn order_url(&self, order: &str) -> Result<reqwest::Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AccrualError::Config(format!("无效的积分服务地址: {}", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "orders", order]);
        Ok(url)
    }
}

#[async_trait]
impl AccrualClient for HttpAccrualClient {
    async fn fetch(&self, order: &str) -> Result<AccrualResponse> {
        let url = self.order_url(order)?;
        debug!(order, %url, "查询积分计算结果");

        let transport = |e: reqwest::Error| AccrualError::Transport {
            order: order.to_string(),
            reason: e.to_string(),
        };

        let resp = self.client.get(url).send().await.map_err(transport)?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await.map_err(transport)?;

        Ok(AccrualResponse {
            status,
            retry_after,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_url() {
        let client = HttpAccrualClient::new("http://localhost:8081", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.order_url("79927398713").unwrap().as_str(),
            "http://localhost:8081/api/orders/79927398713"
        );
    }

    #[test]
    fn test_order_url_keeps_base_path() {
        let client =
            HttpAccrualClient::new("http://accrual.internal/v1/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.order_url("12345678903").unwrap().as_str(),
            "http://accrual.internal/v1/api/orders/12345678903"
        );
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        let err = HttpAccrualClient::new("not a url", Duration::from_secs(5))
            .err()
            .expect("应拒绝无效地址");
        assert_eq!(err.error_code(), "CONFIG_ERROR");

        for url in [
            "",
            "mailto:ops@example.com",
            "localhost:8081",
            "ftp://accrual",
            "http://",
            "http://:80",
            "https://",
        ] {
            let err = HttpAccrualClient::new(url, Duration::from_secs(5))
                .err()
                .unwrap_or_else(|| panic!("应拒绝 {url:?}"));
            assert_eq!(err.error_code(), "CONFIG_ERROR", "url={url:?}");
        }
    }

    #[tokio::test]
    async fn test_connection_error_is_transport_error() {
        // 端口 9 (discard) 在测试环境中通常无人监听
        let client = HttpAccrualClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = client.fetch("79927398713").await.unwrap_err();
        assert!(matches!(err, AccrualError::Transport { ref order, .. } if order == "79927398713"));
    }
}
