use anyhow::Context;
use base64::Engine as _;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, REFERER, USER_AGENT};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

use crate::core::model::CoverImage;
use crate::plugins::registry::ServiceContext;

#[derive(thiserror::Error, Debug)]
pub enum LibSocialError {
    #[error("http status error: {0}")]
    Status(StatusCode),

    #[error("response has no `data` field")]
    MissingData,
}

/// Which lib.social site a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Site {
    Manga,
    Ranobe,
}

impl Site {
    fn site_id(&self) -> &'static str {
        match self {
            Site::Manga => "1",
            Site::Ranobe => "3",
        }
    }

    pub fn origin(&self) -> &'static str {
        match self {
            Site::Manga => "https://mangalib.me",
            Site::Ranobe => "https://ranobelib.me",
        }
    }
}

/// Shared HTTP client for the lib.social API family.
#[derive(Clone)]
pub struct LibSocialClient {
    client: reqwest::Client,
    ctx: ServiceContext,
}

impl LibSocialClient {
    pub fn new(ctx: ServiceContext) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build reqwest client")?;
        Ok(Self { client, ctx })
    }

    pub fn ctx(&self) -> &ServiceContext {
        &self.ctx
    }

    fn build_headers(&self, site: Site) -> anyhow::Result<HeaderMap> {
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_str(&self.ctx.user_agent)?);
        h.insert(ACCEPT, HeaderValue::from_static("application/json, image/*, */*"));
        h.insert(REFERER, HeaderValue::from_static(site.origin()));
        h.insert(HeaderName::from_static("site-id"), HeaderValue::from_static(site.site_id()));
        Ok(h)
    }

    fn should_retry_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
    }

    async fn sleep_backoff(&self, attempt: u32) {
        let base = self.ctx.retry_backoff_ms.max(1);
        let shift = attempt.min(16);
        let mul = 1u64 << shift;
        let ms = base.saturating_mul(mul).min(30_000);
        sleep(Duration::from_millis(ms)).await;
    }

    /// GET with retries on transport errors and retryable statuses.
    pub async fn get_bytes(&self, site: Site, url: &str) -> anyhow::Result<Bytes> {
        let headers = self.build_headers(site)?;

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..=self.ctx.retries {
            if attempt > 0 {
                self.sleep_backoff(attempt - 1).await;
                tracing::debug!(url, attempt, "retrying request");
            }

            let resp = match self
                .client
                .get(url)
                .headers(headers.clone())
                .timeout(Duration::from_secs(self.ctx.timeout_secs))
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            };

            if resp.status().is_success() {
                return Ok(resp.bytes().await?);
            }

            if Self::should_retry_status(resp.status()) {
                last_err = Some(LibSocialError::Status(resp.status()).into());
                continue;
            }
            return Err(LibSocialError::Status(resp.status()).into());
        }

        Err(last_err.unwrap_or_else(|| LibSocialError::Status(StatusCode::REQUEST_TIMEOUT).into()))
    }

    /// GET `{api_base}{path}` and return its `data` member.
    pub async fn get_data(&self, site: Site, path: &str) -> anyhow::Result<Value> {
        let url = format!("{}{}", self.ctx.api_base.trim_end_matches('/'), path);
        let body = self.get_bytes(site, &url).await?;
        let mut json: Value = serde_json::from_slice(&body).with_context(|| format!("decode json from {}", url))?;
        match json.get_mut("data") {
            Some(data) => Ok(data.take()),
            None => Err(LibSocialError::MissingData.into()),
        }
    }

    pub async fn fetch_image(&self, site: Site, url: &str) -> anyhow::Result<CoverImage> {
        let bytes = self.get_bytes(site, url).await.with_context(|| format!("fetch image {}", url))?;
        Ok(CoverImage {
            base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
            mime: sniff_mime(&bytes).to_string(),
        })
    }
}

pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.len() >= 3 && bytes[0] == 0xFF && bytes[1] == 0xD8 && bytes[2] == 0xFF {
        return "image/jpeg";
    }
    if bytes.len() >= 8 && bytes[..8] == [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A] {
        return "image/png";
    }
    if bytes.len() >= 6 && &bytes[0..3] == b"GIF" {
        return "image/gif";
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return "image/webp";
    }
    "application/octet-stream"
}

/// Resolves relative image references against `base`.
pub fn absolute_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        path.to_string()
    } else if path.starts_with("//") {
        format!("https:{}", path)
    } else {
        format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}
