//! Correlation store backends

use crate::error::{CorrelationError, CorrelationResult};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use sessiontrace_core::config::CorrelationStoreSettings;
use tracing::debug;
use url::Url;

/// Writes encoded lines to a store; one attempt, no retries
#[async_trait]
pub trait CorrelationBackend: Send + Sync {
    async fn write_lines(&self, lines: &[String]) -> CorrelationResult<()>;
}

/// InfluxDB v2 write API (also served by VictoriaMetrics)
pub struct InfluxLineBackend {
    client: Client,
    write_url: Url,
    token: Option<HeaderValue>,
}

impl InfluxLineBackend {
    pub fn new(settings: &CorrelationStoreSettings) -> CorrelationResult<Self> {
        let mut base = settings.url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let mut write_url = base
            .join("api/v2/write")
            .map_err(|e| CorrelationError::Config(format!("store url: {}", e)))?;
        write_url
            .query_pairs_mut()
            .append_pair("org", &settings.org)
            .append_pair("bucket", &settings.bucket)
            .append_pair("precision", "ns");

        let token = settings
            .token
            .as_deref()
            .map(|token| {
                HeaderValue::from_str(&format!("Token {}", token))
                    .map_err(|e| CorrelationError::Config(format!("store token: {}", e)))
            })
            .transpose()?;

        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| CorrelationError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            write_url,
            token,
        })
    }

    pub fn write_url(&self) -> &Url {
        &self.write_url
    }
}

#[async_trait]
impl CorrelationBackend for InfluxLineBackend {
    async fn write_lines(&self, lines: &[String]) -> CorrelationResult<()> {
        let body = lines.join("\n");
        debug!("Writing {} correlation lines to {}", lines.len(), self.write_url);

        let mut request = self
            .client
            .post(self.write_url.clone())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, token.clone());
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(CorrelationError::Rejected {
            status: status.as_u16(),
            body: body.chars().take(256).collect(),
        })
    }
}
