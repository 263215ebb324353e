//! Web page download
//!
//! Fetches a posting URL into memory so the caller can store it through its
//! environment. The builtin downloader uses `reqwest`; `wget` and `curl` are
//! run through the bounded executor and stream the page to stdout. Either way
//! the call is bounded by `system.web_download.timeout_secs`.

use reqwest::Client;
use sdk::errors::{EngineError, Result};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{ScraperKind, SystemConfig};
use crate::executor::{BoundedExecutor, CallerIdentity, CommandSpec};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone)]
pub struct Scraper {
    kind: ScraperKind,
    timeout: Duration,
    add_utf8_bom: bool,
    client: Client,
}

impl Scraper {
    pub fn from_config(config: &SystemConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.web_download.timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("docflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            kind: config.scraper,
            timeout,
            add_utf8_bom: config.web_download.add_utf8_bom,
            client,
        })
    }

    pub fn kind(&self) -> ScraperKind {
        self.kind
    }

    /// Download `url`, returning the page body
    pub async fn fetch(
        &self,
        executor: &BoundedExecutor,
        caller: &CallerIdentity,
        url: &str,
    ) -> Result<Vec<u8>> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(EngineError::Validation(format!(
                "only http(s) URLs can be downloaded, got '{}'",
                url
            )));
        }

        info!("Downloading {} with {:?} scraper", url, self.kind);
        let body = match self.kind {
            ScraperKind::Builtin => {
                executor
                    .run(caller, "download", Some(self.timeout), self.fetch_builtin(url))
                    .await?
            }
            ScraperKind::Wget => {
                let spec = CommandSpec::new("wget").args(["-q", "-O", "-", url]);
                executor
                    .run_checked(caller, &spec, Some(self.timeout))
                    .await?
                    .stdout
            }
            ScraperKind::Curl => {
                let spec = CommandSpec::new("curl").args(["-sSL", url]);
                executor
                    .run_checked(caller, &spec, Some(self.timeout))
                    .await?
                    .stdout
            }
        };
        debug!("Downloaded {} bytes from {}", body.len(), url);

        Ok(self.with_bom(body))
    }

    async fn fetch_builtin(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout {
                    operation: "download".to_string(),
                    seconds: self.timeout.as_secs(),
                }
            } else {
                EngineError::ExternalTool(format!("request to {} failed: {}", url, e))
            }
        })?;

        if !response.status().is_success() {
            return Err(EngineError::ExternalTool(format!(
                "{} returned HTTP {}",
                url,
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::ExternalTool(format!("reading {} failed: {}", url, e)))?;
        Ok(bytes.to_vec())
    }

    fn with_bom(&self, body: Vec<u8>) -> Vec<u8> {
        if !self.add_utf8_bom || body.starts_with(UTF8_BOM) {
            return body;
        }
        let mut out = Vec::with_capacity(body.len() + UTF8_BOM.len());
        out.extend_from_slice(UTF8_BOM);
        out.extend(body);
        out
    }
}
