//! Receiver setup query (`/setup/eureka_info`): friendly name and build.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Port of the receiver's local setup HTTP server.
pub const SETUP_PORT: u16 = 8008;
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct EurekaInfo {
    name: Option<String>,
    build_info: Option<BuildInfo>,
}

#[derive(Debug, Deserialize)]
struct BuildInfo {
    cast_build_revision: Option<String>,
}

/// What the receiver told us about itself. Fields are empty when unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverSetupInfo {
    pub friendly_name: String,
    pub build_version: String,
}

pub struct ReceiverSetupQuerier {
    http: reqwest::Client,
    url: String,
}

impl ReceiverSetupQuerier {
    pub fn new(address: IpAddr) -> Self {
        let host = SocketAddr::new(address, SETUP_PORT);
        Self::with_url(format!(
            "http://{}/setup/eureka_info?params=name,build_info",
            host
        ))
    }

    pub fn with_url(url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn query(&self) -> Result<ReceiverSetupInfo> {
        tracing::debug!("Setup GET {}", self.url);
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("Setup GET {} failed", self.url))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("Setup GET {} returned {}", self.url, status);
        }
        let body = resp.text().await.context("Failed to read setup response")?;
        parse_eureka_info(&body)
    }

    /// Like [`query`](Self::query), but failures only log a warning.
    pub async fn query_or_default(&self) -> ReceiverSetupInfo {
        match self.query().await {
            Ok(info) => {
                tracing::info!(
                    "Receiver setup: name={:?} build={:?}",
                    info.friendly_name,
                    info.build_version
                );
                info
            }
            Err(e) => {
                tracing::warn!("Receiver setup query failed: {:#}", e);
                ReceiverSetupInfo::default()
            }
        }
    }
}

pub fn parse_eureka_info(body: &str) -> Result<ReceiverSetupInfo> {
    let info: EurekaInfo =
        serde_json::from_str(body).context("Failed to parse eureka_info response")?;
    Ok(ReceiverSetupInfo {
        friendly_name: info.name.unwrap_or_default(),
        build_version: info
            .build_info
            .and_then(|b| b.cast_build_revision)
            .unwrap_or_default(),
    })
}
