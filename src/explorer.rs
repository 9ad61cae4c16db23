// Block-explorer client - contract verification lookups via the scan API.
// An unset base_url disables the client entirely; lookups then resolve to
// "unknown" rather than failing.

use crate::retry::{with_backoff, DEFAULT_BASE_DELAY_MS};
use crate::settings::ExplorerSettings;
use anyhow::{Context, Result};
use ethers::types::Address;
use log::debug;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct ScanResponse {
    status: String,
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SourceCodeEntry {
    #[serde(rename = "SourceCode")]
    source_code: String,
    #[serde(rename = "ABI")]
    abi: String,
}

pub struct ExplorerClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    max_retries: usize,
}

impl ExplorerClient {
    /// None when no explorer is configured.
    pub fn from_settings(settings: &ExplorerSettings) -> Result<Option<Self>> {
        let base_url = match &settings.base_url {
            Some(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => return Ok(None),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.http_timeout_ms))
            .build()
            .context("failed to build explorer http client")?;
        Ok(Some(Self {
            client,
            base_url,
            api_key: settings.api_key.clone(),
            max_retries: settings.max_retries,
        }))
    }

    /// Whether the contract's source is verified on the explorer.
    pub async fn is_verified(&self, contract: Address) -> Result<bool> {
        let url = format!(
            "{}?module=contract&action=getsourcecode&address={:#x}&apikey={}",
            self.base_url, contract, self.api_key
        );

        let response = with_backoff(
            "explorer_getsourcecode",
            self.max_retries,
            Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            || async {
                let resp = self.client.get(&url).send().await?;
                if !resp.status().is_success() {
                    anyhow::bail!("http {}", resp.status());
                }
                let body: ScanResponse = resp.json().await?;
                Ok(body)
            },
        )
        .await?;

        if response.status != "1" {
            anyhow::bail!("explorer error: {}", response.result);
        }

        let entries: Vec<SourceCodeEntry> =
            serde_json::from_value(response.result).context("unexpected getsourcecode shape")?;
        // Unverified contracts come back with an empty SourceCode and a
        // "not verified" ABI marker.
        let verified = entries
            .first()
            .map(|e| !e.source_code.is_empty() && e.abi != "Contract source code not verified")
            .unwrap_or(false);

        debug!("[explorer] {:#x} verified={}", contract, verified);
        Ok(verified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_base_url_disables_the_client() {
        let settings = ExplorerSettings {
            base_url: None,
            ..ExplorerSettings::default()
        };
        assert!(ExplorerClient::from_settings(&settings).unwrap().is_none());

        let settings = ExplorerSettings {
            base_url: Some("   ".to_string()),
            ..ExplorerSettings::default()
        };
        assert!(ExplorerClient::from_settings(&settings).unwrap().is_none());
    }

    #[test]
    fn default_settings_build_a_client() {
        let client = ExplorerClient::from_settings(&ExplorerSettings::default()).unwrap();
        assert!(client.is_some());
    }
}
