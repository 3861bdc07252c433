// SPDX-License-Identifier: Apache-2.0

//! Push-gateway delivery of the gauge registry.
//!
//! One push per rescan cycle: the registry is encoded in the text
//! exposition format and `PUT` to the gateway's job/instance grouping URL.
//! Push failures are reported to the caller, which logs them; they never
//! stop the extractor.

use std::time::Duration;

use prometheus::{Encoder, Registry, TextEncoder};
use reqwest::Client;
use thiserror::Error;

use crate::config::PushGatewayConfig;

/// Deadline for one push request, connection included.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PushError {
    #[error("failed to encode metrics: {0}")]
    Encode(#[from] prometheus::Error),

    #[error("push request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("push gateway returned status {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug)]
pub struct GatewayPusher {
    client: Client,
    push_url: String,
}

impl GatewayPusher {
    pub fn new(config: &PushGatewayConfig) -> Result<Self, PushError> {
        let client = Client::builder().timeout(PUSH_TIMEOUT).build()?;
        let base = config.url.trim_end_matches('/');
        let push_url = format!(
            "{}/metrics/job/{}/instance/{}",
            base, config.job, config.instance
        );
        Ok(Self { client, push_url })
    }

    /// Encode all registered metrics and push them to the gateway.
    pub async fn push(&self, registry: &Registry) -> Result<(), PushError> {
        let encoder = TextEncoder::new();
        let mut body = String::new();
        encoder.encode_utf8(&registry.gather(), &mut body)?;

        let response = self
            .client
            .put(&self.push_url)
            .header(reqwest::header::CONTENT_TYPE, encoder.format_type())
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PushError::Status(response.status()));
        }
        Ok(())
    }
}
