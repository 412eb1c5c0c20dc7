//! HTTP uplink to the remote collector.
//!
//! A reading is delivered as flat form key-value pairs; any 2xx response is
//! success, everything else (status, refusal, timeout) is a delivery
//! failure. Request timeouts are mandatory: an unbounded hang here would
//! stall all future acquisition.

use async_trait::async_trait;
use chrono::Local;
use std::time::Duration;
use tracing::debug;

use crate::config::UplinkConfig;
use crate::error::{MeterError, Result};
use crate::reading::{Reading, TIMESTAMP_FORMAT};

/// Delivery seam the router transmits through.
#[async_trait]
pub trait ReadingSink: Send {
    /// Deliver one reading; `Ok` only once the remote side acknowledged it.
    async fn send(&self, reading: &Reading) -> Result<()>;
}

/// reqwest-backed client for the collector endpoint.
pub struct CollectorClient {
    client: reqwest::Client,
    url: String,
}

impl CollectorClient {
    pub fn new(config: &UplinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| MeterError::delivery(&config.base_url, e.to_string()))?;
        Ok(Self {
            client,
            url: config.base_url.clone(),
        })
    }
}

#[async_trait]
impl ReadingSink for CollectorClient {
    async fn send(&self, reading: &Reading) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .form(&reading.form_pairs())
            .send()
            .await
            .map_err(|e| MeterError::delivery(&self.url, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(timestamp = %reading.timestamp, "reading delivered");
            Ok(())
        } else {
            Err(MeterError::delivery(
                &self.url,
                format!("collector returned {status}"),
            ))
        }
    }
}

/// Liveness endpoint relative to the collector base URL.
pub fn ping_url(base_url: &str) -> String {
    format!("{}/ping/", base_url.trim_end_matches('/'))
}

/// Fire-and-forget liveness signal: current timestamp and meter id.
///
/// Not retried and not persisted on failure; the caller just logs the error.
pub async fn send_ping(base_url: &str, meter_id: u8, request_timeout: Duration) -> Result<()> {
    let url = ping_url(base_url);
    let payload = [
        (
            "timestamp",
            Local::now().format(TIMESTAMP_FORMAT).to_string(),
        ),
        ("meter_id", meter_id.to_string()),
    ];

    let client = reqwest::Client::builder()
        .timeout(request_timeout)
        .build()
        .map_err(|e| MeterError::delivery(&url, e.to_string()))?;

    let response = client
        .post(&url)
        .form(&payload)
        .send()
        .await
        .map_err(|e| MeterError::delivery(&url, e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(MeterError::delivery(
            &url,
            format!("collector returned {status}"),
        ))
    }
}
