use std::time::Duration;

use uuid::Uuid;

use super::{NextBucketRequest, NextBucketResponse, ProcessingResponse};
use crate::error::Result;

/// HTTP client side of the peer RPC surface.
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
}

impl PeerClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Ask the leader for the next bucket of work.
    pub async fn next_bucket(
        &self,
        leader_uri: &str,
        requestor_uri: &str,
        hostname: &str,
    ) -> Result<NextBucketResponse> {
        let url = format!("{}/next_bucket", leader_uri.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&NextBucketRequest {
                requestor_uri: requestor_uri.to_string(),
                hostname: hostname.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Ask a worker whether it is still processing the given bucket.
    pub async fn processing(&self, worker_uri: &str, bucket_id: Uuid) -> Result<bool> {
        let url = format!(
            "{}/processing/{}",
            worker_uri.trim_end_matches('/'),
            bucket_id
        );
        let response = self.http.get(&url).send().await?.error_for_status()?;
        let body: ProcessingResponse = response.json().await?;
        Ok(body.processing)
    }
}

impl Default for PeerClient {
    fn default() -> Self {
        Self::new()
    }
}
