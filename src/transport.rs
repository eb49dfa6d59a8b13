use anyhow::Result;
use std::time::Duration;

use crate::rpc::{AppendEntriesReply, AppendEntriesRequest, VoteReply, VoteRequest};

/// HTTP client for peer RPCs. Every call is bounded by the configured
/// timeout; callers treat any failure as a dropped message and rely on the
/// next tick to retry.
#[derive(Clone)]
pub struct PeerClient {
    client: reqwest::Client,
}

impl PeerClient {
    pub fn new(rpc_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(rpc_timeout).build()?;
        Ok(PeerClient { client })
    }

    pub async fn request_vote(&self, peer: &str, request: &VoteRequest) -> Result<VoteReply> {
        let reply = self
            .client
            .post(format!("{peer}/request_vote"))
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply)
    }

    pub async fn append_entries(
        &self,
        peer: &str,
        request: &AppendEntriesRequest,
    ) -> Result<AppendEntriesReply> {
        let reply = self
            .client
            .post(format!("{peer}/append_entries"))
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply)
    }
}
