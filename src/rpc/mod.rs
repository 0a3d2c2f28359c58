//! Peer RPC surface: bucket assignment and the liveness probe.
//!
//! JSON over HTTP, symmetric: every peer serves the same routes and may
//! call every other. Followers POST `/next_bucket` to the leader; the
//! leader GETs `/processing/{bucket_id}` on workers during scan
//! confirmation.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use client::PeerClient;
pub use server::{AssignmentService, RpcServer, RpcState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextBucketRequest {
    pub requestor_uri: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextBucketResponse {
    /// Bucket handed to the requestor, if any.
    pub bucket_id: Option<Uuid>,
    /// How long the requestor should sleep before asking again.
    pub back_off_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResponse {
    pub processing: bool,
}
