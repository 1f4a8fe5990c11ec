/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body returned on every rejected inbox request. Never echoes activity content.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InboxRejection {
    pub error: String,
    pub request_id: String,
}

/// Body returned with `202 Accepted`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InboxAck {
    pub status: String,
    pub request_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DomainBlockRequest {
    pub domain: String,
    pub block: bool,
    #[serde(default)]
    pub instance: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DomainBlockResponse {
    pub domain: String,
    pub blocked: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Verified,
    Unverified,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Verified => "verified",
            TrustLevel::Unverified => "unverified",
        }
    }
}

/// Payload of one queued inbox job.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InboxTask {
    pub request_id: String,
    pub handler: String,
    pub dedup_id: String,
    pub trust: TrustLevel,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub key_id: Option<String>,
    pub activity: Value,
}
