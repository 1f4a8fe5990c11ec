/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::request::InboundHttpRequest;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::store::InboxDb;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use serde_json::Value;

/// Immutable record of one inbound request as received.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRequest {
    pub request_id: String,
    pub received_at_ms: i64,
    pub headers: Vec<(String, String)>,
    pub raw_body: Vec<u8>,
    /// `None` when the body did not parse as JSON.
    pub parsed_body: Option<Value>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub remote_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Everything about an inbound request except its id.
#[derive(Debug, Clone)]
pub struct NewInboundRequest {
    pub received_at_ms: i64,
    pub headers: Vec<(String, String)>,
    pub raw_body: Vec<u8>,
    pub parsed_body: Option<Value>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub remote_address: Option<String>,
    pub user_agent: Option<String>,
}

impl NewInboundRequest {
    pub fn from_http(req: &InboundHttpRequest, parsed_body: Option<&Value>) -> Self {
        Self {
            received_at_ms: req.received_at_ms,
            headers: req.headers_vec(),
            raw_body: req.body.to_vec(),
            parsed_body: parsed_body.cloned(),
            content_type: req.content_type().map(|s| s.to_string()),
            content_length: req.declared_content_length(),
            remote_address: req.remote_addr.clone(),
            user_agent: req.user_agent().map(|s| s.to_string()),
        }
    }

    fn with_id(self, request_id: String) -> InboundRequest {
        InboundRequest {
            request_id,
            received_at_ms: self.received_at_ms,
            headers: self.headers,
            raw_body: self.raw_body,
            parsed_body: self.parsed_body,
            content_type: self.content_type,
            content_length: self.content_length,
            remote_address: self.remote_address,
            user_agent: self.user_agent,
        }
    }
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persists the request under a fresh id and returns it.
    async fn record(&self, req: NewInboundRequest) -> Result<String>;
    async fn get(&self, request_id: &str) -> Result<Option<InboundRequest>>;
}

pub struct SqliteAuditStore {
    db: InboxDb,
    retry: RetryPolicy,
}

impl SqliteAuditStore {
    pub fn new(db: InboxDb, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    pub async fn count(&self) -> Result<u64> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.count_inbound_requests())
            .await
            .context("audit count task panicked")?
    }

    /// Retention hook for an external cleanup job; the pipeline never calls this.
    pub async fn prune_before(&self, cutoff_ms: i64) -> Result<u64> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.prune_inbound_requests_before(cutoff_ms))
            .await
            .context("audit prune task panicked")?
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn record(&self, req: NewInboundRequest) -> Result<String> {
        let record = req.with_id(new_request_id());
        let request_id = record.request_id.clone();
        retry_with_backoff(self.retry, "audit insert", || {
            let db = self.db.clone();
            let record = record.clone();
            async move {
                tokio::task::spawn_blocking(move || db.insert_inbound_request(&record))
                    .await
                    .context("audit insert task panicked")?
            }
        })
        .await?;
        Ok(request_id)
    }

    async fn get(&self, request_id: &str) -> Result<Option<InboundRequest>> {
        let db = self.db.clone();
        let id = request_id.to_string();
        tokio::task::spawn_blocking(move || db.get_inbound_request(&id))
            .await
            .context("audit read task panicked")?
    }
}

/// 128 random bits, hex encoded.
pub fn new_request_id() -> String {
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    hex::encode(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_sig::test_keys::unsigned_request;
    use std::time::Duration;

    fn store() -> (tempfile::TempDir, SqliteAuditStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = InboxDb::open(dir.path().join("audit.db")).unwrap();
        let retry = RetryPolicy {
            attempts: 2,
            base_backoff: Duration::from_millis(1),
            attempt_timeout: Duration::from_secs(2),
        };
        (dir, SqliteAuditStore::new(db, retry))
    }

    #[tokio::test]
    async fn records_unparsed_body() {
        let (_dir, s) = store();
        let http = unsigned_request("/inbox", b"{not json");
        let id = s.record(NewInboundRequest::from_http(&http, None)).await.unwrap();
        assert_eq!(id.len(), 32);

        let got = s.get(&id).await.unwrap().unwrap();
        assert_eq!(got.raw_body, b"{not json");
        assert_eq!(got.parsed_body, None);
        assert_eq!(got.content_type.as_deref(), Some("application/activity+json"));
        assert!(got.headers.iter().any(|(k, v)| k == "host" && v == "local.example"));
    }

    #[tokio::test]
    async fn received_time_comes_from_the_request() {
        let (_dir, s) = store();
        let mut http = unsigned_request("/inbox", b"{}");
        http.received_at_ms = 1_700_000_000_123;
        let id = s.record(NewInboundRequest::from_http(&http, None)).await.unwrap();
        assert_eq!(s.get(&id).await.unwrap().unwrap().received_at_ms, 1_700_000_000_123);
    }

    #[tokio::test]
    async fn identical_requests_get_distinct_records() {
        let (_dir, s) = store();
        let http = unsigned_request("/inbox", br#"{"type":"Like"}"#);
        let body: Value = serde_json::from_slice(&http.body).unwrap();
        let a = s.record(NewInboundRequest::from_http(&http, Some(&body))).await.unwrap();
        let b = s.record(NewInboundRequest::from_http(&http, Some(&body))).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(s.count().await.unwrap(), 2);
        assert_eq!(s.get(&a).await.unwrap().unwrap().parsed_body, Some(body));
    }

    #[tokio::test]
    async fn prune_removes_old_rows_only() {
        let (_dir, s) = store();
        let http = unsigned_request("/inbox", b"{}");
        let mut old = NewInboundRequest::from_http(&http, None);
        old.received_at_ms = 1_000;
        s.record(old).await.unwrap();
        s.record(NewInboundRequest::from_http(&http, None)).await.unwrap();
        assert_eq!(s.prune_before(2_000).await.unwrap(), 1);
        assert_eq!(s.count().await.unwrap(), 1);
    }
}
