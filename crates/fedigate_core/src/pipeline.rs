/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The inbound admission pipeline.
//!
//! Stages run in a fixed order and the first failure ends the request:
//! structure, URI safety, signature, abuse quotas, domain blocks, audit,
//! dispatch. Only malformed or over-complex bodies are audited on the
//! rejection path. Once a request is audited its dispatch runs in its own
//! task, so a dropped connection cannot lose it.

use crate::abuse_guard::AbuseGuard;
use crate::admission::{Admission, AdmissionPolicy};
use crate::audit::{new_request_id, AuditStore, NewInboundRequest};
use crate::classify::{classify, HandlerKind};
use crate::config::InboxConfig;
use crate::counters::CounterStore;
use crate::dispatch::Dispatcher;
use crate::domain_blocks::DomainBlocks;
use crate::error::{InboxError, Stage};
use crate::http_sig::KeyResolve;
use crate::json_limits::{parse_bounded, JsonLimits};
use crate::request::InboundHttpRequest;
use crate::task_queue::TaskQueue;
use crate::uri_safety::UriPolicy;
use fedigate_protocol::TrustLevel;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Collaborators the pipeline is built from.
pub struct PipelineParts {
    pub resolver: Arc<dyn KeyResolve>,
    pub counters: Arc<dyn CounterStore>,
    pub blocks: Arc<DomainBlocks>,
    pub audit: Arc<dyn AuditStore>,
    pub queue: Arc<dyn TaskQueue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Dispatched {
        request_id: String,
        job_id: String,
        handler: HandlerKind,
        trust: TrustLevel,
        duplicate: bool,
    },
    /// Source domain is blocked; acknowledged without being recorded.
    Discarded { trace_id: String, source: String },
}

#[derive(Debug)]
pub struct Rejection {
    pub stage: Stage,
    pub error: InboxError,
    pub trace_id: String,
    /// Set once the request has an audit record.
    pub request_id: Option<String>,
}

impl Rejection {
    /// Id to hand back to the sender: the audit id when there is one.
    pub fn correlation_id(&self) -> &str {
        self.request_id.as_deref().unwrap_or(&self.trace_id)
    }
}

pub struct InboxPipeline {
    limits: JsonLimits,
    uris: UriPolicy,
    admission: AdmissionPolicy,
    guard: AbuseGuard,
    blocks: Arc<DomainBlocks>,
    audit: Arc<dyn AuditStore>,
    dispatcher: Arc<Dispatcher>,
}

impl InboxPipeline {
    pub fn new(cfg: &InboxConfig, parts: PipelineParts) -> Self {
        Self {
            limits: JsonLimits::from_config(cfg),
            uris: UriPolicy::from_config(cfg),
            admission: AdmissionPolicy::new(cfg, parts.resolver),
            guard: AbuseGuard::new(cfg, parts.counters),
            blocks: parts.blocks,
            audit: parts.audit,
            dispatcher: Arc::new(Dispatcher::new(cfg, parts.queue)),
        }
    }

    pub fn blocks(&self) -> &Arc<DomainBlocks> {
        &self.blocks
    }

    /// Runs one request through every stage. `acting_user` is the addressed
    /// user for per-user inboxes.
    pub async fn process(
        &self,
        req: &InboundHttpRequest,
        acting_user: Option<&str>,
    ) -> Result<PipelineOutcome, Rejection> {
        let trace_id = new_request_id();

        let activity = match parse_bounded(&req.body, &self.limits) {
            Ok(v) => v,
            Err(e @ InboxError::PayloadTooLarge { .. }) => {
                return Err(reject(Stage::StructurallyValid, e, trace_id, None))
            }
            Err(e) => {
                let request_id = self.capture_unparsed(req, &trace_id).await;
                return Err(reject(Stage::StructurallyValid, e, trace_id, request_id));
            }
        };

        if let Err(e) = self.uris.check_activity(&activity) {
            return Err(reject(Stage::UriSafe, e, trace_id, None));
        }

        let classified = classify(&activity);
        let admission = match self.admission.admit(req, &classified).await {
            Ok(a) => a,
            Err(e) => return Err(reject(Stage::SignatureChecked, e, trace_id, None)),
        };
        let Some(source) = admission.source_instance() else {
            let e = InboxError::MalformedPayload("actor has no host".to_string());
            return Err(reject(Stage::SignatureChecked, e, trace_id, None));
        };

        if let Err(e) = self.guard.check(&classified, &admission, &source).await {
            return Err(reject(Stage::QuotaChecked, e, trace_id, None));
        }

        match self.blocks.should_admit(&source, acting_user).await {
            Ok(true) => {}
            Ok(false) => {
                info!(trace_id = %trace_id, source = %source, actor = admission.actor(), "activity from blocked domain discarded");
                return Ok(PipelineOutcome::Discarded { trace_id, source });
            }
            Err(e) => {
                let e = InboxError::StoreUnavailable(format!("{e:#}"));
                return Err(reject(Stage::NotBlocked, e, trace_id, None));
            }
        }

        let request_id = match self.audit.record(NewInboundRequest::from_http(req, Some(&activity))).await {
            Ok(id) => id,
            Err(e) => {
                let e = InboxError::StoreUnavailable(format!("{e:#}"));
                return Err(reject(Stage::Audited, e, trace_id, None));
            }
        };

        self.dispatch_detached(trace_id, request_id, activity, admission).await
    }

    async fn dispatch_detached(
        &self,
        trace_id: String,
        request_id: String,
        activity: Value,
        admission: Admission,
    ) -> Result<PipelineOutcome, Rejection> {
        let dispatcher = self.dispatcher.clone();
        let task = tokio::spawn({
            let request_id = request_id.clone();
            let admission = admission.clone();
            async move {
                let classified = classify(&activity);
                dispatcher.dispatch(&request_id, &classified, activity, &admission).await
            }
        });
        let result = match task.await {
            Ok(r) => r,
            Err(e) => Err(InboxError::DispatchUnavailable(format!("dispatch task failed: {e}"))),
        };
        match result {
            Ok(d) => {
                info!(
                    trace_id = %trace_id,
                    request_id = %request_id,
                    handler = %d.handler,
                    job_id = %d.job_id,
                    trust = admission.trust().as_str(),
                    actor = admission.actor(),
                    duplicate = d.duplicate,
                    "activity dispatched"
                );
                Ok(PipelineOutcome::Dispatched {
                    request_id,
                    job_id: d.job_id,
                    handler: d.handler,
                    trust: admission.trust(),
                    duplicate: d.duplicate,
                })
            }
            Err(e) => Err(reject(Stage::Dispatched, e, trace_id, Some(request_id))),
        }
    }

    /// Audit capture for bodies that never parsed. Failure here is logged and
    /// the original rejection still goes out.
    async fn capture_unparsed(&self, req: &InboundHttpRequest, trace_id: &str) -> Option<String> {
        match self.audit.record(NewInboundRequest::from_http(req, None)).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(trace_id, "audit capture of rejected body failed: {e:#}");
                None
            }
        }
    }
}

/// Builds a rejection and logs it. Acknowledged drops log at info, store and
/// queue outages at error.
pub fn reject(stage: Stage, error: InboxError, trace_id: String, request_id: Option<String>) -> Rejection {
    let rid = request_id.as_deref().unwrap_or("");
    if error.is_acknowledged() {
        info!(trace_id = %trace_id, request_id = rid, stage = %stage, code = error.code(), "activity dropped: {error}");
    } else if error.is_transient() {
        error!(trace_id = %trace_id, request_id = rid, stage = %stage, code = error.code(), "activity rejected: {error}");
    } else {
        warn!(trace_id = %trace_id, request_id = rid, stage = %stage, code = error.code(), "activity rejected: {error}");
    }
    Rejection {
        stage,
        error,
        trace_id,
        request_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abuse_guard::announce_set;
    use crate::audit::SqliteAuditStore;
    use crate::counters::SqliteCounterStore;
    use crate::domain_blocks::{BlockScope, DomainBlockService};
    use crate::http_sig::test_keys::{keypair, signed_request, unsigned_request, StaticKeyResolver};
    use crate::retry::RetryPolicy;
    use crate::store::InboxDb;
    use crate::task_queue::SqliteTaskQueue;
    use serde_json::json;
    use std::time::Duration;

    const KEY_ID: &str = "https://remote.example/users/alice#main-key";
    const ACTOR: &str = "https://remote.example/users/alice";

    struct Harness {
        _dir: tempfile::TempDir,
        pipeline: Arc<InboxPipeline>,
        audit: Arc<SqliteAuditStore>,
        counters: Arc<SqliteCounterStore>,
        queue: Arc<SqliteTaskQueue>,
        blocks: Arc<DomainBlocks>,
    }

    fn harness(cfg: InboxConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = InboxDb::open(dir.path().join("inbox.db")).unwrap();
        let audit = Arc::new(SqliteAuditStore::new(
            db.clone(),
            RetryPolicy {
                attempts: 2,
                base_backoff: Duration::from_millis(1),
                attempt_timeout: Duration::from_secs(5),
            },
        ));
        let counters = Arc::new(SqliteCounterStore::new(db.clone(), cfg.quota_window));
        let queue = Arc::new(SqliteTaskQueue::open(dir.path().join("inbox.db")).unwrap());
        let blocks = Arc::new(DomainBlocks::new(&cfg, db.clone()));
        let pipeline = Arc::new(InboxPipeline::new(
            &cfg,
            PipelineParts {
                resolver: Arc::new(StaticKeyResolver::with_key(KEY_ID, ACTOR, &keypair().1)),
                counters: counters.clone(),
                blocks: blocks.clone(),
                audit: audit.clone(),
                queue: queue.clone(),
            },
        ));
        Harness {
            _dir: dir,
            pipeline,
            audit,
            counters,
            queue,
            blocks,
        }
    }

    fn open_cfg() -> InboxConfig {
        InboxConfig {
            require_signatures: false,
            allow_unsigned_activities: true,
            ..InboxConfig::default()
        }
    }

    #[tokio::test]
    async fn signed_announce_reaches_dispatch() {
        let h = harness(InboxConfig::default());
        let object = "https://other.example/notes/1";
        let body = serde_json::to_vec(&json!({
            "id": "https://remote.example/activities/1",
            "type": "Announce",
            "actor": ACTOR,
            "object": object,
        }))
        .unwrap();
        let out = h.pipeline.process(&signed_request("/inbox", KEY_ID, &body), None).await.unwrap();

        let PipelineOutcome::Dispatched { request_id, handler, trust, duplicate, .. } = out else {
            panic!("expected dispatch, got {out:?}");
        };
        assert_eq!(handler, HandlerKind::Announce);
        assert_eq!(trust, TrustLevel::Verified);
        assert!(!duplicate);
        assert_eq!(h.audit.count().await.unwrap(), 1);
        assert_eq!(h.audit.get(&request_id).await.unwrap().unwrap().raw_body, body);
        assert_eq!(h.counters.distinct_count(&announce_set(object)).await.unwrap(), 1);
        assert_eq!(h.queue.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn malformed_body_is_audited_then_rejected() {
        let h = harness(InboxConfig::default());
        let err = h.pipeline.process(&unsigned_request("/inbox", b"{\"type\":"), None).await.unwrap_err();
        assert_eq!(err.stage, Stage::StructurallyValid);
        assert!(matches!(err.error, InboxError::MalformedPayload(_)));

        let id = err.request_id.clone().unwrap();
        assert_eq!(err.correlation_id(), id);
        let rec = h.audit.get(&id).await.unwrap().unwrap();
        assert_eq!(rec.raw_body, b"{\"type\":");
        assert!(rec.parsed_body.is_none());
    }

    #[tokio::test]
    async fn complex_body_gets_raw_capture_only() {
        let h = harness(InboxConfig { max_json_depth: 4, ..InboxConfig::default() });
        let body = br#"{"a":{"b":{"c":{"d":{"e":1}}}}}"#;
        let err = h.pipeline.process(&unsigned_request("/inbox", body), None).await.unwrap_err();
        assert!(matches!(err.error, InboxError::PayloadTooComplex(_)));
        assert_eq!(h.audit.count().await.unwrap(), 1);
        assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn oversized_body_is_not_audited() {
        let h = harness(InboxConfig { max_json_size: 16, ..InboxConfig::default() });
        let body = br#"{"type":"Like","object":"https://x.example/1"}"#;
        let err = h.pipeline.process(&unsigned_request("/inbox", body), None).await.unwrap_err();
        assert!(matches!(err.error, InboxError::PayloadTooLarge { .. }));
        assert!(err.request_id.is_none());
        assert_eq!(h.audit.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unsafe_uri_stops_before_signature_check() {
        let h = harness(InboxConfig::default());
        let body = serde_json::to_vec(&json!({
            "type": "Create",
            "actor": ACTOR,
            "object": {"type": "Note", "url": "http://169.254.169.254/latest/meta-data"},
        }))
        .unwrap();
        let err = h.pipeline.process(&unsigned_request("/inbox", &body), None).await.unwrap_err();
        assert_eq!(err.stage, Stage::UriSafe);
        assert_eq!(err.error.code(), "unsafe_uri");
        assert_eq!(h.audit.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unsigned_activity_is_rejected_by_default() {
        let h = harness(InboxConfig::default());
        let body = serde_json::to_vec(&json!({"type": "Like", "actor": ACTOR, "object": "https://local.example/p/1"})).unwrap();
        let err = h.pipeline.process(&unsigned_request("/inbox", &body), None).await.unwrap_err();
        assert_eq!(err.stage, Stage::SignatureChecked);
        assert!(matches!(err.error, InboxError::UnauthorizedActivity));
    }

    #[tokio::test]
    async fn unsigned_activity_is_dispatched_unverified_when_allowed() {
        let h = harness(open_cfg());
        let body = serde_json::to_vec(&json!({"type": "Like", "actor": ACTOR, "object": "https://local.example/p/1"})).unwrap();
        let out = h.pipeline.process(&unsigned_request("/inbox", &body), None).await.unwrap();
        assert!(matches!(
            out,
            PipelineOutcome::Dispatched { trust: TrustLevel::Unverified, handler: HandlerKind::Vote, .. }
        ));
    }

    #[tokio::test]
    async fn blocked_domain_is_discarded_before_audit() {
        let h = harness(open_cfg());
        h.blocks.block("*.remote.example", &BlockScope::Instance).await.unwrap();
        let body = serde_json::to_vec(&json!({"type": "Follow", "actor": ACTOR, "object": "https://local.example/u/bob"})).unwrap();
        let out = h.pipeline.process(&unsigned_request("/inbox", &body), None).await.unwrap();
        assert!(matches!(out, PipelineOutcome::Discarded { ref source, .. } if source == "remote.example"));
        assert_eq!(h.audit.count().await.unwrap(), 0);
        assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn user_block_applies_only_to_that_inbox() {
        let h = harness(open_cfg());
        h.blocks.block("remote.example", &BlockScope::User("bob".into())).await.unwrap();
        let body = serde_json::to_vec(&json!({"type": "Follow", "actor": ACTOR, "object": "https://local.example/u/bob"})).unwrap();
        let req = unsigned_request("/users/bob/inbox", &body);
        assert!(matches!(
            h.pipeline.process(&req, Some("bob")).await.unwrap(),
            PipelineOutcome::Discarded { .. }
        ));
        assert!(matches!(
            h.pipeline.process(&req, Some("carol")).await.unwrap(),
            PipelineOutcome::Dispatched { .. }
        ));
    }

    #[tokio::test]
    async fn unsupported_type_is_audited_and_acknowledged() {
        let h = harness(open_cfg());
        let body = serde_json::to_vec(&json!({"type": "Listen", "actor": ACTOR, "object": "https://music.example/t/1"})).unwrap();
        let err = h.pipeline.process(&unsigned_request("/inbox", &body), None).await.unwrap_err();
        assert_eq!(err.stage, Stage::Dispatched);
        assert!(err.error.is_acknowledged());
        assert!(err.request_id.is_some());
        assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_new_actors_respect_instance_ceiling() {
        let h = harness(InboxConfig { actors_per_instance_hour: 5, ..open_cfg() });
        let mut set = tokio::task::JoinSet::new();
        for i in 0..8 {
            let pipeline = h.pipeline.clone();
            set.spawn(async move {
                let body = serde_json::to_vec(&json!({
                    "type": "Follow",
                    "actor": format!("https://remote.example/users/u{i}"),
                    "object": "https://local.example/u/bob",
                }))
                .unwrap();
                let req = unsigned_request("/inbox", &body);
                pipeline.process(&req, None).await
            });
        }
        let (mut ok, mut quota) = (0, 0);
        while let Some(res) = set.join_next().await {
            match res.unwrap() {
                Ok(PipelineOutcome::Dispatched { .. }) => ok += 1,
                Err(r) if matches!(r.error, InboxError::ActorQuotaExceeded(_)) => {
                    assert_eq!(r.stage, Stage::QuotaChecked);
                    quota += 1
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!((ok, quota), (5, 3));
        assert_eq!(h.audit.count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn replayed_activity_is_a_duplicate_dispatch() {
        let h = harness(open_cfg());
        let body = serde_json::to_vec(&json!({
            "id": "https://remote.example/follows/7",
            "type": "Follow",
            "actor": ACTOR,
            "object": "https://local.example/u/bob",
        }))
        .unwrap();
        let req = unsigned_request("/inbox", &body);
        h.pipeline.process(&req, None).await.unwrap();
        let again = h.pipeline.process(&req, None).await.unwrap();
        assert!(matches!(again, PipelineOutcome::Dispatched { duplicate: true, .. }));
        assert_eq!(h.audit.count().await.unwrap(), 2);
        assert_eq!(h.queue.pending_count().await.unwrap(), 1);
    }
}
