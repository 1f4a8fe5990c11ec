/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::admission::Admission;
use crate::classify::{activity_dedup_id, ActivityKind, ClassifiedActivity, HandlerKind};
use crate::config::InboxConfig;
use crate::error::InboxError;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::task_queue::{Ack, TaskQueue};
use fedigate_protocol::InboxTask;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub job_id: String,
    pub handler: HandlerKind,
    pub duplicate: bool,
}

pub struct Dispatcher {
    queue: Arc<dyn TaskQueue>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(cfg: &InboxConfig, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            queue,
            retry: RetryPolicy {
                attempts: cfg.dispatch_attempts,
                base_backoff: Duration::from_millis(cfg.dispatch_base_backoff_ms),
                attempt_timeout: cfg.store_timeout(),
            },
        }
    }

    pub fn route(kind: &ActivityKind) -> Result<HandlerKind, InboxError> {
        kind.handler()
            .ok_or_else(|| InboxError::UnsupportedActivityType(kind.to_string()))
    }

    /// Enqueues the activity for its handler. A replayed activity is reported
    /// as a duplicate rather than an error.
    pub async fn dispatch(
        &self,
        request_id: &str,
        classified: &ClassifiedActivity,
        activity: Value,
        admission: &Admission,
    ) -> Result<Dispatched, InboxError> {
        let handler = Self::route(&classified.kind)?;
        let task = InboxTask {
            request_id: request_id.to_string(),
            handler: handler.as_str().to_string(),
            dedup_id: activity_dedup_id(&activity, admission.verified_actor()),
            trust: admission.trust(),
            actor: Some(admission.actor().to_string()),
            key_id: admission.key_id().map(|s| s.to_string()),
            activity,
        };

        let ack = retry_with_backoff(self.retry, "enqueue", || {
            let queue = self.queue.clone();
            let task = task.clone();
            async move { queue.enqueue(handler, task).await }
        })
        .await
        .map_err(|e| InboxError::DispatchUnavailable(format!("{e:#}")))?;

        debug!(request_id, handler = %handler, job_id = ack.job_id(), "activity enqueued");
        Ok(match ack {
            Ack::Enqueued { job_id } => Dispatched {
                job_id,
                handler,
                duplicate: false,
            },
            Ack::Duplicate { job_id } => Dispatched {
                job_id,
                handler,
                duplicate: true,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use crate::task_queue::SqliteTaskQueue;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyQueue {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl TaskQueue for FlakyQueue {
        async fn enqueue(&self, _handler: HandlerKind, task: InboxTask) -> anyhow::Result<Ack> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                return Err(anyhow!("queue offline"));
            }
            Ok(Ack::Enqueued { job_id: format!("job-for-{}", task.request_id) })
        }
    }

    fn cfg() -> InboxConfig {
        InboxConfig {
            dispatch_attempts: 3,
            dispatch_base_backoff_ms: 1,
            ..InboxConfig::default()
        }
    }

    fn verified() -> Admission {
        Admission::Verified {
            actor: "https://remote.example/users/a".to_string(),
            key_id: "https://remote.example/users/a#main-key".to_string(),
        }
    }

    #[tokio::test]
    async fn retries_transient_enqueue_failures() {
        let queue = Arc::new(FlakyQueue { calls: AtomicU32::new(0), fail_first: 2 });
        let d = Dispatcher::new(&cfg(), queue.clone());
        let activity = json!({"type": "Like", "id": "https://remote.example/likes/1", "object": "https://local.example/p/1"});
        let out = d.dispatch("req-9", &classify(&activity), activity, &verified()).await.unwrap();
        assert_eq!(out.handler, HandlerKind::Vote);
        assert_eq!(out.job_id, "job-for-req-9");
        assert_eq!(queue.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_failure_is_dispatch_unavailable() {
        let queue = Arc::new(FlakyQueue { calls: AtomicU32::new(0), fail_first: u32::MAX });
        let d = Dispatcher::new(&cfg(), queue.clone());
        let activity = json!({"type": "Follow", "object": "https://local.example/u/b"});
        let err = d.dispatch("req-1", &classify(&activity), activity, &verified()).await.unwrap_err();
        assert!(matches!(err, InboxError::DispatchUnavailable(_)));
        assert_eq!(queue.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unsupported_kind_never_reaches_the_queue() {
        let queue = Arc::new(FlakyQueue { calls: AtomicU32::new(0), fail_first: 0 });
        let d = Dispatcher::new(&cfg(), queue.clone());
        let activity = json!({"type": "Listen", "actor": "https://remote.example/users/a"});
        let err = d.dispatch("req-2", &classify(&activity), activity, &verified()).await.unwrap_err();
        assert!(matches!(err, InboxError::UnsupportedActivityType(ref t) if t == "Listen"));
        assert!(err.is_acknowledged());
        assert_eq!(queue.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn replay_is_dispatched_as_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(SqliteTaskQueue::open(dir.path().join("q.db")).unwrap());
        let d = Dispatcher::new(&cfg(), queue.clone());
        let unverified = Admission::Unverified { actor: "https://remote.example/users/a".to_string() };
        // no id: dedup falls back to the body hash
        let activity = json!({"type": "Announce", "actor": "https://remote.example/users/a", "object": "https://x.example/n/1"});

        let first = d.dispatch("req-a", &classify(&activity), activity.clone(), &unverified).await.unwrap();
        let second = d.dispatch("req-b", &classify(&activity), activity, &unverified).await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.job_id, second.job_id);

        let job = queue.job(&first.job_id).await.unwrap().unwrap();
        assert!(job.dedup_id.starts_with("urn:fedigate:inbox:"));
        assert_eq!(job.handler, "announce");
    }

    #[tokio::test]
    async fn foreign_sender_cannot_preempt_an_origin_id() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(SqliteTaskQueue::open(dir.path().join("q.db")).unwrap());
        let d = Dispatcher::new(&cfg(), queue.clone());
        let signed_by = |actor: &str| Admission::Verified {
            actor: actor.to_string(),
            key_id: format!("{actor}#main-key"),
        };
        let evil = "https://evil.example/users/e";
        let victim = "https://victim.example/users/v";
        let forged = json!({"type": "Follow", "id": "https://victim.example/activities/1", "actor": evil, "object": "https://local.example/u/b"});
        let real = json!({"type": "Follow", "id": "https://victim.example/activities/1", "actor": victim, "object": "https://local.example/u/b"});

        let first = d.dispatch("req-e", &classify(&forged), forged, &signed_by(evil)).await.unwrap();
        let second = d.dispatch("req-v", &classify(&real), real, &signed_by(victim)).await.unwrap();
        assert!(!first.duplicate);
        assert!(!second.duplicate);
        assert_ne!(first.job_id, second.job_id);
        assert_eq!(queue.pending_count().await.unwrap(), 2);

        let job = queue.job(&second.job_id).await.unwrap().unwrap();
        assert_eq!(job.dedup_id, "https://victim.example/activities/1");
    }
}
