/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::admission::Admission;
use crate::classify::{ActivityKind, ClassifiedActivity};
use crate::config::InboxConfig;
use crate::counters::{ActorClaim, CounterStore, DistinctOutcome, QuotaKey};
use crate::error::InboxError;
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone)]
pub struct GuardLimits {
    pub actors_per_instance_hour: u32,
    pub actors_per_instance_day: u32,
    pub total_actors_per_hour: u32,
    pub max_announces_per_object: u32,
    pub vote_rate_limit_per_actor: u32,
    pub vote_rate_window: Duration,
}

impl GuardLimits {
    pub fn from_config(cfg: &InboxConfig) -> Self {
        Self {
            actors_per_instance_hour: cfg.actors_per_instance_hour,
            actors_per_instance_day: cfg.actors_per_instance_day,
            total_actors_per_hour: cfg.total_actors_per_hour,
            max_announces_per_object: cfg.max_announces_per_object,
            vote_rate_limit_per_actor: cfg.vote_rate_limit_per_actor,
            vote_rate_window: Duration::from_secs(cfg.vote_rate_window_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardReport {
    pub new_actors: u32,
    /// Distinct announcers of the target object after this activity.
    pub announce_count: Option<u32>,
    pub vote_counted: bool,
}

pub struct AbuseGuard {
    counters: Arc<dyn CounterStore>,
    limits: GuardLimits,
    timeout: Duration,
}

impl AbuseGuard {
    pub fn new(cfg: &InboxConfig, counters: Arc<dyn CounterStore>) -> Self {
        Self {
            counters,
            limits: GuardLimits::from_config(cfg),
            timeout: cfg.store_timeout(),
        }
    }

    pub fn counters(&self) -> &Arc<dyn CounterStore> {
        &self.counters
    }

    pub async fn check(
        &self,
        activity: &ClassifiedActivity,
        admission: &Admission,
        source_instance: &str,
    ) -> Result<GuardReport, InboxError> {
        let mut report = GuardReport::default();
        if matches!(activity.kind, ActivityKind::Unsupported(_)) {
            return Ok(report);
        }

        let candidates = activity.actor_candidates();
        if !candidates.is_empty() {
            report.new_actors = self.admit_new_actors(&candidates, source_instance).await?;
        }

        let actor = admission.actor();
        match &activity.kind {
            ActivityKind::Announce => {
                let Some(object) = activity.object_id.as_deref() else {
                    debug!(actor, "announce without object id, flood check skipped");
                    return Ok(report);
                };
                let set = announce_set(object);
                let outcome = self
                    .io(self.counters.add_distinct(&set, actor, self.limits.max_announces_per_object))
                    .await?;
                match outcome {
                    DistinctOutcome::Added(n) | DistinctOutcome::AlreadyCounted(n) => {
                        report.announce_count = Some(n)
                    }
                    DistinctOutcome::Full(n) => {
                        warn!(object, actor, count = n, "announce flood limit reached");
                        return Err(InboxError::RelayFlooded(object.to_string()));
                    }
                }
            }
            kind if kind.is_vote() => {
                let key = QuotaKey::new(
                    vote_bucket(actor),
                    self.limits.vote_rate_window,
                    self.limits.vote_rate_limit_per_actor,
                );
                if self.io(self.counters.try_acquire(&[key])).await?.is_some() {
                    return Err(InboxError::VoteRateExceeded(actor.to_string()));
                }
                report.vote_counted = true;
            }
            _ => {}
        }
        Ok(report)
    }

    async fn admit_new_actors(&self, candidates: &[String], source_instance: &str) -> Result<u32, InboxError> {
        let keys = [
            QuotaKey::new(
                format!("actors:instance:{source_instance}:hour"),
                HOUR,
                self.limits.actors_per_instance_hour,
            ),
            QuotaKey::new(
                format!("actors:instance:{source_instance}:day"),
                DAY,
                self.limits.actors_per_instance_day,
            ),
            QuotaKey::new("actors:global:hour", HOUR, self.limits.total_actors_per_hour),
        ];
        match self
            .io(self.counters.claim_new_actors(source_instance, candidates, &keys))
            .await?
        {
            ActorClaim::Admitted(n) => {
                if n > 0 {
                    debug!(instance = source_instance, new_actors = n, "new remote actors admitted");
                }
                Ok(n)
            }
            ActorClaim::Exceeded(bucket) => {
                warn!(actors = ?candidates, instance = source_instance, bucket = %bucket, "actor creation quota exceeded");
                Err(InboxError::ActorQuotaExceeded(bucket))
            }
        }
    }

    async fn io<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T, InboxError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(InboxError::StoreUnavailable(format!("{e:#}"))),
            Err(_) => Err(InboxError::StoreUnavailable("counter store timed out".to_string())),
        }
    }
}

pub fn announce_set(object_id: &str) -> String {
    format!("announce:{object_id}")
}

fn vote_bucket(actor: &str) -> String {
    format!("votes:{actor}")
}
