/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::classify::HandlerKind;
use crate::config::WorkerSettings;
use crate::store::now_ms;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use fedigate_protocol::InboxTask;
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

const STATUS_PENDING: i64 = 0;
const STATUS_DONE: i64 = 1;
const STATUS_DEAD: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Enqueued { job_id: String },
    /// A job with the same dedup id already exists.
    Duplicate { job_id: String },
}

impl Ack {
    pub fn job_id(&self) -> &str {
        match self {
            Ack::Enqueued { job_id } | Ack::Duplicate { job_id } => job_id,
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, handler: HandlerKind, task: InboxTask) -> Result<Ack>;
}

/// Executes one kind of queued activity.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn handle(&self, task: &InboxTask) -> Result<()>;
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKind, Arc<dyn ActivityHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: HandlerKind, handler: Arc<dyn ActivityHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: HandlerKind) -> Option<&Arc<dyn ActivityHandler>> {
        self.handlers.get(&kind)
    }
}

/// Logs each task. Stands in until real handlers are registered.
pub struct LoggingHandler;

#[async_trait]
impl ActivityHandler for LoggingHandler {
    async fn handle(&self, task: &InboxTask) -> Result<()> {
        info!(
            request_id = %task.request_id,
            handler = %task.handler,
            dedup_id = %task.dedup_id,
            trust = ?task.trust,
            actor = task.actor.as_deref().unwrap_or(""),
            "inbox task handled"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Done,
    Dead,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub handler: String,
    pub dedup_id: String,
    pub status: JobStatus,
    pub attempt: u32,
    pub last_error: Option<String>,
}

struct Job {
    id: String,
    handler: String,
    attempt: u32,
    payload: Vec<u8>,
}

/// Durable job queue in SQLite.
#[derive(Clone)]
pub struct SqliteTaskQueue {
    db_path: PathBuf,
    notify: Arc<Notify>,
}

impl SqliteTaskQueue {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        init_db(&db_path)?;
        Ok(Self {
            db_path,
            notify: Arc::new(Notify::new()),
        })
    }

    pub fn start_worker(
        &self,
        shutdown: watch::Receiver<bool>,
        registry: HandlerRegistry,
        settings: WorkerSettings,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.run_loop(shutdown, registry, settings).await {
                warn!("inbox worker stopped: {e:#}");
            }
        })
    }

    async fn run_loop(
        &self,
        mut shutdown: watch::Receiver<bool>,
        registry: HandlerRegistry,
        settings: WorkerSettings,
    ) -> Result<()> {
        info!("inbox queue db: {}", self.db_path.display());
        let tick = Duration::from_secs(2);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let processed = match self.process_due(&registry, &settings).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("inbox worker pass failed: {e:#}");
                    0
                }
            };
            if processed == 0 {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        Ok(())
    }

    /// Claims and runs one batch of due jobs. Returns how many were claimed.
    pub async fn process_due(&self, registry: &HandlerRegistry, settings: &WorkerSettings) -> Result<usize> {
        let jobs = self
            .claim_due_jobs(settings.batch_size.max(1), Duration::from_secs(settings.lease_secs.max(1)))
            .await?;
        let n = jobs.len();
        for job in jobs {
            self.process_one(registry, settings, job).await?;
        }
        Ok(n)
    }

    async fn process_one(&self, registry: &HandlerRegistry, settings: &WorkerSettings, job: Job) -> Result<()> {
        let Some(kind) = HandlerKind::parse(&job.handler) else {
            return self.mark_dead(&job.id, &format!("unknown handler kind: {}", job.handler)).await;
        };
        let Some(handler) = registry.get(kind) else {
            return self.mark_dead(&job.id, &format!("no handler registered for {kind}")).await;
        };
        let task: InboxTask = match serde_json::from_slice(&job.payload) {
            Ok(t) => t,
            Err(e) => return self.mark_dead(&job.id, &format!("bad payload: {e}")).await,
        };

        let attempt_no = job.attempt.saturating_add(1);
        match handler.handle(&task).await {
            Ok(()) => {
                debug!(job_id = %job.id, handler = %kind, "inbox job done");
                self.mark_done(&job.id).await
            }
            Err(e) => {
                let err = format!("{e:#}");
                if attempt_no >= settings.max_attempts.max(1) {
                    warn!(job_id = %job.id, handler = %kind, attempt = attempt_no, "inbox job dead: {err}");
                    self.mark_dead(&job.id, &err).await
                } else {
                    let delay = next_backoff(attempt_no, settings.base_backoff_secs, settings.max_backoff_secs);
                    debug!(job_id = %job.id, attempt = attempt_no, delay_ms = delay.as_millis() as u64, "inbox job rescheduled");
                    self.reschedule(&job.id, attempt_no, delay, &err).await
                }
            }
        }
    }

    async fn claim_due_jobs(&self, limit: u32, lease: Duration) -> Result<Vec<Job>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Vec<Job>> {
                let mut conn = open_conn(&db_path)?;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let now = now_ms();
                let mut out = Vec::new();
                {
                    let mut stmt = tx.prepare(
                        r#"
                        SELECT id, handler, attempt, payload
                        FROM inbox_jobs
                        WHERE status = ?1 AND next_attempt_at_ms <= ?2
                        ORDER BY next_attempt_at_ms ASC
                        LIMIT ?3
                        "#,
                    )?;
                    let mut rows = stmt.query(params![STATUS_PENDING, now, limit])?;
                    while let Some(row) = rows.next()? {
                        out.push(Job {
                            id: row.get(0)?,
                            handler: row.get(1)?,
                            attempt: row.get(2)?,
                            payload: row.get(3)?,
                        });
                    }
                }
                // a crashed worker's jobs come back once the lease runs out
                let lease_until = now.saturating_add(lease.as_millis() as i64);
                for job in &out {
                    tx.execute(
                        "UPDATE inbox_jobs SET next_attempt_at_ms = ?2 WHERE id = ?1",
                        params![job.id, lease_until],
                    )?;
                }
                tx.commit()?;
                Ok(out)
            }
        })
        .await?
    }

    async fn mark_done(&self, id: &str) -> Result<()> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            move || -> Result<()> {
                let conn = open_conn(&db_path)?;
                conn.execute(
                    "UPDATE inbox_jobs SET status = ?2, last_error = NULL, finished_at_ms = ?3 WHERE id = ?1",
                    params![id, STATUS_DONE, now_ms()],
                )?;
                Ok(())
            }
        })
        .await?
    }

    async fn mark_dead(&self, id: &str, err: &str) -> Result<()> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            let err = err.to_string();
            move || -> Result<()> {
                let conn = open_conn(&db_path)?;
                conn.execute(
                    "UPDATE inbox_jobs SET status = ?2, last_error = ?3, finished_at_ms = ?4 WHERE id = ?1",
                    params![id, STATUS_DEAD, err, now_ms()],
                )?;
                Ok(())
            }
        })
        .await?
    }

    async fn reschedule(&self, id: &str, attempt: u32, delay: Duration, err: &str) -> Result<()> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            let err = err.to_string();
            move || -> Result<()> {
                let conn = open_conn(&db_path)?;
                let next = now_ms().saturating_add(delay.as_millis() as i64);
                conn.execute(
                    "UPDATE inbox_jobs SET attempt = ?2, next_attempt_at_ms = ?3, last_error = ?4 WHERE id = ?1",
                    params![id, attempt, next, err],
                )?;
                Ok(())
            }
        })
        .await?
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let job_id = job_id.to_string();
            move || -> Result<Option<JobRecord>> {
                let conn = open_conn(&db_path)?;
                let row = conn
                    .query_row(
                        "SELECT id, handler, dedup_id, status, attempt, last_error FROM inbox_jobs WHERE id = ?1",
                        params![job_id],
                        |r| {
                            Ok((
                                r.get::<_, String>(0)?,
                                r.get::<_, String>(1)?,
                                r.get::<_, String>(2)?,
                                r.get::<_, i64>(3)?,
                                r.get::<_, u32>(4)?,
                                r.get::<_, Option<String>>(5)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(row.map(|(id, handler, dedup_id, status, attempt, last_error)| JobRecord {
                    id,
                    handler,
                    dedup_id,
                    status: match status {
                        STATUS_DONE => JobStatus::Done,
                        STATUS_DEAD => JobStatus::Dead,
                        _ => JobStatus::Pending,
                    },
                    attempt,
                    last_error,
                }))
            }
        })
        .await?
    }

    /// Retention hook: deletes done and dead jobs that finished before
    /// `cutoff_ms`. A pruned row no longer blocks a replay of the same
    /// activity, so keep rows at least as long as remote servers keep
    /// retrying deliveries. Pending jobs are never touched.
    pub async fn prune_finished_before(&self, cutoff_ms: i64) -> Result<u64> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<u64> {
                let conn = open_conn(&db_path)?;
                let n = conn.execute(
                    "DELETE FROM inbox_jobs WHERE status IN (?1, ?2) AND finished_at_ms < ?3",
                    params![STATUS_DONE, STATUS_DEAD, cutoff_ms],
                )?;
                Ok(n as u64)
            }
        })
        .await?
    }

    pub async fn pending_count(&self) -> Result<u64> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<u64> {
                let conn = open_conn(&db_path)?;
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM inbox_jobs WHERE status = ?1",
                    params![STATUS_PENDING],
                    |r| r.get(0),
                )?;
                Ok(n.max(0) as u64)
            }
        })
        .await?
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn enqueue(&self, handler: HandlerKind, task: InboxTask) -> Result<Ack> {
        if task.dedup_id.trim().is_empty() {
            return Err(anyhow!("inbox task without dedup id"));
        }
        let payload = serde_json::to_vec(&task).context("encode inbox task")?;
        let ack = tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Ack> {
                let conn = open_conn(&db_path)?;
                let now = now_ms();
                let job_id = new_job_id();
                let inserted = conn.execute(
                    r#"
                    INSERT OR IGNORE INTO inbox_jobs (
                      id, created_at_ms, next_attempt_at_ms, attempt, status, handler, request_id, dedup_id, trust, payload, last_error
                    ) VALUES (?1, ?2, ?2, 0, ?3, ?4, ?5, ?6, ?7, ?8, NULL)
                    "#,
                    params![
                        job_id,
                        now,
                        STATUS_PENDING,
                        handler.as_str(),
                        task.request_id,
                        task.dedup_id,
                        task.trust.as_str(),
                        payload
                    ],
                )?;
                if inserted > 0 {
                    return Ok(Ack::Enqueued { job_id });
                }
                let existing: String = conn.query_row(
                    "SELECT id FROM inbox_jobs WHERE dedup_id = ?1",
                    params![task.dedup_id],
                    |r| r.get(0),
                )?;
                Ok(Ack::Duplicate { job_id: existing })
            }
        })
        .await??;

        if matches!(ack, Ack::Enqueued { .. }) {
            self.notify.notify_one();
        }
        Ok(ack)
    }
}

fn open_conn(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

fn init_db(path: &Path) -> Result<()> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS inbox_jobs (
          id TEXT PRIMARY KEY,
          created_at_ms INTEGER NOT NULL,
          next_attempt_at_ms INTEGER NOT NULL,
          attempt INTEGER NOT NULL,
          status INTEGER NOT NULL,
          handler TEXT NOT NULL,
          request_id TEXT NOT NULL,
          dedup_id TEXT NOT NULL UNIQUE,
          trust TEXT NOT NULL,
          payload BLOB NOT NULL,
          last_error TEXT NULL,
          finished_at_ms INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS idx_inbox_jobs_due ON inbox_jobs(status, next_attempt_at_ms);
        "#,
    )?;
    Ok(())
}

fn new_job_id() -> String {
    // 16 random bytes -> 32 hex chars
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    hex::encode(b)
}

fn next_backoff(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let secs = base_secs.saturating_mul(1u64 << pow).min(max_secs);
    // jitter 0..1000ms
    let mut b = [0u8; 2];
    OsRng.fill_bytes(&mut b);
    let jitter_ms = u16::from_le_bytes(b) as u64 % 1000;
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}
