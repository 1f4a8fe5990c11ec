/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::audit::SqliteAuditStore;
use crate::classify::HandlerKind;
use crate::config::{CounterBackend, InboxConfig};
use crate::counters::{CounterStore, RedisCounterStore, SqliteCounterStore};
use crate::domain_blocks::DomainBlocks;
use crate::http_sig::HttpKeyResolver;
use crate::pipeline::{InboxPipeline, PipelineParts};
use crate::retry::RetryPolicy;
use crate::server::{router, AppState};
use crate::store::InboxDb;
use crate::task_queue::{HandlerRegistry, LoggingHandler, SqliteTaskQueue};
use anyhow::{Context, Result};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).try_init().ok();
}

/// The wired-up service: the HTTP router plus the background queue worker.
pub struct InboxService {
    pub router: Router,
    pub worker: JoinHandle<()>,
}

/// Opens the stores and builds every stage from `cfg`. The worker stops when
/// `shutdown` flips to `true`.
pub async fn build(cfg: &InboxConfig, shutdown: watch::Receiver<bool>) -> Result<InboxService> {
    let data_dir = cfg.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("create data dir: {}", data_dir.display()))?;
    let db = InboxDb::open(cfg.db_path())?;
    info!("inbox db: {}", db.path().display());

    let counters: Arc<dyn CounterStore> = match cfg.counter_backend {
        CounterBackend::Sqlite => Arc::new(SqliteCounterStore::new(db.clone(), cfg.quota_window)),
        CounterBackend::Redis => {
            let url = cfg.redis_url.as_deref().context("redis_url missing")?;
            let store = RedisCounterStore::connect(url, &cfg.redis_prefix, cfg.quota_window).await?;
            info!(prefix = %cfg.redis_prefix, "quota counters in redis");
            Arc::new(store)
        }
    };

    let audit = Arc::new(SqliteAuditStore::new(
        db.clone(),
        RetryPolicy {
            attempts: cfg.store_attempts,
            base_backoff: Duration::from_millis(100),
            attempt_timeout: cfg.store_timeout(),
        },
    ));
    let queue = Arc::new(SqliteTaskQueue::open(cfg.db_path())?);

    let mut registry = HandlerRegistry::new();
    for kind in HandlerKind::ALL {
        registry.register(kind, Arc::new(LoggingHandler));
    }
    let worker = queue.start_worker(shutdown, registry, cfg.worker.clone());

    let pipeline = Arc::new(InboxPipeline::new(
        cfg,
        PipelineParts {
            resolver: Arc::new(HttpKeyResolver::new(cfg.key_fetch_timeout())?),
            counters,
            blocks: Arc::new(DomainBlocks::new(cfg, db.clone())),
            audit,
            queue,
        },
    ));

    Ok(InboxService {
        router: router(AppState::new(cfg, pipeline, db)),
        worker,
    })
}

/// Serves until ctrl-c, then drains the worker.
pub async fn run(cfg: InboxConfig) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = build(&cfg, shutdown_rx).await?;

    let addr: SocketAddr = cfg.bind.parse().context("parse bind")?;
    let listener = tokio::net::TcpListener::bind(addr).await.context("bind")?;
    info!("fedigate listening on http://{addr}");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler failed: {e}");
        }
        info!("shutdown requested");
    };
    let served = axum::serve(
        listener,
        service.router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = service.worker.await {
        warn!("inbox worker join failed: {e}");
    }
    served.context("serve")
}
