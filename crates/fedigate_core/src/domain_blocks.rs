/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::InboxConfig;
use crate::error::InboxError;
use crate::store::InboxDb;
use crate::uri_safety::{domain_matches, host_from_url};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::info;

/// Bounds how long another replica's mutation can go unseen.
const CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockScope {
    Instance,
    User(String),
}

impl BlockScope {
    pub fn storage_key(&self) -> String {
        match self {
            BlockScope::Instance => "instance".to_string(),
            BlockScope::User(name) => format!("user:{name}"),
        }
    }
}

#[async_trait]
pub trait DomainBlockService: Send + Sync {
    async fn is_blocked(&self, domain: &str, scope: &BlockScope) -> Result<bool>;
    /// Returns the resulting state (`true`).
    async fn block(&self, domain: &str, scope: &BlockScope) -> Result<bool>;
    /// Returns the resulting state (`false`).
    async fn unblock(&self, domain: &str, scope: &BlockScope) -> Result<bool>;
}

struct CachedScope {
    patterns: Arc<Vec<String>>,
    loaded_at: Instant,
}

pub struct DomainBlocks {
    db: InboxDb,
    static_blocks: Vec<String>,
    cache: RwLock<HashMap<BlockScope, CachedScope>>,
}

impl DomainBlocks {
    pub fn new(cfg: &InboxConfig, db: InboxDb) -> Self {
        let static_blocks = cfg
            .blocked_domains
            .iter()
            .map(|d| d.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Self {
            db,
            static_blocks,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Instance-wide blocks always apply; `acting_user` adds that user's list.
    pub async fn should_admit(&self, source_domain: &str, acting_user: Option<&str>) -> Result<bool> {
        let host = source_domain.trim().trim_end_matches('.').to_ascii_lowercase();
        if self.static_blocks.iter().any(|p| domain_matches(&host, p)) {
            return Ok(false);
        }
        if self.is_blocked(&host, &BlockScope::Instance).await? {
            return Ok(false);
        }
        if let Some(user) = acting_user {
            if self.is_blocked(&host, &BlockScope::User(user.to_string())).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn set_blocked(&self, domain: &str, scope: &BlockScope, blocked: bool) -> Result<bool> {
        if blocked {
            self.block(domain, scope).await
        } else {
            self.unblock(domain, scope).await
        }
    }

    pub async fn list(&self, scope: &BlockScope) -> Result<Vec<String>> {
        Ok(self.patterns(scope).await?.as_ref().clone())
    }

    async fn patterns(&self, scope: &BlockScope) -> Result<Arc<Vec<String>>> {
        {
            let cache = self.cache.read().await;
            if let Some(hit) = cache.get(scope) {
                if hit.loaded_at.elapsed() < CACHE_TTL {
                    return Ok(hit.patterns.clone());
                }
            }
        }
        let db = self.db.clone();
        let key = scope.storage_key();
        let rows = tokio::task::spawn_blocking(move || db.list_domain_blocks(&key))
            .await
            .context("block list task panicked")??;
        let patterns = Arc::new(rows);
        self.cache.write().await.insert(
            scope.clone(),
            CachedScope {
                patterns: patterns.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(patterns)
    }

    async fn invalidate(&self, scope: &BlockScope) {
        self.cache.write().await.remove(scope);
    }

    async fn mutate(&self, domain: &str, scope: &BlockScope, block: bool) -> Result<bool> {
        let db = self.db.clone();
        let key = scope.storage_key();
        let domain_owned = domain.to_string();
        let changed = tokio::task::spawn_blocking(move || {
            if block {
                db.insert_domain_block(&key, &domain_owned)
            } else {
                db.delete_domain_block(&key, &domain_owned)
            }
        })
        .await
        .context("block update task panicked")??;
        if changed {
            self.invalidate(scope).await;
            info!(domain, scope = %scope.storage_key(), blocked = block, "domain block updated");
        }
        Ok(block)
    }
}

#[async_trait]
impl DomainBlockService for DomainBlocks {
    async fn is_blocked(&self, domain: &str, scope: &BlockScope) -> Result<bool> {
        let patterns = self.patterns(scope).await?;
        Ok(patterns.iter().any(|p| domain_matches(domain, p)))
    }

    async fn block(&self, domain: &str, scope: &BlockScope) -> Result<bool> {
        self.mutate(domain, scope, true).await
    }

    async fn unblock(&self, domain: &str, scope: &BlockScope) -> Result<bool> {
        self.mutate(domain, scope, false).await
    }
}

/// Accepts `example.com`, `*.example.com`, `.example.com` or a URL, and
/// returns the lowercase pattern to store.
pub fn normalize_domain(input: &str) -> Result<String, InboxError> {
    let raw = input.trim();
    let invalid = || InboxError::InvalidDomain(raw.chars().take(253).collect());
    if raw.is_empty() {
        return Err(invalid());
    }
    let (prefix, rest) = if let Some(r) = raw.strip_prefix("*.") {
        ("*.", r)
    } else if let Some(r) = raw.strip_prefix('.') {
        ("*.", r)
    } else {
        ("", raw)
    };
    let host = if rest.contains("://") {
        host_from_url(rest).ok_or_else(invalid)?
    } else {
        rest.trim_end_matches('.').to_ascii_lowercase()
    };
    if host.is_empty() || host.len() > 253 || host.starts_with('.') || host.contains("..") {
        return Err(invalid());
    }
    let label_ok = |l: &str| {
        !l.is_empty()
            && l.len() <= 63
            && !l.starts_with('-')
            && !l.ends_with('-')
            && l.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    };
    if !host.split('.').all(label_ok) {
        return Err(invalid());
    }
    Ok(format!("{prefix}{host}"))
}
