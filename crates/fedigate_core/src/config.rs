/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Hard upper bound for `max_json_depth`, kept below serde_json's recursion limit.
pub const MAX_JSON_DEPTH_CEILING: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QuotaWindow {
    /// Every event expires on its own, `window` after it was recorded.
    #[default]
    Sliding,
    /// Events are counted in calendar-aligned buckets.
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CounterBackend {
    #[default]
    Sqlite,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// How long a claimed job stays invisible to other workers.
    pub lease_secs: u64,
    pub batch_size: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_backoff_secs: 10,
            max_backoff_secs: 3600,
            lease_secs: 300,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    // structural limits
    pub max_json_size: usize,
    pub max_json_depth: usize,
    pub max_json_keys: usize,
    pub max_json_array_length: usize,

    // actor-creation quotas; 0 disables a ceiling
    pub actors_per_instance_hour: u32,
    pub actors_per_instance_day: u32,
    pub total_actors_per_hour: u32,
    pub quota_window: QuotaWindow,

    // signatures
    pub require_signatures: bool,
    pub allow_unsigned_activities: bool,
    pub max_date_skew_secs: u64,
    pub key_fetch_timeout_secs: u64,

    // URI safety
    pub uri_allowed_schemes: Vec<String>,
    pub uri_blocked_ports: Vec<u16>,
    pub uri_blocked_hosts: Vec<String>,
    pub max_uri_length: usize,

    // relay flood and votes
    pub max_announces_per_object: u32,
    pub vote_rate_limit_per_actor: u32,
    pub vote_rate_window_secs: u64,

    // infrastructure
    pub store_timeout_secs: u64,
    pub store_attempts: u32,
    pub dispatch_attempts: u32,
    pub dispatch_base_backoff_ms: u64,
    pub blocked_domains: Vec<String>,
    pub bind: String,
    pub data_dir: Option<String>,
    pub trust_proxy_headers: bool,
    pub counter_backend: CounterBackend,
    pub redis_url: Option<String>,
    pub redis_prefix: String,
    /// Bearer token -> principal name, for the domain-block API.
    pub api_tokens: HashMap<String, String>,
    pub admin_principals: Vec<String>,
    pub worker: WorkerSettings,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            max_json_size: 1024 * 1024,
            max_json_depth: 32,
            max_json_keys: 2000,
            max_json_array_length: 1000,
            actors_per_instance_hour: 100,
            actors_per_instance_day: 1000,
            total_actors_per_hour: 1000,
            quota_window: QuotaWindow::Sliding,
            require_signatures: true,
            allow_unsigned_activities: false,
            max_date_skew_secs: 12 * 3600,
            key_fetch_timeout_secs: 10,
            uri_allowed_schemes: vec!["http".to_string(), "https".to_string()],
            uri_blocked_ports: vec![22, 23, 25, 2375, 2379, 3306, 5432, 6379, 9200, 11211],
            uri_blocked_hosts: vec![
                "localhost".to_string(),
                "127.0.0.1".to_string(),
                "::1".to_string(),
                "0.0.0.0".to_string(),
                "169.254.169.254".to_string(),
                "metadata.google.internal".to_string(),
            ],
            max_uri_length: 2048,
            max_announces_per_object: 100,
            vote_rate_limit_per_actor: 60,
            vote_rate_window_secs: 60,
            store_timeout_secs: 5,
            store_attempts: 3,
            dispatch_attempts: 3,
            dispatch_base_backoff_ms: 100,
            blocked_domains: Vec::new(),
            bind: "127.0.0.1:8788".to_string(),
            data_dir: None,
            trust_proxy_headers: false,
            counter_backend: CounterBackend::Sqlite,
            redis_url: None,
            redis_prefix: "fedigate".to_string(),
            api_tokens: HashMap::new(),
            admin_principals: Vec::new(),
            worker: WorkerSettings::default(),
        }
    }
}

impl InboxConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("parse inbox config json")
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    /// Applies `FEDIGATE_*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("FEDIGATE_{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        macro_rules! parsed {
            ($field:expr, $name:literal) => {
                if let Some(v) = get($name) {
                    $field = v
                        .parse()
                        .map_err(|_| anyhow::anyhow!("FEDIGATE_{} invalid: {v}", $name))?;
                }
            };
        }

        parsed!(self.max_json_size, "MAX_JSON_SIZE");
        parsed!(self.max_json_depth, "MAX_JSON_DEPTH");
        parsed!(self.max_json_keys, "MAX_JSON_KEYS");
        parsed!(self.max_json_array_length, "MAX_JSON_ARRAY_LENGTH");
        parsed!(self.actors_per_instance_hour, "ACTORS_PER_INSTANCE_HOUR");
        parsed!(self.actors_per_instance_day, "ACTORS_PER_INSTANCE_DAY");
        parsed!(self.total_actors_per_hour, "TOTAL_ACTORS_PER_HOUR");
        parsed!(self.max_date_skew_secs, "MAX_DATE_SKEW_SECS");
        parsed!(self.key_fetch_timeout_secs, "KEY_FETCH_TIMEOUT_SECS");
        parsed!(self.max_uri_length, "MAX_URI_LENGTH");
        parsed!(self.max_announces_per_object, "MAX_ANNOUNCES_PER_OBJECT");
        parsed!(self.vote_rate_limit_per_actor, "VOTE_RATE_LIMIT_PER_ACTOR");
        parsed!(self.vote_rate_window_secs, "VOTE_RATE_WINDOW_SECS");
        parsed!(self.store_timeout_secs, "STORE_TIMEOUT_SECS");
        parsed!(self.store_attempts, "STORE_ATTEMPTS");
        parsed!(self.dispatch_attempts, "DISPATCH_ATTEMPTS");
        parsed!(self.dispatch_base_backoff_ms, "DISPATCH_BASE_BACKOFF_MS");

        if let Some(v) = get("REQUIRE_SIGNATURES") {
            self.require_signatures = parse_bool(&v);
        }
        if let Some(v) = get("ALLOW_UNSIGNED_ACTIVITIES") {
            self.allow_unsigned_activities = parse_bool(&v);
        }
        if let Some(v) = get("TRUST_PROXY_HEADERS") {
            self.trust_proxy_headers = parse_bool(&v);
        }
        if let Some(v) = get("QUOTA_WINDOW") {
            self.quota_window = match v.to_ascii_lowercase().as_str() {
                "sliding" => QuotaWindow::Sliding,
                "fixed" => QuotaWindow::Fixed,
                _ => anyhow::bail!("FEDIGATE_QUOTA_WINDOW invalid: {v}"),
            };
        }
        if let Some(v) = get("COUNTER_BACKEND") {
            self.counter_backend = match v.to_ascii_lowercase().as_str() {
                "sqlite" => CounterBackend::Sqlite,
                "redis" => CounterBackend::Redis,
                _ => anyhow::bail!("FEDIGATE_COUNTER_BACKEND invalid: {v}"),
            };
        }
        if let Some(v) = get("URI_ALLOWED_SCHEMES") {
            self.uri_allowed_schemes = split_list(&v);
        }
        if let Some(v) = get("URI_BLOCKED_HOSTS") {
            self.uri_blocked_hosts = split_list(&v);
        }
        if let Some(v) = get("URI_BLOCKED_PORTS") {
            self.uri_blocked_ports = split_list(&v)
                .iter()
                .map(|p| p.parse::<u16>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| anyhow::anyhow!("FEDIGATE_URI_BLOCKED_PORTS invalid: {v}"))?;
        }
        if let Some(v) = get("BLOCKED_DOMAINS") {
            self.blocked_domains = split_list(&v);
        }
        if let Some(v) = get("ADMIN_PRINCIPALS") {
            self.admin_principals = split_list(&v);
        }
        if let Some(v) = get("BIND") {
            self.bind = v;
        }
        if let Some(v) = get("DATA_DIR") {
            self.data_dir = Some(v);
        }
        if let Some(v) = get("REDIS_URL") {
            self.redis_url = Some(v);
        }
        if let Some(v) = get("REDIS_PREFIX") {
            self.redis_prefix = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_json_size == 0 {
            anyhow::bail!("max_json_size must be > 0");
        }
        if self.max_json_depth == 0 || self.max_json_depth > MAX_JSON_DEPTH_CEILING {
            anyhow::bail!("max_json_depth must be within 1..={MAX_JSON_DEPTH_CEILING}");
        }
        if self.uri_allowed_schemes.is_empty() {
            anyhow::bail!("uri_allowed_schemes must not be empty");
        }
        if self.require_signatures && self.allow_unsigned_activities {
            tracing::warn!("allow_unsigned_activities has no effect while require_signatures=true");
        }
        if self.counter_backend == CounterBackend::Redis && self.redis_url.is_none() {
            anyhow::bail!("counter_backend=redis requires redis_url");
        }
        if self.vote_rate_window_secs == 0 {
            anyhow::bail!("vote_rate_window_secs must be > 0");
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("fedigate_data"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("fedigate.db")
    }

    pub fn key_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.key_fetch_timeout_secs.max(1))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs.max(1))
    }
}

fn parse_bool(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true")
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
