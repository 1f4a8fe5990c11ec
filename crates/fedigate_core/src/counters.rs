/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Windowed and distinct-member counters with atomic check-and-increment.

use crate::config::QuotaWindow;
use crate::store::{now_ms, InboxDb, QuotaSlot};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use redis::aio::ConnectionManager;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaKey {
    pub bucket: String,
    pub window: Duration,
    /// 0 disables this ceiling.
    pub limit: u32,
}

impl QuotaKey {
    pub fn new(bucket: impl Into<String>, window: Duration, limit: u32) -> Self {
        Self {
            bucket: bucket.into(),
            window,
            limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistinctOutcome {
    /// Member was new; carries the new set size.
    Added(u32),
    AlreadyCounted(u32),
    /// Member was new but the set is at its maximum; nothing recorded.
    Full(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorClaim {
    /// Number of first sightings that were charged and remembered.
    Admitted(u32),
    /// Names the bucket that could not take the new actors; nothing recorded.
    Exceeded(String),
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Records one event against every key, or none. `Ok(Some(bucket))` names
    /// the first key that was already at its limit.
    async fn try_acquire(&self, keys: &[QuotaKey]) -> Result<Option<String>>;

    /// Atomically finds the actors never seen before and charges one event
    /// per new actor against every key. A repeat sighting costs nothing.
    async fn claim_new_actors(&self, instance: &str, actors: &[String], keys: &[QuotaKey]) -> Result<ActorClaim>;

    async fn count(&self, key: &QuotaKey) -> Result<u32>;

    async fn add_distinct(&self, set: &str, member: &str, max: u32) -> Result<DistinctOutcome>;

    async fn distinct_count(&self, set: &str) -> Result<u32>;
}

/// Earliest event timestamp that still counts for `window` at `now_ms`.
pub fn window_floor(mode: QuotaWindow, window: Duration, now_ms: i64) -> i64 {
    let w = (window.as_millis() as i64).max(1);
    match mode {
        QuotaWindow::Sliding => now_ms - w + 1,
        QuotaWindow::Fixed => now_ms - now_ms.rem_euclid(w),
    }
}

#[derive(Clone)]
pub struct SqliteCounterStore {
    db: InboxDb,
    mode: QuotaWindow,
}

impl SqliteCounterStore {
    pub fn new(db: InboxDb, mode: QuotaWindow) -> Self {
        Self { db, mode }
    }

    fn slots(&self, keys: &[QuotaKey], now: i64) -> Vec<QuotaSlot> {
        keys.iter()
            .map(|k| QuotaSlot {
                bucket: k.bucket.clone(),
                floor_ms: window_floor(self.mode, k.window, now),
                limit: k.limit,
            })
            .collect()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(InboxDb) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db))
            .await
            .context("counter task panicked")?
    }
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    async fn try_acquire(&self, keys: &[QuotaKey]) -> Result<Option<String>> {
        let now = now_ms();
        let slots = self.slots(keys, now);
        self.blocking(move |db| db.acquire_quota_events(&slots, now)).await
    }

    async fn claim_new_actors(&self, instance: &str, actors: &[String], keys: &[QuotaKey]) -> Result<ActorClaim> {
        let now = now_ms();
        let slots = self.slots(keys, now);
        let (instance, actors) = (instance.to_string(), actors.to_vec());
        self.blocking(move |db| db.claim_new_actors(&instance, &actors, &slots, now)).await
    }

    async fn count(&self, key: &QuotaKey) -> Result<u32> {
        let bucket = key.bucket.clone();
        let floor = window_floor(self.mode, key.window, now_ms());
        self.blocking(move |db| db.quota_event_count(&bucket, floor)).await
    }

    async fn add_distinct(&self, set: &str, member: &str, max: u32) -> Result<DistinctOutcome> {
        let (set, member) = (set.to_string(), member.to_string());
        self.blocking(move |db| db.add_distinct_member(&set, &member, max)).await
    }

    async fn distinct_count(&self, set: &str) -> Result<u32> {
        let set = set.to_string();
        self.blocking(move |db| db.distinct_count(&set)).await
    }
}

// KEYS: buckets. ARGV: now_ms, member, then (floor_ms, limit, ttl_ms) per key.
const ACQUIRE_SCRIPT: &str = r#"
    local now = tonumber(ARGV[1])
    local member = ARGV[2]
    for i, key in ipairs(KEYS) do
      local base = 2 + (i - 1) * 3
      redis.call("ZREMRANGEBYSCORE", key, "-inf", "(" .. ARGV[base + 1])
      if redis.call("ZCARD", key) >= tonumber(ARGV[base + 2]) then
        return i
      end
    end
    for i, key in ipairs(KEYS) do
      local base = 2 + (i - 1) * 3
      redis.call("ZADD", key, now, member)
      redis.call("PEXPIRE", key, tonumber(ARGV[base + 3]))
    end
    return 0
"#;

// KEYS[1]: known-actor set, then buckets. ARGV: now_ms, member prefix, actor
// count n, n actors, then (floor_ms, limit, ttl_ms) per bucket.
// Returns {full_index, charged}; full_index is 1-based over the buckets.
const CLAIM_SCRIPT: &str = r#"
    local now = tonumber(ARGV[1])
    local prefix = ARGV[2]
    local n = tonumber(ARGV[3])
    local fresh = {}
    local seen = {}
    for j = 1, n do
      local actor = ARGV[3 + j]
      if not seen[actor] then
        seen[actor] = true
        if redis.call("SISMEMBER", KEYS[1], actor) == 0 then
          table.insert(fresh, actor)
        end
      end
    end
    if #fresh == 0 then
      return {0, 0}
    end
    local off = 3 + n
    for i = 2, #KEYS do
      local base = off + (i - 2) * 3
      redis.call("ZREMRANGEBYSCORE", KEYS[i], "-inf", "(" .. ARGV[base + 1])
      if redis.call("ZCARD", KEYS[i]) + #fresh > tonumber(ARGV[base + 2]) then
        return {i - 1, 0}
      end
    end
    for i = 2, #KEYS do
      local base = off + (i - 2) * 3
      for j = 1, #fresh do
        redis.call("ZADD", KEYS[i], now, prefix .. ":" .. j)
      end
      redis.call("PEXPIRE", KEYS[i], tonumber(ARGV[base + 3]))
    end
    for j = 1, #fresh do
      redis.call("SADD", KEYS[1], fresh[j])
    end
    return {0, #fresh}
"#;

// KEYS[1]: set. ARGV: member, max. Returns {state, size}; state 0 added, 1 present, 2 full.
const DISTINCT_SCRIPT: &str = r#"
    local max = tonumber(ARGV[2])
    if redis.call("SISMEMBER", KEYS[1], ARGV[1]) == 1 then
      return {1, redis.call("SCARD", KEYS[1])}
    end
    local n = redis.call("SCARD", KEYS[1])
    if max > 0 and n >= max then
      return {2, n}
    end
    redis.call("SADD", KEYS[1], ARGV[1])
    return {0, n + 1}
"#;

const KNOWN_ACTORS_SET: &str = "actors:known";

/// Keys and arguments for one script invocation, in script order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScriptCall {
    keys: Vec<String>,
    args: Vec<String>,
}

impl ScriptCall {
    async fn invoke<T: redis::FromRedisValue>(&self, script: &redis::Script, conn: &mut ConnectionManager) -> redis::RedisResult<T> {
        let mut inv = script.prepare_invoke();
        for k in &self.keys {
            inv.key(k);
        }
        for a in &self.args {
            inv.arg(a);
        }
        inv.invoke_async(conn).await
    }
}

fn redis_key(prefix: &str, mode: QuotaWindow, kind: &str, name: &str, floor: Option<i64>) -> String {
    match (mode, floor) {
        // fixed windows get a fresh key per bucket so expiry does the reset
        (QuotaWindow::Fixed, Some(f)) => format!("{prefix}:{kind}:{name}:{f}"),
        _ => format!("{prefix}:{kind}:{name}"),
    }
}

fn push_windows(call: &mut ScriptCall, prefix: &str, mode: QuotaWindow, keys: &[&QuotaKey], now: i64) {
    for k in keys {
        let floor = window_floor(mode, k.window, now);
        call.keys.push(redis_key(prefix, mode, "q", &k.bucket, Some(floor)));
    }
}

fn push_window_args(call: &mut ScriptCall, mode: QuotaWindow, keys: &[&QuotaKey], now: i64) {
    for k in keys {
        call.args.push(window_floor(mode, k.window, now).to_string());
        call.args.push(k.limit.to_string());
        call.args.push(k.window.as_millis().max(1).to_string());
    }
}

fn acquire_call(prefix: &str, mode: QuotaWindow, keys: &[&QuotaKey], now: i64, member: &str) -> ScriptCall {
    let mut call = ScriptCall { keys: Vec::new(), args: vec![now.to_string(), member.to_string()] };
    push_windows(&mut call, prefix, mode, keys, now);
    push_window_args(&mut call, mode, keys, now);
    call
}

fn claim_call(
    prefix: &str,
    mode: QuotaWindow,
    actors: &[String],
    keys: &[&QuotaKey],
    now: i64,
    member_prefix: &str,
) -> ScriptCall {
    let mut call = ScriptCall {
        keys: vec![redis_key(prefix, mode, "set", KNOWN_ACTORS_SET, None)],
        args: vec![now.to_string(), member_prefix.to_string(), actors.len().to_string()],
    };
    call.args.extend(actors.iter().cloned());
    push_windows(&mut call, prefix, mode, keys, now);
    push_window_args(&mut call, mode, keys, now);
    call
}

fn event_member(now: i64) -> String {
    let mut member = [0u8; 8];
    OsRng.fill_bytes(&mut member);
    format!("{now}-{}", hex::encode(member))
}

/// Shared counters for multi-replica deployments.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    prefix: String,
    mode: QuotaWindow,
    acquire: redis::Script,
    claim: redis::Script,
    distinct: redis::Script,
}

impl RedisCounterStore {
    pub async fn connect(url: &str, prefix: &str, mode: QuotaWindow) -> Result<Self> {
        let client = redis::Client::open(url).context("redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("redis connect")?;
        Ok(Self {
            conn,
            prefix: prefix.trim_end_matches(':').to_string(),
            mode,
            acquire: redis::Script::new(ACQUIRE_SCRIPT),
            claim: redis::Script::new(CLAIM_SCRIPT),
            distinct: redis::Script::new(DISTINCT_SCRIPT),
        })
    }

    fn key(&self, kind: &str, name: &str, floor: Option<i64>) -> String {
        redis_key(&self.prefix, self.mode, kind, name, floor)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn try_acquire(&self, keys: &[QuotaKey]) -> Result<Option<String>> {
        let active: Vec<&QuotaKey> = keys.iter().filter(|k| k.limit > 0).collect();
        if active.is_empty() {
            return Ok(None);
        }
        let now = now_ms();
        let call = acquire_call(&self.prefix, self.mode, &active, now, &event_member(now));
        let mut conn = self.conn.clone();
        let full: i64 = call
            .invoke(&self.acquire, &mut conn)
            .await
            .context("redis quota script")?;
        if full <= 0 {
            return Ok(None);
        }
        Ok(active.get(full as usize - 1).map(|k| k.bucket.clone()))
    }

    async fn claim_new_actors(&self, _instance: &str, actors: &[String], keys: &[QuotaKey]) -> Result<ActorClaim> {
        if actors.is_empty() {
            return Ok(ActorClaim::Admitted(0));
        }
        let active: Vec<&QuotaKey> = keys.iter().filter(|k| k.limit > 0).collect();
        let now = now_ms();
        let call = claim_call(&self.prefix, self.mode, actors, &active, now, &event_member(now));
        let mut conn = self.conn.clone();
        let (full, charged): (i64, i64) = call
            .invoke(&self.claim, &mut conn)
            .await
            .context("redis actor claim script")?;
        if full > 0 {
            let bucket = active
                .get(full as usize - 1)
                .map(|k| k.bucket.clone())
                .unwrap_or_default();
            return Ok(ActorClaim::Exceeded(bucket));
        }
        Ok(ActorClaim::Admitted(charged.max(0) as u32))
    }

    async fn count(&self, key: &QuotaKey) -> Result<u32> {
        let now = now_ms();
        let floor = window_floor(self.mode, key.window, now);
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("ZCOUNT")
            .arg(self.key("q", &key.bucket, Some(floor)))
            .arg(floor)
            .arg("+inf")
            .query_async(&mut conn)
            .await
            .context("redis zcount")?;
        Ok(n.max(0) as u32)
    }

    async fn add_distinct(&self, set: &str, member: &str, max: u32) -> Result<DistinctOutcome> {
        let mut conn = self.conn.clone();
        let (state, size): (i64, i64) = self
            .distinct
            .key(self.key("set", set, None))
            .arg(member)
            .arg(max as i64)
            .invoke_async(&mut conn)
            .await
            .context("redis distinct script")?;
        let size = size.max(0) as u32;
        Ok(match state {
            0 => DistinctOutcome::Added(size),
            1 => DistinctOutcome::AlreadyCounted(size),
            _ => DistinctOutcome::Full(size),
        })
    }

    async fn distinct_count(&self, set: &str) -> Result<u32> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("SCARD")
            .arg(self.key("set", set, None))
            .query_async(&mut conn)
            .await
            .context("redis scard")?;
        Ok(n.max(0) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const HOUR: Duration = Duration::from_secs(3600);

    fn store() -> (tempfile::TempDir, SqliteCounterStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = InboxDb::open(dir.path().join("counters.db")).unwrap();
        (dir, SqliteCounterStore::new(db, QuotaWindow::Sliding))
    }

    #[test]
    fn fixed_windows_align_to_buckets() {
        let w = Duration::from_millis(1000);
        assert_eq!(window_floor(QuotaWindow::Fixed, w, 12_345), 12_000);
        assert_eq!(window_floor(QuotaWindow::Sliding, w, 12_345), 11_346);
    }

    #[tokio::test]
    async fn zero_limit_never_blocks() {
        let (_dir, s) = store();
        let key = QuotaKey::new("off", HOUR, 0);
        for _ in 0..5 {
            assert_eq!(s.try_acquire(&[key.clone()]).await.unwrap(), None);
        }
        assert_eq!(s.count(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_acquires_stop_at_limit() {
        let (_dir, s) = store();
        let s = Arc::new(s);
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..12 {
            let s = s.clone();
            set.spawn(async move { s.try_acquire(&[QuotaKey::new("inst", HOUR, 5)]).await.unwrap() });
        }
        let mut admitted = 0;
        while let Some(res) = set.join_next().await {
            if res.unwrap().is_none() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
        assert_eq!(s.count(&QuotaKey::new("inst", HOUR, 5)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn distinct_members_count_once() {
        let (_dir, s) = store();
        assert_eq!(s.add_distinct("obj", "a", 2).await.unwrap(), DistinctOutcome::Added(1));
        assert_eq!(s.add_distinct("obj", "a", 2).await.unwrap(), DistinctOutcome::AlreadyCounted(1));
        assert_eq!(s.add_distinct("obj", "b", 2).await.unwrap(), DistinctOutcome::Added(2));
        assert_eq!(s.add_distinct("obj", "c", 2).await.unwrap(), DistinctOutcome::Full(2));
        assert_eq!(s.add_distinct("obj", "b", 2).await.unwrap(), DistinctOutcome::AlreadyCounted(2));
        assert_eq!(s.distinct_count("obj").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn repeat_sightings_of_one_actor_cost_one_event() {
        let (_dir, s) = store();
        let s = Arc::new(s);
        let key = QuotaKey::new("actors:instance:r.example:hour", HOUR, 3);
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let (s, key) = (s.clone(), key.clone());
            set.spawn(async move {
                s.claim_new_actors("r.example", &["https://r.example/u/alice".to_string()], &[key])
                    .await
                    .unwrap()
            });
        }
        let mut charged = 0;
        while let Some(res) = set.join_next().await {
            match res.unwrap() {
                ActorClaim::Admitted(n) => charged += n,
                ActorClaim::Exceeded(b) => panic!("unexpected quota rejection on {b}"),
            }
        }
        assert_eq!(charged, 1);
        assert_eq!(s.count(&key).await.unwrap(), 1);
    }

    #[test]
    fn fixed_window_keys_carry_the_bucket_start() {
        assert_eq!(redis_key("fg", QuotaWindow::Fixed, "q", "votes:a", Some(7_200_000)), "fg:q:votes:a:7200000");
        assert_eq!(redis_key("fg", QuotaWindow::Sliding, "q", "votes:a", Some(7_200_000)), "fg:q:votes:a");
        assert_eq!(redis_key("fg", QuotaWindow::Fixed, "set", "announce:x", None), "fg:set:announce:x");
    }

    #[test]
    fn acquire_arguments_follow_the_script_layout() {
        let hour = QuotaKey::new("h", HOUR, 5);
        let day = QuotaKey::new("d", Duration::from_secs(86_400), 9);
        let now = 10_000_000;
        let call = acquire_call("fg", QuotaWindow::Sliding, &[&hour, &day], now, "m1");
        assert_eq!(call.keys, vec!["fg:q:h", "fg:q:d"]);
        let expected: Vec<String> = [
            now.to_string(),
            "m1".to_string(),
            (now - 3_600_000 + 1).to_string(),
            "5".to_string(),
            "3600000".to_string(),
            (now - 86_400_000 + 1).to_string(),
            "9".to_string(),
            "86400000".to_string(),
        ]
        .to_vec();
        assert_eq!(call.args, expected);
    }

    #[test]
    fn claim_arguments_list_actors_before_windows() {
        let hour = QuotaKey::new("h", HOUR, 2);
        let now = 7_300_000;
        let actors = vec!["https://a.example/u/1".to_string(), "https://a.example/u/2".to_string()];
        let call = claim_call("fg", QuotaWindow::Fixed, &actors, &[&hour], now, "m");
        assert_eq!(call.keys, vec!["fg:set:actors:known", "fg:q:h:7200000"]);
        assert_eq!(
            call.args,
            vec!["7300000", "m", "2", "https://a.example/u/1", "https://a.example/u/2", "7200000", "2", "3600000"]
        );
    }
}
