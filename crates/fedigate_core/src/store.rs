/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::audit::InboundRequest;
use crate::counters::{ActorClaim, DistinctOutcome};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite store for audit records, domain blocks, known actors and counters.
/// Every call opens its own connection; run it inside `spawn_blocking`.
#[derive(Clone, Debug)]
pub struct InboxDb {
    path: PathBuf,
}

/// One window check for [`InboxDb::acquire_quota_events`].
#[derive(Debug, Clone)]
pub struct QuotaSlot {
    pub bucket: String,
    /// Events at or after this instant count against `limit`.
    pub floor_ms: i64,
    pub limit: u32,
}

impl InboxDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS inbound_requests (
              request_id TEXT PRIMARY KEY,
              received_at_ms INTEGER NOT NULL,
              headers_json TEXT NOT NULL,
              raw_body BLOB NOT NULL,
              parsed_body TEXT NULL,
              content_type TEXT NULL,
              content_length INTEGER NULL,
              remote_address TEXT NULL,
              user_agent TEXT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_inbound_received ON inbound_requests(received_at_ms);

            CREATE TABLE IF NOT EXISTS domain_blocks (
              scope TEXT NOT NULL,
              domain TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY(scope, domain)
            );

            CREATE TABLE IF NOT EXISTS known_actors (
              actor_id TEXT PRIMARY KEY,
              instance TEXT NOT NULL,
              first_seen_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS quota_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              bucket TEXT NOT NULL,
              at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_quota_bucket_at ON quota_events(bucket, at_ms);

            CREATE TABLE IF NOT EXISTS distinct_members (
              set_key TEXT NOT NULL,
              member TEXT NOT NULL,
              added_at_ms INTEGER NOT NULL,
              PRIMARY KEY(set_key, member)
            );
            "#,
        )
        .context("init inbox db")?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("open db: {}", self.path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
        Ok(())
    }

    // ---- audit ----

    /// Re-inserting the same `request_id` is a no-op, so a retried write cannot fail on itself.
    pub fn insert_inbound_request(&self, req: &InboundRequest) -> Result<()> {
        let headers_json = serde_json::to_string(&req.headers)?;
        let parsed = match &req.parsed_body {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO inbound_requests(request_id, received_at_ms, headers_json, raw_body, parsed_body,
              content_type, content_length, remote_address, user_agent)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                req.request_id,
                req.received_at_ms,
                headers_json,
                req.raw_body,
                parsed,
                req.content_type,
                req.content_length.map(|v| v as i64),
                req.remote_address,
                req.user_agent
            ],
        )?;
        Ok(())
    }

    pub fn get_inbound_request(&self, request_id: &str) -> Result<Option<InboundRequest>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT request_id, received_at_ms, headers_json, raw_body, parsed_body,
                  content_type, content_length, remote_address, user_agent
                FROM inbound_requests WHERE request_id=?1
                "#,
                params![request_id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, Vec<u8>>(3)?,
                        r.get::<_, Option<String>>(4)?,
                        r.get::<_, Option<String>>(5)?,
                        r.get::<_, Option<i64>>(6)?,
                        r.get::<_, Option<String>>(7)?,
                        r.get::<_, Option<String>>(8)?,
                    ))
                },
            )
            .optional()?;
        let Some((request_id, received_at_ms, headers_json, raw_body, parsed, content_type, content_length, remote_address, user_agent)) = row
        else {
            return Ok(None);
        };
        Ok(Some(InboundRequest {
            request_id,
            received_at_ms,
            headers: serde_json::from_str(&headers_json).context("decode stored headers")?,
            raw_body,
            parsed_body: match parsed {
                Some(s) => Some(serde_json::from_str(&s).context("decode stored body")?),
                None => None,
            },
            content_type,
            content_length: content_length.map(|v| v.max(0) as u64),
            remote_address,
            user_agent,
        }))
    }

    pub fn count_inbound_requests(&self) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM inbound_requests", [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    pub fn prune_inbound_requests_before(&self, cutoff_ms: i64) -> Result<u64> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM inbound_requests WHERE received_at_ms < ?1",
            params![cutoff_ms],
        )?;
        Ok(n as u64)
    }

    // ---- domain blocks ----

    /// Returns `true` when a row was created.
    pub fn insert_domain_block(&self, scope: &str, domain: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "INSERT OR IGNORE INTO domain_blocks(scope, domain, created_at_ms) VALUES (?1, ?2, ?3)",
            params![scope, domain, now_ms()],
        )?;
        Ok(n > 0)
    }

    /// Returns `true` when a row was removed.
    pub fn delete_domain_block(&self, scope: &str, domain: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM domain_blocks WHERE scope=?1 AND domain=?2",
            params![scope, domain],
        )?;
        Ok(n > 0)
    }

    pub fn list_domain_blocks(&self, scope: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT domain FROM domain_blocks WHERE scope=?1 ORDER BY domain")?;
        let mut rows = stmt.query(params![scope])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(r.get::<_, String>(0)?);
        }
        Ok(out)
    }

    // ---- counters ----

    /// All-or-nothing: records one event in every slot, or none if any slot is
    /// at its limit. Returns the bucket that was full. A limit of 0 disables a slot.
    pub fn acquire_quota_events(&self, slots: &[QuotaSlot], now_ms: i64) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(full) = first_full_slot(&tx, slots, 1)? {
            return Ok(Some(full));
        }
        charge_slots(&tx, slots, 1, now_ms)?;
        tx.commit()?;
        Ok(None)
    }

    /// First sighting and quota charge in one transaction. Actors not yet in
    /// `known_actors` each cost one event in every slot; either all of them are
    /// charged and remembered, or nothing is written.
    pub fn claim_new_actors(
        &self,
        instance: &str,
        actor_ids: &[String],
        slots: &[QuotaSlot],
        now_ms: i64,
    ) -> Result<ActorClaim> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut fresh: Vec<&String> = Vec::new();
        {
            let mut stmt = tx.prepare("SELECT 1 FROM known_actors WHERE actor_id=?1")?;
            for id in actor_ids {
                if fresh.contains(&id) {
                    continue;
                }
                let known = stmt
                    .query_row(params![id], |r| r.get::<_, i64>(0))
                    .optional()?
                    .is_some();
                if !known {
                    fresh.push(id);
                }
            }
        }
        if fresh.is_empty() {
            return Ok(ActorClaim::Admitted(0));
        }
        let weight = fresh.len() as u32;
        if let Some(full) = first_full_slot(&tx, slots, weight)? {
            return Ok(ActorClaim::Exceeded(full));
        }
        charge_slots(&tx, slots, weight, now_ms)?;
        for id in &fresh {
            tx.execute(
                "INSERT OR IGNORE INTO known_actors(actor_id, instance, first_seen_ms) VALUES (?1, ?2, ?3)",
                params![id, instance, now_ms],
            )?;
        }
        tx.commit()?;
        Ok(ActorClaim::Admitted(weight))
    }

    pub fn is_known_actor(&self, actor_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let known = conn
            .query_row("SELECT 1 FROM known_actors WHERE actor_id=?1", params![actor_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()?
            .is_some();
        Ok(known)
    }

    pub fn quota_event_count(&self, bucket: &str, floor_ms: i64) -> Result<u32> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM quota_events WHERE bucket=?1 AND at_ms >= ?2",
            params![bucket, floor_ms],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as u32)
    }

    pub fn add_distinct_member(&self, set_key: &str, member: &str, max: u32) -> Result<DistinctOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists = tx
            .query_row(
                "SELECT 1 FROM distinct_members WHERE set_key=?1 AND member=?2",
                params![set_key, member],
                |r| r.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM distinct_members WHERE set_key=?1",
            params![set_key],
            |r| r.get(0),
        )?;
        let count = count.max(0) as u32;
        if exists {
            return Ok(DistinctOutcome::AlreadyCounted(count));
        }
        if max > 0 && count >= max {
            return Ok(DistinctOutcome::Full(count));
        }
        tx.execute(
            "INSERT INTO distinct_members(set_key, member, added_at_ms) VALUES (?1, ?2, ?3)",
            params![set_key, member, now_ms()],
        )?;
        tx.commit()?;
        Ok(DistinctOutcome::Added(count + 1))
    }

    pub fn distinct_count(&self, set_key: &str) -> Result<u32> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM distinct_members WHERE set_key=?1",
            params![set_key],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as u32)
    }
}

/// Drops expired events, then names the first active slot that cannot take
/// `weight` more.
fn first_full_slot(conn: &Connection, slots: &[QuotaSlot], weight: u32) -> Result<Option<String>> {
    for slot in slots.iter().filter(|s| s.limit > 0) {
        conn.execute(
            "DELETE FROM quota_events WHERE bucket=?1 AND at_ms < ?2",
            params![slot.bucket, slot.floor_ms],
        )?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM quota_events WHERE bucket=?1 AND at_ms >= ?2",
            params![slot.bucket, slot.floor_ms],
            |r| r.get(0),
        )?;
        if count + weight as i64 > slot.limit as i64 {
            return Ok(Some(slot.bucket.clone()));
        }
    }
    Ok(None)
}

fn charge_slots(conn: &Connection, slots: &[QuotaSlot], weight: u32, now_ms: i64) -> Result<()> {
    for slot in slots.iter().filter(|s| s.limit > 0) {
        for _ in 0..weight {
            conn.execute(
                "INSERT INTO quota_events(bucket, at_ms) VALUES (?1, ?2)",
                params![slot.bucket, now_ms],
            )?;
        }
    }
    Ok(())
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (tempfile::TempDir, InboxDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = InboxDb::open(dir.path().join("inbox.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn domain_block_rows_are_unique() {
        let (_dir, db) = temp_db();
        assert!(db.insert_domain_block("instance", "spam.example").unwrap());
        assert!(!db.insert_domain_block("instance", "spam.example").unwrap());
        assert!(db.insert_domain_block("user:bob", "spam.example").unwrap());
        assert_eq!(db.list_domain_blocks("instance").unwrap(), vec!["spam.example"]);
        assert!(db.delete_domain_block("instance", "spam.example").unwrap());
        assert!(!db.delete_domain_block("instance", "spam.example").unwrap());
        assert_eq!(db.list_domain_blocks("user:bob").unwrap().len(), 1);
    }

    #[test]
    fn quota_slots_are_all_or_nothing() {
        let (_dir, db) = temp_db();
        let slots = |day_limit| {
            vec![
                QuotaSlot { bucket: "hour".into(), floor_ms: 0, limit: 5 },
                QuotaSlot { bucket: "day".into(), floor_ms: 0, limit: day_limit },
            ]
        };
        assert_eq!(db.acquire_quota_events(&slots(1), 10).unwrap(), None);
        assert_eq!(db.acquire_quota_events(&slots(1), 11).unwrap().as_deref(), Some("day"));
        assert_eq!(db.quota_event_count("hour", 0).unwrap(), 1);
    }

    #[test]
    fn expired_quota_events_stop_counting() {
        let (_dir, db) = temp_db();
        let slot = |floor| vec![QuotaSlot { bucket: "b".into(), floor_ms: floor, limit: 1 }];
        assert_eq!(db.acquire_quota_events(&slot(0), 100).unwrap(), None);
        assert!(db.acquire_quota_events(&slot(50), 150).unwrap().is_some());
        assert_eq!(db.acquire_quota_events(&slot(101), 200).unwrap(), None);
    }

    #[test]
    fn new_actors_are_charged_once_and_remembered() {
        let (_dir, db) = temp_db();
        let slots = |limit| vec![QuotaSlot { bucket: "inst".into(), floor_ms: 0, limit }];
        let a = "https://a.example/u/1".to_string();
        let b = "https://a.example/u/2".to_string();
        assert_eq!(db.claim_new_actors("a.example", &[a.clone()], &slots(2), 10).unwrap(), ActorClaim::Admitted(1));
        assert_eq!(db.claim_new_actors("a.example", &[a.clone(), a.clone()], &slots(2), 11).unwrap(), ActorClaim::Admitted(0));
        assert_eq!(db.quota_event_count("inst", 0).unwrap(), 1);
        assert!(db.is_known_actor(&a).unwrap());
        assert!(!db.is_known_actor(&b).unwrap());
    }

    #[test]
    fn actor_claims_are_all_or_nothing() {
        let (_dir, db) = temp_db();
        let slots = vec![QuotaSlot { bucket: "inst".into(), floor_ms: 0, limit: 1 }];
        let pair = vec!["https://a.example/u/1".to_string(), "https://a.example/u/2".to_string()];
        assert_eq!(
            db.claim_new_actors("a.example", &pair, &slots, 10).unwrap(),
            ActorClaim::Exceeded("inst".to_string())
        );
        assert_eq!(db.quota_event_count("inst", 0).unwrap(), 0);
        assert!(!db.is_known_actor(&pair[0]).unwrap());
        assert_eq!(db.claim_new_actors("a.example", &pair[..1], &slots, 11).unwrap(), ActorClaim::Admitted(1));
    }
}
