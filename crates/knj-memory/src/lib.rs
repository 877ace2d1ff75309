// SPDX-License-Identifier: MIT OR Apache-2.0
//! Learning memory: L1 episodic journal, L2 semantic rules, L3 preference
//! pairs.
//!
//! L2 rules map `(client, supplier, doc_class, feature_hash)` to suggested
//! accounts and a VAT class. Rules are created from operator corrections
//! once the same correction has been observed `promote_after` times, decay
//! by half-life, and are reinforced monotonically: concurring corrections
//! only strengthen a rule, while a contradicting correction splits off a
//! second rule and flags both with a conflict annotation.
//!
//! Everything here is content-addressed and model-agnostic — swapping the
//! inference model never touches these tables.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use knj_audit::{AuditKind, AuditLog, Db, NewAuditEvent};
use knj_core::{canonical_json, sha256_hex, Booking, DocClass, VatClass};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Errors from the memory store.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Database failure.
    #[error("memory db: {0}")]
    Db(#[from] rusqlite::Error),
    /// Serialization failure.
    #[error("memory serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Audit append failure.
    #[error("memory audit: {0}")]
    Audit(#[from] knj_audit::AuditError),
    /// Filesystem failure during L3 export.
    #[error("memory io: {0}")]
    Io(#[from] std::io::Error),
}

/// Lookup key for an L2 rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleKey {
    /// Client the rule applies to.
    pub client_id: String,
    /// Supplier fiscal id, when the document names one.
    pub supplier_id: Option<String>,
    /// Document class.
    pub doc_class: DocClass,
    /// Hash over the feature set (normalized narrative tokens etc).
    pub feature_hash: String,
}

impl RuleKey {
    /// Build a key, hashing the feature strings into the feature hash.
    pub fn new(
        client_id: &str,
        supplier_id: Option<&str>,
        doc_class: DocClass,
        features: &[&str],
    ) -> Self {
        let mut sorted: Vec<&str> = features.to_vec();
        sorted.sort_unstable();
        Self {
            client_id: client_id.to_string(),
            supplier_id: supplier_id.map(str::to_string),
            doc_class,
            feature_hash: sha256_hex(sorted.join("\u{1f}").as_bytes()),
        }
    }
}

/// What an L2 rule suggests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleValue {
    /// Suggested chart-of-accounts numbers, sorted.
    pub suggested_accounts: Vec<String>,
    /// Suggested VAT class.
    pub vat_class: Option<VatClass>,
}

impl RuleValue {
    fn hash(&self) -> Result<String, serde_json::Error> {
        Ok(sha256_hex(canonical_json(self)?.as_bytes()))
    }
}

/// A durable L2 rule with its reinforcement state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRule {
    /// Lookup key.
    pub key: RuleKey,
    /// Suggested value.
    pub value: RuleValue,
    /// Base confidence before decay.
    pub confidence: f64,
    /// Times this rule was reinforced.
    pub hits: u32,
    /// Last reinforcement or use.
    pub last_used: DateTime<Utc>,
    /// Booking that created the rule.
    pub created_from: String,
    /// Decay half-life in days.
    pub half_life_days: u32,
    /// Set when a contradicting correction split this key.
    pub conflict: bool,
}

impl MemoryRule {
    /// Half-life-decayed score at `now`.
    #[must_use]
    pub fn decayed_score(&self, now: DateTime<Utc>) -> f64 {
        let age_days = (now - self.last_used).num_seconds().max(0) as f64 / 86_400.0;
        self.confidence * 0.5_f64.powf(age_days / self.half_life_days.max(1) as f64)
    }
}

/// Tuning knobs for the memory store.
#[derive(Debug, Clone)]
pub struct MemoryPolicy {
    /// L1 journal retention in days.
    pub l1_retention_days: u32,
    /// Default half-life for new rules, days.
    pub default_half_life_days: u32,
    /// Decayed score below which a rule is no longer live.
    pub score_floor: f64,
    /// Concurring observations required before a rule is created.
    pub promote_after: u32,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            l1_retention_days: 30,
            default_half_life_days: 90,
            score_floor: 0.15,
            promote_after: 2,
        }
    }
}

/// What a correction did to the rule table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleChange {
    /// Observation recorded; not yet enough concurrence for a rule.
    Observed {
        /// Observations of this exact correction so far.
        count: u32,
    },
    /// A new rule was created.
    Created,
    /// An existing rule was reinforced.
    Reinforced {
        /// Hit count after reinforcement.
        hits: u32,
    },
    /// A contradicting correction split the key; both rules are flagged.
    ConflictSplit,
}

/// SQLite-backed memory store.
pub struct MemoryStore {
    db: Db,
    audit: Arc<AuditLog>,
    policy: MemoryPolicy,
}

impl MemoryStore {
    /// Attach to the shared database, creating tables if needed.
    pub fn open(db: Db, audit: Arc<AuditLog>, policy: MemoryPolicy) -> Result<Self, MemoryError> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS l1_journal (
                    id        INTEGER PRIMARY KEY AUTOINCREMENT,
                    ts        TEXT NOT NULL,
                    client_id TEXT NOT NULL,
                    event     TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS l2_rules (
                    id             INTEGER PRIMARY KEY AUTOINCREMENT,
                    client_id      TEXT NOT NULL,
                    supplier_id    TEXT,
                    doc_class      TEXT NOT NULL,
                    feature_hash   TEXT NOT NULL,
                    value_hash     TEXT NOT NULL,
                    value          TEXT NOT NULL,
                    confidence     REAL NOT NULL,
                    hits           INTEGER NOT NULL,
                    last_used      TEXT NOT NULL,
                    created_from   TEXT NOT NULL,
                    half_life_days INTEGER NOT NULL,
                    conflict       INTEGER NOT NULL DEFAULT 0,
                    UNIQUE (client_id, supplier_id, doc_class, feature_hash, value_hash)
                );
                CREATE TABLE IF NOT EXISTS l2_observations (
                    client_id    TEXT NOT NULL,
                    supplier_id  TEXT,
                    doc_class    TEXT NOT NULL,
                    feature_hash TEXT NOT NULL,
                    value_hash   TEXT NOT NULL,
                    count        INTEGER NOT NULL,
                    UNIQUE (client_id, supplier_id, doc_class, feature_hash, value_hash)
                );
                CREATE TABLE IF NOT EXISTS l3_pairs (
                    id             INTEGER PRIMARY KEY AUTOINCREMENT,
                    booking_id     TEXT NOT NULL,
                    prompt_context TEXT NOT NULL,
                    chosen         TEXT NOT NULL,
                    rejected       TEXT NOT NULL,
                    created_at     TEXT NOT NULL,
                    exported       INTEGER NOT NULL DEFAULT 0
                );",
            )?;
        }
        Ok(Self { db, audit, policy })
    }

    // -----------------------------------------------------------------
    // L2
    // -----------------------------------------------------------------

    /// Rules for a key, live ones only, sorted by decayed score descending.
    pub fn suggest(&self, key: &RuleKey) -> Result<Vec<MemoryRule>, MemoryError> {
        let now = Utc::now();
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT supplier_id, value, confidence, hits, last_used, created_from,
                    half_life_days, conflict
             FROM l2_rules
             WHERE client_id = ?1
               AND (supplier_id IS ?2)
               AND doc_class = ?3
               AND feature_hash = ?4",
        )?;
        let rows = stmt.query_map(
            params![
                key.client_id,
                key.supplier_id,
                key.doc_class.to_string(),
                key.feature_hash
            ],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            },
        )?;

        let mut rules = Vec::new();
        for row in rows {
            let (supplier_id, value, confidence, hits, last_used, created_from, half_life, conflict) =
                row?;
            let rule = MemoryRule {
                key: RuleKey {
                    client_id: key.client_id.clone(),
                    supplier_id,
                    doc_class: key.doc_class,
                    feature_hash: key.feature_hash.clone(),
                },
                value: serde_json::from_str(&value)?,
                confidence,
                hits: hits as u32,
                last_used: parse_ts(&last_used),
                created_from,
                half_life_days: half_life as u32,
                conflict: conflict != 0,
            };
            if rule.decayed_score(now) > self.policy.score_floor {
                rules.push(rule);
            }
        }
        rules.sort_by(|a, b| {
            b.decayed_score(now)
                .partial_cmp(&a.decayed_score(now))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(rules)
    }

    /// Record an operator correction and update the rule table.
    ///
    /// Reinforcement is monotonic under concurrence: the same `(key,
    /// correction)` only ever strengthens. A different correction for a key
    /// that already has a rule splits into a second rule and flags both.
    pub fn record_correction(
        &self,
        key: &RuleKey,
        corrected: &Booking,
    ) -> Result<RuleChange, MemoryError> {
        let value = RuleValue {
            suggested_accounts: {
                let mut accounts: Vec<String> =
                    corrected.entries.iter().map(|e| e.account.clone()).collect();
                accounts.sort();
                accounts.dedup();
                accounts
            },
            vat_class: corrected.vat_breakdown.lines.first().map(|l| l.class),
        };
        let value_hash = value.hash()?;
        let value_json = serde_json::to_string(&value)?;
        let now = Utc::now().to_rfc3339();

        let conn = self.db.lock();

        // Existing rule for this exact correction: reinforce.
        let existing: Option<(i64, i64, f64)> = conn
            .query_row(
                "SELECT id, hits, confidence FROM l2_rules
                 WHERE client_id = ?1 AND (supplier_id IS ?2) AND doc_class = ?3
                   AND feature_hash = ?4 AND value_hash = ?5",
                params![
                    key.client_id,
                    key.supplier_id,
                    key.doc_class.to_string(),
                    key.feature_hash,
                    value_hash
                ],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        if let Some((id, hits, confidence)) = existing {
            let hits = hits + 1;
            let confidence = (confidence + 0.1).min(1.0);
            conn.execute(
                "UPDATE l2_rules SET hits = ?1, confidence = ?2, last_used = ?3 WHERE id = ?4",
                params![hits, confidence, now, id],
            )?;
            drop(conn);
            self.audit_rule(key, "reinforced", &value_hash)?;
            debug!(hits, "l2 rule reinforced");
            return Ok(RuleChange::Reinforced { hits: hits as u32 });
        }

        // A different correction already promoted for this key?
        let sibling: Option<i64> = conn
            .query_row(
                "SELECT COUNT(*) FROM l2_rules
                 WHERE client_id = ?1 AND (supplier_id IS ?2) AND doc_class = ?3
                   AND feature_hash = ?4",
                params![
                    key.client_id,
                    key.supplier_id,
                    key.doc_class.to_string(),
                    key.feature_hash
                ],
                |row| row.get(0),
            )
            .optional()?;
        let has_sibling = sibling.unwrap_or(0) > 0;

        // Count this observation.
        conn.execute(
            "INSERT INTO l2_observations
                (client_id, supplier_id, doc_class, feature_hash, value_hash, count)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)
             ON CONFLICT (client_id, supplier_id, doc_class, feature_hash, value_hash)
             DO UPDATE SET count = count + 1",
            params![
                key.client_id,
                key.supplier_id,
                key.doc_class.to_string(),
                key.feature_hash,
                value_hash
            ],
        )?;
        let count: i64 = conn.query_row(
            "SELECT count FROM l2_observations
             WHERE client_id = ?1 AND (supplier_id IS ?2) AND doc_class = ?3
               AND feature_hash = ?4 AND value_hash = ?5",
            params![
                key.client_id,
                key.supplier_id,
                key.doc_class.to_string(),
                key.feature_hash,
                value_hash
            ],
            |row| row.get(0),
        )?;

        if (count as u32) < self.policy.promote_after {
            return Ok(RuleChange::Observed {
                count: count as u32,
            });
        }

        // Promote. If a sibling rule exists this is a conflict split.
        conn.execute(
            "INSERT INTO l2_rules
                (client_id, supplier_id, doc_class, feature_hash, value_hash, value,
                 confidence, hits, last_used, created_from, half_life_days, conflict)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                key.client_id,
                key.supplier_id,
                key.doc_class.to_string(),
                key.feature_hash,
                value_hash,
                value_json,
                0.6_f64,
                count,
                now,
                corrected.id.to_string(),
                self.policy.default_half_life_days,
                has_sibling as i64,
            ],
        )?;
        if has_sibling {
            conn.execute(
                "UPDATE l2_rules SET conflict = 1
                 WHERE client_id = ?1 AND (supplier_id IS ?2) AND doc_class = ?3
                   AND feature_hash = ?4",
                params![
                    key.client_id,
                    key.supplier_id,
                    key.doc_class.to_string(),
                    key.feature_hash
                ],
            )?;
        }
        drop(conn);

        if has_sibling {
            self.audit_rule(key, "conflict_split", &value_hash)?;
            info!("l2 rule conflict split");
            Ok(RuleChange::ConflictSplit)
        } else {
            self.audit_rule(key, "created", &value_hash)?;
            info!("l2 rule created");
            Ok(RuleChange::Created)
        }
    }

    // -----------------------------------------------------------------
    // L1
    // -----------------------------------------------------------------

    /// Append an episodic journal event.
    pub fn journal(
        &self,
        client_id: &str,
        event: &serde_json::Value,
    ) -> Result<(), MemoryError> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO l1_journal (ts, client_id, event) VALUES (?1, ?2, ?3)",
            params![Utc::now().to_rfc3339(), client_id, serde_json::to_string(event)?],
        )?;
        Ok(())
    }

    /// Delete journal entries older than the retention window.
    pub fn sweep_l1(&self) -> Result<usize, MemoryError> {
        let cutoff =
            (Utc::now() - Duration::days(self.policy.l1_retention_days as i64)).to_rfc3339();
        let conn = self.db.lock();
        let removed = conn.execute("DELETE FROM l1_journal WHERE ts < ?1", params![cutoff])?;
        if removed > 0 {
            debug!(removed, "l1 journal swept");
        }
        Ok(removed)
    }

    /// Recent journal events for a client, newest first.
    pub fn recent_journal(
        &self,
        client_id: &str,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, MemoryError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT event FROM l1_journal WHERE client_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![client_id, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------
    // L3
    // -----------------------------------------------------------------

    /// Record a preference pair: the approved booking against the machine
    /// proposal it replaced. Stored in canonical form, model-agnostic.
    pub fn preference_pair(
        &self,
        prompt_context: &str,
        approved: &Booking,
        proposed: &Booking,
    ) -> Result<(), MemoryError> {
        let chosen = canonical_json(&approved.canonical_value()?)?;
        let rejected = canonical_json(&proposed.canonical_value()?)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO l3_pairs (booking_id, prompt_context, chosen, rejected, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                approved.id.to_string(),
                prompt_context,
                chosen,
                rejected,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Export unexported pairs as JSONL for the external fine-tuner.
    ///
    /// Returns the number of pairs written. Exported pairs are marked, not
    /// deleted.
    pub fn export_l3_jsonl(&self, path: &Path) -> Result<usize, MemoryError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, booking_id, prompt_context, chosen, rejected, created_at
             FROM l3_pairs WHERE exported = 0 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut lines = Vec::new();
        let mut ids = Vec::new();
        for row in rows {
            let (id, booking_id, prompt_context, chosen, rejected, created_at) = row?;
            let line = serde_json::json!({
                "booking_id": booking_id,
                "prompt_context": prompt_context,
                "chosen": serde_json::from_str::<serde_json::Value>(&chosen)?,
                "rejected": serde_json::from_str::<serde_json::Value>(&rejected)?,
                "created_at": created_at,
            });
            lines.push(serde_json::to_string(&line)?);
            ids.push(id);
        }
        if lines.is_empty() {
            return Ok(0);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, lines.join("\n") + "\n")?;

        for id in &ids {
            conn.execute("UPDATE l3_pairs SET exported = 1 WHERE id = ?1", params![id])?;
        }
        info!(count = ids.len(), path = %path.display(), "l3 pairs exported");
        Ok(ids.len())
    }

    // --- helpers ---

    fn audit_rule(&self, key: &RuleKey, outcome: &str, value_hash: &str) -> Result<(), MemoryError> {
        let kind = if outcome == "conflict_split" {
            AuditKind::MemoryConflict
        } else {
            AuditKind::MemoryRule
        };
        self.audit.append(NewAuditEvent {
            actor: "pipeline".into(),
            kind,
            subject_id: format!("{}/{}", key.client_id, key.feature_hash),
            payload: serde_json::json!({
                "outcome": outcome,
                "doc_class": key.doc_class.to_string(),
                "supplier_id": key.supplier_id,
                "value_hash": value_hash,
            }),
        })?;
        Ok(())
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
