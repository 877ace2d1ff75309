// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Time-aware retrieval over the annotated legal corpus."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! The index is a union of a dense nearest-neighbor structure over chunk
//! embeddings and an inverted keyword index over normalized tokens.
//! Search is always `as_of` a business-event date: chunks whose
//! `[effective_from, effective_to]` interval does not contain the date are
//! filtered out, and every hit carries a paragraph-precise
//! [`CitationRef`].
//!
//! Corpus changes are append-only. New chunks land in quarantine and
//! become searchable only after explicit operator confirmation;
//! supersession closes the predecessor's interval the day before the
//! successor takes effect.

mod embed;

pub use embed::{cosine, EmbedError, Embedder, HashEmbedder, HttpEmbedder};

use chrono::{Duration, NaiveDate};
use knj_audit::{AuditKind, AuditLog, Db, NewAuditEvent};
use knj_core::CitationRef;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use unicode_normalization::UnicodeNormalization;

/// A chunk of annotated legal text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegalChunk {
    /// Row id; 0 until persisted.
    #[serde(default)]
    pub id: i64,
    /// Corpus the chunk belongs to.
    pub corpus_id: String,
    /// Short law code, e.g. `"ZPDV"`.
    pub law_code: String,
    /// Article number.
    pub article: u32,
    /// Paragraph number, when paragraph-precise.
    #[serde(default)]
    pub paragraph: Option<u32>,
    /// The normative text.
    pub text: String,
    /// Official gazette reference of this version.
    pub gazette_ref: String,
    /// First day this version is in force.
    pub effective_from: NaiveDate,
    /// Last day in force; `None` while current.
    #[serde(default)]
    pub effective_to: Option<NaiveDate>,
    /// Chunk this version superseded, if any.
    #[serde(default)]
    pub supersedes: Option<i64>,
}

impl LegalChunk {
    /// Is this version in force on `as_of`?
    #[must_use]
    pub fn in_force_on(&self, as_of: NaiveDate) -> bool {
        self.effective_from <= as_of && self.effective_to.map(|to| as_of <= to).unwrap_or(true)
    }

    /// Citation for a query answered with this chunk.
    #[must_use]
    pub fn citation(&self, as_of: NaiveDate) -> CitationRef {
        CitationRef {
            law_code: self.law_code.clone(),
            article: self.article,
            paragraph: self.paragraph,
            gazette_ref: self.gazette_ref.clone(),
            effective_on: as_of,
        }
    }
}

/// One search hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// The matching chunk.
    pub chunk: LegalChunk,
    /// Blended relevance score.
    pub score: f64,
    /// Paragraph-precise citation.
    pub citation: CitationRef,
}

/// Errors from the index.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// Database failure.
    #[error("rag db: {0}")]
    Db(#[from] rusqlite::Error),
    /// Serialization failure.
    #[error("rag serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Audit append failure.
    #[error("rag audit: {0}")]
    Audit(#[from] knj_audit::AuditError),
    /// The chunk would create a second open interval for its key.
    #[error("overlapping open interval for {law_code} art. {article}")]
    OverlappingInterval {
        /// Law code of the conflicting key.
        law_code: String,
        /// Article of the conflicting key.
        article: u32,
    },
    /// Unknown chunk id.
    #[error("chunk not found: {0}")]
    NotFound(i64),
}

/// Normalize and tokenize text for the keyword index.
pub fn tokenize(text: &str) -> Vec<String> {
    let nfc: String = text.nfc().collect();
    nfc.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(str::to_string)
        .collect()
}

struct IndexedChunk {
    chunk: LegalChunk,
    vector: Option<Vec<f32>>,
    tokens: HashSet<String>,
}

/// Immutable snapshot published to readers.
struct Snapshot {
    chunks: Vec<IndexedChunk>,
    keyword: HashMap<String, Vec<usize>>,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            chunks: Vec::new(),
            keyword: HashMap::new(),
        }
    }
}

/// Weight of the dense score in the blend.
const DENSE_WEIGHT: f64 = 0.65;
/// Weight of the keyword score in the blend.
const KEYWORD_WEIGHT: f64 = 0.35;
/// Maximum proximity boost for versions enacted close to `as_of`.
const PROXIMITY_BOOST: f64 = 0.05;

/// The time-aware index.
pub struct RagIndex {
    db: Db,
    audit: Arc<AuditLog>,
    embedder: Arc<dyn Embedder>,
    snapshot: RwLock<Arc<Snapshot>>,
    confidence_floor: f64,
}

impl RagIndex {
    /// Attach to the shared database and publish a snapshot of confirmed
    /// chunks.
    pub async fn open(
        db: Db,
        audit: Arc<AuditLog>,
        embedder: Arc<dyn Embedder>,
        confidence_floor: f64,
    ) -> Result<Self, RagError> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS legal_chunks (
                    id             INTEGER PRIMARY KEY AUTOINCREMENT,
                    corpus_id      TEXT NOT NULL,
                    law_code       TEXT NOT NULL,
                    article        INTEGER NOT NULL,
                    paragraph      INTEGER,
                    text           TEXT NOT NULL,
                    gazette_ref    TEXT NOT NULL,
                    effective_from TEXT NOT NULL,
                    effective_to   TEXT,
                    supersedes     INTEGER,
                    vector         TEXT,
                    confirmed      INTEGER NOT NULL DEFAULT 0
                );",
            )?;
        }
        let index = Self {
            db,
            audit,
            embedder,
            snapshot: RwLock::new(Arc::new(Snapshot::empty())),
            confidence_floor,
        };
        index.republish().await?;
        Ok(index)
    }

    /// Ingest a chunk into quarantine. Returns the assigned id.
    ///
    /// The chunk is not searchable until [`confirm`](Self::confirm) — drops
    /// from the watched directory and scheduled scrapes all pass through
    /// this gate.
    pub fn ingest(&self, chunk: &LegalChunk) -> Result<i64, RagError> {
        self.check_open_interval(chunk, None)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO legal_chunks
                (corpus_id, law_code, article, paragraph, text, gazette_ref,
                 effective_from, effective_to, supersedes, vector, confirmed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, 0)",
            params![
                chunk.corpus_id,
                chunk.law_code,
                chunk.article,
                chunk.paragraph,
                chunk.text,
                chunk.gazette_ref,
                chunk.effective_from.to_string(),
                chunk.effective_to.map(|d| d.to_string()),
                chunk.supersedes,
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.audit_corpus("quarantined", id, &chunk.law_code)?;
        Ok(id)
    }

    /// Confirm a quarantined chunk, embed it, and republish the snapshot.
    pub async fn confirm(&self, id: i64, actor: &str) -> Result<(), RagError> {
        let text: String = {
            let conn = self.db.lock();
            conn.query_row(
                "SELECT text FROM legal_chunks WHERE id = ?1 AND confirmed = 0",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(RagError::NotFound(id))?
        };

        let vector = match self.embedder.embed(&text).await {
            Ok(v) => Some(serde_json::to_string(&v)?),
            Err(err) => {
                // Keyword search still works; reindex can embed later.
                warn!(chunk = id, error = %err, "embedding failed, keyword-only");
                None
            }
        };

        {
            let conn = self.db.lock();
            conn.execute(
                "UPDATE legal_chunks SET confirmed = 1, vector = ?1 WHERE id = ?2",
                params![vector, id],
            )?;
        }
        self.audit_confirm(actor, id)?;
        self.republish().await
    }

    /// Supersede `old_id` with a new version from a cutover day onward.
    ///
    /// The old chunk stays bound to all dates up to the day before the
    /// new one's `effective_from`. The new chunk arrives through the same
    /// operator action that confirms it, so it is searchable immediately.
    pub async fn supersede(
        &self,
        old_id: i64,
        new_chunk: &LegalChunk,
        actor: &str,
    ) -> Result<i64, RagError> {
        self.check_open_interval(new_chunk, Some(old_id))?;
        let cutoff = new_chunk.effective_from - Duration::days(1);
        let id = {
            let conn = self.db.lock();
            let updated = conn.execute(
                "UPDATE legal_chunks SET effective_to = ?1 WHERE id = ?2",
                params![cutoff.to_string(), old_id],
            )?;
            if updated == 0 {
                return Err(RagError::NotFound(old_id));
            }
            conn.execute(
                "INSERT INTO legal_chunks
                    (corpus_id, law_code, article, paragraph, text, gazette_ref,
                     effective_from, effective_to, supersedes, vector, confirmed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, 1)",
                params![
                    new_chunk.corpus_id,
                    new_chunk.law_code,
                    new_chunk.article,
                    new_chunk.paragraph,
                    new_chunk.text,
                    new_chunk.gazette_ref,
                    new_chunk.effective_from.to_string(),
                    new_chunk.effective_to.map(|d| d.to_string()),
                    old_id,
                ],
            )?;
            conn.last_insert_rowid()
        };

        if let Ok(vector) = self.embedder.embed(&new_chunk.text).await {
            let conn = self.db.lock();
            conn.execute(
                "UPDATE legal_chunks SET vector = ?1 WHERE id = ?2",
                params![serde_json::to_string(&vector)?, id],
            )?;
        }

        self.audit.append(NewAuditEvent {
            actor: actor.to_string(),
            kind: AuditKind::CorpusChange,
            subject_id: id.to_string(),
            payload: serde_json::json!({
                "outcome": "superseded",
                "old_id": old_id,
                "law_code": new_chunk.law_code,
                "effective_from": new_chunk.effective_from.to_string(),
            }),
        })?;
        self.republish().await?;
        Ok(id)
    }

    /// Chunks sitting in quarantine, oldest first. Admin surface only.
    pub fn quarantined(&self) -> Result<Vec<LegalChunk>, RagError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, corpus_id, law_code, article, paragraph, text, gazette_ref,
                    effective_from, effective_to, supersedes
             FROM legal_chunks WHERE confirmed = 0 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_chunk)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Search the confirmed corpus as of a business-event date.
    pub async fn search(
        &self,
        query: &str,
        as_of: NaiveDate,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, RagError> {
        let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();
        let query_vector = match self.embedder.embed(query).await {
            Ok(v) => Some(v),
            Err(err) => {
                // Dense miss degrades to keyword-only, never to failure.
                warn!(error = %err, "query embedding failed, keyword fallback");
                None
            }
        };

        let snapshot = Arc::clone(&*self.snapshot.read().await);

        // Keyword overlap per chunk via the inverted index.
        let mut overlaps: HashMap<usize, usize> = HashMap::new();
        for token in &query_tokens {
            if let Some(postings) = snapshot.keyword.get(token) {
                for &i in postings {
                    *overlaps.entry(i).or_insert(0) += 1;
                }
            }
        }

        let mut hits: Vec<SearchHit> = Vec::new();
        for (i, indexed) in snapshot.chunks.iter().enumerate() {
            if !indexed.chunk.in_force_on(as_of) {
                continue;
            }
            let dense = match (&query_vector, &indexed.vector) {
                (Some(q), Some(v)) => f64::from(cosine(q, v)),
                _ => 0.0,
            };
            let keyword = if query_tokens.is_empty() {
                0.0
            } else {
                overlaps.get(&i).copied().unwrap_or(0) as f64 / query_tokens.len() as f64
            };
            let mut score = DENSE_WEIGHT * dense + KEYWORD_WEIGHT * keyword;
            if query_vector.is_none() {
                // Keyword-only fallback rescales so the floor still applies.
                score = keyword;
            }
            // Among versions in force, prefer the one enacted closest to
            // the event date.
            let age_years =
                (as_of - indexed.chunk.effective_from).num_days().max(0) as f64 / 365.25;
            score += PROXIMITY_BOOST / (1.0 + age_years);

            if score < self.confidence_floor {
                continue;
            }
            hits.push(SearchHit {
                chunk: indexed.chunk.clone(),
                score,
                citation: indexed.chunk.citation(as_of),
            });
        }

        // Newer enactment wins score ties when it supersedes the other.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let a_supersedes = a.chunk.supersedes.is_some();
                    let b_supersedes = b.chunk.supersedes.is_some();
                    b_supersedes.cmp(&a_supersedes)
                })
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Rebuild the in-memory snapshot from confirmed rows and publish it
    /// atomically. Writers serialize on the database mutex; readers keep
    /// whatever snapshot they already hold.
    pub async fn republish(&self) -> Result<(), RagError> {
        let mut chunks = Vec::new();
        {
            let conn = self.db.lock();
            let mut stmt = conn.prepare(
                "SELECT id, corpus_id, law_code, article, paragraph, text, gazette_ref,
                        effective_from, effective_to, supersedes, vector
                 FROM legal_chunks WHERE confirmed = 1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                let chunk = row_to_chunk(row)?;
                let vector: Option<String> = row.get(10)?;
                Ok((chunk, vector))
            })?;
            for row in rows {
                let (chunk, vector) = row?;
                let vector = match vector {
                    Some(raw) => serde_json::from_str(&raw).ok(),
                    None => None,
                };
                let tokens = tokenize(&chunk.text).into_iter().collect();
                chunks.push(IndexedChunk {
                    chunk,
                    vector,
                    tokens,
                });
            }
        }

        let mut keyword: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, indexed) in chunks.iter().enumerate() {
            for token in &indexed.tokens {
                keyword.entry(token.clone()).or_default().push(i);
            }
        }

        let count = chunks.len();
        *self.snapshot.write().await = Arc::new(Snapshot { chunks, keyword });
        info!(chunks = count, "rag snapshot published");
        Ok(())
    }

    // --- helpers ---

    /// Enforce: at most one open interval per `(law_code, article,
    /// paragraph)` among confirmed and quarantined chunks, excluding the
    /// chunk being superseded.
    fn check_open_interval(
        &self,
        chunk: &LegalChunk,
        superseding: Option<i64>,
    ) -> Result<(), RagError> {
        if chunk.effective_to.is_some() {
            return Ok(());
        }
        let conn = self.db.lock();
        let open: Option<i64> = conn
            .query_row(
                "SELECT id FROM legal_chunks
                 WHERE law_code = ?1 AND article = ?2 AND (paragraph IS ?3)
                   AND effective_to IS NULL",
                params![chunk.law_code, chunk.article, chunk.paragraph],
                |row| row.get(0),
            )
            .optional()?;
        match open {
            Some(id) if Some(id) != superseding => Err(RagError::OverlappingInterval {
                law_code: chunk.law_code.clone(),
                article: chunk.article,
            }),
            _ => Ok(()),
        }
    }

    fn audit_corpus(&self, outcome: &str, id: i64, law_code: &str) -> Result<(), RagError> {
        self.audit.append(NewAuditEvent {
            actor: "system".into(),
            kind: AuditKind::CorpusChange,
            subject_id: id.to_string(),
            payload: serde_json::json!({ "outcome": outcome, "law_code": law_code }),
        })?;
        Ok(())
    }

    fn audit_confirm(&self, actor: &str, id: i64) -> Result<(), RagError> {
        self.audit.append(NewAuditEvent {
            actor: actor.to_string(),
            kind: AuditKind::CorpusChange,
            subject_id: id.to_string(),
            payload: serde_json::json!({ "outcome": "confirmed" }),
        })?;
        Ok(())
    }
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<LegalChunk> {
    let effective_from: String = row.get(7)?;
    let effective_to: Option<String> = row.get(8)?;
    Ok(LegalChunk {
        id: row.get(0)?,
        corpus_id: row.get(1)?,
        law_code: row.get(2)?,
        article: row.get::<_, i64>(3)? as u32,
        paragraph: row.get::<_, Option<i64>>(4)?.map(|p| p as u32),
        text: row.get(5)?,
        gazette_ref: row.get(6)?,
        effective_from: effective_from.parse().unwrap_or_default(),
        effective_to: effective_to.and_then(|s| s.parse().ok()),
        supersedes: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(law: &str, article: u32, text: &str, from: &str) -> LegalChunk {
        LegalChunk {
            id: 0,
            corpus_id: "nn".into(),
            law_code: law.into(),
            article,
            paragraph: Some(1),
            text: text.into(),
            gazette_ref: "NN 73/13".into(),
            effective_from: from.parse().unwrap(),
            effective_to: None,
            supersedes: None,
        }
    }

    async fn index() -> RagIndex {
        let db = knj_audit::open_db_in_memory().unwrap();
        let audit = Arc::new(AuditLog::open(Arc::clone(&db)).unwrap());
        RagIndex::open(db, audit, Arc::new(HashEmbedder::default()), 0.05)
            .await
            .unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn quarantine_gates_searchability() {
        let index = index().await;
        let id = index
            .ingest(&chunk("ZPDV", 75, "obrnuta porezna obveza za stjecanje", "2013-07-01"))
            .unwrap();
        assert!(index
            .search("obrnuta porezna obveza", date("2026-01-01"), 5)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(index.quarantined().unwrap().len(), 1);

        index.confirm(id, "user:admin").await.unwrap();
        let hits = index
            .search("obrnuta porezna obveza", date("2026-01-01"), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].citation.article, 75);
    }

    #[tokio::test]
    async fn time_filter_excludes_out_of_force_versions() {
        let index = index().await;
        let old = index
            .ingest(&chunk("ZPDV", 75, "stopa poreza iznosi dvadeset pet posto", "2013-07-01"))
            .unwrap();
        index.confirm(old, "user:admin").await.unwrap();

        let new_version = LegalChunk {
            effective_from: date("2026-01-01"),
            ..chunk("ZPDV", 75, "stopa poreza iznosi dvadeset tri posto", "2026-01-01")
        };
        index.supersede(old, &new_version, "user:admin").await.unwrap();

        // A query the day before the cutover must hit the old version.
        let before = index
            .search("stopa poreza", date("2025-12-31"), 5)
            .await
            .unwrap();
        assert_eq!(before.len(), 1);
        assert!(before[0].chunk.text.contains("dvadeset pet"));

        let after = index
            .search("stopa poreza", date("2026-01-02"), 5)
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
        assert!(after[0].chunk.text.contains("dvadeset tri"));
    }

    #[tokio::test]
    async fn second_open_interval_rejected() {
        let index = index().await;
        let first = index
            .ingest(&chunk("ZPDV", 17, "mjesto oporezivanja usluga", "2013-07-01"))
            .unwrap();
        index.confirm(first, "user:admin").await.unwrap();
        let err = index
            .ingest(&chunk("ZPDV", 17, "mjesto oporezivanja, preinaka", "2020-01-01"))
            .unwrap_err();
        assert!(matches!(err, RagError::OverlappingInterval { .. }));
    }

    #[tokio::test]
    async fn every_hit_satisfies_interval_invariant() {
        let index = index().await;
        for (article, from) in [(10, "2013-07-01"), (11, "2019-01-01"), (12, "2024-01-01")] {
            let id = index
                .ingest(&chunk("ZOR", article, "radno vrijeme i odmor radnika", from))
                .unwrap();
            index.confirm(id, "user:admin").await.unwrap();
        }
        let as_of = date("2020-06-15");
        let hits = index.search("radno vrijeme", as_of, 10).await.unwrap();
        assert!(!hits.is_empty());
        for hit in hits {
            assert!(hit.chunk.in_force_on(as_of));
            // 2024 version is not yet in force on the query date.
            assert!(hit.chunk.effective_from <= as_of);
        }
    }
}
