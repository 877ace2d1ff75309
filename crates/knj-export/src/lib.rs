// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Deterministic, exactly-once ERP export."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! The exporter renders an approved booking into a byte-deterministic
//! artifact, delivers it to the configured target (file drop or local
//! HTTP), and commits the receipt together with the `exported` state
//! flip in one transaction. Repeated exports return the stored receipt
//! unchanged; transient delivery failures leave the booking `approved`
//! with an `ExportPending` surface, permanent schema failures block it.

mod render;

pub use render::{render_csv, render_json, render_xml, RenderError};

use chrono::{DateTime, Utc};
use knj_audit::{AuditKind, AuditLog, NewAuditEvent};
use knj_config::ExportTarget;
use knj_core::{sha256_hex, Booking, BookingStatus};
use knj_error::{ErrorCode, KnjError};
use knj_pipeline::{BookingStore, PipelineError};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Receipt of a completed export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportReceipt {
    /// Target name from configuration.
    pub target: String,
    /// Deterministic artifact filename.
    pub filename: String,
    /// SHA-256 of the artifact bytes.
    pub bytes_hash: String,
    /// Delivery instant.
    pub delivered_at: DateTime<Utc>,
}

/// Errors from the exporter.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// Unknown target name.
    #[error("unknown export target: {0}")]
    UnknownTarget(String),

    /// The booking is not in an exportable state.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Transient delivery failure after retries; booking stays approved.
    #[error("export pending for {booking}: {reason}")]
    Pending {
        /// Booking id.
        booking: Uuid,
        /// Last delivery error.
        reason: String,
    },

    /// Permanent failure; the booking was blocked with the diagnostic.
    #[error("export failed permanently for {booking}: {reason}")]
    Permanent {
        /// Booking id.
        booking: Uuid,
        /// Validator diagnostic.
        reason: String,
    },

    /// Database failure.
    #[error("export db: {0}")]
    Db(#[from] rusqlite::Error),

    /// Audit failure.
    #[error("export audit: {0}")]
    Audit(#[from] knj_audit::AuditError),
}

impl From<&ExportError> for KnjError {
    fn from(err: &ExportError) -> Self {
        match err {
            ExportError::UnknownTarget(_) => KnjError::new(ErrorCode::InputInvalid, err.to_string()),
            ExportError::Pipeline(inner) => inner.into(),
            ExportError::Pending { .. } => KnjError::new(ErrorCode::ExportPending, err.to_string()),
            ExportError::Permanent { .. } => KnjError::new(ErrorCode::ExportFailed, err.to_string()),
            _ => KnjError::internal(err.to_string()),
        }
    }
}

/// Delivery retry cap for transient failures.
const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// The export service.
pub struct ExportService {
    store: Arc<BookingStore>,
    audit: Arc<AuditLog>,
    targets: BTreeMap<String, ExportTarget>,
    client: reqwest::Client,
}

impl ExportService {
    /// Wire the exporter over the booking store and configured targets.
    pub fn new(
        store: Arc<BookingStore>,
        targets: BTreeMap<String, ExportTarget>,
    ) -> Result<Self, ExportError> {
        let audit = store.audit();
        {
            let db = store.db();
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS export_receipts (
                    booking_id   TEXT NOT NULL,
                    target       TEXT NOT NULL,
                    filename     TEXT NOT NULL,
                    bytes_hash   TEXT NOT NULL,
                    delivered_at TEXT NOT NULL,
                    PRIMARY KEY (booking_id, target)
                );",
            )?;
        }
        Ok(Self {
            store,
            audit,
            targets,
            client: reqwest::Client::new(),
        })
    }

    /// Export every approved booking of a client to one target.
    pub async fn export_client(
        &self,
        client_id: &str,
        target: &str,
    ) -> Result<Vec<ExportReceipt>, ExportError> {
        let approved = self.store.list(&knj_pipeline::BookingFilter {
            status: Some(BookingStatus::Approved),
            client_id: Some(client_id.to_string()),
        })?;
        let mut receipts = Vec::new();
        for summary in approved {
            receipts.push(self.export(summary.id, target).await?);
        }
        Ok(receipts)
    }

    /// Export one booking. Exactly-once: repeat calls return the stored
    /// receipt without touching the target again.
    pub async fn export(&self, booking_id: Uuid, target: &str) -> Result<ExportReceipt, ExportError> {
        let target_spec = self
            .targets
            .get(target)
            .ok_or_else(|| ExportError::UnknownTarget(target.to_string()))?
            .clone();

        let lock = self.store.lock_for(booking_id);
        let _guard = lock.lock().await;

        let mut booking = self.store.get(booking_id)?;
        if booking.status == BookingStatus::Exported {
            if let Some(receipt) = self.stored_receipt(booking_id, target)? {
                return Ok(receipt);
            }
        }
        if booking.status != BookingStatus::Approved {
            return Err(ExportError::Pipeline(PipelineError::StateConflict {
                id: booking_id,
                current: booking.status.to_string(),
            }));
        }

        // Render. A schema failure is permanent: block the booking.
        let rendered = match self.render(&booking, &target_spec) {
            Ok(artifact) => artifact,
            Err(err) => {
                self.block(&mut booking, &err.to_string())?;
                return Err(ExportError::Permanent {
                    booking: booking_id,
                    reason: err.to_string(),
                });
            }
        };
        let (filename, bytes) = rendered;
        let bytes_hash = sha256_hex(&bytes);

        // Deliver with capped backoff.
        let mut attempt = 0;
        let delivery = loop {
            attempt += 1;
            match self.deliver(&target_spec, &filename, &bytes).await {
                Ok(()) => break Ok(()),
                Err(DeliveryError::Permanent(reason)) => break Err(reason),
                Err(DeliveryError::Transient(reason)) if attempt >= MAX_DELIVERY_ATTEMPTS => {
                    warn!(booking = %booking_id, %reason, "delivery retries exhausted");
                    return Err(ExportError::Pending {
                        booking: booking_id,
                        reason,
                    });
                }
                Err(DeliveryError::Transient(reason)) => {
                    warn!(booking = %booking_id, attempt, %reason, "delivery retry");
                    tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt))).await;
                }
            }
        };
        if let Err(reason) = delivery {
            self.block(&mut booking, &reason)?;
            return Err(ExportError::Permanent {
                booking: booking_id,
                reason,
            });
        }

        // Receipt + state flip, one transaction.
        let receipt = ExportReceipt {
            target: target.to_string(),
            filename: filename.clone(),
            bytes_hash: bytes_hash.clone(),
            delivered_at: Utc::now(),
        };
        let receipt_row = receipt.clone();
        let id_str = booking_id.to_string();
        self.store.transition_with(
            &mut booking,
            BookingStatus::Approved,
            BookingStatus::Exported,
            "system",
            serde_json::json!({ "target": target, "bytes_hash": bytes_hash }),
            move |tx| {
                tx.execute(
                    "INSERT INTO export_receipts
                        (booking_id, target, filename, bytes_hash, delivered_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        id_str,
                        receipt_row.target,
                        receipt_row.filename,
                        receipt_row.bytes_hash,
                        receipt_row.delivered_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            },
        )?;
        self.audit.append(NewAuditEvent {
            actor: "system".into(),
            kind: AuditKind::ExportReceipt,
            subject_id: booking_id.to_string(),
            payload: serde_json::json!({
                "target": target,
                "filename": filename,
                "bytes_hash": bytes_hash,
            }),
        })?;
        info!(booking = %booking_id, target, filename = %receipt.filename, "exported");
        Ok(receipt)
    }

    /// Receipt previously stored for `(booking, target)`, if any.
    pub fn stored_receipt(
        &self,
        booking_id: Uuid,
        target: &str,
    ) -> Result<Option<ExportReceipt>, ExportError> {
        let db = self.store.db();
        let conn = db.lock();
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT filename, bytes_hash, delivered_at
                 FROM export_receipts WHERE booking_id = ?1 AND target = ?2",
                params![booking_id.to_string(), target],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(row.map(|(filename, bytes_hash, delivered_at)| ExportReceipt {
            target: target.to_string(),
            filename,
            bytes_hash,
            delivered_at: DateTime::parse_from_rfc3339(&delivered_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }))
    }

    // --- internals ---

    fn render(
        &self,
        booking: &Booking,
        target: &ExportTarget,
    ) -> Result<(String, Vec<u8>), RenderError> {
        let stem = format!(
            "knjizba-{}-{}",
            booking.client_id,
            booking
                .fingerprint()
                .map_err(|e| RenderError::Io(e.to_string()))?
                .short()
        );
        match target {
            ExportTarget::XmlFile { .. } => Ok((format!("{stem}.xml"), render_xml(booking)?)),
            ExportTarget::CsvFile { .. } => Ok((format!("{stem}.csv"), render_csv(booking)?)),
            ExportTarget::Http { .. } => Ok((format!("{stem}.json"), render_json(booking)?)),
        }
    }

    async fn deliver(
        &self,
        target: &ExportTarget,
        filename: &str,
        bytes: &[u8],
    ) -> Result<(), DeliveryError> {
        match target {
            ExportTarget::XmlFile { dest } | ExportTarget::CsvFile { dest } => {
                write_file_drop(dest, filename, bytes)
            }
            ExportTarget::Http { dest } => {
                let response = self
                    .client
                    .post(dest)
                    .header("content-type", "application/json")
                    .body(bytes.to_vec())
                    .timeout(Duration::from_secs(10))
                    .send()
                    .await
                    .map_err(|e| DeliveryError::Transient(e.to_string()))?;
                let status = response.status();
                if status.is_success() {
                    Ok(())
                } else if status.is_client_error() {
                    Err(DeliveryError::Permanent(format!(
                        "target rejected artifact: {status}"
                    )))
                } else {
                    Err(DeliveryError::Transient(format!("target status {status}")))
                }
            }
        }
    }

    fn block(&self, booking: &mut Booking, reason: &str) -> Result<(), ExportError> {
        self.store.transition(
            booking,
            BookingStatus::Approved,
            BookingStatus::Blocked,
            "system",
            serde_json::json!({ "export_error": reason }),
        )?;
        Ok(())
    }
}

enum DeliveryError {
    Transient(String),
    Permanent(String),
}

fn write_file_drop(dest: &PathBuf, filename: &str, bytes: &[u8]) -> Result<(), DeliveryError> {
    std::fs::create_dir_all(dest).map_err(|e| DeliveryError::Transient(e.to_string()))?;
    let path = dest.join(filename);
    let tmp = path.with_extension("part");
    std::fs::write(&tmp, bytes).map_err(|e| DeliveryError::Transient(e.to_string()))?;
    std::fs::rename(&tmp, &path).map_err(|e| DeliveryError::Transient(e.to_string()))?;
    Ok(())
}
