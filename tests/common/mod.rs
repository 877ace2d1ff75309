// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared test stack: every service wired over an in-memory database,
//! temp directories, the deterministic mock model, and the hash embedder.

// Each suite compiles this module separately and uses a different slice.
#![allow(dead_code)]

use async_trait::async_trait;
use knj_approval::ApprovalGateway;
use knj_audit::{AuditLog, Db};
use knj_auth::{AuthPolicy, AuthService, Role, Session};
use knj_blob::BlobStore;
use knj_config::ExportTarget;
use knj_core::Currency;
use knj_export::ExportService;
use knj_extract::{ExtractorFabric, OcrEngine, OcrError};
use knj_infer::{MockModel, ModelBackend, Orchestrator, OrchestratorConfig, VisionLoader};
use knj_memory::{MemoryPolicy, MemoryStore};
use knj_pipeline::{BookingStore, Pipeline, PipelineConfig};
use knj_rag::{HashEmbedder, LegalChunk, RagIndex};
use knj_verify::{Tolerances, Verifier};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// OCR engine returning a fixed transcript (or unavailability).
pub struct ScriptedOcr(pub Option<String>);

#[async_trait]
impl OcrEngine for ScriptedOcr {
    async fn ocr(&self, _bytes: &[u8], _media_type: &str) -> Result<String, OcrError> {
        match &self.0 {
            Some(text) => Ok(text.clone()),
            None => Err(OcrError::Unavailable("no vision model in tests".into())),
        }
    }
}

struct NoVision;

#[async_trait]
impl VisionLoader for NoVision {
    async fn load(&self) -> Result<Arc<dyn ModelBackend>, knj_infer::BackendError> {
        Err(knj_infer::BackendError::Failed("tests run without vision".into()))
    }
}

/// The full service stack used by the integration suites.
pub struct Stack {
    pub db: Db,
    pub audit: Arc<AuditLog>,
    pub auth: Arc<AuthService>,
    pub blobs: Arc<BlobStore>,
    pub store: Arc<BookingStore>,
    pub memory: Arc<MemoryStore>,
    pub rag: Arc<RagIndex>,
    pub orchestrator: Arc<Orchestrator>,
    pub pipeline: Arc<Pipeline>,
    pub approval: Arc<ApprovalGateway>,
    pub export: Arc<ExportService>,
    pub export_dir: tempfile::TempDir,
    _blob_dir: tempfile::TempDir,
}

/// The canned classification model the pipeline tests run against.
pub fn mock_primary(id: &str) -> Arc<MockModel> {
    Arc::new(
        MockModel::new(id)
            .with_reply(
                "class=invoice_in",
                r#"{"account":"4000","vat_class":"standard_25"}"#,
            )
            .with_reply(
                "class=invoice_eu",
                r#"{"account":"4000","vat_class":"reverse_charge"}"#,
            )
            .with_reply(
                "class=cash_register",
                r#"{"account":"1020","vat_class":"zero"}"#,
            )
            .with_reply("chat", "dobar dan, kolega"),
    )
}

pub async fn stack() -> Stack {
    stack_with(mock_primary("mock-primary"), None).await
}

pub async fn stack_with(primary: Arc<MockModel>, ocr_text: Option<String>) -> Stack {
    let db = knj_audit::open_db_in_memory().unwrap();
    let audit = Arc::new(AuditLog::open(Arc::clone(&db)).unwrap());

    let auth = Arc::new(
        AuthService::open(
            Arc::clone(&db),
            Arc::clone(&audit),
            AuthPolicy {
                session_ttl_minutes: 60,
                lockout_after_failures: 5,
                lockout_cooldown_secs: 60,
                rate_limit_per_user: 1_000,
                concurrent_streams_per_user: 4,
            },
        )
        .unwrap(),
    );

    let blob_dir = tempfile::tempdir().unwrap();
    let blobs = Arc::new(BlobStore::open(blob_dir.path().join("blobs")).unwrap());

    let memory = Arc::new(
        MemoryStore::open(
            Arc::clone(&db),
            Arc::clone(&audit),
            MemoryPolicy {
                promote_after: 2,
                ..Default::default()
            },
        )
        .unwrap(),
    );

    let rag = Arc::new(
        RagIndex::open(
            Arc::clone(&db),
            Arc::clone(&audit),
            Arc::new(HashEmbedder::default()),
            0.05,
        )
        .await
        .unwrap(),
    );

    let orchestrator = Arc::new(Orchestrator::new(
        primary,
        Arc::new(NoVision),
        OrchestratorConfig::default(),
    ));

    let fabric = Arc::new(ExtractorFabric::standard(
        Currency::eur(),
        Arc::new(ScriptedOcr(ocr_text)),
    ));
    let verifier = Arc::new(Verifier::with_default_rules(Tolerances::default()));

    let store = Arc::new(BookingStore::open(Arc::clone(&db), Arc::clone(&audit)).unwrap());
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&store),
        Arc::clone(&blobs),
        fabric,
        verifier,
        Arc::clone(&memory),
        Arc::clone(&rag),
        Arc::clone(&orchestrator),
        PipelineConfig {
            home_currency: Currency::eur(),
            aml_cash_threshold: Decimal::new(10_000, 0),
            consensus_auto_advance: 0.95,
            infer_deadline: Duration::from_secs(10),
        },
    ));
    let approval = Arc::new(ApprovalGateway::new(
        Arc::clone(&pipeline),
        Arc::clone(&memory),
    ));

    let export_dir = tempfile::tempdir().unwrap();
    let mut targets = BTreeMap::new();
    targets.insert(
        "synesis".to_string(),
        ExportTarget::XmlFile {
            dest: export_dir.path().join("xml"),
        },
    );
    targets.insert(
        "pantheon".to_string(),
        ExportTarget::CsvFile {
            dest: export_dir.path().join("csv"),
        },
    );
    let export = Arc::new(ExportService::new(Arc::clone(&store), targets).unwrap());

    Stack {
        db,
        audit,
        auth,
        blobs,
        store,
        memory,
        rag,
        orchestrator,
        pipeline,
        approval,
        export,
        export_dir,
        _blob_dir: blob_dir,
    }
}

/// A logged-in accountant session.
pub fn accountant(stack: &Stack, name: &str) -> Session {
    stack
        .auth
        .create_user(name, "lozinka-123", Role::Accountant)
        .ok();
    stack.auth.login(name, "lozinka-123").unwrap()
}

/// A logged-in read-only assistant session.
pub fn assistant(stack: &Stack, name: &str) -> Session {
    stack.auth.create_user(name, "lozinka-123", Role::Assistant).ok();
    stack.auth.login(name, "lozinka-123").unwrap()
}

/// The S1 domestic invoice: structured XML, supplier OIB 12345678903,
/// net 1000.00 EUR at 25 %.
pub const DOMESTIC_INVOICE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Invoice>
  <Supplier>
    <Name>Uredski Centar d.o.o.</Name>
    <Oib>12345678903</Oib>
    <Iban>HR1723600001101234565</Iban>
  </Supplier>
  <Number>2026-0042</Number>
  <IssueDate>2026-03-15</IssueDate>
  <DueDate>2026-04-14</DueDate>
  <Currency>EUR</Currency>
  <Lines>
    <VatLine rate="25"><Base>1000.00</Base><Amount>250.00</Amount></VatLine>
  </Lines>
  <Totals><Net>1000.00</Net><Vat>250.00</Vat><Gross>1250.00</Gross></Totals>
</Invoice>"#;

/// The S2 EU invoice: German supplier VAT id, net 5000.00, VAT 0.
pub const EU_INVOICE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Invoice>
  <Supplier>
    <Name>Maschinen GmbH</Name>
    <VatId>DE123456789</VatId>
  </Supplier>
  <Number>RE-2026-77</Number>
  <IssueDate>2026-03-20</IssueDate>
  <Currency>EUR</Currency>
  <Lines>
    <VatLine rate="0"><Base>5000.00</Base><Amount>0.00</Amount></VatLine>
  </Lines>
  <Totals><Net>5000.00</Net><Vat>0.00</Vat><Gross>5000.00</Gross></Totals>
</Invoice>"#;

/// A confirmed legal chunk for the reverse-charge article.
pub async fn seed_reverse_charge_chunk(stack: &Stack) {
    let id = stack
        .rag
        .ingest(&LegalChunk {
            id: 0,
            corpus_id: "nn".into(),
            law_code: "ZPDV".into(),
            article: 75,
            paragraph: Some(2),
            text: "Obrnuta porezna obveza: porez placa porezni obveznik kojem je obavljena \
                   isporuka pri stjecanju dobara iz druge drzave clanice."
                .into(),
            gazette_ref: "NN 73/13".into(),
            effective_from: "2013-07-01".parse().unwrap(),
            effective_to: None,
            supersedes: None,
        })
        .unwrap();
    stack.rag.confirm(id, "user:admin").await.unwrap();
}
