// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! `knjizbad` — the Knjižba server binary and its admin subcommands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use knj_approval::ApprovalGateway;
use knj_audit::AuditLog;
use knj_auth::{AuthPolicy, AuthService, Role};
use knj_blob::{BlobStore, GcPolicy};
use knj_config::ServerConfig;
use knj_core::Currency;
use knj_daemon::{build_app, AppState, EventBus, OrchestratorOcr};
use knj_export::ExportService;
use knj_extract::ExtractorFabric;
use knj_infer::{HttpModel, HttpVisionLoader, Orchestrator, OrchestratorConfig};
use knj_memory::{MemoryPolicy, MemoryStore};
use knj_pipeline::{BookingStore, Pipeline, PipelineConfig};
use knj_rag::{HttpEmbedder, LegalChunk, RagIndex};
use knj_verify::{Tolerances, Verifier};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for configuration errors.
const EXIT_CONFIG: u8 = 2;
/// Exit code for unreachable dependencies (bind, database).
const EXIT_DEPENDENCY: u8 = 3;
/// Exit code for audit integrity failures.
const EXIT_INTEGRITY: u8 = 4;

#[derive(Parser, Debug)]
#[command(name = "knjizbad", version, about = "Knjižba accounting automation server")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "knjizba.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server.
    Serve,
    /// Verify the audit hash chain and exit.
    VerifyAudit,
    /// Create an operator account.
    CreateUser {
        /// Login name.
        #[arg(long)]
        username: String,
        /// Password (prompted deployments pass it via stdin redirection).
        #[arg(long)]
        password: String,
        /// Role: admin, accountant, or assistant.
        #[arg(long, default_value = "assistant")]
        role: String,
    },
    /// Promote a quarantined legal chunk to searchable state.
    ConfirmCorpus {
        /// Chunk id, as listed by the quarantine surface.
        #[arg(long)]
        id: i64,
        /// Operator recorded in the audit event.
        #[arg(long, default_value = "admin")]
        actor: String,
    },
    /// Sweep unreferenced blobs older than the retention age.
    GcBlobs {
        /// Minimum blob age in days.
        #[arg(long, default_value_t = 90)]
        min_age_days: i64,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match ServerConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let filter = EnvFilter::try_new(format!("knj={0},knjizbad={0}", config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("runtime init failed: {err}");
            return ExitCode::from(EXIT_DEPENDENCY);
        }
    };

    match runtime.block_on(run(args.command, config)) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "fatal");
            ExitCode::from(EXIT_DEPENDENCY)
        }
    }
}

async fn run(command: Command, config: ServerConfig) -> Result<ExitCode> {
    std::fs::create_dir_all(&config.data_dir).context("create data dir")?;
    std::fs::create_dir_all(config.watched_dir()).context("create watched dir")?;
    std::fs::create_dir_all(config.quarantine_dir()).context("create quarantine dir")?;

    let db = knj_audit::open_db(&config.db_path()).context("open database")?;
    let audit = Arc::new(AuditLog::open(Arc::clone(&db)).context("open audit log")?);

    match command {
        Command::VerifyAudit => {
            let last = audit.last_seq()?;
            match audit.verify(1, last) {
                Ok(()) => {
                    println!("audit chain intact ({last} events)");
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    eprintln!("audit chain BROKEN: {err}");
                    Ok(ExitCode::from(EXIT_INTEGRITY))
                }
            }
        }
        Command::CreateUser {
            username,
            password,
            role,
        } => {
            let role = match role.as_str() {
                "admin" => Role::Admin,
                "accountant" => Role::Accountant,
                "assistant" => Role::Assistant,
                other => {
                    eprintln!("unknown role '{other}'");
                    return Ok(ExitCode::from(EXIT_CONFIG));
                }
            };
            let auth = AuthService::open(db, audit, auth_policy(&config))?;
            auth.create_user(&username, &password, role)?;
            println!("user '{username}' created");
            Ok(ExitCode::SUCCESS)
        }
        Command::ConfirmCorpus { id, actor } => {
            let rag = RagIndex::open(
                db,
                audit,
                Arc::new(HttpEmbedder::new(
                    config.embedding_endpoint.clone(),
                    Duration::from_secs(30),
                )),
                config.rag_confidence_floor,
            )
            .await?;
            match rag.confirm(id, &format!("user:{actor}")).await {
                Ok(()) => {
                    println!("chunk {id} confirmed and searchable");
                    Ok(ExitCode::SUCCESS)
                }
                Err(knj_rag::RagError::NotFound(_)) => {
                    eprintln!("no quarantined chunk with id {id}");
                    Ok(ExitCode::from(EXIT_CONFIG))
                }
                Err(err) => Err(err.into()),
            }
        }
        Command::GcBlobs { min_age_days } => {
            let blobs = BlobStore::open(config.blobs_dir())?;
            let store = BookingStore::open(Arc::clone(&db), Arc::clone(&audit))?;
            let referenced = store
                .list(&knj_pipeline::BookingFilter::default())?
                .into_iter()
                .filter_map(|summary| store.get(summary.id).ok().and_then(|b| b.source))
                .collect();
            let report = blobs.gc(&GcPolicy {
                min_age_days,
                referenced,
            })?;
            println!(
                "gc: removed {} kept {} referenced, {} young",
                report.removed, report.kept_referenced, report.kept_young
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve => serve(config, db, audit).await,
    }
}

async fn serve(config: ServerConfig, db: knj_audit::Db, audit: Arc<AuditLog>) -> Result<ExitCode> {
    // Refuse to serve over a broken chain.
    let last = audit.last_seq()?;
    if last > 0 && audit.verify(1, last).is_err() {
        error!("audit chain verification failed at startup");
        return Ok(ExitCode::from(EXIT_INTEGRITY));
    }

    let home_currency = Currency::from_str(&config.home_currency)
        .context("home_currency re-parse after validation")?;

    let auth = Arc::new(AuthService::open(
        Arc::clone(&db),
        Arc::clone(&audit),
        auth_policy(&config),
    )?);
    let blobs = Arc::new(BlobStore::open(config.blobs_dir())?);
    let memory = Arc::new(MemoryStore::open(
        Arc::clone(&db),
        Arc::clone(&audit),
        MemoryPolicy {
            l1_retention_days: config.l1_retention_days,
            default_half_life_days: config
                .l2_half_life_defaults
                .get("account")
                .copied()
                .unwrap_or(90),
            score_floor: config.l2_score_floor,
            promote_after: 2,
        },
    )?);

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(HttpModel::new(
            config.inference_endpoint.clone(),
            Duration::from_secs(120),
        )),
        Arc::new(HttpVisionLoader::new(
            config.vision_endpoint.clone(),
            Duration::from_secs(120),
        )),
        OrchestratorConfig {
            max_sessions: config.max_sessions,
            queue_len: config.inference_queue_len,
            token_budget: config.inference_token_budget,
            ..Default::default()
        },
    ));

    let rag = Arc::new(
        RagIndex::open(
            Arc::clone(&db),
            Arc::clone(&audit),
            Arc::new(HttpEmbedder::new(
                config.embedding_endpoint.clone(),
                Duration::from_secs(30),
            )),
            config.rag_confidence_floor,
        )
        .await?,
    );

    let fabric = Arc::new(ExtractorFabric::standard(
        home_currency.clone(),
        Arc::new(OrchestratorOcr::new(
            Arc::clone(&orchestrator),
            Duration::from_secs(120),
        )),
    ));
    let verifier = Arc::new(Verifier::with_default_rules(Tolerances {
        home_currency: home_currency.clone(),
        ..Default::default()
    }));

    let store = Arc::new(BookingStore::open(Arc::clone(&db), Arc::clone(&audit))?);
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&store),
        Arc::clone(&blobs),
        fabric,
        verifier,
        Arc::clone(&memory),
        Arc::clone(&rag),
        Arc::clone(&orchestrator),
        PipelineConfig {
            home_currency,
            aml_cash_threshold: config.aml_cash_threshold,
            consensus_auto_advance: config.consensus_auto_advance,
            infer_deadline: Duration::from_secs(60),
        },
    ));
    let approval = Arc::new(ApprovalGateway::new(
        Arc::clone(&pipeline),
        Arc::clone(&memory),
    ));
    let export = Arc::new(ExportService::new(
        Arc::clone(&store),
        config.export_targets.clone(),
    )?);

    let state = Arc::new(AppState {
        config: config.clone(),
        auth,
        pipeline: Arc::clone(&pipeline),
        approval,
        export,
        rag: Arc::clone(&rag),
        audit: Arc::clone(&audit),
        orchestrator: Arc::clone(&orchestrator),
        memory: Arc::clone(&memory),
        events: EventBus::new(256),
    });

    spawn_maintenance(Arc::clone(&state));

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(bind = %bind, data_dir = %config.data_dir.display(), "knjizbad listening");

    let app = build_app(state);
    axum::serve(listener, app).await.context("serve")?;
    Ok(ExitCode::SUCCESS)
}

/// Periodic in-process chores: journal sweep, preference export, vision
/// idle-unload, backpressure resume, and the watched corpus directory.
fn spawn_maintenance(state: Arc<AppState>) {
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tick.tick().await;
                if let Err(err) = state.memory.sweep_l1() {
                    warn!(error = %err, "l1 sweep failed");
                }
            }
        });
    }
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(86_400));
            loop {
                tick.tick().await;
                let path = state.config.preference_export_dir().join(format!(
                    "pairs-{}.jsonl",
                    chrono::Utc::now().date_naive()
                ));
                match state.memory.export_l3_jsonl(&path) {
                    Ok(0) => {}
                    Ok(count) => info!(count, path = %path.display(), "preference pairs exported"),
                    Err(err) => warn!(error = %err, "preference export failed"),
                }
            }
        });
    }
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                state.orchestrator.maintain().await;
                if state.pipeline.is_paused() && state.orchestrator.queue_depth() == 0 {
                    state.pipeline.resume();
                }
            }
        });
    }
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tick.tick().await;
                if let Err(err) = scan_watched_dir(&state) {
                    warn!(error = %err, "watched dir scan failed");
                }
            }
        });
    }
}

/// Move operator-dropped chunk files into quarantine records.
fn scan_watched_dir(state: &AppState) -> Result<()> {
    let watched = state.config.watched_dir();
    let quarantine = state.config.quarantine_dir();
    for entry in std::fs::read_dir(&watched)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = std::fs::read_to_string(&path)?;
        match serde_json::from_str::<LegalChunk>(&raw) {
            Ok(chunk) => match state.rag.ingest(&chunk) {
                Ok(id) => {
                    info!(chunk = id, file = %path.display(), "corpus drop quarantined");
                    let dest = quarantine.join(entry.file_name());
                    let _ = std::fs::rename(&path, dest);
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "corpus drop rejected");
                    let dest = quarantine.join(format!(
                        "rejected-{}",
                        entry.file_name().to_string_lossy()
                    ));
                    let _ = std::fs::rename(&path, dest);
                }
            },
            Err(err) => {
                warn!(file = %path.display(), error = %err, "corpus drop unparseable");
            }
        }
    }
    Ok(())
}

fn auth_policy(config: &ServerConfig) -> AuthPolicy {
    AuthPolicy {
        session_ttl_minutes: config.session_ttl_minutes,
        lockout_after_failures: config.lockout_after_failures,
        lockout_cooldown_secs: config.lockout_cooldown_secs,
        rate_limit_per_user: config.rate_limit_per_user,
        concurrent_streams_per_user: config.concurrent_streams_per_user,
    }
}
