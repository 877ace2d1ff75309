// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and environment shadowing.
//!
//! The daemon reads one TOML file into [`ServerConfig`]. A small, fixed set
//! of environment variables may shadow deployment-specific values (host,
//! port, data directory, log level); nothing else in the environment
//! influences behavior.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use knj_core::DocClass;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found or unreadable.
    #[error("config file not readable: {path}")]
    FileNotReadable {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// A model endpoint: where to reach it and which model to ask for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEndpoint {
    /// Base URL of the local inference server.
    pub url: String,
    /// Model identifier passed on each request.
    pub model_id: String,
}

/// One configured ERP export target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExportTarget {
    /// Drop XML artifacts into a directory.
    XmlFile {
        /// Destination directory.
        dest: PathBuf,
    },
    /// Drop CSV artifacts into a directory.
    CsvFile {
        /// Destination directory.
        dest: PathBuf,
    },
    /// POST JSON artifacts to a local HTTP endpoint.
    Http {
        /// Destination URL.
        dest: String,
    },
}

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind host.
    #[serde(default = "defaults::host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// Root data directory (blobs, database, watched corpus drops).
    #[serde(default = "defaults::data_dir")]
    pub data_dir: PathBuf,
    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default = "defaults::log_level")]
    pub log_level: String,

    /// Concurrent inference slots.
    #[serde(default = "defaults::max_sessions")]
    pub max_sessions: usize,
    /// Bounded inference queue length before `Overloaded`.
    #[serde(default = "defaults::queue_len")]
    pub inference_queue_len: usize,
    /// Total prompt tokens admitted in flight.
    #[serde(default = "defaults::token_budget")]
    pub inference_token_budget: u64,
    /// Per-user request quota, requests per minute.
    #[serde(default = "defaults::rate_limit")]
    pub rate_limit_per_user: u32,
    /// Per-user concurrent stream cap.
    #[serde(default = "defaults::stream_cap")]
    pub concurrent_streams_per_user: u32,

    /// Cash amount (home currency) above which a booking needs review.
    #[serde(default = "defaults::aml_threshold")]
    pub aml_cash_threshold: Decimal,
    /// Home currency ISO code.
    #[serde(default = "defaults::home_currency")]
    pub home_currency: String,

    /// L1 episodic journal retention, days.
    #[serde(default = "defaults::l1_retention")]
    pub l1_retention_days: u32,
    /// L2 half-life defaults by rule kind, days.
    #[serde(default = "defaults::l2_half_life")]
    pub l2_half_life_defaults: BTreeMap<String, u32>,
    /// Decayed-score floor below which an L2 rule is no longer live.
    #[serde(default = "defaults::l2_floor")]
    pub l2_score_floor: f64,

    /// Minimum RAG blend score for a chunk to be cited.
    #[serde(default = "defaults::rag_floor")]
    pub rag_confidence_floor: f64,

    /// Consensus score required for auto-advance to `proposed`.
    #[serde(default = "defaults::consensus_floor")]
    pub consensus_auto_advance: f64,

    /// Monetary bookings always require operator approval. Deserializable
    /// for explicitness, but `false` fails validation.
    #[serde(default = "defaults::approval_required")]
    pub approval_required_for_monetary: bool,

    /// Named export targets.
    #[serde(default)]
    pub export_targets: BTreeMap<String, ExportTarget>,

    /// Primary text model endpoint.
    pub inference_endpoint: ModelEndpoint,
    /// Vision model endpoint (lazy-loaded).
    pub vision_endpoint: ModelEndpoint,
    /// Embedding model endpoint.
    pub embedding_endpoint: ModelEndpoint,

    /// Failed-login lockout: consecutive failures before cooldown.
    #[serde(default = "defaults::lockout_failures")]
    pub lockout_after_failures: u32,
    /// Failed-login lockout cooldown, seconds.
    #[serde(default = "defaults::lockout_cooldown")]
    pub lockout_cooldown_secs: u64,

    /// Session lifetime, minutes.
    #[serde(default = "defaults::session_ttl")]
    pub session_ttl_minutes: u64,

    /// Document classes accepted at upload. Defaults to the full catalog.
    #[serde(default = "defaults::doc_classes")]
    pub accepted_doc_classes: Vec<DocClass>,
}

mod defaults {
    use super::*;

    pub fn host() -> String {
        "127.0.0.1".into()
    }
    pub fn port() -> u16 {
        8471
    }
    pub fn data_dir() -> PathBuf {
        PathBuf::from("./knjizba-data")
    }
    pub fn log_level() -> String {
        "info".into()
    }
    pub fn max_sessions() -> usize {
        4
    }
    pub fn queue_len() -> usize {
        32
    }
    pub fn token_budget() -> u64 {
        24_000
    }
    pub fn rate_limit() -> u32 {
        60
    }
    pub fn stream_cap() -> u32 {
        2
    }
    pub fn aml_threshold() -> Decimal {
        Decimal::new(10_000, 0)
    }
    pub fn home_currency() -> String {
        "EUR".into()
    }
    pub fn l1_retention() -> u32 {
        30
    }
    pub fn l2_half_life() -> BTreeMap<String, u32> {
        let mut m = BTreeMap::new();
        m.insert("account".to_string(), 90);
        m.insert("vat_class".to_string(), 120);
        m
    }
    pub fn l2_floor() -> f64 {
        0.15
    }
    pub fn rag_floor() -> f64 {
        0.35
    }
    pub fn consensus_floor() -> f64 {
        0.95
    }
    pub fn approval_required() -> bool {
        true
    }
    pub fn lockout_failures() -> u32 {
        5
    }
    pub fn lockout_cooldown() -> u64 {
        300
    }
    pub fn session_ttl() -> u64 {
        480
    }
    pub fn doc_classes() -> Vec<DocClass> {
        DocClass::ALL.to_vec()
    }
}

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl ServerConfig {
    /// Load and validate a config from a TOML file, then apply env shadows.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotReadable {
            path: path.display().to_string(),
        })?;
        let mut config: ServerConfig =
            toml::from_str(&raw).map_err(|e| ConfigError::ParseError {
                reason: e.to_string(),
            })?;
        config.apply_env_shadows();
        config.validate()?;
        Ok(config)
    }

    /// Apply the fixed set of environment shadows.
    ///
    /// `KNJIZBA_HOST`, `KNJIZBA_PORT`, `KNJIZBA_DATA_DIR`, `KNJIZBA_LOG`
    /// override the corresponding file values. Unparseable shadows are
    /// ignored in favor of the file value.
    pub fn apply_env_shadows(&mut self) {
        if let Ok(host) = std::env::var("KNJIZBA_HOST")
            && !host.is_empty()
        {
            self.host = host;
        }
        if let Ok(port) = std::env::var("KNJIZBA_PORT")
            && let Ok(port) = port.parse::<u16>()
        {
            self.port = port;
        }
        if let Ok(dir) = std::env::var("KNJIZBA_DATA_DIR")
            && !dir.is_empty()
        {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("KNJIZBA_LOG")
            && VALID_LOG_LEVELS.contains(&level.as_str())
        {
            self.log_level = level;
        }
    }

    /// Semantic validation. Collects every problem before failing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut reasons = Vec::new();

        if self.max_sessions == 0 {
            reasons.push("max_sessions must be at least 1".to_string());
        }
        if self.inference_queue_len == 0 {
            reasons.push("inference_queue_len must be at least 1".to_string());
        }
        if self.inference_token_budget == 0 {
            reasons.push("inference_token_budget must be positive".to_string());
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            reasons.push(format!("unknown log_level '{}'", self.log_level));
        }
        if self.home_currency.len() != 3
            || !self.home_currency.chars().all(|c| c.is_ascii_uppercase())
        {
            reasons.push(format!("home_currency '{}' is not ISO 4217", self.home_currency));
        }
        if self.aml_cash_threshold <= Decimal::ZERO {
            reasons.push("aml_cash_threshold must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.rag_confidence_floor) {
            reasons.push("rag_confidence_floor must be in [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.consensus_auto_advance) {
            reasons.push("consensus_auto_advance must be in [0, 1]".to_string());
        }
        if !self.approval_required_for_monetary {
            // The approval gate is not an opt-out.
            reasons.push(
                "approval_required_for_monetary cannot be disabled".to_string(),
            );
        }
        if self.export_targets.is_empty() {
            reasons.push("at least one export target must be configured".to_string());
        }
        for (name, target) in &self.export_targets {
            if let ExportTarget::Http { dest } = target
                && !is_local_url(dest)
            {
                reasons.push(format!(
                    "export target '{name}' points at a non-local URL: {dest}"
                ));
            }
        }
        for (label, ep) in [
            ("inference_endpoint", &self.inference_endpoint),
            ("vision_endpoint", &self.vision_endpoint),
            ("embedding_endpoint", &self.embedding_endpoint),
        ] {
            if !is_local_url(&ep.url) {
                reasons.push(format!("{label} points at a non-local URL: {}", ep.url));
            }
            if ep.model_id.is_empty() {
                reasons.push(format!("{label} is missing a model id"));
            }
        }
        if self.accepted_doc_classes.is_empty() {
            reasons.push("accepted_doc_classes cannot be empty".to_string());
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError { reasons })
        }
    }

    /// Path of the SQLite database file.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("knjizba.db")
    }

    /// Root directory of the content-addressed blob store.
    #[must_use]
    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    /// Watched directory for operator-dropped legal documents.
    #[must_use]
    pub fn watched_dir(&self) -> PathBuf {
        self.data_dir.join("watched")
    }

    /// Quarantine directory for unconfirmed corpus ingests.
    #[must_use]
    pub fn quarantine_dir(&self) -> PathBuf {
        self.data_dir.join("quarantine")
    }

    /// Directory for nightly L3 preference-pair exports.
    #[must_use]
    pub fn preference_export_dir(&self) -> PathBuf {
        self.data_dir.join("preference-pairs")
    }
}

/// Only loopback and RFC1918 hosts are acceptable destinations.
fn is_local_url(url: &str) -> bool {
    let without_scheme = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    let Some(rest) = without_scheme else {
        return false;
    };
    let host = rest.split(['/', ':']).next().unwrap_or("");
    host == "localhost"
        || host == "127.0.0.1"
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || is_rfc1918_172(host)
}

fn is_rfc1918_172(host: &str) -> bool {
    let mut parts = host.split('.');
    if parts.next() != Some("172") {
        return false;
    }
    matches!(
        parts.next().and_then(|p| p.parse::<u8>().ok()),
        Some(16..=31)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_toml() -> String {
        r#"
[inference_endpoint]
url = "http://127.0.0.1:9001"
model_id = "primary-q4"

[vision_endpoint]
url = "http://127.0.0.1:9002"
model_id = "vision-q4"

[embedding_endpoint]
url = "http://127.0.0.1:9003"
model_id = "embed-base"

[export_targets.synesis]
kind = "xml_file"
dest = "/tmp/export-xml"

[export_targets.pantheon]
kind = "csv_file"
dest = "/tmp/export-csv"
"#
        .to_string()
    }

    fn load_str(s: &str) -> Result<ServerConfig, ConfigError> {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(s.as_bytes()).unwrap();
        ServerConfig::load(f.path())
    }

    #[test]
    fn minimal_config_loads_with_defaults() {
        let cfg = load_str(&minimal_toml()).unwrap();
        assert_eq!(cfg.port, 8471);
        assert_eq!(cfg.max_sessions, 4);
        assert_eq!(cfg.home_currency, "EUR");
        assert_eq!(cfg.l1_retention_days, 30);
        assert!(cfg.approval_required_for_monetary);
        assert_eq!(cfg.accepted_doc_classes.len(), DocClass::ALL.len());
    }

    #[test]
    fn approval_gate_cannot_be_disabled() {
        let toml = format!("approval_required_for_monetary = false\n{}", minimal_toml());
        let err = load_str(&toml).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("approval_required")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn non_local_endpoint_rejected() {
        let toml = minimal_toml().replace("http://127.0.0.1:9001", "https://api.example.com");
        assert!(load_str(&toml).is_err());
    }

    #[test]
    fn unknown_fields_rejected() {
        let toml = format!("autonomous_posting = true\n{}", minimal_toml());
        assert!(matches!(
            load_str(&toml),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn local_url_predicate() {
        assert!(is_local_url("http://localhost:9000"));
        assert!(is_local_url("http://10.0.0.5/infer"));
        assert!(is_local_url("http://172.20.1.9:8080"));
        assert!(!is_local_url("http://172.99.1.9"));
        assert!(!is_local_url("https://example.com"));
        assert!(!is_local_url("ftp://127.0.0.1"));
    }
}
