// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for Knjižba.
//!
//! Every user-visible error carries an [`ErrorCode`] (a machine-readable,
//! stable string tag), a human-readable message, and optional key-value
//! context. Components keep their own `thiserror` enums internally and map
//! to a [`KnjError`] at the API boundary so clients always see the same
//! code for the same condition.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed client input.
    Input,
    /// Resource lookup and state-transition errors.
    State,
    /// Authentication and authorization errors.
    Auth,
    /// Extraction errors (tier exhaustion, unreadable documents).
    Extract,
    /// Verification consensus failures.
    Verify,
    /// Inference gateway errors (backpressure, model faults).
    Inference,
    /// ERP delivery errors.
    Export,
    /// Audit chain integrity errors.
    Audit,
    /// Refusals to act (approval bypass, out-of-scope requests).
    Safety,
    /// Configuration errors.
    Config,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Input => "input",
            Self::State => "state",
            Self::Auth => "auth",
            Self::Extract => "extract",
            Self::Verify => "verify",
            Self::Inference => "inference",
            Self::Export => "export",
            Self::Audit => "audit",
            Self::Safety => "safety",
            Self::Config => "config",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases. Clients key retry and
/// reconciliation logic off these tags, never off message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Input --
    /// A request field failed validation.
    InputInvalid,
    /// The uploaded media type is not supported.
    InputUnsupported,

    // -- State --
    /// The requested resource does not exist.
    NotFound,
    /// A concurrent actor won the race for the same booking.
    StateConflict,
    /// The requested transition is not allowed from the current state.
    InvalidTransition,

    // -- Auth --
    /// Credentials did not match.
    AuthFailed,
    /// The account is locked out after repeated failures.
    AuthLocked,
    /// The session is missing, expired, or malformed.
    SessionInvalid,
    /// The caller's role does not permit the operation.
    Forbidden,
    /// The caller exceeded its request quota.
    QuotaExceeded,

    // -- Extract --
    /// Every extraction tier returned no match.
    Unextractable,

    // -- Verify --
    /// Field consensus or a ledger invariant blocks auto-advance.
    VerificationBlocker,

    // -- Inference --
    /// The inference queue is full; retry after the supplied hint.
    Overloaded,
    /// The model call failed after the retry.
    InferenceFailed,
    /// The vision backend could not be loaded for this request.
    VisionUnavailable,
    /// The caller's deadline elapsed or the stream was cancelled.
    Cancelled,

    // -- Export --
    /// Delivery failed transiently; the booking remains approved.
    ExportPending,
    /// Delivery failed permanently; the booking is blocked.
    ExportFailed,

    // -- Audit --
    /// The audit hash chain failed verification.
    AuditIntegrity,

    // -- Safety --
    /// The request was refused on safety grounds.
    SafetyViolation,

    // -- Config --
    /// Configuration file or value is invalid.
    ConfigInvalid,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InputInvalid | Self::InputUnsupported => ErrorCategory::Input,

            Self::NotFound | Self::StateConflict | Self::InvalidTransition => ErrorCategory::State,

            Self::AuthFailed
            | Self::AuthLocked
            | Self::SessionInvalid
            | Self::Forbidden
            | Self::QuotaExceeded => ErrorCategory::Auth,

            Self::Unextractable => ErrorCategory::Extract,

            Self::VerificationBlocker => ErrorCategory::Verify,

            Self::Overloaded | Self::InferenceFailed | Self::VisionUnavailable | Self::Cancelled => {
                ErrorCategory::Inference
            }

            Self::ExportPending | Self::ExportFailed => ErrorCategory::Export,

            Self::AuditIntegrity => ErrorCategory::Audit,

            Self::SafetyViolation => ErrorCategory::Safety,

            Self::ConfigInvalid => ErrorCategory::Config,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Returns `true` if a client may retry the same request unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Overloaded | Self::ExportPending | Self::QuotaExceeded
        )
    }

    /// The HTTP status this code maps to at the API surface.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InputInvalid | Self::InvalidTransition => 400,
            Self::AuthFailed | Self::SessionInvalid => 401,
            Self::Forbidden | Self::SafetyViolation => 403,
            Self::NotFound => 404,
            Self::StateConflict => 409,
            Self::InputUnsupported => 415,
            Self::Unextractable | Self::VerificationBlocker => 422,
            Self::AuthLocked => 423,
            Self::QuotaExceeded | Self::Overloaded => 429,
            Self::Cancelled => 499,
            Self::ExportPending | Self::InferenceFailed | Self::VisionUnavailable => 503,
            Self::ExportFailed | Self::AuditIntegrity | Self::ConfigInvalid | Self::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Reuse the serde tag so logs and wire payloads agree.
        let v = serde_json::to_value(self).map_err(|_| fmt::Error)?;
        match v.as_str() {
            Some(s) => f.write_str(s),
            None => Err(fmt::Error),
        }
    }
}

// ---------------------------------------------------------------------------
// KnjError
// ---------------------------------------------------------------------------

/// A user-visible error: stable code, message, and optional context.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct KnjError {
    /// Stable machine-readable code.
    pub code: ErrorCode,
    /// Human-readable message. Localized at the API edge, not here.
    pub message: String,
    /// Optional structured context (field names, current state, hints).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl KnjError {
    /// Start building an error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    /// Attach a context key-value pair.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach the current booking state so clients can reconcile.
    #[must_use]
    pub fn with_state(self, state: impl Into<String>) -> Self {
        self.with("current_state", state)
    }

    /// Attach a retry-after hint in seconds.
    #[must_use]
    pub fn with_retry_after(self, secs: u64) -> Self {
        self.with("retry_after_secs", secs.to_string())
    }

    /// Shorthand for a [`ErrorCode::NotFound`] error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, format!("{} not found", what.into()))
    }

    /// Shorthand for an [`ErrorCode::Internal`] error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}
