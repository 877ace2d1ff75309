// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bearer-token sessions, roles, per-user rate limits, and lockout.
//!
//! Passwords are verified with bcrypt; sessions are random bearer tokens
//! with an expiry and a role. Rate limiting is a per-user sliding window
//! checked before inference admission. Repeated login failures lock the
//! account for a cooldown window. Every decision is audited.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use knj_audit::{AuditKind, AuditLog, Db, NewAuditEvent};
use parking_lot::Mutex;
use rand::RngCore;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Operator roles, in increasing order of privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Read-only access plus chat.
    Assistant,
    /// May approve, reject, and correct bookings.
    Accountant,
    /// Everything, including audit reads and corpus confirmation.
    Admin,
}

impl Role {
    /// May this role decide bookings (approve / reject / correct)?
    #[must_use]
    pub fn can_decide(&self) -> bool {
        matches!(self, Role::Accountant | Role::Admin)
    }

    /// May this role read the audit log and confirm corpus ingests?
    #[must_use]
    pub fn can_administer(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Assistant => "assistant",
            Role::Accountant => "accountant",
            Role::Admin => "admin",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// An authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Bearer token presented by the client.
    pub token: String,
    /// Username the session belongs to.
    pub username: String,
    /// Role at login time.
    pub role: Role,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
}

/// Errors from the auth service.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Unknown user or wrong password.
    #[error("authentication failed")]
    Failed,
    /// Account locked out after repeated failures.
    #[error("account locked, retry after {retry_after_secs}s")]
    Locked {
        /// Seconds until the lockout expires.
        retry_after_secs: u64,
    },
    /// Missing, expired, or unknown session token.
    #[error("invalid session")]
    InvalidSession,
    /// The per-user request quota was exceeded.
    #[error("quota exceeded")]
    QuotaExceeded,
    /// Too many concurrent streams for this user.
    #[error("concurrent stream limit reached")]
    StreamLimit,
    /// Username already exists.
    #[error("user already exists: {0}")]
    UserExists(String),
    /// Database failure.
    #[error("auth db: {0}")]
    Db(#[from] rusqlite::Error),
    /// Audit append failure.
    #[error("auth audit: {0}")]
    Audit(#[from] knj_audit::AuditError),
    /// Password hashing failure.
    #[error("password hashing failed")]
    Hash,
}

/// Tuning knobs for the auth service.
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    /// Session lifetime in minutes.
    pub session_ttl_minutes: u64,
    /// Consecutive failures before lockout.
    pub lockout_after_failures: u32,
    /// Lockout cooldown in seconds.
    pub lockout_cooldown_secs: u64,
    /// Requests per minute per user.
    pub rate_limit_per_user: u32,
    /// Concurrent streams per user.
    pub concurrent_streams_per_user: u32,
}

#[derive(Debug, Default)]
struct FailureState {
    consecutive: u32,
    locked_until: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Limits {
    windows: HashMap<String, VecDeque<DateTime<Utc>>>,
    streams: HashMap<String, u32>,
}

/// Session and authorization service.
pub struct AuthService {
    db: Db,
    audit: Arc<AuditLog>,
    policy: AuthPolicy,
    failures: Mutex<HashMap<String, FailureState>>,
    limits: Mutex<Limits>,
}

impl AuthService {
    /// Attach to the shared database, creating tables if needed.
    pub fn open(db: Db, audit: Arc<AuditLog>, policy: AuthPolicy) -> Result<Self, AuthError> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    username      TEXT PRIMARY KEY,
                    password_hash TEXT NOT NULL,
                    role          TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS sessions (
                    token      TEXT PRIMARY KEY,
                    username   TEXT NOT NULL REFERENCES users(username),
                    role       TEXT NOT NULL,
                    expires_at TEXT NOT NULL
                );",
            )?;
        }
        Ok(Self {
            db,
            audit,
            policy,
            failures: Mutex::new(HashMap::new()),
            limits: Mutex::new(Limits::default()),
        })
    }

    /// Create a user. Used by the bootstrap path and the admin CLI.
    pub fn create_user(&self, username: &str, password: &str, role: Role) -> Result<(), AuthError> {
        let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(|_| AuthError::Hash)?;
        let conn = self.db.lock();
        let existing: Option<String> = conn
            .query_row(
                "SELECT username FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(AuthError::UserExists(username.to_string()));
        }
        conn.execute(
            "INSERT INTO users (username, password_hash, role) VALUES (?1, ?2, ?3)",
            params![username, hash, role.to_string()],
        )?;
        info!(user = username, role = %role, "user created");
        Ok(())
    }

    /// Verify credentials and mint a session.
    pub fn login(&self, username: &str, password: &str) -> Result<Session, AuthError> {
        self.check_lockout(username)?;

        let row: Option<(String, String)> = {
            let conn = self.db.lock();
            conn.query_row(
                "SELECT password_hash, role FROM users WHERE username = ?1",
                params![username],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        let ok = match &row {
            Some((hash, _)) => bcrypt::verify(password, hash).unwrap_or(false),
            // Unknown users take the same failure path as wrong passwords.
            None => false,
        };

        if !ok {
            let locked = self.record_failure(username);
            self.audit_auth(username, "login_failed", locked)?;
            if let Some(retry) = locked {
                return Err(AuthError::Locked {
                    retry_after_secs: retry,
                });
            }
            return Err(AuthError::Failed);
        }

        self.clear_failures(username);
        let Some((_, role_str)) = row else {
            return Err(AuthError::Failed);
        };
        let role = parse_role(&role_str);
        let session = self.mint_session(username, role)?;
        self.audit_auth(username, "login_ok", None)?;
        Ok(session)
    }

    /// Resolve a bearer token into a live session.
    pub fn authenticate(&self, token: &str) -> Result<Session, AuthError> {
        let conn = self.db.lock();
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT username, role, expires_at FROM sessions WHERE token = ?1",
                params![token],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((username, role_str, expires_at)) = row else {
            return Err(AuthError::InvalidSession);
        };
        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| AuthError::InvalidSession)?;
        if expires_at < Utc::now() {
            conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])?;
            return Err(AuthError::InvalidSession);
        }
        Ok(Session {
            token: token.to_string(),
            username,
            role: parse_role(&role_str),
            expires_at,
        })
    }

    /// Enforce the per-user sliding-window quota. Call before admission.
    pub fn check_rate(&self, username: &str) -> Result<(), AuthError> {
        let now = Utc::now();
        let mut limits = self.limits.lock();
        let window = limits.windows.entry(username.to_string()).or_default();
        while let Some(front) = window.front() {
            if now - *front > Duration::seconds(60) {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() as u32 >= self.policy.rate_limit_per_user {
            warn!(user = username, "rate limit hit");
            return Err(AuthError::QuotaExceeded);
        }
        window.push_back(now);
        Ok(())
    }

    /// Reserve a concurrent-stream slot; the guard releases on drop.
    pub fn acquire_stream(self: &Arc<Self>, username: &str) -> Result<StreamGuard, AuthError> {
        {
            let mut limits = self.limits.lock();
            let count = limits.streams.entry(username.to_string()).or_insert(0);
            if *count >= self.policy.concurrent_streams_per_user {
                return Err(AuthError::StreamLimit);
            }
            *count += 1;
        }
        Ok(StreamGuard {
            service: Arc::clone(self),
            username: username.to_string(),
        })
    }

    // --- helpers ---

    fn mint_session(&self, username: &str, role: Role) -> Result<Session, AuthError> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        let expires_at = Utc::now() + Duration::minutes(self.policy.session_ttl_minutes as i64);
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO sessions (token, username, role, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![token, username, role.to_string(), expires_at.to_rfc3339()],
        )?;
        Ok(Session {
            token,
            username: username.to_string(),
            role,
            expires_at,
        })
    }

    fn check_lockout(&self, username: &str) -> Result<(), AuthError> {
        let failures = self.failures.lock();
        if let Some(state) = failures.get(username)
            && let Some(until) = state.locked_until
            && until > Utc::now()
        {
            let retry = (until - Utc::now()).num_seconds().max(0) as u64;
            return Err(AuthError::Locked {
                retry_after_secs: retry,
            });
        }
        Ok(())
    }

    /// Returns the lockout duration if this failure triggered one.
    fn record_failure(&self, username: &str) -> Option<u64> {
        let mut failures = self.failures.lock();
        let state = failures.entry(username.to_string()).or_default();
        state.consecutive += 1;
        if state.consecutive >= self.policy.lockout_after_failures {
            state.locked_until =
                Some(Utc::now() + Duration::seconds(self.policy.lockout_cooldown_secs as i64));
            warn!(user = username, "account locked out");
            Some(self.policy.lockout_cooldown_secs)
        } else {
            None
        }
    }

    fn clear_failures(&self, username: &str) {
        self.failures.lock().remove(username);
    }

    fn audit_auth(
        &self,
        username: &str,
        outcome: &str,
        locked_secs: Option<u64>,
    ) -> Result<(), AuthError> {
        self.audit.append(NewAuditEvent {
            actor: format!("user:{username}"),
            kind: AuditKind::AuthDecision,
            subject_id: username.to_string(),
            payload: serde_json::json!({
                "outcome": outcome,
                "locked_secs": locked_secs,
            }),
        })?;
        Ok(())
    }
}

fn parse_role(s: &str) -> Role {
    match s {
        "admin" => Role::Admin,
        "accountant" => Role::Accountant,
        _ => Role::Assistant,
    }
}

/// RAII guard for a reserved concurrent stream.
pub struct StreamGuard {
    service: Arc<AuthService>,
    username: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let mut limits = self.service.limits.lock();
        if let Some(count) = limits.streams.get_mut(&self.username) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knj_audit::open_db_in_memory;

    fn service() -> Arc<AuthService> {
        let db = open_db_in_memory().unwrap();
        let audit = Arc::new(AuditLog::open(Arc::clone(&db)).unwrap());
        Arc::new(
            AuthService::open(
                db,
                audit,
                AuthPolicy {
                    session_ttl_minutes: 60,
                    lockout_after_failures: 3,
                    lockout_cooldown_secs: 300,
                    rate_limit_per_user: 5,
                    concurrent_streams_per_user: 2,
                },
            )
            .unwrap(),
        )
    }

    #[test]
    fn login_roundtrip() {
        let svc = service();
        svc.create_user("mira", "lozinka123", Role::Accountant).unwrap();
        let session = svc.login("mira", "lozinka123").unwrap();
        assert_eq!(session.role, Role::Accountant);
        let resolved = svc.authenticate(&session.token).unwrap();
        assert_eq!(resolved.username, "mira");
    }

    #[test]
    fn wrong_password_fails_then_locks() {
        let svc = service();
        svc.create_user("ivo", "tajna", Role::Assistant).unwrap();
        assert!(matches!(svc.login("ivo", "kriva"), Err(AuthError::Failed)));
        assert!(matches!(svc.login("ivo", "kriva"), Err(AuthError::Failed)));
        assert!(matches!(
            svc.login("ivo", "kriva"),
            Err(AuthError::Locked { .. })
        ));
        // Locked even with the right password.
        assert!(matches!(
            svc.login("ivo", "tajna"),
            Err(AuthError::Locked { .. })
        ));
    }

    #[test]
    fn unknown_token_is_invalid() {
        let svc = service();
        assert!(matches!(
            svc.authenticate("deadbeef"),
            Err(AuthError::InvalidSession)
        ));
    }

    #[test]
    fn rate_limit_window() {
        let svc = service();
        for _ in 0..5 {
            svc.check_rate("mira").unwrap();
        }
        assert!(matches!(
            svc.check_rate("mira"),
            Err(AuthError::QuotaExceeded)
        ));
    }

    #[test]
    fn stream_guard_releases_on_drop() {
        let svc = service();
        let a = svc.acquire_stream("mira").unwrap();
        let _b = svc.acquire_stream("mira").unwrap();
        assert!(matches!(
            svc.acquire_stream("mira"),
            Err(AuthError::StreamLimit)
        ));
        drop(a);
        assert!(svc.acquire_stream("mira").is_ok());
    }

    #[test]
    fn roles_gate_privileges() {
        assert!(Role::Admin.can_decide());
        assert!(Role::Admin.can_administer());
        assert!(Role::Accountant.can_decide());
        assert!(!Role::Accountant.can_administer());
        assert!(!Role::Assistant.can_decide());
    }

    #[test]
    fn duplicate_user_rejected() {
        let svc = service();
        svc.create_user("mira", "x", Role::Admin).unwrap();
        assert!(matches!(
            svc.create_user("mira", "y", Role::Admin),
            Err(AuthError::UserExists(_))
        ));
    }
}
