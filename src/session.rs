// =============================================================================
// Session Manager — server-issued operator tokens with idle expiry
// =============================================================================
//
// Mutating control-plane endpoints require a valid session token; reads are
// open. Tokens are opaque UUIDs, touched on every authenticated request and
// expired after an idle TTL. Sessions are persisted one file per token
// under `<data_dir>/sessions/` so a restart does not log the operator out.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Idle lifetime of a session.
pub const DEFAULT_IDLE_TTL_HOURS: i64 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionEntry {
    created_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    idle_ttl: Duration,
    dir: Option<PathBuf>,
}

impl SessionManager {
    /// In-memory only (tests, `check` mode).
    pub fn ephemeral(idle_ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_ttl,
            dir: None,
        }
    }

    /// Persistent manager rooted at `<data_dir>/sessions`, restoring any
    /// unexpired sessions from a previous run.
    pub fn open(data_dir: &Path, idle_ttl: Duration) -> anyhow::Result<Self> {
        let dir = data_dir.join("sessions");
        std::fs::create_dir_all(&dir)?;

        let mut sessions = HashMap::new();
        let now = Utc::now();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(token) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match std::fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str::<SessionEntry>(&c).ok())
            {
                Some(session) if now - session.last_seen_at < idle_ttl => {
                    sessions.insert(token.to_string(), session);
                }
                _ => {
                    // Expired or unreadable: clean it up.
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        if !sessions.is_empty() {
            info!(count = sessions.len(), "restored persisted sessions");
        }

        Ok(Self {
            sessions: RwLock::new(sessions),
            idle_ttl,
            dir: Some(dir),
        })
    }

    fn persist(&self, token: &str, entry: &SessionEntry) {
        let Some(dir) = &self.dir else { return };
        let path = dir.join(format!("{token}.json"));
        match serde_json::to_string(entry) {
            Ok(content) => {
                if let Err(e) = std::fs::write(&path, content) {
                    warn!(error = %e, "failed to persist session");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialise session"),
        }
    }

    fn unpersist(&self, token: &str) {
        if let Some(dir) = &self.dir {
            let _ = std::fs::remove_file(dir.join(format!("{token}.json")));
        }
    }

    /// Issue a fresh token.
    pub fn create(&self) -> String {
        let token = Uuid::new_v4().to_string();
        let now = Utc::now();
        let entry = SessionEntry {
            created_at: now,
            last_seen_at: now,
        };
        self.persist(&token, &entry);
        self.sessions.write().insert(token.clone(), entry);
        debug!("session created");
        token
    }

    /// Validate `token`, refreshing its idle timer on success. Expired
    /// tokens are evicted on the spot.
    pub fn validate_and_touch(&self, token: &str) -> bool {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        match sessions.get_mut(token) {
            Some(entry) => {
                if now - entry.last_seen_at >= self.idle_ttl {
                    sessions.remove(token);
                    self.unpersist(token);
                    debug!("session expired on touch");
                    false
                } else {
                    entry.last_seen_at = now;
                    self.persist(token, entry);
                    true
                }
            }
            None => false,
        }
    }

    /// Explicit logout. Returns whether the token existed.
    pub fn destroy(&self, token: &str) -> bool {
        let removed = self.sessions.write().remove(token).is_some();
        if removed {
            self.unpersist(token);
            info!("session destroyed");
        }
        removed
    }

    /// Drop all idle-expired sessions (periodic housekeeping).
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, e)| now - e.last_seen_at >= self.idle_ttl)
            .map(|(t, _)| t.clone())
            .collect();
        for token in &expired {
            sessions.remove(token);
            self.unpersist(token);
        }
        before - sessions.len()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_validate_destroy() {
        let manager = SessionManager::ephemeral(Duration::hours(1));
        let token = manager.create();
        assert!(manager.validate_and_touch(&token));
        assert_eq!(manager.active_count(), 1);

        assert!(manager.destroy(&token));
        assert!(!manager.validate_and_touch(&token));
        assert!(!manager.destroy(&token));
    }

    #[test]
    fn unknown_token_is_invalid() {
        let manager = SessionManager::ephemeral(Duration::hours(1));
        assert!(!manager.validate_and_touch("not-a-token"));
    }

    #[test]
    fn idle_expiry_evicts() {
        // Zero TTL: every touch finds the session already idle-expired.
        let manager = SessionManager::ephemeral(Duration::zero());
        let token = manager.create();
        assert!(!manager.validate_and_touch(&token));
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn purge_removes_only_expired() {
        let manager = SessionManager::ephemeral(Duration::hours(1));
        let _live = manager.create();
        assert_eq!(manager.purge_expired(), 0);
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn sessions_survive_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let token = {
            let manager = SessionManager::open(tmp.path(), Duration::hours(1)).unwrap();
            manager.create()
        };

        let reopened = SessionManager::open(tmp.path(), Duration::hours(1)).unwrap();
        assert!(reopened.validate_and_touch(&token));
    }

    #[test]
    fn destroyed_sessions_do_not_come_back() {
        let tmp = tempfile::tempdir().unwrap();
        let token = {
            let manager = SessionManager::open(tmp.path(), Duration::hours(1)).unwrap();
            let token = manager.create();
            manager.destroy(&token);
            token
        };
        let reopened = SessionManager::open(tmp.path(), Duration::hours(1)).unwrap();
        assert!(!reopened.validate_and_touch(&token));
    }
}
