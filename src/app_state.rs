// =============================================================================
// Central Application State — Meridian Trade Engine
// =============================================================================
//
// Ties the subsystems together for the HTTP layer: the credential vault,
// config store, instrument catalog, session manager, activity log, the
// supervisor handle, and the broker adapters. Handlers hold an
// `Arc<AppState>`; everything mutable inside is individually synchronised.
//
// Adapter instances are created lazily per `BrokerKind` and reused, so
// "connect" on an already-connected adapter finds the existing session.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Duration;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::activity::ActivityLog;
use crate::api::rate_limit::HttpRateLimiter;
use crate::broker::paper::PaperBroker;
use crate::broker::zerodha::ZerodhaBroker;
use crate::broker::{Broker, BrokerError, BrokerKind, ConnectResult};
use crate::catalog::InstrumentCatalog;
use crate::config::ConfigStore;
use crate::session::{SessionManager, DEFAULT_IDLE_TTL_HOURS};
use crate::types::Credential;
use crate::vault::CredentialVault;

/// Pending OAuth round-trips expire after this many seconds.
pub const OAUTH_STATE_TTL_SECS: u64 = 600;

/// An initiated-but-uncompleted OAuth flow, keyed by its state nonce.
pub struct OAuthPending {
    pub api_key: String,
    pub api_secret: String,
    pub created_at: Instant,
}

pub struct AppState {
    pub data_dir: PathBuf,
    /// Absent when `APP_MASTER_KEY` is not set; live-broker credential
    /// persistence then refuses politely.
    pub vault: Option<Arc<CredentialVault>>,
    pub config_store: ConfigStore,
    pub catalog: Arc<InstrumentCatalog>,
    pub sessions: Arc<SessionManager>,
    pub activity: Arc<ActivityLog>,
    pub supervisor: crate::supervisor::SupervisorHandle,
    pub http_limiter: HttpRateLimiter,
    pub oauth_states: Mutex<HashMap<String, OAuthPending>>,

    adapters: RwLock<HashMap<BrokerKind, Arc<dyn Broker>>>,
    current: RwLock<Option<(BrokerKind, Arc<dyn Broker>)>>,
}

impl AppState {
    pub fn new(
        data_dir: &Path,
        master_key: Option<&str>,
        supervisor: crate::supervisor::SupervisorHandle,
        activity: Arc<ActivityLog>,
    ) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let vault = match master_key {
            Some(key) if !key.is_empty() => Some(Arc::new(
                CredentialVault::open(data_dir, key).context("failed to open credential vault")?,
            )),
            _ => {
                warn!("APP_MASTER_KEY not set; live-broker credentials cannot be persisted");
                None
            }
        };

        let config_store = ConfigStore::new(data_dir)?;
        let catalog = Arc::new(InstrumentCatalog::new(data_dir, "paper")?);
        let sessions = Arc::new(SessionManager::open(
            data_dir,
            Duration::hours(DEFAULT_IDLE_TTL_HOURS),
        )?);

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            vault,
            config_store,
            catalog,
            sessions,
            activity,
            supervisor,
            http_limiter: HttpRateLimiter::with_defaults(),
            oauth_states: Mutex::new(HashMap::new()),
            adapters: RwLock::new(HashMap::new()),
            current: RwLock::new(None),
        })
    }

    // -------------------------------------------------------------------------
    // Adapters
    // -------------------------------------------------------------------------

    /// Lazily build (and memoise) the adapter for `kind`.
    pub fn adapter(&self, kind: BrokerKind) -> Arc<dyn Broker> {
        if let Some(adapter) = self.adapters.read().get(&kind) {
            return adapter.clone();
        }
        let mut adapters = self.adapters.write();
        adapters
            .entry(kind)
            .or_insert_with(|| match kind {
                BrokerKind::Paper => Arc::new(PaperBroker::default()) as Arc<dyn Broker>,
                BrokerKind::Zerodha => Arc::new(ZerodhaBroker::new()) as Arc<dyn Broker>,
            })
            .clone()
    }

    /// The adapter serving requests right now, if any broker is connected.
    pub fn current_broker(&self) -> Option<(BrokerKind, Arc<dyn Broker>)> {
        self.current.read().clone()
    }

    /// Connect `kind` with `credential`, make it current, and refresh the
    /// instrument catalog from its master.
    pub async fn connect_broker(
        &self,
        kind: BrokerKind,
        credential: Credential,
    ) -> Result<ConnectResult, BrokerError> {
        let adapter = self.adapter(kind);
        let result = adapter.connect(credential).await?;

        *self.current.write() = Some((kind, adapter.clone()));

        match adapter.instruments().await {
            Ok(instruments) => {
                if let Err(e) = self.catalog.replace(kind.as_str(), instruments) {
                    warn!(error = %e, "catalog refresh after connect failed");
                }
            }
            Err(e) => warn!(error = %e, "instrument master fetch after connect failed"),
        }

        info!(broker = %kind, "broker connected and made current");
        Ok(result)
    }

    pub async fn disconnect_current(&self) -> Result<(), BrokerError> {
        let current = self.current.write().take();
        if let Some((kind, adapter)) = current {
            adapter.disconnect().await?;
            info!(broker = %kind, "broker disconnected");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // OAuth state nonces
    // -------------------------------------------------------------------------

    /// Register a pending OAuth flow under a fresh nonce.
    pub fn stash_oauth_state(&self, nonce: String, pending: OAuthPending) {
        let mut states = self.oauth_states.lock();
        // Housekeeping: drop expired flows while we are here.
        states.retain(|_, p| p.created_at.elapsed().as_secs() < OAUTH_STATE_TTL_SECS);
        states.insert(nonce, pending);
    }

    /// Take (single use) a pending flow; stale or unknown nonces are `None`.
    pub fn take_oauth_state(&self, nonce: &str) -> Option<OAuthPending> {
        let mut states = self.oauth_states.lock();
        let pending = states.remove(nonce)?;
        if pending.created_at.elapsed().as_secs() >= OAUTH_STATE_TTL_SECS {
            return None;
        }
        Some(pending)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> (tempfile::TempDir, Arc<AppState>) {
        let tmp = tempfile::tempdir().unwrap();
        let activity = Arc::new(ActivityLog::default());
        let supervisor = crate::supervisor::spawn(activity.clone());
        let state =
            AppState::new(tmp.path(), Some("test-master-key"), supervisor, activity).unwrap();
        (tmp, Arc::new(state))
    }

    #[tokio::test]
    async fn adapters_are_memoised() {
        let (_tmp, state) = test_state();
        let a = state.adapter(BrokerKind::Paper);
        let b = state.adapter(BrokerKind::Paper);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn connect_sets_current_and_fills_catalog() {
        let (_tmp, state) = test_state();
        assert!(state.current_broker().is_none());

        let credential = Credential {
            api_key: String::new(),
            api_secret: String::new(),
            access_token: None,
            access_token_expiry: None,
            refresh_token: None,
        };
        let result = state
            .connect_broker(BrokerKind::Paper, credential)
            .await
            .unwrap();
        assert!(!result.already_connected);

        let (kind, adapter) = state.current_broker().unwrap();
        assert_eq!(kind, BrokerKind::Paper);
        assert!(adapter.is_connected());
        assert!(state.catalog.snapshot().len() > 0);
    }

    #[tokio::test]
    async fn oauth_state_is_single_use() {
        let (_tmp, state) = test_state();
        state.stash_oauth_state(
            "nonce1".to_string(),
            OAuthPending {
                api_key: "k".into(),
                api_secret: "s".into(),
                created_at: Instant::now(),
            },
        );

        assert!(state.take_oauth_state("nonce1").is_some());
        // Second take of the same nonce fails: stale-state.
        assert!(state.take_oauth_state("nonce1").is_none());
        assert!(state.take_oauth_state("never-existed").is_none());
    }

    #[tokio::test]
    async fn vault_is_optional() {
        let tmp = tempfile::tempdir().unwrap();
        let activity = Arc::new(ActivityLog::default());
        let supervisor = crate::supervisor::spawn(activity.clone());
        let state = AppState::new(tmp.path(), None, supervisor, activity).unwrap();
        assert!(state.vault.is_none());
    }
}
