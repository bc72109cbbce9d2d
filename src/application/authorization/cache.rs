//! Authorization cache
//!
//! Token to contract map fed by upstream authorization answers. Lookups hit
//! the in-memory map only and never wait on flushes or the log; every change
//! of an entry is appended to the [`AuthorizationLog`] before it becomes
//! visible, so replaying the log rebuilds the map.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::log::{AuthorizationLog, LogRecord};
use crate::application::upstream::{CallFailure, UpstreamFacade};
use crate::config::AuthorizationConfig;
use crate::domain::{CachedAuthorization, ContractId, TokenId};
use crate::notifications::{AuthorizationEvent, Event, SharedEventBus};
use crate::shared::{AdapterError, SharedClock};

/// How one authorization request ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuthorizationOutcome {
    Authorized(CachedAuthorization),
    Denied,
    Timeout,
    Error { description: String },
    AdminDown,
}

impl AuthorizationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authorized(_) => "authorized",
            Self::Denied => "denied",
            Self::Timeout => "timeout",
            Self::Error { .. } => "error",
            Self::AdminDown => "admin_down",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationResult {
    pub token_id: TokenId,
    pub outcome: AuthorizationOutcome,
    pub warnings: Vec<String>,
    pub runtime: Duration,
}

impl AuthorizationResult {
    pub fn is_authorized(&self) -> bool {
        matches!(self.outcome, AuthorizationOutcome::Authorized(_))
    }

    pub fn contract_id(&self) -> Option<&ContractId> {
        match &self.outcome {
            AuthorizationOutcome::Authorized(entry) => Some(&entry.contract_id),
            _ => None,
        }
    }
}

pub struct AuthorizationCache {
    entries: DashMap<TokenId, CachedAuthorization>,
    log: AuthorizationLog,
    /// Serializes log append plus map update so both see the same order
    writes: Mutex<()>,
    facade: Arc<UpstreamFacade>,
    events: SharedEventBus,
    clock: SharedClock,
    persist_denials: bool,
    enabled: bool,
}

impl AuthorizationCache {
    /// Open the cache and rebuild it from the log directory.
    pub async fn open(
        config: &AuthorizationConfig,
        enabled: bool,
        facade: Arc<UpstreamFacade>,
        events: SharedEventBus,
        clock: SharedClock,
    ) -> Result<Self, AdapterError> {
        let log = AuthorizationLog::new(
            config.log_directory.clone(),
            config.log_file_prefix.clone(),
            clock.clone(),
        );
        let replay = log.replay().await?;

        let entries = DashMap::with_capacity(replay.entries.len());
        for (token, entry) in replay.entries {
            entries.insert(token, entry);
        }
        info!(
            directory = %log.directory().display(),
            tokens = entries.len(),
            "Authorization cache loaded"
        );

        Ok(Self {
            entries,
            log,
            writes: Mutex::new(()),
            facade,
            events,
            clock,
            persist_denials: config.persist_denials,
            enabled,
        })
    }

    /// Contract mapped to `token`, if any.
    pub fn lookup(&self, token: &TokenId) -> Option<ContractId> {
        self.entries.get(token).map(|e| e.contract_id.clone())
    }

    pub fn entry(&self, token: &TokenId) -> Option<CachedAuthorization> {
        self.entries.get(token).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ask upstream whether `token` may start a session and record the answer.
    ///
    /// Always calls upstream; the map is a record of answers, not a
    /// read-through cache.
    pub async fn resolve(&self, token: &TokenId, cancel: &CancellationToken) -> AuthorizationResult {
        if !self.enabled {
            return self.finish(token, AuthorizationOutcome::AdminDown, Vec::new(), Duration::ZERO);
        }

        let (answer, runtime) = self.facade.get_roaming_authorisation(token, cancel).await;
        let mut warnings = Vec::new();

        let outcome = match answer {
            Ok(Some(authorisation)) => {
                let entry = CachedAuthorization {
                    contract_id: authorisation.contract_id,
                    expiry: authorisation.expiry,
                    printed_number: authorisation.printed_number,
                };
                if let Err(e) = self.store(token, &entry).await {
                    warn!(token_id = %token, error = %e, "Failed to persist authorization");
                    warnings.push(format!("authorization not persisted: {}", e));
                }
                AuthorizationOutcome::Authorized(entry)
            }
            Ok(None) => {
                if let Err(e) = self.forget(token).await {
                    warn!(token_id = %token, error = %e, "Failed to persist denial");
                    warnings.push(format!("denial not persisted: {}", e));
                }
                AuthorizationOutcome::Denied
            }
            Err(failure) if failure.is_timeout() => AuthorizationOutcome::Timeout,
            Err(CallFailure::Transport(e)) => {
                warnings.push(e.to_string());
                AuthorizationOutcome::Error {
                    description: "transport failure".to_string(),
                }
            }
            Err(other) => AuthorizationOutcome::Error {
                description: other.to_string(),
            },
        };

        self.finish(token, outcome, warnings, runtime)
    }

    /// Insert or replace an entry; unchanged entries are not logged again.
    async fn store(&self, token: &TokenId, entry: &CachedAuthorization) -> std::io::Result<()> {
        let _write = self.writes.lock().await;
        if self.entries.get(token).is_some_and(|e| *e == *entry) {
            debug!(token_id = %token, "Authorization unchanged");
            return Ok(());
        }

        // A failed append leaves the map as the log describes it
        self.log.append(&LogRecord::add(token.clone(), entry.clone())).await?;
        metrics::counter!("roaming_authorization_cache_writes_total", "operation" => "add")
            .increment(1);
        self.entries.insert(token.clone(), entry.clone());
        Ok(())
    }

    /// Drop an entry after a denial. Only logged when denials are persisted.
    async fn forget(&self, token: &TokenId) -> std::io::Result<()> {
        let _write = self.writes.lock().await;
        if !self.entries.contains_key(token) {
            return Ok(());
        }
        if self.persist_denials {
            self.log.append(&LogRecord::remove(token.clone())).await?;
            metrics::counter!("roaming_authorization_cache_writes_total", "operation" => "remove")
                .increment(1);
        }
        self.entries.remove(token);
        debug!(token_id = %token, persisted = self.persist_denials, "Authorization removed after denial");
        Ok(())
    }

    fn finish(
        &self,
        token: &TokenId,
        outcome: AuthorizationOutcome,
        warnings: Vec<String>,
        runtime: Duration,
    ) -> AuthorizationResult {
        info!(
            token_id = %token,
            outcome = outcome.as_str(),
            runtime_ms = runtime.as_millis() as u64,
            "Authorization resolved"
        );

        let contract_id = match &outcome {
            AuthorizationOutcome::Authorized(entry) => Some(entry.contract_id.to_string()),
            _ => None,
        };
        self.events
            .publish(Event::AuthorizationResolved(AuthorizationEvent {
                token_id: token.to_string(),
                outcome: outcome.as_str().to_string(),
                contract_id,
                timestamp: self.clock.now(),
            }));

        AuthorizationResult {
            token_id: token.clone(),
            outcome,
            warnings,
            runtime,
        }
    }
}
