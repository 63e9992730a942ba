//! The one object the application talks to.
//!
//! [`LicenseFacade`] owns the lifecycle (construct, [`init`], operate,
//! [`shutdown`]) and turns engine state into the booleans the UI gates on.
//! It is constructed explicitly and handed to whoever needs it; there is
//! no global instance.
//!
//! Every accessor fails closed. Until the first status check resolves,
//! and whenever no activated record is held, the facade reports "not
//! activated" and "no features", even if a persisted cache entry exists.
//!
//! [`init`]: LicenseFacade::init
//! [`shutdown`]: LicenseFacade::shutdown

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{watch, OnceCell};

use crate::client::activation::{
    ActivationAttempt, ActivationEngine, ActivationResult, ActivationState, AttemptKind,
    EngineOptions, EngineSnapshot, StatusCheck,
};
use crate::client::api::{HttpLicenseApi, LicenseApi};
use crate::client::cache::{CacheSource, LicenseCache};
use crate::client::entitlements::{self, Entitlements};
use crate::client::license::LicenseRecord;
use crate::client::location::{LocationProvider, NoLocation};
use crate::client::storage::{CacheStore, MemoryStore, SecureStore};
use crate::clock::{Clock, SystemClock};
use crate::config::TillgateConfig;
use crate::device;
use crate::encryption::Sealer;
use crate::errors::{LicenseError, LicenseResult};
use crate::logging::{log_license_event, LicenseEvent};

pub struct LicenseFacade<A, L = NoLocation> {
    engine: ActivationEngine<A, L>,
    clock: Arc<dyn Clock>,
    init: OnceCell<()>,
    loading: AtomicBool,
    error: RwLock<Option<LicenseError>>,
}

impl<A, L> std::fmt::Debug for LicenseFacade<A, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseFacade")
            .field("engine", &self.engine)
            .field("loading", &self.loading.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl LicenseFacade<HttpLicenseApi> {
    /// Production wiring: HTTP API, system clock, and a sealed persistent
    /// cache (or an in-memory one when `cache.persist` is off).
    pub fn from_config(config: &TillgateConfig) -> LicenseResult<Self> {
        let device_id = device::device_id()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let store: Arc<dyn CacheStore> = if config.cache.persist {
            Arc::new(SecureStore::new(Sealer::for_device(&device_id)))
        } else {
            Arc::new(MemoryStore::new())
        };

        let ttl = i64::try_from(config.cache.ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| LicenseError::ConfigError("cache.ttl_secs is too large".to_string()))?;
        let cache = Arc::new(LicenseCache::open(ttl, Arc::clone(&clock), store));

        let engine = ActivationEngine::new(
            HttpLicenseApi::new(&config.server)?,
            cache,
            Arc::clone(&clock),
            device_id,
            EngineOptions::from_config(config),
        );
        Ok(Self::new(engine, clock))
    }
}

impl<A: LicenseApi, L: LocationProvider> LicenseFacade<A, L> {
    /// Wrap an engine. Nothing is checked until [`init`](Self::init).
    pub fn new(engine: ActivationEngine<A, L>, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine,
            clock,
            init: OnceCell::new(),
            loading: AtomicBool::new(true),
            error: RwLock::new(None),
        }
    }

    /// Construct and run the initial status check.
    pub async fn start(engine: ActivationEngine<A, L>, clock: Arc<dyn Clock>) -> Self {
        let facade = Self::new(engine, clock);
        facade.init().await;
        facade
    }

    /// Run the startup status check. Only the first call does any work;
    /// concurrent and later calls wait for it and return.
    pub async fn init(&self) {
        self.init
            .get_or_init(|| async {
                let _ = self.check_status().await;
            })
            .await;
    }

    /// Let attempts still in flight finish their cache writes.
    pub async fn shutdown(&self) {
        self.engine.wait_idle().await;
    }

    pub fn engine(&self) -> &ActivationEngine<A, L> {
        &self.engine
    }

    pub fn cache(&self) -> &Arc<LicenseCache> {
        self.engine.cache()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.engine.subscribe()
    }

    // === State ===

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    fn ready_snapshot(&self) -> Option<EngineSnapshot> {
        (!self.is_loading()).then(|| self.engine.snapshot())
    }

    pub fn state(&self) -> ActivationState {
        self.engine.snapshot().state
    }

    /// Where the current answer came from.
    pub fn source(&self) -> Option<CacheSource> {
        self.ready_snapshot().and_then(|s| s.source)
    }

    pub fn is_activated(&self) -> bool {
        self.ready_snapshot()
            .and_then(|s| s.status)
            .is_some_and(|status| status.is_activated())
    }

    pub fn needs_first_activation(&self) -> bool {
        self.ready_snapshot().is_some_and(|s| {
            s.state == ActivationState::NeedsFirstActivation
                || s.status.is_some_and(|status| status.needs_first_activation())
        })
    }

    pub fn license_record(&self) -> Option<LicenseRecord> {
        self.ready_snapshot()
            .and_then(|s| s.status)
            .and_then(|status| status.into_record())
    }

    /// Last operation's error, cleared by the next success.
    pub fn error(&self) -> Option<LicenseError> {
        self.error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn in_flight(&self, kind: AttemptKind) -> Option<ActivationAttempt> {
        self.engine.in_flight(kind)
    }

    // === Entitlements ===

    /// Entitlements at this instant.
    pub fn entitlements(&self) -> Entitlements {
        match self.license_record() {
            Some(record) => entitlements::resolve(&record, self.clock.now()),
            None => Entitlements::none(),
        }
    }

    pub fn is_premium(&self) -> bool {
        self.entitlements().is_premium
    }

    pub fn is_expired(&self) -> bool {
        self.entitlements().is_expired
    }

    pub fn accessible_features(&self) -> BTreeSet<String> {
        self.entitlements().accessible_features
    }

    pub fn has_feature_access(&self, feature: &str) -> bool {
        self.license_record()
            .is_some_and(|record| entitlements::has_feature_access(&record, feature, self.clock.now()))
    }

    // === Operations ===

    fn record<T>(&self, result: &LicenseResult<T>) {
        let mut error = self.error.write().unwrap_or_else(PoisonError::into_inner);
        *error = result.as_ref().err().cloned();
    }

    /// Cache-first status check.
    pub async fn check_status(&self) -> LicenseResult<StatusCheck> {
        self.status(false).await
    }

    /// Status check that skips the cache.
    pub async fn force_refresh(&self) -> LicenseResult<StatusCheck> {
        self.status(true).await
    }

    async fn status(&self, force_refresh: bool) -> LicenseResult<StatusCheck> {
        let result = self.engine.check_status(force_refresh).await;
        self.record(&result);
        self.loading.store(false, Ordering::SeqCst);
        result
    }

    pub async fn activate(&self) -> LicenseResult<ActivationResult> {
        let result = self.engine.activate().await;
        self.record(&result);
        result
    }

    pub async fn perform_first_activation(&self, code: &str) -> LicenseResult<ActivationResult> {
        let result = self.engine.perform_first_activation(code).await;
        self.record(&result);
        result
    }

    pub async fn activate_with_code(&self, code: &str) -> LicenseResult<ActivationResult> {
        let result = self.engine.activate_with_code(code).await;
        self.record(&result);
        result
    }

    pub async fn verify_license(&self, include_server_check: bool) -> LicenseResult<bool> {
        let result = self.engine.verify_license(include_server_check).await;
        self.record(&result);
        result
    }

    /// Drop the local cache and ask the server to drop its own.
    ///
    /// The local clear always happens; a failing server call is logged
    /// and otherwise ignored. The facade grants nothing afterwards until
    /// the next [`check_status`](Self::check_status).
    pub async fn clear_cache(&self) {
        self.engine.invalidate_cache();

        if let Err(e) = self.engine.clear_server_cache().await {
            tracing::warn!(
                device_id = %self.engine.device_id(),
                error = %e,
                "Server cache clear failed; local cache was cleared"
            );
        }

        log_license_event(LicenseEvent::CacheCleared, self.engine.device_id(), None);
        self.record::<()>(&Ok(()));
    }
}
