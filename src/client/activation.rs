//! Activation state machine.
//!
//! ```text
//! Uninitialized ─► Checking ─┬─► Activated
//!                            ├─► NeedsFirstActivation ─┐
//!                            └─► Unactivated ──────────┤
//!                                    ▲                 │ activate / first activation
//!                                    └──── Checking ◄──┘
//! ```
//!
//! Every remote call runs on its own task behind a [`SingleFlight`]:
//! concurrent callers of the same attempt kind share one request and one
//! outcome, and an attempt whose callers all gave up still finishes and
//! applies its cache writes. Engine state is published on a
//! [`watch`] channel from inside the attempt for the same reason.
//!
//! Failures never advance state. A rejected, timed out or unreachable
//! activation restores whatever state the engine was in before it started
//! and leaves the cache alone. A failed status check is different: with no
//! last-known-good entry inside the offline grace window, any activated
//! record the engine held is withdrawn, and a status call the server
//! answered unusably also drops the cache entry.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::client::api::{
    ActivationReply, ActivationRequest, LicenseApi, Redemption, VerifyRequest,
};
use crate::client::cache::{CacheEntry, CacheSource, LicenseCache};
use crate::client::errors::{ClientApiError, ClientErrorCode};
use crate::client::license::{LicenseRecord, LicenseStatus};
use crate::client::location::{Location, LocationProvider, NoLocation};
use crate::client::singleflight::SingleFlight;
use crate::clock::Clock;
use crate::config::TillgateConfig;
use crate::errors::{LicenseError, LicenseResult};
use crate::logging::{log_license_event, LicenseEvent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ActivationState {
    #[default]
    Uninitialized,
    Checking,
    Activated,
    NeedsFirstActivation,
    Unactivated,
}

impl ActivationState {
    fn from_status(status: &LicenseStatus) -> Self {
        match status {
            LicenseStatus::Activated { .. } => ActivationState::Activated,
            LicenseStatus::NotActivated {
                first_activation_required: true,
            } => ActivationState::NeedsFirstActivation,
            LicenseStatus::NotActivated { .. } => ActivationState::Unactivated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptKind {
    FirstActivation,
    StandardActivation,
    CodeActivation,
}

impl AttemptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptKind::FirstActivation => "first_activation",
            AttemptKind::StandardActivation => "standard_activation",
            AttemptKind::CodeActivation => "code_activation",
        }
    }
}

/// An activation call currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationAttempt {
    pub kind: AttemptKind,
    pub started_at: DateTime<Utc>,
}

/// Outcome of a successful activation or redemption.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationResult {
    /// The attempt that actually activated. A standard activation that
    /// fell through reports [`AttemptKind::FirstActivation`].
    pub kind: AttemptKind,
    pub message: Option<String>,
    /// Feature unlocked by a redeemed code, when the server names it.
    pub feature: Option<String>,
    /// Record after the post-activation refresh.
    pub record: Option<LicenseRecord>,
}

/// Answer of a status check.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusCheck {
    pub status: LicenseStatus,
    pub source: CacheSource,
    pub fetched_at: DateTime<Utc>,
}

/// What the engine currently believes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSnapshot {
    pub state: ActivationState,
    pub status: Option<LicenseStatus>,
    pub source: Option<CacheSource>,
}

/// Timing and fallback knobs of the engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Oldest cache entry served when the server is unreachable.
    pub offline_grace: chrono::Duration,
    /// Wait between activation success and the forced refresh.
    pub grace_delay: Duration,
    pub location_timeout: Duration,
    /// Code used when standard activation falls through to first activation.
    pub bootstrap_code: Option<String>,
}

impl EngineOptions {
    pub fn from_config(config: &TillgateConfig) -> Self {
        Self {
            offline_grace: i64::try_from(config.cache.offline_grace_secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(chrono::Duration::MAX),
            grace_delay: Duration::from_millis(config.activation.grace_delay_ms),
            location_timeout: Duration::from_millis(config.activation.location_timeout_ms),
            bootstrap_code: config.activation.bootstrap_code.clone(),
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&TillgateConfig::default())
    }
}

pub struct ActivationEngine<A, L = NoLocation> {
    inner: Arc<Inner<A, L>>,
}

impl<A, L> Clone for ActivationEngine<A, L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, L> std::fmt::Debug for ActivationEngine<A, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationEngine")
            .field("device_id", &self.inner.device_id)
            .field("state", &self.inner.snapshot.borrow().state)
            .finish_non_exhaustive()
    }
}

struct Inner<A, L> {
    api: A,
    location: L,
    cache: Arc<LicenseCache>,
    clock: Arc<dyn Clock>,
    device_id: String,
    options: EngineOptions,
    snapshot: watch::Sender<EngineSnapshot>,
    status_flights: SingleFlight<u64, StatusCheck>,
    attempts: SingleFlight<AttemptKind, ActivationResult>,
}

impl<A: LicenseApi> ActivationEngine<A, NoLocation> {
    pub fn new(
        api: A,
        cache: Arc<LicenseCache>,
        clock: Arc<dyn Clock>,
        device_id: impl Into<String>,
        options: EngineOptions,
    ) -> Self {
        Self::with_location(api, NoLocation, cache, clock, device_id, options)
    }
}

impl<A: LicenseApi, L: LocationProvider> ActivationEngine<A, L> {
    pub fn with_location(
        api: A,
        location: L,
        cache: Arc<LicenseCache>,
        clock: Arc<dyn Clock>,
        device_id: impl Into<String>,
        options: EngineOptions,
    ) -> Self {
        let (snapshot, _) = watch::channel(EngineSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                api,
                location,
                cache,
                clock,
                device_id: device_id.into(),
                options,
                snapshot,
                status_flights: SingleFlight::new(),
                attempts: SingleFlight::new(),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn cache(&self) -> &Arc<LicenseCache> {
        &self.inner.cache
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Receive every state change from now on.
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn in_flight(&self, kind: AttemptKind) -> Option<ActivationAttempt> {
        self.inner
            .attempts
            .started_at(&kind)
            .map(|started_at| ActivationAttempt { kind, started_at })
    }

    /// Wait for outstanding attempts and status checks to finish.
    pub async fn wait_idle(&self) {
        self.inner.attempts.wait_idle().await;
        self.inner.status_flights.wait_idle().await;
    }

    /// Status of this device, from the cache when fresh unless `force_refresh`.
    pub async fn check_status(&self, force_refresh: bool) -> LicenseResult<StatusCheck> {
        let inner = &self.inner;

        if !force_refresh {
            if let Some(entry) = inner.cache.read() {
                log_license_event(LicenseEvent::CacheHit, &inner.device_id, None);
                inner.publish(entry.status.clone(), entry.source);
                return Ok(StatusCheck {
                    status: entry.status,
                    source: entry.source,
                    fetched_at: entry.fetched_at,
                });
            }
            log_license_event(LicenseEvent::CacheMiss, &inner.device_id, None);
        }

        Inner::refresh_status(inner).await
    }

    /// Standard activation, falling through to first activation when the
    /// server asks for it.
    pub async fn activate(&self) -> LicenseResult<ActivationResult> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .attempt(AttemptKind::StandardActivation, None, move || async move {
                inner.run_standard_activation().await
            })
            .await
    }

    /// First-time activation with an explicit code.
    pub async fn perform_first_activation(&self, code: &str) -> LicenseResult<ActivationResult> {
        let code = required_code(code)?;
        Inner::first_activation(&self.inner, code).await
    }

    /// Redeem an add-on code. Independent of the base activation state.
    ///
    /// A redemption of a different code already in flight is not joined;
    /// the call fails with a validation error instead.
    pub async fn activate_with_code(&self, code: &str) -> LicenseResult<ActivationResult> {
        let code = required_code(code)?;
        let inner = Arc::clone(&self.inner);
        self.inner
            .attempt(AttemptKind::CodeActivation, Some(code.clone()), move || async move {
                inner.run_code_activation(code).await
            })
            .await
    }

    /// Whether the license is valid.
    ///
    /// Without a server check a fresh, unexpired cached record is enough.
    /// With one, the server must explicitly confirm.
    pub async fn verify_license(&self, include_server_check: bool) -> LicenseResult<bool> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let fresh = inner.cache.read();

        if !include_server_check {
            let local = fresh
                .as_ref()
                .and_then(|entry| entry.status.record())
                .is_some_and(|record| !record.is_expired_at(now));
            if local {
                log_license_event(LicenseEvent::Verified, &inner.device_id, Some("local"));
                return Ok(true);
            }
        }

        let signature = fresh
            .or_else(|| inner.cache.peek())
            .and_then(|entry| entry.status.into_record())
            .and_then(|record| record.signature);

        let request = VerifyRequest {
            device_id: inner.device_id.clone(),
            include_server_check,
            signature,
        };

        let verification = inner.api.verify(request).await.inspect_err(|e| {
            log_license_event(
                LicenseEvent::ActivationFailed,
                &inner.device_id,
                Some(&format!("verify: {e}")),
            )
        })?;

        let expired = verification
            .record
            .as_ref()
            .is_some_and(|record| record.is_expired_at(inner.clock.now()));
        let valid = verification.valid
            && (!include_server_check || verification.server_confirmed)
            && !expired;

        log_license_event(
            LicenseEvent::Verified,
            &inner.device_id,
            Some(if valid { "valid" } else { "invalid" }),
        );
        Ok(valid)
    }

    /// Drop the local cache entry and the answer the engine holds, so
    /// nothing is granted until the next status check.
    pub fn invalidate_cache(&self) {
        self.inner.cache.invalidate();
        self.inner.snapshot.send_replace(EngineSnapshot::default());
        log_license_event(LicenseEvent::CacheInvalidated, &self.inner.device_id, None);
    }

    /// Ask the server to drop its cached view of this device.
    pub async fn clear_server_cache(&self) -> LicenseResult<()> {
        self.inner.api.clear_server_cache(&self.inner.device_id).await
    }
}

fn required_code(code: &str) -> LicenseResult<String> {
    let code = code.trim();
    if code.is_empty() {
        return Err(LicenseError::Validation(
            "activation code is required".to_string(),
        ));
    }
    Ok(code.to_string())
}

impl<A: LicenseApi, L: LocationProvider> Inner<A, L> {
    // === Snapshot ===

    fn publish(&self, status: LicenseStatus, source: CacheSource) {
        self.snapshot.send_replace(EngineSnapshot {
            state: ActivationState::from_status(&status),
            status: Some(status),
            source: Some(source),
        });
    }

    /// Enter `Checking`, returning the state to restore on failure.
    fn begin_checking(&self) -> ActivationState {
        let previous = self.snapshot.borrow().state;
        self.snapshot.send_modify(|s| s.state = ActivationState::Checking);
        previous
    }

    fn restore(&self, previous: ActivationState) {
        self.snapshot.send_if_modified(|s| {
            if s.state == ActivationState::Checking {
                s.state = previous;
                true
            } else {
                false
            }
        });
    }

    /// A status check ended without a trustworthy answer.
    ///
    /// An activated record the engine was holding is withdrawn, so the
    /// facade stops granting access; a not-activated answer is kept since
    /// it grants nothing. Nothing changes if the cache was invalidated
    /// while the check was in flight, because newer truth owns the state.
    fn distrust(&self, previous: ActivationState, generation: u64, drop_cache: bool) {
        let current = if drop_cache {
            self.cache.invalidate_if_current(generation)
        } else {
            self.cache.generation() == generation
        };
        if !current {
            self.restore(previous);
            return;
        }

        self.snapshot.send_if_modified(|s| {
            if s.status.as_ref().is_some_and(LicenseStatus::is_activated) {
                *s = EngineSnapshot::default();
                true
            } else if s.state == ActivationState::Checking {
                s.state = previous;
                true
            } else {
                false
            }
        });
    }

    fn fail(&self, context: &str, err: &LicenseError) {
        log_license_event(
            LicenseEvent::ActivationFailed,
            &self.device_id,
            Some(&format!("{context}: {err}")),
        );
    }

    // === Status ===

    async fn refresh_status(this: &Arc<Self>) -> LicenseResult<StatusCheck> {
        let generation = this.cache.generation();
        let inner = Arc::clone(this);
        let (result, joined) = this
            .status_flights
            .run(generation, this.clock.now(), move || async move {
                inner.fetch_status(generation).await
            })
            .await;

        if joined {
            tracing::debug!(device_id = %this.device_id, "Joined status check in flight");
        }
        result
    }

    async fn fetch_status(&self, generation: u64) -> LicenseResult<StatusCheck> {
        let previous = self.begin_checking();

        match self.api.status(&self.device_id).await {
            Ok(status) => {
                let fetched_at = self.clock.now();
                let entry = CacheEntry::new(status.clone(), fetched_at, CacheSource::Network);

                if self.cache.write_if_current(entry, generation) {
                    self.publish(status.clone(), CacheSource::Network);
                } else {
                    tracing::debug!(
                        device_id = %self.device_id,
                        "Cache invalidated while the status check was in flight; not applying it"
                    );
                    self.restore(previous);
                }

                log_license_event(
                    LicenseEvent::StatusChecked,
                    &self.device_id,
                    Some(status_label(&status)),
                );
                Ok(StatusCheck {
                    status,
                    source: CacheSource::Network,
                    fetched_at,
                })
            }
            Err(e) if e.is_transient() => match self.last_known_good() {
                Some(stale) => {
                    log_license_event(
                        LicenseEvent::StatusFallback,
                        &self.device_id,
                        Some(&e.to_string()),
                    );
                    self.publish(stale.status.clone(), CacheSource::Fallback);
                    Ok(StatusCheck {
                        status: stale.status,
                        source: CacheSource::Fallback,
                        fetched_at: stale.fetched_at,
                    })
                }
                None => {
                    self.distrust(previous, generation, false);
                    self.fail("status", &e);
                    Err(e)
                }
            },
            Err(e) => {
                self.distrust(previous, generation, true);
                self.fail("status", &e);
                Err(e)
            }
        }
    }

    fn last_known_good(&self) -> Option<CacheEntry> {
        if self.options.offline_grace <= chrono::Duration::zero() {
            return None;
        }
        self.cache.read_stale(self.options.offline_grace)
    }

    // === Attempts ===

    /// Run or join the attempt of `kind`. Attempts carrying a code only
    /// join an attempt for the same code.
    async fn attempt<F, Fut>(
        &self,
        kind: AttemptKind,
        code: Option<String>,
        work: F,
    ) -> LicenseResult<ActivationResult>
    where
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = LicenseResult<ActivationResult>> + Send + 'static,
    {
        let (result, joined) = self
            .attempts
            .run_tagged(kind, code, self.clock.now(), work)
            .await;
        if joined {
            log_license_event(LicenseEvent::AttemptJoined, &self.device_id, Some(kind.as_str()));
        }
        result
    }

    async fn first_activation(this: &Arc<Self>, code: String) -> LicenseResult<ActivationResult> {
        let inner = Arc::clone(this);
        this.attempt(AttemptKind::FirstActivation, Some(code.clone()), move || async move {
            inner.run_first_activation(code).await
        })
        .await
    }

    async fn run_standard_activation(self: Arc<Self>) -> LicenseResult<ActivationResult> {
        let previous = self.begin_checking();
        let request =
            ActivationRequest::for_device(&self.device_id).with_location(self.location_hint().await);

        match self.api.activate(request).await {
            Ok(ActivationReply::Activated { record, message }) => {
                log_license_event(
                    LicenseEvent::Activated,
                    &self.device_id,
                    Some(record.license_type.as_str()),
                );
                Self::settle(&self, AttemptKind::StandardActivation, Some(record), message, None)
                    .await
            }
            Ok(ActivationReply::FirstActivationRequired { .. }) => {
                self.restore(previous);
                self.fall_back_to_first_activation().await
            }
            Err(e) => {
                self.restore(previous);
                self.fail("activate", &e);
                Err(e)
            }
        }
    }

    /// `StandardActivation` → `FirstActivationFallback`.
    async fn fall_back_to_first_activation(self: Arc<Self>) -> LicenseResult<ActivationResult> {
        log_license_event(LicenseEvent::FirstActivationFallback, &self.device_id, None);

        let Some(code) = self.options.bootstrap_code.clone() else {
            self.publish(
                LicenseStatus::NotActivated {
                    first_activation_required: true,
                },
                CacheSource::Network,
            );
            let err = LicenseError::Validation(
                "first activation is required but no activation code is configured".to_string(),
            );
            self.fail("activate", &err);
            return Err(err);
        };

        Self::first_activation(&self, code).await
    }

    async fn run_first_activation(self: Arc<Self>, code: String) -> LicenseResult<ActivationResult> {
        let previous = self.begin_checking();
        let request = ActivationRequest::for_device(&self.device_id)
            .with_code(code)
            .with_location(self.location_hint().await);

        match self.api.first_activate(request).await {
            Ok(ActivationReply::Activated { record, message }) => {
                log_license_event(
                    LicenseEvent::FirstActivated,
                    &self.device_id,
                    Some(record.license_type.as_str()),
                );
                Self::settle(&self, AttemptKind::FirstActivation, Some(record), message, None)
                    .await
            }
            Ok(ActivationReply::FirstActivationRequired { message }) => {
                self.restore(previous);
                let err = LicenseError::Rejected(ClientApiError::new(
                    ClientErrorCode::FirstActivationRequired,
                    message.unwrap_or_default(),
                ));
                self.fail("first activation", &err);
                Err(err)
            }
            Err(e) => {
                self.restore(previous);
                self.fail("first activation", &e);
                Err(e)
            }
        }
    }

    async fn run_code_activation(self: Arc<Self>, code: String) -> LicenseResult<ActivationResult> {
        let request = ActivationRequest::for_device(&self.device_id)
            .with_code(code)
            .with_location(self.location_hint().await);

        match self.api.redeem_code(request).await {
            Ok(Redemption {
                message,
                feature,
                record,
            }) => {
                log_license_event(LicenseEvent::CodeRedeemed, &self.device_id, feature.as_deref());
                Self::settle(&self, AttemptKind::CodeActivation, record, message, feature).await
            }
            Err(e) => {
                self.fail("redeem", &e);
                Err(e)
            }
        }
    }

    /// Post-success sequence: invalidate, wait out server-side
    /// propagation, then re-read the truth from the server.
    ///
    /// If the refresh cannot confirm the activation, the record the
    /// activation call returned is cached instead.
    async fn settle(
        this: &Arc<Self>,
        kind: AttemptKind,
        record: Option<LicenseRecord>,
        message: Option<String>,
        feature: Option<String>,
    ) -> LicenseResult<ActivationResult> {
        this.cache.invalidate();
        log_license_event(LicenseEvent::CacheInvalidated, &this.device_id, Some(kind.as_str()));

        if !this.options.grace_delay.is_zero() {
            tokio::time::sleep(this.options.grace_delay).await;
        }

        let confirmed = match Self::refresh_status(this).await {
            Ok(check) if check.source == CacheSource::Network => check.status.into_record(),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(
                    device_id = %this.device_id,
                    error = %e,
                    "Refresh after activation failed; keeping the activation payload"
                );
                None
            }
        };

        let record = match (confirmed, record) {
            (Some(confirmed), _) => Some(confirmed),
            (None, Some(payload)) => {
                let status = LicenseStatus::activated(payload.clone());
                this.cache.write(CacheEntry::new(
                    status.clone(),
                    this.clock.now(),
                    CacheSource::Network,
                ));
                this.publish(status, CacheSource::Network);
                Some(payload)
            }
            (None, None) => None,
        };

        Ok(ActivationResult {
            kind,
            message,
            feature,
            record,
        })
    }

    // === Location ===

    async fn location_hint(&self) -> Option<Location> {
        match tokio::time::timeout(self.options.location_timeout, self.location.locate()).await {
            Ok(Ok(location)) => location,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Location unavailable; activating without it");
                None
            }
            Err(_) => {
                tracing::debug!("Location lookup timed out; activating without it");
                None
            }
        }
    }
}

fn status_label(status: &LicenseStatus) -> &'static str {
    match ActivationState::from_status(status) {
        ActivationState::Activated => "activated",
        ActivationState::NeedsFirstActivation => "needs_first_activation",
        _ => "unactivated",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_follows_status() {
        assert_eq!(
            ActivationState::from_status(&LicenseStatus::NotActivated {
                first_activation_required: true
            }),
            ActivationState::NeedsFirstActivation
        );
        assert_eq!(
            ActivationState::from_status(&LicenseStatus::NotActivated {
                first_activation_required: false
            }),
            ActivationState::Unactivated
        );
        assert_eq!(ActivationState::default(), ActivationState::Uninitialized);
    }

    #[test]
    fn options_from_config() {
        let mut config = TillgateConfig::default();
        config.activation.bootstrap_code = Some("BOOT-1".to_string());
        config.cache.offline_grace_secs = 60;

        let options = EngineOptions::from_config(&config);
        assert_eq!(options.offline_grace, chrono::Duration::seconds(60));
        assert_eq!(options.grace_delay, Duration::from_millis(1_500));
        assert_eq!(options.bootstrap_code.as_deref(), Some("BOOT-1"));
    }

    #[test]
    fn blank_codes_are_rejected_locally() {
        assert!(matches!(
            required_code("  \t"),
            Err(LicenseError::Validation(_))
        ));
        assert_eq!(required_code(" CODE-1 ").unwrap(), "CODE-1");
    }
}
