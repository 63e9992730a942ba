//! Shared fixtures: a scripted license server and engine wiring.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use tillgate::client::activation::{ActivationEngine, EngineOptions};
use tillgate::client::api::{
    ActivationReply, ActivationRequest, LicenseApi, Redemption, Verification, VerifyRequest,
};
use tillgate::client::cache::LicenseCache;
use tillgate::client::facade::LicenseFacade;
use tillgate::client::license::{LicenseRecord, LicenseStatus, LicenseType};
use tillgate::client::location::{LocationProvider, NoLocation};
use tillgate::client::storage::MemoryStore;
use tillgate::clock::{Clock, ManualClock};
use tillgate::errors::{LicenseError, LicenseResult};

pub const DEVICE: &str = "register-01";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
}

pub fn record(license_type: LicenseType, features: &[&str]) -> LicenseRecord {
    LicenseRecord {
        device_id: DEVICE.to_string(),
        license_type,
        features: features.iter().map(|f| f.to_string()).collect::<BTreeSet<_>>(),
        feature_licenses: BTreeMap::new(),
        activated_at: Some(start_time()),
        created_at: Some(start_time()),
        expires_at: None,
        signature: Some("sig-register-01".to_string()),
    }
}

pub fn not_activated(first_activation_required: bool) -> LicenseStatus {
    LicenseStatus::NotActivated {
        first_activation_required,
    }
}

#[derive(Default)]
struct Calls {
    status: AtomicUsize,
    activate: AtomicUsize,
    first_activate: AtomicUsize,
    redeem: AtomicUsize,
    verify: AtomicUsize,
    clear: AtomicUsize,
}

struct Script {
    status: LicenseResult<LicenseStatus>,
    activate: LicenseResult<ActivationReply>,
    first_activate: LicenseResult<ActivationReply>,
    redeem: LicenseResult<Redemption>,
    verify: LicenseResult<Verification>,
    clear: LicenseResult<()>,
    status_after_redeem: Option<LicenseStatus>,
    sticky_status: bool,
    delay: Duration,
    last_activation: Option<ActivationRequest>,
    last_verify: Option<VerifyRequest>,
}

/// Scripted [`LicenseApi`] that counts calls per endpoint.
///
/// A successful activation switches the scripted status to the activated
/// record, the way a real server would.
#[derive(Clone)]
pub struct MockApi {
    calls: Arc<Calls>,
    script: Arc<Mutex<Script>>,
}

impl Default for MockApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockApi {
    pub fn new() -> Self {
        let unscripted = || LicenseError::Network("endpoint not scripted".to_string());
        Self {
            calls: Arc::new(Calls::default()),
            script: Arc::new(Mutex::new(Script {
                status: Ok(not_activated(false)),
                activate: Err(unscripted()),
                first_activate: Err(unscripted()),
                redeem: Err(unscripted()),
                verify: Err(unscripted()),
                clear: Ok(()),
                status_after_redeem: None,
                sticky_status: false,
                delay: Duration::ZERO,
                last_activation: None,
                last_verify: None,
            })),
        }
    }

    fn edit(&self, f: impl FnOnce(&mut Script)) -> &Self {
        f(&mut self.script.lock().unwrap());
        self
    }

    pub fn with_status(&self, status: LicenseResult<LicenseStatus>) -> &Self {
        self.edit(|s| s.status = status)
    }

    pub fn with_activate(&self, reply: LicenseResult<ActivationReply>) -> &Self {
        self.edit(|s| s.activate = reply)
    }

    pub fn with_first_activate(&self, reply: LicenseResult<ActivationReply>) -> &Self {
        self.edit(|s| s.first_activate = reply)
    }

    pub fn with_redeem(&self, reply: LicenseResult<Redemption>, then: Option<LicenseStatus>) -> &Self {
        self.edit(|s| {
            s.redeem = reply;
            s.status_after_redeem = then;
        })
    }

    pub fn with_verify(&self, reply: LicenseResult<Verification>) -> &Self {
        self.edit(|s| s.verify = reply)
    }

    pub fn with_clear(&self, reply: LicenseResult<()>) -> &Self {
        self.edit(|s| s.clear = reply)
    }

    /// Keep the scripted status even after a successful activation.
    pub fn with_sticky_status(&self) -> &Self {
        self.edit(|s| s.sticky_status = true)
    }

    pub fn with_delay(&self, delay: Duration) -> &Self {
        self.edit(|s| s.delay = delay)
    }

    pub fn status_calls(&self) -> usize {
        self.calls.status.load(Ordering::SeqCst)
    }

    pub fn activate_calls(&self) -> usize {
        self.calls.activate.load(Ordering::SeqCst)
    }

    pub fn first_activate_calls(&self) -> usize {
        self.calls.first_activate.load(Ordering::SeqCst)
    }

    pub fn redeem_calls(&self) -> usize {
        self.calls.redeem.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.calls.verify.load(Ordering::SeqCst)
    }

    pub fn clear_calls(&self) -> usize {
        self.calls.clear.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.status_calls()
            + self.activate_calls()
            + self.first_activate_calls()
            + self.redeem_calls()
            + self.verify_calls()
            + self.clear_calls()
    }

    pub fn last_activation(&self) -> Option<ActivationRequest> {
        self.script.lock().unwrap().last_activation.clone()
    }

    pub fn last_verify(&self) -> Option<VerifyRequest> {
        self.script.lock().unwrap().last_verify.clone()
    }

    async fn pause(&self) {
        let delay = self.script.lock().unwrap().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn activation_reply(
        &self,
        request: ActivationRequest,
        pick: impl FnOnce(&Script) -> LicenseResult<ActivationReply>,
    ) -> LicenseResult<ActivationReply> {
        let mut script = self.script.lock().unwrap();
        script.last_activation = Some(request);
        let reply = pick(&script);
        if let (Ok(ActivationReply::Activated { record, .. }), false) = (&reply, script.sticky_status) {
            script.status = Ok(LicenseStatus::activated(record.clone()));
        }
        reply
    }
}

impl LicenseApi for MockApi {
    async fn status(&self, _device_id: &str) -> LicenseResult<LicenseStatus> {
        self.calls.status.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.script.lock().unwrap().status.clone()
    }

    async fn activate(&self, request: ActivationRequest) -> LicenseResult<ActivationReply> {
        self.calls.activate.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.activation_reply(request, |s| s.activate.clone())
    }

    async fn first_activate(&self, request: ActivationRequest) -> LicenseResult<ActivationReply> {
        self.calls.first_activate.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.activation_reply(request, |s| s.first_activate.clone())
    }

    async fn redeem_code(&self, request: ActivationRequest) -> LicenseResult<Redemption> {
        self.calls.redeem.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let mut script = self.script.lock().unwrap();
        script.last_activation = Some(request);
        let reply = script.redeem.clone();
        if reply.is_ok() {
            if let Some(next) = script.status_after_redeem.take() {
                script.status = Ok(next);
            }
        }
        reply
    }

    async fn verify(&self, request: VerifyRequest) -> LicenseResult<Verification> {
        self.calls.verify.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let mut script = self.script.lock().unwrap();
        script.last_verify = Some(request);
        script.verify.clone()
    }

    async fn clear_server_cache(&self, _device_id: &str) -> LicenseResult<()> {
        self.calls.clear.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.script.lock().unwrap().clear.clone()
    }
}

/// Options with no post-activation wait, so tests run fast.
pub fn options() -> EngineOptions {
    EngineOptions {
        offline_grace: chrono::Duration::days(3),
        grace_delay: Duration::ZERO,
        location_timeout: Duration::from_millis(50),
        bootstrap_code: None,
    }
}

pub struct Harness<L = NoLocation> {
    pub api: MockApi,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub cache: Arc<LicenseCache>,
    pub engine: ActivationEngine<MockApi, L>,
}

pub fn harness(api: &MockApi, options: EngineOptions) -> Harness {
    harness_with_store(api, options, Arc::new(MemoryStore::new()))
}

pub fn harness_with_store(api: &MockApi, options: EngineOptions, store: Arc<MemoryStore>) -> Harness {
    harness_with_location(api, options, store, NoLocation)
}

pub fn harness_with_location<L: LocationProvider>(
    api: &MockApi,
    options: EngineOptions,
    store: Arc<MemoryStore>,
    location: L,
) -> Harness<L> {
    let clock = Arc::new(ManualClock::new(start_time()));
    let cache = Arc::new(LicenseCache::open(
        chrono::Duration::minutes(5),
        clock.clone(),
        store.clone(),
    ));
    let engine = ActivationEngine::with_location(
        api.clone(),
        location,
        Arc::clone(&cache),
        clock.clone(),
        DEVICE,
        options,
    );
    Harness {
        api: api.clone(),
        clock,
        store,
        cache,
        engine,
    }
}

impl<L: LocationProvider> Harness<L> {
    pub fn facade(&self) -> LicenseFacade<MockApi, L> {
        let clock: Arc<dyn Clock> = self.clock.clone();
        LicenseFacade::new(self.engine.clone(), clock)
    }
}
