//! Optional location hint attached to activation requests.
//!
//! Location is advisory. A provider that fails, hangs, or has nothing to
//! offer never blocks activation; the request is simply sent without it.

use serde::{Deserialize, Serialize};
use std::future::Future;

use crate::errors::LicenseResult;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Accuracy radius in meters, when the provider reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
}

/// Source of location hints.
pub trait LocationProvider: Send + Sync + 'static {
    /// `Ok(None)` when no fix is available.
    fn locate(&self) -> impl Future<Output = LicenseResult<Option<Location>>> + Send;
}

/// Provider for installations that never send a location.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocation;

impl LocationProvider for NoLocation {
    async fn locate(&self) -> LicenseResult<Option<Location>> {
        Ok(None)
    }
}

/// A provider that always reports the same fix.
#[derive(Debug, Clone, Copy)]
pub struct FixedLocation(pub Location);

impl LocationProvider for FixedLocation {
    async fn locate(&self) -> LicenseResult<Option<Location>> {
        Ok(Some(self.0))
    }
}
