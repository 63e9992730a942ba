//! Feature entitlement resolution.
//!
//! Only the raw [`LicenseRecord`] is ever cached. Derived answers are
//! recomputed against the current time on every call, so a feature whose
//! grant runs out becomes inaccessible on the next check without waiting
//! for a network refresh.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use crate::client::license::{LicenseRecord, LicenseType};

/// Access derived from one record at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entitlements {
    pub is_premium: bool,
    pub is_expired: bool,
    pub accessible_features: BTreeSet<String>,
}

impl Entitlements {
    /// No access at all. Used whenever the license state is unknown.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn has_access(&self, feature: &str) -> bool {
        self.accessible_features.contains(feature)
    }
}

/// Resolve what `record` grants at `now`.
///
/// An expired base license revokes everything, including add-on grants
/// that are individually still valid.
pub fn resolve(record: &LicenseRecord, now: DateTime<Utc>) -> Entitlements {
    if record.is_expired_at(now) {
        return Entitlements {
            is_premium: false,
            is_expired: true,
            accessible_features: BTreeSet::new(),
        };
    }

    let mut accessible_features = record.features.clone();
    accessible_features.extend(
        record
            .feature_licenses
            .iter()
            .filter(|(_, grant)| grant.is_active_at(now))
            .map(|(feature, _)| feature.clone()),
    );

    Entitlements {
        is_premium: record.license_type != LicenseType::Trial && !accessible_features.is_empty(),
        is_expired: false,
        accessible_features,
    }
}

/// Whether `feature` is accessible under `record` at `now`.
pub fn has_feature_access(record: &LicenseRecord, feature: &str, now: DateTime<Utc>) -> bool {
    if record.is_expired_at(now) {
        return false;
    }
    record.features.contains(feature)
        || record
            .feature_licenses
            .get(feature)
            .is_some_and(|grant| grant.is_active_at(now))
}
