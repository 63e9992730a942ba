use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::errors::LicenseError;

/// License tiers issued by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseType {
    Trial,
    Full,
    Partial,
    Custom,
    Premium,
    Enterprise,
}

impl LicenseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseType::Trial => "trial",
            LicenseType::Full => "full",
            LicenseType::Partial => "partial",
            LicenseType::Custom => "custom",
            LicenseType::Premium => "premium",
            LicenseType::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for LicenseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LicenseType {
    type Err = LicenseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trial" => Ok(LicenseType::Trial),
            "full" => Ok(LicenseType::Full),
            "partial" => Ok(LicenseType::Partial),
            "custom" => Ok(LicenseType::Custom),
            "premium" => Ok(LicenseType::Premium),
            "enterprise" => Ok(LicenseType::Enterprise),
            other => Err(LicenseError::InconsistentResponse(format!(
                "unknown license type '{other}'"
            ))),
        }
    }
}

/// One add-on entitlement, possibly time-boxed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureGrant {
    /// Code that unlocked the feature (opaque).
    pub activation_code: String,
    pub granted_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Categorical label, e.g. the add-on tier.
    #[serde(rename = "type")]
    pub grant_type: Option<String>,
}

impl FeatureGrant {
    /// A grant is usable until (not including) its expiry instant.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires| now < expires)
    }
}

/// The authoritative truth about one installation's entitlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseRecord {
    pub device_id: String,
    pub license_type: LicenseType,
    /// Features bundled with the base license.
    pub features: BTreeSet<String>,
    /// Separately granted add-ons, keyed by feature id.
    pub feature_licenses: BTreeMap<String, FeatureGrant>,
    pub activated_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    /// `None` means the license never expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// Server-issued authenticity token. Forwarded, never inspected.
    pub signature: Option<String>,
}

impl LicenseRecord {
    /// Record-level expiry; reached at `expires_at` itself.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }
}

/// What the server knows about this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum LicenseStatus {
    Activated {
        record: LicenseRecord,
    },
    #[serde(rename_all = "camelCase")]
    NotActivated {
        /// Server signalled the device has never completed first-time setup.
        first_activation_required: bool,
    },
}

impl LicenseStatus {
    pub fn activated(record: LicenseRecord) -> Self {
        LicenseStatus::Activated { record }
    }

    pub fn record(&self) -> Option<&LicenseRecord> {
        match self {
            LicenseStatus::Activated { record } => Some(record),
            LicenseStatus::NotActivated { .. } => None,
        }
    }

    pub fn into_record(self) -> Option<LicenseRecord> {
        match self {
            LicenseStatus::Activated { record } => Some(record),
            LicenseStatus::NotActivated { .. } => None,
        }
    }

    pub fn is_activated(&self) -> bool {
        matches!(self, LicenseStatus::Activated { .. })
    }

    pub fn needs_first_activation(&self) -> bool {
        matches!(
            self,
            LicenseStatus::NotActivated {
                first_activation_required: true
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn record(expires_at: Option<DateTime<Utc>>) -> LicenseRecord {
        LicenseRecord {
            device_id: "register-01".to_string(),
            license_type: LicenseType::Premium,
            features: BTreeSet::from(["reports".to_string()]),
            feature_licenses: BTreeMap::new(),
            activated_at: None,
            created_at: None,
            expires_at,
            signature: Some("opaque".to_string()),
        }
    }

    #[test]
    fn license_type_parsing_is_case_insensitive() {
        assert_eq!("Premium".parse::<LicenseType>().unwrap(), LicenseType::Premium);
        assert_eq!(" TRIAL ".parse::<LicenseType>().unwrap(), LicenseType::Trial);
        assert!(matches!(
            "platinum".parse::<LicenseType>(),
            Err(LicenseError::InconsistentResponse(_))
        ));
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let rec = record(Some(t));
        assert!(!rec.is_expired_at(t - Duration::seconds(1)));
        assert!(rec.is_expired_at(t));
        assert!(rec.is_expired_at(t + Duration::seconds(1)));
        assert!(!record(None).is_expired_at(t));
    }

    #[test]
    fn grant_without_expiry_is_always_active() {
        let grant = FeatureGrant {
            activation_code: "ADD-ON-1".to_string(),
            granted_at: None,
            expires_at: None,
            grant_type: None,
        };
        assert!(grant.is_active_at(Utc::now()));
    }

    #[test]
    fn status_serializes_with_state_tag() {
        let json = serde_json::to_value(LicenseStatus::NotActivated {
            first_activation_required: true,
        })
        .unwrap();
        assert_eq!(json["state"], "notActivated");
        assert_eq!(json["firstActivationRequired"], true);

        let activated = LicenseStatus::activated(record(None));
        let back: LicenseStatus =
            serde_json::from_value(serde_json::to_value(&activated).unwrap()).unwrap();
        assert_eq!(back, activated);
    }
}
