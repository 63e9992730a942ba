//! Wire shapes of the license server and their normalization.
//!
//! The server has renamed fields more than once, and older deployments
//! are still in the field. Everything it sends is decoded into the loose
//! `Raw*` types below, which accept every known alias, and is then
//! normalized into one canonical [`LicenseRecord`]. Nothing past this
//! module ever sees an alias.
//!
//! Normalization fails closed: a payload that cannot be read with
//! certainty becomes [`LicenseError::InconsistentResponse`] rather than a
//! guess.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::client::errors::{ClientApiError, ClientErrorCode, ServerErrorBody};
use crate::client::license::{FeatureGrant, LicenseRecord, LicenseStatus, LicenseType};
use crate::errors::{LicenseError, LicenseResult};

// === Normalized results ===

/// Outcome of a standard or first activation call.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivationReply {
    Activated {
        record: LicenseRecord,
        message: Option<String>,
    },
    /// The device has never completed first-time setup.
    FirstActivationRequired { message: Option<String> },
}

/// Outcome of an add-on code redemption.
#[derive(Debug, Clone, PartialEq)]
pub struct Redemption {
    pub message: Option<String>,
    /// Feature the code unlocked, when the server names it.
    pub feature: Option<String>,
    /// Updated record, when the server sends one back.
    pub record: Option<LicenseRecord>,
}

/// Outcome of a verify call.
#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    pub valid: bool,
    pub server_confirmed: bool,
    pub record: Option<LicenseRecord>,
}

// === Server Response Parsing ===

/// `error` arrives either as the structured body or as bare text.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum ErrorField {
    Body(ServerErrorBody),
    Text(String),
}

/// Common envelope of every endpoint.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ServerEnvelope {
    pub success: Option<bool>,
    pub message: Option<String>,
    pub code: Option<String>,
    #[serde(rename = "errorCode")]
    pub error_code: Option<String>,
    pub data: Option<RawLicense>,
    pub license: Option<RawLicense>,
    pub activated: Option<bool>,
    #[serde(rename = "isActivated")]
    pub is_activated: Option<bool>,
    #[serde(rename = "needsFirstActivation")]
    pub needs_first_activation: Option<bool>,
    #[serde(rename = "requiresFirstActivation")]
    pub requires_first_activation: Option<bool>,
    pub valid: Option<bool>,
    #[serde(rename = "isValid")]
    pub is_valid: Option<bool>,
    #[serde(rename = "serverConfirmed")]
    pub server_confirmed: Option<bool>,
    pub feature: Option<String>,
    pub error: Option<ErrorField>,
}

/// License payload with every historical field name.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawLicense {
    #[serde(rename = "deviceId")]
    pub device_id_camel: Option<String>,
    pub device_id: Option<String>,
    #[serde(rename = "machineId")]
    pub machine_id: Option<String>,

    #[serde(rename = "licenseType")]
    pub license_type_camel: Option<String>,
    pub license_type: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub tier: Option<String>,

    pub features: Option<Vec<String>>,
    #[serde(rename = "featureLicenses")]
    pub feature_licenses_camel: Option<BTreeMap<String, RawFeatureGrant>>,
    pub feature_licenses: Option<BTreeMap<String, RawFeatureGrant>>,

    #[serde(rename = "activatedAt")]
    pub activated_at_camel: Option<RawTimestamp>,
    pub activated_at: Option<RawTimestamp>,
    #[serde(rename = "activationDate")]
    pub activation_date: Option<RawTimestamp>,

    #[serde(rename = "createdAt")]
    pub created_at_camel: Option<RawTimestamp>,
    pub created_at: Option<RawTimestamp>,

    #[serde(rename = "expiresAt")]
    pub expires_at_camel: Option<RawTimestamp>,
    pub expires_at: Option<RawTimestamp>,
    #[serde(rename = "expiryDate")]
    pub expiry_date: Option<RawTimestamp>,
    #[serde(rename = "expirationDate")]
    pub expiration_date: Option<RawTimestamp>,

    pub signature: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawFeatureGrant {
    #[serde(rename = "activationCode")]
    pub activation_code_camel: Option<String>,
    pub activation_code: Option<String>,
    pub code: Option<String>,
    #[serde(rename = "grantedAt")]
    pub granted_at_camel: Option<RawTimestamp>,
    pub granted_at: Option<RawTimestamp>,
    #[serde(rename = "expiresAt")]
    pub expires_at_camel: Option<RawTimestamp>,
    pub expires_at: Option<RawTimestamp>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(rename = "grantType")]
    pub grant_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawTimestamp {
    Millis(i64),
    Text(String),
}

// === Normalization ===

fn inconsistent(msg: impl Into<String>) -> LicenseError {
    LicenseError::InconsistentResponse(msg.into())
}

/// Parse a server timestamp. Blank text means absent.
pub(crate) fn parse_timestamp(
    field: &str,
    raw: Option<RawTimestamp>,
) -> LicenseResult<Option<DateTime<Utc>>> {
    let text = match raw {
        None => return Ok(None),
        Some(RawTimestamp::Millis(ms)) => {
            return Utc
                .timestamp_millis_opt(ms)
                .single()
                .map(Some)
                .ok_or_else(|| inconsistent(format!("{field}: {ms} is out of range")));
        }
        Some(RawTimestamp::Text(text)) => text,
    };

    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(Some(naive.and_utc()));
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(Some(midnight.and_utc()));
    }

    Err(inconsistent(format!("{field}: unreadable timestamp '{text}'")))
}

impl RawFeatureGrant {
    fn normalize(self, feature: &str) -> LicenseResult<FeatureGrant> {
        Ok(FeatureGrant {
            activation_code: self
                .activation_code_camel
                .or(self.activation_code)
                .or(self.code)
                .unwrap_or_default(),
            granted_at: parse_timestamp(
                &format!("featureLicenses.{feature}.grantedAt"),
                self.granted_at_camel.or(self.granted_at),
            )?,
            expires_at: parse_timestamp(
                &format!("featureLicenses.{feature}.expiresAt"),
                self.expires_at_camel.or(self.expires_at),
            )?,
            grant_type: self.kind.or(self.grant_type),
        })
    }
}

impl RawLicense {
    /// Build the canonical record for `requested_device`.
    pub(crate) fn normalize(self, requested_device: &str) -> LicenseResult<LicenseRecord> {
        let device_id = match self
            .device_id_camel
            .or(self.device_id)
            .or(self.machine_id)
            .filter(|id| !id.trim().is_empty())
        {
            Some(id) if id != requested_device => {
                return Err(inconsistent(format!(
                    "payload belongs to device '{id}', not '{requested_device}'"
                )));
            }
            _ => requested_device.to_string(),
        };

        let license_type: LicenseType = self
            .license_type_camel
            .or(self.license_type)
            .or(self.kind)
            .or(self.tier)
            .ok_or_else(|| inconsistent("payload has no license type"))?
            .parse()?;

        let features: BTreeSet<String> = self
            .features
            .unwrap_or_default()
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();

        let feature_licenses = self
            .feature_licenses_camel
            .or(self.feature_licenses)
            .unwrap_or_default()
            .into_iter()
            .map(|(feature, grant)| {
                let grant = grant.normalize(&feature)?;
                Ok((feature, grant))
            })
            .collect::<LicenseResult<BTreeMap<_, _>>>()?;

        Ok(LicenseRecord {
            device_id,
            license_type,
            features,
            feature_licenses,
            activated_at: parse_timestamp(
                "activatedAt",
                self.activated_at_camel
                    .or(self.activated_at)
                    .or(self.activation_date),
            )?,
            created_at: parse_timestamp("createdAt", self.created_at_camel.or(self.created_at))?,
            expires_at: parse_timestamp(
                "expiresAt",
                self.expires_at_camel
                    .or(self.expires_at)
                    .or(self.expiry_date)
                    .or(self.expiration_date),
            )?,
            signature: self.signature.filter(|s| !s.is_empty()),
        })
    }
}

fn parse_code(raw: &str) -> ClientErrorCode {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_string()))
        .unwrap_or(ClientErrorCode::Unknown)
}

impl ServerEnvelope {
    /// The business rejection this envelope carries, if any.
    pub(crate) fn failure(&self) -> Option<ClientApiError> {
        match &self.error {
            Some(ErrorField::Body(body)) => return Some(body.clone().into()),
            Some(ErrorField::Text(text)) => {
                return Some(ClientApiError::new(self.code_or_unknown(), text.clone()))
            }
            None => {}
        }

        (self.success == Some(false)).then(|| {
            ClientApiError::new(
                self.code_or_unknown(),
                self.message.clone().unwrap_or_default(),
            )
        })
    }

    fn code_or_unknown(&self) -> ClientErrorCode {
        self.code
            .as_deref()
            .or(self.error_code.as_deref())
            .map(parse_code)
            .unwrap_or(ClientErrorCode::Unknown)
    }

    fn first_activation_flag(&self) -> bool {
        self.needs_first_activation
            .or(self.requires_first_activation)
            .unwrap_or(false)
    }

    fn activated_flag(&self) -> Option<bool> {
        self.activated.or(self.is_activated)
    }

    fn take_payload(&mut self) -> Option<RawLicense> {
        self.data.take().or_else(|| self.license.take())
    }

    /// Mark the envelope as failed, as when it came with a 4xx status.
    pub(crate) fn force_failure(&mut self) {
        if self.error.is_none() {
            self.success = Some(false);
        }
    }

    /// Interpret a status-check answer.
    ///
    /// "Not activated" is an answer, not an error, whether it comes as a
    /// flag on a successful envelope or as a rejection saying the device
    /// holds no usable license (not activated, expired, revoked, or bound
    /// elsewhere).
    pub(crate) fn into_status(mut self, device_id: &str) -> LicenseResult<LicenseStatus> {
        if self.activated_flag() == Some(false) || self.first_activation_flag() {
            return Ok(LicenseStatus::NotActivated {
                first_activation_required: self.first_activation_flag(),
            });
        }

        if let Some(failure) = self.failure() {
            return match failure.code {
                ClientErrorCode::FirstActivationRequired => Ok(LicenseStatus::NotActivated {
                    first_activation_required: true,
                }),
                code if code.ends_license() => Ok(LicenseStatus::NotActivated {
                    first_activation_required: self.first_activation_flag(),
                }),
                _ => Err(LicenseError::Rejected(failure)),
            };
        }

        let payload = self
            .take_payload()
            .ok_or_else(|| inconsistent("status reported success without a license payload"))?;
        Ok(LicenseStatus::activated(payload.normalize(device_id)?))
    }

    /// Interpret a standard or first activation answer.
    pub(crate) fn into_activation(mut self, device_id: &str) -> LicenseResult<ActivationReply> {
        if let Some(failure) = self.failure() {
            if failure.code == ClientErrorCode::FirstActivationRequired
                || self.first_activation_flag()
            {
                return Ok(ActivationReply::FirstActivationRequired {
                    message: Some(failure.message),
                });
            }
            return Err(LicenseError::Rejected(failure));
        }

        if self.first_activation_flag() {
            return Ok(ActivationReply::FirstActivationRequired {
                message: self.message.take(),
            });
        }

        let payload = self.take_payload().ok_or_else(|| {
            inconsistent("activation reported success without a license payload")
        })?;
        Ok(ActivationReply::Activated {
            record: payload.normalize(device_id)?,
            message: self.message.take(),
        })
    }

    /// Interpret a code redemption answer. The record is optional here.
    pub(crate) fn into_redemption(mut self, device_id: &str) -> LicenseResult<Redemption> {
        if let Some(failure) = self.failure() {
            return Err(LicenseError::Rejected(failure));
        }

        let record = self
            .take_payload()
            .map(|payload| payload.normalize(device_id))
            .transpose()?;
        Ok(Redemption {
            message: self.message.take(),
            feature: self.feature.take(),
            record,
        })
    }

    /// Interpret a verify answer.
    pub(crate) fn into_verification(mut self, device_id: &str) -> LicenseResult<Verification> {
        if let Some(failure) = self.failure() {
            return match failure.code {
                code if code.ends_license() => Ok(Verification {
                    valid: false,
                    server_confirmed: true,
                    record: None,
                }),
                _ => Err(LicenseError::Rejected(failure)),
            };
        }

        let record = self
            .take_payload()
            .map(|payload| payload.normalize(device_id))
            .transpose()?;
        Ok(Verification {
            valid: self.valid.or(self.is_valid).or(self.success).unwrap_or(false),
            server_confirmed: self.server_confirmed.unwrap_or(false),
            record,
        })
    }

    /// Interpret a server-side cache clear answer.
    pub(crate) fn into_ack(self) -> LicenseResult<()> {
        match self.failure() {
            Some(failure) => Err(LicenseError::Rejected(failure)),
            None => Ok(()),
        }
    }
}
