//! Remote license server endpoints.
//!
//! [`LicenseApi`] is the seam between the engine and the server: the
//! engine only ever talks to the trait, so tests drive it with a scripted
//! implementation while production uses [`HttpLicenseApi`].
//!
//! # Endpoints
//!
//! | Operation            | Route                        |
//! |----------------------|------------------------------|
//! | status check         | `POST /license/status`       |
//! | standard activation  | `POST /license/activate`     |
//! | first activation     | `POST /license/first-activation` |
//! | code redemption      | `POST /license/redeem`       |
//! | verify               | `POST /license/verify`       |
//! | server cache clear   | `POST /license/cache/clear`  |

use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::future::Future;

use crate::client::errors::{ClientApiError, ClientErrorCode};
use crate::client::license::LicenseStatus;
use crate::client::location::Location;
use crate::client::responses::ServerEnvelope;
use crate::config::ServerConfig;
use crate::errors::{LicenseError, LicenseResult};

pub use crate::client::responses::{ActivationReply, Redemption, Verification};

/// Body of every device-scoped request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationRequest {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl ActivationRequest {
    pub fn for_device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            code: None,
            location: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_location(mut self, location: Option<Location>) -> Self {
        self.location = location;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub device_id: String,
    pub include_server_check: bool,
    /// Opaque token from the cached record, passed through untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Contract of the remote license server.
///
/// Every method returns already-normalized values; transport and alias
/// handling stay behind this trait.
pub trait LicenseApi: Send + Sync + 'static {
    fn status(
        &self,
        device_id: &str,
    ) -> impl Future<Output = LicenseResult<LicenseStatus>> + Send;

    fn activate(
        &self,
        request: ActivationRequest,
    ) -> impl Future<Output = LicenseResult<ActivationReply>> + Send;

    fn first_activate(
        &self,
        request: ActivationRequest,
    ) -> impl Future<Output = LicenseResult<ActivationReply>> + Send;

    fn redeem_code(
        &self,
        request: ActivationRequest,
    ) -> impl Future<Output = LicenseResult<Redemption>> + Send;

    fn verify(
        &self,
        request: VerifyRequest,
    ) -> impl Future<Output = LicenseResult<Verification>> + Send;

    fn clear_server_cache(
        &self,
        device_id: &str,
    ) -> impl Future<Output = LicenseResult<()>> + Send;
}

/// reqwest-backed [`LicenseApi`].
#[derive(Debug, Clone)]
pub struct HttpLicenseApi {
    client: Client,
    base_url: String,
}

impl HttpLicenseApi {
    pub fn new(config: &ServerConfig) -> LicenseResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| LicenseError::ConfigError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST `body` to `path` and decode the envelope.
    ///
    /// - 5xx → [`LicenseError::ServerError`]
    /// - 4xx → the envelope marked as failed (unreadable body → `INVALID_REQUEST`)
    /// - unreadable 2xx → [`LicenseError::InconsistentResponse`]
    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> LicenseResult<ServerEnvelope> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.post(&url).json(body).send().await?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(LicenseError::ServerError(format!(
                "{path} failed with HTTP status {status}"
            )));
        }

        let text = resp.text().await?;
        tracing::debug!(%path, %status, "License server answered");

        match serde_json::from_str::<ServerEnvelope>(&text) {
            Ok(mut envelope) => {
                if status.is_client_error() {
                    envelope.force_failure();
                }
                Ok(envelope)
            }
            Err(e) if status.is_client_error() => {
                Err(LicenseError::Rejected(client_error(status, &text, e)))
            }
            Err(e) => Err(LicenseError::InconsistentResponse(format!(
                "{path} returned an unreadable body: {e}"
            ))),
        }
    }
}

fn client_error(status: StatusCode, text: &str, err: serde_json::Error) -> ClientApiError {
    let message = if text.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {err}")
    };
    ClientApiError::new(ClientErrorCode::InvalidRequest, message)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceRequest<'a> {
    device_id: &'a str,
}

impl LicenseApi for HttpLicenseApi {
    async fn status(&self, device_id: &str) -> LicenseResult<LicenseStatus> {
        self.post("/license/status", &DeviceRequest { device_id })
            .await?
            .into_status(device_id)
    }

    async fn activate(&self, request: ActivationRequest) -> LicenseResult<ActivationReply> {
        self.post("/license/activate", &request)
            .await?
            .into_activation(&request.device_id)
    }

    async fn first_activate(&self, request: ActivationRequest) -> LicenseResult<ActivationReply> {
        self.post("/license/first-activation", &request)
            .await?
            .into_activation(&request.device_id)
    }

    async fn redeem_code(&self, request: ActivationRequest) -> LicenseResult<Redemption> {
        self.post("/license/redeem", &request)
            .await?
            .into_redemption(&request.device_id)
    }

    async fn verify(&self, request: VerifyRequest) -> LicenseResult<Verification> {
        self.post("/license/verify", &request)
            .await?
            .into_verification(&request.device_id)
    }

    async fn clear_server_cache(&self, device_id: &str) -> LicenseResult<()> {
        self.post("/license/cache/clear", &DeviceRequest { device_id })
            .await?
            .into_ack()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_camel_case_without_empty_fields() {
        let json = serde_json::to_value(ActivationRequest::for_device("register-01")).unwrap();
        assert_eq!(json, serde_json::json!({"deviceId": "register-01"}));

        let json = serde_json::to_value(
            ActivationRequest::for_device("register-01")
                .with_code("FIRST-1")
                .with_location(Some(Location {
                    latitude: 59.33,
                    longitude: 18.06,
                    accuracy_m: None,
                })),
        )
        .unwrap();
        assert_eq!(json["code"], "FIRST-1");
        assert_eq!(json["location"]["latitude"], 59.33);
    }

    #[test]
    fn base_url_is_trimmed() {
        let api = HttpLicenseApi::new(&ServerConfig {
            base_url: "http://licenses.local:8080/".to_string(),
            request_timeout_ms: 500,
        })
        .unwrap();
        assert_eq!(api.base_url(), "http://licenses.local:8080");
    }
}
