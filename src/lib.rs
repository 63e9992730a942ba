//! Tillgate - license activation and feature entitlement for point-of-sale clients
//!
//! Tillgate decides whether a desktop installation is usable, which premium
//! features it may open, and how that answer survives restarts and offline
//! periods. Everything the UI needs goes through one object, the
//! [`LicenseFacade`](client::facade::LicenseFacade):
//!
//! ```rust,ignore
//! use tillgate::client::facade::LicenseFacade;
//! use tillgate::config::get_config;
//!
//! let facade = LicenseFacade::from_config(get_config()?)?;
//! facade.init().await;
//!
//! if facade.has_feature_access("reports") {
//!     // render the reports screen
//! }
//! ```
//!
//! # Layout
//!
//! - `config`, `errors`, `logging`, `clock`, `device`, `encryption` - ambient
//!   concerns shared by the whole crate.
//! - `client` - the engine: cache, resolver, activation state machine,
//!   facade, and the HTTP binding of the remote license server.

// Core modules
pub mod clock;
pub mod config;
pub mod device;
pub mod encryption;
pub mod errors;
pub mod logging;

// Engine
pub mod client {
    pub mod activation;
    pub mod api;
    pub mod cache;
    pub mod entitlements;
    pub mod errors;
    pub mod facade;
    pub mod license;
    pub mod location;
    pub mod responses;
    pub mod storage;

    pub(crate) mod singleflight;

    pub use facade::LicenseFacade;
    pub use license::{FeatureGrant, LicenseRecord, LicenseStatus, LicenseType};
}
