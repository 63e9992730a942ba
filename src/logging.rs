//! Structured logging for license state changes.
//!
//! The engine reports every meaningful transition through
//! [`log_license_event`], so a support log reads as a timeline:
//!
//! ```text
//! INFO license_event{event=cache_miss device_id=3f2a…}: License event occurred
//! INFO license_event{event=first_activation_fallback device_id=3f2a…}: License event occurred
//! INFO license_event{event=first_activated device_id=3f2a…}: License event occurred details=premium
//! ```

use std::str::FromStr;
use tracing::{info, info_span, warn, Level};

use crate::config::LoggingConfig;
use crate::errors::{LicenseError, LicenseResult};

/// License engine event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseEvent {
    /// Status answered from the session cache
    CacheHit,
    /// Session cache empty or stale, going to the server
    CacheMiss,
    /// Cache entry dropped after a state-changing operation
    CacheInvalidated,
    /// Local and server caches cleared on request
    CacheCleared,
    /// Fresh status received from the server
    StatusChecked,
    /// Server unreachable, answered from last-known-good data
    StatusFallback,
    /// Standard activation succeeded
    Activated,
    /// Standard activation handed over to first activation
    FirstActivationFallback,
    /// First activation succeeded
    FirstActivated,
    /// Add-on code redeemed
    CodeRedeemed,
    /// Caller attached to an attempt already in flight
    AttemptJoined,
    /// An activation or status call failed
    ActivationFailed,
    /// License verification finished
    Verified,
}

impl std::fmt::Display for LicenseEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LicenseEvent::CacheHit => "cache_hit",
            LicenseEvent::CacheMiss => "cache_miss",
            LicenseEvent::CacheInvalidated => "cache_invalidated",
            LicenseEvent::CacheCleared => "cache_cleared",
            LicenseEvent::StatusChecked => "status_checked",
            LicenseEvent::StatusFallback => "status_fallback",
            LicenseEvent::Activated => "activated",
            LicenseEvent::FirstActivationFallback => "first_activation_fallback",
            LicenseEvent::FirstActivated => "first_activated",
            LicenseEvent::CodeRedeemed => "code_redeemed",
            LicenseEvent::AttemptJoined => "attempt_joined",
            LicenseEvent::ActivationFailed => "activation_failed",
            LicenseEvent::Verified => "verified",
        };
        write!(f, "{}", s)
    }
}

/// Log a license engine event.
///
/// # Arguments
///
/// * `event` - The type of license event
/// * `device_id` - The installation the event concerns
/// * `details` - Optional additional details about the event
pub fn log_license_event(event: LicenseEvent, device_id: &str, details: Option<&str>) {
    let span = info_span!(
        "license_event",
        event = %event,
        device_id = %device_id,
    );
    let _enter = span.enter();

    match event {
        LicenseEvent::ActivationFailed | LicenseEvent::StatusFallback => {
            if let Some(d) = details {
                warn!(reason = %d, "License event occurred");
            } else {
                warn!("License event occurred");
            }
        }
        _ => {
            if let Some(d) = details {
                info!(details = %d, "License event occurred");
            } else {
                info!("License event occurred");
            }
        }
    }
}

/// Install a `tracing` subscriber according to the logging configuration.
///
/// Does nothing when logging is disabled. A subscriber that is already
/// installed is left in place.
pub fn init_logging(config: &LoggingConfig) -> LicenseResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let level = Level::from_str(&config.level)
        .map_err(|e| LicenseError::ConfigError(format!("invalid log level: {e}")))?;

    if tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_err()
    {
        log::debug!("tracing subscriber already installed");
    }

    Ok(())
}
