use std::env;
use std::io::Write;

use serial_test::serial;

use tillgate::config::TillgateConfig;
use tillgate::errors::LicenseError;

const VARS: &[&str] = &[
    "TILLGATE_SERVER_URL",
    "TILLGATE_REQUEST_TIMEOUT_MS",
    "TILLGATE_CACHE_TTL_SECS",
    "TILLGATE_OFFLINE_GRACE_SECS",
    "TILLGATE_CACHE_PERSIST",
    "TILLGATE_GRACE_DELAY_MS",
    "TILLGATE_LOCATION_TIMEOUT_MS",
    "TILLGATE_BOOTSTRAP_CODE",
    "TILLGATE_LOGGING_ENABLED",
    "TILLGATE_LOG_LEVEL",
];

fn clear_env() {
    for var in VARS {
        env::remove_var(var);
    }
}

fn toml_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn env_overrides_cache_ttl() {
    clear_env();
    env::set_var("TILLGATE_CACHE_TTL_SECS", "42");

    let config = TillgateConfig::load().unwrap();
    assert_eq!(config.cache.ttl_secs, 42);

    clear_env();
}

#[test]
#[serial]
fn invalid_server_url_is_a_config_error() {
    clear_env();
    env::set_var("TILLGATE_SERVER_URL", "licenses.example");

    let result = TillgateConfig::load();
    assert!(matches!(result, Err(LicenseError::ConfigError(_))));

    clear_env();
}

#[test]
#[serial]
fn bootstrap_code_comes_from_env() {
    clear_env();
    env::set_var("TILLGATE_BOOTSTRAP_CODE", "BOOT-2025");

    let config = TillgateConfig::load().unwrap();
    assert_eq!(config.activation.bootstrap_code.as_deref(), Some("BOOT-2025"));

    clear_env();
}

#[test]
#[serial]
fn file_values_are_read_and_env_still_wins() {
    clear_env();
    let file = toml_file(
        r#"
[server]
base_url = "https://licenses.example"
request_timeout_ms = 2500

[cache]
ttl_secs = 120
persist = false

[activation]
grace_delay_ms = 0
"#,
    );
    env::set_var("TILLGATE_CACHE_TTL_SECS", "600");

    let config = TillgateConfig::load_from(file.path()).unwrap();
    assert_eq!(config.server.base_url, "https://licenses.example");
    assert_eq!(config.server.request_timeout_ms, 2500);
    assert_eq!(config.cache.ttl_secs, 600);
    assert!(!config.cache.persist);
    assert_eq!(config.activation.grace_delay_ms, 0);
    // untouched sections keep their defaults
    assert_eq!(config.activation.location_timeout_ms, 3_000);
    assert_eq!(config.logging.level, "info");

    clear_env();
}

#[test]
#[serial]
fn missing_explicit_file_is_an_error() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let result = TillgateConfig::load_from(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(LicenseError::ConfigError(_))));
}

#[test]
#[serial]
fn zero_ttl_in_file_is_rejected() {
    clear_env();
    let file = toml_file("[cache]\nttl_secs = 0\n");
    assert!(TillgateConfig::load_from(file.path()).is_err());
}
