// src/client/main.rs

use tillgate::client::facade::LicenseFacade;
use tillgate::config::get_config;
use tillgate::errors::{LicenseError, LicenseResult};
use tillgate::logging::init_logging;

const USAGE: &str = "usage: tillgate_client <status | refresh | activate | first-activation CODE | redeem CODE | verify [--server] | features | clear-cache>";

/// Small operator tool around the license facade.
///
/// Reads `tillgate.toml` and `TILLGATE_*` variables, runs the startup
/// status check, then performs one command and prints the result.
#[tokio::main]
async fn main() -> LicenseResult<()> {
    let config = get_config()?;
    init_logging(&config.logging)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("status");

    let facade = LicenseFacade::from_config(config)?;
    facade.init().await;

    match command {
        "status" => print_status(&facade),
        "refresh" => {
            facade.force_refresh().await?;
            print_status(&facade);
        }
        "activate" => {
            let result = facade.activate().await?;
            println!("Activated ({})", result.kind.as_str());
            print_status(&facade);
        }
        "first-activation" => {
            let result = facade.perform_first_activation(arg(&args)?).await?;
            println!("Activated ({})", result.kind.as_str());
            print_status(&facade);
        }
        "redeem" => {
            let result = facade.activate_with_code(arg(&args)?).await?;
            match result.feature {
                Some(feature) => println!("Unlocked: {feature}"),
                None => println!("Code redeemed"),
            }
            if let Some(message) = result.message {
                println!("{message}");
            }
        }
        "verify" => {
            let server = args.iter().any(|a| a == "--server");
            let valid = facade.verify_license(server).await?;
            println!("License valid: {valid}");
        }
        "features" => {
            let features = facade.accessible_features();
            if features.is_empty() {
                println!("No features available");
            }
            for feature in features {
                println!("  {feature}");
            }
        }
        "clear-cache" => {
            facade.clear_cache().await;
            println!("License cache cleared");
        }
        _ => {
            eprintln!("{USAGE}");
            return Err(LicenseError::Validation(format!("unknown command '{command}'")));
        }
    }

    facade.shutdown().await;
    Ok(())
}

fn arg(args: &[String]) -> LicenseResult<&str> {
    args.get(1)
        .map(String::as_str)
        .ok_or_else(|| LicenseError::Validation(USAGE.to_string()))
}

fn print_status<A, L>(facade: &LicenseFacade<A, L>)
where
    A: tillgate::client::api::LicenseApi,
    L: tillgate::client::location::LocationProvider,
{
    if let Some(err) = facade.error() {
        println!("Last error: {} ({:?})", err.message(), err.code());
    }

    match facade.license_record() {
        Some(record) => {
            let ent = facade.entitlements();
            println!("Device:    {}", record.device_id);
            println!("License:   {}", record.license_type);
            match record.expires_at {
                Some(at) => println!("Expires:   {}", at.to_rfc3339()),
                None => println!("Expires:   never"),
            }
            println!("Premium:   {}", ent.is_premium);
            println!("Expired:   {}", ent.is_expired);
            if let Some(source) = facade.source() {
                println!("Source:    {source:?}");
            }
        }
        None if facade.needs_first_activation() => {
            println!("Not activated: first-time activation required");
        }
        None => println!("Not activated"),
    }
}
