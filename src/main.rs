//!
//! posgate server binary
//! ---------------------
//! Command-line entry point for the point-of-sale identity gateway. Supports
//! configuration via CLI flags and environment variables.

use anyhow::Result;
use std::env;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use posgate::config::{has_flag, Config, HELP};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("{}", HELP);
        return Ok(());
    }

    if let Some(i) = args.iter().position(|a| a == "--hash-password") {
        let Some(password) = args.get(i + 1) else {
            anyhow::bail!("--hash-password requires a value");
        };
        println!("{}", posgate::identity::hash_password(password)?);
        return Ok(());
    }

    // Init logging
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let _ = fmt().with_env_filter(filter).try_init();

    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    let config = Config::from_env_and_args(&args);
    info!(target: "startup", "posgate starting: RUST_LOG='{}', http_port={}", rust_log, config.http_port);

    posgate::server::run(config).await
}
