//! Runtime configuration. CLI flags override environment variables, which
//! override defaults.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub http_port: u16,
    pub database_url: String,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Ceiling on the age of a session-stored offline record; zero disables the
    /// offline fallback.
    pub offline_max_age: Duration,
    pub session_ttl: Duration,
    pub cookie_secure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8000,
            database_url: "host=localhost user=pos dbname=sistema_pos".to_string(),
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_millis(750),
            offline_max_age: Duration::from_secs(12 * 60 * 60),
            session_ttl: Duration::from_secs(12 * 60 * 60),
            cookie_secure: false,
        }
    }
}

pub const HELP: &str = "posgate\n\nUSAGE:\n  posgate [OPTIONS]\n  posgate --hash-password <PASSWORD>\n\nOPTIONS:\n  --http-port N               HTTP port (env: POS_HTTP_PORT, default 8000)\n  --database-url URL          PostgreSQL connection string (env: POS_DATABASE_URL)\n  --probe-interval-ms N       Minimum time between liveness probes (env: POS_PROBE_INTERVAL_MS, default 5000)\n  --probe-timeout-ms N        Liveness probe timeout (env: POS_PROBE_TIMEOUT_MS, default 750)\n  --offline-max-age-secs N    Max age of an offline session record, 0 disables (env: POS_OFFLINE_MAX_AGE_SECS, default 43200)\n  --session-ttl-secs N        Session lifetime (env: POS_SESSION_TTL_SECS, default 43200)\n  --cookie-secure [bool]      Mark the session cookie Secure (env: POS_COOKIE_SECURE, default false)\n  --hash-password PASSWORD    Print an Argon2 PHC hash for provisioning usuarios.contrasenaHash\n";

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        i += 1;
    }
    None
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_bool_arg(args: &[String], flag: &str) -> Option<bool> {
    let i = args.iter().position(|a| a == flag)?;
    match args.get(i + 1) {
        Some(next) if !next.starts_with('-') => Some(parse_bool(next).unwrap_or(true)),
        _ => Some(true),
    }
}

impl Config {
    pub fn from_env_and_args(args: &[String]) -> Self {
        Self::resolve(args, |name| std::env::var(name).ok())
    }

    /// Resolve against an explicit environment lookup.
    pub fn resolve<F>(args: &[String], env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Config::default();
        let pick = |flag: &str, var: &str| arg_value(args, flag).or_else(|| env(var));
        let num = |flag: &str, var: &str| pick(flag, var).and_then(|v| v.trim().parse::<u64>().ok());

        let http_port = pick("--http-port", "POS_HTTP_PORT")
            .and_then(|v| v.trim().parse::<u16>().ok())
            .unwrap_or(d.http_port);
        let database_url = pick("--database-url", "POS_DATABASE_URL").unwrap_or(d.database_url);
        let probe_interval = num("--probe-interval-ms", "POS_PROBE_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(d.probe_interval);
        let probe_timeout = num("--probe-timeout-ms", "POS_PROBE_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(d.probe_timeout);
        let offline_max_age = num("--offline-max-age-secs", "POS_OFFLINE_MAX_AGE_SECS")
            .map(Duration::from_secs)
            .unwrap_or(d.offline_max_age);
        let session_ttl = num("--session-ttl-secs", "POS_SESSION_TTL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(d.session_ttl);
        let cookie_secure = parse_bool_arg(args, "--cookie-secure")
            .or_else(|| env("POS_COOKIE_SECURE").and_then(|v| parse_bool(&v)))
            .unwrap_or(d.cookie_secure);

        Self { http_port, database_url, probe_interval, probe_timeout, offline_max_age, session_ttl, cookie_secure }
    }
}
