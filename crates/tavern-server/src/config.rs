use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Placeholder secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me",
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub cookie_secret: String,
    pub token_ttl: Duration,
    pub sketch_debounce: Duration,
    pub secure_cookie: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let port: u16 = var("TAVERN_PORT", "3000")
            .parse()
            .context("TAVERN_PORT must be a port number")?;
        let token_ttl_hours: u64 = var("TAVERN_TOKEN_TTL_HOURS", "24")
            .parse()
            .context("TAVERN_TOKEN_TTL_HOURS must be a whole number of hours")?;
        let debounce_ms: u64 = var("TAVERN_SKETCH_DEBOUNCE_MS", "2000")
            .parse()
            .context("TAVERN_SKETCH_DEBOUNCE_MS must be a whole number of milliseconds")?;
        let secure_cookie = matches!(
            var("TAVERN_SECURE_COOKIE", "false").to_ascii_lowercase().as_str(),
            "1" | "true" | "yes"
        );

        Ok(Self {
            host: var("TAVERN_HOST", "0.0.0.0"),
            port,
            db_path: var("TAVERN_DB_PATH", "tavern.db").into(),
            jwt_secret: secret(&lookup, "TAVERN_JWT_SECRET")?,
            cookie_secret: secret(&lookup, "TAVERN_COOKIE_SECRET")?,
            token_ttl: Duration::from_secs(token_ttl_hours * 3600),
            sketch_debounce: Duration::from_millis(debounce_ms),
            secure_cookie,
        })
    }
}

fn secret<F>(lookup: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key).unwrap_or_default();
    if value.trim().is_empty() || PLACEHOLDER_SECRETS.contains(&value.as_str()) {
        bail!("{key} is unset or still a placeholder. Set it in your .env file and restart.");
    }
    Ok(value)
}
