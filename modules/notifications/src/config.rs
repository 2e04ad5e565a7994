use std::env;
use std::time::Duration;

use grade_contracts::BusSettings;

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub bus: BusSettings,
    pub host: String,
    pub port: u16,
    pub poll_interval: Duration,
    pub consumer_tag: String,
    pub json_logs: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let bus = BusSettings::from_env()?;

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .map_err(|_| "PORT must be a valid u16".to_string())?;

        let poll_interval_ms: u64 = env::var("WORKER_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .map_err(|_| "WORKER_POLL_INTERVAL_MS must be a positive integer".to_string())?;
        if poll_interval_ms == 0 {
            return Err("WORKER_POLL_INTERVAL_MS must be a positive integer".to_string());
        }

        let consumer_tag =
            env::var("WORKER_CONSUMER_TAG").unwrap_or_else(|_| "notifications-worker".to_string());

        let json_logs = env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(Config {
            bus,
            host,
            port,
            poll_interval: Duration::from_millis(poll_interval_ms),
            consumer_tag,
            json_logs,
        })
    }
}
