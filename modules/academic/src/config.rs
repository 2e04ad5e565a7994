use std::env;

use grade_contracts::BusSettings;

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub bus: BusSettings,
    pub host: String,
    pub port: u16,
    pub json_logs: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let bus = BusSettings::from_env()?;

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "5001".to_string())
            .parse()
            .map_err(|_| "PORT must be a valid u16".to_string())?;

        let json_logs = env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(Config {
            bus,
            host,
            port,
            json_logs,
        })
    }
}
