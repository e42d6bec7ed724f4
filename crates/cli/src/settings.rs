//! Bot settings: optional TOML file, `.env`, then environment overrides.
//!
//! Settings are read once at startup and never change afterwards.

use clap::ValueEnum;
use mt5bot_core::Timeframe;
use mt5bot_engine::NudgePolicy;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "mt5bot.toml";
pub const DEFAULT_TERMINAL_PATH: &str = r"C:\Program Files\MetaTrader 5\terminal64.exe";

/// Longest accepted freeze window: one year.
pub const MAX_FREEZE_HOURS: f64 = 8760.0;
/// Upper bound for `warmup_bars` and `bootstrap_bars`.
pub const MAX_HISTORY_BARS: usize = 100_000;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for {var}: '{value}'")]
    InvalidEnv { var: &'static str, value: String },
    #[error("Invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    // MT5 terminal and account
    pub terminal_path: String,
    pub account_user: u64,
    pub account_pass: String,
    pub server: String,
    pub bridge_host: String,
    pub bridge_port: u16,

    // Trading
    pub symbol: String,
    /// Candle timeframe in minutes.
    pub timeframe: u32,
    pub rr: Decimal,
    /// Fraction of balance risked per trade (0.01 = 1%).
    pub risk_percentage: Decimal,
    pub session_start_hour: u32,
    pub session_end_hour: u32,
    pub utc_offset_hours: i32,
    pub doji_ratio: Decimal,
    pub nudge_mode: NudgePolicy,
    pub nudge_factor: Decimal,
    /// 0 disables ATR stop widening.
    pub atr_sl_multiplier: Decimal,
    /// Hours to stay flat after a position closes.
    pub freeze_hours: Option<f64>,
    pub deviation: u32,
    pub magic: u64,

    // Bot
    pub rate_polling_sec: u64,
    pub warmup_bars: usize,
    pub bootstrap_bars: usize,
    pub close_buffer_sec: u64,
    pub log_level: String,
    pub log_format: LogFormat,
    pub log_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            terminal_path: DEFAULT_TERMINAL_PATH.to_string(),
            account_user: 0,
            account_pass: String::new(),
            server: String::new(),
            bridge_host: "127.0.0.1".to_string(),
            bridge_port: 5556,
            symbol: String::new(),
            timeframe: 5,
            rr: Decimal::new(15, 1),
            risk_percentage: Decimal::new(1, 2),
            session_start_hour: 7,
            session_end_hour: 3,
            utc_offset_hours: 7,
            doji_ratio: Decimal::new(1, 1),
            nudge_mode: NudgePolicy::Conservative,
            nudge_factor: Decimal::new(15, 1),
            atr_sl_multiplier: Decimal::ZERO,
            freeze_hours: None,
            deviation: 20,
            magic: 0,
            rate_polling_sec: 1,
            warmup_bars: 300,
            bootstrap_bars: 10,
            close_buffer_sec: 1,
            log_level: "INFO".to_string(),
            log_format: LogFormat::Compact,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl Settings {
    /// Load `.env`, the TOML file (explicit path, or `mt5bot.toml` when it
    /// exists) and apply environment overrides. Call [`Settings::validate`]
    /// before use.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let _ = dotenvy::dotenv();

        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        settings.apply_env(|var| std::env::var(var).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(contents)?)
    }

    /// Override fields from environment variables. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("MT5_ACCOUNT_USER") {
            self.account_user = parse_env("MT5_ACCOUNT_USER", &v)?;
        }
        if let Some(v) = get("MT5_ACCOUNT_PASS") {
            self.account_pass = v;
        }
        if let Some(v) = get("MT5_SERVER") {
            self.server = v;
        }
        if let Some(v) = get("MT5_TERMINAL_PATH") {
            self.terminal_path = v;
        }
        if let Some(v) = get("MT5_BRIDGE_HOST") {
            self.bridge_host = v;
        }
        if let Some(v) = get("MT5_BRIDGE_PORT") {
            self.bridge_port = parse_env("MT5_BRIDGE_PORT", &v)?;
        }
        if let Some(v) = get("SYMBOL") {
            self.symbol = v.trim().to_string();
        }
        if let Some(v) = get("MT5_RATE_POLLING_SEC") {
            self.rate_polling_sec = parse_env("MT5_RATE_POLLING_SEC", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |msg: &str| Err(SettingsError::Invalid(msg.to_string()));

        if self.account_user == 0 {
            return invalid("account_user (MT5_ACCOUNT_USER) is required");
        }
        if self.account_pass.is_empty() {
            return invalid("account_pass (MT5_ACCOUNT_PASS) is required");
        }
        if self.server.trim().is_empty() {
            return invalid("server (MT5_SERVER) is required");
        }
        if self.symbol.trim().is_empty() {
            return invalid("symbol (SYMBOL) is required");
        }
        if Timeframe::from_minutes(self.timeframe).is_none() {
            return Err(SettingsError::Invalid(format!(
                "timeframe {} is not a supported MT5 timeframe",
                self.timeframe
            )));
        }
        if self.session_start_hour > 23 || self.session_end_hour > 23 {
            return invalid("session hours must be between 0 and 23");
        }
        if !(-12..=14).contains(&self.utc_offset_hours) {
            return invalid("utc_offset_hours must be between -12 and 14");
        }
        if self.risk_percentage <= Decimal::ZERO || self.risk_percentage > Decimal::ONE {
            return invalid("risk_percentage must be in (0, 1]");
        }
        if self.rr <= Decimal::ZERO {
            return invalid("rr must be positive");
        }
        if self.doji_ratio < Decimal::ZERO || self.doji_ratio > Decimal::ONE {
            return invalid("doji_ratio must be in [0, 1]");
        }
        if self.atr_sl_multiplier < Decimal::ZERO {
            return invalid("atr_sl_multiplier must not be negative");
        }
        if self.nudge_factor < Decimal::ZERO || self.nudge_factor > Decimal::ONE_HUNDRED {
            return invalid("nudge_factor must be in [0, 100]");
        }
        if let Some(hours) = self.freeze_hours {
            if !hours.is_finite() || !(0.0..=MAX_FREEZE_HOURS).contains(&hours) {
                return Err(SettingsError::Invalid(format!(
                    "freeze_hours must be between 0 and {}",
                    MAX_FREEZE_HOURS
                )));
            }
        }
        if self.warmup_bars > MAX_HISTORY_BARS || self.bootstrap_bars > MAX_HISTORY_BARS {
            return Err(SettingsError::Invalid(format!(
                "warmup_bars and bootstrap_bars must not exceed {}",
                MAX_HISTORY_BARS
            )));
        }
        if self.rate_polling_sec == 0 {
            return invalid("rate_polling_sec must be at least 1");
        }
        if level_directive(&self.log_level).is_none() {
            return Err(SettingsError::Invalid(format!(
                "unknown log_level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }

    /// Validated timeframe.
    pub fn timeframe(&self) -> Result<Timeframe, SettingsError> {
        Timeframe::from_minutes(self.timeframe).ok_or_else(|| {
            SettingsError::Invalid(format!("unsupported timeframe {}", self.timeframe))
        })
    }

    /// Copy safe to print or log.
    pub fn redacted(&self) -> Self {
        Self {
            account_pass: "********".to_string(),
            ..self.clone()
        }
    }
}

/// Map a log level name (including `WARNING` and `CRITICAL`) to a
/// `tracing` filter directive.
pub fn level_directive(level: &str) -> Option<&'static str> {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => Some("trace"),
        "DEBUG" => Some("debug"),
        "INFO" => Some("info"),
        "WARN" | "WARNING" => Some("warn"),
        "ERROR" | "CRITICAL" => Some("error"),
        _ => None,
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}
