use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

const SANDBOX_BASE_URL: &str = "https://cybqa.pesapal.com/pesapalv3";
const PRODUCTION_BASE_URL: &str = "https://pay.pesapal.com/v3";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration value {0}")]
    Missing(&'static str),
    #[error("invalid configuration value {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PesapalEnvironment {
    #[default]
    Sandbox,
    Production,
}

impl PesapalEnvironment {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sandbox" | "development" | "test" => Some(Self::Sandbox),
            "production" | "live" => Some(Self::Production),
            _ => None,
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct PesapalSettings {
    #[serde(default)]
    pub consumer_key: String,
    #[serde(default)]
    pub consumer_secret: String,
    #[serde(default)]
    pub environment: PesapalEnvironment,
    /// Overrides the environment-derived base URL when set.
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_pesapal_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_token_refresh_margin", with = "humantime_serde")]
    pub token_refresh_margin: Duration,
    #[serde(default = "default_max_initiation_retries")]
    pub max_initiation_retries: u32,
}

impl PesapalSettings {
    pub fn resolved_base_url(&self) -> String {
        if !self.base_url.is_empty() {
            return self.base_url.trim_end_matches('/').to_string();
        }
        match self.environment {
            PesapalEnvironment::Sandbox => SANDBOX_BASE_URL.to_string(),
            PesapalEnvironment::Production => PRODUCTION_BASE_URL.to_string(),
        }
    }
}

// Credentials stay out of Debug output.
impl fmt::Debug for PesapalSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PesapalSettings")
            .field("consumer_key", &redacted(&self.consumer_key))
            .field("consumer_secret", &redacted(&self.consumer_secret))
            .field("environment", &self.environment)
            .field("base_url", &self.base_url)
            .field("timeout_ms", &self.timeout_ms)
            .field("token_refresh_margin", &self.token_refresh_margin)
            .field("max_initiation_retries", &self.max_initiation_retries)
            .finish()
    }
}

impl Default for PesapalSettings {
    fn default() -> Self {
        Self {
            consumer_key: String::new(),
            consumer_secret: String::new(),
            environment: PesapalEnvironment::default(),
            base_url: String::new(),
            timeout_ms: default_pesapal_timeout_ms(),
            token_refresh_margin: default_token_refresh_margin(),
            max_initiation_retries: default_max_initiation_retries(),
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct SmsSettings {
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_country_prefix")]
    pub default_country_prefix: String,
}

impl SmsSettings {
    pub fn is_configured(&self) -> bool {
        !self.api_url.is_empty() && !self.api_key.is_empty()
    }
}

impl fmt::Debug for SmsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmsSettings")
            .field("api_url", &self.api_url)
            .field("api_key", &redacted(&self.api_key))
            .field("default_country_prefix", &self.default_country_prefix)
            .finish()
    }
}

impl Default for SmsSettings {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            default_country_prefix: default_country_prefix(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub pesapal: PesapalSettings,
    #[serde(default)]
    pub sms: SmsSettings,
    pub server_port: u16,
    /// Externally reachable base URL used for the callback and IPN URLs.
    #[serde(default)]
    pub public_base_url: String,
    pub database_path: String,
    pub currency: String,
    pub country_code: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pesapal: PesapalSettings::default(),
            sms: SmsSettings::default(),
            server_port: 9002,
            public_base_url: String::new(),
            database_path: "data/voucherwave.redb".to_string(),
            currency: "UGX".to_string(),
            country_code: "UG".to_string(),
        }
    }
}

impl Config {
    /// Load from config.toml (if present) and environment variables.
    /// Environment variables override file values.
    /// Supported env keys: PESAPAL_CONSUMER_KEY, PESAPAL_CONSUMER_SECRET, PESAPAL_ENV,
    /// PESAPAL_BASE_URL, PESAPAL_TIMEOUT_MS, PESAPAL_TOKEN_REFRESH_MARGIN,
    /// PESAPAL_MAX_INITIATION_RETRIES, PUBLIC_BASE_URL, CURRENCY, COUNTRY_CODE,
    /// DATABASE_PATH, SERVER_PORT, SMS_API_URL, SMS_API_KEY, SMS_DEFAULT_COUNTRY_PREFIX
    pub fn load() -> Self {
        let base: Config = Default::default();
        let mut fig = Figment::from(Serialized::defaults(base));
        if std::path::Path::new("config.toml").exists() {
            fig = fig.merge(Toml::file("config.toml"));
        }
        let mut cfg: Config = fig.extract().unwrap_or_default();

        cfg.apply_env(|key| std::env::var(key).ok());
        cfg
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PESAPAL_CONSUMER_KEY") {
            self.pesapal.consumer_key = v;
        }
        if let Some(v) = lookup("PESAPAL_CONSUMER_SECRET") {
            self.pesapal.consumer_secret = v;
        }
        if let Some(v) = lookup("PESAPAL_ENV") {
            self.pesapal.environment =
                PesapalEnvironment::parse(&v).unwrap_or(self.pesapal.environment);
        }
        if let Some(v) = lookup("PESAPAL_BASE_URL") {
            self.pesapal.base_url = v;
        }
        if let Some(v) = lookup("PESAPAL_TIMEOUT_MS") {
            self.pesapal.timeout_ms = v.parse().unwrap_or(self.pesapal.timeout_ms);
        }
        if let Some(v) = lookup("PESAPAL_TOKEN_REFRESH_MARGIN") {
            self.pesapal.token_refresh_margin =
                parse_duration_env(&v, self.pesapal.token_refresh_margin);
        }
        if let Some(v) = lookup("PESAPAL_MAX_INITIATION_RETRIES") {
            self.pesapal.max_initiation_retries =
                v.parse().unwrap_or(self.pesapal.max_initiation_retries);
        }
        if let Some(v) = lookup("PUBLIC_BASE_URL") {
            self.public_base_url = v;
        }
        if let Some(v) = lookup("CURRENCY") {
            self.currency = v;
        }
        if let Some(v) = lookup("COUNTRY_CODE") {
            self.country_code = v;
        }
        if let Some(v) = lookup("DATABASE_PATH") {
            self.database_path = v;
        }
        if let Some(v) = lookup("SERVER_PORT") {
            self.server_port = v.parse().unwrap_or(self.server_port);
        }
        if let Some(v) = lookup("SMS_API_URL") {
            self.sms.api_url = v;
        }
        if let Some(v) = lookup("SMS_API_KEY") {
            self.sms.api_key = v;
        }
        if let Some(v) = lookup("SMS_DEFAULT_COUNTRY_PREFIX") {
            self.sms.default_country_prefix = v;
        }
    }

    /// Fails fast on configuration the payment flow cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pesapal.consumer_key.trim().is_empty() {
            return Err(ConfigError::Missing("PESAPAL_CONSUMER_KEY"));
        }
        if self.pesapal.consumer_secret.trim().is_empty() {
            return Err(ConfigError::Missing("PESAPAL_CONSUMER_SECRET"));
        }
        if self.public_base_url.trim().is_empty() {
            return Err(ConfigError::Missing("PUBLIC_BASE_URL"));
        }
        url::Url::parse(&self.public_base_url).map_err(|e| ConfigError::Invalid {
            key: "PUBLIC_BASE_URL",
            reason: e.to_string(),
        })?;
        if self.currency.trim().is_empty() {
            return Err(ConfigError::Missing("CURRENCY"));
        }
        Ok(())
    }

    pub fn public_base_url(&self) -> &str {
        self.public_base_url.trim_end_matches('/')
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

fn parse_duration_env(value: &str, current: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(current)
}

fn default_pesapal_timeout_ms() -> u64 {
    15_000
}

fn default_token_refresh_margin() -> Duration {
    Duration::from_secs(300) // 5 minutes
}

fn default_max_initiation_retries() -> u32 {
    2
}

fn default_country_prefix() -> String {
    "256".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn configured() -> Config {
        let mut cfg = Config::default();
        let env: HashMap<&str, &str> = HashMap::from([
            ("PESAPAL_CONSUMER_KEY", "ck"),
            ("PESAPAL_CONSUMER_SECRET", "cs"),
            ("PUBLIC_BASE_URL", "https://wifi.example.com/"),
        ]);
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        cfg
    }

    #[test]
    fn test_missing_credentials_fail_fast() {
        let cfg = Config::default();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Missing("PESAPAL_CONSUMER_KEY"))
        ));

        let mut cfg = configured();
        cfg.pesapal.consumer_secret.clear();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Missing("PESAPAL_CONSUMER_SECRET"))
        ));

        let mut cfg = configured();
        cfg.public_base_url.clear();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Missing("PUBLIC_BASE_URL"))
        ));
    }

    #[test]
    fn test_env_overlay_and_base_url() {
        let cfg = configured();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.public_base_url(), "https://wifi.example.com");
        assert_eq!(cfg.pesapal.resolved_base_url(), SANDBOX_BASE_URL);

        let mut cfg = configured();
        cfg.apply_env(|k| match k {
            "PESAPAL_ENV" => Some("production".to_string()),
            "PESAPAL_TOKEN_REFRESH_MARGIN" => Some("2m".to_string()),
            "PESAPAL_MAX_INITIATION_RETRIES" => Some("not-a-number".to_string()),
            _ => None,
        });
        assert_eq!(cfg.pesapal.resolved_base_url(), PRODUCTION_BASE_URL);
        assert_eq!(cfg.pesapal.token_refresh_margin, Duration::from_secs(120));
        assert_eq!(cfg.pesapal.max_initiation_retries, 2);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let cfg = configured();
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("\"cs\""));
        assert!(rendered.contains("<redacted>"));
    }
}
