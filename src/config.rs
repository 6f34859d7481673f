use crate::{
    client::RetryPolicy,
    error::{AgentError, Result},
    logistics::{CounterOfferPolicy, DispatchPolicy, ServiceWindow},
    model::LeadTimes,
    sales::SalesPolicy,
};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub directory: DirectoryConfig,
    pub client: ClientConfig,
    pub logistics: LogisticsConfig,
    pub carrier: CarrierConfig,
    pub sales: SalesConfig,
    pub treasury: TreasuryConfig,
    pub ledger: LedgerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: Option<String>,
    /// Host other agents use to reach this one.
    pub host: String,
    pub bind_address: String,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub address: String,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct LogisticsConfig {
    pub window_open: NaiveTime,
    pub window_close: NaiveTime,
    pub urgent_lead_days: i64,
    pub standard_lead_days: i64,
    pub min_discount_pct: f64,
    pub max_discount_pct: f64,
    pub bid_timeout_ms: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct CarrierConfig {
    pub lead_days: i64,
    pub price_factor_min: f64,
    pub price_factor_max: f64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct SalesConfig {
    /// Days after the expected delivery during which an unsatisfactory
    /// product may still be returned.
    pub return_window_days: i64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct TreasuryConfig {
    pub store_account: String,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: None,
            host: "localhost".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: None,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            address: "http://localhost:9000/comm".to_string(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            max_attempts: 3,
            initial_backoff_ms: 200,
        }
    }
}

impl Default for LogisticsConfig {
    fn default() -> Self {
        Self {
            window_open: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            window_close: NaiveTime::from_hms_opt(20, 0, 0).unwrap_or_default(),
            urgent_lead_days: 2,
            standard_lead_days: 6,
            min_discount_pct: 1.0,
            max_discount_pct: 15.0,
            bid_timeout_ms: 5_000,
            sweep_interval_secs: 60,
        }
    }
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            lead_days: 1,
            price_factor_min: 10.0 / 30.0,
            price_factor_max: 1.0,
        }
    }
}

impl Default for SalesConfig {
    fn default() -> Self {
        Self { return_window_days: 15 }
    }
}

impl Default for TreasuryConfig {
    fn default() -> Self {
        Self {
            store_account: "MiTienda000".to_string(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://orders.db".to_string(),
            max_connections: Some(5),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("pretty".to_string()),
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| AgentError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    /// Loads `path` if it exists, otherwise starts from defaults; then applies
    /// environment overrides.
    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = if path.as_ref().exists() {
            Self::load(path)?
        } else {
            Self::default()
        };

        if let Ok(address) = std::env::var("DIRECTORY_ADDRESS") {
            config.directory.address = address;
        }

        if let Ok(url) = std::env::var("LEDGER_URL") {
            config.ledger.url = url;
        }

        if let Ok(account) = std::env::var("STORE_ACCOUNT") {
            config.treasury.store_account = account;
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            config.logging.level = log_level;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.port == Some(0) {
            return Err(AgentError::Config("Agent port cannot be 0".to_string()));
        }

        if self.directory.address.is_empty() {
            return Err(AgentError::Config("Directory address cannot be empty".to_string()));
        }

        if self.client.max_attempts == 0 {
            return Err(AgentError::Config("Client max_attempts must be at least 1".to_string()));
        }

        if self.logistics.window_open >= self.logistics.window_close {
            return Err(AgentError::Config("Service window must open before it closes".to_string()));
        }

        if self.logistics.urgent_lead_days <= 0 || self.logistics.standard_lead_days <= 0 {
            return Err(AgentError::Config("Lead times must be positive".to_string()));
        }

        let (min, max) = (self.logistics.min_discount_pct, self.logistics.max_discount_pct);
        if !(0.0..100.0).contains(&min) || max <= min || max > 100.0 {
            return Err(AgentError::Config(format!("Invalid counter-offer discount range [{}, {})", min, max)));
        }

        if self.carrier.price_factor_min <= 0.0 || self.carrier.price_factor_max <= self.carrier.price_factor_min {
            return Err(AgentError::Config("Invalid carrier price factor range".to_string()));
        }

        if self.sales.return_window_days < 0 {
            return Err(AgentError::Config("Return window cannot be negative".to_string()));
        }

        if self.ledger.url.is_empty() {
            return Err(AgentError::Config("Ledger URL cannot be empty".to_string()));
        }

        Ok(())
    }

    pub fn agent_port(&self, cli: Option<u16>, default: u16) -> u16 {
        cli.or(self.agent.port).unwrap_or(default)
    }

    pub fn agent_name(&self, default: &str) -> String {
        self.agent.name.clone().unwrap_or_else(|| default.to_string())
    }

    pub fn bind_address(&self, port: u16) -> String {
        format!("{}:{}", self.agent.bind_address, port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.client.max_attempts,
            initial_backoff: Duration::from_millis(self.client.initial_backoff_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.client.request_timeout_ms)
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            window: ServiceWindow::new(self.logistics.window_open, self.logistics.window_close),
            lead_times: LeadTimes {
                urgent: chrono::Duration::days(self.logistics.urgent_lead_days),
                standard: chrono::Duration::days(self.logistics.standard_lead_days),
            },
            counter_offer: CounterOfferPolicy {
                min_discount_pct: self.logistics.min_discount_pct,
                max_discount_pct: self.logistics.max_discount_pct,
            },
            bid_timeout: Duration::from_millis(self.logistics.bid_timeout_ms),
        }
    }

    pub fn return_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.sales.return_window_days)
    }

    pub fn sales_policy(&self) -> SalesPolicy {
        SalesPolicy {
            lead_times: self.dispatch_policy().lead_times,
            return_window: self.return_window(),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.logistics.sweep_interval_secs)
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| AgentError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| AgentError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.directory.address, "http://localhost:9000/comm");
        assert_eq!(config.logistics.urgent_lead_days, 2);
        assert_eq!(config.logistics.standard_lead_days, 6);
        assert_eq!(config.treasury.store_account, "MiTienda000");
        assert_eq!(config.return_window(), chrono::Duration::days(15));
        assert_eq!(config.sales_policy().lead_times.urgent, chrono::Duration::days(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.agent.port = Some(0);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logistics.window_close = config.logistics.window_open;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logistics.max_discount_pct = 0.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.client.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sales.return_window_days = -1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_creation() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        create_default_config_file(path).unwrap();
        assert!(path.exists());

        let loaded_config = AppConfig::load(path).unwrap();
        assert_eq!(loaded_config.logistics.window_open, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(loaded_config.carrier.lead_days, 1);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(
            temp_file.path(),
            r#"
[agent]
port = 9103

[logistics]
window_open = "08:00:00"
window_close = "22:00:00"
"#,
        )
        .unwrap();

        let config = AppConfig::load(temp_file.path()).unwrap();
        assert_eq!(config.agent_port(None, 9003), 9103);
        assert_eq!(config.agent_port(Some(9200), 9003), 9200);
        assert_eq!(config.logistics.window_open, NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(config.logistics.bid_timeout_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_with_env_overrides(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.ledger.max_connections, Some(5));
    }
}
