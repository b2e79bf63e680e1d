use alloy::primitives::Address;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use crate::listener::network::NetworkKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub anomaly_detection: AnomalyDetectionConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Consecutive failed inserts before a critical store alert is raised.
    #[serde(default = "default_failure_alert_threshold")]
    pub failure_alert_threshold: u32,
}

fn default_max_connections() -> u32 {
    10
}

fn default_failure_alert_threshold() -> u32 {
    10
}

// ============================================================
// Networks
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    pub name: String,
    pub chain_id: u64,
    #[serde(default)]
    pub kind: NetworkKind,
    pub rpc_ws: String,
    pub bridge_address: String,
    pub start_block: Option<u64>,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
    pub max_gas_used: Option<u64>,
    pub max_gas_price_gwei: Option<f64>,
}

fn default_batch_size() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenConfig {
    pub symbol: String,
    pub address: String,
    pub decimals: u8,
}

// ============================================================
// Listener
// ============================================================

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ListenerConfig {
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_secs: u64,
    pub health_check_interval_secs: u64,
    pub restart_escalation_threshold: u32,
    pub token_cache_capacity: usize,
    pub ingest_buffer: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_delay_secs: 5,
            health_check_interval_secs: 30,
            restart_escalation_threshold: 3,
            token_cache_capacity: 512,
            ingest_buffer: 1024,
        }
    }
}

impl ListenerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }
}

// ============================================================
// Anomaly Detection Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct AnomalyDetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub bridge_timeout: BridgeTimeoutConfig,
    #[serde(default)]
    pub value_mismatch: ValueMismatchConfig,
    #[serde(default)]
    pub duplicate_transaction: DuplicateConfig,
    #[serde(default)]
    pub suspicious_contract: SuspiciousContractConfig,
    #[serde(default)]
    pub unusual_volume: UnusualVolumeConfig,
    #[serde(default)]
    pub failed_verification: ToggleConfig,
    #[serde(default)]
    pub replay_attack: ToggleConfig,
    #[serde(default)]
    pub gas_anomaly: GasAnomalyConfig,
}

impl Default for AnomalyDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bridge_timeout: BridgeTimeoutConfig::default(),
            value_mismatch: ValueMismatchConfig::default(),
            duplicate_transaction: DuplicateConfig::default(),
            suspicious_contract: SuspiciousContractConfig::default(),
            unusual_volume: UnusualVolumeConfig::default(),
            failed_verification: ToggleConfig::default(),
            replay_attack: ToggleConfig::default(),
            gas_anomaly: GasAnomalyConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ToggleConfig {
    pub enabled: bool,
}

impl Default for ToggleConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BridgeTimeoutConfig {
    pub enabled: bool,
    pub window_secs: u64,
}

impl Default for BridgeTimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 1800,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ValueMismatchConfig {
    pub enabled: bool,
    /// Relative discrepancy tolerated before flagging (0.001 = 0.1%).
    pub tolerance: f64,
    /// Discrepancy above which the finding becomes critical.
    pub critical_threshold: f64,
}

impl Default for ValueMismatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tolerance: 0.001,
            critical_threshold: 0.05,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DuplicateConfig {
    pub enabled: bool,
    pub window_secs: u64,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 86_400,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SuspiciousContractConfig {
    pub enabled: bool,
    pub blacklist: Vec<String>,
    /// Optional CSV file with an `address[,label]` header row.
    pub blacklist_path: Option<String>,
    pub sender_window_secs: u64,
    pub max_sender_transactions: u32,
}

impl Default for SuspiciousContractConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            blacklist: Vec::new(),
            blacklist_path: None,
            sender_window_secs: 300,
            max_sender_transactions: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct UnusualVolumeConfig {
    pub enabled: bool,
    pub window_secs: u64,
    pub multiplier: f64,
    pub critical_multiplier: f64,
    pub min_samples: i64,
}

impl Default for UnusualVolumeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 86_400,
            multiplier: 10.0,
            critical_multiplier: 50.0,
            min_samples: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GasAnomalyConfig {
    pub enabled: bool,
    pub max_gas_used: u64,
    pub max_gas_price_gwei: f64,
}

impl Default for GasAnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_gas_used: 1_000_000,
            max_gas_price_gwei: 500.0,
        }
    }
}

// ============================================================
// Matcher
// ============================================================

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MatcherConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub max_age_secs: u64,
    pub timeout_secs: u64,
    /// Relative amount difference accepted between the two sides (0.01 = 1%).
    pub amount_tolerance: f64,
    pub time_window_secs: u64,
    pub fuzzy_window_secs: u64,
    pub success_alert_threshold: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            max_age_secs: 3600,
            timeout_secs: 1800,
            amount_tolerance: 0.01,
            time_window_secs: 3600,
            fuzzy_window_secs: 1800,
            success_alert_threshold: 10_000.0,
        }
    }
}

impl MatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

// ============================================================
// Alerts & Channels
// ============================================================

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlertConfig {
    pub max_retries: i32,
    pub retry_base_delay_secs: u64,
    pub retry_check_interval_secs: u64,
    pub dedup_window_secs: u64,
    pub dedup_cache_ttl_secs: u64,
    pub dedup_cache_capacity: usize,
    pub dedup_prune_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub resolved_retention_days: i64,
    pub auto_resolve_after_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_secs: 60,
            retry_check_interval_secs: 15,
            dedup_window_secs: 60,
            dedup_cache_ttl_secs: 300,
            dedup_cache_capacity: 10_000,
            dedup_prune_interval_secs: 600,
            cleanup_interval_secs: 3600,
            resolved_retention_days: 7,
            auto_resolve_after_secs: 86_400,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChannelsConfig {
    pub email: Option<EmailConfig>,
    pub slack: Option<WebhookChannelConfig>,
    pub discord: Option<WebhookChannelConfig>,
    pub webhook: Option<GenericWebhookConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookChannelConfig {
    pub webhook_url: String,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenericWebhookConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

// ============================================================
// Retention, API, Logging
// ============================================================

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetentionConfig {
    pub interval_secs: u64,
    pub transaction_days: i64,
    pub anomaly_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            transaction_days: 30,
            anomaly_days: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_api_host")]
    pub host: String,
    /// Live-feed broadcast buffer; slower clients skip events past this.
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3000,
            host: "0.0.0.0".to_string(),
            feed_capacity: default_feed_capacity(),
        }
    }
}

fn default_api_port() -> u16 {
    3000
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_feed_capacity() -> usize {
    1024
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> eyre::Result<()> {
        if self.networks.is_empty() {
            return Err(eyre::eyre!("At least one network must be configured"));
        }

        let mut names = HashSet::new();
        let mut chain_ids = HashSet::new();
        for network in &self.networks {
            if !names.insert(network.name.as_str()) {
                return Err(eyre::eyre!("Duplicate network name '{}'", network.name));
            }
            if !chain_ids.insert(network.chain_id) {
                return Err(eyre::eyre!(
                    "Duplicate chain_id {} on network '{}'",
                    network.chain_id,
                    network.name
                ));
            }
            if network.batch_size == 0 {
                return Err(eyre::eyre!(
                    "Network '{}' must have a batch_size greater than zero",
                    network.name
                ));
            }
            for token in &network.tokens {
                if !is_hex_address(&token.address) {
                    return Err(eyre::eyre!(
                        "Invalid token address '{}' for {} on network '{}'",
                        token.address,
                        token.symbol,
                        network.name
                    ));
                }
            }
        }

        let vm = &self.anomaly_detection.value_mismatch;
        if !(0.0..1.0).contains(&vm.tolerance) || vm.critical_threshold < vm.tolerance {
            return Err(eyre::eyre!(
                "value_mismatch tolerance must be in [0, 1) and not above critical_threshold"
            ));
        }

        if self.alerts.max_retries < 1 {
            return Err(eyre::eyre!("alerts.max_retries must be at least 1"));
        }

        if let Some(email) = &self.channels.email {
            if email.to.is_empty() {
                return Err(eyre::eyre!("Email channel needs at least one recipient"));
            }
        }

        Ok(())
    }
}

pub fn is_hex_address(value: &str) -> bool {
    value.starts_with("0x") && value.len() == 42 && Address::from_str(value).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[database]
url = "postgres://localhost/test"
max_connections = 5

[[networks]]
name = "ethereum"
chain_id = 1
kind = "ethereum"
rpc_ws = "wss://eth.example.org"
bridge_address = "0x1111111111111111111111111111111111111111"
start_block = 19000000

[[networks.tokens]]
symbol = "USDC"
address = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"
decimals = 6

[[networks]]
name = "polygon"
chain_id = 137
kind = "polygon"
rpc_ws = "wss://polygon.example.org"
bridge_address = "0x2222222222222222222222222222222222222222"
"#;

    #[test]
    fn test_parse_config() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.networks.len(), 2);
        assert_eq!(config.networks[0].name, "ethereum");
        assert_eq!(config.networks[0].kind, NetworkKind::Ethereum);
        assert_eq!(config.networks[0].tokens[0].decimals, 6);
        assert_eq!(config.networks[0].batch_size, 1000); // default
        assert_eq!(config.networks[1].start_block, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.listener.max_reconnect_attempts, 5);
        assert_eq!(config.listener.reconnect_delay_secs, 5);
        assert_eq!(config.listener.health_check_interval_secs, 30);
        assert_eq!(config.matcher.interval_secs, 30);
        assert_eq!(config.matcher.max_age_secs, 3600);
        assert_eq!(config.alerts.max_retries, 3);
        assert_eq!(config.alerts.dedup_window_secs, 60);
        assert_eq!(config.anomaly_detection.bridge_timeout.window_secs, 1800);
        assert_eq!(config.anomaly_detection.value_mismatch.tolerance, 0.001);
        assert_eq!(config.anomaly_detection.suspicious_contract.max_sender_transactions, 5);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.channels.email.is_none());
    }

    #[test]
    fn test_partial_rule_override() {
        let toml_str = format!(
            "{}\n[anomaly_detection.gas_anomaly]\nenabled = false\n\n[channels.slack]\nwebhook_url = \"https://hooks.slack.com/services/x\"\n",
            MINIMAL
        );
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(!config.anomaly_detection.gas_anomaly.enabled);
        assert_eq!(config.anomaly_detection.gas_anomaly.max_gas_used, 1_000_000);
        assert!(config.channels.slack.is_some());
    }

    #[test]
    fn test_validate_empty_networks() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.networks.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_token_address() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.networks[0].tokens[0].address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_chain_id() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.networks[1].chain_id = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.networks[1].name, "polygon");
        assert_eq!(config.networks[1].chain_id, 137);

        assert!(Config::load("/nonexistent/config.toml").is_err());
    }
}
