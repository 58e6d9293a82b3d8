use anyhow::{Context, Result};
use decision_engine::ValidatorConfig;
use proposal_client::{LlmConfig, RetryPolicy};
use risk_manager::{CircuitBreakerConfig, PartialTakeProfitConfig, TrailingStopConfig};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration problems that must stop the agent before any instance starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {class} leverage ceiling {value}: must be between 1 and {max}")]
    InvalidLeverageCeiling {
        class: &'static str,
        value: u32,
        max: u32,
    },

    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("{0} not set")]
    MissingCredential(&'static str),

    #[error("invalid trader instance {entry:?}: {reason}")]
    InvalidInstance { entry: String, reason: String },
}

/// Highest leverage any supported perpetuals venue accepts.
const VENUE_MAX_LEVERAGE: u32 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceMode {
    /// Every action, including new positions
    FullAuto,
    /// Existing positions only; opens are refused
    ManageOnly,
}

impl InstanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceMode::FullAuto => "full_auto",
            InstanceMode::ManageOnly => "manage_only",
        }
    }

    pub fn allows_new_positions(&self) -> bool {
        matches!(self, InstanceMode::FullAuto)
    }
}

impl fmt::Display for InstanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full_auto" | "auto" => Ok(InstanceMode::FullAuto),
            "manage_only" | "manage" => Ok(InstanceMode::ManageOnly),
            other => Err(format!(
                "unknown mode {:?} (expected full_auto or manage_only)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub id: String,
    pub mode: InstanceMode,
}

/// Parse `id=mode` pairs separated by commas.
pub fn parse_instances(raw: &str) -> std::result::Result<Vec<InstanceSpec>, ConfigError> {
    let mut specs: Vec<InstanceSpec> = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (id, mode) = entry
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidInstance {
                entry: entry.to_string(),
                reason: "expected id=mode".to_string(),
            })?;
        let id = id.trim();
        if id.is_empty() {
            return Err(ConfigError::InvalidInstance {
                entry: entry.to_string(),
                reason: "empty instance id".to_string(),
            });
        }
        if specs.iter().any(|s| s.id == id) {
            return Err(ConfigError::InvalidInstance {
                entry: entry.to_string(),
                reason: format!("duplicate instance id {}", id),
            });
        }
        let mode = mode
            .parse()
            .map_err(|reason| ConfigError::InvalidInstance {
                entry: entry.to_string(),
                reason,
            })?;
        specs.push(InstanceSpec {
            id: id.to_string(),
            mode,
        });
    }
    Ok(specs)
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value {:?}", name, raw)),
        _ => Ok(default),
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    // Cycle
    pub scan_interval_minutes: u32,
    pub watchlist: Vec<String>,
    pub instances: Vec<InstanceSpec>,

    // Validator limits
    pub btc_eth_max_leverage: u32,
    pub altcoin_max_leverage: u32,
    pub btc_eth_max_notional_multiple: f64,
    pub altcoin_max_notional_multiple: f64,
    pub min_risk_reward: f64,

    // Profit/loss controllers
    pub trailing_stop_enabled: bool,
    pub trailing_stop_activation_pct: f64,
    pub trailing_stop_distance_pct: f64,
    pub partial_take_profit_enabled: bool,

    // Loss circuit breaker
    pub circuit_breaker_enabled: bool,
    pub circuit_breaker_base_minutes: f64,
    pub circuit_breaker_multiplier: f64,
    pub circuit_breaker_max_minutes: f64,
    pub circuit_breaker_reset_hours: f64,
    pub stop_classification_tolerance_pct: f64,

    // Daily loss pause (0 = disabled)
    pub daily_loss_limit_pct: f64,
    pub daily_loss_pause_minutes: i64,

    // Execution
    pub price_drift_tolerance_pct: f64,
    pub paper_starting_balance: f64,

    // Proposal source
    pub llm_api_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_timeout_secs: u64,
    pub llm_max_retries: u32,
    pub llm_retry_backoff_secs: u64,

    // Market data
    pub market_data_url: String,

    // Database / telemetry
    pub database_url: String,
    pub metrics_log_interval_cycles: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let llm = LlmConfig::default();
        Self {
            scan_interval_minutes: 3,
            watchlist: ["BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "XRPUSDT", "DOGEUSDT"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            instances: vec![InstanceSpec {
                id: "auto".to_string(),
                mode: InstanceMode::FullAuto,
            }],
            btc_eth_max_leverage: 5,
            altcoin_max_leverage: 5,
            btc_eth_max_notional_multiple: 10.0,
            altcoin_max_notional_multiple: 5.0,
            min_risk_reward: 2.0,
            trailing_stop_enabled: true,
            trailing_stop_activation_pct: 5.0,
            trailing_stop_distance_pct: 3.0,
            partial_take_profit_enabled: true,
            circuit_breaker_enabled: true,
            circuit_breaker_base_minutes: 45.0,
            circuit_breaker_multiplier: 2.67,
            circuit_breaker_max_minutes: 720.0,
            circuit_breaker_reset_hours: 24.0,
            stop_classification_tolerance_pct: 5.0,
            daily_loss_limit_pct: 0.0,
            daily_loss_pause_minutes: 60,
            price_drift_tolerance_pct: 3.0,
            paper_starting_balance: 10_000.0,
            llm_api_url: llm.api_url,
            llm_api_key: String::new(),
            llm_model: llm.model,
            llm_timeout_secs: llm.timeout.as_secs(),
            llm_max_retries: 3,
            llm_retry_backoff_secs: 2,
            market_data_url: market_data::DEFAULT_INFO_URL.to_string(),
            database_url: "sqlite:cycles.db?mode=rwc".to_string(),
            metrics_log_interval_cycles: 10,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let watchlist = match env::var("WATCHLIST") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => d.watchlist,
        };

        let instances = match env::var("TRADER_INSTANCES") {
            Ok(raw) if !raw.trim().is_empty() => parse_instances(&raw)?,
            _ => d.instances,
        };

        let config = Self {
            scan_interval_minutes: env_or("SCAN_INTERVAL_MINUTES", d.scan_interval_minutes)?,
            watchlist,
            instances,

            btc_eth_max_leverage: env_or("BTC_ETH_MAX_LEVERAGE", d.btc_eth_max_leverage)?,
            altcoin_max_leverage: env_or("ALTCOIN_MAX_LEVERAGE", d.altcoin_max_leverage)?,
            btc_eth_max_notional_multiple: env_or(
                "BTC_ETH_MAX_NOTIONAL_MULTIPLE",
                d.btc_eth_max_notional_multiple,
            )?,
            altcoin_max_notional_multiple: env_or(
                "ALTCOIN_MAX_NOTIONAL_MULTIPLE",
                d.altcoin_max_notional_multiple,
            )?,
            min_risk_reward: env_or("MIN_RISK_REWARD", d.min_risk_reward)?,

            trailing_stop_enabled: env_or("TRAILING_STOP_ENABLED", d.trailing_stop_enabled)?,
            trailing_stop_activation_pct: env_or(
                "TRAILING_STOP_ACTIVATION_PCT",
                d.trailing_stop_activation_pct,
            )?,
            trailing_stop_distance_pct: env_or(
                "TRAILING_STOP_DISTANCE_PCT",
                d.trailing_stop_distance_pct,
            )?,
            partial_take_profit_enabled: env_or(
                "PARTIAL_TAKE_PROFIT_ENABLED",
                d.partial_take_profit_enabled,
            )?,

            circuit_breaker_enabled: env_or("CIRCUIT_BREAKER_ENABLED", d.circuit_breaker_enabled)?,
            circuit_breaker_base_minutes: env_or(
                "CIRCUIT_BREAKER_BASE_MINUTES",
                d.circuit_breaker_base_minutes,
            )?,
            circuit_breaker_multiplier: env_or(
                "CIRCUIT_BREAKER_MULTIPLIER",
                d.circuit_breaker_multiplier,
            )?,
            circuit_breaker_max_minutes: env_or(
                "CIRCUIT_BREAKER_MAX_MINUTES",
                d.circuit_breaker_max_minutes,
            )?,
            circuit_breaker_reset_hours: env_or(
                "CIRCUIT_BREAKER_RESET_HOURS",
                d.circuit_breaker_reset_hours,
            )?,
            stop_classification_tolerance_pct: env_or(
                "STOP_CLASSIFICATION_TOLERANCE_PCT",
                d.stop_classification_tolerance_pct,
            )?,

            daily_loss_limit_pct: env_or("DAILY_LOSS_LIMIT_PCT", d.daily_loss_limit_pct)?,
            daily_loss_pause_minutes: env_or(
                "DAILY_LOSS_PAUSE_MINUTES",
                d.daily_loss_pause_minutes,
            )?,

            price_drift_tolerance_pct: env_or(
                "PRICE_DRIFT_TOLERANCE_PCT",
                d.price_drift_tolerance_pct,
            )?,
            paper_starting_balance: env_or("PAPER_STARTING_BALANCE", d.paper_starting_balance)?,

            llm_api_url: env::var("LLM_API_URL").unwrap_or(d.llm_api_url),
            llm_api_key: env::var("LLM_API_KEY").context("LLM_API_KEY not set")?,
            llm_model: env::var("LLM_MODEL").unwrap_or(d.llm_model),
            llm_timeout_secs: env_or("LLM_TIMEOUT_SECS", d.llm_timeout_secs)?,
            llm_max_retries: env_or("LLM_MAX_RETRIES", d.llm_max_retries)?,
            llm_retry_backoff_secs: env_or("LLM_RETRY_BACKOFF_SECS", d.llm_retry_backoff_secs)?,

            market_data_url: env::var("MARKET_DATA_URL").unwrap_or(d.market_data_url),

            database_url: env::var("DATABASE_URL").unwrap_or(d.database_url),
            metrics_log_interval_cycles: env_or(
                "METRICS_LOG_INTERVAL_CYCLES",
                d.metrics_log_interval_cycles,
            )?,
        };

        Ok(config)
    }

    /// Reject settings no instance can safely run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        for (class, value) in [
            ("BTC/ETH", self.btc_eth_max_leverage),
            ("altcoin", self.altcoin_max_leverage),
        ] {
            if value < 1 || value > VENUE_MAX_LEVERAGE {
                return Err(ConfigError::InvalidLeverageCeiling {
                    class,
                    value,
                    max: VENUE_MAX_LEVERAGE,
                });
            }
        }

        let positive = [
            ("SCAN_INTERVAL_MINUTES", f64::from(self.scan_interval_minutes)),
            ("BTC_ETH_MAX_NOTIONAL_MULTIPLE", self.btc_eth_max_notional_multiple),
            ("ALTCOIN_MAX_NOTIONAL_MULTIPLE", self.altcoin_max_notional_multiple),
            ("MIN_RISK_REWARD", self.min_risk_reward),
            ("PRICE_DRIFT_TOLERANCE_PCT", self.price_drift_tolerance_pct),
            ("PAPER_STARTING_BALANCE", self.paper_starting_balance),
            ("LLM_MAX_RETRIES", f64::from(self.llm_max_retries)),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::InvalidValue {
                    name,
                    reason: format!("must be positive, got {}", value),
                });
            }
        }

        if self.trailing_stop_enabled
            && (self.trailing_stop_activation_pct <= 0.0 || self.trailing_stop_distance_pct <= 0.0)
        {
            return Err(ConfigError::InvalidValue {
                name: "TRAILING_STOP_ACTIVATION_PCT/TRAILING_STOP_DISTANCE_PCT",
                reason: format!(
                    "must be positive, got {} / {}",
                    self.trailing_stop_activation_pct, self.trailing_stop_distance_pct
                ),
            });
        }

        if self.circuit_breaker_enabled {
            if self.circuit_breaker_base_minutes <= 0.0 {
                return Err(ConfigError::InvalidValue {
                    name: "CIRCUIT_BREAKER_BASE_MINUTES",
                    reason: format!("must be positive, got {}", self.circuit_breaker_base_minutes),
                });
            }
            if self.circuit_breaker_multiplier < 1.0 {
                return Err(ConfigError::InvalidValue {
                    name: "CIRCUIT_BREAKER_MULTIPLIER",
                    reason: format!("must be at least 1, got {}", self.circuit_breaker_multiplier),
                });
            }
            if self.circuit_breaker_max_minutes < self.circuit_breaker_base_minutes {
                return Err(ConfigError::InvalidValue {
                    name: "CIRCUIT_BREAKER_MAX_MINUTES",
                    reason: format!(
                        "{} is below the base backoff of {}",
                        self.circuit_breaker_max_minutes, self.circuit_breaker_base_minutes
                    ),
                });
            }
        }

        if self.daily_loss_limit_pct < 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "DAILY_LOSS_LIMIT_PCT",
                reason: format!("must not be negative, got {}", self.daily_loss_limit_pct),
            });
        }

        if self.instances.is_empty() {
            return Err(ConfigError::InvalidInstance {
                entry: String::new(),
                reason: "no trader instances configured".to_string(),
            });
        }

        if self.llm_api_key.trim().is_empty() {
            return Err(ConfigError::MissingCredential("LLM_API_KEY"));
        }

        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.scan_interval_minutes) * 60)
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            btc_eth_max_leverage: self.btc_eth_max_leverage,
            altcoin_max_leverage: self.altcoin_max_leverage,
            btc_eth_max_notional_multiple: self.btc_eth_max_notional_multiple,
            altcoin_max_notional_multiple: self.altcoin_max_notional_multiple,
            min_risk_reward: self.min_risk_reward,
            ..ValidatorConfig::default()
        }
    }

    pub fn trailing_stop_config(&self) -> TrailingStopConfig {
        TrailingStopConfig {
            enabled: self.trailing_stop_enabled,
            activation_pct: self.trailing_stop_activation_pct,
            distance_pct: self.trailing_stop_distance_pct,
        }
    }

    pub fn partial_take_profit_config(&self) -> PartialTakeProfitConfig {
        PartialTakeProfitConfig {
            enabled: self.partial_take_profit_enabled,
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: self.circuit_breaker_enabled,
            ..CircuitBreakerConfig::default()
        }
        .with_base_minutes(self.circuit_breaker_base_minutes)
        .with_multiplier(self.circuit_breaker_multiplier)
        .with_max_minutes(self.circuit_breaker_max_minutes)
        .with_reset_hours(self.circuit_breaker_reset_hours)
    }

    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig {
            api_url: self.llm_api_url.clone(),
            api_key: self.llm_api_key.clone(),
            model: self.llm_model.clone(),
            timeout: Duration::from_secs(self.llm_timeout_secs),
            ..LlmConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.llm_max_retries,
            Duration::from_secs(self.llm_retry_backoff_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AgentConfig {
        AgentConfig {
            llm_api_key: "sk-test".to_string(),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_zero_leverage_ceiling_is_fatal() {
        let config = AgentConfig {
            altcoin_max_leverage: 0,
            ..valid()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidLeverageCeiling {
                class: "altcoin",
                value: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_blank_api_key_is_fatal() {
        let config = AgentConfig {
            llm_api_key: "  ".to_string(),
            ..AgentConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "LLM_API_KEY not set");
    }

    #[test]
    fn test_breaker_cap_below_base_rejected() {
        let config = AgentConfig {
            circuit_breaker_max_minutes: 30.0,
            ..valid()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                name: "CIRCUIT_BREAKER_MAX_MINUTES",
                ..
            })
        ));
    }

    #[test]
    fn test_parse_instances() {
        let specs = parse_instances("auto=full_auto, keeper=manage_only").unwrap();
        assert_eq!(
            specs,
            vec![
                InstanceSpec {
                    id: "auto".to_string(),
                    mode: InstanceMode::FullAuto
                },
                InstanceSpec {
                    id: "keeper".to_string(),
                    mode: InstanceMode::ManageOnly
                },
            ]
        );
    }

    #[test]
    fn test_parse_instances_rejects_bad_entries() {
        assert!(parse_instances("auto").is_err());
        assert!(parse_instances("auto=yolo").is_err());
        assert!(parse_instances("a=full_auto,a=manage_only").is_err());
        assert!(parse_instances("=full_auto").is_err());
    }

    #[test]
    fn test_breaker_config_carries_overrides() {
        let config = AgentConfig {
            circuit_breaker_base_minutes: 30.0,
            circuit_breaker_multiplier: 2.0,
            ..valid()
        };
        let breaker = config.breaker_config();
        assert!(breaker.enabled);
        assert_eq!(breaker.base_minutes, 30.0);
        assert_eq!(breaker.multiplier, 2.0);
        assert_eq!(breaker.max_minutes, 720.0);
    }
}
