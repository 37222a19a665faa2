//! Process configuration for the ledger services.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use stockledger_inventory::DEFAULT_COST_SCALE;

pub const ENV_LOCK_TIMEOUT_MS: &str = "STOCKLEDGER_LOCK_TIMEOUT_MS";
pub const ENV_COST_SCALE: &str = "STOCKLEDGER_COST_SCALE";
pub const ENV_LOT_EXPIRY_WARNING_DAYS: &str = "STOCKLEDGER_LOT_EXPIRY_WARNING_DAYS";

const MAX_COST_SCALE: u32 = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("lock timeout must be greater than zero")]
    ZeroLockTimeout,

    #[error("cost scale {0} exceeds the maximum of 10")]
    CostScaleTooLarge(u32),

    #[error("lot expiry warning window cannot be negative ({0} days)")]
    NegativeExpiryWindow(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Bounded wait for stock locks before `ConcurrencyTimeout`.
    pub lock_timeout: Duration,
    /// Decimal places kept on average costs (rounded half-up).
    pub cost_scale: u32,
    /// Lots expiring within this many days raise a near-expiry alert.
    pub lot_expiry_warning_days: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            cost_scale: DEFAULT_COST_SCALE,
            lot_expiry_warning_days: 30,
        }
    }
}

impl LedgerConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Unparsable values keep the
    /// default and log a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_LOCK_TIMEOUT_MS) {
            config.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(scale) = parse_var::<u32, _>(&lookup, ENV_COST_SCALE) {
            config.cost_scale = scale;
        }
        if let Some(days) = parse_var::<i64, _>(&lookup, ENV_LOT_EXPIRY_WARNING_DAYS) {
            config.lot_expiry_warning_days = days;
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_timeout.is_zero() {
            return Err(ConfigError::ZeroLockTimeout);
        }
        if self.cost_scale > MAX_COST_SCALE {
            return Err(ConfigError::CostScaleTooLarge(self.cost_scale));
        }
        if self.lot_expiry_warning_days < 0 {
            return Err(ConfigError::NegativeExpiryWindow(self.lot_expiry_warning_days));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = LedgerConfig::default();
        assert_eq!(config.lock_timeout, Duration::from_secs(2));
        assert_eq!(config.cost_scale, 2);
        assert_eq!(config.lot_expiry_warning_days, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = LedgerConfig::from_lookup(lookup(&[
            (ENV_LOCK_TIMEOUT_MS, "250"),
            (ENV_COST_SCALE, "4"),
            (ENV_LOT_EXPIRY_WARNING_DAYS, "7"),
        ]));
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.cost_scale, 4);
        assert_eq!(config.lot_expiry_warning_days, 7);
    }

    #[test]
    fn garbage_falls_back_to_default() {
        let config = LedgerConfig::from_lookup(lookup(&[(ENV_COST_SCALE, "two")]));
        assert_eq!(config.cost_scale, DEFAULT_COST_SCALE);
    }

    #[test]
    fn validate_rejects_zero_timeout_and_huge_scale() {
        let config = LedgerConfig {
            lock_timeout: Duration::ZERO,
            ..LedgerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroLockTimeout));

        let config = LedgerConfig {
            cost_scale: 11,
            ..LedgerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::CostScaleTooLarge(11)));
    }
}
