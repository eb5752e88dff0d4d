// Engine configuration

use std::time::Duration;

/// Default lock timeout in seconds
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 5;

/// Smallest-unit amount per whole currency unit
const CENTS_PER_UNIT: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Receipts carry whole currency units, so the price must be one
    #[error("RIDE_PRICE_CENTS must be a positive multiple of 100, got {0}")]
    PriceNotWholeUnits(i64),
}

/// Configuration for the workflow executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// A lock older than this is considered abandoned and may be taken over
    pub lock_timeout: Duration,
    /// Ride price in the smallest currency unit
    pub ride_price_cents: i64,
    pub currency: String,
    /// Prefix of the gateway idempotency token, followed by the key id
    pub gateway_token_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            ride_price_cents: 2000,
            currency: "usd".to_string(),
            gateway_token_prefix: "skyride".to_string(),
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    ///
    /// - `IDEM_KEY_TIMEOUT`: lock timeout in seconds
    /// - `RIDE_PRICE_CENTS`, `RIDE_CURRENCY`
    /// - `GATEWAY_TOKEN_PREFIX`
    ///
    /// Unparseable values fall back to the defaults; a price that is not a
    /// whole number of currency units is an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let lock_timeout = std::env::var("IDEM_KEY_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.lock_timeout);

        let ride_price_cents = std::env::var("RIDE_PRICE_CENTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.ride_price_cents);

        let currency = std::env::var("RIDE_CURRENCY").unwrap_or(defaults.currency);

        let gateway_token_prefix =
            std::env::var("GATEWAY_TOKEN_PREFIX").unwrap_or(defaults.gateway_token_prefix);

        let config = Self {
            lock_timeout,
            ride_price_cents,
            currency,
            gateway_token_prefix,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ride_price_cents <= 0 || self.ride_price_cents % CENTS_PER_UNIT != 0 {
            return Err(ConfigError::PriceNotWholeUnits(self.ride_price_cents));
        }
        Ok(())
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Receipt amount in whole currency units; exact for a validated config
    pub fn receipt_amount(&self) -> i64 {
        self.ride_price_cents / CENTS_PER_UNIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.ride_price_cents, 2000);
        assert_eq!(config.receipt_amount(), 20);
        assert_eq!(config.currency, "usd");
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_price_must_be_whole_units() {
        for cents in [2050, 1, 0, -100] {
            let config = EngineConfig {
                ride_price_cents: cents,
                ..EngineConfig::default()
            };
            assert_eq!(config.validate(), Err(ConfigError::PriceNotWholeUnits(cents)));
        }

        let config = EngineConfig {
            ride_price_cents: 2500,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.receipt_amount(), 25);
    }
}
