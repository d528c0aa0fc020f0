use chrono::Duration;
use config::{builder::DefaultState, ConfigBuilder, ConfigError, Environment};
use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Unset means the in-memory ledger store is used
    pub database_url: Option<String>,
    pub bind_address: String,
    /// Shared secret for the cron endpoints. Unset or empty disables the check.
    pub cron_secret: Option<String>,
    pub commission_rate: Decimal,
    pub min_payout_amount: Decimal,
    pub escrow_holding_days: i64,
    pub reconciliation_window_hours: i64,
    /// Extra lookback on the gateway log so transactions recorded just
    /// before their local payment row still match
    pub reconciliation_gateway_slack_minutes: i64,
    pub payout_stale_after_minutes: i64,
    pub cron_lock_ttl_seconds: u64,
    pub gateway_base_url: String,
    pub gateway_secret_key: String,
    pub currency: String,
    pub scheduler_enabled: bool,
    pub scheduler_hour_utc: u32,
    /// Requests per minute allowed on /api/v1
    pub rate_limit_per_minute: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_builder(Self::defaults()?.add_source(Environment::default()))
    }

    pub fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("commission_rate", "0.05")?
            .set_default("min_payout_amount", "1000")?
            .set_default("escrow_holding_days", 7)?
            .set_default("reconciliation_window_hours", 48)?
            .set_default("reconciliation_gateway_slack_minutes", 30)?
            .set_default("payout_stale_after_minutes", 60)?
            .set_default("cron_lock_ttl_seconds", 900)?
            .set_default("gateway_base_url", "https://api.paystack.co")?
            .set_default("gateway_secret_key", "")?
            .set_default("currency", "NGN")?
            .set_default("scheduler_enabled", false)?
            .set_default("scheduler_hour_utc", 2)?
            .set_default("rate_limit_per_minute", 120)
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.commission_rate < Decimal::ZERO || self.commission_rate >= Decimal::ONE {
            return Err(ConfigError::Message(format!(
                "commission_rate must be in [0, 1), got {}",
                self.commission_rate
            )));
        }
        if self.min_payout_amount <= Decimal::ZERO {
            return Err(ConfigError::Message(
                "min_payout_amount must be positive".to_string(),
            ));
        }
        if self.escrow_holding_days < 0 {
            return Err(ConfigError::Message(
                "escrow_holding_days must not be negative".to_string(),
            ));
        }
        if self.reconciliation_gateway_slack_minutes < 0 {
            return Err(ConfigError::Message(
                "reconciliation_gateway_slack_minutes must not be negative".to_string(),
            ));
        }
        if self.scheduler_hour_utc > 23 {
            return Err(ConfigError::Message(
                "scheduler_hour_utc must be between 0 and 23".to_string(),
            ));
        }
        if self.rate_limit_per_minute == 0 {
            return Err(ConfigError::Message(
                "rate_limit_per_minute must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Configured cron secret, treating an empty value as unset
    pub fn cron_secret(&self) -> Option<&str> {
        self.cron_secret.as_deref().filter(|s| !s.is_empty())
    }

    pub fn escrow_holding_period(&self) -> Duration {
        Duration::days(self.escrow_holding_days)
    }

    pub fn reconciliation_window(&self) -> Duration {
        Duration::hours(self.reconciliation_window_hours)
    }

    pub fn reconciliation_gateway_slack(&self) -> Duration {
        Duration::minutes(self.reconciliation_gateway_slack_minutes)
    }

    pub fn payout_stale_after(&self) -> Duration {
        Duration::minutes(self.payout_stale_after_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults() {
        let config = Config::from_builder(Config::defaults().unwrap()).unwrap();

        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.commission_rate, dec!(0.05));
        assert_eq!(config.min_payout_amount, dec!(1000));
        assert_eq!(config.escrow_holding_period(), Duration::days(7));
        assert!(config.database_url.is_none());
        assert!(config.cron_secret().is_none());
        assert!(!config.scheduler_enabled);
        assert_eq!(config.reconciliation_gateway_slack(), Duration::minutes(30));
    }

    #[test]
    fn test_overrides() {
        let builder = Config::defaults()
            .unwrap()
            .set_override("cron_secret", "abc")
            .unwrap()
            .set_override("commission_rate", "0.1")
            .unwrap()
            .set_override("escrow_holding_days", 3)
            .unwrap();
        let config = Config::from_builder(builder).unwrap();

        assert_eq!(config.cron_secret(), Some("abc"));
        assert_eq!(config.commission_rate, dec!(0.1));
        assert_eq!(config.escrow_holding_period(), Duration::days(3));
    }

    #[test]
    fn test_empty_secret_is_unset() {
        let builder = Config::defaults().unwrap().set_override("cron_secret", "").unwrap();
        let config = Config::from_builder(builder).unwrap();
        assert!(config.cron_secret().is_none());
    }

    #[test]
    fn test_rejects_invalid_commission() {
        let builder = Config::defaults()
            .unwrap()
            .set_override("commission_rate", "1.5")
            .unwrap();
        assert!(Config::from_builder(builder).is_err());
    }

    #[test]
    fn test_rejects_negative_gateway_slack() {
        let builder = Config::defaults()
            .unwrap()
            .set_override("reconciliation_gateway_slack_minutes", -5)
            .unwrap();
        assert!(Config::from_builder(builder).is_err());
    }
}
