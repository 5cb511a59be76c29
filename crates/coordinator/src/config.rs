use floe_common::Result;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: i64,
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_stall_threshold_secs() -> i64 {
    300
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            stall_threshold_secs: default_stall_threshold_secs(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self> {
        let config_file_path = std::env::var("COORDINATOR_CONFIG_PATH")
            .unwrap_or_else(|_| "crates/coordinator/config/default.toml".to_string());

        let s = config::Config::builder()
            .add_source(config::File::with_name(&config_file_path).required(true))
            .add_source(config::Environment::with_prefix("FLOE_COORDINATOR").separator("__"))
            .build()?;
        s.try_deserialize::<Self>()?.validated()
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?
            .try_deserialize::<Self>()?
            .validated()
    }

    fn validated(self) -> Result<Self> {
        let in_range = self.stall_threshold_secs >= 0
            && chrono::Duration::try_seconds(self.stall_threshold_secs).is_some();
        if !in_range {
            return Err(config::ConfigError::Message(format!(
                "stall_threshold_secs must be a non-negative number of seconds, got {}",
                self.stall_threshold_secs
            ))
            .into());
        }
        Ok(self)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn stall_threshold(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(self.stall_threshold_secs.max(0))
            .unwrap_or(chrono::Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_keys() {
        let settings = Settings::from_toml("sweep_interval_ms = 250").unwrap();
        assert_eq!(settings.sweep_interval(), Duration::from_millis(250));
        assert_eq!(settings.stall_threshold(), chrono::Duration::seconds(300));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let err = Settings::from_toml("stall_threshold_secs = -1").unwrap_err();
        assert!(matches!(err, floe_common::Error::Config(_)));
        assert!(Settings::from_toml(&format!("stall_threshold_secs = {}", i64::MAX)).is_err());
    }

    #[test]
    fn huge_threshold_does_not_panic() {
        let settings = Settings {
            stall_threshold_secs: i64::MAX,
            ..Settings::default()
        };
        assert_eq!(settings.stall_threshold(), chrono::Duration::MAX);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let settings = Settings {
            sweep_interval_ms: 0,
            ..Settings::default()
        };
        assert_eq!(settings.sweep_interval(), Duration::from_millis(1));
    }
}
