use floe_common::Result;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub worker_host: String,
    pub worker_port: u16,
    pub coordinator_address: String,
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    #[serde(default)]
    pub memory: MemorySettings,
}

/// Limits for the worker's budget tree.
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySettings {
    #[serde(default = "default_root_limit_bytes")]
    pub root_limit_bytes: u64,
    #[serde(default = "default_fragment_initial_reservation_bytes")]
    pub fragment_initial_reservation_bytes: u64,
    #[serde(default = "default_fragment_max_reservation_bytes")]
    pub fragment_max_reservation_bytes: u64,
}

fn default_status_interval_ms() -> u64 {
    5000
}

fn default_root_limit_bytes() -> u64 {
    1 << 30
}

fn default_fragment_initial_reservation_bytes() -> u64 {
    1 << 20
}

fn default_fragment_max_reservation_bytes() -> u64 {
    256 << 20
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            root_limit_bytes: default_root_limit_bytes(),
            fragment_initial_reservation_bytes: default_fragment_initial_reservation_bytes(),
            fragment_max_reservation_bytes: default_fragment_max_reservation_bytes(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self> {
        let config_file_path = std::env::var("WORKER_CONFIG_PATH")
            .unwrap_or_else(|_| "crates/worker/config/default.toml".to_string());

        let s = config::Config::builder()
            .add_source(config::File::with_name(&config_file_path).required(true))
            .add_source(config::Environment::with_prefix("FLOE_WORKER").separator("__"))
            .build()?;
        Ok(s.try_deserialize()?)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?)
    }

    pub fn worker_server_address(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.worker_host, self.worker_port).parse()
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        worker_host = "127.0.0.1"
        worker_port = 31011
        coordinator_address = "http://127.0.0.1:31010"
    "#;

    #[test]
    fn memory_defaults_apply() {
        let settings = Settings::from_toml(MINIMAL).unwrap();
        assert_eq!(settings.status_interval(), Duration::from_secs(5));
        assert_eq!(settings.memory.root_limit_bytes, 1 << 30);
        assert_eq!(settings.memory.fragment_initial_reservation_bytes, 1 << 20);
        assert_eq!(settings.memory.fragment_max_reservation_bytes, 256 << 20);
        assert_eq!(
            settings.worker_server_address().unwrap(),
            "127.0.0.1:31011".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn nested_memory_table_overrides_defaults() {
        let contents = format!("{MINIMAL}\n[memory]\nroot_limit_bytes = 4096\n");
        let settings = Settings::from_toml(&contents).unwrap();
        assert_eq!(settings.memory.root_limit_bytes, 4096);
        assert_eq!(settings.memory.fragment_initial_reservation_bytes, 1 << 20);
    }

    #[test]
    fn missing_host_is_an_error() {
        assert!(matches!(
            Settings::from_toml("worker_port = 1"),
            Err(floe_common::Error::Config(_))
        ));
    }
}
