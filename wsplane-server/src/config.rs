//! Engine configuration
//!
//! Settings are read from an external key/value store under the
//! [`CONFIG_SECTION`] section. Missing keys keep their defaults.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use wsplane_core::protocol::constants::{MAX_FRAME_LEN, MAX_PAYLOAD_LEN};
use wsplane_core::ConfigError;

/// Section holding the engine's keys
pub const CONFIG_SECTION: &str = "WebSocket";

/// Default multiplexer wait timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(720);

/// Default size of the poller's fixed read buffer
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Default time a writer waits for a congested peer
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Read access to an external key/value store
pub trait KeyValueStore {
    /// Raw value for `key` in `section`, if present
    fn get_value(&self, section: &str, key: &str) -> Option<String>;
}

impl KeyValueStore for config::Config {
    fn get_value(&self, section: &str, key: &str) -> Option<String> {
        let path = format!("{}.{}", section, key);
        self.get_string(&path)
            .or_else(|_| self.get_string(&path.to_lowercase()))
            .ok()
    }
}

impl KeyValueStore for HashMap<String, String> {
    fn get_value(&self, section: &str, key: &str) -> Option<String> {
        self.get(&format!("{}.{}", section, key)).cloned()
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Verbose per-frame logging
    pub debug: bool,
    /// Multiplexer wait timeout
    pub timeout: Duration,
    /// Largest payload a single `write` or `broadcast` accepts
    pub mtu: usize,
    /// Size of the poller's fixed read buffer
    pub read_buffer_size: usize,
    /// Largest number of bytes buffered for one incomplete frame
    pub max_message_size: usize,
    /// How long a send waits on a full socket buffer
    pub write_timeout: Duration,
    /// Invalidate connections silent for this long
    pub idle_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debug: false,
            timeout: DEFAULT_TIMEOUT,
            mtu: MAX_PAYLOAD_LEN,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_message_size: MAX_FRAME_LEN,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            idle_timeout: None,
        }
    }
}

impl EngineConfig {
    /// Load the configuration from `store`, falling back to defaults
    pub fn from_store<S: KeyValueStore + ?Sized>(store: &S) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |key: &str| store.get_value(CONFIG_SECTION, key);

        if let Some(raw) = get("Debug") {
            config.debug = parse_bool("Debug", &raw)?;
        }
        if let Some(raw) = get("Timeout") {
            config.timeout = Duration::from_millis(parse_number("Timeout", &raw)?);
        }
        if let Some(raw) = get("MTU") {
            config.mtu = parse_number("MTU", &raw)?;
        }
        if let Some(raw) = get("ReadBufferSize") {
            config.read_buffer_size = parse_number("ReadBufferSize", &raw)?;
        }
        if let Some(raw) = get("MaxMessageSize") {
            config.max_message_size = parse_number("MaxMessageSize", &raw)?;
        }
        if let Some(raw) = get("WriteTimeout") {
            config.write_timeout = Duration::from_millis(parse_number("WriteTimeout", &raw)?);
        }
        if let Some(raw) = get("IdleTimeout") {
            let millis: u64 = parse_number("IdleTimeout", &raw)?;
            config.idle_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::Validation(
                "Timeout must be greater than 0".to_string(),
            ));
        }

        if self.mtu == 0 || self.mtu > MAX_PAYLOAD_LEN {
            return Err(ConfigError::Validation(format!(
                "MTU must be between 1 and {}",
                MAX_PAYLOAD_LEN
            )));
        }

        if self.read_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "ReadBufferSize must be greater than 0".to_string(),
            ));
        }

        if self.max_message_size < self.mtu {
            return Err(ConfigError::Validation(
                "MaxMessageSize must be greater than or equal to MTU".to_string(),
            ));
        }

        Ok(())
    }

    /// Set verbose logging
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the multiplexer wait timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the maximum payload size
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the read buffer size
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the largest incomplete frame kept between reads
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the write timeout
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

fn parse_bool(field: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(field, raw)),
    }
}

fn parse_number<T: FromStr>(field: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| invalid(field, raw))
}

fn invalid(field: &str, raw: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: format!("{}.{}", CONFIG_SECTION, field),
        value: raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn store(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (format!("{}.{}", CONFIG_SECTION, k), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout, Duration::from_millis(720));
        assert_eq!(config.mtu, 65_535);
        assert!(!config.debug);
    }

    #[test]
    fn test_from_store() {
        let config = EngineConfig::from_store(&store(&[
            ("Debug", "true"),
            ("Timeout", "250"),
            ("MTU", "1024"),
            ("IdleTimeout", "0"),
        ]))
        .unwrap();
        assert!(config.debug);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.mtu, 1024);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_invalid_values() {
        let err = EngineConfig::from_store(&store(&[("MTU", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                field: "WebSocket.MTU".to_string(),
                value: "lots".to_string(),
            }
        );
        assert!(EngineConfig::from_store(&store(&[("Debug", "maybe")])).is_err());
        assert!(EngineConfig::from_store(&store(&[("MTU", "70000")])).is_err());
        assert!(EngineConfig::from_store(&store(&[("Timeout", "0")])).is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::default();
        config.read_buffer_size = 0;
        assert!(config.validate().is_err());

        let config = EngineConfig::default()
            .with_mtu(2048)
            .with_read_buffer_size(512);
        assert!(config.validate().is_ok());

        let mut config = EngineConfig::default().with_mtu(2048);
        config.max_message_size = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_config_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[WebSocket]\nDebug = true\nTimeout = 100\nMTU = 4096").unwrap();

        let settings = config::Config::builder()
            .add_source(config::File::from(file.path()))
            .build()
            .unwrap();
        let config = EngineConfig::from_store(&settings).unwrap();
        assert!(config.debug);
        assert_eq!(config.timeout, Duration::from_millis(100));
        assert_eq!(config.mtu, 4096);
    }
}
