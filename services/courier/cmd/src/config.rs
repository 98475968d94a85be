//! Configuration handling for the courier binary.
//!
//! Settings come from a YAML file, then `COURIER_*` environment variables,
//! then command line flags; later sources win.

use anyhow::{Context, Result};
use courier_client::ConnectOptions;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Courier client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CourierConfig {
    /// Server URL, `tcp://host:port` or `tls://host:port`
    pub url: String,
    /// User name for login
    pub username: Option<String>,
    /// Password for login
    pub password: Option<String>,
    /// Client identifier
    pub client_id: String,
    /// Reconnect after connection loss
    pub auto_reconnect: bool,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// First reconnect delay
    pub reconnect_backoff_min: Duration,
    /// Largest reconnect delay
    pub reconnect_backoff_max: Duration,
    /// Heartbeat interval
    pub heartbeat_interval: Duration,
    /// Heartbeat timeout
    pub heartbeat_timeout: Duration,
    /// Login timeout
    pub login_timeout: Duration,
    /// Events buffered per subscription
    pub subscription_capacity: usize,
    /// TLS configuration
    pub tls: TlsConfig,
}

/// TLS configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// Path to CA certificate file
    pub ca_file: Option<String>,
    /// Path to client certificate file
    pub cert_file: Option<String>,
    /// Path to client private key file
    pub key_file: Option<String>,
    /// Server name for SNI; defaults to the URL host
    pub server_name: Option<String>,
}

impl Default for CourierConfig {
    fn default() -> Self {
        let options = ConnectOptions::default();
        Self {
            url: "tcp://localhost:8585".to_string(),
            username: None,
            password: None,
            client_id: "client-go".to_string(),
            auto_reconnect: options.auto_reconnect,
            max_reconnect_attempts: options.max_reconnect_attempts,
            reconnect_backoff_min: options.reconnect_backoff_min,
            reconnect_backoff_max: options.reconnect_backoff_max,
            heartbeat_interval: options.heartbeat_interval,
            heartbeat_timeout: options.heartbeat_timeout,
            login_timeout: options.login_timeout,
            subscription_capacity: options.subscription_capacity,
            tls: TlsConfig::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    courier: Option<FileConfig>,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
    reconnect: Option<ReconnectSection>,
    heartbeat: Option<HeartbeatSection>,
    login_timeout: Option<String>,
    subscription_capacity: Option<usize>,
    tls: Option<TlsSection>,
}

#[derive(Debug, Deserialize)]
struct ReconnectSection {
    enabled: Option<bool>,
    max_attempts: Option<u32>,
    backoff_min: Option<String>,
    backoff_max: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatSection {
    interval: Option<String>,
    timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TlsSection {
    ca_file: Option<String>,
    cert_file: Option<String>,
    key_file: Option<String>,
    server_name: Option<String>,
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration for {}: {}", field, value))
}

impl CourierConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse {:?}", config_path.as_ref()))?;
                if let Some(file) = root.courier {
                    config.apply_file_config(file)?;
                }
                info!("Loaded configuration from {:?}", config_path.as_ref());
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", config_path.as_ref());
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Final courier configuration: url={}, client_id={}, auto_reconnect={}",
            config.url, config.client_id, config.auto_reconnect
        );
        Ok(config)
    }

    fn apply_file_config(&mut self, file: FileConfig) -> Result<()> {
        if let Some(url) = file.url {
            self.url = url;
        }
        if file.username.is_some() {
            self.username = file.username;
        }
        if file.password.is_some() {
            self.password = file.password;
        }
        if let Some(client_id) = file.client_id {
            self.client_id = client_id;
        }

        if let Some(reconnect) = file.reconnect {
            if let Some(enabled) = reconnect.enabled {
                self.auto_reconnect = enabled;
            }
            if let Some(max_attempts) = reconnect.max_attempts {
                self.max_reconnect_attempts = max_attempts;
            }
            if let Some(min) = reconnect.backoff_min {
                self.reconnect_backoff_min = parse_duration("reconnect.backoff_min", &min)?;
            }
            if let Some(max) = reconnect.backoff_max {
                self.reconnect_backoff_max = parse_duration("reconnect.backoff_max", &max)?;
            }
        }

        if let Some(heartbeat) = file.heartbeat {
            if let Some(interval) = heartbeat.interval {
                self.heartbeat_interval = parse_duration("heartbeat.interval", &interval)?;
            }
            if let Some(timeout) = heartbeat.timeout {
                self.heartbeat_timeout = parse_duration("heartbeat.timeout", &timeout)?;
            }
        }

        if let Some(login_timeout) = file.login_timeout {
            self.login_timeout = parse_duration("login_timeout", &login_timeout)?;
        }
        if let Some(capacity) = file.subscription_capacity {
            self.subscription_capacity = capacity;
        }

        if let Some(tls) = file.tls {
            self.tls = TlsConfig {
                ca_file: tls.ca_file,
                cert_file: tls.cert_file,
                key_file: tls.key_file,
                server_name: tls.server_name,
            };
        }
        Ok(())
    }

    /// Apply `COURIER_*` overrides looked up through `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("COURIER_URL") {
            info!("URL overridden by environment: {}", url);
            self.url = url;
        }
        if let Some(username) = lookup("COURIER_USERNAME") {
            self.username = Some(username);
        }
        if let Some(password) = lookup("COURIER_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(client_id) = lookup("COURIER_CLIENT_ID") {
            info!("Client ID overridden by environment: {}", client_id);
            self.client_id = client_id;
        }
        if let Some(enabled) = lookup("COURIER_AUTO_RECONNECT") {
            match enabled.parse::<bool>() {
                Ok(enabled) => self.auto_reconnect = enabled,
                Err(_) => warn!("Ignoring invalid COURIER_AUTO_RECONNECT: {}", enabled),
            }
        }
    }

    /// Engine options for this configuration
    pub fn to_connect_options(&self) -> ConnectOptions {
        let mut options = ConnectOptions::new()
            .client_id(self.client_id.clone())
            .reconnect_backoff(self.reconnect_backoff_min, self.reconnect_backoff_max)
            .max_reconnect_attempts(self.max_reconnect_attempts)
            .heartbeat(self.heartbeat_interval, self.heartbeat_timeout)
            .login_timeout(self.login_timeout)
            .subscription_capacity(self.subscription_capacity);
        options.username = self.username.clone();
        options.password = self.password.clone();
        if !self.auto_reconnect {
            options = options.no_reconnect();
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = CourierConfig::default();
        assert_eq!(config.url, "tcp://localhost:8585");
        assert_eq!(config.client_id, "client-go");
        assert!(config.auto_reconnect);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert!(config.to_connect_options().validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
courier:
  url: tls://broker.example.com:9191
  username: user
  password: secret
  client_id: sample-client
  reconnect:
    enabled: false
    max_attempts: 3
    backoff_min: 500ms
    backoff_max: 10s
  heartbeat:
    interval: 5s
    timeout: 20s
  subscription_capacity: 50
  tls:
    ca_file: /etc/courier/ca.pem
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let mut config = CourierConfig::default();
        let root: RootConfig = serde_yaml::from_str(yaml_content).unwrap();
        config.apply_file_config(root.courier.unwrap()).unwrap();

        assert_eq!(config.url, "tls://broker.example.com:9191");
        assert_eq!(config.username.as_deref(), Some("user"));
        assert_eq!(config.client_id, "sample-client");
        assert!(!config.auto_reconnect);
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.reconnect_backoff_min, Duration::from_millis(500));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(20));
        assert_eq!(config.subscription_capacity, 50);
        assert_eq!(config.tls.ca_file.as_deref(), Some("/etc/courier/ca.pem"));

        let options = config.to_connect_options();
        assert!(!options.auto_reconnect);
        assert_eq!(options.password.as_deref(), Some("secret"));

        let loaded = CourierConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.heartbeat_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = CourierConfig::load_from_file("/nonexistent/courier.yaml").unwrap();
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_duration_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"courier:\n  heartbeat:\n    interval: soon\n")
            .unwrap();
        assert!(CourierConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("COURIER_URL", "tcp://other:1234"),
            ("COURIER_CLIENT_ID", "env-client"),
            ("COURIER_AUTO_RECONNECT", "false"),
        ]
        .into_iter()
        .collect();

        let mut config = CourierConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.url, "tcp://other:1234");
        assert_eq!(config.client_id, "env-client");
        assert!(!config.auto_reconnect);
        assert_eq!(config.username, None);
    }
}
