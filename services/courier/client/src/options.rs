//! Connection options for the courier client.

use courier_session::{LoginParams, SessionConfig};
use courier_wire::{DEFAULT_MAX_FRAME_SIZE, HARD_MAX_FRAME_SIZE};
use std::time::Duration;

use crate::error::{ClientError, Result};

/// Options for connecting to a courier server
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// User name presented at login
    pub username: Option<String>,

    /// Password presented at login
    pub password: Option<String>,

    /// Client identifier; durable subscriptions are tied to it
    pub client_id: Option<String>,

    /// Whether to reconnect automatically after a connection loss
    pub auto_reconnect: bool,

    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,

    /// First reconnect delay
    pub reconnect_backoff_min: Duration,

    /// Largest reconnect delay
    pub reconnect_backoff_max: Duration,

    /// Interval between heartbeats
    pub heartbeat_interval: Duration,

    /// Silence after which the connection is considered lost
    pub heartbeat_timeout: Duration,

    /// Time allowed for the login handshake
    pub login_timeout: Duration,

    /// Events buffered per subscription before dispatch blocks
    pub subscription_capacity: usize,

    /// Connection errors buffered for the error stream
    pub error_capacity: usize,

    /// Time given to in-flight work when disconnecting
    pub disconnect_grace: Duration,

    /// Largest frame sent or accepted
    pub max_frame_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            client_id: None,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_backoff_min: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            login_timeout: Duration::from_secs(15),
            subscription_capacity: 100,
            error_capacity: 16,
            disconnect_grace: Duration::from_secs(2),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ConnectOptions {
    /// Options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the login credentials
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the client identifier
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Disable automatic reconnection
    pub fn no_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    /// Set the reconnect delay range
    pub fn reconnect_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.reconnect_backoff_min = min;
        self.reconnect_backoff_max = max;
        self
    }

    /// Set the number of reconnect attempts
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the heartbeat interval and timeout
    pub fn heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the login timeout
    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    /// Set the per-subscription queue capacity
    pub fn subscription_capacity(mut self, capacity: usize) -> Self {
        self.subscription_capacity = capacity;
        self
    }

    /// Reject inconsistent values
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("heartbeat interval must be positive"));
        }
        if self.heartbeat_timeout < self.heartbeat_interval {
            return Err(invalid("heartbeat timeout must not be shorter than the interval"));
        }
        if self.login_timeout.is_zero() {
            return Err(invalid("login timeout must be positive"));
        }
        if self.reconnect_backoff_min.is_zero() {
            return Err(invalid("minimum reconnect backoff must be positive"));
        }
        if self.reconnect_backoff_max < self.reconnect_backoff_min {
            return Err(invalid("maximum reconnect backoff must not be below the minimum"));
        }
        if self.subscription_capacity == 0 {
            return Err(invalid("subscription capacity must be positive"));
        }
        if self.error_capacity == 0 {
            return Err(invalid("error capacity must be positive"));
        }
        if self.max_frame_size == 0 || self.max_frame_size > HARD_MAX_FRAME_SIZE {
            return Err(invalid("max frame size out of range"));
        }
        Ok(())
    }

    /// Session configuration for one connection attempt
    pub(crate) fn session_config(&self, id_token: Option<String>) -> SessionConfig {
        SessionConfig {
            login: LoginParams {
                username: self.username.clone(),
                password: self.password.clone(),
                client_id: self.client_id.clone(),
                id_token,
            },
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            login_timeout: self.login_timeout,
            max_frame_size: self.max_frame_size,
            ..SessionConfig::default()
        }
    }
}

fn invalid(reason: &str) -> ClientError {
    ClientError::InvalidArgument(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConnectOptions::default();
        assert!(options.auto_reconnect);
        assert_eq!(options.max_reconnect_attempts, 5);
        assert_eq!(options.reconnect_backoff_min, Duration::from_secs(1));
        assert_eq!(options.reconnect_backoff_max, Duration::from_secs(30));
        assert_eq!(options.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(options.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(options.login_timeout, Duration::from_secs(15));
        assert_eq!(options.subscription_capacity, 100);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let options = ConnectOptions::new()
            .credentials("user", "pass")
            .client_id("client-go")
            .no_reconnect()
            .subscription_capacity(8);

        assert_eq!(options.username.as_deref(), Some("user"));
        assert_eq!(options.client_id.as_deref(), Some("client-go"));
        assert!(!options.auto_reconnect);

        let config = options.session_config(Some("token".into()));
        assert_eq!(config.login.password.as_deref(), Some("pass"));
        assert_eq!(config.login.id_token.as_deref(), Some("token"));
    }

    #[test]
    fn test_validate_rejects_inconsistent_values() {
        let options = ConnectOptions::new().heartbeat(Duration::from_secs(10), Duration::from_secs(5));
        assert!(matches!(options.validate(), Err(ClientError::InvalidArgument(_))));

        let options = ConnectOptions::new()
            .reconnect_backoff(Duration::from_secs(10), Duration::from_secs(1));
        assert!(options.validate().is_err());

        let options = ConnectOptions::new().subscription_capacity(0);
        assert!(options.validate().is_err());
    }
}
