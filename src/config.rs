use std::env;
use std::num::ParseIntError;

use relay_sfu::registry::DEFAULT_ROOM_GRACE_SECS;
use relay_sfu::signaling_transport::{DEFAULT_SEND_QUEUE_CAPACITY, KEEPALIVE_INTERVAL_SECS};

#[derive(Debug, Clone)]
/// Application configuration loaded from environment variables.
pub struct Config {
    /// Port the signaling HTTP/WebSocket server listens on.
    pub signaling_port: u16,
    /// Port for the HTTP metrics server (Prometheus).
    pub metrics_port: u16,
    /// Logging level (e.g., "info", "debug").
    pub rust_log: String,
    /// HMAC secret used to validate join tokens. `None` disables token
    /// validation entirely, matching the data-model's "token optional"
    /// clause.
    pub token_secret: Option<String>,
    /// Seconds an emptied room survives before reclamation.
    pub room_grace_secs: u64,
    /// Capacity of a peer's outbound signaling queue before it is reported
    /// as overflowing.
    pub send_queue_capacity: usize,
    /// Interval between keepalive pings on an idle signaling connection.
    pub keepalive_interval_secs: u64,
}

#[derive(Debug)]
/// Errors that can occur during configuration loading.
pub enum ConfigError {
    MissingVariable(String),
    InvalidPort(String, ParseIntError),
    PortOutOfRange(u16),
    InvalidNumber(String, ParseIntError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "{} is required", var),
            ConfigError::InvalidPort(val, err) => {
                write!(f, "{} must be a valid port number (got '{}': {})", val, val, err)
            }
            ConfigError::PortOutOfRange(port) => {
                write!(f, "SIGNALING_PORT must be between 1 and 65535 (got {})", port)
            }
            ConfigError::InvalidNumber(val, err) => {
                write!(f, "{} must be a valid number: {}", val, err)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Validates environment variables and returns a Config object. Returns an
/// error if any required variable is missing or invalid.
pub fn validate_env() -> Result<Config, ConfigError> {
    let signaling_port_str = env::var("SIGNALING_PORT")
        .map_err(|_| ConfigError::MissingVariable("SIGNALING_PORT".to_string()))?;

    let signaling_port: u16 = signaling_port_str
        .parse()
        .map_err(|e| ConfigError::InvalidPort("SIGNALING_PORT".to_string(), e))?;

    if signaling_port == 0 {
        return Err(ConfigError::PortOutOfRange(signaling_port));
    }

    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| {
        eprintln!("RUST_LOG not set, using default: info");
        "info".to_string()
    });

    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "3030".to_string())
        .parse()
        .map_err(|e| ConfigError::InvalidPort("METRICS_PORT".to_string(), e))?;

    let token_secret = env::var("SFU_TOKEN_SECRET").ok();

    let room_grace_secs: u64 = env::var("SFU_ROOM_GRACE_SECS")
        .unwrap_or_else(|_| DEFAULT_ROOM_GRACE_SECS.to_string())
        .parse()
        .map_err(|e| ConfigError::InvalidNumber("SFU_ROOM_GRACE_SECS".to_string(), e))?;

    let send_queue_capacity: usize = env::var("SFU_SEND_QUEUE_CAPACITY")
        .unwrap_or_else(|_| DEFAULT_SEND_QUEUE_CAPACITY.to_string())
        .parse()
        .map_err(|e| ConfigError::InvalidNumber("SFU_SEND_QUEUE_CAPACITY".to_string(), e))?;

    let keepalive_interval_secs: u64 = env::var("SFU_KEEPALIVE_INTERVAL_SECS")
        .unwrap_or_else(|_| KEEPALIVE_INTERVAL_SECS.to_string())
        .parse()
        .map_err(|e| ConfigError::InvalidNumber("SFU_KEEPALIVE_INTERVAL_SECS".to_string(), e))?;

    Ok(Config {
        signaling_port,
        metrics_port,
        rust_log,
        token_secret,
        room_grace_secs,
        send_queue_capacity,
        keepalive_interval_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    lazy_static::lazy_static! {
        static ref ENV_MUTEX: Mutex<()> = Mutex::new(());
    }

    struct EnvGuard<'a> {
        vars: Vec<String>,
        _guard: std::sync::MutexGuard<'a, ()>,
    }

    impl<'a> EnvGuard<'a> {
        fn new() -> Self {
            let guard = ENV_MUTEX.lock().unwrap();
            EnvGuard {
                vars: Vec::new(),
                _guard: guard,
            }
        }

        fn set(&mut self, key: &str, value: &str) {
            env::set_var(key, value);
            self.vars.push(key.to_string());
        }

        fn unset(&mut self, key: &str) {
            env::remove_var(key);
            self.vars.push(key.to_string());
        }
    }

    impl<'a> Drop for EnvGuard<'a> {
        fn drop(&mut self) {
            for var in &self.vars {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_validate_env_valid_configuration() {
        let mut guard = EnvGuard::new();
        guard.set("SIGNALING_PORT", "8081");
        guard.set("RUST_LOG", "debug");

        let config = validate_env().expect("expected valid configuration");
        assert_eq!(config.signaling_port, 8081);
        assert_eq!(config.rust_log, "debug");
        assert_eq!(config.room_grace_secs, DEFAULT_ROOM_GRACE_SECS);
    }

    #[test]
    fn test_validate_env_token_secret_optional() {
        let mut guard = EnvGuard::new();
        guard.set("SIGNALING_PORT", "8081");
        guard.unset("SFU_TOKEN_SECRET");

        let config = validate_env().expect("expected valid configuration");
        assert!(config.token_secret.is_none());

        guard.set("SFU_TOKEN_SECRET", "s3cret");
        let config = validate_env().expect("expected valid configuration");
        assert_eq!(config.token_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_validate_env_metrics_port() {
        let mut guard = EnvGuard::new();
        guard.set("SIGNALING_PORT", "8081");
        guard.set("METRICS_PORT", "9090");

        let config = validate_env().expect("expected valid configuration");
        assert_eq!(config.metrics_port, 9090);
    }

    #[test]
    fn test_validate_env_invalid_metrics_port() {
        let mut guard = EnvGuard::new();
        guard.set("SIGNALING_PORT", "8081");
        guard.set("METRICS_PORT", "not-a-number");

        let result = validate_env();
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), ConfigError::InvalidPort(_, _)));
    }

    #[test]
    fn test_validate_env_missing_signaling_port() {
        let mut guard = EnvGuard::new();
        guard.unset("SIGNALING_PORT");

        let result = validate_env();
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), ConfigError::MissingVariable(_)));
    }

    #[test]
    fn test_validate_env_port_out_of_range() {
        let mut guard = EnvGuard::new();
        guard.set("SIGNALING_PORT", "0");

        let result = validate_env();
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), ConfigError::PortOutOfRange(_)));
    }

    #[test]
    fn test_validate_env_rust_log_defaults() {
        let mut guard = EnvGuard::new();
        guard.set("SIGNALING_PORT", "8081");
        guard.unset("RUST_LOG");

        let config = validate_env().expect("expected valid configuration");
        assert_eq!(config.rust_log, "info");
    }

    #[test]
    fn test_validate_env_custom_grace_and_queue_capacity() {
        let mut guard = EnvGuard::new();
        guard.set("SIGNALING_PORT", "8081");
        guard.set("SFU_ROOM_GRACE_SECS", "30");
        guard.set("SFU_SEND_QUEUE_CAPACITY", "64");

        let config = validate_env().expect("expected valid configuration");
        assert_eq!(config.room_grace_secs, 30);
        assert_eq!(config.send_queue_capacity, 64);
    }
}
