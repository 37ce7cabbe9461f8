use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub db_max_connections: u32,
    /// RS256 public key used to validate client access tokens.
    pub jwt_public_key_pem: String,
    /// Expected `aud` claim. Unset means the claim is not checked.
    pub jwt_audience: Option<String>,
    pub jwt_issuer: Option<String>,
    /// Bound on identity resolution plus the initial membership fetch.
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// No frame from the client for this long means the connection is dead.
    pub client_timeout: Duration,
    pub idle_sweep_interval: Duration,
    /// Typing indicator expiry when no explicit stop arrives.
    pub typing_timeout: Duration,
    /// Per-connection outbound queue capacity, in frames.
    pub outbound_buffer: usize,
    pub internal_api_token: Option<String>,
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{key} has invalid value '{raw}'"))),
        _ => Ok(default),
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn load_jwt_public_key() -> Result<String, AppError> {
    if let Ok(pem) = env::var("JWT_PUBLIC_KEY_PEM") {
        if !pem.trim().is_empty() {
            return Ok(pem);
        }
    }
    let path = env::var("JWT_PUBLIC_KEY_FILE").map_err(|_| {
        AppError::Config("JWT_PUBLIC_KEY_PEM or JWT_PUBLIC_KEY_FILE must be set".into())
    })?;
    std::fs::read_to_string(&path)
        .map_err(|e| AppError::Config(format!("failed to read JWT_PUBLIC_KEY_FILE {path}: {e}")))
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::Config("DATABASE_URL missing".into()))?;
        let jwt_public_key_pem = load_jwt_public_key()?;

        let cfg = Self {
            database_url,
            port: parse_env("PORT", 8086)?,
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", 10)?,
            jwt_public_key_pem,
            jwt_audience: optional_env("JWT_AUDIENCE"),
            jwt_issuer: optional_env("JWT_ISSUER"),
            handshake_timeout: Duration::from_millis(parse_env("HANDSHAKE_TIMEOUT_MS", 5_000)?),
            heartbeat_interval: Duration::from_secs(parse_env("HEARTBEAT_INTERVAL_SECS", 5)?),
            client_timeout: Duration::from_secs(parse_env("CLIENT_TIMEOUT_SECS", 30)?),
            idle_sweep_interval: Duration::from_secs(parse_env("IDLE_SWEEP_INTERVAL_SECS", 30)?),
            typing_timeout: Duration::from_millis(parse_env("TYPING_TIMEOUT_MS", 5_000)?),
            outbound_buffer: parse_env("OUTBOUND_BUFFER", 256)?,
            internal_api_token: optional_env("INTERNAL_API_TOKEN"),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.client_timeout <= self.heartbeat_interval {
            return Err(AppError::Config(
                "CLIENT_TIMEOUT_SECS must be greater than HEARTBEAT_INTERVAL_SECS".into(),
            ));
        }
        if self.outbound_buffer == 0 {
            return Err(AppError::Config("OUTBOUND_BUFFER must be at least 1".into()));
        }
        if self.handshake_timeout.is_zero() || self.idle_sweep_interval.is_zero() {
            return Err(AppError::Config(
                "HANDSHAKE_TIMEOUT_MS and IDLE_SWEEP_INTERVAL_SECS must be positive".into(),
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn test_defaults() -> Self {
        Self {
            database_url: "postgres://localhost/test".into(),
            port: 8086,
            db_max_connections: 1,
            jwt_public_key_pem: String::new(),
            jwt_audience: None,
            jwt_issuer: None,
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            client_timeout: Duration::from_secs(30),
            idle_sweep_interval: Duration::from_secs(30),
            typing_timeout: Duration::from_secs(5),
            outbound_buffer: 256,
            internal_api_token: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "DATABASE_URL",
        "PORT",
        "DB_MAX_CONNECTIONS",
        "JWT_PUBLIC_KEY_PEM",
        "JWT_PUBLIC_KEY_FILE",
        "JWT_AUDIENCE",
        "JWT_ISSUER",
        "HANDSHAKE_TIMEOUT_MS",
        "HEARTBEAT_INTERVAL_SECS",
        "CLIENT_TIMEOUT_SECS",
        "IDLE_SWEEP_INTERVAL_SECS",
        "TYPING_TIMEOUT_MS",
        "OUTBOUND_BUFFER",
        "INTERNAL_API_TOKEN",
    ];

    fn reset_env() {
        for key in KEYS {
            env::remove_var(key);
        }
        env::set_var("DATABASE_URL", "postgres://localhost/realtime");
        env::set_var("JWT_PUBLIC_KEY_PEM", "-----BEGIN PUBLIC KEY-----");
    }

    #[test]
    #[serial]
    fn test_defaults_from_env() {
        reset_env();
        let cfg = Config::from_env().unwrap();

        assert_eq!(cfg.port, 8086);
        assert_eq!(cfg.handshake_timeout, Duration::from_millis(5_000));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.client_timeout, Duration::from_secs(30));
        assert_eq!(cfg.typing_timeout, Duration::from_millis(5_000));
        assert_eq!(cfg.outbound_buffer, 256);
        assert!(cfg.internal_api_token.is_none());
        assert!(cfg.jwt_audience.is_none());
        assert!(cfg.jwt_issuer.is_none());
    }

    #[test]
    #[serial]
    fn test_overrides_from_env() {
        reset_env();
        env::set_var("PORT", "9100");
        env::set_var("TYPING_TIMEOUT_MS", "8000");
        env::set_var("OUTBOUND_BUFFER", "32");
        env::set_var("INTERNAL_API_TOKEN", "s3cret");
        env::set_var("JWT_AUDIENCE", "https://api.chat.dev");
        env::set_var("JWT_ISSUER", "https://tenant.auth0.com/");
        let cfg = Config::from_env().unwrap();

        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.typing_timeout, Duration::from_secs(8));
        assert_eq!(cfg.outbound_buffer, 32);
        assert_eq!(cfg.internal_api_token.as_deref(), Some("s3cret"));
        assert_eq!(cfg.jwt_audience.as_deref(), Some("https://api.chat.dev"));
        assert_eq!(cfg.jwt_issuer.as_deref(), Some("https://tenant.auth0.com/"));
        reset_env();
    }

    #[test]
    #[serial]
    fn test_missing_required_values() {
        reset_env();
        env::remove_var("DATABASE_URL");
        assert!(matches!(Config::from_env(), Err(AppError::Config(_))));

        reset_env();
        env::remove_var("JWT_PUBLIC_KEY_PEM");
        assert!(matches!(Config::from_env(), Err(AppError::Config(_))));

        env::set_var("JWT_PUBLIC_KEY_FILE", "/nonexistent/key.pem");
        assert!(matches!(Config::from_env(), Err(AppError::Config(_))));
        reset_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_rejected() {
        reset_env();
        env::set_var("HEARTBEAT_INTERVAL_SECS", "soon");
        assert!(matches!(Config::from_env(), Err(AppError::Config(_))));

        reset_env();
        env::set_var("HEARTBEAT_INTERVAL_SECS", "30");
        env::set_var("CLIENT_TIMEOUT_SECS", "10");
        assert!(matches!(Config::from_env(), Err(AppError::Config(_))));

        reset_env();
        env::set_var("OUTBOUND_BUFFER", "0");
        assert!(matches!(Config::from_env(), Err(AppError::Config(_))));
        reset_env();
    }

    #[test]
    fn test_test_defaults_are_valid() {
        assert!(Config::test_defaults().validate().is_ok());
    }
}
