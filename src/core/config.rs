use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;

pub const DEFAULT_REST_URL: &str = "https://api.bitvavo.com/v2";
pub const DEFAULT_WS_URL: &str = "wss://ws.bitvavo.com/v2/";
pub const DEFAULT_ACCESS_WINDOW_MS: u64 = 10_000;

/// API credentials. Immutable once a client has been built from them.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub key: Secret<String>,
    pub secret: Secret<String>,
    pub access_window_ms: u64,
}

impl Credentials {
    pub fn new(key: String, secret: String, access_window_ms: u64) -> Self {
        Self {
            key: Secret::new(key),
            secret: Secret::new(secret),
            access_window_ms,
        }
    }

    /// Both the key and the secret are non-empty
    pub fn is_complete(&self) -> bool {
        !self.key.expose_secret().is_empty() && !self.secret.expose_secret().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub api_key: Secret<String>,
    pub api_secret: Secret<String>,
    pub access_window_ms: u64,
    pub rest_url: String,
    pub ws_url: String,
    pub debugging: bool,
}

// Never expose secrets in serialization
impl Serialize for ExchangeConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ExchangeConfig", 6)?;
        state.serialize_field("api_key", "[REDACTED]")?;
        state.serialize_field("api_secret", "[REDACTED]")?;
        state.serialize_field("access_window_ms", &self.access_window_ms)?;
        state.serialize_field("rest_url", &self.rest_url)?;
        state.serialize_field("ws_url", &self.ws_url)?;
        state.serialize_field("debugging", &self.debugging)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ExchangeConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ExchangeConfigHelper {
            #[serde(default)]
            api_key: String,
            #[serde(default)]
            api_secret: String,
            access_window_ms: Option<u64>,
            rest_url: Option<String>,
            ws_url: Option<String>,
            #[serde(default)]
            debugging: bool,
        }

        let helper = ExchangeConfigHelper::deserialize(deserializer)?;
        Ok(Self {
            api_key: Secret::new(helper.api_key),
            api_secret: Secret::new(helper.api_secret),
            access_window_ms: helper.access_window_ms.unwrap_or(DEFAULT_ACCESS_WINDOW_MS),
            rest_url: helper
                .rest_url
                .unwrap_or_else(|| DEFAULT_REST_URL.to_string()),
            ws_url: helper.ws_url.unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            debugging: helper.debugging,
        })
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self::read_only()
    }
}

impl ExchangeConfig {
    /// Create a new configuration with API credentials and default endpoints
    #[must_use]
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self {
            api_key: Secret::new(api_key),
            api_secret: Secret::new(api_secret),
            access_window_ms: DEFAULT_ACCESS_WINDOW_MS,
            rest_url: DEFAULT_REST_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            debugging: false,
        }
    }

    /// Create configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - `{PREFIX}_API_KEY`, `{PREFIX}_API_SECRET`
    /// - `{PREFIX}_ACCESS_WINDOW` (milliseconds)
    /// - `{PREFIX}_REST_URL`, `{PREFIX}_WS_URL`
    /// - `{PREFIX}_DEBUGGING` (`true`/`false`)
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let prefix = prefix.to_uppercase();
        let var = |name: &str| env::var(format!("{}_{}", prefix, name)).ok();

        let access_window_ms = match var("ACCESS_WINDOW") {
            Some(raw) => raw.parse::<u64>().map_err(|e| {
                ConfigError::InvalidConfiguration(format!(
                    "{}_ACCESS_WINDOW must be an integer: {}",
                    prefix, e
                ))
            })?,
            None => DEFAULT_ACCESS_WINDOW_MS,
        };

        Ok(Self {
            api_key: Secret::new(var("API_KEY").unwrap_or_default()),
            api_secret: Secret::new(var("API_SECRET").unwrap_or_default()),
            access_window_ms,
            rest_url: var("REST_URL").unwrap_or_else(|| DEFAULT_REST_URL.to_string()),
            ws_url: var("WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            debugging: var("DEBUGGING").is_some_and(|v| v.eq_ignore_ascii_case("true")),
        })
    }

    /// Load a `.env` file (if present) and then read the environment.
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_env_file_with_path(prefix, ".env")
    }

    #[cfg(feature = "env-file")]
    pub fn from_env_file_with_path(prefix: &str, env_file_path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(()) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {
                // No .env file; fall back to the process environment
            }
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }

        Self::from_env(prefix)
    }

    /// Configuration for public endpoints only
    #[must_use]
    pub fn read_only() -> Self {
        Self::new(String::new(), String::new())
    }

    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.api_key.expose_secret().is_empty() && !self.api_secret.expose_secret().is_empty()
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(
            self.api_key.expose_secret().clone(),
            self.api_secret.expose_secret().clone(),
            self.access_window_ms,
        )
    }

    #[must_use]
    pub const fn access_window_ms(mut self, access_window_ms: u64) -> Self {
        self.access_window_ms = access_window_ms;
        self
    }

    #[must_use]
    pub fn rest_url(mut self, rest_url: String) -> Self {
        self.rest_url = rest_url;
        self
    }

    #[must_use]
    pub fn ws_url(mut self, ws_url: String) -> Self {
        self.ws_url = ws_url;
        self
    }

    #[must_use]
    pub const fn debugging(mut self, debugging: bool) -> Self {
        self.debugging = debugging;
        self
    }

    /// Get API key (use carefully - exposes secret)
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_has_no_credentials() {
        let config = ExchangeConfig::read_only();
        assert!(!config.has_credentials());
        assert!(!config.credentials().is_complete());
        assert_eq!(config.rest_url, DEFAULT_REST_URL);
        assert_eq!(config.ws_url, DEFAULT_WS_URL);
        assert_eq!(config.access_window_ms, DEFAULT_ACCESS_WINDOW_MS);
    }

    #[test]
    fn test_half_credentials_are_incomplete() {
        let config = ExchangeConfig::new("key".to_string(), String::new());
        assert!(!config.has_credentials());
    }

    #[test]
    fn test_serialization_redacts_secrets() {
        let config = ExchangeConfig::new("my-key".to_string(), "my-secret".to_string())
            .access_window_ms(5_000);
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("my-key"));
        assert!(!json.contains("my-secret"));
        assert!(json.contains("[REDACTED]"));
        assert!(json.contains("5000"));
    }

    #[test]
    fn test_deserialize_applies_defaults() {
        let config: ExchangeConfig =
            serde_json::from_str(r#"{"api_key":"k","api_secret":"s"}"#).unwrap();
        assert!(config.has_credentials());
        assert_eq!(config.access_window_ms, DEFAULT_ACCESS_WINDOW_MS);
        assert_eq!(config.ws_url, DEFAULT_WS_URL);
        assert!(!config.debugging);
    }

    #[test]
    fn test_from_env_reads_prefixed_variables() {
        env::set_var("VAVOXTEST_API_KEY", "env-key");
        env::set_var("VAVOXTEST_API_SECRET", "env-secret");
        env::set_var("VAVOXTEST_ACCESS_WINDOW", "2500");
        env::set_var("VAVOXTEST_DEBUGGING", "TRUE");

        let config = ExchangeConfig::from_env("vavoxtest").unwrap();
        assert_eq!(config.api_key(), "env-key");
        assert_eq!(config.access_window_ms, 2500);
        assert!(config.debugging);

        env::set_var("VAVOXTEST_ACCESS_WINDOW", "soon");
        assert!(ExchangeConfig::from_env("vavoxtest").is_err());
    }
}
