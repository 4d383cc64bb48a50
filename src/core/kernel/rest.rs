use crate::core::config::ConfigError;
use crate::core::errors::ExchangeError;
use crate::core::kernel::rate_limit::{RateLimitGovernor, RateLimitPolicy};
use crate::core::kernel::signer::{current_timestamp_millis, Signer};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, instrument, trace};

const RATE_LIMIT_REMAINING_SUFFIX: &str = "ratelimit-remaining";
const RATE_LIMIT_RESET_AT_SUFFIX: &str = "ratelimit-resetat";

/// HTTP transport used by the endpoint wrappers.
///
/// Endpoints are given without the version prefix that is already part of the
/// base URL. Implementations sign private calls and keep the shared rate-limit
/// budget up to date.
#[async_trait]
pub trait RestClient: Send + Sync {
    /// `query_params` are sent in the given order, which is also the order
    /// they are signed in. `authenticated` calls fail with
    /// `MissingCredentials` before any I/O when no usable signer is set.
    async fn get(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<Value, ExchangeError>;

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<T, ExchangeError>;

    /// The body is serialized once; those bytes are signed and sent
    async fn post(
        &self,
        endpoint: &str,
        body: &Value,
        authenticated: bool,
    ) -> Result<Value, ExchangeError>;

    async fn post_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &Value,
        authenticated: bool,
    ) -> Result<T, ExchangeError>;

    async fn put(
        &self,
        endpoint: &str,
        body: &Value,
        authenticated: bool,
    ) -> Result<Value, ExchangeError>;

    async fn delete(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<Value, ExchangeError>;

    async fn delete_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<T, ExchangeError>;
}

#[derive(Clone, Debug)]
pub struct RestClientConfig {
    /// Including the version prefix, e.g. `https://api.bitvavo.com/v2`
    pub base_url: String,
    /// Recorded on every request span
    pub exchange_name: String,
    pub timeout_seconds: u64,
    pub user_agent: String,
    /// Behaviour when the rate-limit budget is exhausted
    pub rate_limit_policy: RateLimitPolicy,
}

impl RestClientConfig {
    pub fn new(base_url: String, exchange_name: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            exchange_name,
            timeout_seconds: 30,
            user_agent: concat!("vavox/", env!("CARGO_PKG_VERSION")).to_string(),
            rate_limit_policy: RateLimitPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_rate_limit_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit_policy = policy;
        self
    }
}

/// Assembles a [`ReqwestRest`] from its config, signer and governor
pub struct RestClientBuilder {
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
    rate_limiter: Option<RateLimitGovernor>,
}

impl RestClientBuilder {
    pub fn new(config: RestClientConfig) -> Self {
        Self {
            config,
            signer: None,
            rate_limiter: None,
        }
    }

    /// Required for `authenticated` calls
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Share a rate-limit governor with this client
    pub fn with_rate_limiter(mut self, governor: RateLimitGovernor) -> Self {
        self.rate_limiter = Some(governor);
        self
    }

    pub fn build(self) -> Result<ReqwestRest, ExchangeError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(self.config.timeout_seconds))
            .user_agent(&self.config.user_agent)
            .build()
            .map_err(|e| {
                ConfigError::InvalidConfiguration(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(ReqwestRest {
            client,
            config: self.config,
            signer: self.signer,
            rate_limiter: self.rate_limiter,
        })
    }
}

/// [`RestClient`] over a pooled reqwest client
#[derive(Clone)]
pub struct ReqwestRest {
    client: Client,
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
    rate_limiter: Option<RateLimitGovernor>,
}

impl std::fmt::Debug for ReqwestRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestRest")
            .field("config", &self.config)
            .field("has_signer", &self.signer.is_some())
            .field("rate_limiter", &self.rate_limiter)
            .finish_non_exhaustive()
    }
}

impl ReqwestRest {
    pub fn rate_limiter(&self) -> Option<&RateLimitGovernor> {
        self.rate_limiter.as_ref()
    }

    fn build_url(&self, endpoint: &str, query_string: &str) -> String {
        if query_string.is_empty() {
            format!("{}{}", self.config.base_url, endpoint)
        } else {
            format!("{}{}?{}", self.config.base_url, endpoint, query_string)
        }
    }

    /// The exact query string that is both signed and sent, form-encoded once
    fn create_query_string(params: &[(&str, &str)]) -> Result<String, ExchangeError> {
        serde_urlencoded::to_string(params).map_err(|e| {
            ExchangeError::SerializationError(format!("Failed to encode query: {}", e))
        })
    }

    fn signer_for_private_call(&self) -> Result<&Arc<dyn Signer>, ExchangeError> {
        match &self.signer {
            Some(signer) if signer.can_sign() => Ok(signer),
            _ => Err(ExchangeError::MissingCredentials(
                "API key and secret are required for private endpoints".to_string(),
            )),
        }
    }

    fn record_rate_limit_headers(&self, headers: &HeaderMap) {
        if let Some(governor) = &self.rate_limiter {
            let (remaining, reset_at) = rate_limit_from_headers(headers);
            if remaining.is_some() || reset_at.is_some() {
                governor.record_headers(remaining, reset_at);
            }
        }
    }

    /// Decode the body and turn exchange error payloads into `ApiError`
    #[instrument(skip(self, response), fields(exchange = %self.config.exchange_name, status = %response.status()))]
    async fn handle_response(&self, response: Response) -> Result<Value, ExchangeError> {
        let status = response.status();
        let response_text = response.text().await.map_err(|e| {
            ExchangeError::NetworkError(format!("Failed to read response body: {}", e))
        })?;

        trace!("Response body: {}", response_text);

        let value = if response_text.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str::<Value>(&response_text) {
                Ok(value) => value,
                Err(_) if !status.is_success() => {
                    return Err(ExchangeError::ApiError {
                        code: i32::from(status.as_u16()),
                        message: response_text,
                    });
                }
                Err(e) => {
                    return Err(ExchangeError::DeserializationError(format!(
                        "Failed to parse JSON response: {}",
                        e
                    )));
                }
            }
        };

        if let Some(code) = value.get("errorCode").and_then(Value::as_i64) {
            if let Some(governor) = &self.rate_limiter {
                governor.record_error_body(&value);
            }
            let message = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Err(ExchangeError::ApiError {
                code: i32::try_from(code).unwrap_or(i32::MAX),
                message,
            });
        }

        if status.is_success() {
            Ok(value)
        } else {
            Err(ExchangeError::ApiError {
                code: i32::from(status.as_u16()),
                message: response_text,
            })
        }
    }

    #[instrument(skip(self, body), fields(exchange = %self.config.exchange_name, method = %method, endpoint = %endpoint))]
    async fn make_request(
        &self,
        method: Method,
        endpoint: &str,
        query_params: &[(&str, &str)],
        body: &[u8],
        authenticated: bool,
    ) -> Result<Value, ExchangeError> {
        // Credentials are checked before the budget or the network are touched
        let signer = if authenticated {
            Some(self.signer_for_private_call()?)
        } else {
            None
        };

        if let Some(governor) = &self.rate_limiter {
            governor.acquire(self.config.rate_limit_policy).await?;
        }

        let query_string = Self::create_query_string(query_params)?;
        let url = self.build_url(endpoint, &query_string);
        let mut request = self.client.request(method.clone(), &url);

        if let Some(signer) = signer {
            let (headers, _) = signer.sign_request(
                method.as_str(),
                endpoint,
                &query_string,
                body,
                current_timestamp_millis(),
            )?;
            for (key, value) in headers {
                request = request.header(&key, &value);
            }
        }

        if !body.is_empty() {
            request = request
                .header("Content-Type", "application/json")
                .body(body.to_vec());
        }

        let response = request.send().await.map_err(|e| {
            error!(error = %e, "Request failed");
            ExchangeError::NetworkError(format!("Request failed: {}", e))
        })?;

        self.record_rate_limit_headers(response.headers());
        self.handle_response(response).await
    }

    fn encode_body(body: &Value) -> Result<Vec<u8>, ExchangeError> {
        serde_json::to_vec(body).map_err(|e| {
            ExchangeError::SerializationError(format!("Failed to serialize request body: {}", e))
        })
    }

    fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ExchangeError> {
        serde_json::from_value(value).map_err(|e| {
            ExchangeError::DeserializationError(format!("Failed to deserialize JSON: {}", e))
        })
    }
}

#[async_trait]
impl RestClient for ReqwestRest {
    #[instrument(skip(self, query_params), fields(exchange = %self.config.exchange_name, endpoint = %endpoint, param_count = query_params.len()))]
    async fn get(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<Value, ExchangeError> {
        self.make_request(Method::GET, endpoint, query_params, &[], authenticated)
            .await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<T, ExchangeError> {
        self.get(endpoint, query_params, authenticated)
            .await
            .and_then(Self::decode)
    }

    #[instrument(skip(self, body), fields(exchange = %self.config.exchange_name, endpoint = %endpoint))]
    async fn post(
        &self,
        endpoint: &str,
        body: &Value,
        authenticated: bool,
    ) -> Result<Value, ExchangeError> {
        let body_bytes = Self::encode_body(body)?;
        self.make_request(Method::POST, endpoint, &[], &body_bytes, authenticated)
            .await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &Value,
        authenticated: bool,
    ) -> Result<T, ExchangeError> {
        self.post(endpoint, body, authenticated)
            .await
            .and_then(Self::decode)
    }

    #[instrument(skip(self, body), fields(exchange = %self.config.exchange_name, endpoint = %endpoint))]
    async fn put(
        &self,
        endpoint: &str,
        body: &Value,
        authenticated: bool,
    ) -> Result<Value, ExchangeError> {
        let body_bytes = Self::encode_body(body)?;
        self.make_request(Method::PUT, endpoint, &[], &body_bytes, authenticated)
            .await
    }

    #[instrument(skip(self, query_params), fields(exchange = %self.config.exchange_name, endpoint = %endpoint, param_count = query_params.len()))]
    async fn delete(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<Value, ExchangeError> {
        self.make_request(Method::DELETE, endpoint, query_params, &[], authenticated)
            .await
    }

    async fn delete_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<T, ExchangeError> {
        self.delete(endpoint, query_params, authenticated)
            .await
            .and_then(Self::decode)
    }
}

/// Read the remaining budget and reset time from response headers.
///
/// Header names are matched by suffix, ignoring case.
pub fn rate_limit_from_headers(headers: &HeaderMap) -> (Option<i64>, Option<u64>) {
    let mut remaining = None;
    let mut reset_at = None;

    for (name, value) in headers {
        let name = name.as_str().to_ascii_lowercase();
        let Ok(value) = value.to_str() else {
            continue;
        };
        if name.ends_with(RATE_LIMIT_REMAINING_SUFFIX) {
            remaining = value.trim().parse().ok();
        } else if name.ends_with(RATE_LIMIT_RESET_AT_SUFFIX) {
            reset_at = value.trim().parse().ok();
        }
    }

    (remaining, reset_at)
}
