use crate::core::config::ExchangeConfig;
use crate::core::errors::ExchangeError;
use crate::core::kernel::{
    HmacSigner, RateLimitGovernor, RateLimitPolicy, RestClientBuilder, RestClientConfig, WsConfig,
};
use crate::exchanges::bitvavo::client::BitvavoClient;
use crate::exchanges::bitvavo::rest::BitvavoRest;
use crate::exchanges::bitvavo::session::{StreamSession, StreamSessionConfig};
use std::sync::Arc;
use tracing::info;

const EXCHANGE_NAME: &str = "bitvavo";

/// Fluent builder for `BitvavoClient`
#[derive(Debug, Default)]
pub struct BitvavoBuilder {
    config: ExchangeConfig,
    ws_config: WsConfig,
    auto_resubscribe: Option<bool>,
    rate_limit_policy: RateLimitPolicy,
    rest_timeout_seconds: Option<u64>,
}

impl BitvavoBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: ExchangeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_credentials(mut self, api_key: String, api_secret: String) -> Self {
        self.config = ExchangeConfig::new(api_key, api_secret)
            .access_window_ms(self.config.access_window_ms)
            .rest_url(self.config.rest_url.clone())
            .ws_url(self.config.ws_url.clone())
            .debugging(self.config.debugging);
        self
    }

    pub fn with_ws_config(mut self, ws_config: WsConfig) -> Self {
        self.ws_config = ws_config;
        self
    }

    pub fn with_auto_resubscribe(mut self, auto_resubscribe: bool) -> Self {
        self.auto_resubscribe = Some(auto_resubscribe);
        self
    }

    /// Choose between refusing and waiting when the budget is exhausted
    pub fn with_rate_limit_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit_policy = policy;
        self
    }

    pub fn with_rest_timeout(mut self, timeout_seconds: u64) -> Self {
        self.rest_timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn build(self) -> Result<BitvavoClient, ExchangeError> {
        let governor = RateLimitGovernor::new();
        let has_credentials = self.config.has_credentials();
        let signer = has_credentials.then(|| Arc::new(HmacSigner::new(self.config.credentials())));

        let mut rest_config =
            RestClientConfig::new(self.config.rest_url.clone(), EXCHANGE_NAME.to_string())
                .with_rate_limit_policy(self.rate_limit_policy);
        if let Some(timeout) = self.rest_timeout_seconds {
            rest_config = rest_config.with_timeout(timeout);
        }

        let mut rest_builder =
            RestClientBuilder::new(rest_config).with_rate_limiter(governor.clone());
        if let Some(signer) = &signer {
            rest_builder = rest_builder.with_signer(signer.clone());
        }
        let rest = BitvavoRest::new(rest_builder.build()?);

        let mut session_config = StreamSessionConfig::new(self.config.ws_url.clone())
            .with_ws_config(self.ws_config)
            .with_rate_limit_policy(self.rate_limit_policy);
        if let Some(auto_resubscribe) = self.auto_resubscribe {
            session_config = session_config.with_auto_resubscribe(auto_resubscribe);
        }
        let session = StreamSession::new(session_config, signer, governor.clone());

        info!(
            rest_url = %self.config.rest_url,
            ws_url = %self.config.ws_url,
            authenticated = has_credentials,
            "Built Bitvavo client"
        );

        Ok(BitvavoClient::new(rest, session, governor, has_credentials))
    }
}

/// Build a client from configuration with default transport settings
pub fn build_client(config: ExchangeConfig) -> Result<BitvavoClient, ExchangeError> {
    BitvavoBuilder::new().with_config(config).build()
}
