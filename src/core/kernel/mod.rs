/// Transport kernel shared by the REST and streaming clients
///
/// The kernel holds exchange-agnostic transport logic only: request signing,
/// the HTTP client, socket connection setup, the codec seam and the
/// rate-limit governor that both transports report into.
///
/// # Components
///
/// - `RestClient` / `ReqwestRest`: HTTP transport with signing and budget tracking
/// - `Signer` / `HmacSigner`: HMAC-SHA256 request authentication
/// - `RateLimitGovernor`: server-driven request budget with a single reset timer
/// - `WsCodec`: exchange-specific frame encoding/decoding
/// - `ws::connect`: socket setup with a connect timeout
///
/// # Example
///
/// ```rust,no_run
/// use vavox::core::config::ExchangeConfig;
/// use vavox::core::kernel::*;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ExchangeConfig::from_env("BITVAVO")?;
/// let governor = RateLimitGovernor::new();
/// let signer = Arc::new(HmacSigner::new(config.credentials()));
///
/// let rest = RestClientBuilder::new(RestClientConfig::new(
///     config.rest_url.clone(),
///     "bitvavo".to_string(),
/// ))
/// .with_signer(signer)
/// .with_rate_limiter(governor.clone())
/// .build()?;
///
/// let time = rest.get("/time", &[], false).await?;
/// println!("{} (budget left: {})", time, governor.remaining_budget());
/// # Ok(())
/// # }
/// ```
pub mod codec;
pub mod rate_limit;
pub mod rest;
pub mod signer;
pub mod ws;

// Re-export key types for convenience
pub use codec::WsCodec;
pub use rate_limit::{RateLimitGovernor, RateLimitPolicy, DEFAULT_RATE_LIMIT_BUDGET};
pub use rest::{ReqwestRest, RestClient, RestClientBuilder, RestClientConfig};
pub use signer::{HmacSigner, SignatureResult, Signer};
pub use ws::WsConfig;
