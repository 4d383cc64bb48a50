use crate::core::config::Credentials;
use crate::core::errors::ExchangeError;
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

/// Version prefix that is part of every signed path
pub const API_VERSION_PREFIX: &str = "/v2";

pub const HEADER_ACCESS_KEY: &str = "Bitvavo-Access-Key";
pub const HEADER_ACCESS_SIGNATURE: &str = "Bitvavo-Access-Signature";
pub const HEADER_ACCESS_TIMESTAMP: &str = "Bitvavo-Access-Timestamp";
pub const HEADER_ACCESS_WINDOW: &str = "Bitvavo-Access-Window";

/// Path signed by the socket `authenticate` action
pub const WEBSOCKET_AUTH_PATH: &str = "/websocket";

/// Result type for signing operations: (headers, `query_params`)
pub type SignatureResult = Result<(HashMap<String, String>, Vec<(String, String)>), ExchangeError>;

/// Signer trait for request authentication
pub trait Signer: Send + Sync {
    /// Sign a request and return headers and query parameters
    ///
    /// # Arguments
    /// * `method` - HTTP method (GET, POST, etc.)
    /// * `endpoint` - API endpoint path, without the version prefix
    /// * `query_string` - Query string (without leading '?')
    /// * `body` - Raw request body bytes
    /// * `timestamp` - Request timestamp in milliseconds
    fn sign_request(
        &self,
        method: &str,
        endpoint: &str,
        query_string: &str,
        body: &[u8],
        timestamp: u64,
    ) -> SignatureResult;

    /// Whether this signer can produce signatures at all
    fn can_sign(&self) -> bool;
}

/// HMAC-SHA256 signer over `timestamp + method + "/v2" + path + body`
#[derive(Debug, Clone)]
pub struct HmacSigner {
    credentials: Credentials,
}

impl HmacSigner {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    pub fn api_key(&self) -> &str {
        self.credentials.key.expose_secret()
    }

    pub fn access_window_ms(&self) -> u64 {
        self.credentials.access_window_ms
    }

    /// Compute the hex signature for one request.
    ///
    /// `path` includes the query string (`/book?market=BTC-EUR`) but not the
    /// version prefix. Fails when either credential is absent.
    pub fn signature(
        &self,
        timestamp: u64,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<String, ExchangeError> {
        if !self.credentials.is_complete() {
            return Err(ExchangeError::MissingCredentials(
                "API key and secret are required to sign requests".to_string(),
            ));
        }

        let payload = format!(
            "{}{}{}{}{}",
            timestamp, method, API_VERSION_PREFIX, path, body
        );

        let mut mac = HmacSha256::new_from_slice(self.credentials.secret.expose_secret().as_bytes())
            .map_err(|e| ExchangeError::AuthError(format!("Invalid secret key: {}", e)))?;
        mac.update(payload.as_bytes());

        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl Signer for HmacSigner {
    fn sign_request(
        &self,
        method: &str,
        endpoint: &str,
        query_string: &str,
        body: &[u8],
        timestamp: u64,
    ) -> SignatureResult {
        let path = if query_string.is_empty() {
            endpoint.to_string()
        } else {
            format!("{}?{}", endpoint, query_string)
        };

        let body = std::str::from_utf8(body)
            .map_err(|e| ExchangeError::AuthError(format!("Invalid body encoding: {}", e)))?;

        let signature = self.signature(timestamp, method, &path, body)?;

        let mut headers = HashMap::new();
        headers.insert(HEADER_ACCESS_KEY.to_string(), self.api_key().to_string());
        headers.insert(HEADER_ACCESS_SIGNATURE.to_string(), signature);
        headers.insert(HEADER_ACCESS_TIMESTAMP.to_string(), timestamp.to_string());
        headers.insert(
            HEADER_ACCESS_WINDOW.to_string(),
            self.access_window_ms().to_string(),
        );

        // Query parameters travel unchanged; they are already part of the signature
        let signed_params = if query_string.is_empty() {
            Vec::new()
        } else {
            query_string
                .split('&')
                .filter_map(|param| {
                    param
                        .split_once('=')
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                })
                .collect()
        };

        Ok((headers, signed_params))
    }

    fn can_sign(&self) -> bool {
        self.credentials.is_complete()
    }
}

/// Current UTC time in epoch milliseconds
pub fn current_timestamp_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer(secret: &str) -> HmacSigner {
        HmacSigner::new(Credentials::new(
            "my-key".to_string(),
            secret.to_string(),
            10_000,
        ))
    }

    #[test]
    fn test_signature_known_vector() {
        let sig = signer("secret")
            .signature(1_548_172_481_125, "GET", "/time", "")
            .unwrap();
        assert_eq!(
            sig,
            "2c28d8a8bd6db5c35a3ad0d429c96e143c99329ba5436069064561737ad404a8"
        );
    }

    #[test]
    fn test_signature_includes_body() {
        let sig = signer("bitvavo")
            .signature(
                1_548_172_481_125,
                "POST",
                "/order",
                r#"{"market":"BTC-EUR","side":"buy"}"#,
            )
            .unwrap();
        assert_eq!(
            sig,
            "1d4993e7571610e3f1827747bd3a2a0e80f0f6fbea122726a90f735f815bfa54"
        );
    }

    #[test]
    fn test_signature_is_deterministic() {
        let signer = signer("secret");
        let first = signer.signature(42, "GET", "/time", "").unwrap();
        let second = signer.signature(42, "GET", "/time", "").unwrap();
        assert_eq!(first, second);
        assert_ne!(first, signer.signature(43, "GET", "/time", "").unwrap());
    }

    #[test]
    fn test_sign_request_appends_query_to_path() {
        let (headers, params) = signer("secret")
            .sign_request("GET", "/book", "market=BTC-EUR&depth=10", &[], 1_548_172_481_125)
            .unwrap();

        assert_eq!(
            headers.get(HEADER_ACCESS_SIGNATURE).unwrap(),
            "54e803904277e712a6a767b1df52d1bdfb4fcb9510eb3c4e3d43746158514d90"
        );
        assert_eq!(headers.get(HEADER_ACCESS_KEY).unwrap(), "my-key");
        assert_eq!(headers.get(HEADER_ACCESS_TIMESTAMP).unwrap(), "1548172481125");
        assert_eq!(headers.get(HEADER_ACCESS_WINDOW).unwrap(), "10000");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_websocket_auth_signature() {
        let sig = signer("secret")
            .signature(1_548_172_481_125, "GET", WEBSOCKET_AUTH_PATH, "")
            .unwrap();
        assert_eq!(
            sig,
            "285a8b7101b126bfc7d768e5cccac03ff22f5c418ebb6bf7100519d4461da706"
        );
    }

    #[test]
    fn test_missing_secret_refuses_to_sign() {
        let signer = signer("");
        assert!(!signer.can_sign());
        let result = signer.signature(1, "GET", "/balance", "");
        assert!(matches!(result, Err(ExchangeError::MissingCredentials(_))));
    }
}
