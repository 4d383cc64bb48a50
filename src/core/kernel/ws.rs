use crate::core::errors::ExchangeError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, instrument};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsWriter = SplitSink<WsStream, Message>;
pub type WsReader = SplitStream<WsStream>;

/// WebSocket transport configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// How long `close` waits for the server to acknowledge the close frame
    pub close_grace_ms: u64,
    /// Lifetime of a request awaiting its reply
    pub request_timeout_ms: u64,
    /// Interval at which expired requests are swept
    pub sweep_interval_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            close_grace_ms: 1_000,
            request_timeout_ms: 10_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl WsConfig {
    pub fn with_connect_timeout(mut self, connect_timeout_ms: u64) -> Self {
        self.connect_timeout_ms = connect_timeout_ms;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout_ms: u64) -> Self {
        self.request_timeout_ms = request_timeout_ms;
        self
    }

    pub fn with_close_grace(mut self, close_grace_ms: u64) -> Self {
        self.close_grace_ms = close_grace_ms;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval_ms: u64) -> Self {
        self.sweep_interval_ms = sweep_interval_ms;
        self
    }
}

/// Open a socket and split it into its write and read halves
#[instrument(skip(config), fields(url = %url))]
pub async fn connect(url: &str, config: &WsConfig) -> Result<(WsWriter, WsReader), ExchangeError> {
    let connect_timeout = Duration::from_millis(config.connect_timeout_ms);

    let (stream, _) = timeout(connect_timeout, connect_async(url))
        .await
        .map_err(|_| {
            error!(timeout_ms = config.connect_timeout_ms, "WebSocket connect timed out");
            ExchangeError::ConnectionTimeout(format!(
                "Connection to {} timed out after {}ms",
                url, config.connect_timeout_ms
            ))
        })?
        .map_err(|e| {
            error!(error = %e, "WebSocket connect failed");
            ExchangeError::NetworkError(format!("WebSocket connection failed: {}", e))
        })?;

    info!("WebSocket connected");
    Ok(stream.split())
}
