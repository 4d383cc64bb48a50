use serde::{Deserialize, Serialize};
use std::fmt;

/// Streaming topics offered by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Ticker,
    Ticker24h,
    Trades,
    Candles,
    Book,
    Account,
}

impl Channel {
    /// Name used in subscribe frames
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Ticker24h => "ticker24h",
            Self::Trades => "trades",
            Self::Candles => "candles",
            Self::Book => "book",
            Self::Account => "account",
        }
    }

    /// Map the `event` field of an inbound frame to its channel
    pub fn from_event(event: &str) -> Option<Self> {
        match event {
            "ticker" => Some(Self::Ticker),
            "ticker24h" => Some(Self::Ticker24h),
            "trade" => Some(Self::Trades),
            "candle" => Some(Self::Candles),
            "book" => Some(Self::Book),
            "order" | "fill" => Some(Self::Account),
            _ => None,
        }
    }

    /// Channels that require an authenticated session
    pub const fn is_private(self) -> bool {
        matches!(self, Self::Account)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Registry key: one entry per channel, market and optional sub-key
/// (the candle interval).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub channel: Channel,
    pub market: String,
    pub sub_key: Option<String>,
}

impl SubscriptionKey {
    pub fn new(channel: Channel, market: impl Into<String>) -> Self {
        Self {
            channel,
            market: market.into(),
            sub_key: None,
        }
    }

    pub fn with_sub_key(mut self, sub_key: impl Into<String>) -> Self {
        self.sub_key = Some(sub_key.into());
        self
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sub_key {
            Some(sub_key) => write!(f, "{}:{}:{}", self.channel, self.market, sub_key),
            None => write!(f, "{}:{}", self.channel, self.market),
        }
    }
}

/// One entry of the `channels` array in subscribe/unsubscribe frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSubscription {
    #[serde(rename = "name")]
    pub channel: Channel,
    pub markets: Vec<String>,
    #[serde(rename = "interval", skip_serializing_if = "Vec::is_empty")]
    pub intervals: Vec<String>,
}

impl From<&SubscriptionKey> for ChannelSubscription {
    fn from(key: &SubscriptionKey) -> Self {
        Self {
            channel: key.channel,
            markets: vec![key.market.clone()],
            intervals: key.sub_key.iter().cloned().collect(),
        }
    }
}

/// Reply of the `time` endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ServerTime {
    pub time: u64,
}

/// Actions that need an authenticated session
pub fn is_private_action(action: &str) -> bool {
    action.starts_with("private")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names_match_wire() {
        assert_eq!(Channel::Ticker24h.name(), "ticker24h");
        assert_eq!(
            serde_json::to_value(Channel::Candles).unwrap(),
            serde_json::json!("candles")
        );
        assert_eq!(Channel::from_event("trade"), Some(Channel::Trades));
        assert_eq!(Channel::from_event("fill"), Some(Channel::Account));
        assert_eq!(Channel::from_event("subscribed"), None);
    }

    #[test]
    fn test_candle_key_serializes_interval() {
        let key = SubscriptionKey::new(Channel::Candles, "BTC-EUR").with_sub_key("1h");
        let value = serde_json::to_value(ChannelSubscription::from(&key)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"name": "candles", "markets": ["BTC-EUR"], "interval": ["1h"]})
        );
        assert_eq!(key.to_string(), "candles:BTC-EUR:1h");
    }

    #[test]
    fn test_private_detection() {
        assert!(is_private_action("privateGetBalance"));
        assert!(!is_private_action("getTime"));
        assert!(Channel::Account.is_private());
        assert!(!Channel::Book.is_private());
    }
}
