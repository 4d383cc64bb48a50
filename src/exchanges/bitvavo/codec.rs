use crate::core::errors::ExchangeError;
use crate::core::kernel::codec::WsCodec;
use crate::exchanges::bitvavo::types::{Channel, ChannelSubscription, SubscriptionKey};
use serde_json::{json, Map, Value};
use tokio_tungstenite::tungstenite::Message;

/// A subscription event addressed to one registry entry
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub key: SubscriptionKey,
    pub payload: Value,
}

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum BitvavoMessage {
    /// Positive `authenticate` acknowledgment
    Authenticated,
    /// Negative `authenticate` acknowledgment
    AuthenticationFailed(String),
    /// Reply to an action
    Reply {
        action: String,
        request_id: Option<u64>,
        response: Value,
    },
    /// Error reply, with the failing action when the server names it
    ActionError {
        action: Option<String>,
        request_id: Option<u64>,
        code: i64,
        message: String,
    },
    /// One or more subscription events
    Events(Vec<StreamEvent>),
    Subscribed(Value),
    Unsubscribed(Value),
    /// Anything the session does not know how to route
    Unknown(Value),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BitvavoCodec;

impl BitvavoCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode a request/response action. `params` are merged into the frame
    /// next to `action` and the optional `requestId`.
    pub fn encode_action(
        &self,
        action: &str,
        request_id: Option<u64>,
        params: Map<String, Value>,
    ) -> Result<Message, ExchangeError> {
        let mut frame = params;
        frame.insert("action".to_string(), Value::String(action.to_string()));
        if let Some(request_id) = request_id {
            frame.insert("requestId".to_string(), Value::from(request_id));
        }

        serde_json::to_string(&frame)
            .map(Message::Text)
            .map_err(|e| ExchangeError::SerializationError(e.to_string()))
    }

    /// The signed `authenticate` action
    pub fn encode_authenticate(
        &self,
        key: &str,
        signature: &str,
        timestamp: u64,
        window: u64,
    ) -> Message {
        Message::Text(
            json!({
                "action": "authenticate",
                "key": key,
                "signature": signature,
                "timestamp": timestamp,
                "window": window,
            })
            .to_string(),
        )
    }

    fn encode_channels(
        action: &str,
        subscriptions: &[ChannelSubscription],
    ) -> Result<Message, ExchangeError> {
        let frame = json!({
            "action": action,
            "channels": subscriptions,
        });
        Ok(Message::Text(frame.to_string()))
    }

    /// Classify a decoded JSON frame
    pub fn classify(&self, value: Value) -> BitvavoMessage {
        let request_id = value.get("requestId").and_then(Value::as_u64);
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(code) = value.get("errorCode").and_then(Value::as_i64) {
            let message = string_field(&value, "error").unwrap_or_default();
            if action.as_deref() == Some("authenticate") {
                return BitvavoMessage::AuthenticationFailed(format!("{} - {}", code, message));
            }
            return BitvavoMessage::ActionError {
                action,
                request_id,
                code,
                message,
            };
        }

        if let Some(event) = value.get("event").and_then(Value::as_str) {
            match event {
                "authenticate" => {
                    return if value.get("authenticated").and_then(Value::as_bool) == Some(true) {
                        BitvavoMessage::Authenticated
                    } else {
                        BitvavoMessage::AuthenticationFailed(
                            string_field(&value, "error")
                                .unwrap_or_else(|| "authentication rejected".to_string()),
                        )
                    };
                }
                "subscribed" => {
                    return BitvavoMessage::Subscribed(
                        value.get("subscriptions").cloned().unwrap_or(Value::Null),
                    );
                }
                "unsubscribed" => {
                    return BitvavoMessage::Unsubscribed(
                        value.get("subscriptions").cloned().unwrap_or(Value::Null),
                    );
                }
                _ => {}
            }

            if let Some(channel) = Channel::from_event(event) {
                return match Self::events(channel, &value) {
                    Some(events) => BitvavoMessage::Events(events),
                    None => BitvavoMessage::Unknown(value),
                };
            }
            return BitvavoMessage::Unknown(value);
        }

        match (action, value.get("response")) {
            (Some(action), Some(response)) => BitvavoMessage::Reply {
                action,
                request_id,
                response: response.clone(),
            },
            _ => BitvavoMessage::Unknown(value),
        }
    }

    fn events(channel: Channel, value: &Value) -> Option<Vec<StreamEvent>> {
        // ticker24h batches several markets into `data`
        if channel == Channel::Ticker24h {
            let items = value.get("data")?.as_array()?;
            return Some(
                items
                    .iter()
                    .filter_map(|item| {
                        let market = string_field(item, "market")?;
                        Some(StreamEvent {
                            key: SubscriptionKey::new(channel, market),
                            payload: item.clone(),
                        })
                    })
                    .collect(),
            );
        }

        let market = string_field(value, "market")?;
        let mut key = SubscriptionKey::new(channel, market);
        if channel == Channel::Candles {
            key = key.with_sub_key(string_field(value, "interval")?);
        }

        Some(vec![StreamEvent {
            key,
            payload: value.clone(),
        }])
    }
}

fn string_field(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_string)
}

impl WsCodec for BitvavoCodec {
    type Subscription = ChannelSubscription;
    type Message = BitvavoMessage;

    fn encode_subscription(
        &self,
        subscriptions: &[ChannelSubscription],
    ) -> Result<Message, ExchangeError> {
        Self::encode_channels("subscribe", subscriptions)
    }

    fn encode_unsubscription(
        &self,
        subscriptions: &[ChannelSubscription],
    ) -> Result<Message, ExchangeError> {
        Self::encode_channels("unsubscribe", subscriptions)
    }

    fn decode_message(&self, message: Message) -> Result<Option<Self::Message>, ExchangeError> {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8(bytes).map_err(|e| {
                ExchangeError::ProtocolError(format!("Binary frame is not UTF-8: {}", e))
            })?,
            _ => return Ok(None),
        };

        let value: Value = serde_json::from_str(&text).map_err(|e| {
            ExchangeError::ProtocolError(format!("Malformed frame: {} ({})", e, text))
        })?;

        Ok(Some(self.classify(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(text: &str) -> BitvavoMessage {
        BitvavoCodec::new()
            .decode_message(Message::Text(text.to_string()))
            .unwrap()
            .unwrap()
    }

    fn frame_json(message: Message) -> Value {
        match message {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("Unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_encode_action_merges_params() {
        let mut params = Map::new();
        params.insert("market".to_string(), json!("BTC-EUR"));
        let frame = BitvavoCodec::new()
            .encode_action("getBook", Some(7), params)
            .unwrap();
        assert_eq!(
            frame_json(frame),
            json!({"action": "getBook", "market": "BTC-EUR", "requestId": 7})
        );
    }

    #[test]
    fn test_encode_subscription() {
        let subscription =
            ChannelSubscription::from(&SubscriptionKey::new(Channel::Ticker, "BTC-EUR"));
        let frame = BitvavoCodec::new()
            .encode_subscription(&[subscription])
            .unwrap();
        assert_eq!(
            frame_json(frame),
            json!({"action": "subscribe", "channels": [{"name": "ticker", "markets": ["BTC-EUR"]}]})
        );
    }

    #[test]
    fn test_decode_reply_and_error() {
        assert_eq!(
            decode(r#"{"action":"getTime","requestId":3,"response":{"time":1}}"#),
            BitvavoMessage::Reply {
                action: "getTime".to_string(),
                request_id: Some(3),
                response: json!({"time": 1}),
            }
        );
        assert_eq!(
            decode(r#"{"action":"privateGetBalance","errorCode":105,"error":"banned"}"#),
            BitvavoMessage::ActionError {
                action: Some("privateGetBalance".to_string()),
                request_id: None,
                code: 105,
                message: "banned".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_authentication() {
        assert_eq!(
            decode(r#"{"event":"authenticate","authenticated":true}"#),
            BitvavoMessage::Authenticated
        );
        assert!(matches!(
            decode(r#"{"action":"authenticate","errorCode":302,"error":"bad signature"}"#),
            BitvavoMessage::AuthenticationFailed(_)
        ));
    }

    #[test]
    fn test_decode_events() {
        match decode(r#"{"event":"candle","market":"BTC-EUR","interval":"1m","candle":[]}"#) {
            BitvavoMessage::Events(events) => {
                assert_eq!(
                    events[0].key,
                    SubscriptionKey::new(Channel::Candles, "BTC-EUR").with_sub_key("1m")
                );
            }
            other => panic!("Unexpected {:?}", other),
        }

        match decode(
            r#"{"event":"ticker24h","data":[{"market":"BTC-EUR"},{"market":"ETH-EUR"}]}"#,
        ) {
            BitvavoMessage::Events(events) => {
                let markets: Vec<_> = events.iter().map(|e| e.key.market.as_str()).collect();
                assert_eq!(markets, vec!["BTC-EUR", "ETH-EUR"]);
            }
            other => panic!("Unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_malformed_frames() {
        assert!(matches!(
            decode(r#"{"event":"mystery"}"#),
            BitvavoMessage::Unknown(_)
        ));
        assert!(matches!(
            decode(r#"{"event":"ticker"}"#),
            BitvavoMessage::Unknown(_)
        ));
        assert!(matches!(
            BitvavoCodec::new().decode_message(Message::Text("{not json".to_string())),
            Err(ExchangeError::ProtocolError(_))
        ));
        assert!(BitvavoCodec::new()
            .decode_message(Message::Pong(Vec::new()))
            .unwrap()
            .is_none());
    }
}
