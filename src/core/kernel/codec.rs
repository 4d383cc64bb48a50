use crate::core::errors::ExchangeError;
use tokio_tungstenite::tungstenite::Message;

/// Wire format of one streaming API.
///
/// Only data frames reach the codec; ping, pong and close are answered by the
/// session's receive loop.
pub trait WsCodec: Send + Sync + 'static {
    /// Channel descriptor as the exchange expects it in `subscribe`
    type Subscription;

    type Message: Send;

    fn encode_subscription(
        &self,
        subscriptions: &[Self::Subscription],
    ) -> Result<Message, ExchangeError>;

    fn encode_unsubscription(
        &self,
        subscriptions: &[Self::Subscription],
    ) -> Result<Message, ExchangeError>;

    /// `Ok(None)` for frames that carry nothing to route.
    /// Malformed JSON is a `ProtocolError`.
    fn decode_message(&self, message: Message) -> Result<Option<Self::Message>, ExchangeError>;
}
