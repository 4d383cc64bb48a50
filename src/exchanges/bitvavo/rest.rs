use crate::core::errors::ExchangeError;
use crate::core::kernel::RestClient;
use crate::core::types::OrderBook;
use crate::exchanges::bitvavo::types::ServerTime;
use serde_json::{Map, Value};
use tracing::instrument;

/// Bitvavo REST endpoints on top of a generic `RestClient`.
///
/// Responses are returned as JSON; `extra` parameters are passed through
/// unchanged.
#[derive(Debug)]
pub struct BitvavoRest<R: RestClient> {
    rest_client: R,
}

fn with_market<'a>(market: &'a str, extra: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
    let mut query = Vec::with_capacity(extra.len() + 1);
    query.push(("market", market));
    query.extend_from_slice(extra);
    query
}

impl<R: RestClient> BitvavoRest<R> {
    pub fn new(rest_client: R) -> Self {
        Self { rest_client }
    }

    pub fn rest_client(&self) -> &R {
        &self.rest_client
    }

    #[instrument(skip(self))]
    pub async fn time(&self) -> Result<ServerTime, ExchangeError> {
        self.rest_client.get_json("/time", &[], false).await
    }

    pub async fn markets(&self, market: Option<&str>) -> Result<Value, ExchangeError> {
        let query: Vec<(&str, &str)> = market.map(|m| ("market", m)).into_iter().collect();
        self.rest_client.get("/markets", &query, false).await
    }

    pub async fn assets(&self, symbol: Option<&str>) -> Result<Value, ExchangeError> {
        let query: Vec<(&str, &str)> = symbol.map(|s| ("symbol", s)).into_iter().collect();
        self.rest_client.get("/assets", &query, false).await
    }

    pub async fn book(&self, market: &str, depth: Option<u32>) -> Result<Value, ExchangeError> {
        let depth = depth.map(|d| d.to_string());
        let query: Vec<(&str, &str)> = depth.as_deref().map(|d| ("depth", d)).into_iter().collect();
        self.rest_client
            .get(&format!("/{}/book", market), &query, false)
            .await
    }

    /// Book snapshot parsed into an `OrderBook`
    pub async fn order_book(
        &self,
        market: &str,
        depth: Option<u32>,
    ) -> Result<OrderBook, ExchangeError> {
        let snapshot = self.book(market, depth).await?;
        OrderBook::from_snapshot(market, &snapshot)
            .map_err(|e| ExchangeError::DeserializationError(e.to_string()))
    }

    pub async fn public_trades(
        &self,
        market: &str,
        extra: &[(&str, &str)],
    ) -> Result<Value, ExchangeError> {
        self.rest_client
            .get(&format!("/{}/trades", market), extra, false)
            .await
    }

    pub async fn candles(
        &self,
        market: &str,
        interval: &str,
        extra: &[(&str, &str)],
    ) -> Result<Value, ExchangeError> {
        let mut query = vec![("interval", interval)];
        query.extend_from_slice(extra);
        self.rest_client
            .get(&format!("/{}/candles", market), &query, false)
            .await
    }

    pub async fn ticker_price(&self, market: Option<&str>) -> Result<Value, ExchangeError> {
        let query: Vec<(&str, &str)> = market.map(|m| ("market", m)).into_iter().collect();
        self.rest_client.get("/ticker/price", &query, false).await
    }

    pub async fn ticker_24h(&self, market: Option<&str>) -> Result<Value, ExchangeError> {
        let query: Vec<(&str, &str)> = market.map(|m| ("market", m)).into_iter().collect();
        self.rest_client.get("/ticker/24h", &query, false).await
    }

    #[instrument(skip(self))]
    pub async fn balance(&self, symbol: Option<&str>) -> Result<Value, ExchangeError> {
        let query: Vec<(&str, &str)> = symbol.map(|s| ("symbol", s)).into_iter().collect();
        self.rest_client.get("/balance", &query, true).await
    }

    pub async fn account(&self) -> Result<Value, ExchangeError> {
        self.rest_client.get("/account", &[], true).await
    }

    /// `extra` carries order fields such as `amount` or `price`
    #[instrument(skip(self, extra))]
    pub async fn place_order(
        &self,
        market: &str,
        side: &str,
        order_type: &str,
        extra: Map<String, Value>,
    ) -> Result<Value, ExchangeError> {
        let mut body = extra;
        body.insert("market".to_string(), Value::from(market));
        body.insert("side".to_string(), Value::from(side));
        body.insert("orderType".to_string(), Value::from(order_type));
        self.rest_client
            .post("/order", &Value::Object(body), true)
            .await
    }

    pub async fn get_order(&self, market: &str, order_id: &str) -> Result<Value, ExchangeError> {
        self.rest_client
            .get("/order", &[("market", market), ("orderId", order_id)], true)
            .await
    }

    /// Amend an open order; `extra` holds the fields to change
    #[instrument(skip(self, extra))]
    pub async fn update_order(
        &self,
        market: &str,
        order_id: &str,
        extra: Map<String, Value>,
    ) -> Result<Value, ExchangeError> {
        let mut body = extra;
        body.insert("market".to_string(), Value::from(market));
        body.insert("orderId".to_string(), Value::from(order_id));
        self.rest_client
            .put("/order", &Value::Object(body), true)
            .await
    }

    #[instrument(skip(self))]
    pub async fn cancel_order(&self, market: &str, order_id: &str) -> Result<Value, ExchangeError> {
        self.rest_client
            .delete("/order", &[("market", market), ("orderId", order_id)], true)
            .await
    }

    pub async fn orders_open(
        &self,
        market: Option<&str>,
        extra: &[(&str, &str)],
    ) -> Result<Value, ExchangeError> {
        let query = match market {
            Some(market) => with_market(market, extra),
            None => extra.to_vec(),
        };
        self.rest_client.get("/ordersOpen", &query, true).await
    }
}
