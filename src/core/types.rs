use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::str::FromStr;
use thiserror::Error;

/// Typed errors for the types subsystem
#[derive(Error, Debug)]
pub enum TypesError {
    #[error("Invalid price: {0}")]
    InvalidPrice(#[from] rust_decimal::Error),
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Parsing error: {0}")]
    ParseError(String),
}

/// One price level of an order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

impl BookLevel {
    pub fn new(price: Decimal, amount: Decimal) -> Self {
        Self { price, amount }
    }

    /// Parse the wire form `["price", "amount"]`
    pub fn from_value(value: &Value) -> Result<Self, TypesError> {
        let pair = value
            .as_array()
            .filter(|pair| pair.len() >= 2)
            .ok_or_else(|| TypesError::ParseError(format!("Invalid book level: {}", value)))?;

        Ok(Self {
            price: decimal_from_value(&pair[0])?,
            amount: decimal_from_value(&pair[1])?,
        })
    }
}

fn decimal_from_value(value: &Value) -> Result<Decimal, TypesError> {
    match value {
        Value::String(s) => Ok(Decimal::from_str(s)?),
        Value::Number(n) => Ok(Decimal::from_str(&n.to_string())?),
        other => Err(TypesError::ParseError(format!(
            "Expected decimal, got {}",
            other
        ))),
    }
}

fn levels_from_value(value: Option<&Value>) -> Result<Vec<BookLevel>, TypesError> {
    value
        .and_then(Value::as_array)
        .map(|levels| levels.iter().map(BookLevel::from_value).collect())
        .unwrap_or_else(|| Ok(Vec::new()))
}

fn nonce_from_value(value: &Value) -> Result<u64, TypesError> {
    value
        .get("nonce")
        .and_then(Value::as_u64)
        .ok_or(TypesError::MissingField("nonce"))
}

/// Incremental book change as streamed on the `book` channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookUpdate {
    pub market: String,
    pub nonce: u64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl BookUpdate {
    pub fn from_value(value: &Value) -> Result<Self, TypesError> {
        Ok(Self {
            market: value
                .get("market")
                .and_then(Value::as_str)
                .ok_or(TypesError::MissingField("market"))?
                .to_string(),
            nonce: nonce_from_value(value)?,
            bids: levels_from_value(value.get("bids"))?,
            asks: levels_from_value(value.get("asks"))?,
        })
    }
}

/// Local copy of a market's order book.
///
/// Bids are kept in descending and asks in ascending price order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBook {
    pub market: String,
    pub nonce: u64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    /// Build a book from a `getBook` response. The response does not always
    /// carry the market, so the requested one is passed in.
    pub fn from_snapshot(market: &str, value: &Value) -> Result<Self, TypesError> {
        let mut book = Self {
            market: market.to_string(),
            nonce: nonce_from_value(value)?,
            bids: levels_from_value(value.get("bids"))?,
            asks: levels_from_value(value.get("asks"))?,
        };
        book.bids.sort_by(|a, b| b.price.cmp(&a.price));
        book.asks.sort_by(|a, b| a.price.cmp(&b.price));
        Ok(book)
    }

    /// Apply a delta without any sequencing checks.
    pub fn apply(&mut self, update: &BookUpdate) {
        for level in &update.bids {
            upsert_level(&mut self.bids, *level, |a, b| b.cmp(a));
        }
        for level in &update.asks {
            upsert_level(&mut self.asks, *level, |a, b| a.cmp(b));
        }
        self.nonce = update.nonce;
    }

    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }
}

// A zero amount removes the level
fn upsert_level<F>(levels: &mut Vec<BookLevel>, level: BookLevel, order: F)
where
    F: Fn(&Decimal, &Decimal) -> Ordering,
{
    match levels.binary_search_by(|existing| order(&existing.price, &level.price)) {
        Ok(idx) if level.amount.is_zero() => {
            levels.remove(idx);
        }
        Ok(idx) => levels[idx].amount = level.amount,
        Err(_) if level.amount.is_zero() => {}
        Err(idx) => levels.insert(idx, level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromPrimitive;
    use serde_json::json;

    fn dec(v: f64) -> Decimal {
        Decimal::from_f64(v).unwrap()
    }

    fn snapshot() -> OrderBook {
        OrderBook::from_snapshot(
            "BTC-EUR",
            &json!({
                "nonce": 10,
                "bids": [["99", "1"], ["100", "2"]],
                "asks": [["102", "1"], ["101", "3"]]
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let book = snapshot();
        assert_eq!(book.nonce, 10);
        assert_eq!(book.best_bid().unwrap().price, dec(100.0));
        assert_eq!(book.best_ask().unwrap().price, dec(101.0));
    }

    #[test]
    fn test_apply_inserts_updates_and_removes() {
        let mut book = snapshot();
        let update = BookUpdate::from_value(&json!({
            "event": "book",
            "market": "BTC-EUR",
            "nonce": 11,
            "bids": [["100.5", "4"], ["99", "0"]],
            "asks": [["101", "0.5"]]
        }))
        .unwrap();

        book.apply(&update);

        assert_eq!(book.nonce, 11);
        let bid_prices: Vec<_> = book.bids.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![dec(100.5), dec(100.0)]);
        assert_eq!(book.best_ask().unwrap().amount, dec(0.5));
    }

    #[test]
    fn test_removing_unknown_level_is_noop() {
        let mut book = snapshot();
        let update = BookUpdate {
            market: "BTC-EUR".to_string(),
            nonce: 11,
            bids: vec![BookLevel::new(dec(50.0), Decimal::ZERO)],
            asks: vec![],
        };
        book.apply(&update);
        assert_eq!(book.bids.len(), 2);
    }

    #[test]
    fn test_update_requires_nonce() {
        let err = BookUpdate::from_value(&json!({"market": "BTC-EUR", "bids": []}));
        assert!(matches!(err, Err(TypesError::MissingField("nonce"))));
    }
}
