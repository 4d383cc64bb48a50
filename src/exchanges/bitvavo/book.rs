use crate::core::types::{BookUpdate, OrderBook};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Updates kept while a snapshot is outstanding
pub const MAX_BUFFERED_UPDATES: usize = 1024;

/// Callback invoked with the local book after every applied change
pub type BookCallback = Arc<dyn Fn(&OrderBook) + Send + Sync>;

/// Synchronisation state of one market's local book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSyncState {
    /// Snapshot requested, updates are buffered
    AwaitingSnapshot,
    /// Snapshot applied, updates are applied in nonce order
    Live,
    /// A nonce gap was seen; the book must not be used
    Stale,
    /// A fresh snapshot was requested after a gap
    Resyncing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSyncOutcome {
    Applied,
    Buffered,
    Discarded,
    GapDetected { expected: u64, received: u64 },
}

/// Snapshot plus delta bookkeeping for a single market
pub struct LocalBook {
    market: String,
    state: BookSyncState,
    book: Option<OrderBook>,
    buffered: VecDeque<BookUpdate>,
    callback: BookCallback,
    subscribed: bool,
}

impl fmt::Debug for LocalBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBook")
            .field("market", &self.market)
            .field("state", &self.state)
            .field("nonce", &self.book.as_ref().map(|b| b.nonce))
            .field("buffered", &self.buffered.len())
            .field("subscribed", &self.subscribed)
            .finish()
    }
}

impl LocalBook {
    pub fn new(market: impl Into<String>, callback: BookCallback) -> Self {
        Self {
            market: market.into(),
            state: BookSyncState::AwaitingSnapshot,
            book: None,
            buffered: VecDeque::new(),
            callback,
            subscribed: false,
        }
    }

    pub fn market(&self) -> &str {
        &self.market
    }

    pub fn state(&self) -> BookSyncState {
        self.state
    }

    pub fn book(&self) -> Option<&OrderBook> {
        self.book.as_ref()
    }

    pub fn callback(&self) -> BookCallback {
        Arc::clone(&self.callback)
    }

    /// Whether the `book` channel subscription has been sent
    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn mark_subscribed(&mut self) {
        self.subscribed = true;
    }

    /// Install a snapshot and replay buffered updates that are newer than it
    pub fn apply_snapshot(&mut self, snapshot: OrderBook) -> BookSyncOutcome {
        debug!(market = %self.market, nonce = snapshot.nonce, buffered = self.buffered.len(), "Applying book snapshot");

        self.book = Some(snapshot);
        self.state = BookSyncState::Live;

        let buffered = std::mem::take(&mut self.buffered);
        for update in &buffered {
            if let outcome @ BookSyncOutcome::GapDetected { .. } = self.apply_live(update) {
                return outcome;
            }
        }
        BookSyncOutcome::Applied
    }

    pub fn apply_update(&mut self, update: &BookUpdate) -> BookSyncOutcome {
        match self.state {
            BookSyncState::AwaitingSnapshot | BookSyncState::Resyncing => {
                if self.buffered.len() == MAX_BUFFERED_UPDATES {
                    // Dropping the oldest makes the replay detect a gap
                    self.buffered.pop_front();
                }
                self.buffered.push_back(update.clone());
                BookSyncOutcome::Buffered
            }
            BookSyncState::Live => self.apply_live(update),
            BookSyncState::Stale => BookSyncOutcome::Discarded,
        }
    }

    fn apply_live(&mut self, update: &BookUpdate) -> BookSyncOutcome {
        let Some(book) = self.book.as_mut() else {
            return BookSyncOutcome::Discarded;
        };

        let expected = book.nonce + 1;
        if update.nonce == expected {
            book.apply(update);
            BookSyncOutcome::Applied
        } else if update.nonce < expected {
            BookSyncOutcome::Discarded
        } else {
            warn!(market = %self.market, expected, received = update.nonce, "Order book nonce gap");
            self.state = BookSyncState::Stale;
            BookSyncOutcome::GapDetected {
                expected,
                received: update.nonce,
            }
        }
    }

    /// Drop the current book after a gap; a new snapshot is on its way
    pub fn begin_resync(&mut self) {
        self.state = BookSyncState::Resyncing;
        self.book = None;
        self.buffered.clear();
    }

    /// Forget everything after the connection was lost
    pub fn reset(&mut self) {
        self.state = BookSyncState::AwaitingSnapshot;
        self.book = None;
        self.buffered.clear();
        self.subscribed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn local_book() -> LocalBook {
        LocalBook::new("BTC-EUR", Arc::new(|_| {}))
    }

    fn snapshot(nonce: u64) -> OrderBook {
        OrderBook::from_snapshot(
            "BTC-EUR",
            &json!({"nonce": nonce, "bids": [["100", "1"]], "asks": [["101", "1"]]}),
        )
        .unwrap()
    }

    fn update(nonce: u64, bid: &str) -> BookUpdate {
        BookUpdate::from_value(&json!({
            "market": "BTC-EUR",
            "nonce": nonce,
            "bids": [[bid, "1"]],
            "asks": []
        }))
        .unwrap()
    }

    #[test]
    fn test_consecutive_updates_apply() {
        let mut local = local_book();
        assert_eq!(local.apply_snapshot(snapshot(10)), BookSyncOutcome::Applied);
        assert_eq!(local.apply_update(&update(11, "99")), BookSyncOutcome::Applied);
        assert_eq!(local.book().unwrap().nonce, 11);
        assert_eq!(local.book().unwrap().bids.len(), 2);
    }

    #[test]
    fn test_old_updates_are_discarded() {
        let mut local = local_book();
        local.apply_snapshot(snapshot(10));
        assert_eq!(local.apply_update(&update(10, "98")), BookSyncOutcome::Discarded);
        assert_eq!(local.book().unwrap().nonce, 10);
    }

    #[test]
    fn test_gap_marks_book_stale() {
        let mut local = local_book();
        local.apply_snapshot(snapshot(10));

        assert_eq!(
            local.apply_update(&update(12, "98")),
            BookSyncOutcome::GapDetected {
                expected: 11,
                received: 12
            }
        );
        assert_eq!(local.state(), BookSyncState::Stale);
        assert_eq!(local.book().unwrap().nonce, 10);
        assert_eq!(local.apply_update(&update(13, "97")), BookSyncOutcome::Discarded);

        local.begin_resync();
        assert_eq!(local.state(), BookSyncState::Resyncing);
        assert_eq!(local.apply_update(&update(14, "96")), BookSyncOutcome::Buffered);
        assert_eq!(local.apply_snapshot(snapshot(13)), BookSyncOutcome::Applied);
        assert_eq!(local.book().unwrap().nonce, 14);
    }

    #[test]
    fn test_buffered_updates_replay_after_snapshot() {
        let mut local = local_book();
        for nonce in 9..=12 {
            assert_eq!(
                local.apply_update(&update(nonce, "98")),
                BookSyncOutcome::Buffered
            );
        }

        assert_eq!(local.apply_snapshot(snapshot(10)), BookSyncOutcome::Applied);
        assert_eq!(local.state(), BookSyncState::Live);
        assert_eq!(local.book().unwrap().nonce, 12);
    }

    #[test]
    fn test_buffered_gap_is_detected_on_replay() {
        let mut local = local_book();
        local.apply_update(&update(13, "98"));
        assert!(matches!(
            local.apply_snapshot(snapshot(10)),
            BookSyncOutcome::GapDetected { expected: 11, received: 13 }
        ));
        assert_eq!(local.state(), BookSyncState::Stale);
    }

    #[test]
    fn test_buffer_is_bounded() {
        let mut local = local_book();
        for nonce in 0..(MAX_BUFFERED_UPDATES as u64 + 10) {
            local.apply_update(&update(nonce, "98"));
        }
        assert_eq!(local.buffered.len(), MAX_BUFFERED_UPDATES);
    }

    #[test]
    fn test_reset_forgets_subscription() {
        let mut local = local_book();
        local.apply_snapshot(snapshot(10));
        local.mark_subscribed();
        local.reset();
        assert_eq!(local.state(), BookSyncState::AwaitingSnapshot);
        assert!(local.book().is_none());
        assert!(!local.is_subscribed());
    }
}
