use crate::core::errors::ExchangeError;
use crate::core::kernel::signer::current_timestamp_millis;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Budget restored once the server-announced reset time has passed
pub const DEFAULT_RATE_LIMIT_BUDGET: i64 = 1000;

/// Error code the exchange uses when a key or IP is banned for exceeding the budget
pub const RATE_LIMIT_ERROR_CODE: i64 = 105;

/// Ban length assumed when the reset time cannot be read from the error message
const FALLBACK_BAN_WINDOW_MS: u64 = 60_000;

/// What a transport does when the budget is exhausted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RateLimitPolicy {
    /// Fail with `ExchangeError::RateLimitExceeded`
    #[default]
    Refuse,
    /// Sleep until the reset deadline, then proceed
    Wait,
}

#[derive(Debug)]
struct GovernorState {
    remaining: AtomicI64,
    reset_at: AtomicU64,
    /// Expiry of the latest error-105 ban, 0 if none was reported
    banned_until: AtomicU64,
    timer_active: AtomicBool,
    timers_started: AtomicU64,
    default_budget: i64,
}

impl GovernorState {
    fn is_banned(&self, now: u64) -> bool {
        self.banned_until.load(Ordering::Acquire) > now
    }

    /// Tail of the reset timer, run once `target` has passed and no later
    /// deadline was seen. Returns the deadline to keep sleeping until when a
    /// ban arrived while the flag was still held.
    fn finish_timer(&self, target: u64) -> Option<u64> {
        self.remaining
            .store(self.default_budget, Ordering::Release);
        self.timer_active.store(false, Ordering::Release);

        // A deadline recorded before the flag was cleared lost its CAS
        let latest = self.reset_at.load(Ordering::Acquire);
        if latest > target
            && self
                .timer_active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Some(latest);
        }
        None
    }
}

/// Tracks the server-imposed request budget shared by the REST and socket
/// transports of one client.
///
/// Cloning yields another handle to the same state; separate clients should
/// each build their own governor.
#[derive(Debug, Clone)]
pub struct RateLimitGovernor {
    state: Arc<GovernorState>,
}

impl Default for RateLimitGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitGovernor {
    pub fn new() -> Self {
        Self::with_default_budget(DEFAULT_RATE_LIMIT_BUDGET)
    }

    pub fn with_default_budget(default_budget: i64) -> Self {
        Self {
            state: Arc::new(GovernorState {
                remaining: AtomicI64::new(default_budget),
                reset_at: AtomicU64::new(0),
                banned_until: AtomicU64::new(0),
                timer_active: AtomicBool::new(false),
                timers_started: AtomicU64::new(0),
                default_budget,
            }),
        }
    }

    /// Remaining budget as last reported by the server, 0 while a ban is in
    /// force. Never blocks.
    pub fn remaining_budget(&self) -> i64 {
        if self.state.is_banned(current_timestamp_millis()) {
            return 0;
        }
        self.state.remaining.load(Ordering::Acquire)
    }

    /// Epoch millis at which the budget resets, 0 if never reported
    pub fn reset_at(&self) -> u64 {
        self.state.reset_at.load(Ordering::Acquire)
    }

    pub fn is_timer_active(&self) -> bool {
        self.state.timer_active.load(Ordering::Acquire)
    }

    /// Total number of reset timers spawned over the governor's lifetime
    pub fn timers_started(&self) -> u64 {
        self.state.timers_started.load(Ordering::Relaxed)
    }

    /// Record the rate-limit headers of a response.
    ///
    /// Deadlines only move forward, and a ban is never lifted by headers: a
    /// late response to a request sent before the ban carries older values.
    pub fn record_headers(&self, remaining: Option<i64>, reset_at: Option<u64>) {
        if let Some(remaining) = remaining {
            if !self.state.is_banned(current_timestamp_millis()) {
                self.state
                    .remaining
                    .store(remaining.max(0), Ordering::Release);
            }
        }

        if let Some(reset_at) = reset_at {
            self.state.reset_at.fetch_max(reset_at, Ordering::AcqRel);
            self.schedule_reset();
        }

        debug!(
            remaining = self.remaining_budget(),
            reset_at = self.reset_at(),
            "Rate limit headers recorded"
        );
    }

    /// Record an error code reported by the exchange.
    ///
    /// Returns `true` when the error was a rate-limit ban, in which case the
    /// budget is forced to zero until the reset time embedded in `message`.
    pub fn record_error(&self, code: i64, message: &str) -> bool {
        if code != RATE_LIMIT_ERROR_CODE {
            return false;
        }

        let reset_at = parse_ban_expiry(message)
            .unwrap_or_else(|| current_timestamp_millis() + FALLBACK_BAN_WINDOW_MS);

        warn!(reset_at, "Rate limit exceeded, refusing requests until reset");

        // Deadlines first, so a timer finishing concurrently sees them
        self.state.banned_until.fetch_max(reset_at, Ordering::AcqRel);
        self.state.reset_at.fetch_max(reset_at, Ordering::AcqRel);
        self.state.remaining.store(0, Ordering::Release);
        self.schedule_reset();
        true
    }

    /// Inspect a decoded error body (`{"errorCode": .., "error": ".."}`)
    pub fn record_error_body(&self, body: &Value) -> bool {
        let Some(code) = body.get("errorCode").and_then(Value::as_i64) else {
            return false;
        };
        let message = body.get("error").and_then(Value::as_str).unwrap_or_default();
        self.record_error(code, message)
    }

    /// Gate an outgoing call against the budget
    pub async fn acquire(&self, policy: RateLimitPolicy) -> Result<(), ExchangeError> {
        loop {
            if self.remaining_budget() > 0 {
                return Ok(());
            }

            let reset_at = self
                .reset_at()
                .max(self.state.banned_until.load(Ordering::Acquire));
            let now = current_timestamp_millis();
            if reset_at <= now {
                // Deadline passed without a timer having run (no runtime, or
                // the timer is about to fire)
                self.state
                    .remaining
                    .store(self.state.default_budget, Ordering::Release);
                return Ok(());
            }

            match policy {
                RateLimitPolicy::Refuse => {
                    return Err(ExchangeError::RateLimitExceeded { reset_at });
                }
                RateLimitPolicy::Wait => {
                    debug!(wait_ms = reset_at - now, "Waiting for rate limit reset");
                    sleep(Duration::from_millis(reset_at - now)).await;
                }
            }
        }
    }

    /// Start the single reset timer unless one is already running
    fn schedule_reset(&self) {
        if self
            .state
            .timer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.state.timer_active.store(false, Ordering::Release);
            debug!("No runtime for the reset timer, budget will reset lazily");
            return;
        };

        self.state.timers_started.fetch_add(1, Ordering::Relaxed);
        let state = Arc::clone(&self.state);

        handle.spawn(async move {
            let mut target = state.reset_at.load(Ordering::Acquire);
            loop {
                let delay = target.saturating_sub(current_timestamp_millis());
                if delay > 0 {
                    sleep(Duration::from_millis(delay)).await;
                }

                // A later deadline arrived while sleeping
                let latest = state.reset_at.load(Ordering::Acquire);
                if latest > target {
                    target = latest;
                    continue;
                }

                match state.finish_timer(target) {
                    Some(next) => target = next,
                    None => break,
                }
            }

            debug!(budget = state.default_budget, "Rate limit budget reset");
        });
    }
}

/// Extract the epoch millis from a ban message such as
/// `"... The ban expires at 1700000000000."`
pub fn parse_ban_expiry(message: &str) -> Option<u64> {
    let tail = message.rsplit(" at ").next()?;
    let digits: String = tail
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}
