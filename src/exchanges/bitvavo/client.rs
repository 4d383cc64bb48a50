use crate::core::errors::ExchangeError;
use crate::core::kernel::{RateLimitGovernor, ReqwestRest};
use crate::exchanges::bitvavo::rest::BitvavoRest;
use crate::exchanges::bitvavo::session::{SessionState, StreamSession};

/// REST endpoints and one streaming session sharing a single rate-limit budget
#[derive(Debug)]
pub struct BitvavoClient {
    rest: BitvavoRest<ReqwestRest>,
    session: StreamSession,
    governor: RateLimitGovernor,
    has_credentials: bool,
}

impl BitvavoClient {
    pub(crate) fn new(
        rest: BitvavoRest<ReqwestRest>,
        session: StreamSession,
        governor: RateLimitGovernor,
        has_credentials: bool,
    ) -> Self {
        Self {
            rest,
            session,
            governor,
            has_credentials,
        }
    }

    pub fn rest(&self) -> &BitvavoRest<ReqwestRest> {
        &self.rest
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    pub fn governor(&self) -> &RateLimitGovernor {
        &self.governor
    }

    pub fn remaining_budget(&self) -> i64 {
        self.governor.remaining_budget()
    }

    pub fn has_credentials(&self) -> bool {
        self.has_credentials
    }

    /// Connect the streaming session and wait until it is usable.
    ///
    /// With credentials this waits for the authentication acknowledgment.
    pub async fn connect(&self, wait: std::time::Duration) -> Result<(), ExchangeError> {
        self.session.connect().await?;
        let target = if self.has_credentials {
            SessionState::Authenticated
        } else {
            SessionState::Connected
        };
        self.session.wait_for_state(target, wait).await
    }

    pub async fn close(&self) -> Result<(), ExchangeError> {
        self.session.close().await
    }

    pub async fn dispose(&self) {
        self.session.dispose().await;
    }
}
