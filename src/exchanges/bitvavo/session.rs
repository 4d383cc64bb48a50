use crate::core::errors::ExchangeError;
use crate::core::kernel::codec::WsCodec;
use crate::core::kernel::rate_limit::{RateLimitGovernor, RateLimitPolicy};
use crate::core::kernel::signer::{
    current_timestamp_millis, HmacSigner, Signer, WEBSOCKET_AUTH_PATH,
};
use crate::core::kernel::ws::{self, WsConfig, WsReader, WsWriter};
use crate::core::types::{BookUpdate, OrderBook};
use crate::exchanges::bitvavo::book::{BookSyncOutcome, BookSyncState, LocalBook};
use crate::exchanges::bitvavo::codec::{BitvavoCodec, BitvavoMessage, StreamEvent};
use crate::exchanges::bitvavo::registry::{EventCallback, SubscriptionRegistry};
use crate::exchanges::bitvavo::types::{
    is_private_action, Channel, ChannelSubscription, SubscriptionKey,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, warn};

/// Callback receiving errors that have no caller to return to
pub type ErrorCallback = Arc<dyn Fn(&ExchangeError) + Send + Sync>;

type Reply = Result<Value, ExchangeError>;

const GET_BOOK_ACTION: &str = "getBook";

/// Lifecycle of one streaming connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    /// Terminal; the session was disposed
    Closing,
}

impl SessionState {
    /// A socket is open and public traffic may flow
    pub const fn is_connected(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Authenticating | Self::Authenticated
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct StreamSessionConfig {
    pub url: String,
    pub ws: WsConfig,
    /// Re-send registry subscriptions and resync local books after reconnecting
    pub auto_resubscribe: bool,
    pub rate_limit_policy: RateLimitPolicy,
}

impl StreamSessionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ws: WsConfig::default(),
            auto_resubscribe: true,
            rate_limit_policy: RateLimitPolicy::default(),
        }
    }

    pub fn with_ws_config(mut self, ws: WsConfig) -> Self {
        self.ws = ws;
        self
    }

    pub fn with_auto_resubscribe(mut self, auto_resubscribe: bool) -> Self {
        self.auto_resubscribe = auto_resubscribe;
        self
    }

    pub fn with_rate_limit_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit_policy = policy;
        self
    }
}

enum Responder {
    Caller(oneshot::Sender<Reply>),
    BookSnapshot { market: String },
}

struct PendingCall {
    request_id: u64,
    responder: Responder,
    expires_at: Instant,
}

struct QueuedSend {
    action: String,
    request_id: Option<u64>,
    frame: Message,
}

struct ConnectionTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn params<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

struct SessionInner {
    config: StreamSessionConfig,
    codec: BitvavoCodec,
    signer: Option<Arc<HmacSigner>>,
    governor: RateLimitGovernor,
    state: watch::Sender<SessionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<HashMap<String, VecDeque<PendingCall>>>,
    private_queue: Mutex<VecDeque<QueuedSend>>,
    registry: SubscriptionRegistry,
    books: Mutex<HashMap<String, LocalBook>>,
    error_callback: Mutex<Option<ErrorCallback>>,
    tasks: Mutex<Option<ConnectionTasks>>,
    epoch: AtomicU64,
    next_request_id: AtomicU64,
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `next` unless the session was disposed; `Closing` is terminal
    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|state| {
            if *state == next || *state == SessionState::Closing {
                return false;
            }
            debug!(from = %*state, to = %next, "Session state changed");
            *state = next;
            true
        });
    }

    fn can_authenticate(&self) -> bool {
        self.signer.as_ref().is_some_and(|signer| signer.can_sign())
    }

    fn ensure_connected(&self) -> Result<(), ExchangeError> {
        match self.state() {
            SessionState::Closing => Err(ExchangeError::SessionClosed),
            state if state.is_connected() => Ok(()),
            _ => Err(ExchangeError::NotConnected),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn report_error(&self, error: &ExchangeError) {
        let callback = lock(&self.error_callback).clone();
        match callback {
            Some(callback) => callback(error),
            None => warn!(error = %error, "Unhandled session error"),
        }
    }

    fn send_frame(&self, frame: Message) -> Result<(), ExchangeError> {
        let outbound = lock(&self.outbound);
        let sender = outbound.as_ref().ok_or(ExchangeError::NotConnected)?;
        sender
            .send(frame)
            .map_err(|_| ExchangeError::ConnectionClosed)
    }

    /// Send now when authenticated, queue while the handshake is in flight.
    /// The state is read under the queue lock so a flush cannot interleave.
    fn send_private(
        &self,
        action: &str,
        request_id: Option<u64>,
        frame: Message,
    ) -> Result<(), ExchangeError> {
        let mut queue = lock(&self.private_queue);
        match self.state() {
            SessionState::Authenticated => return self.send_frame(frame),
            SessionState::Authenticating => {}
            // Connected with credentials only after a rejected handshake
            _ => {
                return Err(ExchangeError::AuthError(format!(
                    "{} requires an authenticated session",
                    action
                )))
            }
        }

        debug!(action, queued = queue.len() + 1, "Queueing private send until authenticated");
        queue.push_back(QueuedSend {
            action: action.to_string(),
            request_id,
            frame,
        });
        Ok(())
    }

    fn authenticate(&self) -> Result<(), ExchangeError> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            ExchangeError::MissingCredentials("No signer configured".to_string())
        })?;

        let timestamp = current_timestamp_millis();
        let signature = signer.signature(timestamp, "GET", WEBSOCKET_AUTH_PATH, "")?;
        let frame = self.codec.encode_authenticate(
            signer.api_key(),
            &signature,
            timestamp,
            signer.access_window_ms(),
        );

        self.set_state(SessionState::Authenticating);
        self.send_frame(frame)
    }

    fn on_authenticated(&self) {
        let failed: Vec<(String, Option<u64>, ExchangeError)> = {
            let mut queue = lock(&self.private_queue);
            self.set_state(SessionState::Authenticated);
            info!(queued = queue.len(), "Session authenticated");

            let mut failed = Vec::new();
            while let Some(queued) = queue.pop_front() {
                if let Err(e) = self.send_frame(queued.frame) {
                    failed.push((queued.action, queued.request_id, e));
                }
            }
            failed
        };

        // Callbacks run outside the queue lock
        for (action, request_id, error) in failed {
            match request_id {
                Some(id) => self.fail_pending(&action, id, error),
                None => self.report_error(&error),
            }
        }
    }

    fn on_authentication_failed(&self, reason: String) {
        error!(reason = %reason, "Authentication rejected");

        let queued: Vec<QueuedSend> = {
            let mut queue = lock(&self.private_queue);
            self.set_state(SessionState::Connected);
            queue.drain(..).collect()
        };

        for send in queued {
            if let Some(id) = send.request_id {
                self.fail_pending(&send.action, id, ExchangeError::AuthError(reason.clone()));
            }
        }
        self.report_error(&ExchangeError::AuthError(reason));
    }

    fn register_pending(&self, action: &str, request_id: u64, responder: Responder) {
        let expires_at = Instant::now() + Duration::from_millis(self.config.ws.request_timeout_ms);
        lock(&self.pending)
            .entry(action.to_string())
            .or_default()
            .push_back(PendingCall {
                request_id,
                responder,
                expires_at,
            });
    }

    /// Match by `requestId` when the server echoed one, else first in line
    fn take_pending(&self, action: &str, request_id: Option<u64>) -> Option<PendingCall> {
        let mut pending = lock(&self.pending);
        let queue = pending.get_mut(action)?;
        let call = match request_id {
            Some(id) => queue
                .iter()
                .position(|call| call.request_id == id)
                .and_then(|pos| queue.remove(pos)),
            None => queue.pop_front(),
        };
        if queue.is_empty() {
            pending.remove(action);
        }
        call
    }

    fn take_pending_by_id(&self, request_id: u64) -> Option<PendingCall> {
        let action = lock(&self.pending)
            .iter()
            .find(|(_, queue)| queue.iter().any(|call| call.request_id == request_id))
            .map(|(action, _)| action.clone())?;
        self.take_pending(&action, Some(request_id))
    }

    fn fail_pending(&self, action: &str, request_id: u64, error: ExchangeError) {
        match self.take_pending(action, Some(request_id)) {
            Some(call) => self.fulfil(call, Err(error)),
            None => self.report_error(&error),
        }
    }

    fn fulfil(&self, call: PendingCall, result: Reply) {
        match call.responder {
            Responder::Caller(tx) => {
                // The caller may have given up already
                let _ = tx.send(result);
            }
            Responder::BookSnapshot { market } => match result {
                Ok(response) => self.on_book_snapshot(&market, &response),
                Err(e) => {
                    warn!(market = %market, error = %e, "Book snapshot request failed");
                    self.report_error(&e);
                }
            },
        }
    }

    fn handle_message(&self, message: Message) {
        match self.codec.decode_message(message) {
            Ok(Some(decoded)) => self.route(decoded),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Failed to decode frame");
                self.report_error(&e);
            }
        }
    }

    fn route(&self, message: BitvavoMessage) {
        match message {
            BitvavoMessage::Authenticated => self.on_authenticated(),
            BitvavoMessage::AuthenticationFailed(reason) => self.on_authentication_failed(reason),
            BitvavoMessage::Reply {
                action,
                request_id,
                response,
            } => match self.take_pending(&action, request_id) {
                Some(call) => self.fulfil(call, Ok(response)),
                None => debug!(action = %action, ?request_id, "Reply without a pending call"),
            },
            BitvavoMessage::ActionError {
                action,
                request_id,
                code,
                message,
            } => {
                self.governor.record_error(code, &message);
                let err = ExchangeError::ApiError {
                    code: i32::try_from(code).unwrap_or(i32::MAX),
                    message,
                };
                let call = match (action.as_deref(), request_id) {
                    (Some(action), request_id) => self.take_pending(action, request_id),
                    (None, Some(request_id)) => self.take_pending_by_id(request_id),
                    (None, None) => None,
                };
                match call {
                    Some(call) => self.fulfil(call, Err(err)),
                    None => self.report_error(&err),
                }
            }
            BitvavoMessage::Events(events) => {
                for event in events {
                    self.dispatch_event(event);
                }
            }
            BitvavoMessage::Subscribed(subscriptions) => {
                debug!(%subscriptions, "Subscribed");
            }
            BitvavoMessage::Unsubscribed(subscriptions) => {
                debug!(%subscriptions, "Unsubscribed");
            }
            BitvavoMessage::Unknown(value) => {
                warn!(frame = %value, "Unrecognised frame");
                self.report_error(&ExchangeError::ProtocolError(format!(
                    "Unrecognised frame: {}",
                    value
                )));
            }
        }
    }

    fn dispatch_event(&self, event: StreamEvent) {
        let synced = event.key.channel == Channel::Book
            && self.on_book_update(&event.key.market, &event.payload);

        if !self.registry.dispatch(&event.key, &event.payload) && !synced {
            debug!(key = %event.key, "Event without a subscription");
        }
    }

    /// Feed a delta into the local book for `market`, if one is tracked
    fn on_book_update(&self, market: &str, payload: &Value) -> bool {
        if !lock(&self.books).contains_key(market) {
            return false;
        }

        let update = match BookUpdate::from_value(payload) {
            Ok(update) => update,
            Err(e) => {
                self.report_error(&ExchangeError::ProtocolError(format!(
                    "Invalid book update: {}",
                    e
                )));
                return true;
            }
        };

        let (outcome, callback, book) = {
            let mut books = lock(&self.books);
            let Some(local) = books.get_mut(market) else {
                return false;
            };
            let outcome = local.apply_update(&update);
            if let BookSyncOutcome::GapDetected { .. } = outcome {
                local.begin_resync();
            }
            let book = match outcome {
                BookSyncOutcome::Applied => local.book().cloned(),
                _ => None,
            };
            (outcome, local.callback(), book)
        };

        match outcome {
            BookSyncOutcome::Applied => {
                if let Some(book) = book {
                    callback(&book);
                }
            }
            BookSyncOutcome::GapDetected { expected, received } => {
                info!(market, expected, received, "Resynchronising order book");
                if let Err(e) = self.request_book_snapshot(market) {
                    self.report_error(&e);
                }
            }
            BookSyncOutcome::Buffered | BookSyncOutcome::Discarded => {}
        }
        true
    }

    fn on_book_snapshot(&self, market: &str, response: &Value) {
        let snapshot = match OrderBook::from_snapshot(market, response) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.report_error(&ExchangeError::ProtocolError(format!(
                    "Invalid book snapshot for {}: {}",
                    market, e
                )));
                return;
            }
        };

        let (outcome, callback, book, subscribe) = {
            let mut books = lock(&self.books);
            let Some(local) = books.get_mut(market) else {
                debug!(market, "Snapshot for a book that is no longer tracked");
                return;
            };

            let outcome = local.apply_snapshot(snapshot);
            let mut subscribe = false;
            if let BookSyncOutcome::GapDetected { .. } = outcome {
                local.begin_resync();
            } else if !local.is_subscribed() {
                local.mark_subscribed();
                subscribe = true;
            }
            (outcome, local.callback(), local.book().cloned(), subscribe)
        };

        match outcome {
            BookSyncOutcome::GapDetected { .. } => {
                if let Err(e) = self.request_book_snapshot(market) {
                    self.report_error(&e);
                }
            }
            _ => {
                if let Some(book) = book {
                    callback(&book);
                }
            }
        }

        if subscribe {
            let key = SubscriptionKey::new(Channel::Book, market);
            let sent = self
                .codec
                .encode_subscription(&[ChannelSubscription::from(&key)])
                .and_then(|frame| self.send_frame(frame));
            if let Err(e) = sent {
                self.report_error(&e);
            }
        }
    }

    fn request_book_snapshot(&self, market: &str) -> Result<(), ExchangeError> {
        let request_id = self.next_request_id();
        let frame = self.codec.encode_action(
            GET_BOOK_ACTION,
            Some(request_id),
            params([("market", json!(market))]),
        )?;

        self.register_pending(
            GET_BOOK_ACTION,
            request_id,
            Responder::BookSnapshot {
                market: market.to_string(),
            },
        );
        if let Err(e) = self.send_frame(frame) {
            self.take_pending(GET_BOOK_ACTION, Some(request_id));
            return Err(e);
        }
        Ok(())
    }

    /// Expire pending calls past their deadline
    fn sweep_expired(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut pending = lock(&self.pending);
            for (action, queue) in pending.iter_mut() {
                let (gone, keep): (VecDeque<_>, VecDeque<_>) =
                    queue.drain(..).partition(|call| call.expires_at <= now);
                *queue = keep;
                expired.extend(gone.into_iter().map(|call| (action.clone(), call)));
            }
            pending.retain(|_, queue| !queue.is_empty());
        }

        if expired.is_empty() {
            return;
        }

        lock(&self.private_queue).retain(|send| {
            send.request_id
                .map_or(true, |id| !expired.iter().any(|(_, call)| call.request_id == id))
        });

        for (action, call) in expired {
            match call.responder {
                Responder::Caller(tx) => {
                    let _ = tx.send(Err(ExchangeError::Timeout(format!(
                        "No reply to {} within {}ms",
                        action, self.config.ws.request_timeout_ms
                    ))));
                }
                Responder::BookSnapshot { market } => {
                    if lock(&self.books).contains_key(&market) {
                        warn!(market = %market, "Book snapshot timed out, requesting again");
                        if let Err(e) = self.request_book_snapshot(&market) {
                            self.report_error(&e);
                        }
                    }
                }
            }
        }
    }

    /// Re-send everything the registry and the local books need
    fn restore_subscriptions(&self) {
        let keys = self.registry.keys();
        let (private, public): (Vec<_>, Vec<_>) =
            keys.iter().partition(|key| key.channel.is_private());

        if !public.is_empty() {
            let channels: Vec<ChannelSubscription> =
                public.into_iter().map(ChannelSubscription::from).collect();
            let sent = self
                .codec
                .encode_subscription(&channels)
                .and_then(|frame| self.send_frame(frame));
            if let Err(e) = sent {
                self.report_error(&e);
            }
        }

        if !private.is_empty() && self.can_authenticate() {
            let channels: Vec<ChannelSubscription> =
                private.into_iter().map(ChannelSubscription::from).collect();
            let sent = self
                .codec
                .encode_subscription(&channels)
                .and_then(|frame| self.send_private("subscribe", None, frame));
            if let Err(e) = sent {
                self.report_error(&e);
            }
        }

        let markets: Vec<String> = lock(&self.books).keys().cloned().collect();
        for market in &markets {
            if let Err(e) = self.request_book_snapshot(market) {
                self.report_error(&e);
            }
        }

        if !keys.is_empty() || !markets.is_empty() {
            info!(subscriptions = keys.len(), books = markets.len(), "Restored subscriptions");
        }
    }

    /// Tear down per-connection state. Subscriptions stay registered.
    fn on_disconnect(&self, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }

        lock(&self.outbound).take();
        self.state.send_if_modified(|state| {
            if matches!(state, SessionState::Closing | SessionState::Disconnected) {
                false
            } else {
                *state = SessionState::Disconnected;
                true
            }
        });

        let pending: Vec<PendingCall> = lock(&self.pending)
            .drain()
            .flat_map(|(_, queue)| queue)
            .collect();
        lock(&self.private_queue).clear();

        let failed = pending.len();
        for call in pending {
            if let Responder::Caller(tx) = call.responder {
                let _ = tx.send(Err(ExchangeError::ConnectionClosed));
            }
        }

        for local in lock(&self.books).values_mut() {
            local.reset();
        }

        info!(
            failed_calls = failed,
            subscriptions = self.registry.len(),
            "Session disconnected"
        );
    }
}

async fn run_writer(mut writer: WsWriter, mut outbound: mpsc::UnboundedReceiver<Message>) {
    while let Some(frame) = outbound.recv().await {
        let closing = matches!(frame, Message::Close(_));
        if let Err(e) = writer.send(frame).await {
            warn!(error = %e, "WebSocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
}

async fn run_reader(inner: Arc<SessionInner>, mut reader: WsReader, epoch: u64) {
    let mut sweep = interval(Duration::from_millis(inner.config.ws.sweep_interval_ms.max(1)));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(Message::Ping(payload))) => {
                    let _ = inner.send_frame(Message::Pong(payload));
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Server closed the connection");
                    break;
                }
                Some(Ok(message)) => inner.handle_message(message),
                Some(Err(e)) => {
                    error!(error = %e, "WebSocket read failed");
                    inner.report_error(&ExchangeError::NetworkError(e.to_string()));
                    break;
                }
                None => {
                    info!("WebSocket stream ended");
                    break;
                }
            },
            _ = sweep.tick() => inner.sweep_expired(),
        }
    }

    inner.on_disconnect(epoch);
}

/// One streaming connection with authentication gating, request/reply
/// correlation and subscription bookkeeping.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct StreamSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .field("subscriptions", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    pub fn new(
        config: StreamSessionConfig,
        signer: Option<Arc<HmacSigner>>,
        governor: RateLimitGovernor,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(SessionInner {
                config,
                codec: BitvavoCodec::new(),
                signer,
                governor,
                state,
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                private_queue: Mutex::new(VecDeque::new()),
                registry: SubscriptionRegistry::new(),
                books: Mutex::new(HashMap::new()),
                error_callback: Mutex::new(None),
                tasks: Mutex::new(None),
                epoch: AtomicU64::new(0),
                next_request_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the session reaches `target`
    pub async fn wait_for_state(
        &self,
        target: SessionState,
        wait: Duration,
    ) -> Result<(), ExchangeError> {
        let mut rx = self.inner.state.subscribe();
        let reached = timeout(wait, rx.wait_for(|state| *state == target))
            .await
            .map(|changed| changed.map(|_| ()));
        match reached {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ExchangeError::ConnectionClosed),
            Err(_) => Err(ExchangeError::Timeout(format!(
                "Session did not reach {} within {:?}",
                target, wait
            ))),
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    pub fn governor(&self) -> &RateLimitGovernor {
        &self.inner.governor
    }

    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: Fn(&ExchangeError) + Send + Sync + 'static,
    {
        *lock(&self.inner.error_callback) = Some(Arc::new(callback));
    }

    pub fn book_state(&self, market: &str) -> Option<BookSyncState> {
        lock(&self.inner.books).get(market).map(LocalBook::state)
    }

    /// Copy of the synchronised book, `None` until a snapshot was applied
    pub fn local_book(&self, market: &str) -> Option<OrderBook> {
        lock(&self.inner.books)
            .get(market)
            .and_then(|local| local.book().cloned())
    }

    /// Open the socket and, when credentials are configured, authenticate.
    ///
    /// Returns immediately when already connected or connecting.
    #[instrument(skip(self), fields(url = %self.inner.config.url))]
    pub async fn connect(&self) -> Result<(), ExchangeError> {
        let inner = &self.inner;

        let mut claimed = false;
        inner.state.send_if_modified(|state| {
            if *state == SessionState::Disconnected {
                *state = SessionState::Connecting;
                claimed = true;
                true
            } else {
                false
            }
        });
        if !claimed {
            return match self.state() {
                SessionState::Closing => Err(ExchangeError::SessionClosed),
                _ => Ok(()),
            };
        }

        let (writer, reader) = match ws::connect(&inner.config.url, &inner.config.ws).await {
            Ok(halves) => halves,
            Err(e) => {
                inner.state.send_if_modified(|state| {
                    if *state == SessionState::Connecting {
                        *state = SessionState::Disconnected;
                        true
                    } else {
                        false
                    }
                });
                return Err(e);
            }
        };

        // close() takes the tasks under this lock, so a concurrent dispose()
        // either refuses the socket here or finds the tasks to abort
        let auth_result = {
            let mut tasks = lock(&inner.tasks);
            // Private sends must not observe Connected before the handshake starts
            let _queue = lock(&inner.private_queue);

            let opened = inner.state.send_if_modified(|state| {
                if *state == SessionState::Connecting {
                    *state = SessionState::Connected;
                    true
                } else {
                    false
                }
            });
            if !opened {
                debug!("Session disposed during the handshake, dropping the socket");
                return Err(ExchangeError::SessionClosed);
            }

            let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            let (tx, rx) = mpsc::unbounded_channel();
            *lock(&inner.outbound) = Some(tx);
            *tasks = Some(ConnectionTasks {
                writer: tokio::spawn(run_writer(writer, rx)),
                reader: tokio::spawn(run_reader(Arc::clone(inner), reader, epoch)),
            });

            inner.can_authenticate().then(|| inner.authenticate())
        };
        if let Some(Err(e)) = auth_result {
            warn!(error = %e, "Failed to send authentication");
            inner.set_state(SessionState::Connected);
            inner.report_error(&e);
        }

        if inner.config.auto_resubscribe {
            inner.restore_subscriptions();
        }

        Ok(())
    }

    /// Close the connection. Safe to call repeatedly.
    ///
    /// Pending calls fail with `ConnectionClosed`; subscriptions are kept.
    pub async fn close(&self) -> Result<(), ExchangeError> {
        let inner = &self.inner;
        let tasks = lock(&inner.tasks).take();
        let Some(mut tasks) = tasks else {
            return Ok(());
        };

        info!("Closing session");
        let _ = inner.send_frame(Message::Close(None));

        let grace = Duration::from_millis(inner.config.ws.close_grace_ms);
        if timeout(grace, &mut tasks.reader).await.is_err() {
            warn!("Close not acknowledged in time");
            tasks.reader.abort();
        }
        tasks.writer.abort();

        inner.on_disconnect(inner.epoch.load(Ordering::SeqCst));
        Ok(())
    }

    /// Close for good and drop every subscription and local book
    pub async fn dispose(&self) {
        self.inner.set_state(SessionState::Closing);
        let _ = self.close().await;

        self.inner.registry.clear();
        lock(&self.inner.books).clear();
        self.inner
            .on_disconnect(self.inner.epoch.load(Ordering::SeqCst));
    }

    /// Send `action` with `params` and wait for its reply.
    ///
    /// Private actions are held back until the session is authenticated.
    #[instrument(skip(self, params), fields(action = %action))]
    pub async fn request(
        &self,
        action: &str,
        params: Map<String, Value>,
    ) -> Result<Value, ExchangeError> {
        let inner = &self.inner;
        let private = is_private_action(action);
        if private && !inner.can_authenticate() {
            return Err(ExchangeError::MissingCredentials(format!(
                "{} requires API credentials",
                action
            )));
        }
        inner.ensure_connected()?;
        inner.governor.acquire(inner.config.rate_limit_policy).await?;

        let request_id = inner.next_request_id();
        let frame = inner.codec.encode_action(action, Some(request_id), params)?;
        let (tx, rx) = oneshot::channel();
        inner.register_pending(action, request_id, Responder::Caller(tx));

        let sent = if private {
            inner.send_private(action, Some(request_id), frame)
        } else {
            inner.send_frame(frame)
        };
        if let Err(e) = sent {
            inner.take_pending(action, Some(request_id));
            return Err(e);
        }

        rx.await.unwrap_or(Err(ExchangeError::ConnectionClosed))
    }

    async fn subscribe_channel(
        &self,
        key: SubscriptionKey,
        callback: EventCallback,
    ) -> Result<SubscriptionKey, ExchangeError> {
        let inner = &self.inner;
        let private = key.channel.is_private();
        if private && !inner.can_authenticate() {
            return Err(ExchangeError::MissingCredentials(format!(
                "The {} channel requires API credentials",
                key.channel
            )));
        }
        inner.ensure_connected()?;
        inner.governor.acquire(inner.config.rate_limit_policy).await?;

        let frame = inner
            .codec
            .encode_subscription(&[ChannelSubscription::from(&key)])?;
        inner.registry.add(key.clone(), callback);

        let sent = if private {
            inner.send_private("subscribe", None, frame)
        } else {
            inner.send_frame(frame)
        };
        if let Err(e) = sent {
            inner.registry.remove(&key);
            return Err(e);
        }

        debug!(key = %key, "Subscription registered");
        Ok(key)
    }

    pub async fn subscribe_ticker<F>(
        &self,
        market: &str,
        callback: F,
    ) -> Result<SubscriptionKey, ExchangeError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_channel(SubscriptionKey::new(Channel::Ticker, market), Arc::new(callback))
            .await
    }

    pub async fn subscribe_ticker24h<F>(
        &self,
        market: &str,
        callback: F,
    ) -> Result<SubscriptionKey, ExchangeError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_channel(
            SubscriptionKey::new(Channel::Ticker24h, market),
            Arc::new(callback),
        )
        .await
    }

    pub async fn subscribe_trades<F>(
        &self,
        market: &str,
        callback: F,
    ) -> Result<SubscriptionKey, ExchangeError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_channel(SubscriptionKey::new(Channel::Trades, market), Arc::new(callback))
            .await
    }

    pub async fn subscribe_candles<F>(
        &self,
        market: &str,
        interval: &str,
        callback: F,
    ) -> Result<SubscriptionKey, ExchangeError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let key = SubscriptionKey::new(Channel::Candles, market).with_sub_key(interval);
        self.subscribe_channel(key, Arc::new(callback)).await
    }

    /// Raw `book` channel deltas, without local synchronisation
    pub async fn subscribe_book_updates<F>(
        &self,
        market: &str,
        callback: F,
    ) -> Result<SubscriptionKey, ExchangeError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_channel(SubscriptionKey::new(Channel::Book, market), Arc::new(callback))
            .await
    }

    /// Order and fill events for `market`
    pub async fn subscribe_account<F>(
        &self,
        market: &str,
        callback: F,
    ) -> Result<SubscriptionKey, ExchangeError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_channel(SubscriptionKey::new(Channel::Account, market), Arc::new(callback))
            .await
    }

    /// Maintain a local order book for `market`.
    ///
    /// A snapshot is requested first; the `book` channel is subscribed once
    /// the snapshot has been applied. `callback` receives the book after the
    /// snapshot and after every applied delta.
    pub async fn subscribe_book<F>(&self, market: &str, callback: F) -> Result<(), ExchangeError>
    where
        F: Fn(&OrderBook) + Send + Sync + 'static,
    {
        let inner = &self.inner;
        inner.ensure_connected()?;
        inner.governor.acquire(inner.config.rate_limit_policy).await?;

        lock(&inner.books).insert(market.to_string(), LocalBook::new(market, Arc::new(callback)));
        if let Err(e) = inner.request_book_snapshot(market) {
            lock(&inner.books).remove(market);
            return Err(e);
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, key: &SubscriptionKey) -> Result<(), ExchangeError> {
        let inner = &self.inner;
        if inner.registry.remove(key).is_none() {
            return Ok(());
        }

        // A local book still needs the server-side subscription
        if key.channel == Channel::Book && lock(&inner.books).contains_key(&key.market) {
            return Ok(());
        }
        if !self.state().is_connected() {
            return Ok(());
        }

        inner.governor.acquire(inner.config.rate_limit_policy).await?;
        let frame = inner
            .codec
            .encode_unsubscription(&[ChannelSubscription::from(key)])?;
        if key.channel.is_private() {
            inner.send_private("unsubscribe", None, frame)
        } else {
            inner.send_frame(frame)
        }
    }

    /// Stop maintaining the local book for `market`
    pub async fn unsubscribe_book(&self, market: &str) -> Result<(), ExchangeError> {
        let inner = &self.inner;
        let Some(local) = lock(&inner.books).remove(market) else {
            return Ok(());
        };

        let key = SubscriptionKey::new(Channel::Book, market);
        if !local.is_subscribed() || inner.registry.contains(&key) || !self.state().is_connected()
        {
            return Ok(());
        }

        inner.governor.acquire(inner.config.rate_limit_policy).await?;
        let frame = inner
            .codec
            .encode_unsubscription(&[ChannelSubscription::from(&key)])?;
        inner.send_frame(frame)
    }

    pub async fn time(&self) -> Result<Value, ExchangeError> {
        self.request("getTime", Map::new()).await
    }

    pub async fn markets(&self, market: Option<&str>) -> Result<Value, ExchangeError> {
        let mut params = Map::new();
        if let Some(market) = market {
            params.insert("market".to_string(), json!(market));
        }
        self.request("getMarkets", params).await
    }

    pub async fn book(&self, market: &str, depth: Option<u32>) -> Result<Value, ExchangeError> {
        let mut params = params([("market", json!(market))]);
        if let Some(depth) = depth {
            params.insert("depth".to_string(), json!(depth));
        }
        self.request(GET_BOOK_ACTION, params).await
    }

    pub async fn balance(&self, symbol: Option<&str>) -> Result<Value, ExchangeError> {
        let mut params = Map::new();
        if let Some(symbol) = symbol {
            params.insert("symbol".to_string(), json!(symbol));
        }
        self.request("privateGetBalance", params).await
    }

    /// `extra` carries order fields such as `amount` or `price`
    pub async fn place_order(
        &self,
        market: &str,
        side: &str,
        order_type: &str,
        extra: Map<String, Value>,
    ) -> Result<Value, ExchangeError> {
        let mut params = extra;
        params.insert("market".to_string(), json!(market));
        params.insert("side".to_string(), json!(side));
        params.insert("orderType".to_string(), json!(order_type));
        self.request("privateCreateOrder", params).await
    }

    pub async fn cancel_order(&self, market: &str, order_id: &str) -> Result<Value, ExchangeError> {
        self.request(
            "privateCancelOrder",
            params([("market", json!(market)), ("orderId", json!(order_id))]),
        )
        .await
    }
}
