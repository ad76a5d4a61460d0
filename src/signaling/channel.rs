//! Per-user signaling channel registry with authenticated connect and
//! bounded-backoff reconnection.
//!
//! One [`SignalingRegistry`] owns every signaling connection in the process,
//! keyed by local user id. All registry state (connections, reconnect
//! attempt counters, pending retry timers) is mutated only through its
//! methods; observers consume identity-scoped [`ChannelEvent`]s from the
//! broadcast stream instead of registering callbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::auth::CredentialProvider;
use crate::config::ChannelTuning;

use super::socket::{Connector, OutboundFrame, TransportEvent, CLOSE_CODE_ABNORMAL};
use super::{
    ChannelConnectionState, ChannelError, ChannelEvent, ChannelEventKind, ClientMessage, Outbound,
    ServerMessage,
};

/// Close codes carrying an authentication/authorization rejection.
const AUTH_FAILURE_CODES: [u16; 3] = [4001, 4002, 4003];
/// Server internal error; fatal for the channel, but not an auth problem.
const SERVER_ERROR_CODE: u16 = 1011;
/// Normal and going-away closures; never reconnected automatically.
const NORMAL_CLOSURE_CODES: [u16; 2] = [1000, 1001];

/// Handle to one open signaling connection.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    pub user_id: String,
    conn_id: u64,
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl ChannelHandle {
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }
}

enum ChannelSlot {
    /// A connect attempt is in flight; concurrent callers await its outcome.
    Connecting {
        attempt_id: u64,
        done: watch::Receiver<Option<bool>>,
    },
    Connected(ChannelHandle),
}

#[derive(Default)]
struct Inner {
    channels: HashMap<String, ChannelSlot>,
    attempts: HashMap<String, u32>,
    timers: HashMap<String, JoinHandle<()>>,
}

pub struct SignalingRegistry {
    inner: Mutex<Inner>,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    tuning: ChannelTuning,
    base_url: String,
    events: broadcast::Sender<ChannelEvent>,
    next_id: AtomicU64,
}

impl SignalingRegistry {
    pub fn new(
        base_url: impl Into<String>,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        tuning: ChannelTuning,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            connector,
            credentials,
            tuning,
            base_url: base_url.into(),
            events,
            next_id: AtomicU64::new(1),
        })
    }

    /// Subscribe to channel events for every identity this registry manages.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Connect the signaling channel for `user_id`.
    ///
    /// Idempotent: an already open connection is returned unchanged, and a
    /// caller that races an in-flight attempt awaits that attempt's outcome
    /// (bounded by the in-flight wait timeout) rather than opening a second
    /// connection.
    pub async fn connect(self: &Arc<Self>, user_id: &str) -> Result<ChannelHandle, ChannelError> {
        loop {
            enum Plan {
                Wait(watch::Receiver<Option<bool>>),
                Dial,
            }

            let plan = {
                let inner = self.lock();
                match inner.channels.get(user_id) {
                    Some(ChannelSlot::Connected(handle)) => return Ok(handle.clone()),
                    Some(ChannelSlot::Connecting { done, .. }) => Plan::Wait(done.clone()),
                    None => Plan::Dial,
                }
            };

            match plan {
                Plan::Wait(mut done) => {
                    let wait = async {
                        while done.borrow().is_none() {
                            if done.changed().await.is_err() {
                                break;
                            }
                        }
                    };
                    if tokio::time::timeout(self.tuning.inflight_wait, wait)
                        .await
                        .is_err()
                    {
                        return Err(ChannelError::InFlightTimeout);
                    }
                    let inner = self.lock();
                    match inner.channels.get(user_id) {
                        Some(ChannelSlot::Connected(handle)) => return Ok(handle.clone()),
                        _ => return Err(ChannelError::ConnectFailed),
                    }
                }
                Plan::Dial => {
                    // Fail fast with no credential: no connection attempt,
                    // no retry scheduled.
                    let token = self
                        .credentials
                        .bearer_token()
                        .ok_or(ChannelError::NoCredential)?;

                    let attempt_id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (done_tx, done_rx) = watch::channel(None);
                    {
                        let mut inner = self.lock();
                        // Re-check under the lock; another caller may have won.
                        if inner.channels.contains_key(user_id) {
                            continue;
                        }
                        inner.channels.insert(
                            user_id.to_string(),
                            ChannelSlot::Connecting {
                                attempt_id,
                                done: done_rx,
                            },
                        );
                    }
                    self.emit_state(user_id, ChannelConnectionState::Connecting);
                    return self.dial(user_id, attempt_id, &token, done_tx).await;
                }
            }
        }
    }

    async fn dial(
        self: &Arc<Self>,
        user_id: &str,
        attempt_id: u64,
        token: &str,
        done_tx: watch::Sender<Option<bool>>,
    ) -> Result<ChannelHandle, ChannelError> {
        let url = self.endpoint_url(user_id, token);

        let dialed = tokio::time::timeout(self.tuning.connect_timeout, async {
            self.connector.connect(&url).await
        })
        .await;

        let transport = match dialed {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => {
                tracing::warn!("Signaling connect for {} failed: {}", user_id, e);
                self.dial_failed(user_id, attempt_id, &done_tx);
                return Err(e);
            }
            Err(_) => {
                tracing::warn!("Signaling connect for {} timed out", user_id);
                self.dial_failed(user_id, attempt_id, &done_tx);
                return Err(ChannelError::ConnectTimeout);
            }
        };

        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = ChannelHandle {
            user_id: user_id.to_string(),
            conn_id,
            tx: transport.outbound,
        };

        {
            let mut inner = self.lock();
            // An explicit close() may have cancelled this attempt while the
            // transport was opening.
            let still_ours = matches!(
                inner.channels.get(user_id),
                Some(ChannelSlot::Connecting { attempt_id: id, .. }) if *id == attempt_id
            );
            if !still_ours {
                let _ = handle.tx.send(OutboundFrame::Close);
                let _ = done_tx.send(Some(false));
                return Err(ChannelError::Cancelled);
            }

            inner
                .channels
                .insert(user_id.to_string(), ChannelSlot::Connected(handle.clone()));
            inner.attempts.insert(user_id.to_string(), 0);
            if let Some(timer) = inner.timers.remove(user_id) {
                timer.abort();
            }
        }

        let _ = done_tx.send(Some(true));
        self.emit_state(user_id, ChannelConnectionState::Connected);
        tracing::info!("Signaling channel connected for {}", user_id);

        let this = Arc::clone(self);
        let id = user_id.to_string();
        tokio::spawn(async move {
            this.run_reader(id, conn_id, transport.events).await;
        });

        Ok(handle)
    }

    /// A dial that never produced an open connection counts as a transient
    /// closure: clean up the slot and run the normal retry policy.
    fn dial_failed(
        self: &Arc<Self>,
        user_id: &str,
        attempt_id: u64,
        done_tx: &watch::Sender<Option<bool>>,
    ) {
        let mut inner = self.lock();
        let still_ours = matches!(
            inner.channels.get(user_id),
            Some(ChannelSlot::Connecting { attempt_id: id, .. }) if *id == attempt_id
        );
        if still_ours {
            inner.channels.remove(user_id);
        }
        let _ = done_tx.send(Some(false));
        drop(inner);

        self.emit_state(user_id, ChannelConnectionState::Error);
        self.emit_state(user_id, ChannelConnectionState::Disconnected);
        if still_ours {
            let mut inner = self.lock();
            self.schedule_reconnect(&mut inner, user_id);
        }
    }

    /// Send a signaling message on the open connection for `user_id`.
    pub fn send(&self, user_id: &str, msg: ClientMessage) -> Result<(), ChannelError> {
        let handle = {
            let inner = self.lock();
            match inner.channels.get(user_id) {
                Some(ChannelSlot::Connected(handle)) => handle.clone(),
                _ => return Err(ChannelError::NotConnected),
            }
        };

        let text = serde_json::to_string(&Outbound::now(msg))?;
        handle
            .tx
            .send(OutboundFrame::Text(text))
            .map_err(|_| ChannelError::NotConnected)
    }

    /// Close one identity's connection, or every managed connection.
    ///
    /// Closing cancels any pending reconnect timer and closes the transport
    /// with a normal code, so no auto-reconnect follows.
    pub fn close(&self, user_id: Option<&str>) {
        let closed: Vec<String> = {
            let mut inner = self.lock();
            let targets: Vec<String> = match user_id {
                Some(id) => vec![id.to_string()],
                None => inner.channels.keys().cloned().collect(),
            };

            let mut closed = Vec::new();
            for id in targets {
                if let Some(timer) = inner.timers.remove(&id) {
                    timer.abort();
                }
                inner.attempts.remove(&id);
                if let Some(slot) = inner.channels.remove(&id) {
                    if let ChannelSlot::Connected(handle) = slot {
                        let _ = handle.tx.send(OutboundFrame::Close);
                    }
                    closed.push(id);
                }
            }
            closed
        };

        for id in closed {
            tracing::info!("Signaling channel closed for {}", id);
            self.emit_state(&id, ChannelConnectionState::Disconnected);
        }
    }

    /// Current connection state for an identity (mainly for status display).
    pub fn state(&self, user_id: &str) -> ChannelConnectionState {
        let inner = self.lock();
        match inner.channels.get(user_id) {
            Some(ChannelSlot::Connected(_)) => ChannelConnectionState::Connected,
            Some(ChannelSlot::Connecting { .. }) => ChannelConnectionState::Connecting,
            None => ChannelConnectionState::Disconnected,
        }
    }

    async fn run_reader(
        self: Arc<Self>,
        user_id: String,
        conn_id: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut close_code = CLOSE_CODE_ABNORMAL;
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Text(text) => self.handle_frame(&user_id, &text),
                TransportEvent::Closed { code } => {
                    close_code = code;
                    break;
                }
            }
        }
        self.handle_closure(&user_id, conn_id, close_code);
    }

    fn handle_frame(self: &Arc<Self>, user_id: &str, text: &str) {
        let msg: ServerMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Dropping malformed signaling frame: {}", e);
                return;
            }
        };

        // An application-level auth failure is fatal like an auth close code:
        // cancel the reconnect policy, close the transport, surface the typed
        // event. The message itself is still forwarded to subscribers.
        if matches!(msg, ServerMessage::AuthError { .. }) {
            tracing::warn!("Signaling auth rejected at application level for {}", user_id);
            {
                let mut inner = self.lock();
                if let Some(timer) = inner.timers.remove(user_id) {
                    timer.abort();
                }
                inner.attempts.remove(user_id);
                if let Some(ChannelSlot::Connected(handle)) = inner.channels.remove(user_id) {
                    let _ = handle.tx.send(OutboundFrame::Close);
                }
            }
            self.emit(user_id, ChannelEventKind::AuthError);
            self.emit_state(user_id, ChannelConnectionState::Disconnected);
        }

        self.emit(user_id, ChannelEventKind::Message(msg));
    }

    fn handle_closure(self: &Arc<Self>, user_id: &str, conn_id: u64, code: u16) {
        let mut inner = self.lock();

        // Only the reader of the current connection may act; a stale reader
        // from a connection that was already replaced or closed is a no-op.
        match inner.channels.get(user_id) {
            Some(ChannelSlot::Connected(handle)) if handle.conn_id == conn_id => {
                inner.channels.remove(user_id);
            }
            _ => return,
        }

        drop(inner);
        self.emit_state(user_id, ChannelConnectionState::Disconnected);
        let mut inner = self.lock();

        if AUTH_FAILURE_CODES.contains(&code) {
            tracing::warn!("Signaling closed with auth failure code {} for {}", code, user_id);
            self.clear_policy(&mut inner, user_id);
            drop(inner);
            self.emit(user_id, ChannelEventKind::AuthError);
        } else if code == SERVER_ERROR_CODE {
            tracing::warn!("Signaling closed with server error for {}", user_id);
            self.clear_policy(&mut inner, user_id);
            drop(inner);
            self.emit(user_id, ChannelEventKind::ServerError);
        } else if NORMAL_CLOSURE_CODES.contains(&code) {
            tracing::info!("Signaling closed normally for {}", user_id);
            self.clear_policy(&mut inner, user_id);
        } else {
            tracing::warn!(
                "Signaling closed with code {} for {}; scheduling reconnect",
                code,
                user_id
            );
            self.schedule_reconnect(&mut inner, user_id);
        }
    }

    fn clear_policy(&self, inner: &mut Inner, user_id: &str) {
        if let Some(timer) = inner.timers.remove(user_id) {
            timer.abort();
        }
        inner.attempts.remove(user_id);
    }

    /// Schedule a single reconnect after an exponential-backoff delay, or
    /// give up once the attempt budget is spent.
    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner, user_id: &str) {
        let used = inner.attempts.get(user_id).copied().unwrap_or(0);
        if used >= self.tuning.max_reconnect_attempts {
            self.clear_policy(inner, user_id);
            tracing::warn!("Signaling reconnect attempts exhausted for {}", user_id);
            self.emit(user_id, ChannelEventKind::RetriesExhausted);
            return;
        }

        let attempt = used + 1;
        inner.attempts.insert(user_id.to_string(), attempt);

        let base = self
            .tuning
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(31))
            .min(self.tuning.backoff_cap_ms);
        let delay = base + jitter_ms(self.tuning.jitter_ms);
        tracing::info!(
            "Reconnecting signaling for {} in {}ms (attempt {}/{})",
            user_id,
            delay,
            attempt,
            self.tuning.max_reconnect_attempts
        );

        if let Some(old) = inner.timers.remove(user_id) {
            old.abort();
        }

        let this = Arc::clone(self);
        let id = user_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            {
                // A manual reconnect may have raced the timer; never produce
                // a second live connection for the same identity.
                let mut inner = this.lock();
                if inner.channels.contains_key(&id) {
                    return;
                }
                inner.timers.remove(&id);
            }
            if let Err(e) = this.connect(&id).await {
                tracing::warn!("Scheduled reconnect for {} failed: {}", id, e);
            }
        });
        inner.timers.insert(user_id.to_string(), timer);
    }

    fn endpoint_url(&self, user_id: &str, token: &str) -> String {
        let e = |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
        format!(
            "{}/{}/?token={}",
            self.base_url.trim_end_matches('/'),
            e(user_id),
            e(token)
        )
    }

    fn emit(&self, user_id: &str, kind: ChannelEventKind) {
        let _ = self.events.send(ChannelEvent {
            user_id: user_id.to_string(),
            kind,
        });
    }

    fn emit_state(&self, user_id: &str, state: ChannelConnectionState) {
        self.emit(user_id, ChannelEventKind::State(state));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Uniform jitter in `[0, max_ms)`, zero when jitter is disabled.
fn jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut buf = [0u8; 8];
    if getrandom::getrandom(&mut buf).is_err() {
        return 0;
    }
    u64::from_le_bytes(buf) % max_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;
    use crate::testutil::{FakeConnector, FakeLink};
    use std::time::Duration;

    fn tuning_no_jitter() -> ChannelTuning {
        ChannelTuning {
            jitter_ms: 0,
            ..ChannelTuning::default()
        }
    }

    fn registry(connector: Arc<FakeConnector>, token: Option<&str>) -> Arc<SignalingRegistry> {
        SignalingRegistry::new(
            "wss://signal.test/ws/call",
            connector,
            Arc::new(StaticCredentials(token.map(str::to_string))),
            tuning_no_jitter(),
        )
    }

    /// Let spawned channel tasks run; with a paused clock this returns as
    /// soon as every task is idle.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_share_one_connection() {
        let connector = FakeConnector::succeeding();
        let registry = registry(connector.clone(), Some("tok"));

        let (a, b) = tokio::join!(registry.connect("user-1"), registry.connect("user-1"));
        let a = a.unwrap();
        let b = b.unwrap();

        assert_eq!(connector.connect_count(), 1);
        assert_eq!(a.conn_id(), b.conn_id());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent_once_connected() {
        let connector = FakeConnector::succeeding();
        let registry = registry(connector.clone(), Some("tok"));

        let first = registry.connect("user-1").await.unwrap();
        let second = registry.connect("user-1").await.unwrap();

        assert_eq!(connector.connect_count(), 1);
        assert_eq!(first.conn_id(), second.conn_id());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credential_fails_fast_without_retry() {
        let connector = FakeConnector::succeeding();
        let registry = registry(connector.clone(), None);

        let err = registry.connect("user-1").await.unwrap_err();
        assert!(matches!(err, ChannelError::NoCredential));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn url_carries_user_and_token() {
        let connector = FakeConnector::succeeding();
        let registry = registry(connector.clone(), Some("se cret"));

        registry.connect("user 1").await.unwrap();
        let url = connector.last_url().unwrap();
        assert_eq!(url, "wss://signal.test/ws/call/user+1/?token=se+cret");
    }

    #[tokio::test(start_paused = true)]
    async fn send_without_connection_errors() {
        let connector = FakeConnector::succeeding();
        let registry = registry(connector, Some("tok"));

        let err = registry
            .send(
                "user-1",
                ClientMessage::CallInitiate {
                    callee_id: "x".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected));
    }

    async fn close_current_link(link: &FakeLink, code: u16) {
        link.close(code);
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_closures_back_off_exponentially_then_give_up() {
        let connector = FakeConnector::succeeding();
        let registry = registry(connector.clone(), Some("tok"));
        let mut events = registry.subscribe();

        registry.connect("user-1").await.unwrap();
        assert_eq!(connector.connect_count(), 1);

        // Every further dial fails, so the attempt counter never resets and
        // the retry delays escalate: 2000, 4000, 8000 ms (jitter disabled).
        connector.fail_from_now_on();
        let link = connector.last_link().unwrap();
        close_current_link(&link, 1006).await;

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(connector.connect_count(), 1, "first retry fired early");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(connector.connect_count(), 2);

        tokio::time::sleep(Duration::from_millis(3700)).await;
        assert_eq!(connector.connect_count(), 2, "second retry fired early");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(connector.connect_count(), 3);

        tokio::time::sleep(Duration::from_millis(7500)).await;
        assert_eq!(connector.connect_count(), 3, "third retry fired early");
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(connector.connect_count(), 4);

        // Attempt budget spent: nothing more is scheduled.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.connect_count(), 4);

        let mut saw_exhausted = false;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev.kind, ChannelEventKind::RetriesExhausted) {
                saw_exhausted = true;
            }
        }
        assert!(saw_exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reconnect_resets_attempt_counter() {
        let connector = FakeConnector::succeeding();
        let registry = registry(connector.clone(), Some("tok"));

        registry.connect("user-1").await.unwrap();
        let link = connector.last_link().unwrap();
        close_current_link(&link, 1006).await;

        // First retry reconnects successfully after 2s.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        settle().await;
        assert_eq!(connector.connect_count(), 2);

        // Counter was reset, so the next closure waits 2s again, not 4s.
        let link = connector.last_link().unwrap();
        close_current_link(&link, 1006).await;
        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert_eq!(connector.connect_count(), 2);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(connector.connect_count(), 3);
    }

    #[test]
    fn jitter_stays_below_bound() {
        for _ in 0..32 {
            assert!(jitter_ms(1000) < 1000);
        }
        assert_eq!(jitter_ms(0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_close_codes_do_not_reconnect() {
        for (code, expect_auth) in [(4001u16, true), (4002, true), (4003, true), (1011, false)] {
            let connector = FakeConnector::succeeding();
            let registry = registry(connector.clone(), Some("tok"));
            let mut events = registry.subscribe();

            registry.connect("user-1").await.unwrap();
            let link = connector.last_link().unwrap();
            close_current_link(&link, code).await;

            tokio::time::sleep(Duration::from_secs(120)).await;
            assert_eq!(connector.connect_count(), 1, "code {} reconnected", code);

            let mut saw_auth = false;
            let mut saw_server = false;
            while let Ok(ev) = events.try_recv() {
                match ev.kind {
                    ChannelEventKind::AuthError => saw_auth = true,
                    ChannelEventKind::ServerError => saw_server = true,
                    _ => {}
                }
            }
            assert_eq!(saw_auth, expect_auth, "code {}", code);
            assert_eq!(saw_server, !expect_auth, "code {}", code);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_close_cancels_reconnect() {
        let connector = FakeConnector::succeeding();
        let registry = registry(connector.clone(), Some("tok"));

        registry.connect("user-1").await.unwrap();
        registry.close(Some("user-1"));
        settle().await;

        assert_eq!(
            registry.state("user-1"),
            ChannelConnectionState::Disconnected
        );
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn application_level_auth_error_is_fatal_and_forwarded() {
        let connector = FakeConnector::succeeding();
        let registry = registry(connector.clone(), Some("tok"));
        let mut events = registry.subscribe();

        registry.connect("user-1").await.unwrap();
        let link = connector.last_link().unwrap();
        link.inject_text(r#"{"type":"auth_error","message":"token expired"}"#);
        settle().await;

        let mut saw_auth = false;
        let mut saw_forwarded = false;
        while let Ok(ev) = events.try_recv() {
            match ev.kind {
                ChannelEventKind::AuthError => saw_auth = true,
                ChannelEventKind::Message(ServerMessage::AuthError { .. }) => {
                    saw_forwarded = true;
                }
                _ => {}
            }
        }
        assert!(saw_auth);
        assert!(saw_forwarded);

        // The connection is gone and nothing reconnects on its own.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.connect_count(), 1);
        assert!(matches!(
            registry.send(
                "user-1",
                ClientMessage::CallInitiate {
                    callee_id: "x".into()
                }
            ),
            Err(ChannelError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn inflight_wait_times_out_visibly() {
        let connector = FakeConnector::pending();
        let registry = registry(connector.clone(), Some("tok"));

        let reg2 = registry.clone();
        let first = tokio::spawn(async move { reg2.connect("user-1").await });
        settle().await;

        // Second caller gives up after the in-flight wait (10s), well before
        // the first caller's own 15s connect timeout.
        let err = registry.connect("user-1").await.unwrap_err();
        assert!(matches!(err, ChannelError::InFlightTimeout));

        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::ConnectTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn sent_messages_carry_envelope_fields() {
        let connector = FakeConnector::succeeding();
        let registry = registry(connector.clone(), Some("tok"));

        registry.connect("user-1").await.unwrap();
        registry
            .send(
                "user-1",
                ClientMessage::CallInitiate {
                    callee_id: "doctor-2".into(),
                },
            )
            .unwrap();
        settle().await;

        let link = connector.last_link().unwrap();
        let frames = link.sent_texts();
        assert_eq!(frames.len(), 1);
        let v: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(v["type"], "call_initiate");
        assert_eq!(v["callee_id"], "doctor-2");
        assert!(v["timestamp"].is_i64());
    }
}
