//! Durable queue of user actions taken while offline.
//!
//! Actions are appended to the [`ActionStore`] and replayed strictly in
//! creation order. Replay is at-least-once: the attempt count is persisted
//! before each send, and every replay carries the action id as its
//! idempotency key so the server can drop duplicates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fleet_api::{ApiError, ApiRequest, ApiResponse, ErrorKind, Method, RequestExecutor};
use fleet_core::error::{FleetError, FleetResult};
use fleet_core::storage::{ActionStore, QueuedAction, RejectedAction};

use crate::event_bus::{AppEvent, EventBus};
use crate::service::{Service, ServiceState};

const DEFAULT_ROUTES: &[(&str, &str)] = &[
    ("start_trip", "POST /trips/start"),
    ("end_trip", "POST /trips/end"),
    ("trip_status", "PUT /trips/status"),
    ("location_ping", "POST /locations"),
    ("complete_delivery", "POST /deliveries/complete"),
    ("signature", "POST /deliveries/signature"),
    ("fuel_photo", "POST /fuel/photos"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub method: Method,
    pub path: String,
}

impl Route {
    /// Parse `"METHOD /path"`.
    pub fn parse(text: &str) -> FleetResult<Self> {
        let mut parts = text.split_whitespace();
        let (Some(method), Some(path), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(FleetError::Config(format!(
                "route '{text}' must look like 'POST /path'"
            )));
        };
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| FleetError::Config(format!("route '{text}' has an invalid method")))?;
        if !path.starts_with('/') {
            return Err(FleetError::Config(format!(
                "route '{text}' path must start with '/'"
            )));
        }
        Ok(Self {
            method,
            path: path.to_string(),
        })
    }

    fn request(&self, payload: &serde_json::Value) -> ApiRequest {
        let request = ApiRequest::new(self.method.clone(), self.path.clone());
        if payload.is_null() {
            request
        } else {
            request.with_body(payload.clone())
        }
    }
}

/// Maps action kinds to API endpoints.
#[derive(Debug, Clone)]
pub struct ActionRouter {
    routes: BTreeMap<String, Route>,
}

impl Default for ActionRouter {
    fn default() -> Self {
        let routes = DEFAULT_ROUTES
            .iter()
            .filter_map(|(kind, text)| Route::parse(text).ok().map(|r| (kind.to_string(), r)))
            .collect();
        Self { routes }
    }
}

impl ActionRouter {
    /// Built-in routes with `overrides` merged on top.
    pub fn with_overrides(overrides: &BTreeMap<String, String>) -> FleetResult<Self> {
        let mut router = Self::default();
        for (kind, text) in overrides {
            router.routes.insert(kind.clone(), Route::parse(text)?);
        }
        Ok(router)
    }

    pub fn route(&self, kind: &str) -> Option<&Route> {
        self.routes.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Pending,
    InFlight,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionEntry {
    #[serde(flatten)]
    pub action: QueuedAction,
    pub state: ActionState,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub replayed: usize,
    pub rejected: usize,
    pub remaining: usize,
    /// Actions left untouched because another user created them.
    pub held: usize,
    /// Why the pass stopped early, if it did.
    pub stopped_by: Option<ErrorKind>,
    /// Another drain was already running; this call did nothing.
    pub coalesced: bool,
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Executed immediately.
    Sent(ApiResponse),
    /// Stored for replay.
    Queued(QueuedAction),
}

/// Why [`OfflineActionQueue::submit`] neither sent nor queued an action.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("no route for action kind '{0}'")]
    UnknownKind(String),

    /// The server refused the request, or the session cannot be recovered.
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] FleetError),
}

impl SubmitError {
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            SubmitError::Api(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SubmitError> for FleetError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::UnknownKind(kind) => {
                FleetError::Service(format!("no route for action kind '{kind}'"))
            }
            SubmitError::Api(e) => e.into(),
            SubmitError::Store(e) => e,
        }
    }
}

struct Inner {
    store: Arc<dyn ActionStore>,
    executor: RequestExecutor,
    router: ActionRouter,
    events: EventBus,
    max_replay_attempts: u32,
    /// Held by a drain or a direct send.
    drain_lock: tokio::sync::Mutex<()>,
    /// A drain was asked for while the lock was held.
    drain_requested: AtomicBool,
    in_flight: Mutex<Option<Uuid>>,
}

#[derive(Clone)]
pub struct OfflineActionQueue {
    inner: Arc<Inner>,
}

impl OfflineActionQueue {
    pub fn new(
        store: Arc<dyn ActionStore>,
        executor: RequestExecutor,
        router: ActionRouter,
        events: EventBus,
        max_replay_attempts: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                router,
                events,
                max_replay_attempts,
                drain_lock: tokio::sync::Mutex::new(()),
                drain_requested: AtomicBool::new(false),
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Durably append an action on behalf of the signed-in user.
    pub fn enqueue(&self, kind: &str, payload: serde_json::Value) -> FleetResult<QueuedAction> {
        self.append(self.new_action(kind, payload))
    }

    fn new_action(&self, kind: &str, payload: serde_json::Value) -> QueuedAction {
        let action = QueuedAction::new(kind, payload);
        match self.current_user() {
            Some(user) => action.owned_by(user),
            None => action,
        }
    }

    fn current_user(&self) -> Option<String> {
        self.inner.executor.session().get().map(|c| c.user_id)
    }

    fn append(&self, action: QueuedAction) -> FleetResult<QueuedAction> {
        self.inner.store.append(&action)?;
        self.announce(&action);
        Ok(action)
    }

    fn announce(&self, action: &QueuedAction) {
        info!("queued {} action {}", action.kind, action.id);
        self.inner.events.emit(AppEvent::ActionQueued {
            id: action.id,
            kind: action.kind.clone(),
        });
    }

    /// Run an action now, or queue it.
    ///
    /// The action goes behind any of the user's older actions and behind a
    /// drain or direct send already in progress. Otherwise it is stored, sent
    /// immediately, and kept only if the failure was about connectivity or
    /// the session. Other API errors are returned with their full context.
    pub async fn submit(
        &self,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<SubmitOutcome, SubmitError> {
        let Some(route) = self.inner.router.route(kind) else {
            return Err(SubmitError::UnknownKind(kind.to_string()));
        };
        let mut action = self.new_action(kind, payload);

        let Ok(guard) = self.inner.drain_lock.try_lock() else {
            debug!("queue busy, deferring {kind}");
            let action = self.append(action)?;
            self.inner.drain_requested.store(true, Ordering::SeqCst);
            return Ok(SubmitOutcome::Queued(action));
        };
        if self.next_for(action.owner.as_deref())?.is_some() {
            debug!("older actions waiting, deferring {kind}");
            return Ok(SubmitOutcome::Queued(self.append(action)?));
        }

        // Stored before sending: later submits line up behind it, and a crash
        // mid-request leaves it queued with the same idempotency key.
        self.inner.store.append(&action)?;
        if let Some(attempts) = self.inner.store.record_attempt(action.id)? {
            action.attempts = attempts;
        }
        self.set_in_flight(Some(action.id));
        let request = route.request(&action.payload).with_idempotency_key(action.id);
        let result = self.inner.executor.execute(request).await;
        self.set_in_flight(None);

        let response = match result {
            Ok(response) => response,
            Err(e) if should_queue(e.kind) => {
                warn!("{kind} deferred: {e}");
                self.announce(&action);
                return Ok(SubmitOutcome::Queued(action));
            }
            Err(e) => {
                self.inner.store.remove_action(action.id)?;
                return Err(e.into());
            }
        };
        self.inner.store.remove_action(action.id)?;
        drop(guard);

        // Submits that arrived during the send were queued behind it.
        self.run_requested_drain();
        Ok(SubmitOutcome::Sent(response))
    }

    /// Start a drain if one was turned away while the lock was held.
    fn run_requested_drain(&self) {
        if !self.inner.drain_requested.swap(false, Ordering::SeqCst) {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.drain().await {
                error!("follow-up drain failed: {e}");
            }
        });
    }

    /// Oldest action the given user's session may replay.
    fn next_for(&self, user: Option<&str>) -> FleetResult<Option<QueuedAction>> {
        Ok(self
            .inner
            .store
            .pending()?
            .into_iter()
            .find(|a| match user {
                Some(user) => a.replayable_by(user),
                None => a.owner.is_none(),
            }))
    }

    /// Replay queued actions in order until the queue is empty or a transient
    /// failure stops the pass.
    ///
    /// Only actions created by the signed-in user (or by nobody) are
    /// replayed. Other users' actions stay queued for their next sign-in.
    pub async fn drain(&self) -> FleetResult<DrainReport> {
        let Ok(guard) = self.inner.drain_lock.try_lock() else {
            debug!("drain already running");
            self.inner.drain_requested.store(true, Ordering::SeqCst);
            return Ok(DrainReport {
                coalesced: true,
                ..DrainReport::default()
            });
        };

        let mut report = DrainReport::default();
        let Some(user) = self.current_user() else {
            report.remaining = self.inner.store.count()?;
            report.stopped_by = Some(ErrorKind::AuthExpired);
            debug!("not signed in, {} action(s) wait", report.remaining);
            return Ok(report);
        };

        while let Some(action) = self.next_for(Some(&user))? {
            let Some(route) = self.inner.router.route(&action.kind) else {
                self.reject(action, "no route for action kind".into(), 0)?;
                report.rejected += 1;
                continue;
            };
            let max = self.inner.max_replay_attempts;
            if max > 0 && action.attempts >= max {
                self.reject(action, format!("gave up after {max} replay attempt(s)"), 0)?;
                report.rejected += 1;
                continue;
            }

            // Persist the attempt before sending: a crash mid-request replays again.
            if self.inner.store.record_attempt(action.id)?.is_none() {
                continue;
            }
            self.set_in_flight(Some(action.id));
            let request = route.request(&action.payload).with_idempotency_key(action.id);
            let result = self.inner.executor.execute(request).await;
            self.set_in_flight(None);

            match result {
                Ok(_) => {
                    self.inner.store.remove_action(action.id)?;
                    debug!("replayed {} action {}", action.kind, action.id);
                    report.replayed += 1;
                    self.inner.events.emit(AppEvent::ActionReplayed {
                        id: action.id,
                        kind: action.kind,
                    });
                }
                Err(e) if should_queue(e.kind) || e.kind == ErrorKind::AuthExpired => {
                    warn!("replay of {} paused: {e}", action.id);
                    report.stopped_by = Some(e.kind);
                    break;
                }
                Err(e) => {
                    let status = e.status;
                    self.reject(action, e.message, status)?;
                    report.rejected += 1;
                }
            }
        }

        let pending = self.inner.store.pending()?;
        report.remaining = pending.len();
        report.held = pending.iter().filter(|a| !a.replayable_by(&user)).count();
        if report.held > 0 {
            info!("{} queued action(s) belong to another user", report.held);
        }
        if report.replayed > 0 || report.rejected > 0 {
            info!(
                "queue drain: {} replayed, {} rejected, {} remaining",
                report.replayed, report.rejected, report.remaining
            );
        }
        self.inner.events.emit(AppEvent::QueueDrained {
            replayed: report.replayed,
            rejected: report.rejected,
            remaining: report.remaining,
        });
        drop(guard);
        if report.stopped_by.is_none() {
            self.run_requested_drain();
        }
        Ok(report)
    }

    fn reject(&self, action: QueuedAction, reason: String, status: u16) -> FleetResult<()> {
        warn!("rejected {} action {}: {reason}", action.kind, action.id);
        let rejected = RejectedAction {
            action,
            reason,
            status,
            rejected_at: Utc::now(),
        };
        self.inner.store.reject(&rejected)?;
        self.inner.events.emit(AppEvent::ActionRejected {
            id: rejected.action.id,
            kind: rejected.action.kind,
            reason: rejected.reason,
            status,
        });
        Ok(())
    }

    fn set_in_flight(&self, id: Option<Uuid>) {
        *self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = id;
    }

    pub fn is_empty(&self) -> FleetResult<bool> {
        Ok(self.inner.store.count()? == 0)
    }

    pub fn size(&self) -> FleetResult<usize> {
        self.inner.store.count()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.drain_lock.try_lock().is_err()
    }

    pub fn list(&self) -> FleetResult<Vec<ActionEntry>> {
        let in_flight = *self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(self
            .inner
            .store
            .pending()?
            .into_iter()
            .map(|action| {
                let state = if Some(action.id) == in_flight {
                    ActionState::InFlight
                } else {
                    ActionState::Pending
                };
                ActionEntry { action, state }
            })
            .collect())
    }

    pub fn rejected(&self) -> FleetResult<Vec<RejectedAction>> {
        self.inner.store.rejected()
    }

    /// Forget a rejected action.
    pub fn dismiss_rejected(&self, id: Uuid) -> FleetResult<bool> {
        Ok(self.inner.store.remove_rejected(id)?.is_some())
    }

    /// Put a rejected action back at the tail of the queue with a fresh
    /// attempt count. It keeps its id, so the idempotency key is unchanged.
    pub fn retry_rejected(&self, id: Uuid) -> FleetResult<Option<QueuedAction>> {
        let Some(rejected) = self.inner.store.remove_rejected(id)? else {
            return Ok(None);
        };
        let action = QueuedAction {
            created_at: Utc::now(),
            attempts: 0,
            ..rejected.action
        };
        self.append(action).map(Some)
    }

    /// Drop every pending action. Rejected actions are kept.
    pub fn clear(&self) -> FleetResult<usize> {
        let dropped = self.inner.store.clear()?;
        if dropped > 0 {
            info!("cleared {dropped} queued action(s)");
        }
        Ok(dropped)
    }
}

/// Failures that mean "try again later" rather than "the server said no".
fn should_queue(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Network | ErrorKind::RetryableServer | ErrorKind::RefreshFailed
    )
}

impl Service for OfflineActionQueue {
    fn name(&self) -> &'static str {
        "offline_queue"
    }

    fn state(&self) -> ServiceState {
        match self.inner.store.count() {
            Ok(_) => ServiceState::Running,
            Err(_) => ServiceState::Failed,
        }
    }

    fn detail(&self) -> String {
        let pending = self.inner.store.count().unwrap_or(0);
        let rejected = self.inner.store.rejected().map(|r| r.len()).unwrap_or(0);
        format!("{pending} pending, {rejected} rejected")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_api::testing::{MockHttpTransport, MockReply};
    use fleet_api::HttpTransport;
    use fleet_core::config::AppConfig;
    use fleet_core::session::{AuthSessionStore, Credential};
    use fleet_core::storage::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        http: Arc<MockHttpTransport>,
        store: Arc<MemoryStore>,
        session: AuthSessionStore,
        queue: OfflineActionQueue,
        events: EventBus,
    }

    fn fixture(max_replay_attempts: u32) -> Fixture {
        let mut config = AppConfig::default();
        config.server.api_base_url = "https://api.fleet.test".into();

        let store = Arc::new(MemoryStore::new());
        let session = AuthSessionStore::load(store.clone()).unwrap();
        session.set(Credential::new("tok", "ref", "driver-1")).unwrap();

        let http = Arc::new(MockHttpTransport::new());
        let transport: Arc<dyn HttpTransport> = http.clone();
        let executor = RequestExecutor::from_config(&config, transport, session.clone());
        let events = EventBus::new(64);
        let queue = OfflineActionQueue::new(
            store.clone(),
            executor,
            ActionRouter::default(),
            events.clone(),
            max_replay_attempts,
        );
        Fixture {
            http,
            store,
            session,
            queue,
            events,
        }
    }

    #[test]
    fn test_route_parsing() {
        let route = Route::parse("put /trips/status").unwrap();
        assert_eq!(route.method, Method::PUT);
        assert_eq!(route.path, "/trips/status");
        assert!(Route::parse("/no-method").is_err());
        assert!(Route::parse("POST no-slash").is_err());

        let overrides = BTreeMap::from([
            ("start_trip".to_string(), "POST /v2/trips".to_string()),
            ("inspection".to_string(), "POST /inspections".to_string()),
        ]);
        let router = ActionRouter::with_overrides(&overrides).unwrap();
        assert_eq!(router.route("start_trip").unwrap().path, "/v2/trips");
        assert!(router.route("inspection").is_some());
        assert!(router.route("end_trip").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_sends_when_queue_empty() {
        let f = fixture(0);
        let outcome = f.queue.submit("start_trip", json!({"tripId": "T1"})).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Sent(_)));
        assert!(f.queue.is_empty().unwrap());

        let sent = f.http.requests_to("/trips/start");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].header("Idempotency-Key").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_queues_on_network_failure() {
        let f = fixture(0);
        f.http.set_default(MockReply::NetworkError);

        let outcome = f.queue.submit("location_ping", json!({"lat": 1.0})).await.unwrap();
        let SubmitOutcome::Queued(action) = outcome else {
            panic!("expected queued");
        };
        assert_eq!(f.queue.size().unwrap(), 1);

        // The queued id is the one already used as the idempotency key.
        let keys: Vec<String> = f
            .http
            .requests()
            .iter()
            .filter_map(|r| r.header("Idempotency-Key").map(str::to_string))
            .collect();
        assert!(keys.iter().all(|k| *k == action.id.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_behind_existing_work() {
        let f = fixture(0);
        f.queue.enqueue("start_trip", json!({"tripId": "T1"})).unwrap();

        let outcome = f.queue.submit("end_trip", json!({"tripId": "T1"})).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Queued(_)));
        assert!(f.http.requests().is_empty());
        assert_eq!(f.queue.size().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_client_error_is_returned() {
        let f = fixture(0);
        f.http.push("/trips/start", MockReply::Status(422, r#"{"message":"bad trip"}"#.into()));

        let err = f.queue.submit("start_trip", json!({})).await.unwrap_err();
        let api = err.api_error().expect("typed api error");
        assert_eq!(api.kind, ErrorKind::NonRetryableClient);
        assert_eq!(api.status, 422);
        assert_eq!(api.code, "CLIENT_ERROR");
        assert_eq!(api.method, Method::POST);
        assert_eq!(api.endpoint, "/trips/start");
        assert_eq!(api.message, "bad trip");
        assert!(f.queue.is_empty().unwrap());

        let err = f.queue.submit("teleport", json!({})).await.unwrap_err();
        assert!(matches!(err, SubmitError::UnknownKind(ref kind) if kind == "teleport"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_submits_keep_order() {
        let f = fixture(0);
        f.http.push_n("/trips/start", MockReply::NetworkError, 4);

        let first = f.queue.submit("start_trip", json!({"n": "A"}));
        let second = async {
            // Lands while start_trip is still backing off.
            tokio::time::sleep(Duration::from_secs(2)).await;
            f.queue.submit("end_trip", json!({"n": "B"})).await
        };
        let (first, second) = tokio::join!(first, second);
        let SubmitOutcome::Queued(a) = first.unwrap() else {
            panic!("start_trip should be kept for replay");
        };
        let SubmitOutcome::Queued(b) = second.unwrap() else {
            panic!("end_trip should wait behind start_trip");
        };

        assert_eq!(f.http.count("/trips/end"), 0);
        let order: Vec<Uuid> = f.queue.list().unwrap().into_iter().map(|e| e.action.id).collect();
        assert_eq!(order, vec![a.id, b.id]);

        let report = f.queue.drain().await.unwrap();
        assert_eq!(report.replayed, 2);
        let replayed: Vec<String> = f.http.requests().into_iter().skip(4).map(|r| r.path).collect();
        assert_eq!(replayed, vec!["/trips/start", "/trips/end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_during_slow_send_follows_it() {
        let f = fixture(0);
        f.http.push("/trips/start", MockReply::ok("{}").delayed(Duration::from_secs(1)));

        let first = f.queue.submit("start_trip", json!({}));
        let second = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            f.queue.submit("end_trip", json!({})).await
        };
        let (first, second) = tokio::join!(first, second);
        assert!(matches!(first.unwrap(), SubmitOutcome::Sent(_)));
        assert!(matches!(second.unwrap(), SubmitOutcome::Queued(_)));

        // The queued action is replayed once the send completes.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.queue.is_empty().unwrap());
        let paths: Vec<String> = f.http.requests().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/trips/start", "/trips/end"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_users_actions_are_held() {
        let f = fixture(0);
        let theirs = f.queue.enqueue("complete_delivery", json!({"deliveryId": "D-1"})).unwrap();
        assert_eq!(theirs.owner.as_deref(), Some("driver-1"));

        f.session.set(Credential::new("tok-2", "ref-2", "driver-2")).unwrap();
        // Someone else's backlog does not hold up this user's actions.
        let outcome = f.queue.submit("trip_status", json!({"status": "idle"})).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Sent(_)));
        f.queue.enqueue("end_trip", json!({})).unwrap();

        let report = f.queue.drain().await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.held, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(f.http.count("/deliveries/complete"), 0);
        assert_eq!(f.queue.list().unwrap()[0].action.id, theirs.id);

        f.session.set(Credential::new("tok-1", "ref-1", "driver-1")).unwrap();
        let report = f.queue.drain().await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(report.held, 0);
        let sent = f.http.requests_to("/deliveries/complete");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header("Authorization"), Some("Bearer tok-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_while_signed_out() {
        let f = fixture(0);
        f.queue.enqueue("end_trip", json!({})).unwrap();
        f.session.clear().unwrap();

        let report = f.queue.drain().await.unwrap();
        assert_eq!(report.stopped_by, Some(ErrorKind::AuthExpired));
        assert_eq!(report.remaining, 1);
        assert!(f.http.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_preserves_order_across_failure() {
        let f = fixture(0);
        let a = f.queue.enqueue("start_trip", json!({"n": "A"})).unwrap();
        let b = f.queue.enqueue("complete_delivery", json!({"n": "B"})).unwrap();
        let c = f.queue.enqueue("end_trip", json!({"n": "C"})).unwrap();

        // B fails on every retry of the first pass.
        f.http.push_n("/deliveries/complete", MockReply::status(503), 4);

        let first = f.queue.drain().await.unwrap();
        assert_eq!(first.replayed, 1);
        assert_eq!(first.remaining, 2);
        assert_eq!(first.stopped_by, Some(ErrorKind::RetryableServer));
        assert_eq!(f.queue.list().unwrap()[0].action.id, b.id);

        let second = f.queue.drain().await.unwrap();
        assert_eq!(second.replayed, 2);
        assert_eq!(second.remaining, 0);

        let order: Vec<String> = f
            .http
            .requests()
            .iter()
            .map(|r| r.header("Idempotency-Key").unwrap_or_default().to_string())
            .collect();
        let a_key = a.id.to_string();
        let b_key = b.id.to_string();
        let c_key = c.id.to_string();
        assert_eq!(order.first(), Some(&a_key));
        assert_eq!(order.iter().filter(|k| **k == b_key).count(), 5);
        assert_eq!(order.last(), Some(&c_key));
        assert_eq!(order.iter().filter(|k| **k == c_key).count(), 1);
        assert_eq!(order.iter().filter(|k| **k == a_key).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_moves_on() {
        let f = fixture(0);
        let mut rx = f.events.subscribe();
        let bad = f.queue.enqueue("signature", json!({})).unwrap();
        let good = f.queue.enqueue("end_trip", json!({})).unwrap();
        f.http.push("/deliveries/signature", MockReply::Status(409, r#"{"error":"already signed"}"#.into()));

        let report = f.queue.drain().await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.replayed, 1);

        let rejected = f.queue.rejected().unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].action.id, bad.id);
        assert_eq!(rejected[0].status, 409);
        assert_eq!(rejected[0].reason, "already signed");

        let mut saw_rejected = false;
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::ActionRejected { id, .. } = event {
                assert_eq!(id, bad.id);
                saw_rejected = true;
            }
        }
        assert!(saw_rejected);
        assert_eq!(f.http.count("/trips/end"), 1);
        let _ = good;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_and_dismiss_rejected() {
        let f = fixture(0);
        let first = f.queue.enqueue("signature", json!({})).unwrap();
        let second = f.queue.enqueue("signature", json!({})).unwrap();
        f.http.push_n("/deliveries/signature", MockReply::status(400), 2);
        f.queue.drain().await.unwrap();
        assert_eq!(f.queue.rejected().unwrap().len(), 2);

        assert!(f.queue.dismiss_rejected(first.id).unwrap());
        assert!(!f.queue.dismiss_rejected(first.id).unwrap());

        let requeued = f.queue.retry_rejected(second.id).unwrap().unwrap();
        assert_eq!(requeued.id, second.id);
        assert_eq!(requeued.attempts, 0);
        assert!(f.queue.rejected().unwrap().is_empty());

        let report = f.queue.drain().await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(f.store.count().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unroutable_and_exhausted_actions_rejected() {
        let f = fixture(2);
        let unknown = QueuedAction::new("teleport", json!({}));
        f.store.append(&unknown).unwrap();
        let mut tired = QueuedAction::new("end_trip", json!({}));
        tired.attempts = 2;
        f.store.append(&tired).unwrap();

        let report = f.queue.drain().await.unwrap();
        assert_eq!(report.rejected, 2);
        assert!(f.http.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_recorded_before_send() {
        let f = fixture(0);
        let action = f.queue.enqueue("end_trip", json!({})).unwrap();
        f.http.set_default(MockReply::NetworkError);

        let report = f.queue.drain().await.unwrap();
        assert_eq!(report.stopped_by, Some(ErrorKind::Network));
        assert_eq!(f.store.front().unwrap().unwrap().id, action.id);
        assert_eq!(f.store.front().unwrap().unwrap().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_drains_coalesce() {
        let f = fixture(0);
        f.queue.enqueue("end_trip", json!({})).unwrap();
        f.http.push("/trips/end", MockReply::ok("{}").delayed(Duration::from_secs(1)));

        let (first, second) = tokio::join!(f.queue.drain(), f.queue.drain());
        let first = first.unwrap();
        let second = second.unwrap();
        assert!(first.coalesced != second.coalesced);
        assert_eq!(first.replayed + second.replayed, 1);
        assert_eq!(f.http.count("/trips/end"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_and_clear() {
        let f = fixture(0);
        f.queue.enqueue("start_trip", json!({})).unwrap();
        f.queue.enqueue("end_trip", json!({})).unwrap();

        let list = f.queue.list().unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|e| e.state == ActionState::Pending));
        assert_eq!(f.queue.detail(), "2 pending, 0 rejected");

        assert_eq!(f.queue.clear().unwrap(), 2);
        assert!(f.queue.is_empty().unwrap());
    }
}
