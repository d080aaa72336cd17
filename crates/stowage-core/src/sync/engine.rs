//! The flush algorithm.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::breaker::{Breaker, EngineState, Gate, LatchRecord};
use crate::cache::local::cache_key;
use crate::cache::LocalCache;
use crate::config::SyncSettings;
use crate::error::{truncate_body, RemoteError, StoreError};
use crate::notify::{Notifier, SyncEvent};
use crate::queue::{queue_key, ActionKind, ActionQueue, ActionQueueItem};
use crate::remote::{Outcome, RemoteService};
use crate::repository::Entity;
use crate::store::KeyValueStore;

/// What happened during one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub persisted: bool,
    /// Actions sent to the remote.
    pub attempted: usize,
    pub sent: usize,
    pub requeued: usize,
    pub dropped: usize,
    /// Client errors and transport failures counted against the latch.
    pub errors: u32,
    /// The engine latched during this tick.
    pub latched: bool,
    /// The engine was already latched; nothing was sent.
    pub halted: bool,
    /// A probe succeeded and the engine is open again.
    pub resumed: bool,
}

/// Mutable state of one repository.
pub(crate) struct SyncState<T> {
    pub(crate) cache: LocalCache<T>,
    pub(crate) queue: ActionQueue<T>,
    /// Dequeued actions whose outcome is not known yet, head first.
    pub(crate) in_flight: VecDeque<ActionQueueItem<T>>,
    pub(crate) breaker: Breaker,
}

enum Delivery {
    Delivered,
    Rejected { status: u16, reason: String },
    Retry { status: u16 },
    Unreachable(RemoteError),
    Unencodable(serde_json::Error),
}

impl Delivery {
    fn is_retriable(&self) -> bool {
        matches!(self, Delivery::Retry { .. } | Delivery::Unreachable(_))
    }
}

pub struct SyncEngine<T> {
    endpoint: String,
    prefix: String,
    state: Mutex<SyncState<T>>,
    store: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteService>,
    notifier: Notifier,
    settings: SyncSettings,
    /// Serializes ticks so only one request is ever in flight.
    tick_lock: tokio::sync::Mutex<()>,
}

impl<T: Entity> SyncEngine<T> {
    /// Build an engine for `endpoint`, restoring any snapshot the store holds.
    /// The endpoint doubles as the cache-key prefix.
    pub fn new(
        endpoint: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteService>,
        notifier: Notifier,
        settings: SyncSettings,
    ) -> Self {
        let endpoint = endpoint.into();
        let prefix = endpoint.clone();

        let cache = LocalCache::load(store.as_ref(), &prefix);
        let queue = if settings.persist_queue {
            ActionQueue::load(store.as_ref(), &prefix)
        } else {
            ActionQueue::new()
        };
        let breaker = Breaker::restore(
            settings.latch_cooldown(),
            LatchRecord::load(store.as_ref(), &prefix),
            Instant::now(),
        );
        info!(
            endpoint = %endpoint,
            cached = cache.len(),
            pending = queue.len(),
            state = ?breaker.state(),
            "Sync engine ready"
        );

        Self {
            endpoint,
            prefix,
            state: Mutex::new(SyncState {
                cache,
                queue,
                in_flight: VecDeque::new(),
                breaker,
            }),
            store,
            remote,
            notifier,
            settings,
            tick_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SyncState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn engine_state(&self) -> EngineState {
        self.state().breaker.state()
    }

    /// Actions not yet accepted by the remote, including those in flight.
    pub fn pending(&self) -> usize {
        let state = self.state();
        state.queue.len() + state.in_flight.len()
    }

    /// Write full snapshots of the cache, the queue (if enabled) and the latch.
    ///
    /// All three are taken under one lock. Actions in flight are written at
    /// the head of the stored queue.
    pub fn persist(&self) -> Result<(), StoreError> {
        let (cache_json, queue_json, latch) = {
            let state = self.state();
            let queue_json = if self.settings.persist_queue {
                Some(state.queue.snapshot_json(&state.in_flight)?)
            } else {
                None
            };
            (state.cache.to_json()?, queue_json, state.breaker.record())
        };

        self.store.save(&cache_key(&self.prefix), &cache_json)?;
        if let Some(json) = queue_json {
            self.store.save(&queue_key(&self.prefix), &json)?;
        }
        LatchRecord::save(latch.as_ref(), self.store.as_ref(), &self.prefix)
    }

    /// Clear a latch by hand. Returns whether the engine was latched.
    pub fn reset(&self) -> bool {
        let previous = self.state().breaker.reset();
        if previous == EngineState::Open {
            return false;
        }
        info!(endpoint = %self.endpoint, "Sync latch reset");
        if let Err(e) = self.persist() {
            warn!(endpoint = %self.endpoint, error = %e, "Failed to persist latch reset");
        }
        self.notifier.publish(SyncEvent::SyncResumed {
            endpoint: self.endpoint.clone(),
        });
        true
    }

    /// Run one sync cycle: persist, then flush (or probe) the queue.
    pub async fn tick(&self) -> TickReport {
        let _running = self.tick_lock.lock().await;
        let mut report = TickReport::default();

        match self.persist() {
            Ok(()) => report.persisted = true,
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Failed to persist repository snapshot")
            }
        }

        let (gate, has_batch) = {
            let mut state = self.state();
            // Left behind by a tick that was cancelled mid-flight
            if !state.in_flight.is_empty() {
                let stranded: Vec<_> = state.in_flight.drain(..).collect();
                state.queue.restore_front(stranded);
            }
            let gate = state.breaker.gate(Instant::now());
            let limit = match gate {
                Gate::Flush => self.settings.max_items_per_flush,
                Gate::Probe => 1,
                Gate::Halted => 0,
            };
            let batch = state.queue.dequeue_up_to(limit);
            state.in_flight.extend(batch);
            (gate, !state.in_flight.is_empty())
        };

        if gate == Gate::Halted {
            report.halted = true;
            return report;
        }
        if !has_batch {
            return report;
        }

        match gate {
            Gate::Probe => self.probe(&mut report).await,
            _ => self.flush(&mut report).await,
        }

        if let Err(e) = self.persist() {
            warn!(endpoint = %self.endpoint, error = %e, "Failed to persist after sync");
        }

        debug!(
            endpoint = %self.endpoint,
            attempted = report.attempted,
            sent = report.sent,
            requeued = report.requeued,
            dropped = report.dropped,
            errors = report.errors,
            "Sync tick finished"
        );
        report
    }

    fn next_in_flight(&self) -> Option<ActionQueueItem<T>> {
        self.state().in_flight.front().cloned()
    }

    async fn flush(&self, report: &mut TickReport) {
        while let Some(item) = self.next_in_flight() {
            report.attempted += 1;
            let delivery = self.deliver(&item).await;
            self.settle(delivery, report);

            if report.errors > self.settings.max_errors_before_latch {
                let untouched = {
                    let mut state = self.state();
                    let remaining: Vec<_> = state.in_flight.drain(..).collect();
                    let untouched = remaining.len();
                    state.breaker.trip(Instant::now());
                    state.queue.restore_front(remaining);
                    untouched
                };
                report.latched = true;
                error!(
                    endpoint = %self.endpoint,
                    errors = report.errors,
                    untouched,
                    "Too many sync errors, halting remote sync"
                );
                self.notifier.publish(SyncEvent::SyncHalted {
                    endpoint: self.endpoint.clone(),
                    errors: report.errors,
                });
                break;
            }
        }
    }

    async fn probe(&self, report: &mut TickReport) {
        let Some(item) = self.next_in_flight() else {
            return;
        };
        report.attempted += 1;
        let delivery = self.deliver(&item).await;

        if self.settle(delivery, report) {
            self.state().breaker.recover();
            report.resumed = true;
            info!(endpoint = %self.endpoint, "Probe succeeded, resuming sync");
            self.notifier.publish(SyncEvent::SyncResumed {
                endpoint: self.endpoint.clone(),
            });
        } else {
            self.state().breaker.trip(Instant::now());
            report.latched = true;
            warn!(endpoint = %self.endpoint, "Probe failed, sync stays halted");
        }
    }

    async fn deliver(&self, item: &ActionQueueItem<T>) -> Delivery {
        let payload = match serde_json::to_value(item) {
            Ok(payload) => payload,
            Err(e) => return Delivery::Unencodable(e),
        };

        match self.remote.post_action(&payload).await {
            Ok(response) => match response.classify() {
                Outcome::Success => Delivery::Delivered,
                Outcome::ClientError => Delivery::Rejected {
                    status: response.status,
                    reason: truncate_body(&response.body),
                },
                Outcome::ServerError | Outcome::Unexpected => Delivery::Retry {
                    status: response.status,
                },
            },
            Err(e) => Delivery::Unreachable(e),
        }
    }

    /// Settle the head of the in-flight batch. Returns whether the remote
    /// accepted it.
    fn settle(&self, delivery: Delivery, report: &mut TickReport) -> bool {
        let item = {
            let mut state = self.state();
            let Some(item) = state.in_flight.pop_front() else {
                return false;
            };
            if delivery.is_retriable() {
                state.queue.requeue(item.clone());
            }
            item
        };

        match delivery {
            Delivery::Delivered => {
                report.sent += 1;
                debug!(endpoint = %self.endpoint, id = %item.id, kind = ?item.kind, "Action synced");
                true
            }
            Delivery::Retry { status } => {
                report.requeued += 1;
                warn!(endpoint = %self.endpoint, id = %item.id, status, "Server error, requeuing action");
                false
            }
            Delivery::Unreachable(e) => {
                report.errors += 1;
                report.requeued += 1;
                warn!(endpoint = %self.endpoint, id = %item.id, error = %e, "Remote unreachable, requeuing action");
                false
            }
            Delivery::Rejected { status, reason } => {
                report.errors += 1;
                report.dropped += 1;
                warn!(
                    endpoint = %self.endpoint,
                    id = %item.id,
                    status,
                    reason = %reason,
                    "Remote rejected action, dropping it"
                );
                let message = format!(
                    "Remote rejected {} for {} with status {}",
                    kind_name(item.kind),
                    item.id,
                    status
                );
                self.report_failure(&item, message, reason);
                false
            }
            Delivery::Unencodable(e) => {
                report.dropped += 1;
                error!(endpoint = %self.endpoint, id = %item.id, error = %e, "Action cannot be encoded, dropping it");
                let message = format!("Could not encode {} for {}", kind_name(item.kind), item.id);
                self.report_failure(&item, message, e.to_string());
                false
            }
        }
    }

    fn report_failure(&self, item: &ActionQueueItem<T>, message: String, reason: String) {
        let action = item.to_value_item().unwrap_or_else(|_| ActionQueueItem {
            kind: item.kind,
            id: item.id.clone(),
            value: None,
            requested_at: item.requested_at,
        });
        self.notifier.publish(SyncEvent::SyncFailed {
            endpoint: self.endpoint.clone(),
            message,
            action,
            reason,
        });
    }
}

fn kind_name(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::Update => "UPDATE",
        ActionKind::Delete => "DELETE",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::EventCode;
    use crate::remote::HttpRemote;
    use crate::store::MemoryStore;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tokio::sync::broadcast;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Nothing listens here, so every request fails at the transport level.
    const UNREACHABLE_ROOT: &str = "http://127.0.0.1:1/";

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        #[serde(default)]
        id: String,
        name: String,
    }

    impl Entity for Note {
        fn id(&self) -> &str {
            &self.id
        }

        fn set_id(&mut self, id: String) {
            self.id = id;
        }
    }

    fn note(id: &str, name: &str) -> Note {
        Note {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    fn settings(latch_cooldown_secs: Option<u64>) -> SyncSettings {
        SyncSettings {
            latch_cooldown_secs,
            ..SyncSettings::default()
        }
    }

    struct Harness {
        engine: SyncEngine<Note>,
        store: Arc<MemoryStore>,
        events: broadcast::Receiver<SyncEvent>,
    }

    fn harness(api_root: &str, settings: SyncSettings) -> Harness {
        harness_with_store(api_root, settings, Arc::new(MemoryStore::new()))
    }

    fn harness_with_store(api_root: &str, settings: SyncSettings, store: Arc<MemoryStore>) -> Harness {
        let remote = HttpRemote::for_endpoint(api_root, "note", None).expect("remote");
        let notifier = Notifier::new();
        let events = notifier.subscribe();
        let engine = SyncEngine::new("note", store.clone(), Arc::new(remote), notifier, settings);
        Harness {
            engine,
            store,
            events,
        }
    }

    fn enqueue_updates(engine: &SyncEngine<Note>, ids: &[&str]) {
        let mut state = engine.state();
        for id in ids {
            state.cache.put(id, note(id, "x"));
            state.queue.enqueue(ActionQueueItem::update(*id, note(id, "x")));
        }
    }

    fn queued_ids(engine: &SyncEngine<Note>) -> Vec<String> {
        engine.state().queue.iter().map(|item| item.id.clone()).collect()
    }

    fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn request_count(server: &MockServer) -> usize {
        server
            .received_requests()
            .await
            .map(|requests| requests.len())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_success_removes_action() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/note/actions"))
            .and(body_partial_json(serde_json::json!({"kind": "UPDATE", "id": "a"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut h = harness(&server.uri(), settings(None));
        enqueue_updates(&h.engine, &["a"]);

        let report = h.engine.tick().await;
        assert_eq!(report.attempted, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(h.engine.pending(), 0);

        // Nothing left to send
        let report = h.engine.tick().await;
        assert_eq!(report.attempted, 0);
        assert!(drain_events(&mut h.events).is_empty());

        server.verify().await;
    }

    #[tokio::test]
    async fn test_server_error_requeues_at_tail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"id": "a"})))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let h = harness(&server.uri(), settings(None));
        enqueue_updates(&h.engine, &["a", "b", "c", "d"]);

        let report = h.engine.tick().await;
        assert_eq!(report.attempted, 4);
        assert_eq!(report.sent, 3);
        assert_eq!(report.requeued, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(queued_ids(&h.engine), vec!["a"]);
        assert_eq!(h.engine.engine_state(), EngineState::Open);
    }

    #[tokio::test]
    async fn test_server_errors_keep_queue_length_and_advance_head() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let h = harness(&server.uri(), settings(None));
        enqueue_updates(&h.engine, &["a", "b", "c"]);

        let before = h.engine.pending();
        let report = h.engine.tick().await;
        assert_eq!(report.requeued, 3);
        assert!(!report.latched);
        assert_eq!(h.engine.pending(), before);
        // Each item attempted once per tick
        assert_eq!(request_count(&server).await, 3);
    }

    #[tokio::test]
    async fn test_client_error_drops_and_notifies_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("name is required"))
            .expect(1)
            .mount(&server)
            .await;

        let mut h = harness(&server.uri(), settings(None));
        enqueue_updates(&h.engine, &["a"]);

        let report = h.engine.tick().await;
        assert_eq!(report.dropped, 1);
        assert_eq!(report.errors, 1);
        assert!(!report.latched);
        assert_eq!(h.engine.pending(), 0);

        let events = drain_events(&mut h.events);
        assert_eq!(events.len(), 1);
        match &events[0] {
            SyncEvent::SyncFailed {
                endpoint,
                action,
                reason,
                message,
            } => {
                assert_eq!(endpoint, "note");
                assert_eq!(action.id, "a");
                assert_eq!(action.kind, ActionKind::Update);
                assert_eq!(reason, "name is required");
                assert!(message.contains("422"));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // The optimistic local value survives the drop
        assert_eq!(h.engine.state().cache.find_by_id("a"), Some(&note("a", "x")));
        server.verify().await;
    }

    #[tokio::test]
    async fn test_fourth_client_error_latches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let mut h = harness(&server.uri(), settings(None));
        enqueue_updates(&h.engine, &["a", "b", "c", "d", "e", "f"]);

        let report = h.engine.tick().await;
        assert_eq!(report.attempted, 4);
        assert_eq!(report.errors, 4);
        assert!(report.latched);
        assert_eq!(h.engine.engine_state(), EngineState::Latched);
        assert_eq!(queued_ids(&h.engine), vec!["e", "f"]);
        assert_eq!(request_count(&server).await, 4);

        let events = drain_events(&mut h.events);
        let codes: Vec<EventCode> = events.iter().map(SyncEvent::code).collect();
        assert_eq!(
            codes,
            vec![
                EventCode::SyncFailed,
                EventCode::SyncFailed,
                EventCode::SyncFailed,
                EventCode::SyncFailed,
                EventCode::SyncHalted,
            ]
        );

        // Latched engines never touch the network again
        enqueue_updates(&h.engine, &["g"]);
        for _ in 0..3 {
            let report = h.engine.tick().await;
            assert!(report.halted);
            assert_eq!(report.attempted, 0);
        }
        assert_eq!(request_count(&server).await, 4);
        assert_eq!(queued_ids(&h.engine), vec!["e", "f", "g"]);
    }

    #[tokio::test]
    async fn test_three_errors_do_not_latch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let h = harness(&server.uri(), settings(None));
        enqueue_updates(&h.engine, &["a", "b", "c", "d", "e"]);

        let report = h.engine.tick().await;
        assert_eq!(report.errors, 3);
        assert_eq!(report.sent, 2);
        assert!(!report.latched);
        assert_eq!(h.engine.engine_state(), EngineState::Open);
    }

    #[tokio::test]
    async fn test_error_budget_is_per_tick() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let h = harness(&server.uri(), settings(None));
        enqueue_updates(&h.engine, &["a", "b", "c"]);
        assert_eq!(h.engine.tick().await.errors, 3);
        enqueue_updates(&h.engine, &["d", "e", "f"]);
        let report = h.engine.tick().await;
        assert_eq!(report.errors, 3);
        assert!(!report.latched);
    }

    #[tokio::test]
    async fn test_transport_failures_requeue_then_latch() {
        let h = harness(UNREACHABLE_ROOT, settings(None));
        enqueue_updates(&h.engine, &["a", "b", "c", "d", "e", "f"]);

        let report = h.engine.tick().await;
        assert_eq!(report.attempted, 4);
        assert_eq!(report.requeued, 4);
        assert_eq!(report.dropped, 0);
        assert!(report.latched);
        // Untouched items go back to the head, failed ones sit at the tail
        assert_eq!(queued_ids(&h.engine), vec!["e", "f", "a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_flush_cap_per_tick() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let h = harness(&server.uri(), settings(None));
        {
            let mut state = h.engine.state();
            for i in 0..51 {
                state.queue.enqueue(ActionQueueItem::delete(format!("id-{}", i)));
            }
        }

        let report = h.engine.tick().await;
        assert_eq!(report.attempted, 50);
        assert_eq!(h.engine.pending(), 1);
        assert_eq!(queued_ids(&h.engine), vec!["id-50"]);

        let report = h.engine.tick().await;
        assert_eq!(report.attempted, 1);
        assert_eq!(h.engine.pending(), 0);
    }

    #[tokio::test]
    async fn test_probe_success_resumes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .up_to_n_times(4)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut h = harness(&server.uri(), settings(Some(0)));
        enqueue_updates(&h.engine, &["a", "b", "c", "d", "e", "f"]);

        assert!(h.engine.tick().await.latched);

        let report = h.engine.tick().await;
        assert_eq!(report.attempted, 1);
        assert!(report.resumed);
        assert_eq!(h.engine.engine_state(), EngineState::Open);
        assert_eq!(queued_ids(&h.engine), vec!["f"]);

        let codes: Vec<EventCode> = drain_events(&mut h.events).iter().map(SyncEvent::code).collect();
        assert_eq!(codes.last(), Some(&EventCode::SyncResumed));

        let report = h.engine.tick().await;
        assert_eq!(report.sent, 1);
        assert_eq!(h.engine.pending(), 0);
    }

    #[tokio::test]
    async fn test_probe_failure_stays_latched() {
        let h = harness(UNREACHABLE_ROOT, settings(Some(0)));
        enqueue_updates(&h.engine, &["a", "b", "c", "d"]);
        assert!(h.engine.tick().await.latched);

        let report = h.engine.tick().await;
        assert_eq!(report.attempted, 1);
        assert!(report.latched);
        assert!(!report.resumed);
        assert_eq!(h.engine.engine_state(), EngineState::Latched);
        assert_eq!(h.engine.pending(), 4);
    }

    #[tokio::test]
    async fn test_manual_reset_resumes_permanent_latch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(4)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut h = harness(&server.uri(), settings(None));
        enqueue_updates(&h.engine, &["a", "b", "c", "d", "e"]);
        assert!(h.engine.tick().await.latched);
        drain_events(&mut h.events);

        assert!(h.engine.reset());
        assert!(!h.engine.reset());
        assert_eq!(h.engine.engine_state(), EngineState::Open);
        let events = drain_events(&mut h.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].code(), EventCode::SyncResumed);

        let report = h.engine.tick().await;
        assert_eq!(report.sent, 1);
        assert_eq!(h.engine.pending(), 0);
    }

    #[tokio::test]
    async fn test_tick_persists_snapshot_even_when_latched() {
        let h = harness(UNREACHABLE_ROOT, settings(None));
        enqueue_updates(&h.engine, &["a", "b", "c", "d"]);
        assert!(h.engine.tick().await.latched);

        h.engine.state().cache.put("z", note("z", "late"));
        let report = h.engine.tick().await;
        assert!(report.halted);
        assert!(report.persisted);

        let json = h.store.load("note.cache").expect("load").expect("snapshot");
        let restored: LocalCache<Note> = LocalCache::from_json(&json).expect("parse");
        let mut names: Vec<String> = restored.find_all().into_iter().map(|n| n.name).collect();
        names.sort();
        assert_eq!(names, vec!["late", "x", "x", "x", "x"]);
    }

    #[tokio::test]
    async fn test_snapshot_reconstructs_cache() {
        let h = harness(UNREACHABLE_ROOT, settings(None));
        {
            let mut state = h.engine.state();
            state.cache.put("a", note("a", "first"));
            state.cache.put("b", note("b", "second"));
        }
        assert!(h.engine.tick().await.persisted);

        let json = h.store.load("note.cache").expect("load").expect("snapshot");
        let restored: LocalCache<Note> = LocalCache::from_json(&json).expect("parse");
        let state = h.engine.state();
        assert_eq!(restored.len(), state.cache.len());
        for entry in state.cache.entries() {
            assert_eq!(restored.entry(&entry.id), Some(entry));
        }
    }

    #[tokio::test]
    async fn test_restart_restores_cache_and_queue() {
        let store = Arc::new(MemoryStore::new());
        let h = harness_with_store(UNREACHABLE_ROOT, settings(None), store.clone());
        enqueue_updates(&h.engine, &["a", "b"]);
        h.engine.persist().expect("persist");
        drop(h);

        let h = harness_with_store(UNREACHABLE_ROOT, settings(None), store);
        assert_eq!(queued_ids(&h.engine), vec!["a", "b"]);
        assert_eq!(h.engine.state().cache.find_by_id("b"), Some(&note("b", "x")));
    }

    #[tokio::test]
    async fn test_unpersisted_queue_is_lost_on_restart() {
        let store = Arc::new(MemoryStore::new());
        let mut no_queue = settings(None);
        no_queue.persist_queue = false;

        let h = harness_with_store(UNREACHABLE_ROOT, no_queue.clone(), store.clone());
        enqueue_updates(&h.engine, &["a"]);
        h.engine.persist().expect("persist");
        assert!(store.load("note.queue").expect("load").is_none());
        drop(h);

        let h = harness_with_store(UNREACHABLE_ROOT, no_queue, store);
        assert_eq!(h.engine.pending(), 0);
        assert!(h.engine.state().cache.find_by_id("a").is_some());
    }

    #[tokio::test]
    async fn test_unexpected_status_requeues_without_counting() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let mut h = harness(&server.uri(), settings(None));
        enqueue_updates(&h.engine, &["a", "b", "c", "d", "e"]);

        let report = h.engine.tick().await;
        assert_eq!(report.attempted, 5);
        assert_eq!(report.requeued, 5);
        assert_eq!(report.errors, 0);
        assert!(!report.latched);
        assert_eq!(h.engine.engine_state(), EngineState::Open);
        assert_eq!(queued_ids(&h.engine), vec!["a", "b", "c", "d", "e"]);
        assert!(drain_events(&mut h.events).is_empty());
    }

    #[tokio::test]
    async fn test_actions_in_flight_stay_pending_and_persisted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(400)))
            .mount(&server)
            .await;

        let h = harness(&server.uri(), settings(None));
        enqueue_updates(&h.engine, &["a"]);

        let (report, (pending_mid_tick, stored_mid_tick)) = tokio::join!(h.engine.tick(), async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let pending = h.engine.pending();
            h.engine.persist().expect("persist");
            let stored = h.store.load("note.queue").expect("load").unwrap_or_default();
            (pending, stored)
        });

        assert_eq!(pending_mid_tick, 1);
        let stored: Vec<ActionQueueItem<Note>> = serde_json::from_str(&stored_mid_tick).expect("parse");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, "a");

        assert_eq!(report.requeued, 1);
        assert_eq!(h.engine.pending(), 1);
        assert_eq!(queued_ids(&h.engine), vec!["a"]);
    }

    #[tokio::test]
    async fn test_cancelled_tick_keeps_actions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(400)))
            .mount(&server)
            .await;

        let h = harness(&server.uri(), settings(None));
        enqueue_updates(&h.engine, &["a", "b"]);

        let cancelled = tokio::time::timeout(Duration::from_millis(150), h.engine.tick()).await;
        assert!(cancelled.is_err());
        assert_eq!(h.engine.pending(), 2);

        let report = h.engine.tick().await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.sent, 2);
        assert_eq!(h.engine.pending(), 0);
    }

    #[tokio::test]
    async fn test_latch_survives_restart_until_reset() {
        let store = Arc::new(MemoryStore::new());
        let h = harness_with_store(UNREACHABLE_ROOT, settings(None), store.clone());
        enqueue_updates(&h.engine, &["a", "b", "c", "d"]);
        assert!(h.engine.tick().await.latched);
        assert!(store.load("note.sync").expect("load").is_some());
        drop(h);

        let mut h = harness_with_store(UNREACHABLE_ROOT, settings(None), store.clone());
        assert_eq!(h.engine.engine_state(), EngineState::Latched);
        assert!(h.engine.tick().await.halted);

        assert!(h.engine.reset());
        assert_eq!(drain_events(&mut h.events)[0].code(), EventCode::SyncResumed);
        assert!(store.load("note.sync").expect("load").is_none());
        drop(h);

        let h = harness_with_store(UNREACHABLE_ROOT, settings(None), store);
        assert_eq!(h.engine.engine_state(), EngineState::Open);
    }

    #[tokio::test]
    async fn test_restored_latch_retries_after_cooldown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let h = harness_with_store(UNREACHABLE_ROOT, settings(Some(0)), store.clone());
        enqueue_updates(&h.engine, &["a", "b", "c", "d"]);
        assert!(h.engine.tick().await.latched);
        drop(h);

        let h = harness_with_store(&server.uri(), settings(Some(0)), store.clone());
        assert_eq!(h.engine.engine_state(), EngineState::Latched);
        let report = h.engine.tick().await;
        assert_eq!(report.attempted, 1);
        assert!(report.resumed);
        assert_eq!(h.engine.engine_state(), EngineState::Open);
        assert!(store.load("note.sync").expect("load").is_none());
        server.verify().await;
    }
}
