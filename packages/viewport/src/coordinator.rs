//! Turns a stream of viewport changes into published pin sets.
//!
//! Every viewport change supersedes the previous one. The coordinator
//! cancels the in-flight request, bumps its generation counter and starts a
//! new cancellable request. A request only ever publishes after checking,
//! under the state lock and immediately before the write, that it still
//! holds the current generation and that its token is live. However the
//! network orders its responses, the last viewport to start is the only
//! one whose pins can appear.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use civic_map_cache::CacheStore;
use civic_map_cache::keys::bounds_key;
use civic_map_events::EventBroker;
use civic_map_report_models::{BoundingBox, BoundsError, Pin};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{CoordinatorConfig, QueryError, SpatialQueryService, ViewportError};

/// Where a published pin set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinSource {
    /// Served from the look-aside cache.
    Cache,
    /// Fetched from the spatial query service.
    Service,
}

/// Whether a request is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Nothing in flight.
    Idle,
    /// A request is in flight.
    Querying,
}

/// How a single request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Its pins were published.
    Published {
        /// Where the pins came from.
        source: PinSource,
        /// How many pins were published.
        pins: usize,
    },
    /// Superseded by a later viewport or torn down. Not an error.
    Cancelled,
    /// The service missed its deadline. The result was discarded.
    TimedOut {
        /// Timeouts in a row, including this one.
        consecutive: u32,
    },
    /// The service failed. Previously published pins stay visible.
    Failed(ViewportError),
}

/// The state consumers render.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewportSnapshot {
    /// Generation of the request that published `pins`.
    pub generation: u64,
    /// Bounds key `pins` belong to.
    pub bounds_key: Option<String>,
    /// Last-known-good pins. Errors never clear them.
    pub pins: Vec<Pin>,
    /// Where `pins` came from.
    pub source: Option<PinSource>,
    /// Recoverable error of the most recent request, if any.
    pub error: Option<ViewportError>,
    /// Whether a request is in flight.
    pub loading: bool,
}

/// Handle to one started request.
#[derive(Debug)]
pub struct RequestHandle {
    generation: u64,
    bounds_key: String,
    task: JoinHandle<RequestOutcome>,
}

impl RequestHandle {
    /// Generation this request was started with.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Quantized key of the requested viewport.
    #[must_use]
    pub fn bounds_key(&self) -> &str {
        &self.bounds_key
    }

    /// Waits for the request to finish.
    pub async fn outcome(self) -> RequestOutcome {
        self.task.await.unwrap_or_else(|e| {
            log::error!("Viewport request {} aborted: {e}", self.generation);
            RequestOutcome::Cancelled
        })
    }
}

enum Fetched {
    Pins(Vec<Pin>, PinSource),
    Cancelled,
    TimedOut,
    Failed(QueryError),
}

#[derive(Default)]
struct State {
    generation: u64,
    in_flight: Option<CancellationToken>,
    last_bbox: Option<BoundingBox>,
    last_outcome: Option<RequestOutcome>,
    consecutive_timeouts: u32,
}

struct Inner {
    cache: Arc<CacheStore>,
    service: Arc<dyn SpatialQueryService>,
    config: CoordinatorConfig,
    state: Mutex<State>,
    published: watch::Sender<ViewportSnapshot>,
    shutdown: CancellationToken,
}

/// Coordinates viewport queries for one map instance.
///
/// Cloning yields another handle to the same coordinator. Requests run as
/// tokio tasks, so the methods that start one must be called from within a
/// runtime.
#[derive(Clone)]
pub struct ViewportQueryCoordinator {
    inner: Arc<Inner>,
}

impl ViewportQueryCoordinator {
    /// Creates an idle coordinator.
    #[must_use]
    pub fn new(
        cache: Arc<CacheStore>,
        service: Arc<dyn SpatialQueryService>,
        config: CoordinatorConfig,
    ) -> Self {
        let (published, _) = watch::channel(ViewportSnapshot::default());
        Self {
            inner: Arc::new(Inner {
                cache,
                service,
                config,
                state: Mutex::new(State::default()),
                published,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Handles a pan, zoom, resize or initial load.
    ///
    /// Cancels the in-flight request, if any, and starts a new one for
    /// `bbox`.
    ///
    /// # Errors
    ///
    /// Returns [`BoundsError`] for malformed coordinates. Nothing is
    /// cancelled or started in that case.
    pub fn on_viewport_change(&self, bbox: BoundingBox) -> Result<RequestHandle, BoundsError> {
        let bbox = bbox
            .validated()
            .inspect_err(|e| log::debug!("Ignoring viewport change: {e}"))?;
        Ok(self.start(bbox, false))
    }

    /// Re-queries the last viewport with the cache bypassed, asking the
    /// service for fresh pins as well.
    ///
    /// Returns `None` if no viewport has been seen yet.
    pub fn refresh(&self) -> Option<RequestHandle> {
        let bbox = self.inner.state().last_bbox?;
        Some(self.start(bbox, true))
    }

    /// Cancels the outstanding request and stops the coordinator for good.
    ///
    /// Later viewport changes end as [`RequestOutcome::Cancelled`] without
    /// touching the cache or the service.
    pub fn teardown(&self) {
        self.inner.shutdown.cancel();

        let mut state = self.inner.state();
        if state.in_flight.take().is_some() {
            state.last_outcome = Some(RequestOutcome::Cancelled);
        }
        self.inner
            .published
            .send_modify(|snapshot| snapshot.loading = false);
        log::debug!("Viewport coordinator torn down");
    }

    /// Subscribes to published snapshots.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ViewportSnapshot> {
        self.inner.published.subscribe()
    }

    /// The current published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ViewportSnapshot {
        self.inner.published.borrow().clone()
    }

    /// Whether a request is outstanding.
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        if self.inner.state().in_flight.is_some() {
            CoordinatorState::Querying
        } else {
            CoordinatorState::Idle
        }
    }

    /// Outcome of the most recent request that was not superseded.
    #[must_use]
    pub fn last_outcome(&self) -> Option<RequestOutcome> {
        self.inner.state().last_outcome.clone()
    }

    /// Re-queries the viewport whenever the broker publishes one of the
    /// configured refresh topics.
    ///
    /// The subscription is registered before this returns. The listener
    /// ends on [`Self::teardown`] or when the broker goes away.
    pub fn watch_invalidations(&self, broker: &EventBroker) -> JoinHandle<()> {
        let mut subscription = broker.subscribe(&self.inner.config.refresh_topics);
        let coordinator = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = coordinator.inner.shutdown.cancelled() => break,
                    notification = subscription.recv() => {
                        let Some(notification) = notification else {
                            break;
                        };
                        log::debug!("Refreshing viewport after {}", notification.topic);
                        coordinator.refresh();
                    }
                }
            }
        })
    }

    fn start(&self, bbox: BoundingBox, bypass_cache: bool) -> RequestHandle {
        let key = bounds_key(&bbox);
        let token = self.inner.shutdown.child_token();

        let generation = {
            let mut state = self.inner.state();
            if let Some(previous) = state.in_flight.take() {
                previous.cancel();
            }
            state.generation += 1;
            state.last_bbox = Some(bbox);
            if !token.is_cancelled() {
                state.in_flight = Some(token.clone());
                self.inner
                    .published
                    .send_modify(|snapshot| snapshot.loading = true);
            }
            state.generation
        };

        log::debug!("Viewport request {generation} started for {key}");

        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            inner
                .run(generation, bbox, task_key, bypass_cache, token)
                .await
        });

        RequestHandle {
            generation,
            bounds_key: key,
            task,
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(
        self: Arc<Self>,
        generation: u64,
        bbox: BoundingBox,
        key: String,
        bypass_cache: bool,
        token: CancellationToken,
    ) -> RequestOutcome {
        // The deadline covers the cache lookup too: a stalled store is as
        // bad as a stalled query.
        let deadline = self.config.query_timeout();
        let fetched = tokio::select! {
            biased;
            () = token.cancelled() => Fetched::Cancelled,
            fetched = tokio::time::timeout(deadline, self.fetch(&bbox, &key, bypass_cache, &token)) => {
                fetched.unwrap_or(Fetched::TimedOut)
            }
        };

        self.commit(generation, &key, &token, fetched)
    }

    async fn fetch(
        &self,
        bbox: &BoundingBox,
        key: &str,
        bypass_cache: bool,
        token: &CancellationToken,
    ) -> Fetched {
        if !bypass_cache {
            if let Some(pins) = self.cache.get::<Vec<Pin>>(key).await {
                return Fetched::Pins(pins, PinSource::Cache);
            }
        }

        let query = if bypass_cache {
            self.service.query_fresh_pins_in_bounds(bbox)
        } else {
            self.service.query_pins_in_bounds(bbox)
        };
        let pins = match query.await {
            Ok(pins) => pins,
            Err(e) => return Fetched::Failed(e),
        };

        if token.is_cancelled() {
            return Fetched::Cancelled;
        }
        self.cache.set(key, &pins, self.config.pin_ttl()).await;

        Fetched::Pins(pins, PinSource::Service)
    }

    fn commit(
        &self,
        generation: u64,
        key: &str,
        token: &CancellationToken,
        fetched: Fetched,
    ) -> RequestOutcome {
        let mut state = self.state();

        if state.generation != generation || token.is_cancelled() {
            log::debug!("Discarding result of superseded viewport request {generation}");
            return RequestOutcome::Cancelled;
        }
        state.in_flight = None;

        let outcome = match fetched {
            Fetched::Pins(pins, source) => {
                state.consecutive_timeouts = 0;
                let count = pins.len();
                self.published.send_modify(|snapshot| {
                    snapshot.generation = generation;
                    snapshot.bounds_key = Some(key.to_string());
                    snapshot.pins = pins;
                    snapshot.source = Some(source);
                    snapshot.error = None;
                    snapshot.loading = false;
                });
                log::debug!("Published {count} pins for {key} from {source:?}");
                RequestOutcome::Published {
                    source,
                    pins: count,
                }
            }
            Fetched::Cancelled => RequestOutcome::Cancelled,
            Fetched::TimedOut => {
                state.consecutive_timeouts += 1;
                let consecutive = state.consecutive_timeouts;
                let deadline = self.config.query_timeout();
                let surfaced = consecutive >= self.config.max_consecutive_timeouts;
                log::warn!(
                    "Spatial query for {key} timed out after {deadline:?} ({consecutive} in a row)"
                );
                self.published.send_modify(|snapshot| {
                    snapshot.loading = false;
                    if surfaced {
                        snapshot.error = Some(ViewportError::timeout(consecutive, deadline));
                    }
                });
                RequestOutcome::TimedOut { consecutive }
            }
            Fetched::Failed(e) => {
                log::warn!("Spatial query for {key} failed: {e}");
                let error = ViewportError::network(&e);
                self.published.send_modify(|snapshot| {
                    snapshot.loading = false;
                    snapshot.error = Some(error.clone());
                });
                RequestOutcome::Failed(error)
            }
        };

        state.last_outcome = Some(outcome.clone());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use civic_map_cache::{CacheError, KeyValueStore, MemoryStore};
    use civic_map_invalidation::{Mutation, MutationInvalidator};
    use civic_map_report_models::Urgency;
    use tokio::sync::oneshot;

    use super::*;
    use crate::ViewportErrorKind;

    type Reply = Result<Vec<Pin>, QueryError>;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Mode {
        Respond,
        Fail,
        Hang,
        Controlled,
    }

    struct FakeService {
        calls: AtomicUsize,
        fresh_calls: AtomicUsize,
        mode: Mutex<Mode>,
        pins: Mutex<Vec<Pin>>,
        pending: Mutex<Vec<oneshot::Sender<Reply>>>,
    }

    impl FakeService {
        fn new(mode: Mode, pins: Vec<Pin>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fresh_calls: AtomicUsize::new(0),
                mode: Mutex::new(mode),
                pins: Mutex::new(pins),
                pending: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn fresh_calls(&self) -> usize {
            self.fresh_calls.load(Ordering::SeqCst)
        }

        fn set_mode(&self, mode: Mode) {
            *self.mode.lock().unwrap() = mode;
        }

        fn set_pins(&self, pins: Vec<Pin>) {
            *self.pins.lock().unwrap() = pins;
        }

        /// Answers the `index`-th controlled call. Answers to requests that
        /// were already cancelled go nowhere.
        fn resolve(&self, index: usize, reply: Reply) {
            let sender = self.pending.lock().unwrap().remove(index);
            let _ = sender.send(reply);
        }
    }

    #[async_trait]
    impl SpatialQueryService for FakeService {
        async fn query_pins_in_bounds(&self, _bbox: &BoundingBox) -> Reply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mode = *self.mode.lock().unwrap();
            match mode {
                Mode::Respond => Ok(self.pins.lock().unwrap().clone()),
                Mode::Fail => Err(QueryError::Status {
                    status: 502,
                    message: "Upstream unavailable".to_string(),
                    details: None,
                }),
                Mode::Hang => std::future::pending().await,
                Mode::Controlled => {
                    let (tx, rx) = oneshot::channel();
                    self.pending.lock().unwrap().push(tx);
                    rx.await.unwrap_or_else(|_| {
                        Err(QueryError::Service {
                            message: "reply dropped".to_string(),
                        })
                    })
                }
            }
        }

        async fn query_fresh_pins_in_bounds(&self, bbox: &BoundingBox) -> Reply {
            self.fresh_calls.fetch_add(1, Ordering::SeqCst);
            self.query_pins_in_bounds(bbox).await
        }
    }

    struct StalledStore;

    #[async_trait]
    impl KeyValueStore for StalledStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            std::future::pending().await
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
            Ok(())
        }

        async fn delete(&self, _keys: &[String]) -> Result<u64, CacheError> {
            Ok(0)
        }

        async fn keys(&self, _pattern: &str) -> Result<Vec<String>, CacheError> {
            Ok(Vec::new())
        }
    }

    fn pin(id: &str) -> Pin {
        Pin::new(id, Urgency::High, 10.32, 123.90)
    }

    fn viewport() -> BoundingBox {
        BoundingBox::new(10.30, 123.85, 10.35, 123.95)
    }

    fn cache() -> Arc<CacheStore> {
        Arc::new(CacheStore::new(Arc::new(MemoryStore::new())))
    }

    fn coordinator(cache: &Arc<CacheStore>, service: &Arc<FakeService>) -> ViewportQueryCoordinator {
        let service: Arc<dyn SpatialQueryService> = service.clone();
        ViewportQueryCoordinator::new(Arc::clone(cache), service, CoordinatorConfig::default())
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn ids(snapshot: &ViewportSnapshot) -> Vec<&str> {
        snapshot.pins.iter().map(|p| p.report_id.as_str()).collect()
    }

    #[tokio::test]
    async fn cached_viewport_publishes_without_querying() {
        let cache = cache();
        let key = bounds_key(&viewport());
        cache.set(&key, &vec![pin("r1")], Duration::from_secs(300)).await;
        let service = FakeService::new(Mode::Respond, vec![]);
        let coordinator = coordinator(&cache, &service);

        let outcome = coordinator
            .on_viewport_change(viewport())
            .unwrap()
            .outcome()
            .await;

        assert_eq!(
            outcome,
            RequestOutcome::Published {
                source: PinSource::Cache,
                pins: 1
            }
        );
        assert_eq!(service.calls(), 0);
        let snapshot = coordinator.snapshot();
        assert_eq!(ids(&snapshot), ["r1"]);
        assert_eq!(snapshot.bounds_key.as_deref(), Some(key.as_str()));
        assert!(!snapshot.loading);
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
    }

    #[tokio::test]
    async fn cold_cache_queries_once_then_hits() {
        let cache = cache();
        let service = FakeService::new(Mode::Respond, vec![pin("r2")]);
        let coordinator = coordinator(&cache, &service);

        let first = coordinator
            .on_viewport_change(viewport())
            .unwrap()
            .outcome()
            .await;
        assert_eq!(
            first,
            RequestOutcome::Published {
                source: PinSource::Service,
                pins: 1
            }
        );

        // Rounds to the same grid cell.
        let nudged = BoundingBox::new(10.301, 123.849, 10.349, 123.951);
        let second = coordinator
            .on_viewport_change(nudged)
            .unwrap()
            .outcome()
            .await;
        assert_eq!(
            second,
            RequestOutcome::Published {
                source: PinSource::Cache,
                pins: 1
            }
        );

        assert_eq!(service.calls(), 1);
        assert_eq!(ids(&coordinator.snapshot()), ["r2"]);
    }

    #[tokio::test]
    async fn rapid_pan_publishes_only_the_last_viewport() {
        let cache = cache();
        let service = FakeService::new(Mode::Controlled, vec![]);
        let coordinator = coordinator(&cache, &service);

        let a = coordinator
            .on_viewport_change(BoundingBox::new(1.0, 1.0, 2.0, 2.0))
            .unwrap();
        settle().await;
        let b = coordinator
            .on_viewport_change(BoundingBox::new(3.0, 3.0, 4.0, 4.0))
            .unwrap();
        settle().await;
        let c = coordinator
            .on_viewport_change(BoundingBox::new(5.0, 5.0, 6.0, 6.0))
            .unwrap();
        settle().await;
        assert_eq!(service.calls(), 3);
        let c_generation = c.generation();

        // A and B resolve after C started.
        service.resolve(0, Ok(vec![pin("a1")]));
        service.resolve(0, Ok(vec![pin("b1")]));
        settle().await;
        let snapshot = coordinator.snapshot();
        assert!(snapshot.pins.is_empty());
        assert!(snapshot.loading);

        service.resolve(0, Ok(vec![pin("c1")]));
        assert_eq!(
            c.outcome().await,
            RequestOutcome::Published {
                source: PinSource::Service,
                pins: 1
            }
        );
        assert_eq!(a.outcome().await, RequestOutcome::Cancelled);
        assert_eq!(b.outcome().await, RequestOutcome::Cancelled);

        let snapshot = coordinator.snapshot();
        assert_eq!(ids(&snapshot), ["c1"]);
        assert_eq!(snapshot.generation, c_generation);

        // Superseded requests never populate the cache either.
        let a_key = bounds_key(&BoundingBox::new(1.0, 1.0, 2.0, 2.0));
        assert!(cache.get::<Vec<Pin>>(&a_key).await.is_none());
    }

    #[tokio::test]
    async fn stale_commit_is_discarded() {
        let cache = cache();
        let service = FakeService::new(Mode::Controlled, vec![]);
        let coordinator = coordinator(&cache, &service);

        let first = coordinator.on_viewport_change(viewport()).unwrap();
        let _second = coordinator
            .on_viewport_change(BoundingBox::new(0.0, 0.0, 1.0, 1.0))
            .unwrap();

        let outcome = coordinator.inner.commit(
            first.generation(),
            first.bounds_key(),
            &CancellationToken::new(),
            Fetched::Pins(vec![pin("late")], PinSource::Service),
        );

        assert_eq!(outcome, RequestOutcome::Cancelled);
        assert!(coordinator.snapshot().pins.is_empty());
        assert_eq!(coordinator.state(), CoordinatorState::Querying);
    }

    #[tokio::test]
    async fn creation_forces_a_requery_on_next_touch() {
        let cache = cache();
        let broker = EventBroker::new();
        let invalidator = MutationInvalidator::new(Arc::clone(&cache), broker.clone());
        let service = FakeService::new(Mode::Respond, vec![pin("r1")]);
        let coordinator = coordinator(&cache, &service);

        coordinator
            .on_viewport_change(viewport())
            .unwrap()
            .outcome()
            .await;
        coordinator
            .on_viewport_change(viewport())
            .unwrap()
            .outcome()
            .await;
        assert_eq!(service.calls(), 1);

        invalidator
            .invalidate(&Mutation::ReportCreated {
                report_id: "r9".to_string(),
                author_id: "u1".to_string(),
            })
            .await;

        let outcome = coordinator
            .on_viewport_change(viewport())
            .unwrap()
            .outcome()
            .await;
        assert_eq!(
            outcome,
            RequestOutcome::Published {
                source: PinSource::Service,
                pins: 1
            }
        );
        assert_eq!(service.calls(), 2);
    }

    #[tokio::test]
    async fn creation_notification_refreshes_live_viewport() {
        let cache = cache();
        let broker = EventBroker::new();
        let invalidator = MutationInvalidator::new(Arc::clone(&cache), broker.clone());
        let service = FakeService::new(Mode::Respond, vec![pin("r1")]);
        let coordinator = coordinator(&cache, &service);
        let _watcher = coordinator.watch_invalidations(&broker);

        coordinator
            .on_viewport_change(viewport())
            .unwrap()
            .outcome()
            .await;
        assert_eq!(service.calls(), 1);

        service.set_pins(vec![pin("r1"), pin("r9")]);
        let report = invalidator
            .invalidate(&Mutation::ReportCreated {
                report_id: "r9".to_string(),
                author_id: "u1".to_string(),
            })
            .await;
        assert_eq!(report.notified, 1);
        settle().await;

        assert_eq!(service.calls(), 2);
        let snapshot = coordinator.snapshot();
        assert_eq!(ids(&snapshot), ["r1", "r9"]);
        assert_eq!(snapshot.source, Some(PinSource::Service));
    }

    #[tokio::test]
    async fn refresh_bypasses_a_warm_cache() {
        let cache = cache();
        cache
            .set(
                &bounds_key(&viewport()),
                &vec![pin("stale")],
                Duration::from_secs(300),
            )
            .await;
        let service = FakeService::new(Mode::Respond, vec![pin("fresh")]);
        let coordinator = coordinator(&cache, &service);
        assert!(coordinator.refresh().is_none());

        coordinator
            .on_viewport_change(viewport())
            .unwrap()
            .outcome()
            .await;
        assert_eq!(ids(&coordinator.snapshot()), ["stale"]);

        let outcome = coordinator.refresh().unwrap().outcome().await;
        assert_eq!(
            outcome,
            RequestOutcome::Published {
                source: PinSource::Service,
                pins: 1
            }
        );
        assert_eq!(ids(&coordinator.snapshot()), ["fresh"]);
        assert_eq!(service.calls(), 1);
        assert_eq!(service.fresh_calls(), 1);
        assert_eq!(
            cache
                .get::<Vec<Pin>>(&bounds_key(&viewport()))
                .await
                .unwrap()[0]
                .report_id,
            "fresh"
        );
    }

    #[tokio::test]
    async fn failure_keeps_last_known_good_pins() {
        let cache = cache();
        let service = FakeService::new(Mode::Respond, vec![pin("r1")]);
        let coordinator = coordinator(&cache, &service);
        coordinator
            .on_viewport_change(viewport())
            .unwrap()
            .outcome()
            .await;

        service.set_mode(Mode::Fail);
        let outcome = coordinator
            .on_viewport_change(BoundingBox::new(0.0, 0.0, 1.0, 1.0))
            .unwrap()
            .outcome()
            .await;

        let RequestOutcome::Failed(error) = outcome.clone() else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(error.kind, ViewportErrorKind::Network);
        let snapshot = coordinator.snapshot();
        assert_eq!(ids(&snapshot), ["r1"]);
        assert_eq!(snapshot.error, Some(error));
        assert!(!snapshot.loading);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_surface_after_consecutive_misses() {
        let cache = cache();
        let service = FakeService::new(Mode::Hang, vec![pin("r1")]);
        let coordinator = coordinator(&cache, &service);

        for expected in 1..=2 {
            let outcome = coordinator
                .on_viewport_change(viewport())
                .unwrap()
                .outcome()
                .await;
            assert_eq!(
                outcome,
                RequestOutcome::TimedOut {
                    consecutive: expected
                }
            );
            assert!(coordinator.snapshot().error.is_none());
        }

        let outcome = coordinator
            .on_viewport_change(viewport())
            .unwrap()
            .outcome()
            .await;
        assert_eq!(outcome, RequestOutcome::TimedOut { consecutive: 3 });
        let error = coordinator.snapshot().error.unwrap();
        assert_eq!(error.kind, ViewportErrorKind::Timeout);

        service.set_mode(Mode::Respond);
        coordinator
            .on_viewport_change(viewport())
            .unwrap()
            .outcome()
            .await;
        assert!(coordinator.snapshot().error.is_none());

        service.set_mode(Mode::Hang);
        let outcome = coordinator
            .on_viewport_change(BoundingBox::new(0.0, 0.0, 1.0, 1.0))
            .unwrap()
            .outcome()
            .await;
        assert_eq!(outcome, RequestOutcome::TimedOut { consecutive: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_cache_times_out_like_a_slow_query() {
        let cache = Arc::new(CacheStore::new(Arc::new(StalledStore)));
        let service = FakeService::new(Mode::Respond, vec![pin("r1")]);
        let coordinator = coordinator(&cache, &service);

        let outcome = coordinator
            .on_viewport_change(viewport())
            .unwrap()
            .outcome()
            .await;

        assert_eq!(outcome, RequestOutcome::TimedOut { consecutive: 1 });
        assert_eq!(service.calls(), 0);
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
        assert!(!coordinator.snapshot().loading);
    }

    #[tokio::test]
    async fn bad_bounds_are_a_no_op() {
        let cache = cache();
        let service = FakeService::new(Mode::Controlled, vec![]);
        let coordinator = coordinator(&cache, &service);

        let pending = coordinator.on_viewport_change(viewport()).unwrap();
        settle().await;

        let rejected = coordinator.on_viewport_change(BoundingBox::new(f64::NAN, 0.0, 1.0, 1.0));
        assert!(matches!(rejected, Err(BoundsError::NotFinite { .. })));
        assert!(coordinator.on_viewport_change(BoundingBox::new(0.0, 0.0, 95.0, 1.0)).is_err());

        service.resolve(0, Ok(vec![pin("r1")]));
        assert_eq!(
            pending.outcome().await,
            RequestOutcome::Published {
                source: PinSource::Service,
                pins: 1
            }
        );
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test]
    async fn teardown_cancels_and_stops_everything() {
        let cache = cache();
        let broker = EventBroker::new();
        let service = FakeService::new(Mode::Controlled, vec![]);
        let coordinator = coordinator(&cache, &service);
        let watcher = coordinator.watch_invalidations(&broker);

        let pending = coordinator.on_viewport_change(viewport()).unwrap();
        settle().await;
        assert_eq!(coordinator.state(), CoordinatorState::Querying);
        assert!(coordinator.snapshot().loading);

        coordinator.teardown();
        service.resolve(0, Ok(vec![pin("r1")]));

        assert_eq!(pending.outcome().await, RequestOutcome::Cancelled);
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
        assert_eq!(coordinator.last_outcome(), Some(RequestOutcome::Cancelled));
        assert!(!coordinator.snapshot().loading);
        assert!(coordinator.snapshot().pins.is_empty());
        watcher.await.unwrap();
        assert_eq!(broker.subscriber_count(), 0);

        let after = coordinator.on_viewport_change(viewport()).unwrap();
        assert_eq!(after.outcome().await, RequestOutcome::Cancelled);
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test]
    async fn subscribers_see_the_published_snapshot() {
        let cache = cache();
        let service = FakeService::new(Mode::Respond, vec![pin("r1")]);
        let coordinator = coordinator(&cache, &service);
        let mut rx = coordinator.subscribe();

        coordinator
            .on_viewport_change(viewport())
            .unwrap()
            .outcome()
            .await;

        assert!(rx.has_changed().unwrap());
        assert_eq!(ids(&rx.borrow_and_update()), ["r1"]);
    }
}
