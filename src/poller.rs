use crate::client::ClientError;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    type Snapshot: Send + 'static;

    fn resource(&self) -> &'static str;

    async fn fetch(&self) -> Result<Self::Snapshot, ClientError>;
}

pub trait StateSink<T>: Send + Sync + 'static {
    fn snapshot_received(&self, snapshot: T, at_unix: i64);
    fn fetch_failed(&self, error: &ClientError, at_unix: i64);
}

#[derive(Debug, Clone, Serialize)]
pub struct PollState<T> {
    pub snapshot: Option<T>,
    pub error: Option<String>,
    pub last_success_unix: Option<i64>,
    pub last_failure_unix: Option<i64>,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
}

impl<T> Default for PollState<T> {
    fn default() -> Self {
        Self {
            snapshot: None,
            error: None,
            last_success_unix: None,
            last_failure_unix: None,
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
        }
    }
}

impl<T> PollState<T> {
    pub fn is_loading(&self) -> bool {
        self.snapshot.is_none()
    }

    pub fn apply_success(&mut self, snapshot: T, at_unix: i64) {
        self.snapshot = Some(snapshot);
        self.error = None;
        self.last_success_unix = Some(at_unix);
        self.successes = self.successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    pub fn apply_failure(&mut self, error: &ClientError, at_unix: i64) {
        self.error = Some(error.to_string());
        self.last_failure_unix = Some(at_unix);
        self.failures = self.failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

pub struct ViewState<T> {
    tx: watch::Sender<PollState<T>>,
}

impl<T: Send + Sync + 'static> ViewState<T> {
    pub fn new() -> (Self, watch::Receiver<PollState<T>>) {
        let (tx, rx) = watch::channel(PollState::default());
        (Self { tx }, rx)
    }
}

impl<T: Send + Sync + 'static> StateSink<T> for ViewState<T> {
    fn snapshot_received(&self, snapshot: T, at_unix: i64) {
        self.tx
            .send_modify(|state| state.apply_success(snapshot, at_unix));
    }

    fn fetch_failed(&self, error: &ClientError, at_unix: i64) {
        self.tx.send_modify(|state| state.apply_failure(error, at_unix));
    }
}

pub struct Poller<S, V> {
    source: S,
    sink: V,
    interval: Duration,
}

impl<S, V> Poller<S, V>
where
    S: SnapshotSource,
    V: StateSink<S::Snapshot>,
{
    pub fn new(source: S, interval: Duration, sink: V) -> Self {
        Self {
            source,
            sink,
            interval,
        }
    }

    pub fn mount(self) -> PollerHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let retry = Arc::new(Notify::new());
        let resource = self.source.resource();
        let task = tokio::spawn(self.run(cancel_rx, retry.clone()));
        info!(resource, "поллер запущен");
        PollerHandle {
            resource,
            cancel: cancel_tx,
            retry,
            task: Some(task),
        }
    }

    async fn run(self, mut cancel: watch::Receiver<bool>, retry: Arc<Notify>) {
        let resource = self.source.resource();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.changed() => break,
                _ = ticker.tick() => {}
                _ = retry.notified() => {
                    debug!(resource, "ручной повтор запроса");
                }
            }
            if is_cancelled(&cancel) {
                break;
            }

            let result = tokio::select! {
                biased;
                _ = cancel.changed() => break,
                result = self.source.fetch() => result,
            };

            // представление могли закрыть, пока запрос завершался
            if is_cancelled(&cancel) {
                break;
            }

            let now = now_unix();
            match result {
                Ok(snapshot) => {
                    debug!(resource, "снимок обновлен");
                    self.sink.snapshot_received(snapshot, now);
                }
                Err(err) => {
                    warn!(resource, error = %err, "не удалось обновить снимок");
                    self.sink.fetch_failed(&err, now);
                }
            }
        }

        debug!(resource, "цикл опроса остановлен");
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow() || cancel.has_changed().is_err()
}

pub struct PollerHandle {
    resource: &'static str,
    cancel: watch::Sender<bool>,
    retry: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    pub fn retry(&self) {
        self.retry.notify_one();
    }

    pub fn resource(&self) -> &'static str {
        self.resource
    }

    pub fn is_mounted(&self) -> bool {
        !*self.cancel.borrow() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub async fn unmount(mut self) {
        let _ = self.cancel.send(true);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(resource = self.resource, error = %err, "задача поллера завершилась с ошибкой");
            }
        }
        info!(resource = self.resource, "поллер остановлен");
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::fixtures;
    use crate::snapshot::DashboardSnapshot;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::{sleep, Instant};

    fn unavailable() -> ClientError {
        ClientError::Status {
            url: "http://panel/api/v1/dashboard/stats".to_string(),
            status: 503,
            body: String::new(),
        }
    }

    struct ScriptedSource {
        replies: Mutex<VecDeque<Result<DashboardSnapshot, ClientError>>>,
        calls: Arc<Mutex<Vec<Instant>>>,
    }

    impl ScriptedSource {
        fn new(replies: Vec<Result<DashboardSnapshot, ClientError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        type Snapshot = DashboardSnapshot;

        fn resource(&self) -> &'static str {
            "scripted"
        }

        async fn fetch(&self) -> Result<DashboardSnapshot, ClientError> {
            self.calls.lock().unwrap().push(Instant::now());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(unavailable()))
        }
    }

    struct GatedSource {
        started: Arc<Notify>,
        gate: Arc<Notify>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        starts: Arc<AtomicUsize>,
        hold: Option<Duration>,
    }

    impl GatedSource {
        fn new(hold: Option<Duration>) -> Self {
            Self {
                started: Arc::new(Notify::new()),
                gate: Arc::new(Notify::new()),
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_in_flight: Arc::new(AtomicUsize::new(0)),
                starts: Arc::new(AtomicUsize::new(0)),
                hold,
            }
        }
    }

    #[async_trait]
    impl SnapshotSource for GatedSource {
        type Snapshot = DashboardSnapshot;

        fn resource(&self) -> &'static str {
            "gated"
        }

        async fn fetch(&self) -> Result<DashboardSnapshot, ClientError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.started.notify_one();
            match self.hold {
                Some(hold) => sleep(hold).await,
                None => self.gate.notified().await,
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(fixtures::dashboard(1.0, 2.0, 3.0))
        }
    }

    #[derive(Clone, Default)]
    struct SpySink {
        applied: Arc<Mutex<Vec<Result<DashboardSnapshot, String>>>>,
    }

    impl SpySink {
        fn calls(&self) -> usize {
            self.applied.lock().unwrap().len()
        }
    }

    impl StateSink<DashboardSnapshot> for SpySink {
        fn snapshot_received(&self, snapshot: DashboardSnapshot, _at_unix: i64) {
            self.applied.lock().unwrap().push(Ok(snapshot));
        }

        fn fetch_failed(&self, error: &ClientError, _at_unix: i64) {
            self.applied.lock().unwrap().push(Err(error.to_string()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn three_ticks_apply_three_snapshots_in_order() {
        let payloads = vec![
            fixtures::dashboard(10.0, 20.0, 30.0),
            fixtures::dashboard(11.0, 21.0, 31.0),
            fixtures::dashboard(12.0, 22.0, 32.0),
        ];
        let source = ScriptedSource::new(payloads.iter().cloned().map(Ok).collect());
        let calls = source.calls.clone();
        let spy = SpySink::default();
        let start = Instant::now();

        let handle = Poller::new(source, Duration::from_millis(30_000), spy.clone()).mount();
        sleep(Duration::from_millis(60_000 + 1)).await;
        handle.unmount().await;

        let applied = spy.applied.lock().unwrap().clone();
        assert_eq!(applied.len(), 3);
        for (got, want) in applied.iter().zip(&payloads) {
            assert_eq!(got.as_ref().unwrap(), want);
        }

        let offsets: Vec<u128> = calls
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.duration_since(start).as_millis())
            .collect();
        assert_eq!(offsets, vec![0, 30_000, 60_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_keeps_last_good_snapshot_and_sets_error() {
        let first = fixtures::dashboard(23.4, 67.0, 45.0);
        let source = ScriptedSource::new(vec![Ok(first.clone()), Err(unavailable())]);
        let (view, mut rx) = ViewState::new();
        let handle = Poller::new(source, Duration::from_secs(3600), view).mount();

        rx.changed().await.expect("первый снимок");
        {
            let state = rx.borrow_and_update();
            assert_eq!(state.snapshot.as_ref(), Some(&first));
            assert!(state.error.is_none());
        }

        handle.retry();
        rx.changed().await.expect("ошибка повтора");
        {
            let state = rx.borrow_and_update();
            assert_eq!(state.snapshot.as_ref(), Some(&first));
            assert!(state.error.as_deref().unwrap_or_default().contains("503"));
            assert_eq!(state.consecutive_failures, 1);
            assert_eq!(state.successes, 1);
        }

        handle.unmount().await;
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_failure_clears_error() {
        let second = fixtures::dashboard(5.0, 5.0, 5.0);
        let source = ScriptedSource::new(vec![Err(unavailable()), Ok(second.clone())]);
        let (view, mut rx) = ViewState::new();
        let handle = Poller::new(source, Duration::from_secs(30), view).mount();

        rx.changed().await.expect("первая ошибка");
        {
            let state = rx.borrow_and_update();
            assert!(state.is_loading());
            assert!(state.error.is_some());
        }

        rx.changed().await.expect("успех на следующем тике");
        {
            let state = rx.borrow_and_update();
            assert!(!state.is_loading());
            assert_eq!(state.snapshot.as_ref(), Some(&second));
            assert!(state.error.is_none());
            assert_eq!(state.consecutive_failures, 0);
        }

        handle.unmount().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retry_fetches_outside_the_interval() {
        let source = ScriptedSource::new(vec![
            Ok(fixtures::dashboard(1.0, 1.0, 1.0)),
            Ok(fixtures::dashboard(2.0, 2.0, 2.0)),
        ]);
        let calls = source.calls.clone();
        let spy = SpySink::default();
        let handle = Poller::new(source, Duration::from_secs(30), spy.clone()).mount();

        sleep(Duration::from_secs(5)).await;
        assert_eq!(spy.calls(), 1);

        handle.retry();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(spy.calls(), 2);
        assert_eq!(calls.lock().unwrap().len(), 2);

        handle.unmount().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_state_updates_after_unmount() {
        let source = GatedSource::new(None);
        let started = source.started.clone();
        let gate = source.gate.clone();
        let spy = SpySink::default();
        let handle = Poller::new(source, Duration::from_secs(30), spy.clone()).mount();

        started.notified().await;
        assert!(handle.is_mounted());
        handle.unmount().await;

        gate.notify_waiters();
        sleep(Duration::from_secs(120)).await;
        assert_eq!(spy.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_cancels_polling() {
        let source = ScriptedSource::new(vec![Ok(fixtures::dashboard(1.0, 1.0, 1.0))]);
        let calls = source.calls.clone();
        let spy = SpySink::default();
        let handle = Poller::new(source, Duration::from_secs(30), spy.clone()).mount();

        sleep(Duration::from_secs(1)).await;
        assert_eq!(spy.calls(), 1);
        drop(handle);

        sleep(Duration::from_secs(300)).await;
        assert_eq!(spy.calls(), 1);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_during_fetch_collapse_into_one_follow_up() {
        let source = GatedSource::new(Some(Duration::from_secs(10)));
        let max_in_flight = source.max_in_flight.clone();
        let starts = source.starts.clone();
        let spy = SpySink::default();
        let handle = Poller::new(source, Duration::from_secs(3600), spy.clone()).mount();

        sleep(Duration::from_secs(1)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        handle.retry();
        handle.retry();
        handle.retry();

        sleep(Duration::from_secs(25)).await;
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(spy.calls(), 2);

        handle.unmount().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_never_overlaps() {
        let source = GatedSource::new(Some(Duration::from_secs(35)));
        let max_in_flight = source.max_in_flight.clone();
        let starts = source.starts.clone();
        let spy = SpySink::default();
        let handle = Poller::new(source, Duration::from_secs(10), spy.clone()).mount();

        sleep(Duration::from_secs(100)).await;
        handle.unmount().await;

        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        let started = starts.load(Ordering::SeqCst);
        assert!((2..=3).contains(&started), "запусков: {started}");
        assert!(spy.calls() >= 2);
    }
}
