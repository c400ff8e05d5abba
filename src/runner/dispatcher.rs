//! Schedules reconciles by Podwatcher id.
//!
//! Every key is in one of four states: idle, queued, in flight, or in flight with another trigger
//! received since it started (dirty). A key is never reconciled by two tasks at once: triggers that
//! arrive while it's in flight just mark it dirty, and it gets queued again once the current
//! reconcile finishes. At most `worker_count` reconciles run at the same time, across all keys.
//!
//! Failed reconciles are retried after a per-key exponential backoff, which resets as soon as a
//! reconcile of that key succeeds.
use crate::config::OperatorConfig;
use crate::reconciler::{Action, Reconcile, ReconcileError};
use crate::resource::ObjectId;
use crate::runner::metrics::Metrics;
use crate::runner::{duration_to_millis, CappedBackoff};

use backoff::backoff::Backoff;
use tokio::sync::mpsc::{self, error::SendError, Receiver, Sender};
use tokio_util::sync::CancellationToken;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
enum Message {
    Trigger(ObjectId),
    Finished {
        key: ObjectId,
        result: Result<Action, ReconcileError>,
        duration: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Queued,
    InFlight { dirty: bool },
}

#[derive(Debug)]
struct KeyState {
    phase: Phase,
    backoff: CappedBackoff,
}

/// Cloneable handle for requesting reconciles and for stopping the dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    sender: Sender<Message>,
    shutdown: CancellationToken,
}

impl DispatcherHandle {
    /// Requests a reconcile of `key`. Returns an error only if the dispatcher has stopped.
    pub async fn trigger(&self, key: ObjectId) -> Result<(), DispatcherStopped> {
        self.sender
            .send(Message::Trigger(key))
            .await
            .map_err(|_: SendError<Message>| DispatcherStopped)
    }

    /// Stops the dispatcher and cancels every reconcile that's in flight
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Resolves once `shutdown` has been called
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStopped;

impl std::fmt::Display for DispatcherStopped {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("dispatcher has stopped")
    }
}

impl std::error::Error for DispatcherStopped {}

pub struct Dispatcher<R: Reconcile> {
    reconciler: Arc<R>,
    metrics: Metrics,
    worker_count: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    shutdown: CancellationToken,
    keys: HashMap<ObjectId, KeyState>,
    ready: VecDeque<ObjectId>,
    in_flight: usize,
}

impl<R: Reconcile> Dispatcher<R> {
    pub fn new(
        reconciler: Arc<R>,
        config: &OperatorConfig,
        metrics: Metrics,
    ) -> (Dispatcher<R>, DispatcherHandle) {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        let handle = DispatcherHandle {
            sender: sender.clone(),
            shutdown: shutdown.clone(),
        };
        let dispatcher = Dispatcher {
            reconciler,
            metrics,
            worker_count: config.worker_count.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            sender,
            receiver,
            shutdown,
            keys: HashMap::new(),
            ready: VecDeque::new(),
            in_flight: 0,
        };
        (dispatcher, handle)
    }

    /// Runs until the handle is shut down, then waits for the cancelled reconciles to finish
    pub async fn run(mut self) {
        log::info!(
            "Starting dispatcher with {} workers",
            self.worker_count
        );
        loop {
            self.start_ready();
            let message = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                message = self.receiver.recv() => message,
            };
            match message {
                Some(message) => self.handle_message(message),
                None => break,
            }
        }

        log::info!(
            "Shutting down dispatcher with {} reconciles in flight",
            self.in_flight
        );
        while self.in_flight > 0 {
            match self.receiver.recv().await {
                Some(Message::Finished { key, result, .. }) => {
                    self.in_flight -= 1;
                    self.metrics.reconcile_finished();
                    log::debug!("Reconcile of {} ended during shutdown: {:?}", key, result);
                }
                Some(Message::Trigger(_)) => {}
                None => break,
            }
        }
        log::info!("Dispatcher stopped");
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Trigger(key) => self.trigger(key),
            Message::Finished {
                key,
                result,
                duration,
            } => self.finished(key, result, duration),
        }
    }

    fn key_state(&mut self, key: &ObjectId) -> &mut KeyState {
        let initial = self.initial_backoff;
        let max = self.max_backoff;
        self.keys.entry(key.clone()).or_insert_with(|| KeyState {
            phase: Phase::Idle,
            backoff: CappedBackoff::new(initial, max),
        })
    }

    fn trigger(&mut self, key: ObjectId) {
        let state = self.key_state(&key);
        match state.phase {
            Phase::Idle => {
                state.phase = Phase::Queued;
                log::trace!("Queued reconcile of {}", key);
                self.ready.push_back(key);
            }
            Phase::Queued => {
                log::trace!("Reconcile of {} is already queued", key);
            }
            Phase::InFlight { .. } => {
                log::trace!("Reconcile of {} is in flight, will run again after", key);
                state.phase = Phase::InFlight { dirty: true };
            }
        }
    }

    fn start_ready(&mut self) {
        while self.in_flight < self.worker_count {
            let key = match self.ready.pop_front() {
                Some(key) => key,
                None => return,
            };
            self.key_state(&key).phase = Phase::InFlight { dirty: false };
            self.in_flight += 1;
            self.metrics.reconcile_started(&key.as_id_ref());

            let reconciler = self.reconciler.clone();
            let sender = self.sender.clone();
            let cancel = self.shutdown.child_token();
            tokio::spawn(async move {
                log::debug!("Starting reconcile of {}", key);
                let start_time = Instant::now();
                let result = reconciler.reconcile(&key, &cancel).await;
                let message = Message::Finished {
                    key,
                    result,
                    duration: start_time.elapsed(),
                };
                if sender.send(message).await.is_err() {
                    log::warn!("Dispatcher stopped before reconcile result could be delivered");
                }
            });
        }
    }

    fn finished(&mut self, key: ObjectId, result: Result<Action, ReconcileError>, duration: Duration) {
        self.in_flight -= 1;
        self.metrics.reconcile_finished();
        let max_backoff = self.max_backoff;

        let state = self.key_state(&key);
        let dirty = match state.phase {
            Phase::InFlight { dirty } => dirty,
            other => {
                log::error!(
                    "Got a finished reconcile for {} which was not in flight, phase: {:?}",
                    key,
                    other
                );
                false
            }
        };
        state.phase = Phase::Idle;

        let requeue_after = match result {
            Ok(action) => {
                state.backoff.reset();
                log::info!(
                    "Completed reconcile of {} in {}ms with {:?}",
                    key,
                    duration_to_millis(duration),
                    action
                );
                match action {
                    Action::Done => None,
                    Action::Gone => {
                        // starting the reconcile recreated the series for this key
                        self.metrics.podwatcher_deleted(&key.as_id_ref());
                        None
                    }
                    Action::RequeueAfter(delay) => Some(delay),
                }
            }
            Err(ReconcileError::Cancelled) => {
                log::info!("Reconcile of {} was cancelled", key);
                None
            }
            Err(err) => {
                let delay = state.backoff.next_backoff().unwrap_or(max_backoff);
                log::warn!(
                    "Reconcile of {} failed after {}ms, retrying in {}ms: {}",
                    key,
                    duration_to_millis(duration),
                    duration_to_millis(delay),
                    err
                );
                self.metrics.reconcile_error(&key.as_id_ref());
                Some(delay)
            }
        };

        if dirty {
            // something changed while the reconcile was running, so there's no reason to wait
            self.trigger(key);
            return;
        }
        match requeue_after {
            None => {
                self.keys.remove(&key);
            }
            Some(delay) if delay == Duration::from_millis(0) => {
                self.metrics.requeue_scheduled();
                self.trigger(key);
            }
            Some(delay) => {
                self.metrics.requeue_scheduled();
                self.schedule_requeue(key, delay);
            }
        }
    }

    fn schedule_requeue(&self, key: ObjectId, delay: Duration) {
        log::trace!(
            "Scheduling reconcile of {} in {}ms",
            key,
            duration_to_millis(delay)
        );
        let sender = self.sender.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if sender.send(Message::Trigger(key)).await.is_err() {
                        log::debug!("Dispatcher stopped before scheduled reconcile");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use crate::store::StoreError;

    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorded {
        calls: HashMap<ObjectId, usize>,
        running: HashSet<ObjectId>,
        max_running: usize,
        overlapping: bool,
        scripted: HashMap<ObjectId, VecDeque<Result<Action, ReconcileError>>>,
    }

    /// Sleeps for `work` in every call, so that triggers can pile up while it runs
    struct FakeReconciler {
        work: Duration,
        wait_for_cancel: bool,
        recorded: Mutex<Recorded>,
    }

    impl FakeReconciler {
        fn new(work: Duration) -> FakeReconciler {
            FakeReconciler {
                work,
                wait_for_cancel: false,
                recorded: Mutex::new(Recorded::default()),
            }
        }

        fn script(&self, key: &ObjectId, results: Vec<Result<Action, ReconcileError>>) {
            self.recorded
                .lock()
                .unwrap()
                .scripted
                .insert(key.clone(), results.into_iter().collect());
        }

        fn calls(&self, key: &ObjectId) -> usize {
            self.recorded.lock().unwrap().calls.get(key).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Reconcile for FakeReconciler {
        async fn reconcile(
            &self,
            key: &ObjectId,
            cancel: &CancellationToken,
        ) -> Result<Action, ReconcileError> {
            let scripted = {
                let mut recorded = self.recorded.lock().unwrap();
                *recorded.calls.entry(key.clone()).or_insert(0) += 1;
                if !recorded.running.insert(key.clone()) {
                    recorded.overlapping = true;
                }
                recorded.max_running = recorded.max_running.max(recorded.running.len());
                recorded.scripted.get_mut(key).and_then(VecDeque::pop_front)
            };

            let result = if self.wait_for_cancel {
                cancel.cancelled().await;
                Err(ReconcileError::Cancelled)
            } else {
                tokio::time::sleep(self.work).await;
                scripted.unwrap_or(Ok(Action::Done))
            };

            self.recorded.lock().unwrap().running.remove(key);
            result
        }
    }

    fn config(workers: usize) -> OperatorConfig {
        OperatorConfig::new("dispatcher-test")
            .worker_count(workers)
            .backoff(Duration::from_millis(10), Duration::from_millis(50))
    }

    fn run<F: std::future::Future>(future: F) -> F::Output {
        let _ = env_logger::try_init();
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("failed to build runtime")
            .block_on(future)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn start(
        reconciler: &Arc<FakeReconciler>,
        workers: usize,
    ) -> (tokio::task::JoinHandle<()>, DispatcherHandle) {
        let metrics = Metrics::new().expect("failed to create metrics");
        let (dispatcher, handle) = Dispatcher::new(reconciler.clone(), &config(workers), metrics);
        (tokio::spawn(dispatcher.run()), handle)
    }

    #[test]
    fn triggers_during_reconcile_collapse_into_one_rerun() {
        let reconciler = Arc::new(FakeReconciler::new(Duration::from_millis(100)));
        let key = ObjectId::new("ns", "web");
        run(async {
            let (task, handle) = start(&reconciler, 4);
            handle.trigger(key.clone()).await.unwrap();
            wait_until(|| reconciler.calls(&key) == 1).await;
            for _ in 0..5 {
                handle.trigger(key.clone()).await.unwrap();
            }
            wait_until(|| reconciler.calls(&key) == 2).await;
            tokio::time::sleep(Duration::from_millis(250)).await;
            assert_eq!(2, reconciler.calls(&key));

            handle.shutdown();
            task.await.unwrap();
        });
        assert!(!reconciler.recorded.lock().unwrap().overlapping);
    }

    #[test]
    fn worker_count_bounds_concurrency() {
        let reconciler = Arc::new(FakeReconciler::new(Duration::from_millis(50)));
        let keys = (0..6)
            .map(|i| ObjectId::new("ns", format!("web-{}", i)))
            .collect::<Vec<_>>();
        run(async {
            let (task, handle) = start(&reconciler, 2);
            for key in keys.iter() {
                handle.trigger(key.clone()).await.unwrap();
            }
            wait_until(|| keys.iter().all(|k| reconciler.calls(k) == 1)).await;
            handle.shutdown();
            task.await.unwrap();
        });
        assert_eq!(2, reconciler.recorded.lock().unwrap().max_running);
    }

    #[test]
    fn errors_are_retried_until_success() {
        let reconciler = Arc::new(FakeReconciler::new(Duration::from_millis(1)));
        let key = ObjectId::new("ns", "web");
        let transient = || Err(ReconcileError::Store(StoreError::transient("unavailable")));
        reconciler.script(&key, vec![transient(), transient(), Ok(Action::Done)]);
        run(async {
            let (task, handle) = start(&reconciler, 1);
            handle.trigger(key.clone()).await.unwrap();
            wait_until(|| reconciler.calls(&key) == 3).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(3, reconciler.calls(&key));
            handle.shutdown();
            task.await.unwrap();
        });
    }

    #[test]
    fn requeue_after_runs_again() {
        let reconciler = Arc::new(FakeReconciler::new(Duration::from_millis(1)));
        let key = ObjectId::new("ns", "web");
        reconciler.script(
            &key,
            vec![
                Ok(Action::requeue_now()),
                Ok(Action::RequeueAfter(Duration::from_millis(20))),
                Ok(Action::Done),
            ],
        );
        run(async {
            let (task, handle) = start(&reconciler, 1);
            handle.trigger(key.clone()).await.unwrap();
            wait_until(|| reconciler.calls(&key) == 3).await;
            handle.shutdown();
            task.await.unwrap();
        });
    }

    #[test]
    fn series_of_a_deleted_podwatcher_do_not_outlive_it() {
        let reconciler = Arc::new(FakeReconciler::new(Duration::from_millis(1)));
        let gone = ObjectId::new("ns", "gone");
        let kept = ObjectId::new("ns", "kept");
        reconciler.script(&gone, vec![Ok(Action::Gone), Ok(Action::Gone)]);
        let metrics = Metrics::new().expect("failed to create metrics");
        let encoded = |metrics: &Metrics| {
            String::from_utf8(metrics.encode_as_text().unwrap()).unwrap()
        };
        run(async {
            let (dispatcher, handle) = Dispatcher::new(reconciler.clone(), &config(1), metrics.clone());
            let task = tokio::spawn(dispatcher.run());

            handle.trigger(kept.clone()).await.unwrap();
            wait_until(|| reconciler.calls(&kept) == 1).await;

            // the delete event of the Podwatcher itself, then one from a pod removed by the cascade
            for expected_calls in 1..=2 {
                handle.trigger(gone.clone()).await.unwrap();
                wait_until(|| reconciler.calls(&gone) == expected_calls).await;
                wait_until(|| !encoded(&metrics).contains("name=\"gone\"")).await;
            }

            handle.shutdown();
            task.await.unwrap();
        });
        let text = encoded(&metrics);
        assert!(!text.contains("name=\"gone\""), "stale series in: {}", text);
        assert!(text.contains("name=\"kept\""), "missing series in: {}", text);
    }

    #[test]
    fn shutdown_cancels_reconciles_in_flight() {
        let reconciler = Arc::new(FakeReconciler {
            work: Duration::from_millis(1),
            wait_for_cancel: true,
            recorded: Mutex::new(Recorded::default()),
        });
        let key = ObjectId::new("ns", "web");
        run(async {
            let (task, handle) = start(&reconciler, 1);
            handle.trigger(key.clone()).await.unwrap();
            wait_until(|| reconciler.calls(&key) == 1).await;
            handle.shutdown();
            task.await.unwrap();
            assert!(handle.trigger(key.clone()).await.is_err());
        });
        assert!(reconciler.recorded.lock().unwrap().running.is_empty());
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let mut backoff = CappedBackoff::new(Duration::from_millis(100), Duration::from_millis(400));
        let mut last = Duration::from_millis(0);
        for _ in 0..20 {
            last = backoff.next_backoff().unwrap();
            assert!(last <= Duration::from_millis(600), "backoff exceeded cap: {:?}", last);
        }
        assert!(last >= Duration::from_millis(200));
        backoff.reset();
        assert!(backoff.next_backoff().unwrap() <= Duration::from_millis(150));
    }
}
