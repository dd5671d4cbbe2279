//! Bounded worker pool for test units.
//!
//! A rayon pool of exactly `max_concurrency` threads runs one worker loop per
//! thread. Workers read units from a bounded FIFO crossbeam channel; each unit
//! gets a fresh session from the [`SessionFactory`], runs on exactly one
//! worker, and delivers its outcome to the shared [`ResultAggregator`] and to
//! its optional completion callback.
//!
//! `join` waits on a pending counter coupled with the queue: `enqueue`
//! increments it before the unit is handed to the queue and the worker
//! decrements it after the outcome has been delivered, so `join` can never
//! return while a unit submitted before its return is still outstanding.

use crossbeam::channel::{self, Receiver, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::SessionFactory;
use crate::config::Config;
use crate::error::ExecutorResult;
use crate::report::{ExecutionOutcome, ResultAggregator};
use crate::suite::Suite;
use crate::unit::TestUnit;

/// Queue slots per worker before `enqueue` applies backpressure
pub const QUEUE_DEPTH_PER_WORKER: usize = 16;

/// Called with the unit name and outcome once a unit completes
pub type CompletionCallback = Box<dyn FnOnce(&str, &ExecutionOutcome) + Send>;

struct Job {
    unit: Box<dyn TestUnit>,
    on_complete: Option<CompletionCallback>,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Submitted but not yet completed
    pending: usize,
    /// Currently executing on a worker
    running: usize,
    /// Highest `running` observed
    peak_running: usize,
}

struct Shared {
    state: Mutex<PoolState>,
    idle: Condvar,
    results: Arc<ResultAggregator>,
    factory: Arc<dyn SessionFactory>,
    config: Arc<Config>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self) {
        let mut state = self.state();
        state.running += 1;
        state.peak_running = state.peak_running.max(state.running);
    }

    fn finish(&self) {
        let mut state = self.state();
        state.running = state.running.saturating_sub(1);
        state.pending = state.pending.saturating_sub(1);
        if state.pending == 0 {
            self.idle.notify_all();
        }
    }
}

/// Fixed-size pool executing test units concurrently
pub struct Executor {
    sender: Option<Sender<Job>>,
    // Held for the lifetime of the executor; its threads run the worker loops
    _pool: rayon::ThreadPool,
    shared: Arc<Shared>,
    max_concurrency: usize,
}

impl Executor {
    /// Start `max_concurrency` workers (at least one)
    pub fn new(max_concurrency: usize, factory: Arc<dyn SessionFactory>, config: Arc<Config>) -> ExecutorResult<Self> {
        let max_concurrency = if max_concurrency == 0 {
            warn!("Worker count must be positive, using 1");
            1
        } else {
            max_concurrency
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_concurrency)
            .thread_name(|index| format!("image-tester-worker-{}", index))
            .build()?;

        let (sender, receiver) = channel::bounded::<Job>(max_concurrency * QUEUE_DEPTH_PER_WORKER);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState::default()),
            idle: Condvar::new(),
            results: Arc::new(ResultAggregator::new()),
            factory,
            config,
        });

        for id in 0..max_concurrency {
            let receiver = receiver.clone();
            let shared = Arc::clone(&shared);
            pool.spawn(move || worker_loop(id, receiver, &shared));
        }

        debug!("Executor started with {} worker(s)", max_concurrency);
        Ok(Self {
            sender: Some(sender),
            _pool: pool,
            shared,
            max_concurrency,
        })
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Shared collector of every outcome produced by this executor
    pub fn results(&self) -> Arc<ResultAggregator> {
        Arc::clone(&self.shared.results)
    }

    /// Highest number of units observed executing at once
    pub fn peak_concurrency(&self) -> usize {
        self.shared.state().peak_running
    }

    /// Submit a unit for execution.
    ///
    /// Blocks only while the queue is full. May be called from any thread,
    /// including concurrently with [`join`](Self::join).
    pub fn enqueue(&self, unit: Box<dyn TestUnit>, on_complete: Option<CompletionCallback>) {
        self.shared.state().pending += 1;
        debug!("Enqueued '{}'", unit.name());

        let job = Job { unit, on_complete };
        let rejected = match &self.sender {
            Some(sender) => sender.send(job).err().map(|e| e.into_inner()),
            None => Some(job),
        };

        // Only reachable when every worker is gone
        if let Some(job) = rejected {
            let outcome = ExecutionOutcome::Errored("no worker available".to_string());
            deliver(job, outcome, &self.shared);
        }
    }

    /// Block until every submitted unit has completed and the pool is idle
    pub fn join(&self) {
        let mut state = self.shared.state();
        while state.pending > 0 {
            state = self
                .shared
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Enqueue every unit of `suite`, then join
    pub fn run(&self, suite: Suite) {
        let started = Instant::now();
        let count = suite.len();
        info!("Running {} unit(s) on {} worker(s)", count, self.max_concurrency);

        for unit in suite.into_units() {
            self.enqueue(unit, None);
        }
        self.join();

        info!("Suite finished in {} ms", started.elapsed().as_millis());
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Disconnecting the queue ends every worker loop once it drains
        self.sender.take();
        self.join();
    }
}

fn worker_loop(id: usize, receiver: Receiver<Job>, shared: &Shared) {
    for job in receiver.iter() {
        shared.start();
        let outcome = execute(job.unit.as_ref(), shared);
        deliver(job, outcome, shared);
    }
    debug!("Worker {} exiting", id);
}

/// Run one unit with its own session; never panics
fn execute(unit: &dyn TestUnit, shared: &Shared) -> ExecutionOutcome {
    let name = unit.name();
    debug!("Starting {} '{}'", unit.kind(), name);

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        match shared.factory.new_session(&shared.config, name) {
            Ok(mut session) => unit.run(session.as_mut()),
            Err(e) => ExecutionOutcome::Errored(format!("Backend error: {}", e)),
        }
    }));

    result.unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        error!("Unit '{}' panicked: {}", name, message);
        ExecutionOutcome::Errored(format!("panic: {}", message))
    })
}

/// Record the outcome, notify the callback, then release the pending slot
fn deliver(job: Job, outcome: ExecutionOutcome, shared: &Shared) {
    let Job { unit, on_complete } = job;
    let name = unit.name().to_string();
    drop(unit);

    match &outcome {
        ExecutionOutcome::Passed => info!("[PASSED] {}", name),
        ExecutionOutcome::Failed(detail) => warn!("[FAILED] {} - {}", name, detail),
        ExecutionOutcome::Errored(cause) => error!("[ERROR] {} - {}", name, cause),
    }

    if let Some(callback) = on_complete {
        let delivered = panic::catch_unwind(AssertUnwindSafe(|| callback(&name, &outcome)));
        if delivered.is_err() {
            error!("Completion callback for '{}' panicked", name);
        }
    }
    shared.results.record(&name, outcome);
    shared.finish();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Verdict, VisualSession};
    use crate::error::{BackendError, BackendResult};
    use crate::test_support::RecordingSession;
    use crate::unit::{Checkpoint, UnitKind};
    use crate::error::UnitResult;
    use image::DynamicImage;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    struct StubUnit {
        name: String,
        config: Config,
        delay: Duration,
        panics: bool,
    }

    impl StubUnit {
        fn boxed(name: &str, delay_ms: u64) -> Box<dyn TestUnit> {
            Box::new(Self {
                name: name.to_string(),
                config: Config::new("App"),
                delay: Duration::from_millis(delay_ms),
                panics: false,
            })
        }
    }

    impl TestUnit for StubUnit {
        fn name(&self) -> &str {
            &self.name
        }

        fn path(&self) -> &Path {
            Path::new(".")
        }

        fn kind(&self) -> UnitKind {
            UnitKind::SingleFile
        }

        fn config(&self) -> &Config {
            &self.config
        }

        fn checkpoints(&self) -> UnitResult<Vec<Checkpoint>> {
            thread::sleep(self.delay);
            if self.panics {
                panic!("stub exploded");
            }
            Ok(vec![Checkpoint {
                step_name: "only".into(),
                image: DynamicImage::new_rgba8(1, 1),
            }])
        }
    }

    struct Factory {
        created: AtomicUsize,
        fail_for: Option<String>,
    }

    impl SessionFactory for Factory {
        fn new_session(&self, _config: &Config, unit_name: &str) -> BackendResult<Box<dyn VisualSession>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            if self.fail_for.as_deref() == Some(unit_name) {
                return Err(BackendError::Unavailable("connection refused".into()));
            }
            Ok(Box::new(RecordingSession::new(Verdict::Passed)))
        }
    }

    fn executor(workers: usize, fail_for: Option<&str>) -> (Executor, Arc<Factory>) {
        let factory = Arc::new(Factory {
            created: AtomicUsize::new(0),
            fail_for: fail_for.map(String::from),
        });
        let executor = Executor::new(workers, factory.clone(), Arc::new(Config::new("App"))).unwrap();
        (executor, factory)
    }

    #[test]
    fn test_every_unit_recorded_once() {
        let (executor, factory) = executor(3, None);
        for i in 0..20 {
            executor.enqueue(StubUnit::boxed(&format!("u{}", i), 1), None);
        }
        executor.join();

        let mut names: Vec<String> = executor.results().snapshot().into_iter().map(|r| r.name).collect();
        names.sort();
        let mut expected: Vec<String> = (0..20).map(|i| format!("u{}", i)).collect();
        expected.sort();
        assert_eq!(names, expected);
        assert_eq!(factory.created.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_concurrency_is_bounded() {
        let (executor, _) = executor(2, None);
        for i in 0..8 {
            executor.enqueue(StubUnit::boxed(&format!("u{}", i), 20), None);
        }
        executor.join();
        assert!(executor.peak_concurrency() <= 2);
        assert!(executor.peak_concurrency() >= 1);
    }

    #[test]
    fn test_panic_and_backend_error_are_isolated() {
        let (executor, _) = executor(1, Some("offline"));
        executor.enqueue(
            Box::new(StubUnit {
                name: "boom".into(),
                config: Config::new("App"),
                delay: Duration::ZERO,
                panics: true,
            }),
            None,
        );
        executor.enqueue(StubUnit::boxed("offline", 0), None);
        executor.enqueue(StubUnit::boxed("fine", 0), None);
        executor.join();

        let records = executor.results().snapshot();
        assert_eq!(records.len(), 3);
        let outcome = |name: &str| records.iter().find(|r| r.name == name).unwrap().outcome.clone();
        assert!(matches!(outcome("boom"), ExecutionOutcome::Errored(m) if m.contains("stub exploded")));
        assert!(matches!(outcome("offline"), ExecutionOutcome::Errored(m) if m.contains("connection refused")));
        assert_eq!(outcome("fine"), ExecutionOutcome::Passed);
    }

    #[test]
    fn test_callback_receives_outcome() {
        let (executor, _) = executor(2, None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        executor.enqueue(
            StubUnit::boxed("cb", 0),
            Some(Box::new(move |name: &str, outcome: &ExecutionOutcome| {
                sink.lock().unwrap().push((name.to_string(), outcome.clone()));
            })),
        );
        executor.join();
        assert_eq!(*seen.lock().unwrap(), vec![("cb".to_string(), ExecutionOutcome::Passed)]);
    }

    #[test]
    fn test_join_on_idle_pool_returns() {
        let (executor, _) = executor(2, None);
        executor.join();
        assert!(executor.results().is_empty());
    }

    #[test]
    fn test_zero_workers_clamped() {
        let (executor, _) = executor(0, None);
        assert_eq!(executor.max_concurrency(), 1);
        executor.enqueue(StubUnit::boxed("u", 0), None);
        executor.join();
        assert_eq!(executor.results().len(), 1);
    }

    #[test]
    fn test_units_run_on_pool_threads() {
        let (executor, _) = executor(2, None);
        let threads = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let threads = Arc::clone(&threads);
            executor.enqueue(
                StubUnit::boxed(&format!("u{}", i), 1),
                Some(Box::new(move |_: &str, _: &ExecutionOutcome| {
                    let name = thread::current().name().map(String::from);
                    threads.lock().unwrap().push(name);
                })),
            );
        }
        executor.join();

        let threads = threads.lock().unwrap();
        assert_eq!(threads.len(), 4);
        assert!(threads
            .iter()
            .all(|name| name.as_deref().is_some_and(|n| n.starts_with("image-tester-worker-"))));
    }

    #[test]
    fn test_drop_completes_queued_units() {
        let (executor, _) = executor(1, None);
        let results = executor.results();
        for i in 0..5 {
            executor.enqueue(StubUnit::boxed(&format!("u{}", i), 2), None);
        }
        drop(executor);
        assert_eq!(results.len(), 5);
    }
}
