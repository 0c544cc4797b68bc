//! Worker pool that computes frames in parallel and fills the frame cache.
//!
//! Engines never cross into a worker as live objects: every task carries an
//! [`EngineSnapshot`] and the worker restores its own engine from it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::cache::{CacheStats, FrameCache};
use super::engine::{AnimationEngine, ComputeError};
use super::frame::{FrameState, Tick, tick_window};
use super::snapshot::{EngineSnapshot, SnapshotError};
use super::task::{FrameResult, FrameTask, ResultStatus, TaskId, TaskStatus, WorkerId};
use crate::schema::{CompressionType, ExecutionMode, PrecomputeConfig};

/// Upper bound on completed results kept for collection.
const MAX_RETAINED_RESULTS: usize = 4096;

/// How long `shutdown(true)` waits for in-flight tasks.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pool-level failures returned to submitters.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool is shut down")]
    Shutdown,
    #[error("Failed to build worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(#[from] io::Error),
    #[error("Failed to snapshot engine: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Why a single task failed. Becomes an errored [`FrameResult`].
#[derive(Debug, thiserror::Error)]
enum TaskFailure {
    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("compute: {0}")]
    Compute(#[from] ComputeError),
    #[error("engine returned tick {actual} for tick {expected}")]
    TickMismatch { expected: Tick, actual: Tick },
    #[error("worker panicked: {0}")]
    Panicked(String),
}

/// Task bookkeeping guarded by one lock.
#[derive(Default)]
struct TaskBook {
    /// Pending or running tasks by sequence number.
    in_flight: HashMap<u64, (Tick, TaskStatus)>,
    /// Latest in-flight task per tick.
    in_flight_ticks: HashMap<Tick, TaskId>,
    /// Finished results awaiting collection.
    results: HashMap<TaskId, FrameResult>,
    /// Completion order of `results`, oldest first.
    order: VecDeque<TaskId>,
    retained_bytes: usize,
}

impl TaskBook {
    fn retire(&mut self, id: TaskId) {
        if let Some((tick, _)) = self.in_flight.remove(&id.seq())
            && self.in_flight_ticks.get(&tick) == Some(&id)
        {
            self.in_flight_ticks.remove(&tick);
        }
    }

    fn retain_result(&mut self, result: FrameResult, memory_budget: usize) {
        let id = result.task_id;
        self.retained_bytes += result.frame_state.estimated_bytes();
        if let Some(old) = self.results.insert(id, result) {
            self.retained_bytes -= old.frame_state.estimated_bytes();
        } else {
            self.order.push_back(id);
        }

        while self.order.len() > MAX_RETAINED_RESULTS
            || (self.order.len() > 1 && self.retained_bytes > memory_budget)
        {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(dropped) = self.results.remove(&oldest) {
                self.retained_bytes -= dropped.frame_state.estimated_bytes();
            }
        }
    }
}

/// State shared between the pool handle and its workers.
struct PoolShared {
    cache: Arc<FrameCache>,
    book: Mutex<TaskBook>,
    /// Signalled whenever a result is retained or a task retired.
    progress: Condvar,
    next_seq: AtomicU64,
    accepting: AtomicBool,
    abandoned: AtomicBool,
    memory_budget: usize,
    started: Instant,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cache_served: AtomicU64,
    compute_nanos: AtomicU64,
}

impl PoolShared {
    fn book(&self) -> MutexGuard<'_, TaskBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn mark_running(&self, id: TaskId) {
        if let Some(entry) = self.book().in_flight.get_mut(&id.seq()) {
            entry.1 = TaskStatus::Running;
        }
    }

    /// Block until progress is signalled. `None` once `deadline` has passed;
    /// no deadline waits indefinitely.
    fn wait_progress<'a>(
        &self,
        book: MutexGuard<'a, TaskBook>,
        deadline: Option<Instant>,
    ) -> Option<MutexGuard<'a, TaskBook>> {
        let Some(deadline) = deadline else {
            return Some(self.progress.wait(book).unwrap_or_else(|e| e.into_inner()));
        };
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        Some(
            self.progress
                .wait_timeout(book, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0,
        )
    }

    fn discard(&self, id: TaskId) {
        self.book().retire(id);
        self.progress.notify_all();
    }

    fn complete(&self, result: FrameResult) {
        let counter = if result.is_ok() {
            &self.completed
        } else {
            &self.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.compute_nanos
            .fetch_add(result.computation_time.as_nanos() as u64, Ordering::Relaxed);

        {
            let mut book = self.book();
            book.retire(result.task_id);
            book.retain_result(result, self.memory_budget);
        }
        self.progress.notify_all();
    }
}

/// Where tasks are executed.
enum Executor {
    Threads(rayon::ThreadPool),
    Isolated {
        jobs: Sender<FrameTask>,
        workers: Vec<JoinHandle<()>>,
    },
}

/// Restore an engine from the task's snapshot and compute its tick.
fn compute_task<E: AnimationEngine>(task: &FrameTask) -> Result<FrameState, TaskFailure> {
    let engine = E::restore(&task.snapshot)?;
    let frame = engine.compute_frame_state(task.tick)?;
    if frame.tick != task.tick {
        return Err(TaskFailure::TickMismatch {
            expected: task.tick,
            actual: frame.tick,
        });
    }
    Ok(frame)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one task on worker `worker` and publish its result.
fn execute<E: AnimationEngine>(shared: &PoolShared, task: FrameTask, worker: usize) {
    if shared.abandoned.load(Ordering::Relaxed) {
        shared.discard(task.id);
        return;
    }
    shared.mark_running(task.id);

    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| compute_task::<E>(&task)))
        .unwrap_or_else(|payload| Err(TaskFailure::Panicked(panic_message(payload))));
    let computation_time = started.elapsed();

    let result = match outcome {
        Ok(frame) => {
            let frame = Arc::new(frame);
            shared.cache.store_shared(task.tick, Arc::clone(&frame));
            debug!(
                "{} computed tick {} in {:?} on worker {}",
                task.id, task.tick, computation_time, worker
            );
            FrameResult {
                task_id: task.id,
                tick: task.tick,
                frame_state: frame,
                worker_id: WorkerId::Worker(worker),
                computation_time,
                status: ResultStatus::Ok,
            }
        }
        Err(failure) => {
            warn!("{} failed for tick {}: {}", task.id, task.tick, failure);
            FrameResult::errored(
                task.id,
                task.tick,
                worker,
                computation_time,
                failure.to_string(),
            )
        }
    };

    shared.complete(result);
}

fn isolated_worker<E: AnimationEngine>(
    index: usize,
    jobs: Arc<Mutex<Receiver<FrameTask>>>,
    shared: Arc<PoolShared>,
) {
    loop {
        let next = jobs.lock().unwrap_or_else(|e| e.into_inner()).recv();
        match next {
            Ok(task) => execute::<E>(&shared, task, index),
            Err(_) => break,
        }
    }
    debug!("isolated worker {} exiting", index);
}

/// Cumulative pool metrics.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub worker_count: usize,
    pub mode: ExecutionMode,
    /// Tasks dispatched to workers.
    pub tasks_submitted: u64,
    /// Tasks that produced a frame.
    pub tasks_completed: u64,
    /// Tasks that produced an errored result.
    pub tasks_failed: u64,
    /// Submissions answered from the cache.
    pub cache_served: u64,
    pub in_flight: usize,
    pub total_compute_time: Duration,
    pub average_compute_time: Duration,
    /// Finished tasks per second of pool uptime.
    pub throughput_fps: f64,
    /// Share of worker time spent computing (0-100).
    pub worker_utilization_pct: f64,
    pub cache: CacheStats,
}

impl fmt::Display for PoolMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Workers: {} ({:?})", self.worker_count, self.mode)?;
        writeln!(
            f,
            "Tasks: {} submitted, {} completed, {} failed, {} in flight, {} served from cache",
            self.tasks_submitted,
            self.tasks_completed,
            self.tasks_failed,
            self.in_flight,
            self.cache_served
        )?;
        writeln!(
            f,
            "Compute: {:.2?} total, {:.3?} avg, {:.1} frames/s, {:.1}% utilization",
            self.total_compute_time,
            self.average_compute_time,
            self.throughput_fps,
            self.worker_utilization_pct
        )?;
        write!(f, "Cache: {}", self.cache)
    }
}

/// Fixed set of parallel frame workers.
pub struct WorkerPool<E: AnimationEngine> {
    shared: Arc<PoolShared>,
    executor: Mutex<Option<Executor>>,
    worker_count: usize,
    mode: ExecutionMode,
    compression: CompressionType,
    _engine: PhantomData<fn() -> E>,
}

impl<E: AnimationEngine> WorkerPool<E> {
    /// Start `worker_count` workers that publish into `cache`.
    ///
    /// `memory_budget` bounds the bytes of finished results held for
    /// collection; the oldest are dropped first.
    pub fn new(
        worker_count: usize,
        mode: ExecutionMode,
        cache: Arc<FrameCache>,
        memory_budget: usize,
    ) -> Result<Self, PoolError> {
        let worker_count = worker_count.max(1);
        let shared = Arc::new(PoolShared {
            cache,
            book: Mutex::new(TaskBook::default()),
            progress: Condvar::new(),
            next_seq: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            abandoned: AtomicBool::new(false),
            memory_budget,
            started: Instant::now(),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cache_served: AtomicU64::new(0),
            compute_nanos: AtomicU64::new(0),
        });

        let executor = match mode {
            ExecutionMode::Threads => Executor::Threads(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(worker_count)
                    .thread_name(|i| format!("frame-worker-{i}"))
                    .build()?,
            ),
            ExecutionMode::Isolated => {
                let (jobs, rx) = mpsc::channel();
                let rx = Arc::new(Mutex::new(rx));
                let mut workers = Vec::with_capacity(worker_count);
                for index in 0..worker_count {
                    let rx = Arc::clone(&rx);
                    let shared = Arc::clone(&shared);
                    workers.push(
                        thread::Builder::new()
                            .name(format!("frame-worker-{index}"))
                            .spawn(move || isolated_worker::<E>(index, rx, shared))?,
                    );
                }
                Executor::Isolated { jobs, workers }
            }
        };

        info!("worker pool started: {} workers ({:?})", worker_count, mode);

        Ok(Self {
            shared,
            executor: Mutex::new(Some(executor)),
            worker_count,
            mode,
            compression: CompressionType::None,
            _engine: PhantomData,
        })
    }

    /// Build a pool from configuration.
    pub fn from_config(config: &PrecomputeConfig, cache: Arc<FrameCache>) -> Result<Self, PoolError> {
        Ok(Self::new(
            config.workers.count,
            config.workers.mode,
            cache,
            config.workers.memory_budget_bytes,
        )?
        .with_compression(config.snapshot_compression))
    }

    /// Set the compression used for task snapshots.
    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// The cache this pool publishes into.
    pub fn cache(&self) -> &Arc<FrameCache> {
        &self.shared.cache
    }

    /// Whether new submissions are accepted.
    pub fn is_running(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), PoolError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(PoolError::Shutdown)
        }
    }

    /// Answer from the cache if possible.
    fn serve_cached(&self, tick: Tick) -> Option<TaskId> {
        let frame = self.shared.cache.get_frame(tick)?;
        let id = TaskId::Cached {
            seq: self.shared.next_seq(),
            tick,
        };
        self.shared.cache_served.fetch_add(1, Ordering::Relaxed);
        self.shared
            .book()
            .retain_result(FrameResult::cached(id, frame), self.shared.memory_budget);
        self.shared.progress.notify_all();
        Some(id)
    }

    fn dispatch(&self, tick: Tick, snapshot: EngineSnapshot) -> Result<TaskId, PoolError> {
        let id = TaskId::Compute(self.shared.next_seq());
        {
            let mut book = self.shared.book();
            book.in_flight.insert(id.seq(), (tick, TaskStatus::Pending));
            book.in_flight_ticks.insert(tick, id);
        }
        let task = FrameTask { id, tick, snapshot };

        let executor = self.executor.lock().unwrap_or_else(|e| e.into_inner());
        let sent = match executor.as_ref() {
            Some(Executor::Threads(pool)) => {
                let shared = Arc::clone(&self.shared);
                pool.spawn(move || {
                    let worker = rayon::current_thread_index().unwrap_or(0);
                    execute::<E>(&shared, task, worker);
                });
                true
            }
            Some(Executor::Isolated { jobs, .. }) => jobs.send(task).is_ok(),
            None => false,
        };
        drop(executor);

        if !sent {
            self.shared.discard(id);
            return Err(PoolError::Shutdown);
        }
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        debug!("{} dispatched for tick {}", id, tick);
        Ok(id)
    }

    /// Submit one tick.
    ///
    /// A cached tick returns a [`TaskId::Cached`] whose result is available
    /// immediately. Otherwise the engine is snapshotted and the task queued.
    pub fn submit_frame_computation(&self, tick: Tick, engine: &E) -> Result<TaskId, PoolError> {
        self.ensure_running()?;
        if let Some(id) = self.serve_cached(tick) {
            return Ok(id);
        }
        let snapshot = engine.snapshot(self.compression)?;
        self.dispatch(tick, snapshot)
    }

    /// Submit ticks `start_tick..start_tick + count`, each checked against the
    /// cache independently. The engine is snapshotted at most once. The range
    /// is cut short at `Tick::MAX`.
    pub fn submit_batch_computation(
        &self,
        start_tick: Tick,
        count: usize,
        engine: &E,
    ) -> Result<Vec<TaskId>, PoolError> {
        let ticks: Vec<Tick> = tick_window(start_tick, count).collect();
        self.submit_ticks(&ticks, engine)
    }

    /// Submit an arbitrary set of ticks, in order, sharing one snapshot.
    pub fn submit_ticks(&self, ticks: &[Tick], engine: &E) -> Result<Vec<TaskId>, PoolError> {
        self.ensure_running()?;
        let mut snapshot: Option<EngineSnapshot> = None;
        let mut ids = Vec::with_capacity(ticks.len());

        for &tick in ticks {
            if let Some(id) = self.serve_cached(tick) {
                ids.push(id);
                continue;
            }
            let task_snapshot = match snapshot.clone() {
                Some(s) => s,
                None => snapshot.insert(engine.snapshot(self.compression)?).clone(),
            };
            ids.push(self.dispatch(tick, task_snapshot)?);
        }

        Ok(ids)
    }

    /// Finished result for `id`, or `None` while pending or unknown.
    pub fn get_computed_frame(&self, id: &TaskId) -> Option<FrameResult> {
        self.shared.book().results.get(id).cloned()
    }

    /// Current lifecycle state of a task, if still tracked.
    pub fn task_status(&self, id: &TaskId) -> Option<TaskStatus> {
        let book = self.shared.book();
        if let Some(result) = book.results.get(id) {
            return Some(result.task_status());
        }
        book.in_flight.get(&id.seq()).map(|&(_, status)| status)
    }

    /// In-flight task currently computing `tick`, if any.
    pub fn in_flight_task(&self, tick: Tick) -> Option<TaskId> {
        self.shared.book().in_flight_ticks.get(&tick).copied()
    }

    /// Number of pending or running tasks.
    pub fn in_flight_count(&self) -> usize {
        self.shared.book().in_flight.len()
    }

    /// Collect results for `ids`, waiting at most `timeout`.
    ///
    /// Returns whatever subset finished in time. Ids that are neither in
    /// flight nor finished are not waited for.
    pub fn wait_for_batch_completion(
        &self,
        ids: &[TaskId],
        timeout: Duration,
    ) -> HashMap<TaskId, FrameResult> {
        let deadline = Instant::now().checked_add(timeout);
        let wanted: HashSet<TaskId> = ids.iter().copied().collect();
        let mut collected = HashMap::with_capacity(wanted.len());

        let mut book = self.shared.book();
        loop {
            let mut waiting = false;
            for id in &wanted {
                if collected.contains_key(id) {
                    continue;
                }
                if let Some(result) = book.results.get(id) {
                    collected.insert(*id, result.clone());
                } else if book.in_flight.contains_key(&id.seq()) {
                    waiting = true;
                }
            }

            if !waiting {
                break;
            }
            match self.shared.wait_progress(book, deadline) {
                Some(next) => book = next,
                None => break,
            }
        }

        collected
    }

    /// Wait at most `timeout` for a single task.
    pub fn wait_for_task(&self, id: TaskId, timeout: Duration) -> Option<FrameResult> {
        self.wait_for_batch_completion(&[id], timeout).remove(&id)
    }

    /// Stop accepting tasks.
    ///
    /// With `wait`, in-flight tasks get a bounded grace period to finish;
    /// without it, queued tasks are abandoned. Safe to call repeatedly.
    pub fn shutdown(&self, wait: bool) {
        if !self.shared.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        if !wait {
            self.shared.abandoned.store(true, Ordering::Relaxed);
        }

        let executor = self
            .executor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let drained = if wait { self.drain(SHUTDOWN_DRAIN_TIMEOUT) } else { false };

        match executor {
            // Rayon threads exit on their own once the pool handle is dropped.
            Some(Executor::Threads(pool)) => drop(pool),
            Some(Executor::Isolated { jobs, workers }) => {
                drop(jobs);
                if drained {
                    for worker in workers {
                        if worker.join().is_err() {
                            warn!("isolated worker panicked during shutdown");
                        }
                    }
                }
            }
            None => {}
        }

        info!(
            "worker pool shut down (wait={}, {} task(s) still in flight)",
            wait,
            self.in_flight_count()
        );
    }

    /// Block until no task is in flight or `timeout` elapses.
    fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut book = self.shared.book();
        while !book.in_flight.is_empty() {
            let pending = book.in_flight.len();
            match self.shared.wait_progress(book, deadline) {
                Some(next) => book = next,
                None => {
                    warn!("{} task(s) still in flight after drain timeout", pending);
                    return false;
                }
            }
        }
        true
    }

    /// Cumulative metrics.
    pub fn metrics(&self) -> PoolMetrics {
        let s = &self.shared;
        let completed = s.completed.load(Ordering::Relaxed);
        let failed = s.failed.load(Ordering::Relaxed);
        let finished = completed + failed;
        let compute_nanos = s.compute_nanos.load(Ordering::Relaxed);
        let total_compute_time = Duration::from_nanos(compute_nanos);
        let uptime = s.started.elapsed().as_secs_f64();

        PoolMetrics {
            worker_count: self.worker_count,
            mode: self.mode,
            tasks_submitted: s.submitted.load(Ordering::Relaxed),
            tasks_completed: completed,
            tasks_failed: failed,
            cache_served: s.cache_served.load(Ordering::Relaxed),
            in_flight: self.in_flight_count(),
            total_compute_time,
            average_compute_time: compute_nanos
                .checked_div(finished)
                .map_or(Duration::ZERO, Duration::from_nanos),
            throughput_fps: if uptime > 0.0 {
                finished as f64 / uptime
            } else {
                0.0
            },
            worker_utilization_pct: if uptime > 0.0 {
                (total_compute_time.as_secs_f64() / (uptime * self.worker_count as f64) * 100.0)
                    .min(100.0)
            } else {
                0.0
            },
            cache: s.cache.get_cache_stats(),
        }
    }
}

impl<E: AnimationEngine> Drop for WorkerPool<E> {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}
