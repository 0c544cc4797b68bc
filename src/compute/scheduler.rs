//! Predictive scheduler: the consumer-facing frame delivery front.
//!
//! Frames are served from the pool/cache when they arrive within the fallback
//! threshold, otherwise computed synchronously. A background prediction loop
//! keeps the cache filled ahead of the playback position and the tuner grows
//! the horizon and cache when the frame budget is missed.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::cache::FrameCache;
use super::engine::AnimationEngine;
use super::frame::{FrameState, Tick, tick_window};
use super::pool::{PoolError, WorkerPool};
use super::task::TaskId;
use crate::schema::{ConfigError, MAX_CACHE_FRAMES, MAX_PREDICTION_HORIZON, PrecomputeConfig};

/// Frame times kept for the rolling average.
const FRAME_TIME_WINDOW: usize = 120;

/// Used when the configured fallback threshold is not a valid duration.
const DEFAULT_FALLBACK_THRESHOLD: Duration = Duration::from_millis(8);

/// How long `stop_prediction` waits for the loop to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Horizon hit rate below which the tuner grows the horizon.
const HORIZON_HIT_RATE_THRESHOLD: f64 = 0.7;

/// Cache hit rate below which the tuner grows the cache.
const CACHE_HIT_RATE_THRESHOLD: f64 = 0.8;

/// Scheduler construction failures.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("Failed to spawn prediction thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Runtime-tunable prediction parameters.
#[derive(Debug, Clone)]
struct Tuning {
    horizon: usize,
    batch_size: usize,
    cycle_interval: Duration,
    adaptive: bool,
    cache_warming: bool,
    fallback_threshold: Duration,
}

#[derive(Debug, Default)]
struct StatsBook {
    requests: u64,
    precomputed_hits: u64,
    fallbacks: u64,
    failures: u64,
    no_engine: u64,
    prediction_cycles: u64,
    frame_times_ms: VecDeque<f64>,
}

impl StatsBook {
    fn record_frame_time(&mut self, ms: f64) {
        if self.frame_times_ms.len() == FRAME_TIME_WINDOW {
            self.frame_times_ms.pop_front();
        }
        self.frame_times_ms.push_back(ms);
    }

    fn average_frame_time_ms(&self) -> f64 {
        if self.frame_times_ms.is_empty() {
            0.0
        } else {
            self.frame_times_ms.iter().sum::<f64>() / self.frame_times_ms.len() as f64
        }
    }
}

/// Delivery statistics.
#[derive(Debug, Clone)]
pub struct DeliveryStats {
    pub requests: u64,
    /// Requests answered by the pool or cache in time.
    pub precomputed_hits: u64,
    /// Requests computed synchronously.
    pub fallbacks: u64,
    /// Fallbacks whose computation failed.
    pub failures: u64,
    /// Requests made with no engine attached.
    pub no_engine: u64,
    pub prediction_cycles: u64,
    /// Precomputed hits over requests.
    pub hit_rate: f64,
    /// Rolling average over the last frames.
    pub average_frame_time_ms: f64,
    pub max_frame_time_ms: f64,
    pub current_tick: Tick,
    pub prediction_horizon: usize,
    pub prediction_batch_size: usize,
    pub predicting: bool,
}

impl fmt::Display for DeliveryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Requests: {} ({} precomputed, {} fallback, {} failed, {} without engine)",
            self.requests, self.precomputed_hits, self.fallbacks, self.failures, self.no_engine
        )?;
        writeln!(f, "Precomputed hit rate: {:.1}%", self.hit_rate * 100.0)?;
        writeln!(
            f,
            "Frame time: {:.3} ms avg, {:.3} ms max",
            self.average_frame_time_ms, self.max_frame_time_ms
        )?;
        write!(
            f,
            "Prediction: {} (tick {}, horizon {}, batch {}, {} cycles)",
            if self.predicting { "running" } else { "stopped" },
            self.current_tick,
            self.prediction_horizon,
            self.prediction_batch_size,
            self.prediction_cycles
        )
    }
}

/// Outcome of [`FrameScheduler::optimize_for_target_fps`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// Average frame time is within budget; nothing changed.
    MeetingTarget,
    /// At least one parameter was raised.
    Optimized,
    /// Over budget but every tunable is already at its bound.
    AtLimits,
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OptimizationStatus::MeetingTarget => "meeting_target",
            OptimizationStatus::Optimized => "optimized",
            OptimizationStatus::AtLimits => "at_limits",
        })
    }
}

/// One applied parameter change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuningChange {
    pub parameter: &'static str,
    pub old: usize,
    pub new: usize,
}

/// Structured tuning report.
#[derive(Debug, Clone)]
pub struct OptimizationReport {
    pub status: OptimizationStatus,
    pub target_fps: f64,
    pub target_frame_time_ms: f64,
    pub average_frame_time_ms: f64,
    pub precomputed_hit_rate: f64,
    pub cache_hit_rate: f64,
    pub changes: Vec<TuningChange>,
    pub recommendations: Vec<String>,
}

impl fmt::Display for OptimizationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Status: {} (target {:.1} fps = {:.2} ms, average {:.2} ms)",
            self.status, self.target_fps, self.target_frame_time_ms, self.average_frame_time_ms
        )?;
        writeln!(
            f,
            "Hit rates: {:.1}% precomputed, {:.1}% cache",
            self.precomputed_hit_rate * 100.0,
            self.cache_hit_rate * 100.0
        )?;
        for change in &self.changes {
            writeln!(f, "Changed {}: {} -> {}", change.parameter, change.old, change.new)?;
        }
        for rec in &self.recommendations {
            writeln!(f, "- {rec}")?;
        }
        Ok(())
    }
}

/// State shared with the prediction thread.
struct SchedulerShared<E: AnimationEngine> {
    pool: Arc<WorkerPool<E>>,
    engine: RwLock<Option<Arc<E>>>,
    tuning: Mutex<Tuning>,
    stats: Mutex<StatsBook>,
    current_tick: AtomicU64,
}

impl<E: AnimationEngine> SchedulerShared<E> {
    fn engine(&self) -> Option<Arc<E>> {
        self.engine.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn tuning(&self) -> MutexGuard<'_, Tuning> {
        self.tuning.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stats(&self) -> MutexGuard<'_, StatsBook> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Submit the ticks of `start..start + count` that are neither cached nor
    /// already in flight. Returns the number of new tasks.
    fn submit_window(&self, start: Tick, count: usize, engine: &E) -> Result<usize, PoolError> {
        let cache = self.pool.cache();
        let missing: Vec<Tick> = tick_window(start, count)
            .filter(|&t| !cache.contains(t) && self.pool.in_flight_task(t).is_none())
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }
        self.pool.submit_ticks(&missing, engine)?;
        Ok(missing.len())
    }

    /// Ask the pool for `tick`, waiting at most `timeout`.
    fn precomputed(&self, tick: Tick, engine: &E, timeout: Duration) -> Option<Arc<FrameState>> {
        let id = match self.pool.in_flight_task(tick) {
            Some(id) => id,
            None => self.pool.submit_frame_computation(tick, engine).ok()?,
        };
        let result = self.pool.wait_for_task(id, timeout)?;
        (result.is_ok() && result.frame_state.tick == tick).then_some(result.frame_state)
    }

    /// One background cycle: fill the horizon, then wait briefly for its head.
    fn prediction_cycle(&self) -> Result<usize, PoolError> {
        let Some(engine) = self.engine() else {
            return Ok(0);
        };
        let (horizon, batch_size, wait) = {
            let tuning = self.tuning();
            (tuning.horizon, tuning.batch_size, tuning.cycle_interval)
        };

        let submitted = match self.current_tick.load(Ordering::Relaxed).checked_add(1) {
            Some(start) => {
                let submitted = self.submit_window(start, horizon, &engine)?;
                self.wait_for_lead(start, batch_size, wait);
                submitted
            }
            None => 0,
        };

        self.stats().prediction_cycles += 1;
        Ok(submitted)
    }

    /// Wait up to `timeout` for the in-flight ticks among the first
    /// `batch_size` of the window.
    fn wait_for_lead(&self, start: Tick, batch_size: usize, timeout: Duration) {
        let lead: Vec<TaskId> = tick_window(start, batch_size)
            .filter_map(|t| self.pool.in_flight_task(t))
            .collect();
        if !lead.is_empty() {
            self.pool.wait_for_batch_completion(&lead, timeout);
        }
    }
}

/// Time left in a cycle of length `interval` that began at `cycle_started`.
fn remaining_interval(cycle_started: Instant, interval: Duration) -> Duration {
    interval.saturating_sub(cycle_started.elapsed())
}

fn prediction_loop<E: AnimationEngine>(
    shared: Arc<SchedulerShared<E>>,
    stop: Receiver<()>,
    done: Sender<()>,
) {
    info!("prediction loop started");
    loop {
        let cycle_started = Instant::now();
        match panic::catch_unwind(AssertUnwindSafe(|| shared.prediction_cycle())) {
            Ok(Ok(0)) => {}
            Ok(Ok(submitted)) => debug!("prediction cycle submitted {} tick(s)", submitted),
            Ok(Err(PoolError::Shutdown)) => debug!("prediction cycle skipped: pool shut down"),
            Ok(Err(e)) => warn!("prediction cycle failed: {}", e),
            Err(_) => warn!("prediction cycle panicked"),
        }

        let interval = shared.tuning().cycle_interval;
        match stop.recv_timeout(remaining_interval(cycle_started, interval)) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("prediction loop stopped");
    let _ = done.send(());
}

struct PredictionHandle {
    stop: Sender<()>,
    done: Receiver<()>,
    thread: JoinHandle<()>,
}

/// Consumer-facing frame delivery with background look-ahead.
pub struct FrameScheduler<E: AnimationEngine> {
    shared: Arc<SchedulerShared<E>>,
    predictor: Mutex<Option<PredictionHandle>>,
}

impl<E: AnimationEngine> FrameScheduler<E> {
    /// Build a scheduler with its own cache and pool.
    pub fn new(config: &PrecomputeConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let cache = Arc::new(FrameCache::from_config(&config.cache));
        let pool = Arc::new(WorkerPool::from_config(config, cache)?);
        Ok(Self::with_pool(pool, config))
    }

    /// Build a scheduler on an existing pool.
    pub fn with_pool(pool: Arc<WorkerPool<E>>, config: &PrecomputeConfig) -> Self {
        let tuning = Tuning {
            horizon: config.prediction.horizon_frames,
            batch_size: config.prediction.batch_size,
            cycle_interval: Duration::from_millis(config.prediction.cycle_interval_ms),
            adaptive: config.prediction.adaptive,
            cache_warming: config.prediction.cache_warming,
            fallback_threshold: Duration::try_from_secs_f64(config.timing.fallback_threshold_ms / 1000.0)
                .unwrap_or(DEFAULT_FALLBACK_THRESHOLD),
        };

        Self {
            shared: Arc::new(SchedulerShared {
                pool,
                engine: RwLock::new(None),
                tuning: Mutex::new(tuning),
                stats: Mutex::new(StatsBook::default()),
                current_tick: AtomicU64::new(0),
            }),
            predictor: Mutex::new(None),
        }
    }

    /// Attach the engine frames are computed from.
    ///
    /// Cached frames from a previous engine are discarded.
    pub fn attach_engine(&self, engine: E) {
        let previous = self
            .shared
            .engine
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Arc::new(engine));
        if previous.is_some() {
            self.shared.pool.cache().clear_cache();
        }
        info!("engine attached");
    }

    /// Detach the engine. Subsequent requests return `None`.
    pub fn detach_engine(&self) -> Option<Arc<E>> {
        self.shared
            .engine
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn has_engine(&self) -> bool {
        self.shared.engine().is_some()
    }

    pub fn pool(&self) -> &Arc<WorkerPool<E>> {
        &self.shared.pool
    }

    pub fn cache(&self) -> &Arc<FrameCache> {
        self.shared.pool.cache()
    }

    /// Move the playback position without requesting a frame.
    pub fn set_current_tick(&self, tick: Tick) {
        self.shared.current_tick.store(tick, Ordering::Relaxed);
    }

    pub fn current_tick(&self) -> Tick {
        self.shared.current_tick.load(Ordering::Relaxed)
    }

    pub fn prediction_horizon(&self) -> usize {
        self.shared.tuning().horizon
    }

    pub fn prediction_batch_size(&self) -> usize {
        self.shared.tuning().batch_size
    }

    /// Frame for `tick`, waiting up to `timeout` (default: the fallback
    /// threshold) for a precomputed result before computing synchronously.
    ///
    /// Returns `None` when no engine is attached or the engine fails or panics.
    pub fn get_frame_for_tick(
        &self,
        tick: Tick,
        timeout: Option<Duration>,
    ) -> Option<Arc<FrameState>> {
        let started = Instant::now();
        self.shared.current_tick.store(tick, Ordering::Relaxed);

        let Some(engine) = self.shared.engine() else {
            let mut stats = self.shared.stats();
            stats.requests += 1;
            stats.no_engine += 1;
            debug!("frame {} requested with no engine attached", tick);
            return None;
        };
        let (timeout, horizon) = {
            let tuning = self.shared.tuning();
            (timeout.unwrap_or(tuning.fallback_threshold), tuning.horizon)
        };

        if let Some(frame) = self.shared.precomputed(tick, &engine, timeout) {
            let mut stats = self.shared.stats();
            stats.requests += 1;
            stats.precomputed_hits += 1;
            stats.record_frame_time(started.elapsed().as_secs_f64() * 1000.0);
            return Some(frame);
        }

        let computed = panic::catch_unwind(AssertUnwindSafe(|| engine.compute_frame_state(tick)));
        let frame = match computed {
            Ok(Ok(frame)) if frame.tick == tick => {
                let frame = Arc::new(frame);
                self.shared.pool.cache().store_shared(tick, Arc::clone(&frame));
                Some(frame)
            }
            Ok(Ok(frame)) => {
                warn!("fallback computation for tick {} returned tick {}", tick, frame.tick);
                None
            }
            Ok(Err(e)) => {
                warn!("fallback computation failed for tick {}: {}", tick, e);
                None
            }
            Err(_) => {
                warn!("fallback computation panicked for tick {}", tick);
                None
            }
        };

        if let Some(next) = tick.checked_add(1)
            && let Err(e) = self.shared.submit_window(next, horizon, &engine)
        {
            debug!("look-ahead after fallback at tick {} not submitted: {}", tick, e);
        }

        let mut stats = self.shared.stats();
        stats.requests += 1;
        stats.fallbacks += 1;
        if frame.is_none() {
            stats.failures += 1;
        }
        stats.record_frame_time(started.elapsed().as_secs_f64() * 1000.0);
        drop(stats);

        debug!("tick {} served by fallback", tick);
        frame
    }

    /// Frame for `tick` with the default timeout.
    pub fn get_frame(&self, tick: Tick) -> Option<Arc<FrameState>> {
        self.get_frame_for_tick(tick, None)
    }

    /// Start the background prediction loop. No-op if already running.
    pub fn start_prediction(&self) -> Result<(), SchedulerError> {
        let mut predictor = self.predictor.lock().unwrap_or_else(|e| e.into_inner());
        if predictor.is_some() {
            return Ok(());
        }

        let (warming, horizon) = {
            let tuning = self.shared.tuning();
            (tuning.cache_warming, tuning.horizon)
        };
        if warming && let Some(engine) = self.shared.engine() {
            let start = self.current_tick();
            match self.shared.submit_window(start, horizon, &engine) {
                Ok(n) => debug!("cache warming submitted {} tick(s) from {}", n, start),
                Err(e) => warn!("cache warming failed: {}", e),
            }
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name("frame-predictor".into())
            .spawn(move || prediction_loop(shared, stop_rx, done_tx))?;

        *predictor = Some(PredictionHandle {
            stop: stop_tx,
            done: done_rx,
            thread,
        });
        Ok(())
    }

    /// Stop the background loop, waiting a bounded time for it to exit.
    /// Returns false if it was not running.
    pub fn stop_prediction(&self) -> bool {
        let Some(handle) = self
            .predictor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return false;
        };

        let _ = handle.stop.send(());
        match handle.done.recv_timeout(STOP_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.thread.join().is_err() {
                    warn!("prediction thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("prediction thread did not stop within {:?}; detaching", STOP_TIMEOUT);
            }
        }
        true
    }

    pub fn is_predicting(&self) -> bool {
        self.predictor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Stop prediction and shut the pool down, draining in-flight tasks.
    pub fn shutdown(&self) {
        self.stop_prediction();
        self.shared.pool.shutdown(true);
    }

    /// Current delivery statistics.
    pub fn stats(&self) -> DeliveryStats {
        let (horizon, batch_size) = {
            let tuning = self.shared.tuning();
            (tuning.horizon, tuning.batch_size)
        };
        let predicting = self.is_predicting();
        let stats = self.shared.stats();

        DeliveryStats {
            requests: stats.requests,
            precomputed_hits: stats.precomputed_hits,
            fallbacks: stats.fallbacks,
            failures: stats.failures,
            no_engine: stats.no_engine,
            prediction_cycles: stats.prediction_cycles,
            hit_rate: if stats.requests > 0 {
                stats.precomputed_hits as f64 / stats.requests as f64
            } else {
                0.0
            },
            average_frame_time_ms: stats.average_frame_time_ms(),
            max_frame_time_ms: stats.frame_times_ms.iter().copied().fold(0.0, f64::max),
            current_tick: self.current_tick(),
            prediction_horizon: horizon,
            prediction_batch_size: batch_size,
            predicting,
        }
    }

    /// Human-readable delivery and pool summary.
    pub fn get_performance_summary(&self) -> String {
        format!(
            "=== Frame Delivery ===\n{}\n=== Worker Pool ===\n{}",
            self.stats(),
            self.shared.pool.metrics()
        )
    }

    /// Compare the rolling frame time against `1000 / target_fps` and, when
    /// over budget, grow the prediction horizon and cache within their bounds.
    pub fn optimize_for_target_fps(&self, target_fps: f64) -> OptimizationReport {
        let target_fps = if target_fps.is_finite() && target_fps > 0.0 {
            target_fps
        } else {
            60.0
        };
        let target_ms = 1000.0 / target_fps;
        let stats = self.stats();
        let cache = self.shared.pool.cache();
        let cache_hit_rate = cache.get_cache_stats().hit_rate;

        let mut report = OptimizationReport {
            status: OptimizationStatus::MeetingTarget,
            target_fps,
            target_frame_time_ms: target_ms,
            average_frame_time_ms: stats.average_frame_time_ms,
            precomputed_hit_rate: stats.hit_rate,
            cache_hit_rate,
            changes: Vec::new(),
            recommendations: Vec::new(),
        };

        if stats.average_frame_time_ms <= target_ms {
            report
                .recommendations
                .push("Frame time is within budget; no changes needed".into());
            return report;
        }

        if stats.hit_rate < HORIZON_HIT_RATE_THRESHOLD {
            let mut tuning = self.shared.tuning();
            if tuning.adaptive {
                let old = tuning.horizon;
                let new = (old + old / 2).max(old + 1).min(MAX_PREDICTION_HORIZON);
                if new > old {
                    tuning.horizon = new;
                    report.changes.push(TuningChange {
                        parameter: "prediction_horizon",
                        old,
                        new,
                    });
                }
            } else {
                report.recommendations.push(
                    "Enable adaptive prediction to let the horizon grow with demand".into(),
                );
            }
        }

        if cache_hit_rate < CACHE_HIT_RATE_THRESHOLD {
            let old = cache.max_frames();
            let new = (old + old / 2).max(old + 1).min(MAX_CACHE_FRAMES);
            if new > old {
                cache.set_max_frames(new);
                report.changes.push(TuningChange {
                    parameter: "cache_max_frames",
                    old,
                    new,
                });
            }
        }

        let metrics = self.shared.pool.metrics();
        if metrics.worker_utilization_pct > 90.0 {
            report.recommendations.push(format!(
                "Workers are {:.0}% busy; consider adding workers",
                metrics.worker_utilization_pct
            ));
        }
        if stats.fallbacks > stats.precomputed_hits {
            report.recommendations.push(
                "Most frames fall back to synchronous computation; start prediction earlier or raise the fallback threshold".into(),
            );
        }

        report.status = if report.changes.is_empty() {
            report.recommendations.push(
                "Tunables are at their limits; reduce animation complexity".into(),
            );
            OptimizationStatus::AtLimits
        } else {
            for change in &report.changes {
                info!(
                    "tuned {} from {} to {} for {:.1} fps",
                    change.parameter, change.old, change.new, target_fps
                );
            }
            OptimizationStatus::Optimized
        };

        report
    }

    /// Text form of [`optimize_for_target_fps`](Self::optimize_for_target_fps).
    pub fn optimize_for_fps(&self, target_fps: f64) -> String {
        self.optimize_for_target_fps(target_fps).to_string()
    }
}

impl<E: AnimationEngine> Drop for FrameScheduler<E> {
    fn drop(&mut self) {
        self.stop_prediction();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{ComputeError, TimelineEngine};
    use crate::schema::{AnimationDefinition, AnimationState, Timeline};
    use serde::{Deserialize, Serialize};

    /// Timeline engine that takes `delay_ms` per frame.
    #[derive(Serialize, Deserialize)]
    struct SlowEngine {
        inner: TimelineEngine,
        delay_ms: u64,
    }

    impl AnimationEngine for SlowEngine {
        fn compute_frame_state(&self, tick: Tick) -> Result<FrameState, ComputeError> {
            thread::sleep(Duration::from_millis(self.delay_ms));
            self.inner.compute_frame_state(tick)
        }
    }

    #[derive(Serialize, Deserialize)]
    struct PanickingEngine;

    impl AnimationEngine for PanickingEngine {
        fn compute_frame_state(&self, tick: Tick) -> Result<FrameState, ComputeError> {
            panic!("engine exploded at tick {tick}");
        }
    }

    fn config() -> PrecomputeConfig {
        let mut config = PrecomputeConfig::default();
        config.workers.count = 2;
        config.prediction.horizon_frames = 20;
        config.prediction.batch_size = 5;
        config.prediction.cycle_interval_ms = 10;
        config
    }

    fn scheduler() -> FrameScheduler<TimelineEngine> {
        let scheduler = FrameScheduler::new(&config()).unwrap();
        scheduler.attach_engine(TimelineEngine::from_timeline(&Timeline::random(10, 5)));
        scheduler
    }

    #[test]
    fn test_no_engine_returns_none() {
        let scheduler: FrameScheduler<TimelineEngine> = FrameScheduler::new(&config()).unwrap();
        assert!(scheduler.get_frame_for_tick(10, None).is_none());
        assert!(scheduler.get_frame(11).is_none());

        let stats = scheduler.stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.no_engine, 2);
    }

    #[test]
    fn test_frame_matches_direct_computation() {
        let scheduler = scheduler();
        let reference = TimelineEngine::from_timeline(&Timeline::random(10, 5));

        for tick in [0, 1, 45, 46, 300] {
            let frame = scheduler.get_frame_for_tick(tick, None).unwrap();
            let expected = reference.compute_frame_state(tick).unwrap();
            assert!(frame.approx_eq(&expected, 1e-9), "tick {}", tick);
        }
    }

    #[test]
    fn test_precomputed_hit_after_prediction_cycle() {
        let scheduler = scheduler();
        scheduler.set_current_tick(0);
        let submitted = scheduler.shared.prediction_cycle().unwrap();
        assert_eq!(submitted, 20);

        let ids: Vec<_> = (1..=20)
            .filter_map(|t| scheduler.pool().in_flight_task(t))
            .collect();
        scheduler
            .pool()
            .wait_for_batch_completion(&ids, Duration::from_secs(5));
        assert!((1..=20).all(|t| scheduler.cache().contains(t)));

        assert_eq!(scheduler.get_frame_for_tick(7, None).unwrap().tick, 7);
        let stats = scheduler.stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.precomputed_hits, 1);
        assert_eq!(stats.fallbacks, 0);
        assert_eq!(stats.hit_rate, 1.0);
    }

    #[test]
    fn test_fallback_queues_lookahead() {
        let scheduler: FrameScheduler<SlowEngine> = FrameScheduler::new(&config()).unwrap();
        scheduler.attach_engine(SlowEngine {
            inner: TimelineEngine::from_timeline(&Timeline::random(10, 5)),
            delay_ms: 50,
        });

        assert_eq!(scheduler.get_frame_for_tick(0, Some(Duration::ZERO)).unwrap().tick, 0);
        let stats = scheduler.stats();
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.precomputed_hits, 0);
        // In-flight first: a task leaves flight only after caching its frame.
        assert!((1..=20).all(|t| {
            scheduler.pool().in_flight_task(t).is_some() || scheduler.cache().contains(t)
        }));
    }

    #[test]
    fn test_fallback_panic_returns_none() {
        let scheduler: FrameScheduler<PanickingEngine> = FrameScheduler::new(&config()).unwrap();
        scheduler.attach_engine(PanickingEngine);

        assert!(scheduler.get_frame_for_tick(3, Some(Duration::from_millis(20))).is_none());
        let stats = scheduler.stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.failures, 1);
        assert!(scheduler.cache().peek(3).is_none());
    }

    #[test]
    fn test_max_tick_and_unbounded_timeout() {
        let scheduler = scheduler();
        assert_eq!(scheduler.get_frame_for_tick(5, Some(Duration::MAX)).unwrap().tick, 5);

        scheduler.set_current_tick(Tick::MAX);
        assert_eq!(scheduler.shared.prediction_cycle().unwrap(), 0);

        scheduler.pool().shutdown(true);
        let frame = scheduler.get_frame_for_tick(Tick::MAX, Some(Duration::ZERO)).unwrap();
        assert_eq!(frame.tick, Tick::MAX);
        assert_eq!(scheduler.stats().fallbacks, 1);
    }

    #[test]
    fn test_remaining_interval() {
        let interval = Duration::from_millis(20);
        let overdue = Instant::now().checked_sub(Duration::from_millis(30)).unwrap();
        assert_eq!(remaining_interval(overdue, interval), Duration::ZERO);

        let fresh = remaining_interval(Instant::now(), Duration::from_secs(10));
        assert!(fresh > Duration::from_secs(9));
        assert!(fresh <= Duration::from_secs(10));
    }

    #[test]
    fn test_fallback_failure_returns_none() {
        let scheduler: FrameScheduler<TimelineEngine> = FrameScheduler::new(&config()).unwrap();
        let mut engine = TimelineEngine::new();
        engine.add_animation(AnimationDefinition {
            id: "broken".into(),
            start_tick: 0,
            duration_ticks: 0,
            easing: Default::default(),
            repeat: Default::default(),
            from: AnimationState::default(),
            to: AnimationState::default(),
            active: true,
        });
        assert!(matches!(
            engine.compute_frame_state(3),
            Err(ComputeError::InvalidAnimation { .. })
        ));
        scheduler.attach_engine(engine);

        assert!(scheduler.get_frame_for_tick(3, Some(Duration::from_millis(50))).is_none());
        let stats = scheduler.stats();
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.failures, 1);
    }

    #[test]
    fn test_concurrent_requests_match_tick() {
        let scheduler = Arc::new(scheduler());
        scheduler.start_prediction().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|offset| {
                let scheduler = Arc::clone(&scheduler);
                thread::spawn(move || {
                    for tick in (offset * 10)..(offset * 10 + 40) {
                        if let Some(frame) = scheduler.get_frame(tick) {
                            assert_eq!(frame.tick, tick);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(scheduler.stop_prediction());
        assert_eq!(scheduler.stats().requests, 160);
    }

    #[test]
    fn test_prediction_fills_cache_ahead() {
        let scheduler = scheduler();
        scheduler.set_current_tick(100);
        scheduler.start_prediction().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !scheduler.cache().contains(105) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        scheduler.stop_prediction();

        assert!(scheduler.cache().contains(105));
        assert!(scheduler.stats().prediction_cycles >= 1);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let scheduler = scheduler();
        scheduler.start_prediction().unwrap();
        scheduler.start_prediction().unwrap();
        assert!(scheduler.is_predicting());

        let started = Instant::now();
        assert!(scheduler.stop_prediction());
        assert!(!scheduler.stop_prediction());
        assert!(started.elapsed() < STOP_TIMEOUT + Duration::from_millis(500));
        assert!(!scheduler.is_predicting());

        scheduler.start_prediction().unwrap();
        assert!(scheduler.is_predicting());
    }

    #[test]
    fn test_prediction_survives_pool_shutdown() {
        let scheduler = scheduler();
        scheduler.start_prediction().unwrap();
        scheduler.pool().shutdown(true);
        thread::sleep(Duration::from_millis(50));

        assert!(scheduler.is_predicting());
        assert!(scheduler.stop_prediction());
        // Fallback still serves frames without the pool.
        assert_eq!(scheduler.get_frame(12).unwrap().tick, 12);
    }

    #[test]
    fn test_optimize_noop_when_meeting_target() {
        let scheduler = scheduler();
        let horizon = scheduler.prediction_horizon();
        let max_frames = scheduler.cache().max_frames();

        let report = scheduler.optimize_for_target_fps(60.0);
        assert_eq!(report.status, OptimizationStatus::MeetingTarget);
        assert_eq!(report.status.to_string(), "meeting_target");
        assert!(report.changes.is_empty());
        assert_eq!(scheduler.prediction_horizon(), horizon);
        assert_eq!(scheduler.cache().max_frames(), max_frames);
    }

    #[test]
    fn test_optimize_grows_horizon_and_cache() {
        let scheduler = scheduler();
        {
            let mut stats = scheduler.shared.stats();
            stats.requests = 10;
            stats.fallbacks = 10;
            for _ in 0..10 {
                stats.record_frame_time(50.0);
            }
        }
        scheduler.cache().get_frame(9999);

        let report = scheduler.optimize_for_target_fps(60.0);
        assert_eq!(report.status, OptimizationStatus::Optimized);
        assert_eq!(scheduler.prediction_horizon(), 30);
        assert_eq!(scheduler.cache().max_frames(), 450);
        assert_eq!(report.changes.len(), 2);
        assert!(scheduler.optimize_for_fps(60.0).contains("prediction_horizon"));
    }

    #[test]
    fn test_optimize_respects_bounds() {
        let mut config = config();
        config.prediction.horizon_frames = MAX_PREDICTION_HORIZON;
        config.cache.max_frames = MAX_CACHE_FRAMES;
        let scheduler: FrameScheduler<TimelineEngine> = FrameScheduler::new(&config).unwrap();
        {
            let mut stats = scheduler.shared.stats();
            stats.requests = 1;
            stats.fallbacks = 1;
            stats.record_frame_time(100.0);
        }

        let report = scheduler.optimize_for_target_fps(60.0);
        assert_eq!(report.status, OptimizationStatus::AtLimits);
        assert_eq!(scheduler.prediction_horizon(), MAX_PREDICTION_HORIZON);
        assert_eq!(scheduler.cache().max_frames(), MAX_CACHE_FRAMES);
    }

    #[test]
    fn test_performance_summary_mentions_sections() {
        let scheduler = scheduler();
        scheduler.get_frame(3);
        let summary = scheduler.get_performance_summary();
        assert!(summary.contains("Frame Delivery"));
        assert!(summary.contains("Worker Pool"));
        assert!(summary.contains("Requests: 1"));
    }
}
