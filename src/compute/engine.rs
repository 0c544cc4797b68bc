//! Animation engine contract and the reference timeline engine.
//!
//! The pool and scheduler only rely on [`AnimationEngine`]: given a tick,
//! deterministically produce a [`FrameState`]. Engines cross the worker
//! boundary as [`EngineSnapshot`] values.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::frame::{FrameState, Tick};
use super::snapshot::{EngineSnapshot, SnapshotError};
use crate::schema::{AnimationDefinition, AnimationId, CompressionType, Timeline};

/// A source of per-tick animation state.
///
/// `compute_frame_state` must be a pure function of `tick` for a fixed engine
/// configuration; the cache and the workers rely on it.
pub trait AnimationEngine: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Compute the state of every active animation at `tick`.
    fn compute_frame_state(&self, tick: Tick) -> Result<FrameState, ComputeError>;

    /// Capture this engine as a transferable snapshot.
    fn snapshot(&self, compression: CompressionType) -> Result<EngineSnapshot, SnapshotError> {
        EngineSnapshot::capture(self, compression)
    }

    /// Rebuild an independent engine from a snapshot.
    fn restore(snapshot: &EngineSnapshot) -> Result<Self, SnapshotError> {
        snapshot.restore()
    }
}

/// Engine computation failure.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("Animation '{id}' is invalid: {reason}")]
    InvalidAnimation { id: AnimationId, reason: &'static str },
    #[error("Engine failed at tick {tick}: {message}")]
    Failed { tick: Tick, message: String },
}

/// Reference engine evaluating keyframed animation definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimelineEngine {
    animations: BTreeMap<AnimationId, AnimationDefinition>,
}

impl TimelineEngine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an engine from a timeline. Later definitions replace earlier ones
    /// with the same id.
    pub fn from_timeline(timeline: &Timeline) -> Self {
        let mut engine = Self::new();
        for def in &timeline.animations {
            engine.add_animation(def.clone());
        }
        engine
    }

    /// Insert or replace an animation definition.
    pub fn add_animation(&mut self, def: AnimationDefinition) {
        self.animations.insert(def.id.clone(), def);
    }

    /// Remove an animation, returning its definition.
    pub fn remove_animation(&mut self, id: &str) -> Option<AnimationDefinition> {
        self.animations.remove(id)
    }

    /// Activate or deactivate an animation. Returns false for unknown ids.
    pub fn set_active(&mut self, id: &str, active: bool) -> bool {
        match self.animations.get_mut(id) {
            Some(def) => {
                def.active = active;
                true
            }
            None => false,
        }
    }

    /// Number of registered animations (active or not).
    pub fn animation_count(&self) -> usize {
        self.animations.len()
    }

    /// Look up a definition.
    pub fn animation(&self, id: &str) -> Option<&AnimationDefinition> {
        self.animations.get(id)
    }
}

impl AnimationEngine for TimelineEngine {
    fn compute_frame_state(&self, tick: Tick) -> Result<FrameState, ComputeError> {
        let mut frame = FrameState::empty(tick);

        for (id, def) in self.animations.iter().filter(|(_, d)| d.active) {
            if def.duration_ticks == 0 {
                return Err(ComputeError::InvalidAnimation {
                    id: id.clone(),
                    reason: "duration must be non-zero",
                });
            }
            if !def.from.is_finite() || !def.to.is_finite() {
                return Err(ComputeError::InvalidAnimation {
                    id: id.clone(),
                    reason: "keyframe values must be finite",
                });
            }

            let elapsed = tick.saturating_sub(def.start_tick);
            let progress = def.repeat.progress(elapsed, def.duration_ticks);
            let state = def.from.lerp(&def.to, def.easing.apply(progress));
            frame.animations.insert(id.clone(), state);
        }

        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AnimationState, Easing, RepeatMode};
    use proptest::prelude::*;

    fn slide(id: &str, repeat: RepeatMode) -> AnimationDefinition {
        AnimationDefinition {
            id: id.into(),
            start_tick: 10,
            duration_ticks: 20,
            easing: Easing::Linear,
            repeat,
            from: AnimationState::default(),
            to: AnimationState {
                x: 100.0,
                opacity: 0.0,
                ..Default::default()
            },
            active: true,
        }
    }

    #[test]
    fn test_before_start_holds_from_state() {
        let mut engine = TimelineEngine::new();
        engine.add_animation(slide("a", RepeatMode::Once));

        let frame = engine.compute_frame_state(0).unwrap();
        assert_eq!(frame.tick, 0);
        assert_eq!(frame.get("a").unwrap().x, 0.0);
        assert_eq!(frame.get("a").unwrap().opacity, 1.0);
    }

    #[test]
    fn test_midpoint_and_hold() {
        let mut engine = TimelineEngine::new();
        engine.add_animation(slide("a", RepeatMode::Once));

        assert_eq!(engine.compute_frame_state(20).unwrap().get("a").unwrap().x, 50.0);
        assert_eq!(engine.compute_frame_state(500).unwrap().get("a").unwrap().x, 100.0);
    }

    #[test]
    fn test_loop_wraps() {
        let mut engine = TimelineEngine::new();
        engine.add_animation(slide("a", RepeatMode::Loop));

        let first = engine.compute_frame_state(15).unwrap();
        let wrapped = engine.compute_frame_state(35).unwrap();
        assert!(first.get("a").unwrap().max_abs_diff(wrapped.get("a").unwrap()) < 1e-12);
    }

    #[test]
    fn test_inactive_omitted() {
        let mut engine = TimelineEngine::new();
        engine.add_animation(slide("a", RepeatMode::Once));
        engine.add_animation(slide("b", RepeatMode::Once));
        assert!(engine.set_active("b", false));
        assert!(!engine.set_active("missing", false));

        let frame = engine.compute_frame_state(12).unwrap();
        assert_eq!(frame.len(), 1);
        assert!(frame.get("b").is_none());
    }

    #[test]
    fn test_zero_duration_fails() {
        let mut engine = TimelineEngine::new();
        let mut def = slide("bad", RepeatMode::Once);
        def.duration_ticks = 0;
        engine.add_animation(def);

        assert!(matches!(
            engine.compute_frame_state(5),
            Err(ComputeError::InvalidAnimation { .. })
        ));
    }

    #[test]
    fn test_snapshot_restore_preserves_computation() {
        let engine = TimelineEngine::from_timeline(&Timeline::random(12, 3));
        let snapshot = engine.snapshot(CompressionType::None).unwrap();
        let restored = TimelineEngine::restore(&snapshot).unwrap();

        assert_eq!(restored.animation_count(), 12);
        for tick in [0, 17, 90, 451] {
            let a = engine.compute_frame_state(tick).unwrap();
            let b = restored.compute_frame_state(tick).unwrap();
            assert!(a.approx_eq(&b, 1e-9), "tick {}", tick);
        }
    }

    proptest! {
        #[test]
        fn prop_compute_is_deterministic(seed in 0u64..1000, tick in 0u64..100_000) {
            let engine = TimelineEngine::from_timeline(&Timeline::random(6, seed));
            let a = engine.compute_frame_state(tick).unwrap();
            let b = engine.compute_frame_state(tick).unwrap();
            prop_assert!(a.approx_eq(&b, 1e-9));
            prop_assert_eq!(a.tick, tick);
        }
    }
}
