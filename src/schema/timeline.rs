//! Animation definitions consumed by the reference timeline engine.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Opaque name of one animation within an engine instance.
pub type AnimationId = String;

/// Computed value of one animation at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationState {
    /// Horizontal position.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
    /// Rotation in degrees.
    pub rotation: f64,
    /// Uniform scale factor.
    pub scale: f64,
    /// Opacity (0.0-1.0).
    pub opacity: f64,
    /// Free-form numeric properties (color channels, corner radius, ...).
    #[serde(default)]
    pub custom: BTreeMap<String, f64>,
}

impl Default for AnimationState {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            rotation: 0.0,
            scale: 1.0,
            opacity: 1.0,
            custom: BTreeMap::new(),
        }
    }
}

impl AnimationState {
    /// Linear interpolation towards `to`.
    ///
    /// Custom properties are interpolated only when present on both ends;
    /// properties present on one side keep that side's value.
    pub fn lerp(&self, to: &AnimationState, t: f64) -> AnimationState {
        let mix = |a: f64, b: f64| a + (b - a) * t;

        let mut custom = self.custom.clone();
        for (key, &target) in &to.custom {
            custom
                .entry(key.clone())
                .and_modify(|v| *v = mix(*v, target))
                .or_insert(target);
        }

        AnimationState {
            x: mix(self.x, to.x),
            y: mix(self.y, to.y),
            rotation: mix(self.rotation, to.rotation),
            scale: mix(self.scale, to.scale),
            opacity: mix(self.opacity, to.opacity),
            custom,
        }
    }

    /// Check that every field holds a finite value.
    pub fn is_finite(&self) -> bool {
        [self.x, self.y, self.rotation, self.scale, self.opacity]
            .iter()
            .chain(self.custom.values())
            .all(|v| v.is_finite())
    }

    /// Maximum absolute field difference against another state.
    pub fn max_abs_diff(&self, other: &AnimationState) -> f64 {
        let base = [
            (self.x - other.x).abs(),
            (self.y - other.y).abs(),
            (self.rotation - other.rotation).abs(),
            (self.scale - other.scale).abs(),
            (self.opacity - other.opacity).abs(),
        ];
        let custom = self.custom.iter().map(|(k, v)| match other.custom.get(k) {
            Some(o) => (v - o).abs(),
            None => f64::INFINITY,
        });
        base.into_iter().chain(custom).fold(0.0, f64::max)
    }
}

/// Easing curve applied to normalized progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Easing {
    #[default]
    Linear,
    EaseIn,
    EaseOut,
    EaseInOut,
    /// Jumps to the end value once progress reaches 1.
    Step,
}

impl Easing {
    /// Map progress in [0, 1] to eased progress in [0, 1].
    #[inline]
    pub fn apply(self, t: f64) -> f64 {
        match self {
            Easing::Linear => t,
            Easing::EaseIn => t * t,
            Easing::EaseOut => t * (2.0 - t),
            Easing::EaseInOut => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    -1.0 + (4.0 - 2.0 * t) * t
                }
            }
            Easing::Step => {
                if t >= 1.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Behavior once an animation passes its duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    /// Hold the end value.
    #[default]
    Once,
    /// Restart from the beginning.
    Loop,
    /// Alternate forward and backward.
    PingPong,
}

impl RepeatMode {
    /// Normalize elapsed ticks into progress in [0, 1].
    pub fn progress(self, elapsed: u64, duration: u64) -> f64 {
        debug_assert!(duration > 0);
        match self {
            RepeatMode::Once => (elapsed as f64 / duration as f64).min(1.0),
            RepeatMode::Loop => (elapsed % duration) as f64 / duration as f64,
            RepeatMode::PingPong => {
                let period = duration.saturating_mul(2);
                let phase = elapsed % period;
                if phase <= duration {
                    phase as f64 / duration as f64
                } else {
                    (period - phase) as f64 / duration as f64
                }
            }
        }
    }
}

fn default_active() -> bool {
    true
}

/// Definition of a single keyframed animation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationDefinition {
    /// Unique animation name.
    pub id: AnimationId,
    /// First tick of the animation. Earlier ticks hold the `from` state.
    #[serde(default)]
    pub start_tick: u64,
    /// Length of one pass in ticks.
    pub duration_ticks: u64,
    /// Easing curve.
    #[serde(default)]
    pub easing: Easing,
    /// Repeat behavior.
    #[serde(default)]
    pub repeat: RepeatMode,
    /// State at progress 0.
    pub from: AnimationState,
    /// State at progress 1.
    pub to: AnimationState,
    /// Inactive animations are omitted from computed frames.
    #[serde(default = "default_active")]
    pub active: bool,
}

/// Ordered collection of animation definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timeline {
    pub animations: Vec<AnimationDefinition>,
}

impl Timeline {
    /// Generate a reproducible timeline of `count` looping animations.
    pub fn random(count: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let easings = [
            Easing::Linear,
            Easing::EaseIn,
            Easing::EaseOut,
            Easing::EaseInOut,
            Easing::Step,
        ];
        let repeats = [RepeatMode::Once, RepeatMode::Loop, RepeatMode::PingPong];

        let animations = (0..count)
            .map(|i| {
                let mut from = AnimationState {
                    x: rng.gen_range(0.0..320.0),
                    y: rng.gen_range(0.0..240.0),
                    rotation: rng.gen_range(-180.0..180.0),
                    scale: rng.gen_range(0.5..1.5),
                    opacity: rng.gen_range(0.0..1.0),
                    custom: BTreeMap::new(),
                };
                let mut to = AnimationState {
                    x: rng.gen_range(0.0..320.0),
                    y: rng.gen_range(0.0..240.0),
                    rotation: rng.gen_range(-180.0..180.0),
                    scale: rng.gen_range(0.5..1.5),
                    opacity: rng.gen_range(0.0..1.0),
                    custom: BTreeMap::new(),
                };
                if rng.gen_bool(0.5) {
                    from.custom.insert("hue".into(), rng.gen_range(0.0..360.0));
                    to.custom.insert("hue".into(), rng.gen_range(0.0..360.0));
                }

                AnimationDefinition {
                    id: format!("anim_{i}"),
                    start_tick: rng.gen_range(0..30),
                    duration_ticks: rng.gen_range(15..240),
                    easing: easings[rng.gen_range(0..easings.len())],
                    repeat: repeats[rng.gen_range(0..repeats.len())],
                    from,
                    to,
                    active: true,
                }
            })
            .collect();

        Self { animations }
    }
}
