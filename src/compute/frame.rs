//! Per-tick frame state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::schema::{AnimationId, AnimationState};

/// Logical time unit identifying one frame.
pub type Tick = u64;

/// Up to `count` consecutive ticks from `start`, stopping at `Tick::MAX`.
pub fn tick_window(start: Tick, count: usize) -> impl Iterator<Item = Tick> {
    (0..count as u64).map_while(move |offset| start.checked_add(offset))
}

/// Fixed per-frame bookkeeping overhead used by [`FrameState::estimated_bytes`].
const FRAME_OVERHEAD_BYTES: usize = 64;
/// Five f64 fields plus map node overhead.
const ANIMATION_OVERHEAD_BYTES: usize = 5 * 8 + 48;
const CUSTOM_PROPERTY_BYTES: usize = 8 + 32;

/// Complete computed state of all animations for one tick.
///
/// Produced once and never mutated afterwards; shared behind `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameState {
    /// Tick this state was computed for.
    pub tick: Tick,
    /// Animation states keyed by animation id.
    pub animations: BTreeMap<AnimationId, AnimationState>,
}

impl FrameState {
    /// Frame with no animation states.
    pub fn empty(tick: Tick) -> Self {
        Self {
            tick,
            animations: BTreeMap::new(),
        }
    }

    /// Number of animation states.
    pub fn len(&self) -> usize {
        self.animations.len()
    }

    /// Check if the frame carries no animation states.
    pub fn is_empty(&self) -> bool {
        self.animations.is_empty()
    }

    /// Look up one animation's state.
    pub fn get(&self, id: &str) -> Option<&AnimationState> {
        self.animations.get(id)
    }

    /// Approximate in-memory footprint in bytes.
    pub fn estimated_bytes(&self) -> usize {
        FRAME_OVERHEAD_BYTES
            + self
                .animations
                .iter()
                .map(|(id, state)| {
                    id.len()
                        + ANIMATION_OVERHEAD_BYTES
                        + state
                            .custom
                            .keys()
                            .map(|k| k.len() + CUSTOM_PROPERTY_BYTES)
                            .sum::<usize>()
                })
                .sum::<usize>()
    }

    /// Check two frames for equality within `epsilon` on every field.
    pub fn approx_eq(&self, other: &FrameState, epsilon: f64) -> bool {
        self.tick == other.tick
            && self.animations.len() == other.animations.len()
            && self.animations.iter().all(|(id, state)| {
                other
                    .animations
                    .get(id)
                    .is_some_and(|o| state.max_abs_diff(o) <= epsilon)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimated_bytes_grows_with_content() {
        let empty = FrameState::empty(3);
        let mut frame = FrameState::empty(3);
        frame
            .animations
            .insert("a".into(), AnimationState::default());
        let base = frame.estimated_bytes();
        frame
            .animations
            .get_mut("a")
            .unwrap()
            .custom
            .insert("hue".into(), 1.0);

        assert!(empty.estimated_bytes() < base);
        assert!(base < frame.estimated_bytes());
    }

    #[test]
    fn test_tick_window_stops_at_max() {
        assert_eq!(tick_window(3, 4).collect::<Vec<_>>(), vec![3, 4, 5, 6]);
        assert_eq!(tick_window(Tick::MAX - 1, 5).collect::<Vec<_>>(), vec![Tick::MAX - 1, Tick::MAX]);
        assert_eq!(tick_window(9, 0).count(), 0);
    }

    #[test]
    fn test_approx_eq() {
        let mut a = FrameState::empty(1);
        a.animations.insert("a".into(), AnimationState::default());
        let mut b = a.clone();
        b.animations.get_mut("a").unwrap().x += 1e-12;
        assert!(a.approx_eq(&b, 1e-9));

        b.animations.get_mut("a").unwrap().x += 1.0;
        assert!(!a.approx_eq(&b, 1e-9));

        let other_tick = FrameState { tick: 2, ..a.clone() };
        assert!(!a.approx_eq(&other_tick, 1e-9));
    }
}
