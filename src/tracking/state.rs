//! Target lock state machine.

use nalgebra::Vector2;

use super::fusion::{FusionBranch, fuse};

/// Coarse tracking status, derived from the lock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// No measurement cycle has run yet.
    #[default]
    NotInitialized,
    /// Last cycle produced an observation.
    Locked,
    /// Recent misses, but still inside the failure budget.
    Coasting,
    /// Failure budget exhausted; positions are withheld.
    Lost,
}

/// Rolling failure count and the observation fed to the filter.
#[derive(Debug, Clone)]
pub struct LockState {
    cycles_unlocked: u32,
    max_failed_cycles: u32,
    locked: bool,
    cycles: u64,
    observation: Vector2<f64>,
}

impl LockState {
    /// Start unlocked, with the selection centroid as the held observation.
    pub fn new(initial: Vector2<f64>, max_failed_cycles: u32) -> Self {
        Self {
            cycles_unlocked: 0,
            max_failed_cycles,
            locked: false,
            cycles: 0,
            observation: initial,
        }
    }

    /// Apply one measurement cycle.
    ///
    /// A miss keeps the previous observation, so a target still within its
    /// failure budget coasts on the last good fix.
    pub fn step(
        &mut self,
        color: Option<&Vector2<f64>>,
        flow: Option<&Vector2<f64>>,
        discontinuous: bool,
    ) -> FusionBranch {
        let (branch, observation) = fuse(color, flow, discontinuous);
        match observation {
            Some(obs) => {
                self.observation = obs;
                self.cycles_unlocked = 0;
            }
            None => self.cycles_unlocked = self.cycles_unlocked.saturating_add(1),
        }
        self.locked = self.cycles_unlocked < self.max_failed_cycles;
        self.cycles += 1;
        branch
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn cycles_unlocked(&self) -> u32 {
        self.cycles_unlocked
    }

    pub fn observation(&self) -> &Vector2<f64> {
        &self.observation
    }

    pub fn tracking_state(&self) -> TrackingState {
        match (self.cycles, self.locked, self.cycles_unlocked) {
            (0, _, _) => TrackingState::NotInitialized,
            (_, false, _) => TrackingState::Lost,
            (_, true, 0) => TrackingState::Locked,
            (_, true, _) => TrackingState::Coasting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_starts_unlocked() {
        let state = LockState::new(Vector2::new(5.0, 6.0), 4);
        assert!(!state.is_locked());
        assert_eq!(state.tracking_state(), TrackingState::NotInitialized);
        assert_eq!(state.observation(), &Vector2::new(5.0, 6.0));
    }

    #[test]
    fn test_fused_cycle_locks() {
        let mut state = LockState::new(Vector2::zeros(), 4);
        let branch = state.step(
            Some(&Vector2::new(100.0, 100.0)),
            Some(&Vector2::new(110.0, 100.0)),
            false,
        );
        assert_eq!(branch, FusionBranch::Fused);
        assert!(state.is_locked());
        assert_eq!(state.cycles_unlocked(), 0);
        assert_eq!(state.observation(), &Vector2::new(105.0, 100.0));
        assert_eq!(state.tracking_state(), TrackingState::Locked);
    }

    #[test]
    fn test_five_misses_with_budget_four() {
        let mut state = LockState::new(Vector2::new(1.0, 1.0), 4);
        let locked: Vec<bool> = (0..5)
            .map(|_| {
                state.step(None, None, false);
                state.is_locked()
            })
            .collect();
        assert_eq!(locked, vec![true, true, true, false, false]);
        assert_eq!(state.tracking_state(), TrackingState::Lost);
        // The held observation never moves on a miss.
        assert_eq!(state.observation(), &Vector2::new(1.0, 1.0));
    }

    #[test]
    fn test_coasting_then_recovery() {
        let mut state = LockState::new(Vector2::zeros(), 2);
        state.step(None, None, false);
        assert_eq!(state.tracking_state(), TrackingState::Coasting);
        state.step(None, None, false);
        assert_eq!(state.tracking_state(), TrackingState::Lost);

        let branch = state.step(None, Some(&Vector2::new(3.0, 4.0)), false);
        assert_eq!(branch, FusionBranch::FlowOnly);
        assert!(state.is_locked());
        assert_eq!(state.cycles_unlocked(), 0);
    }

    #[test]
    fn test_counter_follows_branches() {
        let mut rng = StdRng::seed_from_u64(19);
        let budget = 5;
        let mut state = LockState::new(Vector2::zeros(), budget);
        let point = Vector2::new(50.0, 50.0);

        for _ in 0..5_000 {
            let color = rng.random_bool(0.5).then_some(&point);
            let flow = rng.random_bool(0.5).then_some(&point);
            let discontinuous = rng.random_bool(0.3);
            let before = state.cycles_unlocked();

            match state.step(color, flow, discontinuous) {
                FusionBranch::Missed => assert_eq!(state.cycles_unlocked(), before + 1),
                FusionBranch::Fused | FusionBranch::FlowOnly => {
                    assert_eq!(state.cycles_unlocked(), 0)
                }
            }
            assert_eq!(state.is_locked(), state.cycles_unlocked() < budget);
        }
    }
}
