//! Fusion of the colour and flow observations.

use nalgebra::Vector2;

use crate::config::LockConfig;

/// Which fusion branch a cycle took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionBranch {
    /// Both sensors agreed: the observation is their mean.
    Fused,
    /// Only flow was usable (colour missing or rejected).
    FlowOnly,
    /// Neither sensor was usable; the previous observation is kept.
    Missed,
}

/// True when the colour and flow observations should not be averaged.
///
/// The pair is rejected when the two sensors disagree by more than
/// `shift_multiplier` colour radii, or when their midpoint jumps away from
/// the filter's prediction by more than both the dead zone and
/// `shift_multiplier` times the filter speed. Swapping `color` and `flow`
/// never changes the answer.
pub fn is_discontinuous(
    color: &Vector2<f64>,
    flow: &Vector2<f64>,
    color_radius: f64,
    predicted: &Vector2<f64>,
    velocity: &Vector2<f64>,
    config: &LockConfig,
) -> bool {
    let separation = (color - flow).norm();
    if separation > config.shift_multiplier * color_radius {
        return true;
    }

    let jump = (midpoint(color, flow) - predicted).norm();
    jump > config.dead_zone && jump > config.shift_multiplier * velocity.norm()
}

/// Elementwise mean of two observations.
pub fn midpoint(a: &Vector2<f64>, b: &Vector2<f64>) -> Vector2<f64> {
    (a + b) * 0.5
}

/// Pick the observation for this cycle, or `None` on a miss.
pub fn fuse(
    color: Option<&Vector2<f64>>,
    flow: Option<&Vector2<f64>>,
    discontinuous: bool,
) -> (FusionBranch, Option<Vector2<f64>>) {
    match (color, flow) {
        (Some(c), Some(f)) if !discontinuous => (FusionBranch::Fused, Some(midpoint(c, f))),
        (_, Some(f)) => (FusionBranch::FlowOnly, Some(*f)),
        _ => (FusionBranch::Missed, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_point(rng: &mut StdRng) -> Vector2<f64> {
        Vector2::new(rng.random_range(-50.0..700.0), rng.random_range(-50.0..500.0))
    }

    #[test]
    fn test_fuses_agreeing_sensors() {
        let color = Vector2::new(100.0, 100.0);
        let flow = Vector2::new(110.0, 100.0);
        let config = LockConfig::default();

        let discontinuous = is_discontinuous(
            &color,
            &flow,
            10.0,
            &Vector2::new(104.0, 100.0),
            &Vector2::zeros(),
            &config,
        );
        assert!(!discontinuous);

        let (branch, obs) = fuse(Some(&color), Some(&flow), discontinuous);
        assert_eq!(branch, FusionBranch::Fused);
        assert_relative_eq!(obs.unwrap(), Vector2::new(105.0, 100.0));
    }

    #[test]
    fn test_sensor_disagreement_is_discontinuous() {
        let config = LockConfig::default();
        // 3 x radius 10 = 30 px allowed separation.
        assert!(is_discontinuous(
            &Vector2::new(0.0, 0.0),
            &Vector2::new(31.0, 0.0),
            10.0,
            &Vector2::new(15.0, 0.0),
            &Vector2::zeros(),
            &config,
        ));
    }

    #[test]
    fn test_jump_from_prediction() {
        let config = LockConfig::default();
        let color = Vector2::new(200.0, 200.0);
        let flow = Vector2::new(202.0, 200.0);
        let predicted = Vector2::new(100.0, 200.0);

        // Slow filter: a 100 px jump is rejected.
        assert!(is_discontinuous(&color, &flow, 10.0, &predicted, &Vector2::new(5.0, 0.0), &config));
        // Fast filter: 3 x 40 px/s covers it.
        assert!(!is_discontinuous(&color, &flow, 10.0, &predicted, &Vector2::new(40.0, 0.0), &config));
        // Inside the dead zone any speed is fine.
        let near = Vector2::new(190.0, 200.0);
        assert!(!is_discontinuous(&color, &flow, 10.0, &near, &Vector2::zeros(), &config));
    }

    #[test]
    fn test_discontinuity_symmetric() {
        let mut rng = StdRng::seed_from_u64(3);
        let config = LockConfig::default();
        for _ in 0..10_000 {
            let a = random_point(&mut rng);
            let b = random_point(&mut rng);
            let predicted = random_point(&mut rng);
            let velocity = Vector2::new(rng.random_range(-100.0..100.0), rng.random_range(-100.0..100.0));
            let radius = rng.random_range(1.0..60.0);

            assert_eq!(
                is_discontinuous(&a, &b, radius, &predicted, &velocity, &config),
                is_discontinuous(&b, &a, radius, &predicted, &velocity, &config),
            );
        }
    }

    #[test]
    fn test_flow_only_when_colour_missing_or_rejected() {
        let flow = Vector2::new(10.0, 20.0);
        let color = Vector2::new(90.0, 20.0);

        let (branch, obs) = fuse(None, Some(&flow), false);
        assert_eq!(branch, FusionBranch::FlowOnly);
        assert_eq!(obs, Some(flow));

        let (branch, obs) = fuse(Some(&color), Some(&flow), true);
        assert_eq!(branch, FusionBranch::FlowOnly);
        assert_eq!(obs, Some(flow));
    }

    #[test]
    fn test_colour_alone_is_a_miss() {
        let (branch, obs) = fuse(Some(&Vector2::new(1.0, 2.0)), None, false);
        assert_eq!(branch, FusionBranch::Missed);
        assert!(obs.is_none());

        assert_eq!(fuse(None, None, false).0, FusionBranch::Missed);
    }
}
