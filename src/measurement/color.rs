//! Colour Measurement Unit.
//!
//! Thresholds a frame in HSV against a learned hue/saturation window,
//! cleans the mask with an opening then a closing, and reports the blob
//! centroid closest to the filter's current estimate. OpenCV hue is
//! circular over `0..180`, so a window around red straddles the wrap.

use anyhow::Result;
use nalgebra::Vector2;
use opencv::core::{self, Mat, Point, Rect, Scalar, Size, Vector};
use opencv::imgproc;
use opencv::prelude::*;
use tracing::debug;

use crate::config::ColorConfig;

/// Exclusive upper bound of OpenCV 8-bit hue.
pub const HUE_RANGE: f64 = 180.0;

/// Map any hue onto `[0, 180)`.
pub fn bound_hue(hue: f64) -> u8 {
    let wrapped = hue.rem_euclid(HUE_RANGE);
    // rem_euclid can round up to exactly 180 for tiny negative inputs.
    if wrapped >= HUE_RANGE { 0 } else { wrapped as u8 }
}

/// Clamp a saturation value onto `[0, 255]`.
pub fn clamp_saturation(sat: f64) -> u8 {
    if sat.is_nan() {
        return 0;
    }
    sat.clamp(0.0, 255.0) as u8
}

/// Closed hue interval on the hue circle. `upper < lower` means it wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HueRange {
    pub lower: u8,
    pub upper: u8,
}

impl HueRange {
    /// Interval `mean ± window`, wrapped onto the hue circle.
    pub fn around(mean: f64, window: f64) -> Self {
        let window = window.abs();
        if 2.0 * window >= HUE_RANGE {
            return Self {
                lower: 0,
                upper: (HUE_RANGE as u8) - 1,
            };
        }
        Self {
            lower: bound_hue(mean - window),
            upper: bound_hue(mean + window),
        }
    }

    pub fn wraps(&self) -> bool {
        self.upper < self.lower
    }
}

/// Closed saturation interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaturationRange {
    pub lower: u8,
    pub upper: u8,
}

impl SaturationRange {
    pub fn around(mean: f64, window: f64) -> Self {
        let window = window.abs();
        Self {
            lower: clamp_saturation(mean - window),
            upper: clamp_saturation(mean + window),
        }
    }
}

/// Learned colour of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorProfile {
    pub hue: HueRange,
    pub saturation: SaturationRange,
}

impl ColorProfile {
    pub fn from_means(hue_mean: f64, sat_mean: f64, config: &ColorConfig) -> Self {
        Self {
            hue: HueRange::around(hue_mean, config.hue_window),
            saturation: SaturationRange::around(sat_mean, config.sat_window),
        }
    }

    /// Learn the profile from the mean hue/saturation of `roi` in a BGR frame.
    pub fn from_region(bgr: &Mat, roi: Rect, config: &ColorConfig) -> Result<Self> {
        let region = Mat::roi(bgr, roi)?.try_clone()?;
        let mut hsv = Mat::default();
        imgproc::cvt_color_def(&region, &mut hsv, imgproc::COLOR_BGR2HSV)?;
        let mean = core::mean_def(&hsv)?;
        Ok(Self::from_means(mean[0], mean[1], config))
    }

    /// Binary mask of HSV pixels inside the profile. Value is unconstrained.
    pub fn threshold(&self, hsv: &Mat) -> Result<Mat> {
        let sat_lo = self.saturation.lower as f64;
        let sat_hi = self.saturation.upper as f64;
        let mut mask = Mat::default();

        if !self.hue.wraps() {
            core::in_range(
                hsv,
                &Scalar::new(self.hue.lower as f64, sat_lo, 0.0, 0.0),
                &Scalar::new(self.hue.upper as f64, sat_hi, 255.0, 0.0),
                &mut mask,
            )?;
            return Ok(mask);
        }

        // Two passes: [lower, 180] and [0, upper].
        let mut high_band = Mat::default();
        let mut low_band = Mat::default();
        core::in_range(
            hsv,
            &Scalar::new(self.hue.lower as f64, sat_lo, 0.0, 0.0),
            &Scalar::new(HUE_RANGE, sat_hi, 255.0, 0.0),
            &mut high_band,
        )?;
        core::in_range(
            hsv,
            &Scalar::new(0.0, sat_lo, 0.0, 0.0),
            &Scalar::new(self.hue.upper as f64, sat_hi, 255.0, 0.0),
            &mut low_band,
        )?;
        core::bitwise_or_def(&high_band, &low_band, &mut mask)?;
        Ok(mask)
    }
}

/// One blob that survived mask cleaning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlobCandidate {
    pub centroid: Vector2<f64>,
    pub area: f64,
}

/// Centroids of the given contours, skipping zero-area ones.
pub fn blob_candidates(contours: &Vector<Vector<Point>>) -> Result<Vec<BlobCandidate>> {
    let mut candidates = Vec::with_capacity(contours.len());
    for contour in contours.iter() {
        let m = imgproc::moments(&contour, false)?;
        if m.m00 <= 0.0 {
            continue;
        }
        candidates.push(BlobCandidate {
            centroid: Vector2::new(m.m10 / m.m00, m.m01 / m.m00),
            area: m.m00,
        });
    }
    Ok(candidates)
}

/// Candidate whose centroid is closest to `estimate`.
pub fn nearest_candidate<'a>(
    candidates: &'a [BlobCandidate],
    estimate: &Vector2<f64>,
) -> Option<&'a BlobCandidate> {
    candidates.iter().min_by(|a, b| {
        let da = (a.centroid - estimate).norm_squared();
        let db = (b.centroid - estimate).norm_squared();
        da.total_cmp(&db)
    })
}

pub struct ColorUnit {
    profile: ColorProfile,
    kernel: Mat,
    base_radius: f64,
    target_radius: f64,
    locked: bool,
}

impl ColorUnit {
    pub fn new(profile: ColorProfile, config: &ColorConfig) -> Result<Self> {
        let kernel = imgproc::get_structuring_element(
            imgproc::MORPH_ELLIPSE,
            Size::new(config.kernel_size, config.kernel_size),
            Point::new(-1, -1),
        )?;
        Ok(Self {
            profile,
            kernel,
            base_radius: config.base_target_radius,
            target_radius: config.base_target_radius,
            locked: false,
        })
    }

    pub fn profile(&self) -> &ColorProfile {
        &self.profile
    }

    /// Radius around the last blob used to seed flow points and gate jumps.
    pub fn target_radius(&self) -> f64 {
        self.target_radius
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Measure the target position in a BGR frame.
    ///
    /// Returns the centroid of the blob nearest `estimate`, or `None` when no
    /// blob survives thresholding and cleaning.
    pub fn observe(&mut self, bgr: &Mat, estimate: &Vector2<f64>) -> Result<Option<Vector2<f64>>> {
        self.locked = false;

        let mut hsv = Mat::default();
        imgproc::cvt_color_def(bgr, &mut hsv, imgproc::COLOR_BGR2HSV)?;
        let mask = self.profile.threshold(&hsv)?;

        let mut opened = Mat::default();
        imgproc::morphology_ex_def(&mask, &mut opened, imgproc::MORPH_OPEN, &self.kernel)?;
        let mut cleaned = Mat::default();
        imgproc::morphology_ex_def(&opened, &mut cleaned, imgproc::MORPH_CLOSE, &self.kernel)?;

        let mut contours = Vector::<Vector<Point>>::new();
        imgproc::find_contours(
            &cleaned,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_SIMPLE,
            Point::new(0, 0),
        )?;

        let candidates = blob_candidates(&contours)?;
        let Some(best) = nearest_candidate(&candidates, estimate) else {
            debug!(contours = contours.len(), "No colour blob");
            return Ok(None);
        };

        self.target_radius = (best.area / std::f64::consts::PI).sqrt() + self.base_radius;
        self.locked = true;
        debug!(
            x = best.centroid.x,
            y = best.centroid.y,
            radius = self.target_radius,
            "Colour blob"
        );
        Ok(Some(best.centroid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use opencv::core::CV_8UC3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const GREEN: (f64, f64, f64) = (0.0, 255.0, 0.0);
    const RED: (f64, f64, f64) = (0.0, 0.0, 255.0);

    fn canvas() -> Mat {
        Mat::new_rows_cols_with_default(240, 320, CV_8UC3, Scalar::all(0.0)).unwrap()
    }

    fn draw_square(img: &mut Mat, center: (i32, i32), half: i32, bgr: (f64, f64, f64)) {
        imgproc::rectangle(
            img,
            Rect::new(center.0 - half, center.1 - half, 2 * half + 1, 2 * half + 1),
            Scalar::new(bgr.0, bgr.1, bgr.2, 0.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
    }

    fn unit_for(bgr: (f64, f64, f64)) -> ColorUnit {
        let mut img = canvas();
        draw_square(&mut img, (50, 50), 5, bgr);
        let config = ColorConfig::default();
        let profile = ColorProfile::from_region(&img, Rect::new(47, 47, 6, 6), &config).unwrap();
        ColorUnit::new(profile, &config).unwrap()
    }

    fn hue_in(range: &HueRange, hue: u8) -> bool {
        if range.wraps() {
            hue >= range.lower || hue <= range.upper
        } else {
            hue >= range.lower && hue <= range.upper
        }
    }

    #[test]
    fn test_hue_wraps_below_zero() {
        let range = HueRange::around(5.0, 10.0);
        assert_eq!(range.lower, 175);
        assert_eq!(range.upper, 15);
        assert!(range.wraps());
        assert!(hue_in(&range, 178));
        assert!(hue_in(&range, 0));
        assert!(hue_in(&range, 15));
        assert!(!hue_in(&range, 90));
    }

    #[test]
    fn test_hue_wraps_above_range() {
        let range = HueRange::around(175.0, 10.0);
        assert_eq!(range.lower, 165);
        assert_eq!(range.upper, 5);
        assert!(range.wraps());
    }

    #[test]
    fn test_hue_plain_interval() {
        let range = HueRange::around(60.0, 10.0);
        assert_eq!((range.lower, range.upper), (50, 70));
        assert!(!range.wraps());
        assert!(hue_in(&range, 60));
        assert!(!hue_in(&range, 71));
    }

    #[test]
    fn test_wide_hue_window_covers_circle() {
        let range = HueRange::around(30.0, 95.0);
        assert_eq!((range.lower, range.upper), (0, 179));
        assert!((0..180).all(|h| hue_in(&range, h as u8)));
    }

    #[test]
    fn test_hue_bounds_always_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10_000 {
            let mean = rng.random_range(-400.0..400.0);
            let window = rng.random_range(0.0..89.0);
            let range = HueRange::around(mean, window);

            assert!(range.lower < 180 && range.upper < 180);
            // The wrapped mean always falls inside the interval.
            assert!(hue_in(&range, bound_hue(mean)), "mean {} window {}", mean, window);
        }
    }

    #[test]
    fn test_bound_hue_tiny_negative() {
        assert_eq!(bound_hue(-1e-18), 0);
        assert_eq!(bound_hue(180.0), 0);
        assert_eq!(bound_hue(-180.0), 0);
        assert_eq!(bound_hue(359.5), 179);
    }

    #[test]
    fn test_saturation_clamp_idempotent() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..10_000 {
            let s = rng.random_range(-1000.0..1000.0);
            let once = clamp_saturation(s);
            assert_eq!(clamp_saturation(once as f64), once);
        }
        assert_eq!(clamp_saturation(-3.0), 0);
        assert_eq!(clamp_saturation(300.0), 255);
        assert_eq!(clamp_saturation(f64::NAN), 0);
    }

    #[test]
    fn test_profile_from_green_region() {
        let unit = unit_for(GREEN);
        let profile = unit.profile();
        assert_eq!((profile.hue.lower, profile.hue.upper), (50, 70));
        assert_eq!(profile.saturation.upper, 255);
        assert_eq!(profile.saturation.lower, 195);
    }

    #[test]
    fn test_profile_from_red_region_wraps() {
        let unit = unit_for(RED);
        assert!(unit.profile().hue.wraps());
    }

    #[test]
    fn test_observe_green_square() {
        let mut unit = unit_for(GREEN);
        let mut img = canvas();
        draw_square(&mut img, (100, 100), 10, GREEN);

        let obs = unit.observe(&img, &Vector2::new(90.0, 90.0)).unwrap().unwrap();
        assert_relative_eq!(obs, Vector2::new(100.0, 100.0), epsilon = 0.5);
        assert!(unit.is_locked());

        let expected_radius = (400.0 / std::f64::consts::PI).sqrt() + 10.0;
        assert_relative_eq!(unit.target_radius(), expected_radius, epsilon = 0.5);
    }

    #[test]
    fn test_observe_red_square_across_hue_wrap() {
        let mut unit = unit_for(RED);
        let mut img = canvas();
        draw_square(&mut img, (200, 120), 12, RED);

        let obs = unit.observe(&img, &Vector2::new(0.0, 0.0)).unwrap().unwrap();
        assert_relative_eq!(obs, Vector2::new(200.0, 120.0), epsilon = 0.5);
    }

    #[test]
    fn test_observe_picks_blob_nearest_estimate() {
        let mut unit = unit_for(GREEN);
        let mut img = canvas();
        draw_square(&mut img, (60, 60), 8, GREEN);
        draw_square(&mut img, (250, 180), 8, GREEN);

        let near_first = unit.observe(&img, &Vector2::new(70.0, 70.0)).unwrap().unwrap();
        assert_relative_eq!(near_first, Vector2::new(60.0, 60.0), epsilon = 0.5);

        let near_second = unit.observe(&img, &Vector2::new(240.0, 170.0)).unwrap().unwrap();
        assert_relative_eq!(near_second, Vector2::new(250.0, 180.0), epsilon = 0.5);
    }

    #[test]
    fn test_observe_miss_unlocks() {
        let mut unit = unit_for(GREEN);
        let mut img = canvas();
        draw_square(&mut img, (100, 100), 10, GREEN);
        assert!(unit.observe(&img, &Vector2::zeros()).unwrap().is_some());

        let mut other = canvas();
        draw_square(&mut other, (100, 100), 10, RED);
        assert!(unit.observe(&other, &Vector2::zeros()).unwrap().is_none());
        assert!(!unit.is_locked());
    }

    #[test]
    fn test_speck_removed_by_opening() {
        let mut unit = unit_for(GREEN);
        let mut img = canvas();
        draw_square(&mut img, (100, 100), 0, GREEN);

        assert!(unit.observe(&img, &Vector2::zeros()).unwrap().is_none());
    }

    #[test]
    fn test_nearest_candidate_empty() {
        assert!(nearest_candidate(&[], &Vector2::zeros()).is_none());
    }
}
