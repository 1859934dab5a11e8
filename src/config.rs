//! Engine configuration: every tunable named in the specification, with the
//! specification's own defaults, plus validation.

use crate::error::{Error, Result};

/// Full set of tunables governing detection, matching, tracking, and
/// the vocabulary tree. `AREngine::configure` accepts a sparse
/// [`ConfigureOptions`] patch and applies it on top of the current value.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Use optical-flow tracking between detections, vs. detecting every frame.
    pub use_optical_flow: bool,
    /// Run full detection every `detection_interval` frames (>= 1).
    pub detection_interval: u32,
    /// Cap on keypoints retained per extraction call.
    pub max_features: usize,
    /// Cap on tracked points per target.
    pub max_tracking_points: usize,
    /// Lowe's ratio-test threshold for descriptor matching.
    pub match_ratio_threshold: f32,
    /// RANSAC reprojection threshold in pixels.
    pub ransac_threshold: f64,
    /// RANSAC iteration budget.
    pub ransac_iterations: usize,
    /// RANSAC target confidence.
    pub ransac_confidence: f64,
    /// Number of vocabulary-tree candidates considered per detection pass.
    pub candidate_count: usize,
    /// Hard cap on homography estimations attempted per detection pass.
    pub max_candidates: usize,
    /// Minimum inlier correspondences to accept a homography.
    pub min_matches_for_homography: usize,
    /// Minimum surviving tracked points to keep tracking a target.
    pub min_tracking_points: usize,
    /// Reference descriptors kept per target.
    pub max_features_per_target: usize,

    /// FAST corner-response threshold used by the BRISK-style extractor.
    pub fast_threshold: u8,
    /// Number of pyramid octaves the extractor scans.
    pub num_octaves: u32,
    /// Scales the descriptor sampling pattern's radius.
    pub pattern_scale: f32,

    /// Homography scale-change bound: valid determinant range is
    /// `[1/max_scale_change^2, max_scale_change^2]`.
    pub max_scale_change: f64,
    /// Minimum interior angle (degrees) of the projected quadrilateral.
    pub min_corner_angle_deg: f64,
    /// Maximum interior angle (degrees) of the projected quadrilateral.
    pub max_corner_angle_deg: f64,
    /// Maximum allowed aspect-ratio change vs. the reference corners.
    pub max_aspect_ratio_change: f64,
    /// Minimum projected-quadrilateral area, in pixels^2.
    pub min_area_threshold: f64,

    /// Lucas-Kanade search window side length (odd, e.g. 21 for 21x21).
    pub lk_window_size: u32,
    /// Number of pyramid levels the optical-flow tracker builds.
    pub lk_pyramid_levels: u32,
    /// LK iteration termination: stop when the update step is below this.
    pub lk_term_epsilon: f32,
    /// LK iteration termination: hard cap on refinement iterations.
    pub lk_term_max_iterations: u32,
    /// Minimum spatial-gradient eigenvalue for a point to be trackable.
    pub lk_min_eigenvalue: f32,

    /// Baseline forward-backward error rejection threshold, pixels.
    pub fb_error_threshold_base: f32,
    /// Adaptive ceiling for the forward-backward threshold, pixels.
    pub fb_error_threshold_max: f32,
    /// Per-frame displacement above which a tracked point is rejected.
    pub max_flow_magnitude: f32,
    /// Consecutive bad tracking frames before a target is declared LOST.
    pub quality_degradation_frames: u32,
    /// Re-seed tracked points every N tracking frames.
    pub feature_refresh_interval: u32,
    /// Spatial coverage grid (N x N) used when re-seeding tracked points.
    pub spatial_grid_size: u32,

    /// Confidence weight on inlier ratio.
    pub weight_ratio: f32,
    /// Confidence weight on forward-backward consistency.
    pub weight_fb: f32,
    /// Confidence weight on geometric validity score.
    pub weight_geom: f32,

    /// Vocabulary tree branching factor.
    pub vocab_branching_factor: usize,
    /// Vocabulary tree depth.
    pub vocab_depth: usize,
    /// Seed for deterministic k-means clustering.
    pub vocab_kmeans_seed: u64,

    /// Databases with at most this many targets bypass the vocabulary tree
    /// and return every target id as a detection candidate.
    pub vocab_bypass_max_targets: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            use_optical_flow: true,
            detection_interval: 15,
            max_features: 500,
            max_tracking_points: 100,
            match_ratio_threshold: 0.7,
            ransac_threshold: 3.0,
            ransac_iterations: 2000,
            ransac_confidence: 0.995,
            candidate_count: 3,
            max_candidates: 5,
            min_matches_for_homography: 8,
            min_tracking_points: 8,
            max_features_per_target: 500,

            fast_threshold: 20,
            num_octaves: 4,
            pattern_scale: 1.0,

            max_scale_change: 4.0,
            min_corner_angle_deg: 20.0,
            max_corner_angle_deg: 160.0,
            max_aspect_ratio_change: 2.0,
            min_area_threshold: 100.0,

            lk_window_size: 21,
            lk_pyramid_levels: 4,
            lk_term_epsilon: 0.01,
            lk_term_max_iterations: 30,
            lk_min_eigenvalue: 1e-3,

            fb_error_threshold_base: 1.5,
            fb_error_threshold_max: 4.0,
            max_flow_magnitude: 150.0,
            quality_degradation_frames: 3,
            feature_refresh_interval: 10,
            spatial_grid_size: 4,

            weight_ratio: 0.4,
            weight_fb: 0.3,
            weight_geom: 0.3,

            vocab_branching_factor: 10,
            vocab_depth: 2,
            vocab_kmeans_seed: 0xA12_F00D,

            vocab_bypass_max_targets: 3,
        }
    }
}

impl EngineConfig {
    /// Validate ranges. Called by `AREngine::configure` after applying a patch.
    pub fn validate(&self) -> Result<()> {
        if self.detection_interval < 1 {
            return Err(Error::InvalidConfiguration(
                "detection_interval must be >= 1".into(),
            ));
        }
        if self.max_features == 0 {
            return Err(Error::InvalidConfiguration(
                "max_features must be > 0".into(),
            ));
        }
        if self.max_tracking_points == 0 {
            return Err(Error::InvalidConfiguration(
                "max_tracking_points must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.match_ratio_threshold) {
            return Err(Error::InvalidConfiguration(
                "match_ratio_threshold must be in [0, 1]".into(),
            ));
        }
        if self.ransac_threshold <= 0.0 {
            return Err(Error::InvalidConfiguration(
                "ransac_threshold must be > 0".into(),
            ));
        }
        if self.ransac_iterations == 0 {
            return Err(Error::InvalidConfiguration(
                "ransac_iterations must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.ransac_confidence) {
            return Err(Error::InvalidConfiguration(
                "ransac_confidence must be in [0, 1]".into(),
            ));
        }
        if self.candidate_count == 0 {
            return Err(Error::InvalidConfiguration(
                "candidate_count must be > 0".into(),
            ));
        }
        if self.max_candidates == 0 {
            return Err(Error::InvalidConfiguration(
                "max_candidates must be > 0".into(),
            ));
        }
        if self.min_tracking_points == 0 {
            return Err(Error::InvalidConfiguration(
                "min_tracking_points must be > 0".into(),
            ));
        }
        if self.num_octaves == 0 {
            return Err(Error::InvalidConfiguration(
                "num_octaves must be > 0".into(),
            ));
        }
        if self.pattern_scale <= 0.0 {
            return Err(Error::InvalidConfiguration(
                "pattern_scale must be > 0".into(),
            ));
        }
        if self.min_corner_angle_deg >= self.max_corner_angle_deg {
            return Err(Error::InvalidConfiguration(
                "min_corner_angle_deg must be < max_corner_angle_deg".into(),
            ));
        }
        if self.max_scale_change <= 1.0 {
            return Err(Error::InvalidConfiguration(
                "max_scale_change must be > 1".into(),
            ));
        }
        if self.min_area_threshold < 0.0 {
            return Err(Error::InvalidConfiguration(
                "min_area_threshold must be >= 0".into(),
            ));
        }
        if self.lk_window_size < 3 || self.lk_window_size % 2 == 0 {
            return Err(Error::InvalidConfiguration(
                "lk_window_size must be odd and >= 3".into(),
            ));
        }
        if self.lk_pyramid_levels == 0 {
            return Err(Error::InvalidConfiguration(
                "lk_pyramid_levels must be > 0".into(),
            ));
        }
        if self.lk_term_epsilon <= 0.0 {
            return Err(Error::InvalidConfiguration(
                "lk_term_epsilon must be > 0".into(),
            ));
        }
        if self.lk_term_max_iterations == 0 {
            return Err(Error::InvalidConfiguration(
                "lk_term_max_iterations must be > 0".into(),
            ));
        }
        if self.lk_min_eigenvalue <= 0.0 {
            return Err(Error::InvalidConfiguration(
                "lk_min_eigenvalue must be > 0".into(),
            ));
        }
        if self.fb_error_threshold_base <= 0.0 || self.fb_error_threshold_max < self.fb_error_threshold_base {
            return Err(Error::InvalidConfiguration(
                "fb_error_threshold_max must be >= fb_error_threshold_base > 0".into(),
            ));
        }
        if self.quality_degradation_frames == 0 {
            return Err(Error::InvalidConfiguration(
                "quality_degradation_frames must be > 0".into(),
            ));
        }
        if self.feature_refresh_interval == 0 {
            return Err(Error::InvalidConfiguration(
                "feature_refresh_interval must be > 0".into(),
            ));
        }
        if self.spatial_grid_size == 0 {
            return Err(Error::InvalidConfiguration(
                "spatial_grid_size must be > 0".into(),
            ));
        }
        let weight_sum = self.weight_ratio + self.weight_fb + self.weight_geom;
        if (weight_sum - 1.0).abs() > 1e-3 {
            return Err(Error::InvalidConfiguration(format!(
                "confidence weights must sum to 1.0, got {weight_sum}"
            )));
        }
        if self.vocab_branching_factor < 2 {
            return Err(Error::InvalidConfiguration(
                "vocab_branching_factor must be >= 2".into(),
            ));
        }
        if self.vocab_depth == 0 {
            return Err(Error::InvalidConfiguration(
                "vocab_depth must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Sparse patch applied to [`EngineConfig`] by `AREngine::configure`.
/// Every field is optional; unset fields leave the current value untouched.
#[derive(Debug, Clone, Default)]
pub struct ConfigureOptions {
    pub use_optical_flow: Option<bool>,
    pub detection_interval: Option<u32>,
    pub max_features: Option<usize>,
    pub max_tracking_points: Option<usize>,
    pub match_ratio_threshold: Option<f32>,
    pub ransac_threshold: Option<f64>,
    pub ransac_iterations: Option<usize>,
    pub candidate_count: Option<usize>,
    pub max_candidates: Option<usize>,
}

impl ConfigureOptions {
    /// Apply this patch onto a config, returning the updated config.
    /// Does not validate; the caller is expected to call `validate()`.
    pub fn apply(&self, base: &EngineConfig) -> EngineConfig {
        let mut cfg = base.clone();
        if let Some(v) = self.use_optical_flow {
            cfg.use_optical_flow = v;
        }
        if let Some(v) = self.detection_interval {
            cfg.detection_interval = v;
        }
        if let Some(v) = self.max_features {
            cfg.max_features = v;
        }
        if let Some(v) = self.max_tracking_points {
            cfg.max_tracking_points = v;
        }
        if let Some(v) = self.match_ratio_threshold {
            cfg.match_ratio_threshold = v;
        }
        if let Some(v) = self.ransac_threshold {
            cfg.ransac_threshold = v;
        }
        if let Some(v) = self.ransac_iterations {
            cfg.ransac_iterations = v;
        }
        if let Some(v) = self.candidate_count {
            cfg.candidate_count = v;
        }
        if let Some(v) = self.max_candidates {
            cfg.max_candidates = v;
        }
        cfg
    }
}
