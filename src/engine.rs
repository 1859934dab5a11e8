//! AR Engine (Coordinator): owns per-target lifecycle, decides detect-vs-
//! track per frame, and drives the detector/tracker/database/pool.

use std::collections::HashMap;
use std::time::Instant;

use nalgebra::Matrix3;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{ConfigureOptions, EngineConfig};
use crate::database::{NewTarget, TargetDatabase};
use crate::detector::{self, BriskDetector, FeatureDetector};
use crate::error::{Error, Result};
use crate::geometry::Pt;
use crate::pool::{Loaned, MemoryPool, MemoryInfo};
use crate::stats::{Stats, StatsSnapshot};
use crate::tracker::{self, kalman::CornerKalman, TrackStep, TrackedPoint};
use crate::types::{Corners, Descriptor, GrayView, Keypoint, RawFrame, TrackingMode, TrackingResult, DESCRIPTOR_BYTES};

/// Fixed seed for the RANSAC/sampling RNG the engine drives internally.
/// Determinism here mirrors the vocabulary tree's fixed k-means seed: same
/// inputs, same frame sequence, same results.
const ENGINE_RNG_SEED: u64 = 0xA4E7_1234_0BAD_F00D;

/// Per-target record the coordinator owns for as long as a target is
/// DETECTED or TRACKING. Absence from the map means IDLE; the record is
/// dropped on a confirmed LOST transition or on `reset`.
struct TargetRecord {
    corners: Corners,
    confidence: f32,
    mode: TrackingMode,
    points: Vec<TrackedPoint>,
    reference_corners: Corners,
    last_homography: Matrix3<f64>,
    prev_gray: Loaned<u8>,
    prev_width: u32,
    prev_height: u32,
    kalman: [CornerKalman; 4],
    degraded_frames: u32,
    frames_since_refresh: u32,
}

/// The coordinator: the crate's public entry point.
pub struct AREngine {
    config: EngineConfig,
    database: TargetDatabase,
    detector: BriskDetector,
    pool: MemoryPool,
    frame_pixel_len: usize,
    targets: HashMap<String, TargetRecord>,
    running: bool,
    frame_index: u64,
    rng: StdRng,
    stats: Stats,
    oom_pending: bool,
    #[cfg(debug_assertions)]
    homography_attempts_last_frame: usize,
}

impl AREngine {
    /// Build a new engine from a validated configuration. The memory pool
    /// is sized lazily against the first frame's dimensions, since frame
    /// size is fixed for the session but unknown at construction time.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let detector = BriskDetector::from_config(&config);
        Ok(Self {
            pool: empty_pool(&config),
            frame_pixel_len: 0,
            detector,
            database: TargetDatabase::new(),
            targets: HashMap::new(),
            running: false,
            frame_index: 0,
            rng: StdRng::seed_from_u64(ENGINE_RNG_SEED),
            stats: Stats::new(),
            oom_pending: false,
            #[cfg(debug_assertions)]
            homography_attempts_last_frame: 0,
            config,
        })
    }

    /// Merge a sparse options patch onto the current configuration and
    /// re-validate. Per §6's `configure`.
    pub fn configure(&mut self, opts: &ConfigureOptions) -> Result<()> {
        let merged = opts.apply(&self.config);
        merged.validate()?;
        self.config = merged;
        log::info!("engine configured: {:?}", self.config);
        Ok(())
    }

    pub fn start(&mut self) {
        self.running = true;
        log::info!("engine started");
    }

    pub fn stop(&mut self) {
        self.running = false;
        log::info!("engine stopped");
    }

    /// Clears all per-target tracking state; configuration and the target
    /// database are untouched.
    pub fn reset(&mut self) {
        self.targets.clear();
        self.frame_index = 0;
        log::info!("engine reset: per-target state cleared");
    }

    fn check_oom_pending(&mut self) -> Result<()> {
        if self.oom_pending {
            self.oom_pending = false;
            return Err(Error::OutOfMemory(
                "pool exhaustion occurred during a previous process_frame call".into(),
            ));
        }
        Ok(())
    }

    /// Insert a new reference target. The external interface table (spec
    /// §6) lists only descriptors/corners/metadata for `add_target`, but
    /// homography estimation needs a reference keypoint per descriptor —
    /// see `database::NewTarget`'s doc comment for why both are required.
    #[allow(clippy::too_many_arguments)]
    pub fn add_target(
        &mut self,
        id: impl Into<String>,
        keypoints: Vec<Keypoint>,
        descriptors: Vec<Descriptor>,
        ref_width: u32,
        ref_height: u32,
        ref_corners: Corners,
        metadata: Vec<u8>,
    ) -> Result<()> {
        self.check_oom_pending()?;
        self.database.add(
            NewTarget { id: id.into(), keypoints, descriptors, ref_width, ref_height, ref_corners, metadata },
            self.config.max_features_per_target,
        )
    }

    pub fn remove_target(&mut self, id: &str) -> Result<()> {
        self.check_oom_pending()?;
        self.database.remove(id);
        self.targets.remove(id);
        Ok(())
    }

    pub fn clear_targets(&mut self) -> Result<()> {
        self.check_oom_pending()?;
        self.database.clear();
        self.targets.clear();
        Ok(())
    }

    pub fn build_vocabulary(&mut self) -> Result<()> {
        self.check_oom_pending()?;
        self.database.build_vocabulary(&self.config)
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn get_memory_info(&self) -> MemoryInfo {
        self.pool.memory_info()
    }

    /// Homography-estimation attempts made during the most recent
    /// `process_frame` call. Exists so tests can assert `max_candidates`
    /// bounds the work done per frame (spec §8 scenario 6).
    #[cfg(debug_assertions)]
    pub fn homography_attempts_last_frame(&self) -> usize {
        self.homography_attempts_last_frame
    }

    /// Convert, detect-or-track, and emit results for one frame. Never
    /// fails: a frame that can't be processed (bad buffer, pool exhaustion)
    /// yields an empty result list, per the error-handling design's "process
    /// frame always returns."
    pub fn process_frame(&mut self, frame: RawFrame) -> Vec<TrackingResult> {
        let total_start = Instant::now();
        if !self.running {
            return Vec::new();
        }
        if let Err(e) = frame.validate() {
            log::warn!("process_frame: rejecting frame: {e}");
            return Vec::new();
        }

        let pixel_len = frame.width as usize * frame.height as usize;
        self.ensure_pool_sized(pixel_len);

        let mut gray = match self.pool.frame_buffers.acquire() {
            Ok(g) => g,
            Err(e) => {
                log::error!("process_frame: frame buffer pool exhausted: {e}");
                self.oom_pending = true;
                return Vec::new();
            }
        };
        frame.write_grayscale_into(&mut gray);
        let gray_view = GrayView { width: frame.width, height: frame.height, pixels: &gray };

        #[cfg(debug_assertions)]
        {
            self.homography_attempts_last_frame = 0;
        }

        let any_tracked = !self.targets.is_empty();
        let periodic_detection = self.frame_index % self.config.detection_interval as u64 == 0;
        let run_full_detection = !any_tracked || !self.config.use_optical_flow || periodic_detection;

        let detection_start = Instant::now();
        let mut detection_ms = 0.0;
        let mut tracking_ms = 0.0;

        if run_full_detection {
            self.run_full_detection(&gray_view, frame.width, frame.height);
            detection_ms = detection_start.elapsed().as_secs_f64() * 1000.0;
        } else {
            let tracking_start = Instant::now();
            self.run_tracking_pass(&gray_view, frame.width, frame.height);
            tracking_ms = tracking_start.elapsed().as_secs_f64() * 1000.0;
        }

        self.frame_index += 1;

        let total_ms = total_start.elapsed().as_secs_f64() * 1000.0;
        self.stats.record(detection_ms, tracking_ms, total_ms);

        let mut results: Vec<TrackingResult> = self
            .targets
            .iter()
            .map(|(id, record)| TrackingResult {
                target_id: id.clone(),
                detected: record.mode == TrackingMode::Detection,
                corners: record.corners,
                confidence: record.confidence,
                mode: record.mode,
            })
            .collect();
        results.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        results
    }

    fn ensure_pool_sized(&mut self, pixel_len: usize) {
        if self.frame_pixel_len != pixel_len {
            if self.frame_pixel_len != 0 {
                log::warn!(
                    "frame size changed mid-session ({} -> {} px); rebuilding frame buffer pool",
                    self.frame_pixel_len,
                    pixel_len
                );
            }
            self.pool = MemoryPool::new(
                pixel_len,
                self.config.max_features_per_target * DESCRIPTOR_BYTES,
                self.config.max_tracking_points * 2,
                4,
            );
            self.frame_pixel_len = pixel_len;
        }
    }

    fn run_full_detection(&mut self, gray_view: &GrayView, width: u32, height: u32) {
        let (frame_keypoints, frame_descriptors) = self.detector.extract(gray_view, self.config.max_features);
        if frame_keypoints.is_empty() {
            log::debug!("full detection: no features extracted this frame");
            return;
        }

        let candidates = match self.database.query_candidates(
            &frame_descriptors,
            self.config.candidate_count,
            self.config.vocab_bypass_max_targets,
        ) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("full detection: candidate query failed: {e}");
                Vec::new()
            }
        };

        for id in candidates.into_iter().take(self.config.max_candidates) {
            let Some(target) = self.database.get(&id) else { continue };
            let correspondences = detector::match_descriptors(&frame_descriptors, &target.descriptors, self.config.match_ratio_threshold);
            if correspondences.len() < 4 {
                continue;
            }

            let src: Vec<Pt> = correspondences
                .iter()
                .map(|c| Pt::new(target.keypoints[c.train_idx].x as f64, target.keypoints[c.train_idx].y as f64))
                .collect();
            let dst: Vec<Pt> = correspondences
                .iter()
                .map(|c| Pt::new(frame_keypoints[c.query_idx].x as f64, frame_keypoints[c.query_idx].y as f64))
                .collect();

            #[cfg(debug_assertions)]
            {
                self.homography_attempts_last_frame += 1;
            }
            let Some(estimate) = detector::estimate_homography(&src, &dst, &self.config, &mut self.rng) else { continue };
            let Some(validated) = detector::validate_homography(&estimate.h, &target.ref_corners, &self.config) else { continue };

            let inlier_ratio = estimate.inlier_count as f32 / src.len() as f32;
            let confidence = detector::confidence_score(inlier_ratio, 1.0, validated.geom_score as f32, &self.config);

            let points: Vec<TrackedPoint> = (0..correspondences.len())
                .filter(|&i| estimate.inlier_mask[i])
                .map(|i| TrackedPoint { frame_pos: nalgebra::Point2::new(dst[i].x as f32, dst[i].y as f32), ref_pos: nalgebra::Point2::new(src[i].x as f32, src[i].y as f32) })
                .collect();

            let Ok(mut prev_gray) = self.pool.frame_buffers.acquire() else {
                log::error!("full detection: could not acquire previous-frame buffer for target '{id}'");
                self.oom_pending = true;
                continue;
            };
            prev_gray.copy_from_slice(gray_view.pixels);

            // Kalman re-initialized (not re-measured) on (re-)detection, per
            // the open-question resolution: the safer choice.
            let kalman = validated.projected_corners.map(|c| CornerKalman::new(c.x, c.y));

            log::info!("target '{id}' detected, confidence {confidence:.2}");
            self.targets.insert(
                id,
                TargetRecord {
                    corners: validated.projected_corners,
                    confidence,
                    mode: TrackingMode::Detection,
                    points,
                    reference_corners: target.ref_corners,
                    last_homography: validated.h,
                    prev_gray,
                    prev_width: width,
                    prev_height: height,
                    kalman,
                    degraded_frames: 0,
                    frames_since_refresh: 0,
                },
            );
        }
    }

    fn run_tracking_pass(&mut self, gray_view: &GrayView, width: u32, height: u32) {
        let ids: Vec<String> = self.targets.keys().cloned().collect();
        for id in ids {
            self.track_one_target(&id, gray_view, width, height);
        }
    }

    fn track_one_target(&mut self, id: &str, gray_view: &GrayView, width: u32, height: u32) {
        // Check the record out of the map for the duration of this call so
        // its borrow never overlaps a later `self.targets` mutation.
        let Some(mut record) = self.targets.remove(id) else { return };

        let prev_view = GrayView { width: record.prev_width, height: record.prev_height, pixels: &record.prev_gray };
        let step = tracker::track_step(
            &prev_view,
            gray_view,
            &record.points,
            &record.reference_corners,
            &mut record.kalman,
            &self.config,
            &mut self.rng,
        );

        let mut lost = false;
        match step {
            TrackStep::Tracking { corners, points, inlier_ratio, mean_fb_error, geom_score, h } => {
                record.corners = corners;
                record.points = points;
                record.last_homography = h;
                let fb_term = 1.0 - (mean_fb_error / self.config.fb_error_threshold_max).min(1.0);
                record.confidence = detector::confidence_score(inlier_ratio, fb_term, geom_score as f32, &self.config);
                record.mode = TrackingMode::OpticalFlow;
                record.degraded_frames = 0;
                record.frames_since_refresh += 1;

                if record.frames_since_refresh >= self.config.feature_refresh_interval {
                    record.frames_since_refresh = 0;
                    reseed_record(&mut record, &self.detector, gray_view, &self.config);
                }
            }
            TrackStep::Degraded => {
                record.degraded_frames += 1;
                if record.degraded_frames >= self.config.quality_degradation_frames {
                    log::info!("target '{id}' lost after {} degraded frames", record.degraded_frames);
                    lost = true;
                }
            }
        }

        if lost {
            return;
        }

        match self.pool.frame_buffers.acquire() {
            Ok(mut buf) => {
                buf.copy_from_slice(gray_view.pixels);
                record.prev_gray = buf;
                record.prev_width = width;
                record.prev_height = height;
            }
            Err(e) => {
                log::error!("track_one_target: could not refresh previous-frame buffer for '{id}': {e}");
            }
        }

        self.targets.insert(id.to_string(), record);
    }
}

fn reseed_record(record: &mut TargetRecord, detector: &BriskDetector, gray_view: &GrayView, cfg: &EngineConfig) {
    let Some(h_inv) = record.last_homography.try_inverse() else {
        log::warn!("reseed: homography not invertible, skipping re-seed this cycle");
        return;
    };
    let keypoints = tracker::reseed_points(detector, gray_view, &record.corners, cfg);
    record.points = keypoints
        .into_iter()
        .filter_map(|kp| {
            let frame_pt = Pt::new(kp.x as f64, kp.y as f64);
            let ref_pt = crate::geometry::apply_homography(&h_inv, frame_pt)?;
            Some(TrackedPoint {
                frame_pos: nalgebra::Point2::new(kp.x, kp.y),
                ref_pos: nalgebra::Point2::new(ref_pt.x as f32, ref_pt.y as f32),
            })
        })
        .collect();
}

fn empty_pool(cfg: &EngineConfig) -> MemoryPool {
    MemoryPool::new(0, cfg.max_features_per_target * DESCRIPTOR_BYTES, cfg.max_tracking_points * 2, 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Descriptor;

    fn rect_frame(width: u32, height: u32, rx: u32, ry: u32, rw: u32, rh: u32) -> Vec<u8> {
        let mut px = vec![15u8; (width * height) as usize];
        for y in ry..(ry + rh).min(height) {
            for x in rx..(rx + rw).min(width) {
                px[(y * width + x) as usize] = 235;
            }
        }
        px
    }

    fn detector_extract(width: u32, height: u32, pixels: &[u8]) -> (Vec<Keypoint>, Vec<Descriptor>) {
        let view = GrayView { width, height, pixels };
        let d = BriskDetector::new(20, 2, 1.0);
        d.extract(&view, 500)
    }

    #[test]
    fn empty_database_yields_empty_results() {
        let cfg = EngineConfig::default();
        let mut engine = AREngine::new(cfg).unwrap();
        engine.start();
        let pixels = vec![0u8; 640 * 480];
        let frame = RawFrame { pixels: &pixels, width: 640, height: 480, channels: 1 };
        let results = engine.process_frame(frame);
        assert!(results.is_empty());
        assert!(engine.get_stats().total_ms >= 0.0);
    }

    #[test]
    fn stopped_engine_returns_empty_without_processing() {
        let cfg = EngineConfig::default();
        let mut engine = AREngine::new(cfg).unwrap();
        let pixels = vec![0u8; 64 * 64];
        let frame = RawFrame { pixels: &pixels, width: 64, height: 64, channels: 1 };
        assert!(engine.process_frame(frame).is_empty());
    }

    #[test]
    fn detects_a_single_reference_target() {
        let width = 320u32;
        let height = 240u32;
        let (rx, ry, rw, rh) = (110u32, 70u32, 100u32, 100u32);
        let pixels = rect_frame(width, height, rx, ry, rw, rh);
        let (keypoints, descriptors) = detector_extract(width, height, &pixels);
        assert!(descriptors.len() >= 8, "synthetic target must yield enough features to match");

        let ref_corners: Corners = [
            nalgebra::Point2::new(rx as f32, ry as f32),
            nalgebra::Point2::new((rx + rw) as f32, ry as f32),
            nalgebra::Point2::new((rx + rw) as f32, (ry + rh) as f32),
            nalgebra::Point2::new(rx as f32, (ry + rh) as f32),
        ];

        let mut cfg = EngineConfig::default();
        cfg.min_matches_for_homography = 4;
        let mut engine = AREngine::new(cfg).unwrap();
        engine.add_target("square", keypoints, descriptors, width, height, ref_corners, Vec::new()).unwrap();
        engine.start();

        let frame = RawFrame { pixels: &pixels, width, height, channels: 1 };
        let results = engine.process_frame(frame);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].target_id, "square");
        assert!(results[0].detected);
        assert_eq!(results[0].mode, TrackingMode::Detection);
        assert!(results[0].confidence > 0.0);
    }

    #[test]
    fn reset_clears_tracking_state() {
        let cfg = EngineConfig::default();
        let mut engine = AREngine::new(cfg).unwrap();
        engine.start();
        engine.reset();
        assert!(engine.targets.is_empty());
    }

    #[test]
    fn remove_target_drops_its_tracking_record() {
        let cfg = EngineConfig::default();
        let mut engine = AREngine::new(cfg).unwrap();
        let prev_gray = engine.pool.frame_buffers.acquire().unwrap();
        let record = TargetRecord {
            corners: [nalgebra::Point2::new(0.0, 0.0); 4],
            confidence: 0.5,
            mode: TrackingMode::Detection,
            points: Vec::new(),
            reference_corners: [nalgebra::Point2::new(0.0, 0.0); 4],
            last_homography: Matrix3::identity(),
            prev_gray,
            prev_width: 1,
            prev_height: 1,
            kalman: [CornerKalman::new(0.0, 0.0), CornerKalman::new(0.0, 0.0), CornerKalman::new(0.0, 0.0), CornerKalman::new(0.0, 0.0)],
            degraded_frames: 0,
            frames_since_refresh: 0,
        };
        engine.targets.insert("ghost".to_string(), record);
        engine.remove_target("ghost").unwrap();
        assert!(!engine.targets.contains_key("ghost"));
    }
}
