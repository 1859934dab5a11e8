//! Black-box scenario tests against the public `AREngine` surface: the
//! literal end-to-end scenarios and cross-cutting invariants from the
//! testable-properties section, driven through synthetic in-process frames.

use ar_marker_core::detector::{BriskDetector, FeatureDetector};
use ar_marker_core::{
    AREngine, ConfigureOptions, Corners, Descriptor, EngineConfig, GrayView, Keypoint, RawFrame,
    TrackingMode,
};
use nalgebra::Point2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Scenario tests run with logging enabled so a failure's surrounding
/// coordinator/tracker log lines show up under `cargo test -- --nocapture`.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn rect_frame(width: u32, height: u32, rx: u32, ry: u32, rw: u32, rh: u32) -> Vec<u8> {
    let mut px = vec![15u8; (width * height) as usize];
    for y in ry..(ry + rh).min(height) {
        for x in rx..(rx + rw).min(width) {
            px[(y * width + x) as usize] = 235;
        }
    }
    px
}

fn extract(width: u32, height: u32, pixels: &[u8]) -> (Vec<Keypoint>, Vec<Descriptor>) {
    let view = GrayView { width, height, pixels };
    BriskDetector::new(20, 2, 1.0).extract(&view, 500)
}

/// Perturb every pixel by a small seeded random delta, simulating
/// sensor-level noise between a reference frame and a tracked frame.
fn add_noise(pixels: &mut [u8], seed: u64, amplitude: i32) {
    let mut rng = StdRng::seed_from_u64(seed);
    for p in pixels.iter_mut() {
        let delta = rng.gen_range(-amplitude..=amplitude);
        *p = (*p as i32 + delta).clamp(0, 255) as u8;
    }
}

fn rect_corners(rx: u32, ry: u32, rw: u32, rh: u32) -> Corners {
    [
        Point2::new(rx as f32, ry as f32),
        Point2::new((rx + rw) as f32, ry as f32),
        Point2::new((rx + rw) as f32, (ry + rh) as f32),
        Point2::new(rx as f32, (ry + rh) as f32),
    ]
}

/// Scenario 1: empty pipeline.
#[test]
fn empty_pipeline_yields_no_results() {
    init_logging();
    let mut cfg = EngineConfig::default();
    cfg.detection_interval = 15;
    let mut engine = AREngine::new(cfg).unwrap();
    engine.start();

    let pixels = vec![0u8; 640 * 480];
    let frame = RawFrame { pixels: &pixels, width: 640, height: 480, channels: 1 };
    let results = engine.process_frame(frame);
    assert!(results.is_empty());
    // must not panic reading stats after a no-op frame
    let _ = engine.get_stats();
}

/// Scenario 2: single-target detection.
#[test]
fn single_target_detection_reports_high_confidence() {
    init_logging();
    let width = 640u32;
    let height = 480u32;
    let (rx, ry, rw, rh) = (270u32, 190u32, 100u32, 100u32);
    let pixels = rect_frame(width, height, rx, ry, rw, rh);
    let (keypoints, descriptors) = extract(width, height, &pixels);
    assert!(descriptors.len() >= 16, "synthetic target must yield enough features to match");

    let ref_corners = rect_corners(rx, ry, rw, rh);
    let mut engine = AREngine::new(EngineConfig::default()).unwrap();
    engine.add_target("target", keypoints, descriptors, width, height, ref_corners, Vec::new()).unwrap();
    engine.start();

    let frame = RawFrame { pixels: &pixels, width, height, channels: 1 };
    let results = engine.process_frame(frame);

    assert_eq!(results.len(), 1);
    let r = &results[0];
    assert_eq!(r.target_id, "target");
    assert!(r.detected);
    assert_eq!(r.mode, TrackingMode::Detection);
    assert!(r.confidence >= 0.5, "confidence {} too low", r.confidence);
    for corner in r.corners.iter().zip(ref_corners.iter()) {
        assert!((corner.0.x - corner.1.x).abs() < 2.0);
        assert!((corner.0.y - corner.1.y).abs() < 2.0);
    }
}

/// Scenario 3: tracking hand-off after a small translation.
#[test]
fn tracking_hands_off_after_detection() {
    init_logging();
    let width = 640u32;
    let height = 480u32;
    let (rx, ry, rw, rh) = (270u32, 190u32, 100u32, 100u32);
    let pixels = rect_frame(width, height, rx, ry, rw, rh);
    let (keypoints, descriptors) = extract(width, height, &pixels);

    let ref_corners = rect_corners(rx, ry, rw, rh);
    let mut engine = AREngine::new(EngineConfig::default()).unwrap();
    engine.add_target("target", keypoints, descriptors, width, height, ref_corners, Vec::new()).unwrap();
    engine.start();

    let first = RawFrame { pixels: &pixels, width, height, channels: 1 };
    let first_results = engine.process_frame(first);
    assert_eq!(first_results[0].mode, TrackingMode::Detection);

    let shifted_pixels = rect_frame(width, height, rx + 5, ry, rw, rh);
    let second = RawFrame { pixels: &shifted_pixels, width, height, channels: 1 };
    let second_results = engine.process_frame(second);

    assert_eq!(second_results.len(), 1);
    let r = &second_results[0];
    assert_eq!(r.mode, TrackingMode::OpticalFlow);
    assert!(!r.detected, "detected must be false when mode is optical_flow");
    for (c, base) in r.corners.iter().zip(ref_corners.iter()) {
        assert!((c.x - base.x - 5.0).abs() < 4.0, "expected ~+5px x shift, got dx={}", c.x - base.x);
        assert!((c.y - base.y).abs() < 4.0);
    }
}

/// Invariant: tracking confidence is not pinned to the detection-path value —
/// it must fall as forward-backward consistency degrades. Compares the same
/// clean small shift tracked against a frame with that shift plus seeded
/// per-pixel sensor noise, which raises `mean_fb_error` without dropping
/// enough points to degrade tracking outright.
#[test]
fn degraded_fb_consistency_lowers_tracking_confidence() {
    init_logging();
    let width = 640u32;
    let height = 480u32;
    let (rx, ry, rw, rh) = (270u32, 190u32, 100u32, 100u32);
    let pixels = rect_frame(width, height, rx, ry, rw, rh);
    let (keypoints, descriptors) = extract(width, height, &pixels);
    let ref_corners = rect_corners(rx, ry, rw, rh);

    let mut clean_engine = AREngine::new(EngineConfig::default()).unwrap();
    clean_engine
        .add_target("target", keypoints.clone(), descriptors.clone(), width, height, ref_corners, Vec::new())
        .unwrap();
    clean_engine.start();
    let detect = RawFrame { pixels: &pixels, width, height, channels: 1 };
    clean_engine.process_frame(detect);

    let clean_shifted = rect_frame(width, height, rx + 4, ry, rw, rh);
    let clean_frame = RawFrame { pixels: &clean_shifted, width, height, channels: 1 };
    let clean_results = clean_engine.process_frame(clean_frame);
    assert_eq!(clean_results.len(), 1, "clean shift must keep the target tracked");
    assert_eq!(clean_results[0].mode, TrackingMode::OpticalFlow);
    let clean_confidence = clean_results[0].confidence;

    let mut noisy_engine = AREngine::new(EngineConfig::default()).unwrap();
    noisy_engine
        .add_target("target", keypoints, descriptors, width, height, ref_corners, Vec::new())
        .unwrap();
    noisy_engine.start();
    let detect2 = RawFrame { pixels: &pixels, width, height, channels: 1 };
    noisy_engine.process_frame(detect2);

    let mut noisy_shifted = rect_frame(width, height, rx + 4, ry, rw, rh);
    add_noise(&mut noisy_shifted, 7, 35);
    let noisy_frame = RawFrame { pixels: &noisy_shifted, width, height, channels: 1 };
    let noisy_results = noisy_engine.process_frame(noisy_frame);
    assert_eq!(noisy_results.len(), 1, "moderate sensor noise must not drop the target outright");
    assert_eq!(noisy_results[0].mode, TrackingMode::OpticalFlow);
    let noisy_confidence = noisy_results[0].confidence;

    assert!(
        noisy_confidence < clean_confidence,
        "noisy-frame confidence {noisy_confidence} should be lower than clean-frame confidence {clean_confidence}"
    );
}

/// Scenario 4: loss after repeated untrackable frames. Uses flat, textureless
/// frames rather than literal noise: the LK minimum-eigenvalue gate rejects
/// every point deterministically on a flat frame (zero spatial gradient),
/// which exercises the same degradation path without depending on a
/// particular noise draw.
#[test]
fn target_is_lost_after_sustained_untrackable_frames() {
    init_logging();
    let width = 320u32;
    let height = 240u32;
    let (rx, ry, rw, rh) = (110u32, 70u32, 100u32, 100u32);
    let pixels = rect_frame(width, height, rx, ry, rw, rh);
    let (keypoints, descriptors) = extract(width, height, &pixels);

    let ref_corners = rect_corners(rx, ry, rw, rh);
    let mut cfg = EngineConfig::default();
    cfg.quality_degradation_frames = 3;
    let mut engine = AREngine::new(cfg).unwrap();
    engine.add_target("target", keypoints, descriptors, width, height, ref_corners, Vec::new()).unwrap();
    engine.start();

    let detect_frame = RawFrame { pixels: &pixels, width, height, channels: 1 };
    let detect_results = engine.process_frame(detect_frame);
    assert_eq!(detect_results.len(), 1);

    let flat = vec![120u8; (width * height) as usize];
    let mut last_results = Vec::new();
    for _ in 0..4 {
        let frame = RawFrame { pixels: &flat, width, height, channels: 1 };
        last_results = engine.process_frame(frame);
    }
    assert!(last_results.is_empty(), "target should have been declared lost by the 4th untrackable frame");
}

/// Scenario 5: two distinct targets side by side, both detected in one frame.
#[test]
fn two_targets_detected_simultaneously() {
    init_logging();
    let width = 1280u32;
    let height = 480u32;
    let (ax, ay, aw, ah) = (100u32, 150u32, 120u32, 120u32);
    let (bx, by, bw, bh) = (900u32, 150u32, 120u32, 120u32);

    // Each target is registered from its own isolated reference image (just
    // its rectangle, nothing else) so its descriptors only describe its own
    // corners; the joint frame fed to `process_frame` carries both.
    let ref_a = rect_frame(width, height, ax, ay, aw, ah);
    let ref_b = rect_frame(width, height, bx, by, bw, bh);
    let (kp_a, desc_a) = extract(width, height, &ref_a);
    let (kp_b, desc_b) = extract(width, height, &ref_b);

    let mut pixels = vec![15u8; (width * height) as usize];
    for y in ay..ay + ah {
        for x in ax..ax + aw {
            pixels[(y * width + x) as usize] = 235;
        }
    }
    for y in by..by + bh {
        for x in bx..bx + bw {
            pixels[(y * width + x) as usize] = 235;
        }
    }

    let mut engine = AREngine::new(EngineConfig::default()).unwrap();
    engine.add_target("left", kp_a, desc_a, width, height, rect_corners(ax, ay, aw, ah), Vec::new()).unwrap();
    engine.add_target("right", kp_b, desc_b, width, height, rect_corners(bx, by, bw, bh), Vec::new()).unwrap();
    engine.start();

    let frame = RawFrame { pixels: &pixels, width, height, channels: 1 };
    let results = engine.process_frame(frame);

    let mut ids: Vec<&str> = results.iter().map(|r| r.target_id.as_str()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), results.len(), "target ids must be pairwise distinct");
    assert!(ids.contains(&"left"), "left target must be detected");
    assert!(ids.contains(&"right"), "right target must be detected");
}

/// Scenario 6: candidate filtering caps homography-estimation attempts.
#[cfg(debug_assertions)]
#[test]
fn homography_attempts_are_bounded_by_max_candidates() {
    init_logging();
    let width = 320u32;
    let height = 240u32;
    let (rx, ry, rw, rh) = (110u32, 70u32, 100u32, 100u32);
    let pixels = rect_frame(width, height, rx, ry, rw, rh);
    let (keypoints, descriptors) = extract(width, height, &pixels);
    let ref_corners = rect_corners(rx, ry, rw, rh);

    let mut cfg = EngineConfig::default();
    cfg.max_candidates = 5;
    let mut engine = AREngine::new(cfg).unwrap();
    for i in 0..20 {
        engine
            .add_target(format!("t{i}"), keypoints.clone(), descriptors.clone(), width, height, ref_corners, Vec::new())
            .unwrap();
    }
    engine.build_vocabulary().unwrap();
    engine
        .configure(&ConfigureOptions { candidate_count: Some(20), ..Default::default() })
        .unwrap();
    engine.start();

    let frame = RawFrame { pixels: &pixels, width, height, channels: 1 };
    let _ = engine.process_frame(frame);
    assert!(engine.homography_attempts_last_frame() <= 5);
}

/// Invariant: `reset` clears per-target tracking state (a fresh detection
/// follows, not a stale optical-flow carry-over).
#[test]
fn reset_clears_tracking_mode_back_to_detection() {
    init_logging();
    let width = 320u32;
    let height = 240u32;
    let (rx, ry, rw, rh) = (110u32, 70u32, 100u32, 100u32);
    let pixels = rect_frame(width, height, rx, ry, rw, rh);
    let (keypoints, descriptors) = extract(width, height, &pixels);
    let ref_corners = rect_corners(rx, ry, rw, rh);

    let mut engine = AREngine::new(EngineConfig::default()).unwrap();
    engine.add_target("target", keypoints, descriptors, width, height, ref_corners, Vec::new()).unwrap();
    engine.start();

    let frame1 = RawFrame { pixels: &pixels, width, height, channels: 1 };
    let r1 = engine.process_frame(frame1);
    assert_eq!(r1[0].mode, TrackingMode::Detection);

    engine.reset();

    let frame2 = RawFrame { pixels: &pixels, width, height, channels: 1 };
    let r2 = engine.process_frame(frame2);
    assert_eq!(r2.len(), 1);
    assert_eq!(r2[0].mode, TrackingMode::Detection, "post-reset frame must re-detect, not resume stale tracking");
}

/// Invariant: `stop` then `start` preserves per-target state (tracking
/// resumes rather than re-detecting from scratch).
#[test]
fn stop_then_start_preserves_tracking_state() {
    init_logging();
    let width = 320u32;
    let height = 240u32;
    let (rx, ry, rw, rh) = (110u32, 70u32, 100u32, 100u32);
    let pixels = rect_frame(width, height, rx, ry, rw, rh);
    let (keypoints, descriptors) = extract(width, height, &pixels);
    let ref_corners = rect_corners(rx, ry, rw, rh);

    let mut engine = AREngine::new(EngineConfig::default()).unwrap();
    engine.add_target("target", keypoints, descriptors, width, height, ref_corners, Vec::new()).unwrap();
    engine.start();

    let frame1 = RawFrame { pixels: &pixels, width, height, channels: 1 };
    engine.process_frame(frame1);

    engine.stop();
    let frame_while_stopped = RawFrame { pixels: &pixels, width, height, channels: 1 };
    assert!(engine.process_frame(frame_while_stopped).is_empty());

    engine.start();
    let frame2 = RawFrame { pixels: &pixels, width, height, channels: 1 };
    let results = engine.process_frame(frame2);
    assert_eq!(results.len(), 1, "tracking state must survive a stop/start cycle");
}
