//! Optical-flow tracker: pyramidal Lucas-Kanade forward/backward tracking
//! with forward-backward-error rejection, homography re-estimation,
//! Kalman-smoothed corners, and periodic spatial-grid feature re-seeding.

pub mod kalman;

use nalgebra::{Matrix2, Matrix3, Point2, Vector2};
use rand::Rng;

use crate::config::EngineConfig;
use crate::detector::{estimate_homography, validate_homography, FeatureDetector};
use crate::geometry::Pt;
use crate::types::{Corners, GrayView, Keypoint};
use kalman::CornerKalman;

/// A point currently being tracked: its position in the current frame and
/// the reference keypoint it was seeded from (used to re-estimate the
/// homography against the target's reference corners).
#[derive(Debug, Clone, Copy)]
pub struct TrackedPoint {
    pub frame_pos: Point2<f32>,
    pub ref_pos: Point2<f32>,
}

/// Outcome of one tracking step for a single target.
pub enum TrackStep {
    /// Enough points survived and the re-estimated homography validated:
    /// new corners (post-Kalman), surviving tracked points, inlier ratio,
    /// and mean forward-backward error among survivors.
    Tracking {
        corners: Corners,
        points: Vec<TrackedPoint>,
        inlier_ratio: f32,
        mean_fb_error: f32,
        geom_score: f64,
        h: Matrix3<f64>,
    },
    /// Survivors were too few or the homography didn't validate; caller
    /// should bump the degradation counter but keep prior corners.
    Degraded,
}

/// Build a grayscale image pyramid, `levels` deep, each half the
/// resolution of the one above (box-filtered downsample).
fn build_pyramid(img: &GrayView, levels: u32) -> Vec<(u32, u32, Vec<u8>)> {
    let mut pyramid = vec![(img.width, img.height, img.pixels.to_vec())];
    for _ in 1..levels {
        let (w, h, px) = pyramid.last().unwrap();
        if *w < 8 || *h < 8 {
            break;
        }
        let view = GrayView { width: *w, height: *h, pixels: px };
        let nw = (*w / 2).max(1);
        let nh = (*h / 2).max(1);
        let mut out = vec![0u8; (nw * nh) as usize];
        for y in 0..nh {
            for x in 0..nw {
                let sx = (x * 2) as i32;
                let sy = (y * 2) as i32;
                let sum = view.get(sx, sy) as u32 + view.get(sx + 1, sy) as u32 + view.get(sx, sy + 1) as u32 + view.get(sx + 1, sy + 1) as u32;
                out[(y * nw + x) as usize] = (sum / 4) as u8;
            }
        }
        pyramid.push((nw, nh, out));
    }
    pyramid
}

fn pyramid_view(level: &(u32, u32, Vec<u8>)) -> GrayView<'_> {
    GrayView { width: level.0, height: level.1, pixels: &level.2 }
}

/// Single-level Lucas-Kanade refinement of one point's flow, via the
/// Lucas-Kanade normal equations over a `window x window` patch.
fn lk_refine_point(
    prev: &GrayView,
    next: &GrayView,
    start: Point2<f32>,
    guess: Point2<f32>,
    window: i32,
    max_iters: u32,
    epsilon: f32,
    min_eigenvalue: f32,
) -> Option<Point2<f32>> {
    let half = window / 2;
    let mut gxx = 0.0f32;
    let mut gxy = 0.0f32;
    let mut gyy = 0.0f32;
    let mut grads = Vec::with_capacity((window * window) as usize);
    for dy in -half..=half {
        for dx in -half..=half {
            let x = start.x + dx as f32;
            let y = start.y + dy as f32;
            let ix = (prev.sample_bilinear(x + 1.0, y) - prev.sample_bilinear(x - 1.0, y)) * 0.5;
            let iy = (prev.sample_bilinear(x, y + 1.0) - prev.sample_bilinear(x, y - 1.0)) * 0.5;
            gxx += ix * ix;
            gxy += ix * iy;
            gyy += iy * iy;
            grads.push((x, y, ix, iy, prev.sample_bilinear(x, y)));
        }
    }

    let g = Matrix2::new(gxx, gxy, gxy, gyy);
    let eigen = nalgebra::SymmetricEigen::new(g);
    let min_eig = eigen.eigenvalues.min();
    if min_eig < min_eigenvalue {
        return None;
    }
    let Some(g_inv) = g.try_inverse() else {
        return None;
    };

    let mut flow = Vector2::new(guess.x - start.x, guess.y - start.y);
    for _ in 0..max_iters {
        let mut bx = 0.0f32;
        let mut by = 0.0f32;
        for &(x, y, ix, iy, i0) in &grads {
            let i1 = next.sample_bilinear(x + flow.x, y + flow.y);
            let dt = i0 - i1;
            bx += ix * dt;
            by += iy * dt;
        }
        let delta = g_inv * Vector2::new(bx, by);
        flow += delta;
        if delta.norm() < epsilon {
            break;
        }
    }

    Some(Point2::new(start.x + flow.x, start.y + flow.y))
}

/// Pyramidal LK: coarse-to-fine refinement, the coarsest level's flow
/// seeding the next level's initial guess.
fn pyramidal_lk(
    prev_pyr: &[(u32, u32, Vec<u8>)],
    next_pyr: &[(u32, u32, Vec<u8>)],
    point: Point2<f32>,
    cfg: &EngineConfig,
) -> Option<Point2<f32>> {
    let levels = prev_pyr.len().min(next_pyr.len());
    let mut guess = point;
    for level in (0..levels).rev() {
        let scale = 2f32.powi(level as i32);
        let prev_view = pyramid_view(&prev_pyr[level]);
        let next_view = pyramid_view(&next_pyr[level]);
        let level_point = Point2::new(point.x / scale, point.y / scale);
        let level_guess = Point2::new(guess.x / scale, guess.y / scale);
        let refined = lk_refine_point(
            &prev_view,
            &next_view,
            level_point,
            level_guess,
            cfg.lk_window_size as i32,
            cfg.lk_term_max_iterations,
            cfg.lk_term_epsilon,
            cfg.lk_min_eigenvalue,
        )?;
        guess = Point2::new(refined.x * scale, refined.y * scale);
    }
    Some(guess)
}

/// Run one tracking step for a target: forward LK, backward LK, FB-error
/// and flow-magnitude rejection, homography re-estimation and validation,
/// Kalman smoothing.
#[allow(clippy::too_many_arguments)]
pub fn track_step(
    prev_frame: &GrayView,
    cur_frame: &GrayView,
    points: &[TrackedPoint],
    reference_corners: &Corners,
    kalman: &mut [CornerKalman; 4],
    cfg: &EngineConfig,
    rng: &mut impl Rng,
) -> TrackStep {
    let prev_pyr = build_pyramid(prev_frame, cfg.lk_pyramid_levels);
    let cur_pyr = build_pyramid(cur_frame, cfg.lk_pyramid_levels);

    let inlier_count_hint = points.len();
    let adaptive_fb_threshold = adaptive_fb_threshold(inlier_count_hint, cfg);

    let mut survivors: Vec<TrackedPoint> = Vec::with_capacity(points.len());
    let mut fb_errors: Vec<f32> = Vec::with_capacity(points.len());

    for p in points {
        let Some(forward) = pyramidal_lk(&prev_pyr, &cur_pyr, p.frame_pos, p.frame_pos, cfg) else {
            continue;
        };
        let Some(backward) = pyramidal_lk(&cur_pyr, &prev_pyr, forward, forward, cfg) else {
            continue;
        };

        let fb_error = (backward - p.frame_pos).norm();
        if fb_error > adaptive_fb_threshold {
            continue;
        }
        let flow_magnitude = (forward - p.frame_pos).norm();
        if flow_magnitude > cfg.max_flow_magnitude {
            continue;
        }

        survivors.push(TrackedPoint { frame_pos: forward, ref_pos: p.ref_pos });
        fb_errors.push(fb_error);
    }

    if survivors.len() < cfg.min_tracking_points {
        log::debug!(
            "tracking degraded: {} survivors < min_tracking_points {}",
            survivors.len(),
            cfg.min_tracking_points
        );
        return TrackStep::Degraded;
    }

    let src: Vec<Pt> = survivors.iter().map(|p| Pt::new(p.ref_pos.x as f64, p.ref_pos.y as f64)).collect();
    let dst: Vec<Pt> = survivors.iter().map(|p| Pt::new(p.frame_pos.x as f64, p.frame_pos.y as f64)).collect();

    let Some(estimate) = estimate_homography(&src, &dst, cfg, rng) else {
        return TrackStep::Degraded;
    };
    let Some(validated) = validate_homography(&estimate.h, reference_corners, cfg) else {
        return TrackStep::Degraded;
    };

    let mut smoothed: Corners = validated.projected_corners;
    for i in 0..4 {
        let (x, y) = kalman[i].step(validated.projected_corners[i].x, validated.projected_corners[i].y);
        smoothed[i] = Point2::new(x, y);
    }

    let inlier_ratio = estimate.inlier_count as f32 / survivors.len() as f32;
    let mean_fb_error = if fb_errors.is_empty() {
        0.0
    } else {
        fb_errors.iter().sum::<f32>() / fb_errors.len() as f32
    };

    TrackStep::Tracking {
        corners: smoothed,
        points: survivors,
        inlier_ratio,
        mean_fb_error,
        geom_score: validated.geom_score,
        h: validated.h,
    }
}

fn adaptive_fb_threshold(current_inlier_count: usize, cfg: &EngineConfig) -> f32 {
    if current_inlier_count >= cfg.max_tracking_points / 2 {
        cfg.fb_error_threshold_max
    } else {
        cfg.fb_error_threshold_base
    }
}

/// Re-seed tracked points: run the detector over the current quadrilateral,
/// keep the strongest keypoint per cell of a `spatial_grid_size x
/// spatial_grid_size` grid over the quad's bounding box, up to
/// `max_tracking_points`. Re-seeded points carry no known reference
/// position other than their own (current) location, so they are paired
/// 1:1 with themselves as both `frame_pos` and `ref_pos`-less seeds — the
/// caller re-anchors `ref_pos` via the homography that produced `corners`.
pub fn reseed_points(
    detector: &dyn FeatureDetector,
    frame: &GrayView,
    corners: &Corners,
    cfg: &EngineConfig,
) -> Vec<Keypoint> {
    let min_x = corners.iter().map(|p| p.x).fold(f32::MAX, f32::min).max(0.0);
    let max_x = corners.iter().map(|p| p.x).fold(f32::MIN, f32::max).min(frame.width as f32);
    let min_y = corners.iter().map(|p| p.y).fold(f32::MAX, f32::min).max(0.0);
    let max_y = corners.iter().map(|p| p.y).fold(f32::MIN, f32::max).min(frame.height as f32);
    if max_x <= min_x || max_y <= min_y {
        return Vec::new();
    }

    let (keypoints, _) = detector.extract(frame, cfg.max_features);
    let grid = cfg.spatial_grid_size.max(1) as f32;
    let cell_w = (max_x - min_x) / grid;
    let cell_h = (max_y - min_y) / grid;

    let mut best_per_cell: std::collections::HashMap<(u32, u32), Keypoint> = std::collections::HashMap::new();
    for kp in keypoints {
        if kp.x < min_x || kp.x > max_x || kp.y < min_y || kp.y > max_y {
            continue;
        }
        let cx = (((kp.x - min_x) / cell_w).floor() as u32).min(cfg.spatial_grid_size - 1);
        let cy = (((kp.y - min_y) / cell_h).floor() as u32).min(cfg.spatial_grid_size - 1);
        best_per_cell
            .entry((cx, cy))
            .and_modify(|existing| {
                if kp.response > existing.response {
                    *existing = kp;
                }
            })
            .or_insert(kp);
    }

    let mut out: Vec<Keypoint> = best_per_cell.into_values().collect();
    out.sort_by(|a, b| b.response.partial_cmp(&a.response).unwrap_or(std::cmp::Ordering::Equal));
    out.truncate(cfg.max_tracking_points);
    out
}
