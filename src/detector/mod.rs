//! Feature detector: BRISK-style multi-scale binary feature extraction,
//! brute-force ratio-test matching, and RANSAC homography estimation with
//! geometric validation.
//!
//! `FeatureDetector` is a seam (per the design notes' "polymorphism over
//! detector variants") so the coordinator and tracker aren't hard-wired to
//! one concrete extractor; [`BriskDetector`] is the only implementation.

use nalgebra::{Matrix3, Point2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::EngineConfig;
use crate::geometry::{apply_homography, homography_scale_valid, ransac_homography, validate_quad, Pt};
use crate::types::{Corners, Descriptor, GrayView, Keypoint, DESCRIPTOR_BYTES};

/// Capability set a feature extractor must provide.
pub trait FeatureDetector {
    /// Extract up to `max_features` keypoints/descriptors from a grayscale
    /// frame, strongest response first.
    fn extract(&self, frame: &GrayView, max_features: usize) -> (Vec<Keypoint>, Vec<Descriptor>);
    fn descriptor_size(&self) -> usize;
    fn distance(&self, a: &Descriptor, b: &Descriptor) -> u32;
}

const FAST_CIRCLE: [(i32, i32); 16] = [
    (0, -3), (1, -3), (2, -2), (3, -1),
    (3, 0), (3, 1), (2, 2), (1, 3),
    (0, 3), (-1, 3), (-2, 2), (-3, 1),
    (-3, 0), (-3, -1), (-2, -2), (-1, -3),
];

const FAST_ARC_LENGTH: usize = 9;
const SAMPLING_PATTERN_SEED: u64 = 0x4252_4953_4B30; // "BRISK0", arbitrary fixed constant

struct OwnedGray {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl OwnedGray {
    fn view(&self) -> GrayView<'_> {
        GrayView { width: self.width, height: self.height, pixels: &self.pixels }
    }
}

/// BRISK-style detector/descriptor: FAST-derived multi-scale keypoints,
/// pairwise-intensity-comparison binary descriptors over a fixed,
/// deterministically generated sampling pattern.
pub struct BriskDetector {
    fast_threshold: u8,
    num_octaves: u32,
    pattern_scale: f32,
    pattern: Vec<(f32, f32, f32, f32)>,
}

impl BriskDetector {
    pub fn new(fast_threshold: u8, num_octaves: u32, pattern_scale: f32) -> Self {
        Self {
            fast_threshold,
            num_octaves: num_octaves.max(1),
            pattern_scale,
            pattern: build_sampling_pattern(DESCRIPTOR_BYTES * 8, SAMPLING_PATTERN_SEED),
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(cfg.fast_threshold, cfg.num_octaves, cfg.pattern_scale)
    }

    fn compute_descriptor(&self, img: &GrayView, kp: &Keypoint) -> Descriptor {
        let radius = 12.0 * kp.scale * self.pattern_scale;
        let (sin_a, cos_a) = kp.orientation.sin_cos();
        let mut bytes = [0u8; DESCRIPTOR_BYTES];
        for (i, &(dx1, dy1, dx2, dy2)) in self.pattern.iter().enumerate() {
            let (rx1, ry1) = rotate(dx1 * radius, dy1 * radius, sin_a, cos_a);
            let (rx2, ry2) = rotate(dx2 * radius, dy2 * radius, sin_a, cos_a);
            let i1 = img.sample_bilinear(kp.x + rx1, kp.y + ry1);
            let i2 = img.sample_bilinear(kp.x + rx2, kp.y + ry2);
            if i1 < i2 {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        Descriptor(bytes)
    }
}

impl FeatureDetector for BriskDetector {
    fn extract(&self, frame: &GrayView, max_features: usize) -> (Vec<Keypoint>, Vec<Descriptor>) {
        let mut all_kp: Vec<Keypoint> = Vec::new();
        let mut owned = OwnedGray { width: frame.width, height: frame.height, pixels: frame.pixels.to_vec() };
        let mut scale = 1.0f32;

        for octave in 0..self.num_octaves {
            let view = owned.view();
            let border = 10i32;
            if (view.width as i32) < 2 * border || (view.height as i32) < 2 * border {
                break;
            }

            let mut candidates = Vec::new();
            for y in border..(view.height as i32 - border) {
                for x in border..(view.width as i32 - border) {
                    if let Some(r) = fast_corner_response(&view, x, y, self.fast_threshold) {
                        candidates.push((x, y, r));
                    }
                }
            }
            let accepted = non_max_suppress(candidates, 4, max_features.max(1));
            for (x, y, r) in accepted {
                let orientation = compute_orientation(&view, x, y, 7);
                all_kp.push(Keypoint {
                    x: x as f32 * scale,
                    y: y as f32 * scale,
                    scale,
                    orientation,
                    response: r,
                });
            }

            if octave + 1 < self.num_octaves {
                let (width, height, pixels) = downsample(&view);
                if width < 2 * 10 as u32 || height < 2 * 10 as u32 {
                    break;
                }
                owned = OwnedGray { width, height, pixels };
                scale *= 2.0;
            }
        }

        all_kp.sort_by(|a, b| {
            b.response
                .partial_cmp(&a.response)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.y.partial_cmp(&b.y).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.x.partial_cmp(&b.x).unwrap_or(std::cmp::Ordering::Equal))
        });
        all_kp.truncate(max_features);

        let descriptors: Vec<Descriptor> = all_kp.iter().map(|kp| self.compute_descriptor(frame, kp)).collect();
        (all_kp, descriptors)
    }

    fn descriptor_size(&self) -> usize {
        DESCRIPTOR_BYTES
    }

    fn distance(&self, a: &Descriptor, b: &Descriptor) -> u32 {
        a.hamming(b)
    }
}

fn rotate(x: f32, y: f32, sin_a: f32, cos_a: f32) -> (f32, f32) {
    (x * cos_a - y * sin_a, x * sin_a + y * cos_a)
}

fn build_sampling_pattern(n: usize, seed: u64) -> Vec<(f32, f32, f32, f32)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let (x1, y1) = random_unit_disk_point(&mut rng);
            let (x2, y2) = random_unit_disk_point(&mut rng);
            (x1, y1, x2, y2)
        })
        .collect()
}

fn random_unit_disk_point(rng: &mut StdRng) -> (f32, f32) {
    loop {
        let x = rng.gen_range(-1.0f32..1.0);
        let y = rng.gen_range(-1.0f32..1.0);
        if x * x + y * y <= 1.0 {
            return (x, y);
        }
    }
}

fn downsample(img: &GrayView) -> (u32, u32, Vec<u8>) {
    let w = (img.width / 2).max(1);
    let h = (img.height / 2).max(1);
    let mut out = vec![0u8; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            let sx = (x * 2) as i32;
            let sy = (y * 2) as i32;
            let sum = img.get(sx, sy) as u32 + img.get(sx + 1, sy) as u32 + img.get(sx, sy + 1) as u32 + img.get(sx + 1, sy + 1) as u32;
            out[(y * w + x) as usize] = (sum / 4) as u8;
        }
    }
    (w, h, out)
}

/// FAST-9 circular-arc corner test. Returns the summed absolute intensity
/// difference over the qualifying arc as the response strength, or `None`
/// if no arc of `FAST_ARC_LENGTH` contiguous brighter/darker points exists.
fn fast_corner_response(img: &GrayView, x: i32, y: i32, threshold: u8) -> Option<f32> {
    let c = img.get(x, y) as i32;
    let t = threshold as i32;
    let mut signs = [0i8; 16];
    for (i, &(dx, dy)) in FAST_CIRCLE.iter().enumerate() {
        let p = img.get(x + dx, y + dy) as i32;
        signs[i] = if p > c + t {
            1
        } else if p < c - t {
            -1
        } else {
            0
        };
    }

    let mut best_len = 0usize;
    let mut cur_len = 0usize;
    let mut cur_sign = 0i8;
    for &s in signs.iter().chain(signs.iter()) {
        if s != 0 && s == cur_sign {
            cur_len += 1;
        } else if s != 0 {
            cur_sign = s;
            cur_len = 1;
        } else {
            cur_sign = 0;
            cur_len = 0;
        }
        best_len = best_len.max(cur_len);
    }

    if best_len >= FAST_ARC_LENGTH {
        let response: i32 = FAST_CIRCLE.iter().map(|&(dx, dy)| (img.get(x + dx, y + dy) as i32 - c).abs()).sum();
        Some(response as f32)
    } else {
        None
    }
}

/// Intensity-centroid orientation, as used by ORB/BRISK-family descriptors.
fn compute_orientation(img: &GrayView, cx: i32, cy: i32, patch_radius: i32) -> f32 {
    let mut m01 = 0f32;
    let mut m10 = 0f32;
    let r2 = (patch_radius * patch_radius) as f32;
    for dy in -patch_radius..=patch_radius {
        for dx in -patch_radius..=patch_radius {
            if (dx * dx + dy * dy) as f32 > r2 {
                continue;
            }
            let i = img.get(cx + dx, cy + dy) as f32;
            m10 += dx as f32 * i;
            m01 += dy as f32 * i;
        }
    }
    m01.atan2(m10)
}

fn non_max_suppress(mut candidates: Vec<(i32, i32, f32)>, radius: i32, keep: usize) -> Vec<(i32, i32, f32)> {
    candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
    candidates.truncate(keep.max(1) * 4);
    let mut accepted: Vec<(i32, i32, f32)> = Vec::new();
    'outer: for c in candidates {
        for a in &accepted {
            if (c.0 - a.0).abs() <= radius && (c.1 - a.1).abs() <= radius {
                continue 'outer;
            }
        }
        accepted.push(c);
        if accepted.len() >= keep {
            break;
        }
    }
    accepted
}

/// One accepted match between a query (frame) descriptor and a train
/// (target) descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Correspondence {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: u32,
}

/// Brute-force 2-NN Hamming matching with Lowe's ratio test. Fails soft:
/// an empty input set yields an empty correspondence list.
pub fn match_descriptors(query: &[Descriptor], train: &[Descriptor], ratio_threshold: f32) -> Vec<Correspondence> {
    if query.is_empty() || train.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::new();
    for (qi, q) in query.iter().enumerate() {
        let mut best: Option<(usize, u32)> = None;
        let mut second: Option<u32> = None;
        for (ti, t) in train.iter().enumerate() {
            let d = q.hamming(t);
            match best {
                None => best = Some((ti, d)),
                Some((_, bd)) if d < bd => {
                    second = Some(bd);
                    best = Some((ti, d));
                }
                Some(_) => {
                    if second.is_none_or(|sd| d < sd) {
                        second = Some(d);
                    }
                }
            }
        }
        match (best, second) {
            (Some((ti, d1)), Some(d2)) if d2 > 0 => {
                if (d1 as f32) / (d2 as f32) < ratio_threshold {
                    out.push(Correspondence { query_idx: qi, train_idx: ti, distance: d1 });
                }
            }
            (Some((ti, d1)), Some(0)) => {
                if d1 == 0 {
                    out.push(Correspondence { query_idx: qi, train_idx: ti, distance: d1 });
                }
            }
            (Some((ti, d1)), None) => {
                // Only one train descriptor total: ratio test doesn't apply.
                out.push(Correspondence { query_idx: qi, train_idx: ti, distance: d1 });
            }
            _ => {}
        }
    }
    out
}

/// RANSAC homography estimate with its inlier mask.
pub struct HomographyEstimate {
    pub h: Matrix3<f64>,
    pub inlier_mask: Vec<bool>,
    pub inlier_count: usize,
}

/// Estimate a homography from matched point correspondences. Returns
/// `None` on fewer than 4 correspondences or too few inliers.
pub fn estimate_homography(
    src_points: &[Pt],
    dst_points: &[Pt],
    cfg: &EngineConfig,
    rng: &mut impl Rng,
) -> Option<HomographyEstimate> {
    if src_points.len() < 4 || src_points.len() != dst_points.len() {
        return None;
    }
    let (h, mask) = ransac_homography(
        src_points,
        dst_points,
        cfg.ransac_threshold,
        cfg.ransac_iterations,
        cfg.ransac_confidence,
        rng,
    )?;
    let inlier_count = mask.iter().filter(|&&b| b).count();
    if inlier_count < cfg.min_matches_for_homography {
        return None;
    }
    Some(HomographyEstimate { h, inlier_mask: mask, inlier_count })
}

/// A homography that has passed the full validity check (§4.3), with the
/// projected reference corners and the geometric confidence term.
pub struct ValidatedHomography {
    pub h: Matrix3<f64>,
    pub projected_corners: Corners,
    pub geom_score: f64,
}

/// Apply the homography validity check: scale bound, simple/convex/wound
/// projected quad, interior angle bounds, aspect-ratio bound, area bound.
pub fn validate_homography(h: &Matrix3<f64>, reference_corners: &Corners, cfg: &EngineConfig) -> Option<ValidatedHomography> {
    if !homography_scale_valid(h, cfg.max_scale_change) {
        return None;
    }
    let reference64: [Pt; 4] = reference_corners.map(|p| Pt::new(p.x as f64, p.y as f64));
    let mut projected64 = [Pt::new(0.0, 0.0); 4];
    for i in 0..4 {
        projected64[i] = apply_homography(h, reference64[i])?;
    }

    let validity = validate_quad(
        &projected64,
        &reference64,
        cfg.min_corner_angle_deg,
        cfg.max_corner_angle_deg,
        cfg.max_aspect_ratio_change,
        cfg.min_area_threshold,
    );
    if !validity.valid {
        return None;
    }

    let projected_corners: Corners = projected64.map(|p| Point2::new(p.x as f32, p.y as f32));
    Some(ValidatedHomography { h: *h, projected_corners, geom_score: validity.geom_score })
}

/// Confidence = weighted sum of inlier ratio, forward-backward consistency
/// (fixed at 1.0 for pure detection), and geometric validity score.
pub fn confidence_score(inlier_ratio: f32, fb_term: f32, geom_score: f32, cfg: &EngineConfig) -> f32 {
    (cfg.weight_ratio * inlier_ratio + cfg.weight_fb * fb_term + cfg.weight_geom * geom_score).clamp(0.0, 1.0)
}
