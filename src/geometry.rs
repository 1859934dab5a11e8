//! Shared 2-D geometry: homography estimation (normalized DLT + RANSAC),
//! projection, and the quadrilateral-validity check used by both the
//! detector and the tracker.
//!
//! Per the spec's numerics note, all geometry here runs in 64-bit float to
//! keep RANSAC residual accumulation and the homography decomposition away
//! from degeneracy near the boundary; callers round to `f32` at the edges.

use nalgebra::{DMatrix, Matrix3, Point2, SymmetricEigen, Vector3};
use rand::Rng;

/// A 2-D point in frame pixel coordinates.
pub type Pt = Point2<f64>;

/// Solve for the homography mapping `src[i] -> dst[i]` via the normalized
/// Direct Linear Transform. Requires at least 4 correspondences; with
/// exactly 4 non-degenerate points the fit is exact, with more it is a
/// least-squares fit.
pub fn solve_homography_dlt(src: &[Pt], dst: &[Pt]) -> Option<Matrix3<f64>> {
    let n = src.len();
    if n < 4 || dst.len() != n {
        return None;
    }

    let (src_n, t_src) = normalize_points(src)?;
    let (dst_n, t_dst) = normalize_points(dst)?;

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for i in 0..n {
        let (x, y) = (src_n[i].x, src_n[i].y);
        let (u, v) = (dst_n[i].x, dst_n[i].y);
        let row0 = [-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u];
        let row1 = [0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v];
        for c in 0..9 {
            a[(2 * i, c)] = row0[c];
            a[(2 * i + 1, c)] = row1[c];
        }
    }

    let ata = a.transpose() * &a;
    let eig = SymmetricEigen::new(ata);

    let mut min_idx = 0;
    let mut min_val = eig.eigenvalues[0];
    for i in 1..9 {
        if eig.eigenvalues[i] < min_val {
            min_val = eig.eigenvalues[i];
            min_idx = i;
        }
    }
    let h_vec = eig.eigenvectors.column(min_idx);
    let h_norm = Matrix3::new(
        h_vec[0], h_vec[1], h_vec[2], h_vec[3], h_vec[4], h_vec[5], h_vec[6], h_vec[7], h_vec[8],
    );

    let t_dst_inv = t_dst.try_inverse()?;
    let h = t_dst_inv * h_norm * t_src;
    let scale = h[(2, 2)];
    if scale.abs() < 1e-12 || !scale.is_finite() {
        return None;
    }
    let h = h / scale;
    if h.iter().any(|v| !v.is_finite()) {
        None
    } else {
        Some(h)
    }
}

/// Isotropic normalization: translate to centroid, scale so the mean
/// distance from the centroid is `sqrt(2)`. Returns the normalized points
/// and the 3x3 transform `T` such that `p_norm = T * [p; 1]`.
fn normalize_points(pts: &[Pt]) -> Option<(Vec<Pt>, Matrix3<f64>)> {
    let n = pts.len();
    if n == 0 {
        return None;
    }
    let n_f = n as f64;
    let cx = pts.iter().map(|p| p.x).sum::<f64>() / n_f;
    let cy = pts.iter().map(|p| p.y).sum::<f64>() / n_f;
    let mean_dist = pts
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n_f;
    let scale = if mean_dist > 1e-9 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let t = Matrix3::new(
        scale, 0.0, -scale * cx,
        0.0, scale, -scale * cy,
        0.0, 0.0, 1.0,
    );
    let normed = pts
        .iter()
        .map(|p| Pt::new(scale * (p.x - cx), scale * (p.y - cy)))
        .collect();
    Some((normed, t))
}

/// Project a point through a homography. Returns `None` if the point maps
/// to (near-)infinity.
pub fn apply_homography(h: &Matrix3<f64>, p: Pt) -> Option<Pt> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    if v.z.abs() < 1e-12 || !v.z.is_finite() {
        return None;
    }
    Some(Pt::new(v.x / v.z, v.y / v.z))
}

/// Robust homography estimate via RANSAC with adaptive iteration count.
/// Returns the refit homography (from all inliers) and the inlier mask,
/// or `None` if fewer than 4 correspondences are given or no 4-point
/// sample ever produced a usable model.
pub fn ransac_homography(
    src: &[Pt],
    dst: &[Pt],
    threshold: f64,
    max_iterations: usize,
    confidence: f64,
    rng: &mut impl Rng,
) -> Option<(Matrix3<f64>, Vec<bool>)> {
    let n = src.len();
    if n < 4 || dst.len() != n || max_iterations == 0 {
        return None;
    }

    let mut best_inliers = vec![false; n];
    let mut best_count = 0usize;
    let mut iterations_needed = max_iterations;
    let mut iter = 0usize;

    while iter < iterations_needed.min(max_iterations) {
        iter += 1;
        let sample = sample_distinct(rng, n, 4);
        let sample_src: Vec<Pt> = sample.iter().map(|&i| src[i]).collect();
        let sample_dst: Vec<Pt> = sample.iter().map(|&i| dst[i]).collect();
        let Some(h) = solve_homography_dlt(&sample_src, &sample_dst) else {
            continue;
        };

        let mut inliers = vec![false; n];
        let mut count = 0usize;
        for i in 0..n {
            if let Some(proj) = apply_homography(&h, src[i]) {
                if (proj - dst[i]).norm() <= threshold {
                    inliers[i] = true;
                    count += 1;
                }
            }
        }

        if count > best_count {
            best_count = count;
            best_inliers = inliers;

            let w = count as f64 / n as f64;
            let denom = (1.0 - w.powi(4)).max(1e-12).ln();
            if denom < 0.0 {
                let needed = ((1.0 - confidence).max(1e-12).ln() / denom).ceil();
                if needed.is_finite() && needed >= 1.0 {
                    iterations_needed = iterations_needed.min(needed as usize).max(1);
                }
            }
        }
    }

    if best_count < 4 {
        return None;
    }

    let inlier_src: Vec<Pt> = (0..n).filter(|&i| best_inliers[i]).map(|i| src[i]).collect();
    let inlier_dst: Vec<Pt> = (0..n).filter(|&i| best_inliers[i]).map(|i| dst[i]).collect();
    let h_final = solve_homography_dlt(&inlier_src, &inlier_dst)?;
    Some((h_final, best_inliers))
}

fn sample_distinct(rng: &mut impl Rng, n: usize, k: usize) -> Vec<usize> {
    let mut idxs = Vec::with_capacity(k);
    while idxs.len() < k {
        let c = rng.gen_range(0..n);
        if !idxs.contains(&c) {
            idxs.push(c);
        }
    }
    idxs
}

/// Result of checking a projected quadrilateral for validity.
#[derive(Debug, Clone, Copy)]
pub struct QuadValidity {
    pub valid: bool,
    pub area: f64,
    /// In `[0, 1]`: how comfortably the quad sits inside the validity
    /// bounds, used as the geometric term of the confidence score.
    pub geom_score: f64,
}

/// Check the determinant of the top-left 2x2 submatrix of a homography
/// against the configured scale-change bound.
pub fn homography_scale_valid(h: &Matrix3<f64>, max_scale_change: f64) -> bool {
    let det = h[(0, 0)] * h[(1, 1)] - h[(0, 1)] * h[(1, 0)];
    if det <= 0.0 || !det.is_finite() {
        return false;
    }
    let lo = 1.0 / (max_scale_change * max_scale_change);
    let hi = max_scale_change * max_scale_change;
    det >= lo && det <= hi
}

/// Validate a projected quadrilateral: simple, convex, consistently wound,
/// interior angles and area within configured bounds, and aspect ratio
/// change vs. the reference bounded.
pub fn validate_quad(
    corners: &[Pt; 4],
    reference_corners: &[Pt; 4],
    min_corner_angle_deg: f64,
    max_corner_angle_deg: f64,
    max_aspect_ratio_change: f64,
    min_area_threshold: f64,
) -> QuadValidity {
    if corners.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return QuadValidity { valid: false, area: 0.0, geom_score: 0.0 };
    }

    let area = polygon_area(corners);
    if !convex_and_consistently_wound(corners) {
        return QuadValidity { valid: false, area, geom_score: 0.0 };
    }

    let angles = interior_angles_deg(corners);
    let angle_mid = (min_corner_angle_deg + max_corner_angle_deg) / 2.0;
    let angle_half_range = (max_corner_angle_deg - min_corner_angle_deg) / 2.0;
    let mut angle_margin = 1.0f64;
    for &a in &angles {
        if a < min_corner_angle_deg || a > max_corner_angle_deg {
            return QuadValidity { valid: false, area, geom_score: 0.0 };
        }
        let m = 1.0 - ((a - angle_mid).abs() / angle_half_range).min(1.0);
        angle_margin = angle_margin.min(m);
    }

    if area < min_area_threshold {
        return QuadValidity { valid: false, area, geom_score: 0.0 };
    }
    let area_margin = (area / (min_area_threshold * 4.0)).min(1.0);

    let ref_ar = aspect_ratio(reference_corners);
    let proj_ar = aspect_ratio(corners);
    let change = if ref_ar > 0.0 && proj_ar > 0.0 {
        (proj_ar / ref_ar).max(ref_ar / proj_ar)
    } else {
        f64::INFINITY
    };
    if change > max_aspect_ratio_change {
        return QuadValidity { valid: false, area, geom_score: 0.0 };
    }
    let aspect_margin = if max_aspect_ratio_change > 1.0 {
        (1.0 - (change - 1.0) / (max_aspect_ratio_change - 1.0)).clamp(0.0, 1.0)
    } else {
        1.0
    };

    let geom_score = (angle_margin * area_margin * aspect_margin).clamp(0.0, 1.0);
    QuadValidity { valid: true, area, geom_score }
}

fn polygon_area(corners: &[Pt; 4]) -> f64 {
    let mut sum = 0.0;
    for i in 0..4 {
        let p0 = corners[i];
        let p1 = corners[(i + 1) % 4];
        sum += p0.x * p1.y - p1.x * p0.y;
    }
    (sum / 2.0).abs()
}

fn convex_and_consistently_wound(corners: &[Pt; 4]) -> bool {
    let mut sign = 0i32;
    for i in 0..4 {
        let a = corners[i];
        let b = corners[(i + 1) % 4];
        let c = corners[(i + 2) % 4];
        let e1 = b - a;
        let e2 = c - b;
        let cross = e1.x * e2.y - e1.y * e2.x;
        if cross.abs() < 1e-9 {
            return false;
        }
        let s = if cross > 0.0 { 1 } else { -1 };
        if sign == 0 {
            sign = s;
        } else if sign != s {
            return false;
        }
    }
    true
}

fn interior_angles_deg(corners: &[Pt; 4]) -> [f64; 4] {
    let mut angles = [0.0; 4];
    for i in 0..4 {
        let prev = corners[(i + 3) % 4];
        let cur = corners[i];
        let next = corners[(i + 1) % 4];
        let v1 = prev - cur;
        let v2 = next - cur;
        let n1 = v1.norm();
        let n2 = v2.norm();
        let cos_a = if n1 > 1e-12 && n2 > 1e-12 {
            (v1.dot(&v2) / (n1 * n2)).clamp(-1.0, 1.0)
        } else {
            1.0
        };
        angles[i] = cos_a.acos().to_degrees();
    }
    angles
}

fn aspect_ratio(corners: &[Pt; 4]) -> f64 {
    let w = (corners[1] - corners[0]).norm();
    let h = (corners[3] - corners[0]).norm();
    if h > 1e-9 {
        w / h
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rect(x: f64, y: f64, w: f64, h: f64) -> [Pt; 4] {
        [
            Pt::new(x, y),
            Pt::new(x + w, y),
            Pt::new(x + w, y + h),
            Pt::new(x, y + h),
        ]
    }

    #[test]
    fn dlt_recovers_pure_translation() {
        let src = vec![Pt::new(0.0, 0.0), Pt::new(10.0, 0.0), Pt::new(10.0, 10.0), Pt::new(0.0, 10.0)];
        let dst: Vec<Pt> = src.iter().map(|p| Pt::new(p.x + 5.0, p.y + 3.0)).collect();
        let h = solve_homography_dlt(&src, &dst).expect("homography");
        let proj = apply_homography(&h, Pt::new(2.0, 2.0)).unwrap();
        assert!((proj.x - 7.0).abs() < 1e-6);
        assert!((proj.y - 5.0).abs() < 1e-6);
    }

    #[test]
    fn dlt_recovers_scale() {
        let src = vec![Pt::new(0.0, 0.0), Pt::new(10.0, 0.0), Pt::new(10.0, 10.0), Pt::new(0.0, 10.0)];
        let dst: Vec<Pt> = src.iter().map(|p| Pt::new(p.x * 2.0, p.y * 2.0)).collect();
        let h = solve_homography_dlt(&src, &dst).expect("homography");
        let proj = apply_homography(&h, Pt::new(3.0, 4.0)).unwrap();
        assert!((proj.x - 6.0).abs() < 1e-6);
        assert!((proj.y - 8.0).abs() < 1e-6);
    }

    #[test]
    fn ransac_rejects_outliers() {
        let mut rng = StdRng::seed_from_u64(42);
        let src: Vec<Pt> = (0..20)
            .map(|i| Pt::new((i * 7) as f64 % 50.0, (i * 11) as f64 % 50.0))
            .collect();
        let mut dst: Vec<Pt> = src.iter().map(|p| Pt::new(p.x + 5.0, p.y + 2.0)).collect();
        // corrupt a few correspondences
        dst[0] = Pt::new(999.0, -999.0);
        dst[1] = Pt::new(-500.0, 500.0);

        let (h, inliers) = ransac_homography(&src, &dst, 1.0, 500, 0.995, &mut rng).unwrap();
        assert!(!inliers[0]);
        assert!(!inliers[1]);
        assert!(inliers.iter().filter(|&&b| b).count() >= 16);
        let proj = apply_homography(&h, Pt::new(20.0, 20.0)).unwrap();
        assert!((proj.x - 25.0).abs() < 1.0);
        assert!((proj.y - 22.0).abs() < 1.0);
    }

    #[test]
    fn valid_rectangle_passes() {
        let corners = rect(100.0, 100.0, 80.0, 60.0);
        let v = validate_quad(&corners, &corners, 20.0, 160.0, 2.0, 100.0);
        assert!(v.valid);
        assert!((v.area - 4800.0).abs() < 1e-6);
        assert!(v.geom_score > 0.0);
    }

    #[test]
    fn degenerate_quad_rejected() {
        // Collinear points: zero area, not convex.
        let corners = [Pt::new(0.0, 0.0), Pt::new(10.0, 0.0), Pt::new(20.0, 0.0), Pt::new(30.0, 0.0)];
        let v = validate_quad(&corners, &corners, 20.0, 160.0, 2.0, 1.0);
        assert!(!v.valid);
    }

    #[test]
    fn self_intersecting_quad_rejected() {
        // Bowtie: corners ordered so edges cross.
        let corners = [Pt::new(0.0, 0.0), Pt::new(10.0, 10.0), Pt::new(10.0, 0.0), Pt::new(0.0, 10.0)];
        let reference = rect(0.0, 0.0, 10.0, 10.0);
        let v = validate_quad(&corners, &reference, 20.0, 160.0, 2.0, 1.0);
        assert!(!v.valid);
    }

    #[test]
    fn extreme_aspect_ratio_change_rejected() {
        let reference = rect(0.0, 0.0, 100.0, 100.0);
        // stretched 10x in x only
        let corners = rect(0.0, 0.0, 1000.0, 100.0);
        let v = validate_quad(&corners, &reference, 20.0, 160.0, 2.0, 1.0);
        assert!(!v.valid);
    }

    #[test]
    fn homography_scale_bound() {
        let identity = Matrix3::<f64>::identity();
        assert!(homography_scale_valid(&identity, 4.0));

        let huge_scale = Matrix3::new(100.0, 0.0, 0.0, 0.0, 100.0, 0.0, 0.0, 0.0, 1.0);
        assert!(!homography_scale_valid(&huge_scale, 4.0));
    }
}
