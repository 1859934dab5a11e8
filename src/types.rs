//! Shared data types: the frame/keypoint/descriptor/target data model from
//! the specification's data model section, plus the wire-level tracking
//! result.

use nalgebra::Point2;

use crate::error::{Error, Result};

/// BRISK descriptor width: 512 bits.
pub const DESCRIPTOR_BYTES: usize = 64;

/// A fixed-length binary descriptor. Hamming distance is the metric.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Default for Descriptor {
    fn default() -> Self {
        Self::zero()
    }
}

impl Descriptor {
    pub fn zero() -> Self {
        Self([0u8; DESCRIPTOR_BYTES])
    }

    /// Build a descriptor from a byte slice of exactly `DESCRIPTOR_BYTES`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != DESCRIPTOR_BYTES {
            return None;
        }
        let mut buf = [0u8; DESCRIPTOR_BYTES];
        buf.copy_from_slice(bytes);
        Some(Self(buf))
    }

    /// Hamming distance to another descriptor, in bits.
    pub fn hamming(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Descriptor({} bytes)", self.0.len())
    }
}

/// A detected or reference keypoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub scale: f32,
    /// Orientation in radians.
    pub orientation: f32,
    pub response: f32,
}

/// Four image-plane corners, in a fixed winding order (matches the order
/// the reference corners of a [`Target`] were supplied in).
pub type Corners = [Point2<f32>; 4];

/// Bag-of-words histogram over vocabulary-tree leaves. Dense: at the
/// spec's default branching factor/depth (10^2 = 100 leaves) a sparse
/// representation buys nothing.
pub type BowHistogram = Vec<f32>;

/// A reference target stored in the [`crate::database::TargetDatabase`].
/// Immutable once added; destroyed on `remove`/`clear`.
#[derive(Debug, Clone)]
pub struct Target {
    pub id: String,
    pub ref_width: u32,
    pub ref_height: u32,
    /// Corners of the target in its own reference image, typically an
    /// axis-aligned rectangle: [top-left, top-right, bottom-right, bottom-left].
    pub ref_corners: Corners,
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
    /// `None` until `build_vocabulary` has run.
    pub histogram: Option<BowHistogram>,
    pub metadata: Vec<u8>,
}

impl Target {
    pub fn descriptor_count(&self) -> usize {
        self.descriptors.len()
    }
}

/// How a [`TrackingResult`] was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingMode {
    Detection,
    OpticalFlow,
}

impl std::fmt::Display for TrackingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TrackingMode::Detection => "detection",
            TrackingMode::OpticalFlow => "optical_flow",
        })
    }
}

/// One target's result for one processed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingResult {
    pub target_id: String,
    pub detected: bool,
    pub corners: Corners,
    pub confidence: f32,
    pub mode: TrackingMode,
}

impl TrackingResult {
    /// Flatten corners to the wire order `[x0,y0,x1,y1,x2,y2,x3,y3]`.
    pub fn corners_flat(&self) -> [f32; 8] {
        let mut out = [0.0; 8];
        for i in 0..4 {
            out[2 * i] = self.corners[i].x;
            out[2 * i + 1] = self.corners[i].y;
        }
        out
    }
}

/// A borrowed, not-yet-validated input frame as handed to `process_frame`.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl<'a> RawFrame<'a> {
    /// Check the pixel buffer against the declared dimensions, per the
    /// pixel buffer convention: tightly packed, row-major, 1 or 4 channels.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidFrame(
                "width and height must be positive".into(),
            ));
        }
        if self.channels != 1 && self.channels != 4 {
            return Err(Error::InvalidFrame(format!(
                "unsupported channel count: {}",
                self.channels
            )));
        }
        let expected = self.width as usize * self.height as usize * self.channels as usize;
        if self.pixels.len() != expected {
            return Err(Error::InvalidFrame(format!(
                "pixel buffer length {} does not match {}x{}x{}",
                self.pixels.len(),
                self.width,
                self.height,
                self.channels
            )));
        }
        Ok(())
    }

    /// Convert to a single-channel grayscale buffer, applying the standard
    /// luminance weights when the source is RGBA. Caller supplies `out` so
    /// the buffer can come from the memory pool.
    pub fn write_grayscale_into(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.width as usize * self.height as usize);
        if self.channels == 1 {
            out.copy_from_slice(self.pixels);
            return;
        }
        for (px, dst) in self.pixels.chunks_exact(4).zip(out.iter_mut()) {
            let r = px[0] as f32;
            let g = px[1] as f32;
            let b = px[2] as f32;
            let y = 0.299 * r + 0.587 * g + 0.114 * b;
            *dst = y.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// A validated, already-grayscale image view used internally by the
/// detector and tracker. Borrowed; never retained past one call.
#[derive(Debug, Clone, Copy)]
pub struct GrayView<'a> {
    pub width: u32,
    pub height: u32,
    pub pixels: &'a [u8],
}

impl<'a> GrayView<'a> {
    /// Bounds-checked pixel read; out-of-bounds reads return 0 so callers
    /// (pyramid construction, gradient estimation) don't need to special
    /// case image edges.
    #[inline]
    pub fn get(&self, x: i32, y: i32) -> u8 {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return 0;
        }
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    /// Bilinearly-interpolated intensity at a sub-pixel position.
    pub fn sample_bilinear(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let x0 = x0 as i32;
        let y0 = y0 as i32;
        let p00 = self.get(x0, y0) as f32;
        let p10 = self.get(x0 + 1, y0) as f32;
        let p01 = self.get(x0, y0 + 1) as f32;
        let p11 = self.get(x0 + 1, y0 + 1) as f32;
        p00 * (1.0 - fx) * (1.0 - fy)
            + p10 * fx * (1.0 - fy)
            + p01 * (1.0 - fx) * fy
            + p11 * fx * fy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hamming_distance_identical_is_zero() {
        let a = Descriptor::from_bytes(&[0xAAu8; DESCRIPTOR_BYTES]).unwrap();
        assert_eq!(a.hamming(&a), 0);
    }

    #[test]
    fn hamming_distance_counts_bits() {
        let a = Descriptor::zero();
        let mut bytes = [0u8; DESCRIPTOR_BYTES];
        bytes[0] = 0b0000_0111; // 3 bits set
        let b = Descriptor::from_bytes(&bytes).unwrap();
        assert_eq!(a.hamming(&b), 3);
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        assert!(Descriptor::from_bytes(&[0u8; 10]).is_none());
    }

    #[test]
    fn raw_frame_rejects_length_mismatch() {
        let frame = RawFrame {
            pixels: &[0u8; 10],
            width: 4,
            height: 4,
            channels: 1,
        };
        assert!(matches!(frame.validate(), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn raw_frame_accepts_matching_grayscale() {
        let frame = RawFrame {
            pixels: &[0u8; 16],
            width: 4,
            height: 4,
            channels: 1,
        };
        assert!(frame.validate().is_ok());
    }

    #[test]
    fn grayscale_conversion_is_identity_for_single_channel() {
        let pixels = [10u8, 20, 30, 40];
        let frame = RawFrame { pixels: &pixels, width: 2, height: 2, channels: 1 };
        let mut out = [0u8; 4];
        frame.write_grayscale_into(&mut out);
        assert_eq!(out, pixels);
    }

    #[test]
    fn grayscale_conversion_applies_luminance_weights() {
        let pixels = [255u8, 255, 255, 255]; // one white RGBA pixel
        let frame = RawFrame { pixels: &pixels, width: 1, height: 1, channels: 4 };
        let mut out = [0u8; 1];
        frame.write_grayscale_into(&mut out);
        assert_eq!(out[0], 255);
    }

    #[test]
    fn corners_flat_preserves_order() {
        let result = TrackingResult {
            target_id: "t".into(),
            detected: true,
            corners: [
                Point2::new(1.0, 2.0),
                Point2::new(3.0, 4.0),
                Point2::new(5.0, 6.0),
                Point2::new(7.0, 8.0),
            ],
            confidence: 0.5,
            mode: TrackingMode::Detection,
        };
        assert_eq!(result.corners_flat(), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    }
}
