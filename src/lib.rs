//! Marker-based planar target detection and optical-flow tracking core.
//!
//! [`AREngine`] is the crate's entry point: register reference targets via
//! [`AREngine::add_target`], then feed frames through [`AREngine::process_frame`].
//! Internally it alternates between full detection (BRISK-style feature
//! extraction, vocabulary-tree candidate ranking, descriptor matching, RANSAC
//! homography estimation) and pyramidal Lucas-Kanade optical-flow tracking,
//! per the detection-interval/optical-flow configuration in [`EngineConfig`].

pub mod config;
pub mod database;
pub mod detector;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod pool;
pub mod stats;
pub mod tracker;
pub mod types;

pub use config::{ConfigureOptions, EngineConfig};
pub use engine::AREngine;
pub use error::{Error, Result};
pub use pool::MemoryInfo;
pub use stats::StatsSnapshot;
pub use types::{
    BowHistogram, Corners, Descriptor, GrayView, Keypoint, RawFrame, Target, TrackingMode,
    TrackingResult, DESCRIPTOR_BYTES,
};
