//! Per-thread stereo scratch buffer

use super::MAX_NUM_FRAMES;
use crate::vdsp::VDsp;

/// A stereo buffer of fixed capacity.
///
/// Each processing thread owns one and accumulates its share of the bank
/// into it; the driver thread sums them after the fan-in point.
pub struct StereoBuffer {
    left: Box<[f32; MAX_NUM_FRAMES]>,
    right: Box<[f32; MAX_NUM_FRAMES]>,
}

impl StereoBuffer {
    pub fn new() -> Self {
        Self {
            left: Box::new([0.0; MAX_NUM_FRAMES]),
            right: Box::new([0.0; MAX_NUM_FRAMES]),
        }
    }

    /// Zero the first `frames` samples of both channels
    pub fn clear(&mut self, frames: usize) {
        let frames = frames.min(MAX_NUM_FRAMES);
        VDsp::clear(&mut self.left[..frames]);
        VDsp::clear(&mut self.right[..frames]);
    }

    pub fn left(&self) -> &[f32] {
        &self.left[..]
    }

    pub fn right(&self) -> &[f32] {
        &self.right[..]
    }

    /// Both channels, mutably
    pub fn channels_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.left[..], &mut self.right[..])
    }
}

impl Default for StereoBuffer {
    fn default() -> Self {
        Self::new()
    }
}
