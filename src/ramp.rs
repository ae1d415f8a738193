//! Linear value ramps and the output volume fader

use crate::vdsp::VDsp;

/// Scalar types a [`RampedValue`] can interpolate.
pub trait RampScalar:
    Copy
    + PartialEq
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::ops::Mul<Output = Self>
    + std::ops::Div<Output = Self>
{
    const ZERO: Self;
    fn from_ticks(ticks: u64) -> Self;
}

impl RampScalar for f32 {
    const ZERO: Self = 0.0;
    fn from_ticks(ticks: u64) -> Self {
        ticks as f32
    }
}

impl RampScalar for f64 {
    const ZERO: Self = 0.0;
    fn from_ticks(ticks: u64) -> Self {
        ticks as f64
    }
}

/// A linear ramped value.
///
/// The value ramps linearly to the target so that when ramping from x to y
/// over N ticks, the first value of the ramp is x and the Nth is y.
///
/// Note: `RampedValue<f32>` is precise up to durations of around 2 minutes.
/// For longer durations the ramp may finish slightly early.
#[derive(Debug, Clone)]
pub struct RampedValue<T> {
    current: T,
    target: T,
    increment: T,
    ticks_to_completion: u64,
}

impl<T: RampScalar> RampedValue<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: value,
            target: value,
            increment: T::ZERO,
            ticks_to_completion: 0,
        }
    }

    /// Set the current value and disable any ramping
    pub fn set_value(&mut self, value: T) {
        self.current = value;
        self.target = value;
        self.ticks_to_completion = 0;
    }

    /// Start a linear ramp towards the target value over the specified number
    /// of ticks
    pub fn ramp_to(&mut self, target: T, ticks_to_completion: u64) {
        self.target = target;

        if ticks_to_completion <= 1 || self.target == self.current {
            self.current = target;
            self.ticks_to_completion = 0;
        } else {
            self.ticks_to_completion = ticks_to_completion - 1;
            self.increment =
                (self.target - self.current) / T::from_ticks(self.ticks_to_completion);
        }
    }

    /// True if the value is currently ramping
    pub fn is_ramping(&self) -> bool {
        self.ticks_to_completion > 0
    }

    pub fn value(&self) -> T {
        self.current
    }

    pub fn target_value(&self) -> T {
        self.target
    }

    /// Return the next value in the ramp
    pub fn tick(&mut self) -> T {
        let result = self.current;

        if self.ticks_to_completion > 0 {
            self.ticks_to_completion -= 1;
            // Counting down from the target avoids accumulating rounding
            // error in the final value.
            self.current =
                self.target - T::from_ticks(self.ticks_to_completion) * self.increment;
        } else {
            self.current = self.target;
        }

        result
    }
}

/// Fades the stereo output buffer towards a target volume.
///
/// Fade commands arrive on the audio thread through the driver's command
/// queue; `process` is called once per buffer after rendering.
#[derive(Debug, Clone)]
pub struct VolumeFader {
    ramp: RampedValue<f32>,
}

impl VolumeFader {
    pub fn new() -> Self {
        Self {
            ramp: RampedValue::new(1.0),
        }
    }

    pub fn fade_to(&mut self, amp: f32, num_frames: u64) {
        self.ramp.ramp_to(amp, num_frames);
    }

    pub fn value(&self) -> f32 {
        self.ramp.value()
    }

    pub fn process(&mut self, left: &mut [f32], right: &mut [f32], num_frames: usize) {
        let num_frames = num_frames.min(left.len()).min(right.len());
        if self.ramp.is_ramping() {
            for i in 0..num_frames {
                let amp = self.ramp.tick();
                left[i] *= amp;
                right[i] *= amp;
            }
        } else if self.ramp.value() != 1.0 {
            VDsp::apply_gain(&mut left[..num_frames], self.ramp.value());
            VDsp::apply_gain(&mut right[..num_frames], self.ramp.value());
        }
    }
}

impl Default for VolumeFader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramp_reaches_target_exactly() {
        let mut ramp = RampedValue::new(0.0f32);
        ramp.ramp_to(1.0, 100);

        let mut last = -1.0;
        for _ in 0..100 {
            let value = ramp.tick();
            assert!(value > last);
            last = value;
        }
        assert_eq!(ramp.value(), 1.0);
        assert!(!ramp.is_ramping());
    }

    #[test]
    fn test_ramp_endpoints() {
        let mut ramp = RampedValue::new(2.0f64);
        ramp.ramp_to(6.0, 5);
        let values: Vec<f64> = (0..5).map(|_| ramp.tick()).collect();
        assert_eq!(values[0], 2.0);
        assert_eq!(values[4], 6.0);
    }

    #[test]
    fn test_set_value_cancels_ramp() {
        let mut ramp = RampedValue::new(0.0f32);
        ramp.ramp_to(1.0, 1000);
        ramp.tick();
        ramp.set_value(0.25);
        assert!(!ramp.is_ramping());
        assert_eq!(ramp.value(), 0.25);
        assert_eq!(ramp.target_value(), 0.25);
    }

    #[test]
    fn test_short_ramp_jumps_to_target() {
        let mut ramp = RampedValue::new(0.0f32);
        ramp.ramp_to(1.0, 1);
        assert!(!ramp.is_ramping());
        assert_eq!(ramp.value(), 1.0);
    }

    #[test]
    fn test_fader_ramps_buffer_to_silence() {
        let mut fader = VolumeFader::new();
        fader.fade_to(0.0, 64);

        let mut left = vec![1.0f32; 64];
        let mut right = vec![1.0f32; 64];
        fader.process(&mut left, &mut right, 64);

        assert_eq!(left[0], 1.0); // first ramp value is the start value
        for i in 1..64 {
            assert!(left[i] < left[i - 1]);
            assert_eq!(left[i], right[i]);
        }
        assert_eq!(fader.value(), 0.0);

        // A subsequent buffer is fully silenced
        let mut left = vec![1.0f32; 16];
        let mut right = vec![1.0f32; 16];
        fader.process(&mut left, &mut right, 16);
        assert!(left.iter().chain(right.iter()).all(|&x| x == 0.0));
    }

    #[test]
    fn test_fader_at_unity_leaves_buffer_untouched() {
        let mut fader = VolumeFader::new();
        let mut left = vec![0.5f32; 8];
        let mut right = vec![0.5f32; 8];
        fader.process(&mut left, &mut right, 8);
        assert!(left.iter().chain(right.iter()).all(|&x| x == 0.5));
    }
}
