//! A single sinusoidal voice and the chord construction helpers

use super::AMP_SMOOTHING_DURATION;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::f32::consts::{FRAC_PI_4, PI};
use std::time::Duration;

const TWO_PI: f32 = PI * 2.0;

/// Amplitudes below this level are inaudible and skipped entirely
const SILENCE_THRESHOLD: f32 = 0.00001;

/// One harmonic component of a band-limited sawtooth voice.
///
/// `target_amp` toggles between 0 and `amp_when_active` as the partial is
/// deactivated/activated; `amp` chases it through a one-pole smoother so
/// activation changes never click.
#[derive(Debug, Clone, Copy, Default)]
pub struct Partial {
    pub amp_when_active: f32,
    pub target_amp: f32,
    pub amp: f32,
    pub amp_smoothing_coeff: f32,

    /// -1 (left) to +1 (right)
    pub pan: f32,

    /// Radians per sample
    pub phase_increment: f32,
    /// Radians, kept in [0, 2pi)
    pub phase: f32,
}

/// Returns equal power gains for a pan position in [-1, 1].
///
/// Introduces a 3dB dip on both channels at the central pan position.
pub fn equal_power_pan_gains(pan: f32) -> (f32, f32) {
    debug_assert!((-1.0..=1.0).contains(&pan));
    ((FRAC_PI_4 * (1.0 - pan)).sin(), (FRAC_PI_4 * (pan + 1.0)).sin())
}

/// One-pole coefficient so that
///
///   `y[n] = y[n - 1] + (x[n] - y[n - 1]) * make_one_pole(tau, fs)`
///
/// realizes a low-pass with time constant `tau` seconds at sample rate `fs`.
pub fn make_one_pole(tau: f32, fs: f32) -> f32 {
    debug_assert!(tau >= 0.0 && fs > 0.0);
    1.0 - (-1.0 / (tau * fs).max(1.0e-6)).exp()
}

#[inline]
fn lerp(a: f32, b: f32, x: f32) -> f32 {
    (1.0 - x) * a + x * b
}

/// MIDI note number to frequency, A3 = 69 = 440 Hz
pub fn note_to_frequency(note: f32) -> f32 {
    ((note - 69.0) / 12.0).exp2() * 440.0
}

/// Generate the partials of a band-limited sawtooth up to Nyquist.
pub fn generate_saw(
    sample_rate: f32,
    amp: f32,
    amp_smoothing_duration: Duration,
    pan: f32,
    frequency: f32,
) -> Vec<Partial> {
    let amp_smoothing_coeff = make_one_pole(amp_smoothing_duration.as_secs_f32(), sample_rate);
    let nyquist_frequency = sample_rate / 2.0;
    let num_harmonics = (nyquist_frequency / frequency) as usize;

    (1..=num_harmonics)
        .map(|i| {
            let partial_frequency = i as f32 * frequency;
            let samples_per_cycle = sample_rate / partial_frequency;
            Partial {
                amp_when_active: (2.0 * amp / PI)
                    * (1.0 / i as f32)
                    * (if i % 2 == 0 { 1.0 } else { -1.0 }),
                amp_smoothing_coeff,
                pan,
                phase_increment: TWO_PI / samples_per_cycle,
                ..Partial::default()
            }
        })
        .collect()
}

/// Generate a chord of detuned saw layers, sorted ascending by frequency so
/// that the active prefix of the bank is always the lowest partials.
pub fn generate_chord(sample_rate: f32, note_numbers: &[f32]) -> Vec<Partial> {
    let mut result = Vec::new();

    for &note_number in note_numbers {
        let frequency = note_to_frequency(note_number);
        let amp = 1.0 / (note_numbers.len() * 5) as f32;

        for (pan, detune) in [(-1.0, -4.0), (-1.0, -2.0), (0.0, 0.0), (1.0, 2.0), (1.0, 4.0)] {
            result.extend(generate_saw(
                sample_rate,
                amp,
                AMP_SMOOTHING_DURATION,
                pan,
                frequency + detune,
            ));
        }
    }

    result.sort_by(|a, b| a.phase_increment.total_cmp(&b.phase_increment));
    result
}

/// Spread the phases of all but the first `partials_to_skip` partials.
///
/// Randomization avoids a massive amplitude spike when many partials start
/// at phase zero; the skipped low partials keep the chord's attack.
pub fn randomize_phases(mut partials: Vec<Partial>, partials_to_skip: usize) -> Vec<Partial> {
    let mut generator = rand::rngs::StdRng::seed_from_u64(42);
    let distribution = Normal::new(0.0f32, TWO_PI).unwrap();

    let first = partials_to_skip.min(partials.len());
    for partial in &mut partials[first..] {
        partial.phase = distribution.sample(&mut generator).rem_euclid(TWO_PI);
    }
    partials
}

/// Render one partial, accumulating into the output channels.
pub fn process_partial(
    partial: &mut Partial,
    num_frames: usize,
    left: &mut [f32],
    right: &mut [f32],
) {
    if partial.target_amp.abs() <= SILENCE_THRESHOLD && partial.amp.abs() <= SILENCE_THRESHOLD {
        return;
    }

    let (gain_left, gain_right) = equal_power_pan_gains(partial.pan);
    for frame_index in 0..num_frames {
        let sample = partial.phase.sin() * partial.amp;
        left[frame_index] += sample * gain_left;
        right[frame_index] += sample * gain_right;

        partial.amp = lerp(partial.amp, partial.target_amp, partial.amp_smoothing_coeff);

        partial.phase += partial.phase_increment;
        if partial.phase >= TWO_PI {
            partial.phase -= TWO_PI;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saw_harmonics_fill_to_nyquist() {
        let partials = generate_saw(48000.0, 1.0, AMP_SMOOTHING_DURATION, 0.0, 440.0);
        assert_eq!(partials.len(), (24000.0f32 / 440.0) as usize);

        // 1/i rolloff with alternating sign
        assert!(partials[0].amp_when_active < 0.0);
        assert!(partials[1].amp_when_active > 0.0);
        assert!(partials[0].amp_when_active.abs() > partials[1].amp_when_active.abs());

        // All below Nyquist
        assert!(partials.iter().all(|p| p.phase_increment < PI));
    }

    #[test]
    fn test_chord_is_sorted_by_frequency() {
        let partials = generate_chord(48000.0, &[53.0, 56.0, 60.0]);
        assert!(!partials.is_empty());
        assert!(partials
            .windows(2)
            .all(|pair| pair[0].phase_increment <= pair[1].phase_increment));
    }

    #[test]
    fn test_randomize_phases_skips_prefix() {
        let partials = generate_chord(48000.0, &[53.0]);
        let randomized = randomize_phases(partials.clone(), 3);
        assert!(randomized[..3].iter().all(|p| p.phase == 0.0));
        assert!(randomized[3..].iter().any(|p| p.phase != 0.0));
        assert!(randomized.iter().all(|p| (0.0..TWO_PI).contains(&p.phase)));
    }

    #[test]
    fn test_pan_gains() {
        let (left, right) = equal_power_pan_gains(0.0);
        assert!((left - FRAC_PI_4.sin()).abs() < 1e-6);
        assert_eq!(left, right);

        let (left, right) = equal_power_pan_gains(-1.0);
        assert!((left - 1.0).abs() < 1e-6);
        assert!(right.abs() < 1e-6);

        let (left, right) = equal_power_pan_gains(1.0);
        assert!(left.abs() < 1e-6);
        assert!((right - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_silent_partial_is_skipped() {
        let mut partial = Partial {
            amp_when_active: 1.0,
            phase_increment: 0.1,
            ..Partial::default()
        };
        let mut left = [0.0f32; 64];
        let mut right = [0.0f32; 64];
        process_partial(&mut partial, 64, &mut left, &mut right);

        assert_eq!(partial.phase, 0.0); // skipped, not advanced
        assert!(left.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_amp_converges_monotonically() {
        let mut partial = Partial {
            amp_when_active: 1.0,
            target_amp: 1.0,
            amp_smoothing_coeff: make_one_pole(0.01, 48000.0),
            phase_increment: 0.05,
            ..Partial::default()
        };
        let mut left = [0.0f32; 256];
        let mut right = [0.0f32; 256];

        let error_before = (partial.amp - partial.target_amp).abs();
        process_partial(&mut partial, 256, &mut left, &mut right);
        let error_after = (partial.amp - partial.target_amp).abs();
        assert!(error_after <= error_before);
        assert!(partial.amp > 0.0 && partial.amp <= 1.0);
    }

    #[test]
    fn test_phase_wraps_by_single_subtraction() {
        let mut partial = Partial {
            amp_when_active: 1.0,
            target_amp: 1.0,
            amp: 1.0,
            amp_smoothing_coeff: 0.0,
            phase_increment: 1.0,
            ..Partial::default()
        };
        let mut left = [0.0f32; 1000];
        let mut right = [0.0f32; 1000];
        process_partial(&mut partial, 1000, &mut left, &mut right);
        assert!(partial.phase >= 0.0 && partial.phase < TWO_PI);
    }

    #[test]
    fn test_center_pan_writes_equal_channels() {
        let mut partial = Partial {
            amp_when_active: 1.0,
            target_amp: 1.0,
            amp: 1.0,
            amp_smoothing_coeff: 0.0,
            pan: 0.0,
            phase_increment: TWO_PI * 440.0 / 48000.0,
            ..Partial::default()
        };
        let mut left = [0.0f32; 128];
        let mut right = [0.0f32; 128];
        process_partial(&mut partial, 128, &mut left, &mut right);

        assert_eq!(left, right);
        let peak = left.iter().fold(0.0f32, |acc, x| acc.max(x.abs()));
        assert!((peak - FRAC_PI_4.sin()).abs() < 0.01);
    }
}
