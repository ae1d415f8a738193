//! Bank-level synthesis scenarios: known partial configurations rendered
//! through the public bank API.

use sinedrive_lib::{ParallelSineBank, Partial};
use std::f32::consts::PI;

const TWO_PI: f32 = PI * 2.0;

fn instant_partial(pan: f32, phase_increment: f32) -> Partial {
    Partial {
        amp_when_active: 1.0,
        amp: 1.0,
        // No smoothing: the amplitude tracks the target exactly
        amp_smoothing_coeff: 0.0,
        pan,
        phase_increment,
        ..Partial::default()
    }
}

#[test]
fn test_single_partial_center_pan() {
    let bank = ParallelSineBank::new();
    bank.set_num_threads(1);

    let mut partial = instant_partial(0.0, TWO_PI * 440.0 / 48000.0);
    // Start silent with near-instant smoothing, as the scenario prescribes
    partial.amp = 0.0;
    partial.amp_smoothing_coeff = 1.0;
    bank.set_partials(vec![partial]);

    bank.prepare(1, 128);
    assert_eq!(bank.process(0, 128), 1);

    let mut left = vec![0.0f32; 128];
    let mut right = vec![0.0f32; 128];
    bank.mix_to(&mut left, &mut right, 128);

    assert_eq!(left, right);

    // Equal-power center pan loses 3dB: peak ~ sin(pi/4)
    let peak = left.iter().fold(0.0f32, |acc, x| acc.max(x.abs()));
    assert!((peak - std::f32::consts::FRAC_PI_4.sin()).abs() < 0.01);

    // The smoothing converged within the buffer
    assert!((bank.partial(0).amp - 1.0).abs() < 1.0e-3);
}

#[test]
fn test_pan_extremes_separate_channels() {
    let bank = ParallelSineBank::new();
    bank.set_num_threads(1);

    let omega_left = 0.05;
    let omega_right = 0.11;
    bank.set_partials(vec![
        instant_partial(-1.0, omega_left),
        instant_partial(1.0, omega_right),
    ]);

    bank.prepare(2, 64);
    bank.process(0, 64);

    let mut left = vec![0.0f32; 64];
    let mut right = vec![0.0f32; 64];
    bank.mix_to(&mut left, &mut right, 64);

    // Each channel carries only its side's partial, scaled by sin(pi/2) = 1
    for i in 0..64 {
        let expected_left = (omega_left * i as f32).sin();
        let expected_right = (omega_right * i as f32).sin();
        assert!((left[i] - expected_left).abs() < 1.0e-4, "frame {}", i);
        assert!((right[i] - expected_right).abs() < 1.0e-4, "frame {}", i);
    }
}

#[test]
fn test_deactivated_partials_decay_instead_of_clicking() {
    let bank = ParallelSineBank::new();
    bank.set_num_threads(1);

    let mut partial = instant_partial(0.0, 0.03);
    partial.amp_smoothing_coeff = 0.2;
    bank.set_partials(vec![partial]);

    // One buffer active, then deactivate
    bank.prepare(1, 64);
    bank.process(0, 64);
    assert_eq!(bank.partial(0).target_amp, 1.0);

    bank.prepare(0, 64);
    bank.process(0, 64);
    let after = bank.partial(0);
    assert_eq!(after.target_amp, 0.0);
    // The amplitude decays towards zero but is still rendering the tail
    assert!(after.amp < 1.0 && after.amp > 0.0);
}
