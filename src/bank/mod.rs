//! Parallel sine bank
//!
//! A fixed list of sinusoidal partials processed cooperatively by several
//! real-time threads, each stealing fixed-size chunks of work and rendering
//! into its own scratch buffer.

mod buffer;
mod partial;
mod sine_bank;

pub use buffer::StereoBuffer;
pub use partial::{
    equal_power_pan_gains, generate_chord, generate_saw, make_one_pole, process_partial,
    randomize_phases, Partial,
};
pub use sine_bank::ParallelSineBank;

use std::time::Duration;

/// Maximum frames per render callback
pub const MAX_NUM_FRAMES: usize = 4096;

/// The number of partials taken at a time by processing threads.
///
/// Partials are taken in chunks for a few reasons:
///
/// - It simulates the workload of a real application, in which individual
///   tasks are not sine waves but rather heavyweight items like synthesizers
///   and audio effects.
/// - It forces worker threads to do a minimum amount of processing,
///   provoking dropouts if workers are running slow.
/// - It avoids contention on the bank's claim counter.
pub const PARTIALS_PER_PROCESSING_CHUNK: usize = 256;

/// Number of active partials at startup
pub const DEFAULT_NUM_SINES: usize = 18;

/// Amplitude smoothing time constant for every partial
pub const AMP_SMOOTHING_DURATION: Duration = Duration::from_millis(100);

/// Note numbers of the test chord
pub const CHORD_NOTE_NUMBERS: [f32; 3] = [53.0, 56.0, 60.0];

/// Low partials keep deterministic phases so the chord has a clear attack
pub const NUM_UNRANDOMIZED_PHASES: usize = 15;
