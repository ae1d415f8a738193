//! Sinedrive - Real-time audio scheduling and parallel synthesis core
//!
//! An experimental test bench for splitting a pro-audio workload across
//! multiple real-time threads without provoking CPU throttling or missed
//! buffer deadlines. The audio host fans per-buffer work out to a pool of
//! time-constraint worker threads; the sine bank distributes partials among
//! them through a single atomic claim counter; busy threads, workgroup
//! membership, and a minimum-load floor keep the performance controller
//! from parking the audio threads on slow cores.

mod bank;
mod busy;
mod config;
mod driver;
mod engine;
mod host;
mod measurement;
mod ramp;
mod spsc;
mod sync;
mod thread_policy;
mod vdsp;
mod workgroup;

pub use bank::{
    equal_power_pan_gains, generate_chord, generate_saw, make_one_pole, process_partial,
    randomize_phases, ParallelSineBank, Partial, StereoBuffer, AMP_SMOOTHING_DURATION,
    CHORD_NOTE_NUMBERS, DEFAULT_NUM_SINES, MAX_NUM_FRAMES, NUM_UNRANDOMIZED_PHASES,
    PARTIALS_PER_PROCESSING_CHUNK,
};
pub use busy::{BusyThread, BusyThreads};
pub use config::{
    AudioHostConfig, BusyThreadsConfig, PerformanceConfig, Preset,
    DEFAULT_BUSY_THREAD_CPU_USAGE, DEFAULT_BUSY_THREAD_PERIOD, DEFAULT_PREFERRED_BUFFER_SIZE,
    OPTIMAL_PERFORMANCE_CONFIG, STANDARD_PERFORMANCE_CONFIG,
};
pub use driver::{
    Driver, DriverBackendKind, DriverConfig, DriverStatus, RenderArgs, RenderCallback,
};
pub use engine::Engine;
pub use host::{AudioHost, HostClient};
pub use measurement::{DriveMeasurement, MAX_NUM_THREADS};
pub use ramp::{RampScalar, RampedValue, VolumeFader};
pub use spsc::FixedSpscQueue;
pub use sync::Semaphore;
pub use thread_policy::{
    cpu_number, hardware_delay, low_energy_work, low_energy_work_until, num_physical_cpus,
    set_current_thread_name, set_time_constraint_policy, TimeConstraintPolicy,
};
pub use workgroup::{ScopedMembership, SomeAudioWorkgroup};
