//! Engine-wide constants and the performance configuration presets

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cache line size used to pad the SPSC queue indices. 128 bytes covers the
/// larger line of current Apple Silicon.
pub const CACHE_LINE_SIZE: usize = 128;

/// Default render buffer size requested from the device
pub const DEFAULT_PREFERRED_BUFFER_SIZE: usize = 128;

/// Computation quantum reported to the time-constraint policy
pub const REALTIME_THREAD_QUANTUM: Duration = Duration::from_micros(500);

/// Worker threads created by a freshly constructed host
pub const DEFAULT_NUM_WORKER_THREADS: usize = 1;

// Busy thread settings are tuned to ramp up CPUs without exceeding the
// background CPU usage limit.
pub const DEFAULT_BUSY_THREAD_PERIOD: Duration = Duration::from_millis(35);
pub const DEFAULT_BUSY_THREAD_CPU_USAGE: f64 = 0.5;

/// Capacity of the measurement ring between the audio and UI threads
pub const DRIVE_MEASUREMENT_QUEUE_SIZE: u32 = 1024;

/// Capacity of the volume fade command ring
pub const FADE_COMMAND_QUEUE_SIZE: u32 = 16;

/// Busy thread pool settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BusyThreadsConfig {
    pub num_threads: usize,
    pub period: Duration,
    pub cpu_usage: f64,
}

/// Audio host scheduling settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioHostConfig {
    pub num_processing_threads: usize,
    pub process_in_driver_thread: bool,
    pub is_work_interval_on: bool,
    pub minimum_load: f64,
}

/// The full performance-relevant configuration of the engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub busy_threads: BusyThreadsConfig,
    pub audio_host: AudioHostConfig,
}

/// The app's default configuration
pub const STANDARD_PERFORMANCE_CONFIG: PerformanceConfig = PerformanceConfig {
    busy_threads: BusyThreadsConfig {
        num_threads: 0,
        period: DEFAULT_BUSY_THREAD_PERIOD,
        cpu_usage: DEFAULT_BUSY_THREAD_CPU_USAGE,
    },
    audio_host: AudioHostConfig {
        num_processing_threads: 2,
        process_in_driver_thread: true,
        is_work_interval_on: true,
        minimum_load: 0.0,
    },
};

/// The configuration that measured best against throttling and dropouts
pub const OPTIMAL_PERFORMANCE_CONFIG: PerformanceConfig = PerformanceConfig {
    busy_threads: BusyThreadsConfig {
        num_threads: 1,
        period: DEFAULT_BUSY_THREAD_PERIOD,
        cpu_usage: DEFAULT_BUSY_THREAD_CPU_USAGE,
    },
    audio_host: AudioHostConfig {
        num_processing_threads: 2,
        process_in_driver_thread: false,
        is_work_interval_on: false,
        minimum_load: 0.0,
    },
};

/// Named presets for the performance configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preset {
    Standard,
    Optimal,
    Custom,
}

impl Preset {
    /// The preset a configuration corresponds to, by full equality
    pub fn matching(config: &PerformanceConfig) -> Self {
        if *config == STANDARD_PERFORMANCE_CONFIG {
            Preset::Standard
        } else if *config == OPTIMAL_PERFORMANCE_CONFIG {
            Preset::Optimal
        } else {
            Preset::Custom
        }
    }

    /// The configuration for a named preset; Custom has none
    pub fn config(&self) -> Option<PerformanceConfig> {
        match self {
            Preset::Standard => Some(STANDARD_PERFORMANCE_CONFIG),
            Preset::Optimal => Some(OPTIMAL_PERFORMANCE_CONFIG),
            Preset::Custom => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Preset::Standard => "Standard",
            Preset::Optimal => "Optimal",
            Preset::Custom => "Custom",
        }
    }
}
