//! Per-buffer drive measurements, ferried from the audio thread to the UI

use serde::{Deserialize, Serialize};

/// Hard upper bound on the number of processing threads (workers plus the
/// driver thread's slot)
pub const MAX_NUM_THREADS: usize = 8;

/// One render callback's worth of measurements.
///
/// Produced on the audio thread, pushed through a bounded SPSC ring, and
/// drained at display rate. When the ring is full the newest record is
/// dropped silently; the next buffer obsoletes it anyway. Thread slots that
/// were not used this buffer hold -1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DriveMeasurement {
    /// Buffer presentation time in seconds
    pub host_time: f64,
    /// Wall time spent in the render callback, in seconds
    pub duration: f64,
    /// Actual frames rendered
    pub num_frames: i32,
    /// Per-thread CPU number at the end of its work
    pub cpu_numbers: [i32; MAX_NUM_THREADS],
    /// Per-thread count of active partials processed
    pub num_active_partials_processed: [i32; MAX_NUM_THREADS],
    /// Peak absolute sample of the input buffer
    pub input_peak_level: f32,
}

impl Default for DriveMeasurement {
    fn default() -> Self {
        Self {
            host_time: 0.0,
            duration: 0.0,
            num_frames: 0,
            cpu_numbers: [-1; MAX_NUM_THREADS],
            num_active_partials_processed: [-1; MAX_NUM_THREADS],
            input_peak_level: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_marks_all_threads_unused() {
        let measurement = DriveMeasurement::default();
        assert!(measurement.cpu_numbers.iter().all(|&n| n == -1));
        assert!(measurement
            .num_active_partials_processed
            .iter()
            .all(|&n| n == -1));
    }

    #[test]
    fn test_serializes_for_the_ui_boundary() {
        let json = serde_json::to_string(&DriveMeasurement::default()).unwrap();
        let measurement: DriveMeasurement = serde_json::from_str(&json).unwrap();
        assert_eq!(measurement.num_frames, 0);
        assert_eq!(measurement.cpu_numbers[7], -1);
    }
}
