//! Engine
//!
//! The embedding API consumed by the application shell. Owns the audio host,
//! the sine bank, the busy thread pool, and the measurement ring, and maps
//! the UI-facing knobs onto them.

use crate::bank::{
    generate_chord, randomize_phases, ParallelSineBank, CHORD_NOTE_NUMBERS, DEFAULT_NUM_SINES,
    MAX_NUM_FRAMES, NUM_UNRANDOMIZED_PHASES,
};
use crate::busy::BusyThreads;
use crate::config::{PerformanceConfig, Preset, DRIVE_MEASUREMENT_QUEUE_SIZE};
use crate::driver::{DriverConfig, DriverStatus};
use crate::host::{AudioHost, HostClient};
use crate::measurement::{DriveMeasurement, MAX_NUM_THREADS};
use crate::spsc::FixedSpscQueue;
use crate::thread_policy::cpu_number;
use crate::vdsp::VDsp;
use atomic_float::AtomicF32;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Engine state shared with the real-time threads.
///
/// Implements the host's per-buffer hooks: peak metering and bank
/// preparation at buffer start, partial processing on every processing
/// thread, mixing and measurement at buffer end.
struct EngineCore {
    bank: ParallelSineBank,
    /// Audio thread -> UI thread
    measurements: FixedSpscQueue<DriveMeasurement>,

    num_sines: AtomicUsize,
    /// Extra sines staged by play_sine_burst, applied while the sample
    /// countdown is positive
    burst_additional_sines: AtomicUsize,
    burst_samples_remaining: AtomicI64,

    // Per-slot attribution for the work-distribution view; reset to -1 each
    // buffer, written by whichever thread processes the slot
    cpu_numbers: [AtomicI32; MAX_NUM_THREADS],
    num_active_partials_processed: [AtomicI32; MAX_NUM_THREADS],

    input_peak_level: AtomicF32,
    buffer_start_nanos: AtomicU64,
    epoch: Instant,
}

impl EngineCore {
    fn new() -> Self {
        Self {
            bank: ParallelSineBank::new(),
            measurements: FixedSpscQueue::new(DRIVE_MEASUREMENT_QUEUE_SIZE),
            num_sines: AtomicUsize::new(DEFAULT_NUM_SINES),
            burst_additional_sines: AtomicUsize::new(0),
            burst_samples_remaining: AtomicI64::new(0),
            cpu_numbers: Default::default(),
            num_active_partials_processed: Default::default(),
            input_peak_level: AtomicF32::new(0.0),
            buffer_start_nanos: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    fn effective_num_sines(&self, num_frames: usize) -> usize {
        let mut num_sines = self.num_sines.load(Ordering::Acquire);

        let remaining = self.burst_samples_remaining.load(Ordering::Acquire);
        if remaining > 0 {
            num_sines += self.burst_additional_sines.load(Ordering::Acquire);
            self.burst_samples_remaining
                .store(remaining - num_frames as i64, Ordering::Release);
        }

        num_sines.min(self.bank.num_partials())
    }
}

impl HostClient for EngineCore {
    fn setup(&self, num_worker_threads: usize) {
        // Slot 0 belongs to the driver thread
        self.bank.set_num_threads(num_worker_threads + 1);
    }

    fn render_started(&self, left: &mut [f32], right: &mut [f32], num_frames: usize) {
        self.buffer_start_nanos
            .store(self.epoch.elapsed().as_nanos() as u64, Ordering::Release);

        let input_peak =
            VDsp::peak(&left[..num_frames]).max(VDsp::peak(&right[..num_frames]));
        self.input_peak_level.store(input_peak, Ordering::Release);

        for slot in 0..MAX_NUM_THREADS {
            self.cpu_numbers[slot].store(-1, Ordering::Release);
            self.num_active_partials_processed[slot].store(-1, Ordering::Release);
        }

        self.bank
            .prepare(self.effective_num_sines(num_frames), num_frames);
    }

    fn process(&self, thread_index: usize, num_frames: usize) {
        let num_processed = self.bank.process(thread_index, num_frames);
        if thread_index < MAX_NUM_THREADS {
            self.num_active_partials_processed[thread_index]
                .store(num_processed as i32, Ordering::Release);
            self.cpu_numbers[thread_index].store(cpu_number(), Ordering::Release);
        }
    }

    fn render_ended(&self, left: &mut [f32], right: &mut [f32], host_time: f64, num_frames: usize) {
        VDsp::clear(&mut left[..num_frames]);
        VDsp::clear(&mut right[..num_frames]);
        self.bank.mix_to(left, right, num_frames);

        let mut measurement = DriveMeasurement {
            host_time,
            duration: (self.epoch.elapsed().as_nanos() as u64)
                .saturating_sub(self.buffer_start_nanos.load(Ordering::Acquire))
                as f64
                * 1.0e-9,
            num_frames: num_frames as i32,
            input_peak_level: self.input_peak_level.load(Ordering::Acquire),
            ..DriveMeasurement::default()
        };
        for slot in 0..MAX_NUM_THREADS {
            measurement.cpu_numbers[slot] = self.cpu_numbers[slot].load(Ordering::Acquire);
            measurement.num_active_partials_processed[slot] =
                self.num_active_partials_processed[slot].load(Ordering::Acquire);
        }

        // Dropped silently when the UI lags; newer buffers obsolete it
        self.measurements.try_push_back(measurement);
    }
}

/// The audio engine: parallel sine synthesis scheduled across real-time
/// worker threads, with the throttling countermeasures alongside.
pub struct Engine {
    core: Arc<EngineCore>,
    host: AudioHost,
    busy_threads: BusyThreads,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_driver_config(DriverConfig::default())
    }

    pub fn with_driver_config(driver_config: DriverConfig) -> Self {
        let core = Arc::new(EngineCore::new());
        let host = AudioHost::new(Arc::clone(&core) as Arc<dyn HostClient>, driver_config);

        // An invalid driver reports no sample rate; leave the bank empty
        let sample_rate = host.driver().sample_rate() as f32;
        if sample_rate > 0.0 {
            core.bank.set_partials(randomize_phases(
                generate_chord(sample_rate, &CHORD_NOTE_NUMBERS),
                NUM_UNRANDOMIZED_PHASES,
            ));
        }

        let mut engine = Self {
            core,
            host,
            busy_threads: BusyThreads::new(),
        };
        engine.set_performance_config(&crate::config::STANDARD_PERFORMANCE_CONFIG);
        engine
    }

    pub fn start(&mut self) {
        self.host.start();
    }

    pub fn stop(&mut self) {
        self.host.stop();
    }

    pub fn is_started(&self) -> bool {
        self.host.is_started()
    }

    pub fn driver_status(&self) -> DriverStatus {
        self.host.driver().status()
    }

    // --- Driver knobs ---

    pub fn sample_rate(&self) -> f64 {
        self.host.driver().sample_rate()
    }

    pub fn preferred_buffer_size(&self) -> usize {
        self.host.preferred_buffer_size()
    }

    /// Buffer sizes must be powers of two within the device's range.
    pub fn set_preferred_buffer_size(&mut self, num_frames: usize) -> Result<(), String> {
        if !(64..=MAX_NUM_FRAMES).contains(&num_frames) {
            return Err(format!(
                "Buffer size must be between 64 and {}",
                MAX_NUM_FRAMES
            ));
        }
        if !num_frames.is_power_of_two() {
            return Err("Buffer size must be a power of 2".to_string());
        }

        self.host.set_preferred_buffer_size(num_frames);
        Ok(())
    }

    pub fn is_audio_input_enabled(&self) -> bool {
        self.host.is_audio_input_enabled()
    }

    pub fn set_is_audio_input_enabled(&mut self, is_enabled: bool) {
        self.host.set_is_audio_input_enabled(is_enabled);
    }

    pub fn output_volume(&self) -> f32 {
        self.host.driver().output_volume()
    }

    pub fn set_output_volume(&mut self, volume: f32, fade_duration: Duration) {
        self.host
            .driver_mut()
            .set_output_volume(volume, fade_duration);
    }

    // --- Scheduling knobs ---

    pub fn num_worker_threads(&self) -> usize {
        self.host.num_worker_threads()
    }

    /// Total processing thread count: the workers plus the driver thread
    /// when it participates.
    pub fn num_processing_threads(&self) -> usize {
        self.host.num_worker_threads() + usize::from(self.host.process_in_driver_thread())
    }

    pub fn set_num_processing_threads(&mut self, num_threads: usize) -> Result<(), String> {
        let num_workers =
            num_threads.saturating_sub(usize::from(self.host.process_in_driver_thread()));
        if num_threads == 0 || num_workers + 1 > MAX_NUM_THREADS {
            return Err(format!(
                "Processing thread count must be between 1 and {}",
                MAX_NUM_THREADS
            ));
        }

        self.host.set_num_worker_threads(num_workers);
        Ok(())
    }

    pub fn process_in_driver_thread(&self) -> bool {
        self.host.process_in_driver_thread()
    }

    pub fn set_process_in_driver_thread(&mut self, is_enabled: bool) {
        self.host.set_process_in_driver_thread(is_enabled);
    }

    pub fn is_work_interval_on(&self) -> bool {
        self.host.is_work_interval_on()
    }

    pub fn set_is_work_interval_on(&mut self, is_on: bool) {
        self.host.set_is_work_interval_on(is_on);
    }

    pub fn minimum_load(&self) -> f64 {
        self.host.minimum_load()
    }

    pub fn set_minimum_load(&mut self, minimum_load: f64) {
        self.host.set_minimum_load(minimum_load.clamp(0.0, 1.0));
    }

    // --- Busy thread knobs ---

    pub fn num_busy_threads(&self) -> usize {
        self.busy_threads.num_threads()
    }

    pub fn set_num_busy_threads(&mut self, num_threads: usize) {
        self.busy_threads.set_num_threads(num_threads);
    }

    pub fn busy_thread_period(&self) -> Duration {
        self.busy_threads.period()
    }

    pub fn set_busy_thread_period(&mut self, period: Duration) {
        self.busy_threads.set_period(period);
    }

    pub fn busy_thread_cpu_usage(&self) -> f64 {
        self.busy_threads.thread_cpu_usage()
    }

    pub fn set_busy_thread_cpu_usage(&mut self, cpu_usage: f64) {
        self.busy_threads.set_thread_cpu_usage(cpu_usage);
    }

    // --- Synthesis knobs ---

    pub fn num_sines(&self) -> usize {
        self.core.num_sines.load(Ordering::Acquire)
    }

    pub fn set_num_sines(&mut self, num_sines: usize) {
        self.core
            .num_sines
            .store(num_sines.min(self.max_num_sines()), Ordering::Release);
    }

    pub fn max_num_sines(&self) -> usize {
        self.core.bank.num_partials()
    }

    /// Stage `additional_sines` extra active partials for `duration`. The
    /// burst is applied on the next render callback and counts down in
    /// samples from there.
    pub fn play_sine_burst(&mut self, duration: Duration, additional_sines: usize) {
        let num_samples = (duration.as_secs_f64() * self.sample_rate()) as i64;
        self.core
            .burst_additional_sines
            .store(additional_sines, Ordering::Release);
        self.core
            .burst_samples_remaining
            .store(num_samples, Ordering::Release);
    }

    // --- Measurements ---

    /// Drain all measurements currently in the ring, newest last.
    pub fn fetch_measurements(&mut self, mut callback: impl FnMut(DriveMeasurement)) {
        while let Some(measurement) = self.core.measurements.pop_value() {
            callback(measurement);
        }
    }

    // --- Presets ---

    pub fn performance_config(&self) -> PerformanceConfig {
        PerformanceConfig {
            busy_threads: crate::config::BusyThreadsConfig {
                num_threads: self.num_busy_threads(),
                period: self.busy_thread_period(),
                cpu_usage: self.busy_thread_cpu_usage(),
            },
            audio_host: crate::config::AudioHostConfig {
                num_processing_threads: self.num_processing_threads(),
                process_in_driver_thread: self.process_in_driver_thread(),
                is_work_interval_on: self.is_work_interval_on(),
                minimum_load: self.minimum_load(),
            },
        }
    }

    pub fn preset(&self) -> Preset {
        Preset::matching(&self.performance_config())
    }

    pub fn set_performance_config(&mut self, config: &PerformanceConfig) {
        self.busy_threads.set_num_threads(config.busy_threads.num_threads);
        self.busy_threads.set_period(config.busy_threads.period);
        self.busy_threads
            .set_thread_cpu_usage(config.busy_threads.cpu_usage);

        // The in-driver flag first: the worker count is derived from it
        self.set_process_in_driver_thread(config.audio_host.process_in_driver_thread);
        self.set_num_processing_threads(config.audio_host.num_processing_threads)
            .ok();
        self.set_is_work_interval_on(config.audio_host.is_work_interval_on);
        self.set_minimum_load(config.audio_host.minimum_load);
    }

    pub fn apply_preset(&mut self, preset: Preset) {
        if let Some(config) = preset.config() {
            self.set_performance_config(&config);
        }
    }

    // --- Test-bench observability (synthetic device path only) ---

    /// Peak of the most recent post-fader output buffer.
    pub fn output_peak(&self) -> Option<f32> {
        self.host.driver().output_peak()
    }

    /// Wall time of the most recent render callback.
    pub fn render_duration(&self) -> Option<Duration> {
        self.host.driver().render_duration()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverBackendKind;

    fn synthetic_engine() -> Engine {
        Engine::with_driver_config(DriverConfig {
            backend: DriverBackendKind::Synthetic,
            ..DriverConfig::default()
        })
    }

    #[test]
    fn test_new_engine_matches_standard_preset() {
        let engine = synthetic_engine();
        assert_eq!(engine.preset(), Preset::Standard);
        assert_eq!(engine.num_processing_threads(), 2);
        assert_eq!(engine.num_worker_threads(), 1);
        assert!(engine.process_in_driver_thread());
        assert_eq!(engine.num_busy_threads(), 0);
    }

    #[test]
    fn test_preset_switching() {
        let mut engine = synthetic_engine();
        engine.apply_preset(Preset::Optimal);
        assert_eq!(engine.preset(), Preset::Optimal);
        assert_eq!(engine.num_worker_threads(), 2);
        assert_eq!(engine.num_busy_threads(), 1);

        engine.set_minimum_load(0.3);
        assert_eq!(engine.preset(), Preset::Custom);
        engine.set_num_busy_threads(0);
    }

    #[test]
    fn test_num_sines_is_clamped_to_the_chord() {
        let mut engine = synthetic_engine();
        let max = engine.max_num_sines();
        assert!(max > DEFAULT_NUM_SINES);

        engine.set_num_sines(max + 100);
        assert_eq!(engine.num_sines(), max);
    }

    #[test]
    fn test_buffer_size_validation() {
        let mut engine = synthetic_engine();
        assert!(engine.set_preferred_buffer_size(100).is_err());
        assert!(engine.set_preferred_buffer_size(32).is_err());
        assert!(engine.set_preferred_buffer_size(8192).is_err());
        assert!(engine.set_preferred_buffer_size(256).is_ok());
        assert_eq!(engine.preferred_buffer_size(), 256);
    }

    #[test]
    fn test_processing_thread_count_validation() {
        let mut engine = synthetic_engine();
        assert!(engine.set_num_processing_threads(0).is_err());
        assert!(engine.set_num_processing_threads(MAX_NUM_THREADS + 1).is_err());
        assert!(engine.set_num_processing_threads(4).is_ok());
        assert_eq!(engine.num_processing_threads(), 4);
    }
}
