//! Audio driver
//!
//! A thin wrapper over the platform's periodic audio pull. The render
//! callback is the sole real-time entry point; everything the callback needs
//! (sample rate, buffer duration, pending fade commands) is cached where it
//! can be read without a syscall.
//!
//! Starting and stopping toggle a render mutex that the callback try-locks;
//! when the control side holds the lock the callback is a no-op. This is
//! preferred over starting/stopping the underlying device because it is much
//! faster and sidesteps device-teardown races.

#[cfg(target_os = "macos")]
mod coreaudio_backend;
mod synthetic;

use crate::config::{DEFAULT_PREFERRED_BUFFER_SIZE, FADE_COMMAND_QUEUE_SIZE};
use crate::ramp::VolumeFader;
use crate::spsc::FixedSpscQueue;
use crate::workgroup::SomeAudioWorkgroup;
use atomic_float::AtomicF64;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub use synthetic::SyntheticBackend;

/// Lifecycle state of the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Stopped,
    Started,
    /// Device setup failed; the render callback will never fire
    Invalid,
}

/// Which device path backs the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverBackendKind {
    /// The platform audio device where available, synthetic otherwise
    #[default]
    Auto,
    /// A paced thread that pulls the render callback at the nominal buffer
    /// rate with silent input. Used by the test-suite and on platforms
    /// without a supported device path.
    Synthetic,
}

/// Driver construction parameters
#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    pub preferred_buffer_size: usize,
    pub is_input_enabled: bool,
    pub output_volume: f32,
    pub backend: DriverBackendKind,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            preferred_buffer_size: DEFAULT_PREFERRED_BUFFER_SIZE,
            is_input_enabled: false,
            output_volume: 1.0,
            backend: DriverBackendKind::Auto,
        }
    }
}

/// Arguments handed to the render callback for one buffer.
///
/// With input enabled the channels arrive holding the captured input
/// samples; the callback overwrites them with its output.
pub struct RenderArgs<'a> {
    /// Buffer presentation time in seconds
    pub host_time: f64,
    pub bus_number: u32,
    pub num_frames: usize,
    pub left: &'a mut [f32],
    pub right: &'a mut [f32],
}

/// The periodic pull invoked by the device path
pub type RenderCallback = Box<dyn FnMut(RenderArgs<'_>) + Send + 'static>;

/// A deferred volume change, applied on the audio thread
#[derive(Debug, Clone, Copy)]
pub(crate) struct FadeCommand {
    pub target_volume: f32,
    pub num_frames: u64,
}

pub(crate) struct RenderState {
    callback: RenderCallback,
    volume_fader: VolumeFader,
}

/// State shared between the control side and the device path
pub(crate) struct RenderShared {
    render_state: Arc<Mutex<RenderState>>,
    /// UI thread -> audio thread
    command_queue: FixedSpscQueue<FadeCommand>,
    sample_rate: AtomicF64,
    nominal_buffer_duration: AtomicF64,
}

/// Render one buffer: drain fade commands, invoke the callback, apply the
/// fader. No-op while the control side holds the render lock.
pub(crate) fn render_entry(
    shared: &RenderShared,
    host_time: f64,
    bus_number: u32,
    num_frames: usize,
    left: &mut [f32],
    right: &mut [f32],
) {
    let Some(mut state) = shared.render_state.try_lock() else {
        return;
    };

    while let Some(command) = shared.command_queue.pop_value() {
        state
            .volume_fader
            .fade_to(command.target_volume, command.num_frames);
    }

    let state = &mut *state;
    (state.callback)(RenderArgs {
        host_time,
        bus_number,
        num_frames,
        left: &mut *left,
        right: &mut *right,
    });
    state.volume_fader.process(left, right, num_frames);
}

enum Backend {
    #[cfg(target_os = "macos")]
    CoreAudio(coreaudio_backend::CoreAudioBackend),
    Synthetic(SyntheticBackend),
}

impl Backend {
    fn workgroup(&self) -> SomeAudioWorkgroup {
        match self {
            #[cfg(target_os = "macos")]
            Backend::CoreAudio(backend) => backend.workgroup(),
            Backend::Synthetic(_) => SomeAudioWorkgroup::Unavailable,
        }
    }

    fn request_buffer_size(&mut self, num_frames: usize) -> Result<usize, String> {
        match self {
            #[cfg(target_os = "macos")]
            Backend::CoreAudio(backend) => backend.request_buffer_size(num_frames),
            Backend::Synthetic(backend) => backend.request_buffer_size(num_frames),
        }
    }

    fn sample_rate(&self) -> f64 {
        match self {
            #[cfg(target_os = "macos")]
            Backend::CoreAudio(backend) => backend.sample_rate(),
            Backend::Synthetic(backend) => backend.sample_rate(),
        }
    }

    fn buffer_size(&self) -> usize {
        match self {
            #[cfg(target_os = "macos")]
            Backend::CoreAudio(backend) => backend.buffer_size(),
            Backend::Synthetic(backend) => backend.buffer_size(),
        }
    }
}

/// The audio driver.
///
/// The device path runs continuously from construction; `start` and `stop`
/// gate the render callback through the render lock.
pub struct Driver {
    shared: Arc<RenderShared>,
    /// Held while stopped, so the callback's try-lock fails
    pause_guard: Option<ArcMutexGuard<RawMutex, RenderState>>,
    backend: Option<Backend>,
    config: DriverConfig,
    status: DriverStatus,
}

impl Driver {
    pub fn new(render_callback: RenderCallback, config: DriverConfig) -> Self {
        let mut volume_fader = VolumeFader::new();
        volume_fader.fade_to(config.output_volume.max(0.0), 0);

        let render_state = Arc::new(Mutex::new(RenderState {
            callback: render_callback,
            volume_fader,
        }));
        let shared = Arc::new(RenderShared {
            render_state: Arc::clone(&render_state),
            command_queue: FixedSpscQueue::new(FADE_COMMAND_QUEUE_SIZE),
            sample_rate: AtomicF64::new(0.0),
            nominal_buffer_duration: AtomicF64::new(0.0),
        });

        // The callback stays gated until start()
        let pause_guard = Some(render_state.lock_arc());

        let mut driver = Self {
            shared,
            pause_guard,
            backend: None,
            config,
            status: DriverStatus::Stopped,
        };
        driver.setup_backend();
        driver
    }

    fn setup_backend(&mut self) {
        let backend = match self.config.backend {
            DriverBackendKind::Auto => {
                #[cfg(target_os = "macos")]
                {
                    coreaudio_backend::CoreAudioBackend::new(
                        Arc::clone(&self.shared),
                        &self.config,
                    )
                    .map(Backend::CoreAudio)
                }
                #[cfg(not(target_os = "macos"))]
                {
                    SyntheticBackend::new(Arc::clone(&self.shared), &self.config)
                        .map(Backend::Synthetic)
                }
            }
            DriverBackendKind::Synthetic => {
                SyntheticBackend::new(Arc::clone(&self.shared), &self.config)
                    .map(Backend::Synthetic)
            }
        };

        match backend {
            Ok(backend) => {
                self.shared
                    .sample_rate
                    .store(backend.sample_rate(), Ordering::Release);
                self.shared.nominal_buffer_duration.store(
                    backend.buffer_size() as f64 / backend.sample_rate(),
                    Ordering::Release,
                );
                self.backend = Some(backend);
            }
            Err(message) => {
                eprintln!("[Driver] Device setup failed: {}", message);
                self.backend = None;
                self.status = DriverStatus::Invalid;
            }
        }
    }

    /// Enable the render callback.
    pub fn start(&mut self) {
        if self.status == DriverStatus::Stopped {
            self.pause_guard = None;
            self.status = DriverStatus::Started;
        }
    }

    /// Gate the render callback off. Blocks until an in-flight render
    /// completes.
    pub fn stop(&mut self) {
        if self.status == DriverStatus::Started {
            self.pause_guard = Some(self.shared.render_state.lock_arc());
            self.status = DriverStatus::Stopped;
        }
    }

    pub fn status(&self) -> DriverStatus {
        self.status
    }

    pub fn config(&self) -> DriverConfig {
        self.config
    }

    /// Sample rate of the device path. Readable from any thread.
    pub fn sample_rate(&self) -> f64 {
        self.shared.sample_rate.load(Ordering::Acquire)
    }

    /// Duration of one buffer at the negotiated size and rate.
    pub fn nominal_buffer_duration(&self) -> Duration {
        Duration::from_secs_f64(
            self.shared
                .nominal_buffer_duration
                .load(Ordering::Acquire)
                .max(0.0),
        )
    }

    pub fn preferred_buffer_size(&self) -> usize {
        self.config.preferred_buffer_size
    }

    /// Request a new buffer size from the device. The actual size may
    /// differ and must be reobserved through subsequent callbacks.
    pub fn set_preferred_buffer_size(&mut self, preferred_buffer_size: usize) {
        self.config.preferred_buffer_size = preferred_buffer_size;
        if let Some(backend) = &mut self.backend {
            match backend.request_buffer_size(preferred_buffer_size) {
                Ok(actual) => {
                    self.shared.nominal_buffer_duration.store(
                        actual as f64 / backend.sample_rate(),
                        Ordering::Release,
                    );
                }
                Err(message) => {
                    eprintln!("[Driver] Could not set buffer size: {}", message);
                }
            }
        }
    }

    pub fn is_input_enabled(&self) -> bool {
        self.config.is_input_enabled
    }

    /// Tear down and recreate the device path with input enabled or
    /// disabled. May block for several hundred milliseconds.
    pub fn set_is_input_enabled(&mut self, is_input_enabled: bool) {
        if is_input_enabled == self.config.is_input_enabled
            || self.status == DriverStatus::Invalid
        {
            return;
        }

        let was_started = self.status == DriverStatus::Started;
        if was_started {
            self.stop();
        }

        self.backend = None; // tear down before recreating
        self.config.is_input_enabled = is_input_enabled;
        self.setup_backend();

        if was_started && self.status == DriverStatus::Stopped {
            self.start();
        }
    }

    /// The target output volume, an amplitude >= 0.
    pub fn output_volume(&self) -> f32 {
        self.config.output_volume
    }

    /// Fade the output volume. Real-time safe: posts a command that the
    /// callback applies before the next buffer; dropped silently if the
    /// command queue is full.
    pub fn set_output_volume(&mut self, volume: f32, fade_duration: Duration) {
        assert!(volume >= 0.0, "The output volume must be >= 0");
        self.config.output_volume = volume;

        let num_frames = (fade_duration.as_secs_f64() * self.sample_rate()).round() as u64;
        self.shared.command_queue.try_push_back(FadeCommand {
            target_volume: volume,
            num_frames,
        });
    }

    /// Peak of the most recent post-fader output buffer, when the device
    /// path meters its output (the synthetic path does).
    pub fn output_peak(&self) -> Option<f32> {
        match &self.backend {
            Some(Backend::Synthetic(backend)) => Some(backend.output_peak()),
            _ => None,
        }
    }

    /// Buffers rendered so far, when the device path counts them.
    pub fn num_buffers_rendered(&self) -> Option<u64> {
        match &self.backend {
            Some(Backend::Synthetic(backend)) => Some(backend.num_buffers_rendered()),
            _ => None,
        }
    }

    /// Wall time of the most recent render callback, when the device path
    /// meters it.
    pub fn render_duration(&self) -> Option<Duration> {
        match &self.backend {
            Some(Backend::Synthetic(backend)) => Some(backend.render_duration()),
            _ => None,
        }
    }

    /// The workgroup of the device path, when it exposes one.
    pub(crate) fn workgroup(&self) -> SomeAudioWorkgroup {
        self.backend
            .as_ref()
            .map(|backend| backend.workgroup())
            .unwrap_or(SomeAudioWorkgroup::Unavailable)
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.stop();
        // Release the device path before the render state it references
        self.backend = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn synthetic_config() -> DriverConfig {
        DriverConfig {
            backend: DriverBackendKind::Synthetic,
            ..DriverConfig::default()
        }
    }

    #[test]
    fn test_callback_fires_only_while_started() {
        let count = Arc::new(AtomicUsize::new(0));
        let callback_count = Arc::clone(&count);
        let mut driver = Driver::new(
            Box::new(move |_args| {
                callback_count.fetch_add(1, Ordering::SeqCst);
            }),
            synthetic_config(),
        );

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 0, "no render before start");

        driver.start();
        assert_eq!(driver.status(), DriverStatus::Started);
        std::thread::sleep(Duration::from_millis(30));
        driver.stop();
        assert_eq!(driver.status(), DriverStatus::Stopped);

        let rendered = count.load(Ordering::SeqCst);
        assert!(rendered > 0, "render fires while started");

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), rendered, "no render after stop");
    }

    #[test]
    fn test_observables_match_synthetic_device() {
        let driver = Driver::new(Box::new(|_args| {}), synthetic_config());
        assert_eq!(driver.sample_rate(), 48000.0);
        assert_eq!(
            driver.nominal_buffer_duration(),
            Duration::from_secs_f64(128.0 / 48000.0)
        );
    }

    #[test]
    fn test_buffer_size_change_updates_nominal_duration() {
        let mut driver = Driver::new(Box::new(|_args| {}), synthetic_config());
        driver.set_preferred_buffer_size(256);
        assert_eq!(driver.preferred_buffer_size(), 256);
        assert_eq!(
            driver.nominal_buffer_duration(),
            Duration::from_secs_f64(256.0 / 48000.0)
        );
    }

    #[test]
    fn test_fade_command_silences_the_output() {
        let mut driver = Driver::new(
            Box::new(move |args| {
                args.left.fill(1.0);
                args.right.fill(1.0);
            }),
            synthetic_config(),
        );
        driver.start();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(driver.output_peak(), Some(1.0));

        driver.set_output_volume(0.0, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(driver.output_peak(), Some(0.0));
        assert_eq!(driver.output_volume(), 0.0);
        driver.stop();
    }
}
