//! Synthetic device path
//!
//! A paced thread that pulls the render callback once per nominal buffer
//! duration with silent input, mirroring the real device's cadence. Backs
//! the driver on platforms without a supported device and carries the whole
//! test-suite, so the scheduling core can be exercised without audio
//! hardware.

use super::{render_entry, DriverConfig, RenderShared};
use crate::bank::MAX_NUM_FRAMES;
use crate::vdsp::VDsp;
use atomic_float::AtomicF32;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const SAMPLE_RATE: f64 = 48000.0;

struct PullState {
    running: AtomicBool,
    /// Written by the control side, picked up at the next buffer boundary
    buffer_size: AtomicUsize,
    /// Peak of the most recent post-fader output buffer (a loopback meter)
    output_peak: AtomicF32,
    /// Wall time the most recent render spent inside the callback, in nanos
    render_duration_nanos: AtomicU64,
    num_buffers_rendered: AtomicU64,
}

pub struct SyntheticBackend {
    state: Arc<PullState>,
    thread: Option<JoinHandle<()>>,
}

impl SyntheticBackend {
    pub(crate) fn new(shared: Arc<RenderShared>, config: &DriverConfig) -> Result<Self, String> {
        let buffer_size = config.preferred_buffer_size;
        if buffer_size == 0 || buffer_size > MAX_NUM_FRAMES {
            return Err(format!("unsupported buffer size: {}", buffer_size));
        }

        let state = Arc::new(PullState {
            running: AtomicBool::new(true),
            buffer_size: AtomicUsize::new(buffer_size),
            output_peak: AtomicF32::new(0.0),
            render_duration_nanos: AtomicU64::new(0),
            num_buffers_rendered: AtomicU64::new(0),
        });

        let pull_state = Arc::clone(&state);
        let thread = std::thread::spawn(move || pull_loop(&shared, &pull_state));

        Ok(Self {
            state,
            thread: Some(thread),
        })
    }

    pub fn sample_rate(&self) -> f64 {
        SAMPLE_RATE
    }

    pub fn buffer_size(&self) -> usize {
        self.state.buffer_size.load(Ordering::Acquire)
    }

    pub fn request_buffer_size(&mut self, num_frames: usize) -> Result<usize, String> {
        if num_frames == 0 || num_frames > MAX_NUM_FRAMES {
            return Err(format!("unsupported buffer size: {}", num_frames));
        }
        self.state.buffer_size.store(num_frames, Ordering::Release);
        Ok(num_frames)
    }

    /// Peak absolute sample of the most recent output buffer
    pub fn output_peak(&self) -> f32 {
        self.state.output_peak.load(Ordering::Acquire)
    }

    /// Wall time the most recent render spent inside the callback
    pub fn render_duration(&self) -> Duration {
        Duration::from_nanos(self.state.render_duration_nanos.load(Ordering::Acquire))
    }

    pub fn num_buffers_rendered(&self) -> u64 {
        self.state.num_buffers_rendered.load(Ordering::Acquire)
    }
}

impl Drop for SyntheticBackend {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}

fn pull_loop(shared: &RenderShared, state: &PullState) {
    crate::thread_policy::set_current_thread_name("Synthetic Audio Pull");

    let mut left = vec![0.0f32; MAX_NUM_FRAMES];
    let mut right = vec![0.0f32; MAX_NUM_FRAMES];

    let epoch = Instant::now();
    let mut next_buffer_time = epoch;

    while state.running.load(Ordering::SeqCst) {
        let num_frames = state.buffer_size.load(Ordering::Acquire);
        let buffer_duration = Duration::from_secs_f64(num_frames as f64 / SAMPLE_RATE);

        // Silent input
        VDsp::clear(&mut left[..num_frames]);
        VDsp::clear(&mut right[..num_frames]);

        let host_time = next_buffer_time.duration_since(epoch).as_secs_f64();
        let render_start = Instant::now();
        render_entry(
            shared,
            host_time,
            0,
            num_frames,
            &mut left[..num_frames],
            &mut right[..num_frames],
        );
        state.render_duration_nanos.store(
            render_start.elapsed().as_nanos() as u64,
            Ordering::Release,
        );

        let peak = VDsp::peak(&left[..num_frames]).max(VDsp::peak(&right[..num_frames]));
        state.output_peak.store(peak, Ordering::Release);
        state.num_buffers_rendered.fetch_add(1, Ordering::AcqRel);

        next_buffer_time += buffer_duration;
        let now = Instant::now();
        if next_buffer_time > now {
            std::thread::sleep(next_buffer_time - now);
        } else {
            // The callback overran; resynchronize rather than racing to
            // catch up.
            next_buffer_time = now;
        }
    }
}
