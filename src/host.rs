//! Audio host
//!
//! Owns the driver and a pool of real-time worker threads, and schedules the
//! per-buffer fan-out/fan-in: the render callback wakes every worker through
//! a counting semaphore, optionally joins the processing itself, waits for
//! every worker to signal completion, and finally lets the client mix and
//! measure. Also enforces the artificial minimum-load floor used to keep the
//! performance controller from throttling the audio threads.

use crate::config::{DEFAULT_NUM_WORKER_THREADS, REALTIME_THREAD_QUANTUM};
use crate::driver::{Driver, DriverConfig, RenderArgs};
use crate::sync::Semaphore;
use crate::thread_policy::{
    low_energy_work_until, set_current_thread_name, set_time_constraint_policy,
    TimeConstraintPolicy,
};
use crate::workgroup::{ScopedMembership, SomeAudioWorkgroup};
use atomic_float::AtomicF64;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// The engine-side hooks the host schedules around each buffer.
///
/// `setup` runs on the control thread each time the host (re)starts, before
/// any worker exists. The render hooks run under real-time constraints and
/// must not allocate, block, or log.
pub trait HostClient: Send + Sync + 'static {
    /// About to create `num_worker_threads` workers; size per-thread state
    /// for `num_worker_threads + 1` processing slots (slot 0 belongs to the
    /// driver thread).
    fn setup(&self, num_worker_threads: usize);

    /// Driver thread, buffer start. The channels hold the input samples
    /// when input is enabled.
    fn render_started(&self, left: &mut [f32], right: &mut [f32], num_frames: usize);

    /// Any processing thread; `thread_index` 0 is the driver thread.
    fn process(&self, thread_index: usize, num_frames: usize);

    /// Driver thread, after every worker has finished.
    fn render_ended(&self, left: &mut [f32], right: &mut [f32], host_time: f64, num_frames: usize);
}

struct HostShared {
    start_working: Semaphore,
    finished_work: Semaphore,
    are_workers_active: AtomicBool,
    num_workers: AtomicUsize,
    num_frames: AtomicUsize,
    process_in_driver_thread: AtomicBool,
    minimum_load: AtomicF64,
    /// Cached from the driver so ensure_minimum_load stays syscall-free
    sample_rate: AtomicF64,
}

fn ensure_minimum_load(shared: &HostShared, buffer_start_time: Instant, num_frames: usize) {
    let minimum_load = shared.minimum_load.load(Ordering::Acquire);
    let sample_rate = shared.sample_rate.load(Ordering::Acquire);
    if minimum_load <= 0.0 || sample_rate <= 0.0 {
        return;
    }

    let buffer_duration = num_frames as f64 / sample_rate;
    low_energy_work_until(
        buffer_start_time + Duration::from_secs_f64(buffer_duration * minimum_load),
    );
}

/// Fan-out/fan-in scheduler over the driver callback and a worker pool.
pub struct AudioHost {
    driver: Driver,
    shared: Arc<HostShared>,
    client: Arc<dyn HostClient>,
    worker_threads: Vec<JoinHandle<()>>,
    num_requested_worker_threads: usize,
    is_work_interval_on: bool,
    is_started: bool,
}

impl AudioHost {
    pub fn new(client: Arc<dyn HostClient>, driver_config: DriverConfig) -> Self {
        let shared = Arc::new(HostShared {
            start_working: Semaphore::new(0),
            finished_work: Semaphore::new(0),
            are_workers_active: AtomicBool::new(false),
            num_workers: AtomicUsize::new(0),
            num_frames: AtomicUsize::new(0),
            process_in_driver_thread: AtomicBool::new(true),
            minimum_load: AtomicF64::new(0.0),
            sample_rate: AtomicF64::new(0.0),
        });

        let render_shared = Arc::clone(&shared);
        let render_client = Arc::clone(&client);
        let driver = Driver::new(
            Box::new(move |args: RenderArgs<'_>| {
                render(&render_shared, render_client.as_ref(), args)
            }),
            driver_config,
        );

        shared
            .sample_rate
            .store(driver.sample_rate(), Ordering::Release);

        Self {
            driver,
            shared,
            client,
            worker_threads: Vec::new(),
            num_requested_worker_threads: DEFAULT_NUM_WORKER_THREADS,
            is_work_interval_on: false,
            is_started: false,
        }
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut Driver {
        &mut self.driver
    }

    pub fn is_started(&self) -> bool {
        self.is_started
    }

    pub fn start(&mut self) {
        if !self.is_started {
            self.client.setup(self.num_requested_worker_threads);
            self.shared
                .sample_rate
                .store(self.driver.sample_rate(), Ordering::Release);

            self.setup_worker_threads();
            self.driver.start();
            self.is_started = true;
        }
    }

    pub fn stop(&mut self) {
        if self.is_started {
            self.driver.stop();
            self.teardown_worker_threads();
            self.is_started = false;
        }
    }

    pub fn preferred_buffer_size(&self) -> usize {
        self.driver.preferred_buffer_size()
    }

    pub fn set_preferred_buffer_size(&mut self, preferred_buffer_size: usize) {
        if preferred_buffer_size != self.driver.preferred_buffer_size() {
            // Recreate the worker threads so the new buffer duration is used
            // when setting the thread policy.
            self.while_stopped(|host| {
                host.driver.set_preferred_buffer_size(preferred_buffer_size);
            });
        }
    }

    pub fn is_audio_input_enabled(&self) -> bool {
        self.driver.is_input_enabled()
    }

    pub fn set_is_audio_input_enabled(&mut self, is_input_enabled: bool) {
        if is_input_enabled != self.driver.is_input_enabled() {
            self.while_stopped(|host| {
                host.driver.set_is_input_enabled(is_input_enabled);
            });
        }
    }

    pub fn num_worker_threads(&self) -> usize {
        self.num_requested_worker_threads
    }

    pub fn set_num_worker_threads(&mut self, num_worker_threads: usize) {
        if num_worker_threads != self.num_requested_worker_threads {
            self.while_stopped(|host| {
                host.num_requested_worker_threads = num_worker_threads;
            });
        }
    }

    pub fn process_in_driver_thread(&self) -> bool {
        self.shared.process_in_driver_thread.load(Ordering::Acquire)
    }

    /// Real-time safe; takes effect on the next buffer.
    pub fn set_process_in_driver_thread(&mut self, is_enabled: bool) {
        self.shared
            .process_in_driver_thread
            .store(is_enabled, Ordering::Release);
    }

    pub fn is_work_interval_on(&self) -> bool {
        self.is_work_interval_on
    }

    pub fn set_is_work_interval_on(&mut self, is_on: bool) {
        if is_on != self.is_work_interval_on {
            self.while_stopped(|host| {
                host.is_work_interval_on = is_on;
            });
        }
    }

    pub fn minimum_load(&self) -> f64 {
        self.shared.minimum_load.load(Ordering::Acquire)
    }

    /// Real-time safe; takes effect on the next buffer.
    pub fn set_minimum_load(&mut self, minimum_load: f64) {
        self.shared
            .minimum_load
            .store(minimum_load, Ordering::Release);
    }

    /// Stop, apply a configuration change, and restart iff previously
    /// started.
    fn while_stopped(&mut self, f: impl FnOnce(&mut Self)) {
        let was_started = self.is_started;
        if was_started {
            self.stop();
        }

        f(self);

        if was_started {
            self.start();
        }
    }

    fn setup_worker_threads(&mut self) {
        assert!(
            self.worker_threads.is_empty(),
            "Worker threads must be torn down before setting up new ones"
        );

        self.shared.are_workers_active.store(true, Ordering::Release);
        self.shared
            .num_workers
            .store(self.num_requested_worker_threads, Ordering::Release);

        let nominal_buffer_duration = self.driver.nominal_buffer_duration();
        let workgroup = if self.is_work_interval_on {
            Some(self.driver.workgroup())
        } else {
            None
        };

        for thread_index in 1..=self.num_requested_worker_threads {
            let shared = Arc::clone(&self.shared);
            let client = Arc::clone(&self.client);
            self.worker_threads.push(std::thread::spawn(move || {
                worker_thread(
                    thread_index,
                    &shared,
                    client.as_ref(),
                    nominal_buffer_duration,
                    workgroup,
                );
            }));
        }
    }

    fn teardown_worker_threads(&mut self) {
        self.shared
            .are_workers_active
            .store(false, Ordering::Release);
        for _ in 0..self.worker_threads.len() {
            self.shared.start_working.post();
        }
        for thread in self.worker_threads.drain(..) {
            thread.join().ok();
        }
        self.shared.num_workers.store(0, Ordering::Release);
    }
}

impl Drop for AudioHost {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One render callback: fan out, optionally process, fan in, mix, enforce
/// the load floor.
fn render(shared: &HostShared, client: &dyn HostClient, args: RenderArgs<'_>) {
    let start_time = Instant::now();
    let RenderArgs {
        host_time,
        num_frames,
        left,
        right,
        ..
    } = args;

    if num_frames == 0 {
        return;
    }
    shared.num_frames.store(num_frames, Ordering::Release);

    client.render_started(left, right, num_frames);

    let num_workers = shared.num_workers.load(Ordering::Acquire);
    for _ in 0..num_workers {
        shared.start_working.post();
    }

    let process_in_driver_thread = shared.process_in_driver_thread.load(Ordering::Acquire);
    if process_in_driver_thread {
        client.process(0, num_frames);
    }

    for _ in 0..num_workers {
        shared.finished_work.wait();
    }

    client.render_ended(left, right, host_time, num_frames);

    if process_in_driver_thread {
        ensure_minimum_load(shared, start_time, num_frames);
    }
}

fn worker_thread(
    thread_index: usize,
    shared: &HostShared,
    client: &dyn HostClient,
    nominal_buffer_duration: Duration,
    workgroup: Option<SomeAudioWorkgroup>,
) {
    set_current_thread_name(&format!("Audio Worker Thread {}", thread_index));

    if let Err(message) = set_time_constraint_policy(&TimeConstraintPolicy {
        period: nominal_buffer_duration,
        quantum: REALTIME_THREAD_QUANTUM,
        constraint: nominal_buffer_duration,
    }) {
        eprintln!(
            "[AudioHost] Worker {} running without time-constraint policy: {}",
            thread_index, message
        );
    }

    let mut membership: Option<ScopedMembership> = None;
    let mut needs_to_join_workgroup = workgroup.is_some();

    loop {
        shared.start_working.wait();
        if !shared.are_workers_active.load(Ordering::Acquire) {
            break;
        }

        // Join after waking from the semaphore so the driver thread is
        // active and its workgroup is discoverable.
        if needs_to_join_workgroup {
            if let Some(workgroup) = &workgroup {
                match workgroup.join() {
                    Ok(joined) => membership = Some(joined),
                    Err(message) => {
                        eprintln!("[AudioHost] Worker {} could not join workgroup: {}",
                            thread_index, message);
                    }
                }
            }
            needs_to_join_workgroup = false;
        }

        let start_time = Instant::now();
        let num_frames = shared.num_frames.load(Ordering::Acquire);
        client.process(thread_index, num_frames);
        shared.finished_work.post();
        ensure_minimum_load(shared, start_time, num_frames);
    }

    // Leaves the workgroup, if it was joined
    drop(membership);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverBackendKind;
    use std::sync::atomic::AtomicI64;

    /// Counts protocol events to check the fan-out/fan-in bookkeeping
    struct ProtocolProbe {
        setup_workers: AtomicUsize,
        render_started: AtomicUsize,
        render_ended: AtomicUsize,
        processed: [AtomicUsize; 4],
        last_host_time_nanos: AtomicI64,
    }

    impl ProtocolProbe {
        fn new() -> Self {
            Self {
                setup_workers: AtomicUsize::new(usize::MAX),
                render_started: AtomicUsize::new(0),
                render_ended: AtomicUsize::new(0),
                processed: Default::default(),
                last_host_time_nanos: AtomicI64::new(-1),
            }
        }
    }

    impl HostClient for ProtocolProbe {
        fn setup(&self, num_worker_threads: usize) {
            self.setup_workers.store(num_worker_threads, Ordering::SeqCst);
        }

        fn render_started(&self, _left: &mut [f32], _right: &mut [f32], _num_frames: usize) {
            self.render_started.fetch_add(1, Ordering::SeqCst);
        }

        fn process(&self, thread_index: usize, _num_frames: usize) {
            self.processed[thread_index].fetch_add(1, Ordering::SeqCst);
        }

        fn render_ended(
            &self,
            _left: &mut [f32],
            _right: &mut [f32],
            host_time: f64,
            _num_frames: usize,
        ) {
            self.render_ended.fetch_add(1, Ordering::SeqCst);
            self.last_host_time_nanos
                .store((host_time * 1.0e9) as i64, Ordering::SeqCst);
        }
    }

    fn synthetic_host(client: Arc<ProtocolProbe>) -> AudioHost {
        AudioHost::new(
            client,
            DriverConfig {
                backend: DriverBackendKind::Synthetic,
                ..DriverConfig::default()
            },
        )
    }

    #[test]
    fn test_start_stop_lifecycle_is_idempotent() {
        let probe = Arc::new(ProtocolProbe::new());
        let mut host = synthetic_host(Arc::clone(&probe));

        assert!(!host.is_started());
        host.start();
        host.start();
        assert!(host.is_started());
        assert_eq!(probe.setup_workers.load(Ordering::SeqCst), 1);

        host.stop();
        host.stop();
        assert!(!host.is_started());
    }

    #[test]
    fn test_every_buffer_runs_the_full_protocol() {
        let probe = Arc::new(ProtocolProbe::new());
        let mut host = synthetic_host(Arc::clone(&probe));
        host.set_num_worker_threads(2);
        host.start();
        std::thread::sleep(Duration::from_millis(40));
        host.stop();

        let started = probe.render_started.load(Ordering::SeqCst);
        let ended = probe.render_ended.load(Ordering::SeqCst);
        assert!(started > 0);
        assert_eq!(started, ended, "fan-in must match fan-out per buffer");

        // Driver thread (slot 0) and both workers process every buffer
        for slot in 0..3 {
            assert_eq!(
                probe.processed[slot].load(Ordering::SeqCst),
                started,
                "slot {} must process once per buffer",
                slot
            );
        }
        assert_eq!(probe.processed[3].load(Ordering::SeqCst), 0);

        assert!(probe.last_host_time_nanos.load(Ordering::SeqCst) >= 0);
    }

    #[test]
    fn test_driver_thread_can_opt_out_of_processing() {
        let probe = Arc::new(ProtocolProbe::new());
        let mut host = synthetic_host(Arc::clone(&probe));
        host.set_num_worker_threads(1);
        host.set_process_in_driver_thread(false);
        host.start();
        std::thread::sleep(Duration::from_millis(40));
        host.stop();

        assert_eq!(probe.processed[0].load(Ordering::SeqCst), 0);
        assert!(probe.processed[1].load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_restart_on_config_change_preserves_running_state() {
        let probe = Arc::new(ProtocolProbe::new());
        let mut host = synthetic_host(Arc::clone(&probe));
        host.start();

        host.set_num_worker_threads(3);
        assert!(host.is_started(), "while_stopped must restart the host");
        assert_eq!(probe.setup_workers.load(Ordering::SeqCst), 3);

        host.set_preferred_buffer_size(256);
        assert!(host.is_started());
        assert_eq!(host.preferred_buffer_size(), 256);
        host.stop();

        // Changing the worker count while stopped must not start the host
        host.set_num_worker_threads(1);
        assert!(!host.is_started());
    }

    #[test]
    fn test_minimum_load_keeps_callback_busy() {
        let probe = Arc::new(ProtocolProbe::new());
        let mut host = synthetic_host(Arc::clone(&probe));
        host.set_num_worker_threads(0);
        host.set_minimum_load(0.5);
        host.start();

        // 128 frames at 48kHz is 2.67ms per buffer; a 0.5 load floor forces
        // ~1.33ms of work per callback, so buffers cannot complete much
        // faster than real time.
        std::thread::sleep(Duration::from_millis(50));
        host.stop();

        let buffers = probe.render_ended.load(Ordering::SeqCst) as f64;
        let buffer_duration = 128.0 / 48000.0;
        assert!(buffers > 0.0);
        assert!(buffers * buffer_duration <= 0.075, "callbacks stay near real time");
    }

    #[test]
    fn test_work_interval_start_stop_exits_cleanly() {
        let probe = Arc::new(ProtocolProbe::new());
        let mut host = synthetic_host(Arc::clone(&probe));
        host.set_num_worker_threads(1);
        host.set_is_work_interval_on(true);
        host.start();
        std::thread::sleep(Duration::from_millis(10));
        host.stop();
        // Workers joined; membership (if any) released exactly once by drop
    }
}
