//! Busy threads
//!
//! A busy thread alternates between blocking on a condition variable and
//! performing low-energy work via a hardware delay instruction. Blocking
//! avoids background termination for exceeding the background CPU usage
//! limit; the low-energy phase keeps the performance controller from parking
//! sibling audio threads on efficiency cores. The usage fraction must be set
//! high enough to prevent CPU throttling and low enough to avoid background
//! termination.

use crate::config::{DEFAULT_BUSY_THREAD_CPU_USAGE, DEFAULT_BUSY_THREAD_PERIOD};
use crate::thread_policy::{low_energy_work, set_current_thread_min_priority, set_current_thread_name};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct BusyThreadParams {
    period: Duration,
    cpu_usage: f64,
}

struct BusyThreadState {
    params: Mutex<BusyThreadParams>,
    condvar: Condvar,
    is_active: AtomicBool,
}

/// A low-priority thread that counters CPU throttling by periodically
/// performing low-energy work.
pub struct BusyThread {
    thread_name: String,
    state: Arc<BusyThreadState>,
    thread: Option<JoinHandle<()>>,
}

impl BusyThread {
    /// Create a stopped busy thread.
    pub fn new(thread_name: String) -> Self {
        Self {
            thread_name,
            state: Arc::new(BusyThreadState {
                params: Mutex::new(BusyThreadParams {
                    period: DEFAULT_BUSY_THREAD_PERIOD,
                    cpu_usage: DEFAULT_BUSY_THREAD_CPU_USAGE,
                }),
                condvar: Condvar::new(),
                is_active: AtomicBool::new(false),
            }),
            thread: None,
        }
    }

    /// Start performing busy work. A busy thread is stopped by default.
    pub fn start(&mut self) {
        assert_eq!(
            self.state.is_active.load(Ordering::SeqCst),
            self.thread.is_some(),
            "Invalid busy thread state"
        );

        if self.thread.is_none() {
            self.state.is_active.store(true, Ordering::SeqCst);
            let state = Arc::clone(&self.state);
            let thread_name = self.thread_name.clone();
            self.thread = Some(std::thread::spawn(move || busy_loop(&thread_name, &state)));
        }
    }

    /// Stop performing busy work.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            {
                let _params = self.state.params.lock();
                self.state.is_active.store(false, Ordering::SeqCst);
                self.state.condvar.notify_all();
            }
            thread.join().ok();
        }
    }

    /// The duration of one busy thread iteration.
    pub fn period(&self) -> Duration {
        self.state.params.lock().period
    }

    pub fn set_period(&self, period: Duration) {
        assert!(period > Duration::ZERO, "Invalid busy thread period");
        self.state.params.lock().period = period;
    }

    /// The fraction of an iteration spent performing low-energy work rather
    /// than blocking.
    pub fn thread_cpu_usage(&self) -> f64 {
        self.state.params.lock().cpu_usage
    }

    pub fn set_thread_cpu_usage(&self, cpu_usage: f64) {
        assert!(
            (0.0..=1.0).contains(&cpu_usage),
            "Invalid busy thread CPU usage"
        );
        self.state.params.lock().cpu_usage = cpu_usage;
    }
}

impl Drop for BusyThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn busy_loop(thread_name: &str, state: &BusyThreadState) {
    set_current_thread_name(thread_name);
    set_current_thread_min_priority();

    loop {
        let start_time = Instant::now();

        // Parameter changes are picked up here, at the top of the iteration,
        // so they take effect within one period.
        let mut params = state.params.lock();
        let low_energy_duration = params.period.mul_f64(params.cpu_usage);
        let block_duration = params.period - low_energy_duration;
        let block_end_time = start_time + block_duration;
        let delay_end_time = block_end_time + low_energy_duration;

        while state.is_active.load(Ordering::Relaxed) {
            if state.condvar.wait_until(&mut params, block_end_time).timed_out() {
                break;
            }
        }
        drop(params);

        if !state.is_active.load(Ordering::SeqCst) {
            return;
        }

        while Instant::now() < delay_end_time && state.is_active.load(Ordering::Relaxed) {
            low_energy_work();
        }
    }
}

/// A pool of busy threads sharing one period and usage setting.
pub struct BusyThreads {
    threads: Vec<BusyThread>,
    period: Duration,
    cpu_usage: f64,
}

impl BusyThreads {
    pub fn new() -> Self {
        Self {
            threads: Vec::new(),
            period: DEFAULT_BUSY_THREAD_PERIOD,
            cpu_usage: DEFAULT_BUSY_THREAD_CPU_USAGE,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn set_num_threads(&mut self, num_threads: usize) {
        if num_threads != self.threads.len() {
            self.threads.clear();
            for thread_index in 0..num_threads {
                let mut thread =
                    BusyThread::new(format!("Busy Thread {}", thread_index + 1));
                thread.set_period(self.period);
                thread.set_thread_cpu_usage(self.cpu_usage);
                thread.start();
                self.threads.push(thread);
            }
        }
    }

    /// The duration of one busy thread iteration.
    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn set_period(&mut self, period: Duration) {
        if period != self.period {
            for thread in &self.threads {
                thread.set_period(period);
            }
            self.period = period;
        }
    }

    /// The fraction of an iteration spent performing low-energy work rather
    /// than blocking.
    pub fn thread_cpu_usage(&self) -> f64 {
        self.cpu_usage
    }

    pub fn set_thread_cpu_usage(&mut self, cpu_usage: f64) {
        if cpu_usage != self.cpu_usage {
            for thread in &self.threads {
                thread.set_thread_cpu_usage(cpu_usage);
            }
            self.cpu_usage = cpu_usage;
        }
    }
}

impl Default for BusyThreads {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_stop_is_prompt() {
        let mut thread = BusyThread::new("Test Busy Thread".to_string());
        thread.set_period(Duration::from_millis(500));
        thread.start();

        // Stop must interrupt the blocking phase well before one period
        let start = Instant::now();
        thread.stop();
        assert!(start.elapsed() < Duration::from_millis(450));
    }

    #[test]
    fn test_restart_after_stop() {
        let mut thread = BusyThread::new("Test Busy Thread".to_string());
        thread.set_period(Duration::from_millis(5));
        thread.start();
        thread.stop();
        thread.start();
        thread.stop();
    }

    #[test]
    fn test_pool_resize_and_settings() {
        let mut pool = BusyThreads::new();
        pool.set_num_threads(2);
        assert_eq!(pool.num_threads(), 2);

        pool.set_period(Duration::from_millis(10));
        pool.set_thread_cpu_usage(0.25);
        assert_eq!(pool.threads[0].period(), Duration::from_millis(10));
        assert_eq!(pool.threads[1].thread_cpu_usage(), 0.25);

        pool.set_num_threads(0);
        assert_eq!(pool.num_threads(), 0);
    }

    #[test]
    #[should_panic(expected = "Invalid busy thread CPU usage")]
    fn test_rejects_out_of_range_usage() {
        let thread = BusyThread::new("Test Busy Thread".to_string());
        thread.set_thread_cpu_usage(1.5);
    }
}
