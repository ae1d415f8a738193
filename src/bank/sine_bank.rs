//! Work-stealing engine over the partial list

use super::{process_partial, Partial, StereoBuffer, MAX_NUM_FRAMES, PARTIALS_PER_PROCESSING_CHUNK};
use crate::vdsp::VDsp;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A bank of sinusoidal partials processed by several threads at once.
///
/// Threads claim chunks of partials by advancing a single atomic counter and
/// render their share into a per-thread scratch buffer. The partial list is
/// sorted ascending by frequency, so the active prefix (the first
/// `num_active_partials` entries) is always the perceptually dominant low
/// end.
///
/// The caller provides the buffer-level ordering: `prepare` runs on the
/// driver thread before any worker is woken, `process` runs concurrently on
/// the processing threads, and `mix_to` runs on the driver thread after all
/// workers have signaled completion. `set_num_threads` and `set_partials`
/// are only valid while no audio is active.
pub struct ParallelSineBank {
    partials: UnsafeCell<Vec<UnsafeCell<Partial>>>,
    buffers: UnsafeCell<Vec<UnsafeCell<StereoBuffer>>>,
    num_active_partials: AtomicUsize,
    num_taken_partials: AtomicUsize,
}

// Safety: partials are mutated only inside disjoint index ranges claimed
// through num_taken_partials, and each scratch buffer is written only by the
// thread whose index owns it. prepare/mix_to touch the cells from the driver
// thread strictly before/after the workers' processing window; the host's
// semaphore handshake provides those happens-before edges. The outer vectors
// are replaced only while no audio is active.
unsafe impl Send for ParallelSineBank {}
unsafe impl Sync for ParallelSineBank {}

impl ParallelSineBank {
    pub fn new() -> Self {
        Self {
            partials: UnsafeCell::new(Vec::new()),
            buffers: UnsafeCell::new(Vec::new()),
            num_active_partials: AtomicUsize::new(0),
            num_taken_partials: AtomicUsize::new(0),
        }
    }

    /// Resize the per-thread scratch buffers. Only valid while no audio is
    /// active.
    pub fn set_num_threads(&self, num_threads: usize) {
        // Safety: no audio active, so nothing else touches the vector
        let buffers = unsafe { &mut *self.buffers.get() };
        buffers.resize_with(num_threads, Default::default);
    }

    pub fn num_threads(&self) -> usize {
        unsafe { (*self.buffers.get()).len() }
    }

    /// Replace the partial list. The list must be sorted ascending by
    /// `phase_increment`. Only valid while no audio is active.
    pub fn set_partials(&self, partials: Vec<Partial>) {
        debug_assert!(partials
            .windows(2)
            .all(|pair| pair[0].phase_increment <= pair[1].phase_increment));

        // Safety: no audio active, so nothing else touches the vector
        unsafe {
            *self.partials.get() = partials.into_iter().map(UnsafeCell::new).collect();
        }
    }

    pub fn num_partials(&self) -> usize {
        unsafe { (*self.partials.get()).len() }
    }

    /// Copy of one partial. Not for use while audio is running.
    pub fn partial(&self, index: usize) -> Partial {
        let partials = unsafe { &*self.partials.get() };
        unsafe { *partials[index].get() }
    }

    /// Called by the driver thread at buffer start, before any worker wakes:
    /// publishes the active count, zeros the scratch buffers, resets the
    /// claim counter.
    pub fn prepare(&self, num_active_partials: usize, num_frames: usize) {
        assert!(
            num_frames > 0 && num_frames <= MAX_NUM_FRAMES,
            "Invalid number of frames"
        );

        self.num_active_partials
            .store(num_active_partials, Ordering::Release);
        self.num_taken_partials.store(0, Ordering::Release);

        // Safety: no worker runs between prepare and the start posts
        let buffers = unsafe { &*self.buffers.get() };
        for buffer in buffers {
            unsafe { (*buffer.get()).clear(num_frames) };
        }
    }

    /// Process chunks of partials on behalf of `thread_index` until the bank
    /// is exhausted. Returns the number of active partials this thread
    /// processed (used for the work-distribution visualization).
    pub fn process(&self, thread_index: usize, num_frames: usize) -> usize {
        let buffers = unsafe { &*self.buffers.get() };
        assert!(thread_index < buffers.len(), "Invalid thread index");
        assert!(
            num_frames > 0 && num_frames <= MAX_NUM_FRAMES,
            "Invalid number of frames"
        );

        // Safety: this thread is the only writer of its scratch buffer
        let buffer = unsafe { &mut *buffers[thread_index].get() };
        let (left, right) = buffer.channels_mut();

        let partials = unsafe { &*self.partials.get() };
        let num_partials = partials.len();
        let num_active_partials = self.num_active_partials.load(Ordering::Acquire);

        let mut num_active_partials_processed = 0;
        loop {
            let start_index = self
                .num_taken_partials
                .fetch_add(PARTIALS_PER_PROCESSING_CHUNK, Ordering::AcqRel);
            if start_index >= num_partials {
                break;
            }

            let end_index = (start_index + PARTIALS_PER_PROCESSING_CHUNK).min(num_partials);
            for partial_index in start_index..end_index {
                // Safety: indices in [start, end) belong to this claim only
                let partial = unsafe { &mut *partials[partial_index].get() };
                if partial_index < num_active_partials {
                    partial.target_amp = partial.amp_when_active;
                    num_active_partials_processed += 1;
                } else {
                    partial.target_amp = 0.0;
                }
                process_partial(partial, num_frames, left, right);
            }
        }

        num_active_partials_processed
    }

    /// Called by the driver thread after all workers have finished: sum every
    /// scratch buffer into the output. The caller must have zeroed the
    /// output first.
    pub fn mix_to(&self, left: &mut [f32], right: &mut [f32], num_frames: usize) {
        assert!(
            num_frames > 0 && num_frames <= MAX_NUM_FRAMES,
            "Invalid number of frames"
        );

        let buffers = unsafe { &*self.buffers.get() };
        for buffer in buffers {
            // Safety: all workers have signaled completion; nothing writes
            let buffer = unsafe { &*buffer.get() };
            VDsp::add_to(&buffer.left()[..num_frames], &mut left[..num_frames]);
            VDsp::add_to(&buffer.right()[..num_frames], &mut right[..num_frames]);
        }
    }
}

impl Default for ParallelSineBank {
    fn default() -> Self {
        Self::new()
    }
}
