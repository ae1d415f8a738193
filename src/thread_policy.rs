//! Thread naming, real-time scheduling policy, and low-energy work
//!
//! This is the platform-specific leaf of the crate. Apple targets get the
//! real mach calls; other targets get inert fallbacks so the scheduling core
//! stays buildable and testable everywhere.

use std::time::{Duration, Instant};

// Raw mach / pthread bindings, declared by hand like the other framework
// bindings in this crate.
#[cfg(target_os = "macos")]
#[allow(non_camel_case_types)]
mod bindings {
    use std::os::raw::{c_char, c_int, c_void};

    pub type kern_return_t = c_int;
    pub type mach_port_t = u32;
    pub type pthread_t = *mut c_void;

    pub const KERN_SUCCESS: kern_return_t = 0;
    pub const THREAD_TIME_CONSTRAINT_POLICY: u32 = 2;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct mach_timebase_info_data_t {
        pub numer: u32,
        pub denom: u32,
    }

    #[repr(C)]
    pub struct thread_time_constraint_policy_t {
        pub period: u32,
        pub computation: u32,
        pub constraint: u32,
        pub preemptible: u32,
    }

    pub const THREAD_TIME_CONSTRAINT_POLICY_COUNT: u32 =
        (std::mem::size_of::<thread_time_constraint_policy_t>() / std::mem::size_of::<u32>())
            as u32;

    extern "C" {
        pub fn mach_timebase_info(info: *mut mach_timebase_info_data_t) -> kern_return_t;
        pub fn thread_policy_set(
            thread: mach_port_t,
            flavor: u32,
            policy_info: *mut u32,
            count: u32,
        ) -> kern_return_t;
        pub fn pthread_self() -> pthread_t;
        pub fn pthread_mach_thread_np(thread: pthread_t) -> mach_port_t;
        pub fn pthread_setname_np(name: *const c_char) -> c_int;
        pub fn sysctlbyname(
            name: *const c_char,
            oldp: *mut c_void,
            oldlenp: *mut usize,
            newp: *mut c_void,
            newlen: usize,
        ) -> c_int;
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
#[allow(non_camel_case_types)]
mod bindings {
    use std::os::raw::{c_char, c_int, c_void};

    pub type pthread_t = *mut c_void;

    extern "C" {
        pub fn pthread_self() -> pthread_t;
        pub fn pthread_setname_np(thread: pthread_t, name: *const c_char) -> c_int;
    }
}

#[cfg(unix)]
#[allow(non_camel_case_types)]
mod sched_bindings {
    use std::os::raw::c_int;

    pub const SCHED_OTHER: c_int = 0;

    #[repr(C)]
    pub struct sched_param {
        pub sched_priority: c_int,
        #[cfg(target_os = "macos")]
        pub opaque: [u8; 4],
    }

    extern "C" {
        pub fn sched_get_priority_min(policy: c_int) -> c_int;
        pub fn pthread_setschedparam(
            thread: super::bindings::pthread_t,
            policy: c_int,
            param: *const sched_param,
        ) -> c_int;
    }
}

// See MAXTHREADNAMESIZE in the XNU sources. Includes the null byte.
const MAX_THREAD_NAME_SIZE: usize = 64;

/// Name the current thread, truncating to the platform limit.
pub fn set_current_thread_name(name: &str) {
    let mut bytes: Vec<u8> = name
        .bytes()
        .filter(|&b| b != 0)
        .take(MAX_THREAD_NAME_SIZE - 1)
        .collect();
    bytes.push(0);

    #[cfg(target_os = "macos")]
    unsafe {
        bindings::pthread_setname_np(bytes.as_ptr() as *const _);
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    unsafe {
        // Linux additionally caps names at 16 bytes
        bytes.truncate(15);
        bytes.push(0);
        bindings::pthread_setname_np(bindings::pthread_self(), bytes.as_ptr() as *const _);
    }
    #[cfg(not(unix))]
    let _ = bytes;
}

#[cfg(target_os = "macos")]
fn mach_timebase() -> bindings::mach_timebase_info_data_t {
    use std::sync::OnceLock;
    static TIMEBASE: OnceLock<bindings::mach_timebase_info_data_t> = OnceLock::new();
    *TIMEBASE.get_or_init(|| {
        let mut info = bindings::mach_timebase_info_data_t::default();
        let result = unsafe { bindings::mach_timebase_info(&mut info) };
        assert!(
            result == bindings::KERN_SUCCESS && info.denom != 0,
            "could not get mach time base"
        );
        info
    })
}

/// Convert a duration to mach absolute time ticks.
#[cfg(target_os = "macos")]
pub fn duration_to_mach_absolute_time(duration: Duration) -> u64 {
    let timebase = mach_timebase();
    duration.as_nanos() as u64 * timebase.denom as u64 / timebase.numer as u64
}

/// Convert mach absolute time ticks to seconds.
#[cfg(target_os = "macos")]
pub fn mach_absolute_time_to_seconds(mach_time: u64) -> f64 {
    let timebase = mach_timebase();
    (mach_time * timebase.numer as u64 / timebase.denom as u64) as f64 * 1.0e-9
}

/// A real-time time-constraint scheduling policy.
#[derive(Debug, Clone, Copy)]
pub struct TimeConstraintPolicy {
    pub period: Duration,
    pub quantum: Duration,
    pub constraint: Duration,
}

/// Apply a time-constraint policy to the current thread.
///
/// On non-Apple targets the policy cannot be expressed and an error is
/// returned for the caller to log once.
pub fn set_time_constraint_policy(policy: &TimeConstraintPolicy) -> Result<(), String> {
    #[cfg(target_os = "macos")]
    {
        let mut info = bindings::thread_time_constraint_policy_t {
            period: duration_to_mach_absolute_time(policy.period) as u32,
            computation: duration_to_mach_absolute_time(policy.quantum) as u32,
            constraint: duration_to_mach_absolute_time(policy.constraint) as u32,
            preemptible: 1,
        };

        let result = unsafe {
            bindings::thread_policy_set(
                bindings::pthread_mach_thread_np(bindings::pthread_self()),
                bindings::THREAD_TIME_CONSTRAINT_POLICY,
                &mut info as *mut _ as *mut u32,
                bindings::THREAD_TIME_CONSTRAINT_POLICY_COUNT,
            )
        };

        if result == bindings::KERN_SUCCESS {
            Ok(())
        } else {
            Err(format!("thread_policy_set failed: {}", result))
        }
    }
    #[cfg(not(target_os = "macos"))]
    {
        let _ = policy;
        Err("time-constraint policy is not available on this platform".to_string())
    }
}

/// Drop the current thread to the minimum normal scheduling priority.
pub fn set_current_thread_min_priority() {
    #[cfg(unix)]
    unsafe {
        let param = sched_bindings::sched_param {
            sched_priority: sched_bindings::sched_get_priority_min(sched_bindings::SCHED_OTHER),
            #[cfg(target_os = "macos")]
            opaque: [0; 4],
        };
        sched_bindings::pthread_setschedparam(
            bindings::pthread_self(),
            sched_bindings::SCHED_OTHER,
            &param,
        );
    }
}

/// The number of the CPU the calling thread is currently running on.
///
/// Used only for the work-distribution visualization; there is no
/// correctness dependency on the result.
#[inline]
pub fn cpu_number() -> i32 {
    #[cfg(all(target_arch = "aarch64", target_vendor = "apple"))]
    unsafe {
        // _os_cpu_number(): the CPU number lives in the low bits of the
        // read-only thread pointer register.
        let tpidrro: u64;
        std::arch::asm!("mrs {}, TPIDRRO_EL0", out(reg) tpidrro, options(nomem, nostack));
        (tpidrro & 0x7) as i32
    }
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    unsafe {
        extern "C" {
            fn sched_getcpu() -> i32;
        }
        sched_getcpu().max(0)
    }
    #[cfg(not(any(
        all(target_arch = "aarch64", target_vendor = "apple"),
        all(target_os = "linux", target_arch = "x86_64")
    )))]
    0
}

/// Burn one low-power delay slot on the current CPU.
#[inline]
pub fn hardware_delay() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        // Enter a low power state until a wake-up event occurs. XNU's event
        // stream produces one roughly every microsecond, so in practice this
        // instruction returns after ~1.3us.
        std::arch::asm!("wfe", options(nomem, nostack));
    }
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_mm_pause();
    }
    #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
    std::hint::spin_loop();
}

// Performing many hardware delays at once reduces energy usage slightly.
// On an iPhone a batch takes 21us on average.
const NUM_HARDWARE_DELAYS: u32 = 16;

/// Perform one batch of low-energy work.
#[inline]
pub fn low_energy_work() {
    for _ in 0..NUM_HARDWARE_DELAYS {
        hardware_delay();
    }
}

/// Perform low-energy work until the deadline has passed.
pub fn low_energy_work_until(deadline: Instant) {
    while Instant::now() < deadline {
        low_energy_work();
    }
}

/// The number of physical CPUs, if the platform can report it.
pub fn num_physical_cpus() -> Option<i32> {
    #[cfg(target_os = "macos")]
    {
        let mut result: i32 = 0;
        let mut size = std::mem::size_of::<i32>();
        let name = b"hw.physicalcpu\0";
        let status = unsafe {
            bindings::sysctlbyname(
                name.as_ptr() as *const _,
                &mut result as *mut i32 as *mut _,
                &mut size,
                std::ptr::null_mut(),
                0,
            )
        };
        (status == 0).then_some(result)
    }
    #[cfg(not(target_os = "macos"))]
    std::thread::available_parallelism()
        .ok()
        .map(|n| n.get() as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_energy_work_until_honors_deadline() {
        let deadline = Instant::now() + Duration::from_millis(2);
        low_energy_work_until(deadline);
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn test_set_current_thread_name_accepts_long_names() {
        set_current_thread_name(&"x".repeat(200));
    }

    #[test]
    fn test_num_physical_cpus_reports_at_least_one() {
        assert!(num_physical_cpus().unwrap_or(1) >= 1);
    }
}
