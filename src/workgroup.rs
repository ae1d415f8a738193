//! Audio workgroup / work interval membership
//!
//! A workgroup is the system's grouping of threads that cooperate on a common
//! audio deadline; joining it extends the scheduler's deadline awareness to
//! the worker threads. Two concrete mechanisms hide behind one capability
//! surface: the modern `os_workgroup` API and the legacy work-interval port,
//! found by probing the process's mach send rights.
//!
//! See https://developer.apple.com/documentation/audiotoolbox/workgroup_management

#[cfg(target_os = "macos")]
#[allow(non_camel_case_types)]
pub(crate) mod bindings {
    use std::os::raw::{c_int, c_void};

    pub type kern_return_t = c_int;
    pub type mach_port_t = u32;
    pub type os_workgroup_t = *mut c_void;

    pub const KERN_SUCCESS: kern_return_t = 0;
    pub const MACH_PORT_TYPE_SEND: u32 = 0x10000;

    // Opaque join token. Sized generously; the kernel only ever sees it by
    // pointer.
    #[repr(C)]
    pub struct os_workgroup_join_token_s {
        pub opaque: [u64; 8],
    }

    impl os_workgroup_join_token_s {
        pub fn zeroed() -> Self {
            Self { opaque: [0; 8] }
        }
    }

    extern "C" {
        pub static mach_task_self_: mach_port_t;

        pub fn mach_port_names(
            task: mach_port_t,
            names: *mut *mut mach_port_t,
            names_count: *mut u32,
            types: *mut *mut u32,
            types_count: *mut u32,
        ) -> kern_return_t;

        pub fn os_workgroup_max_parallel_threads(
            workgroup: os_workgroup_t,
            attr: *mut c_void,
        ) -> c_int;
        pub fn os_workgroup_join(
            workgroup: os_workgroup_t,
            token: *mut os_workgroup_join_token_s,
        ) -> c_int;
        pub fn os_workgroup_leave(
            workgroup: os_workgroup_t,
            token: *mut os_workgroup_join_token_s,
        );

        // Private work-interval interface, usable prior to the public
        // workgroup API. Forbidden on the App Store; test-bench use only.
        pub fn work_interval_join_port(port: mach_port_t) -> c_int;
        pub fn work_interval_leave() -> c_int;

        pub fn pthread_time_constraint_max_parallelism(flags: u64) -> c_int;
    }
}

/// A wrapper around an `os_workgroup` owned by the audio device path.
///
/// The pointer stays valid for the lifetime of the io unit that reported it;
/// the driver hands it out only while started.
#[cfg(target_os = "macos")]
#[derive(Clone, Copy)]
pub struct AudioWorkgroup {
    workgroup: bindings::os_workgroup_t,
}

#[cfg(target_os = "macos")]
unsafe impl Send for AudioWorkgroup {}
#[cfg(target_os = "macos")]
unsafe impl Sync for AudioWorkgroup {}

#[cfg(target_os = "macos")]
impl AudioWorkgroup {
    pub(crate) fn new(workgroup: bindings::os_workgroup_t) -> Self {
        Self { workgroup }
    }

    /// The system's recommendation for the maximum number of threads that
    /// should contribute to the workload.
    pub fn max_parallel_threads(&self) -> i32 {
        unsafe {
            bindings::os_workgroup_max_parallel_threads(self.workgroup, std::ptr::null_mut())
        }
    }

    /// Join the current thread to the workgroup.
    pub fn join(&self) -> Result<ScopedMembership, String> {
        let mut token = bindings::os_workgroup_join_token_s::zeroed();
        let result = unsafe { bindings::os_workgroup_join(self.workgroup, &mut token) };
        if result == 0 {
            Ok(ScopedMembership(MembershipKind::Workgroup {
                workgroup: self.workgroup,
                token,
            }))
        } else {
            Err(format!("os_workgroup_join failed: {}", result))
        }
    }
}

/// The legacy work-interval mechanism.
///
/// The audio device's work interval is not handed to clients directly, so
/// `join` enumerates the process's mach port rights and tries to join each
/// send right until one succeeds. The device path must be running first or
/// there is no work interval to find.
#[cfg(target_os = "macos")]
#[derive(Clone, Copy, Default)]
pub struct LegacyAudioWorkgroup;

#[cfg(target_os = "macos")]
impl LegacyAudioWorkgroup {
    pub fn max_parallel_threads(&self) -> i32 {
        let result = unsafe { bindings::pthread_time_constraint_max_parallelism(0) };
        if result > 0 {
            result
        } else {
            crate::thread_policy::num_physical_cpus().unwrap_or(1)
        }
    }

    pub fn join(&self) -> Result<ScopedMembership, String> {
        let mut names: *mut bindings::mach_port_t = std::ptr::null_mut();
        let mut names_count: u32 = 0;
        let mut types: *mut u32 = std::ptr::null_mut();
        let mut types_count: u32 = 0;

        let result = unsafe {
            bindings::mach_port_names(
                bindings::mach_task_self_,
                &mut names,
                &mut names_count,
                &mut types,
                &mut types_count,
            )
        };
        if result != bindings::KERN_SUCCESS {
            return Err(format!("mach_port_names failed: {}", result));
        }
        if names_count != types_count {
            return Err("mach_port_names returned mismatched arrays".to_string());
        }

        for i in 0..names_count as usize {
            // Safety: the kernel returned arrays of names_count entries
            let (port, port_type) = unsafe { (*names.add(i), *types.add(i)) };
            if port_type & bindings::MACH_PORT_TYPE_SEND != 0
                && unsafe { bindings::work_interval_join_port(port) } == 0
            {
                println!("[Workgroup] Joined work interval port {:04X}", port);
                return Ok(ScopedMembership(MembershipKind::WorkInterval));
            }
        }

        Err("no joinable work interval port found".to_string())
    }
}

/// A wrapper around either of the two workgroup mechanisms.
///
/// The driver reports a modern workgroup when the device exposes one; worker
/// threads otherwise fall back to work-interval discovery.
#[derive(Clone, Copy)]
pub enum SomeAudioWorkgroup {
    #[cfg(target_os = "macos")]
    Workgroup(AudioWorkgroup),
    #[cfg(target_os = "macos")]
    WorkInterval(LegacyAudioWorkgroup),
    /// No workgroup mechanism on this platform
    Unavailable,
}

impl SomeAudioWorkgroup {
    /// Discover a joinable workgroup for the running audio device path.
    pub fn discover() -> Self {
        #[cfg(target_os = "macos")]
        {
            SomeAudioWorkgroup::WorkInterval(LegacyAudioWorkgroup)
        }
        #[cfg(not(target_os = "macos"))]
        SomeAudioWorkgroup::Unavailable
    }

    /// The system's recommendation for the maximum number of threads that
    /// should contribute to the workload.
    pub fn max_parallel_threads(&self) -> i32 {
        match self {
            #[cfg(target_os = "macos")]
            SomeAudioWorkgroup::Workgroup(workgroup) => workgroup.max_parallel_threads(),
            #[cfg(target_os = "macos")]
            SomeAudioWorkgroup::WorkInterval(work_interval) => {
                work_interval.max_parallel_threads()
            }
            SomeAudioWorkgroup::Unavailable => {
                crate::thread_policy::num_physical_cpus().unwrap_or(1)
            }
        }
    }

    /// Join the current thread. The membership handle leaves on drop.
    pub fn join(&self) -> Result<ScopedMembership, String> {
        match self {
            #[cfg(target_os = "macos")]
            SomeAudioWorkgroup::Workgroup(workgroup) => workgroup.join(),
            #[cfg(target_os = "macos")]
            SomeAudioWorkgroup::WorkInterval(work_interval) => work_interval.join(),
            SomeAudioWorkgroup::Unavailable => {
                Err("no workgroup mechanism on this platform".to_string())
            }
        }
    }
}

enum MembershipKind {
    #[cfg(target_os = "macos")]
    Workgroup {
        workgroup: bindings::os_workgroup_t,
        token: bindings::os_workgroup_join_token_s,
    },
    #[cfg(target_os = "macos")]
    WorkInterval,
    #[allow(dead_code)]
    Noop,
}

/// A handle representing the current thread's workgroup membership.
///
/// Move-only; the thread is removed from the workgroup exactly once, when
/// the handle drops on the thread that joined.
pub struct ScopedMembership(MembershipKind);

impl Drop for ScopedMembership {
    fn drop(&mut self) {
        match &mut self.0 {
            #[cfg(target_os = "macos")]
            MembershipKind::Workgroup { workgroup, token } => unsafe {
                bindings::os_workgroup_leave(*workgroup, token);
            },
            #[cfg(target_os = "macos")]
            MembershipKind::WorkInterval => {
                if unsafe { bindings::work_interval_leave() } == 0 {
                    println!("[Workgroup] Left work interval");
                } else {
                    eprintln!("[Workgroup] Couldn't leave work interval");
                }
            }
            MembershipKind::Noop => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_parallel_threads_is_positive() {
        assert!(SomeAudioWorkgroup::discover().max_parallel_threads() >= 1);
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_join_unavailable_reports_error() {
        assert!(SomeAudioWorkgroup::Unavailable.join().is_err());
    }
}
