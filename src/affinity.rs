//! Reading and writing the cpu affinity of individual threads.
//!
//! The capability only exists where the kernel has a per-thread affinity call
//! (Linux and Android). Everywhere else [`native`] returns `None` and
//! [`UnsupportedAffinity`] answers every request with
//! [`AffinityError::Unsupported`].

use std::sync::Arc;

use crate::{ sys, cpu_set::{ CpuSet, HostCpus }, errors::AffinityError };

/// Whether this build can pin threads at all.
pub const SUPPORTED: bool = cfg!(any(target_os = "linux", target_os = "android"));

/// Names a live OS thread. On Linux this is the kernel thread id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle(sys::RawThread);

impl ThreadHandle {
    /// Handle of the calling thread.
    pub fn current() -> Self {
        Self(sys::current_thread())
    }
}

/// Gets and replaces the affinity mask of a thread.
///
/// Both directions use the same bit-per-cpu-id convention, so reading back a
/// mask that was just written yields an equal [`CpuSet`].
pub trait AffinityController: Send + Sync {
    /// Cpus `thread` is currently allowed to run on.
    fn get(&self, thread: ThreadHandle) -> Result<CpuSet, AffinityError>;

    /// Restrict `thread` to the cpus in `cpus`.
    fn set(&self, thread: ThreadHandle, cpus: &CpuSet) -> Result<(), AffinityError>;
}

/// Affinity through `sched_getaffinity(2)`/`sched_setaffinity(2)`.
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug, Clone, Copy)]
pub struct LinuxAffinity {
    host: HostCpus,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl LinuxAffinity {
    pub fn new(host: HostCpus) -> Self {
        Self { host }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl AffinityController for LinuxAffinity {
    fn get(&self, thread: ThreadHandle) -> Result<CpuSet, AffinityError> {
        let ids = sys::get_affinity(thread.0)
            .map_err(|err| AffinityError::os("sched_getaffinity", err))?;
        CpuSet::try_new(ids, self.host).map_err(AffinityError::InvalidMask)
    }

    fn set(&self, thread: ThreadHandle, cpus: &CpuSet) -> Result<(), AffinityError> {
        if let Some(id) = cpus.iter().find(|&id| id >= sys::MAX_CPU) {
            return Err(AffinityError::MaskTooSmall { id, max_cpu: sys::MAX_CPU });
        }
        sys::set_affinity(thread.0, cpus.iter())
            .map_err(|err| AffinityError::os("sched_setaffinity", err))
    }
}

/// Stand-in for platforms without per-thread affinity.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedAffinity;

impl AffinityController for UnsupportedAffinity {
    fn get(&self, _thread: ThreadHandle) -> Result<CpuSet, AffinityError> {
        Err(AffinityError::Unsupported)
    }

    fn set(&self, _thread: ThreadHandle, _cpus: &CpuSet) -> Result<(), AffinityError> {
        Err(AffinityError::Unsupported)
    }
}

/// The platform's affinity controller, or `None` when pinning isn't available.
pub fn native(host: HostCpus) -> Option<Arc<dyn AffinityController>> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        Some(Arc::new(LinuxAffinity::new(host)))
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = host;
        None
    }
}

/// Like [`AffinityController::get`], but a failure is fatal.
///
/// # Panics
///
/// If the OS refuses the query. A live thread always has a readable mask, so
/// an error here means the process is in a state nothing else can reason about.
pub fn get_affinity(controller: &dyn AffinityController, thread: ThreadHandle) -> CpuSet {
    match controller.get(thread) {
        Ok(set) => set,
        Err(err) => panic!("cannot read affinity of {:?}: {}", thread, err),
    }
}

/// Like [`AffinityController::set`], but a failure is fatal.
///
/// # Panics
///
/// If the OS refuses to apply `cpus`.
pub fn set_affinity(controller: &dyn AffinityController, thread: ThreadHandle, cpus: &CpuSet) {
    if let Err(err) = controller.set(thread, cpus) {
        panic!("cannot pin {:?} to {}: {}", thread, cpus, err);
    }
}

/// Affinity of the calling thread.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn current_affinity() -> CpuSet {
    get_affinity(&LinuxAffinity::new(HostCpus::detect()), ThreadHandle::current())
}

/// Pin the calling thread to `cpus`.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn set_current_affinity(cpus: &CpuSet) {
    set_affinity(&LinuxAffinity::new(HostCpus::detect()), ThreadHandle::current(), cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_refuses_everything() {
        let host = HostCpus::new(4);
        let thread = ThreadHandle::current();
        assert!(matches!(UnsupportedAffinity.get(thread), Err(AffinityError::Unsupported)));
        assert!(matches!(
            UnsupportedAffinity.set(thread, &CpuSet::single(0, host)),
            Err(AffinityError::Unsupported)
        ));
    }

    #[test]
    #[should_panic(expected = "not supported")]
    fn fatal_get_panics_on_error() {
        get_affinity(&UnsupportedAffinity, ThreadHandle::current());
    }

    #[test]
    #[should_panic(expected = "cannot pin")]
    fn fatal_set_panics_on_error() {
        set_affinity(&UnsupportedAffinity, ThreadHandle::current(), &CpuSet::single(0, HostCpus::new(1)));
    }

    #[test]
    fn native_matches_support_flag() {
        assert_eq!(native(HostCpus::detect()).is_some(), SUPPORTED);
    }

    #[test]
    fn handles_differ_between_threads() {
        let here = ThreadHandle::current();
        let there = std::thread::spawn(ThreadHandle::current).join().unwrap();
        assert_eq!(here, ThreadHandle::current());
        assert_ne!(here, there);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    mod linux {
        use super::*;

        #[test]
        fn round_trips_on_a_live_thread() {
            let host = HostCpus::detect();
            let controller = LinuxAffinity::new(host);

            // run on a scratch thread so the test harness threads keep their mask
            std::thread::spawn(move || {
                let me = ThreadHandle::current();
                let allowed = get_affinity(&controller, me);

                let first = CpuSet::single(allowed.iter().next().unwrap(), host);
                set_affinity(&controller, me, &first);
                assert_eq!(get_affinity(&controller, me), first);

                set_affinity(&controller, me, &allowed);
                assert_eq!(get_affinity(&controller, me), allowed);
            })
            .join()
            .unwrap();
        }

        #[test]
        fn pins_another_thread() {
            let host = HostCpus::detect();
            let controller = LinuxAffinity::new(host);
            let allowed = current_affinity();
            let target = CpuSet::single(allowed.iter().last().unwrap(), host);

            let (tx, rx) = std::sync::mpsc::channel();
            let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
            let worker = std::thread::spawn(move || {
                tx.send(ThreadHandle::current()).unwrap();
                done_rx.recv().unwrap();
                current_affinity()
            });

            let handle = rx.recv().unwrap();
            set_affinity(&controller, handle, &target);
            assert_eq!(get_affinity(&controller, handle), target);
            done_tx.send(()).unwrap();
            assert_eq!(worker.join().unwrap(), target);
        }

        #[test]
        fn cpu_beyond_native_mask_is_an_error() {
            // a host this large is valid for CpuSet but can't be described by cpu_set_t
            let huge = HostCpus::new(sys::MAX_CPU + 8);
            let controller = LinuxAffinity::new(huge);
            let cpus = CpuSet::new([0, sys::MAX_CPU + 3], huge);

            let err = controller.set(ThreadHandle::current(), &cpus);
            assert!(matches!(
                err,
                Err(AffinityError::MaskTooSmall { id, max_cpu }) if id == sys::MAX_CPU + 3 && max_cpu == sys::MAX_CPU
            ));
        }
    }
}
