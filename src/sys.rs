//! Platform glue: thread ids, online cpu count and the native affinity calls.

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use linux::*;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) use other::*;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux {
    use rustix::process::{ sched_getaffinity, sched_setaffinity, CpuSet, Pid };

    pub(crate) type RawThread = Pid;

    pub(crate) fn current_thread() -> RawThread {
        rustix::thread::gettid()
    }

    pub(crate) fn online_cpus() -> usize {
        // SAFETY: sysconf only reads a configuration value and touches no memory of ours.
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if n > 0 {
            n as usize
        } else {
            super::fallback_cpus()
        }
    }

    /// Highest cpu id + 1 the native mask can describe.
    pub(crate) const MAX_CPU: usize = CpuSet::MAX_CPU;

    /// Read the mask of `thread` as a list of cpu ids.
    pub(crate) fn get_affinity(thread: RawThread) -> std::io::Result<Vec<usize>> {
        // sched_getaffinity hands back a freshly zeroed mask, so no stale bits
        // can leak into the result.
        let mask = sched_getaffinity(Some(thread)).map_err(into_io)?;
        Ok((0..MAX_CPU).filter(|&cpu| mask.is_set(cpu)).collect())
    }

    pub(crate) fn set_affinity(thread: RawThread, cpus: impl Iterator<Item = usize>) -> std::io::Result<()> {
        let mut mask = CpuSet::new();
        for cpu in cpus {
            mask.set(cpu);
        }
        sched_setaffinity(Some(thread), &mask).map_err(into_io)
    }

    fn into_io(errno: rustix::io::Errno) -> std::io::Error {
        std::io::Error::from_raw_os_error(errno.raw_os_error())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod other {
    pub(crate) type RawThread = std::thread::ThreadId;

    pub(crate) fn current_thread() -> RawThread {
        std::thread::current().id()
    }

    pub(crate) fn online_cpus() -> usize {
        super::fallback_cpus()
    }
}

fn fallback_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
