//! Pools whose workers are each pinned to a single cpu.

use std::sync::Arc;

use crate::{
    affinity::AffinityController,
    cpu_set::{ CpuSet, HostCpus },
    errors::PinnedPoolError,
    Pool,
    ThreadHandle,
    ThreadInitializer,
};

impl Pool {
    /// Create a pool with one worker per entry of `cpu_ids`, worker `k` pinned
    /// to `cpu_ids[k]`.
    ///
    /// The same id may appear more than once, those workers then share a cpu.
    ///
    /// # Panics
    ///
    /// If `cpu_ids` is empty or holds an id the host doesn't have. Either way no
    /// worker thread has been created yet. A worker that fails to apply its
    /// affinity aborts the process, see [`Pool::try_pinned_with`].
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn pinned(cpu_ids: &[usize]) -> Arc<Pool> {
        let host = HostCpus::detect();
        let controller = Arc::new(crate::affinity::LinuxAffinity::new(host));
        match Self::try_pinned_with(cpu_ids, host, controller) {
            Ok(pool) => pool,
            Err(err) => panic!("cannot create pinned pool: {}", err),
        }
    }

    /// Like [`Pool::pinned`] with an explicit host and affinity controller.
    ///
    /// Every cpu id is validated before the first worker is spawned. Each worker
    /// then pins itself through `controller` as the first thing it does. If that
    /// fails the error is logged and the process is aborted: a worker running on
    /// the wrong cpus breaks the guarantees the caller asked for, and there is no
    /// way to hand it back.
    pub fn try_pinned_with(
        cpu_ids: &[usize],
        host: HostCpus,
        controller: Arc<dyn AffinityController>
    ) -> Result<Arc<Pool>, PinnedPoolError> {
        if cpu_ids.is_empty() {
            return Err(PinnedPoolError::NoCpus);
        }

        let sets = cpu_ids
            .iter()
            .map(|&id| CpuSet::try_single(id, host))
            .collect::<Result<Vec<_>, _>>()?;

        let initializers = sets
            .into_iter()
            .map(|cpus| pin_to(controller.clone(), cpus))
            .collect();

        Ok(Pool::with_thread_initializers(initializers))
    }
}

fn pin_to(controller: Arc<dyn AffinityController>, cpus: CpuSet) -> ThreadInitializer {
    Box::new(move |thread: ThreadHandle| {
        if let Err(err) = controller.set(thread, &cpus) {
            log::error!("Failed to pin worker {:?} to cpus {}: {}", thread, cpus, err);
            std::process::abort();
        }
        log::debug!("Worker {:?} pinned to cpus {}", thread, cpus);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::{ errors::{ AffinityError, CpuSetError }, UnsupportedAffinity };

    /// Remembers every `set` together with the thread it was issued from.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(ThreadHandle, ThreadHandle, CpuSet)>>,
    }

    impl AffinityController for Recorder {
        fn get(&self, thread: ThreadHandle) -> Result<CpuSet, AffinityError> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(target, _, _)| *target == thread)
                .map(|(_, _, cpus)| cpus.clone())
                .ok_or(AffinityError::Unsupported)
        }

        fn set(&self, thread: ThreadHandle, cpus: &CpuSet) -> Result<(), AffinityError> {
            self.calls.lock().unwrap().push((thread, ThreadHandle::current(), cpus.clone()));
            Ok(())
        }
    }

    #[test]
    fn each_worker_pins_itself_once() {
        let host = HostCpus::new(4);
        let recorder = Arc::new(Recorder::default());
        let pool = Pool::try_pinned_with(&[2, 0, 3], host, recorder.clone()).unwrap();

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        for (target, caller, _) in &calls {
            assert_eq!(target, caller);
        }

        let workers = pool.worker_threads();
        assert_eq!(workers.len(), 3);
        for (worker, id) in workers.into_iter().zip([2, 0, 3]) {
            assert_eq!(recorder.get(worker).unwrap(), CpuSet::single(id, host));
        }
        pool.shutdown();
    }

    #[test]
    fn repeated_cpu_ids_share_a_cpu() {
        let host = HostCpus::new(2);
        let recorder = Arc::new(Recorder::default());
        let pool = Pool::try_pinned_with(&[1, 1, 1], host, recorder.clone()).unwrap();

        assert_eq!(pool.threads(), 3);
        for worker in pool.worker_threads() {
            assert_eq!(recorder.get(worker).unwrap(), CpuSet::single(1, host));
        }
        pool.shutdown();
    }

    #[test]
    fn rejects_empty_list() {
        let recorder = Arc::new(Recorder::default());
        let err = Pool::try_pinned_with(&[], HostCpus::new(4), recorder.clone())
            .err()
            .expect("empty list must be rejected");
        assert!(matches!(err, PinnedPoolError::NoCpus));
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn rejects_unknown_cpu_before_spawning() {
        let recorder = Arc::new(Recorder::default());
        let err = Pool::try_pinned_with(&[0, 1_000_000], HostCpus::new(4), recorder.clone())
            .err()
            .expect("unknown cpu must be rejected");
        assert!(matches!(
            err,
            PinnedPoolError::InvalidCpu(CpuSetError::OutOfRange { id: 1_000_000, logical_cpus: 4 })
        ));
        // the valid first id must not have produced a worker either
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    /// Set in the child process spawned by `failed_pin_aborts_the_process`.
    const ABORT_CHILD_ENV: &str = "TPOOL_PIN_ABORT_CHILD";

    #[test]
    fn failed_pin_aborts_the_process() {
        if std::env::var_os(ABORT_CHILD_ENV).is_some() {
            let _ = Pool::try_pinned_with(&[0], HostCpus::new(1), Arc::new(UnsupportedAffinity));
            // only reached if the worker did not abort
            return;
        }

        let status = std::process::Command::new(std::env::current_exe().unwrap())
            .args(["pinned::tests::failed_pin_aborts_the_process", "--exact", "--test-threads=1"])
            .env(ABORT_CHILD_ENV, "1")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap();

        assert!(!status.success(), "child exited with {:?}", status);
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(status.signal(), Some(libc::SIGABRT));
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    #[should_panic(expected = "needs at least one cpu id")]
    fn pinned_panics_on_empty_list() {
        Pool::pinned(&[]);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    #[should_panic(expected = "cpu id 1000000 is out of range")]
    fn pinned_panics_on_unknown_cpu() {
        Pool::pinned(&[1_000_000]);
    }
}
