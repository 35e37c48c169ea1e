use std::{ hint::black_box, sync::{ atomic::AtomicUsize, Arc } };

use clap::{ error::ErrorKind, CommandFactory, Parser };
use tpool::{ affinity, HostCpus, Pool, Task };

/// Run a Fibonacci workload on a thread pool, optionally pinning its workers.
#[derive(Parser, Debug)]
struct Args {
    /// Cpu ids to pin workers to, one worker per id. Without ids the pool isn't pinned.
    cpu_ids: Vec<usize>,

    /// Number of tasks to schedule.
    #[arg(short, long, default_value_t = 100_000)]
    tasks: usize,
}

struct Fib(u128);

fn fib(n: u128) -> u128 {
    (0..n).fold((0, 1), |(a, b), _| (b, a + b)).0
}
static TASKS_COMPLETED: AtomicUsize = AtomicUsize::new(0);
impl Task for Fib {
    fn run(&self, _pool: &Arc<Pool>) {
        black_box(fib(self.0));

        TASKS_COMPLETED.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let pool = if args.cpu_ids.is_empty() {
        Pool::new(None)
    } else {
        pinned_pool(&args.cpu_ids)
    };

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let controller = tpool::LinuxAffinity::new(HostCpus::detect());
        for (k, worker) in pool.worker_threads().into_iter().enumerate() {
            log::info!("worker #{} runs on cpus {}", k, affinity::get_affinity(&controller, worker));
        }
    }

    for _ in 0..args.tasks {
        pool.schedule(Box::new(Fib(130)));
    }

    while TASKS_COMPLETED.load(std::sync::atomic::Ordering::Relaxed) != args.tasks {
        std::thread::yield_now();
    }
    pool.shutdown();
}

fn pinned_pool(cpu_ids: &[usize]) -> Arc<Pool> {
    let host = HostCpus::detect();
    let Some(controller) = affinity::native(host) else {
        Args::command()
            .error(ErrorKind::InvalidValue, "cpu pinning is not supported on this platform")
            .exit();
    };

    match Pool::try_pinned_with(cpu_ids, host, controller) {
        Ok(pool) => pool,
        Err(err) => Args::command().error(ErrorKind::InvalidValue, err).exit(),
    }
}
