//! Barriered worker pool.
//!
//! One dispatcher owns `n_threads - 1` long-lived workers plus the
//! calling thread. `parallel` fans a closure out as
//! `f(thread_index)` for every index in `[0, n_threads)` and joins at a
//! barrier before returning, so kernels never observe a torn op. No
//! thread migrates between ops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread::JoinHandle;

type Job = *const (dyn Fn(u32) + Sync);

struct Shared {
    job: Mutex<(u64, Option<Job>)>,
    job_ready: Condvar,
    done: Barrier,
    stop: AtomicBool,
}

// Job pointers are only dereferenced between the two barrier crossings
// of one `parallel` call, while the caller keeps the closure alive.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    n_threads: u32,
    generation: u64,
}

impl Dispatcher {
    pub fn new(n_threads: u32) -> Self {
        assert!(n_threads >= 1);
        let shared = Arc::new(Shared {
            job: Mutex::new((0, None)),
            job_ready: Condvar::new(),
            done: Barrier::new(n_threads as usize),
            stop: AtomicBool::new(false),
        });

        let workers = (1..n_threads)
            .map(|thread_index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("lattice-worker-{thread_index}"))
                    .spawn(move || worker_loop(shared, thread_index))
                    .expect("spawn worker thread")
            })
            .collect();

        Dispatcher {
            shared,
            workers,
            n_threads,
            generation: 0,
        }
    }

    pub fn n_threads(&self) -> u32 {
        self.n_threads
    }

    /// Runs `f(thread_index)` on every thread of the pool, including
    /// the calling thread as index 0, and joins.
    pub fn parallel(&mut self, f: &(dyn Fn(u32) + Sync)) {
        if self.n_threads == 1 {
            f(0);
            return;
        }

        self.generation += 1;
        {
            let mut slot = self.shared.job.lock().unwrap();
            // The pointer is valid until the closing barrier below; the
            // lifetime is erased only to park it in the shared slot.
            let job: Job = unsafe { std::mem::transmute(f) };
            *slot = (self.generation, Some(job));
        }
        self.shared.job_ready.notify_all();

        f(0);
        self.shared.done.wait();
    }
}

fn worker_loop(shared: Arc<Shared>, thread_index: u32) {
    let mut seen_generation = 0u64;
    loop {
        let job = {
            let mut slot = shared.job.lock().unwrap();
            loop {
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                let (generation, job) = *slot;
                if generation > seen_generation {
                    seen_generation = generation;
                    break job.expect("job set with generation bump");
                }
                slot = shared.job_ready.wait(slot).unwrap();
            }
        };
        unsafe { (*job)(thread_index) };
        shared.done.wait();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.job_ready.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Splits `count` items into this thread's contiguous range.
pub fn thread_range(count: usize, n_threads: u32, thread_index: u32) -> (usize, usize) {
    let per_thread = count.div_ceil(n_threads as usize);
    let start = (thread_index as usize * per_thread).min(count);
    let end = (start + per_thread).min(count);
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_parallel_runs_every_index() {
        let mut dispatcher = Dispatcher::new(4);
        let hits = AtomicU32::new(0);
        dispatcher.parallel(&|thread_index| {
            hits.fetch_add(1 << thread_index, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0b1111);
    }

    #[test]
    fn test_parallel_joins_before_return() {
        let mut dispatcher = Dispatcher::new(3);
        let counter = AtomicU32::new(0);
        for _ in 0..100 {
            dispatcher.parallel(&|_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(counter.load(Ordering::SeqCst), 300);
    }

    #[test]
    fn test_thread_range_covers_all() {
        let mut covered = 0;
        for thread_index in 0..3 {
            let (start, end) = thread_range(10, 3, thread_index);
            covered += end - start;
        }
        assert_eq!(covered, 10);
        assert_eq!(thread_range(2, 4, 3), (2, 2));
    }
}
