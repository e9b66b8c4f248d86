use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// A unit of background work: asynchronous shader finalization, asset
/// loading, or any other closure the engine wants off the render thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<JobQueue>,
    cond: Condvar,
}

struct JobQueue {
    jobs: VecDeque<Job>,
    active: usize,
    shutdown: bool,
}

/// A FIFO worker pool of `hardware concurrency - 1` OS threads.
///
/// Jobs are picked up in submission order but complete in arbitrary order
/// across workers. The render thread never executes jobs itself; it only
/// submits and, when it must, blocks in [`WorkerPool::wait_idle`].
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        let count = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(1);
        Self::with_workers(count)
    }

    pub fn with_workers(count: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(JobQueue {
                jobs: VecDeque::new(),
                active: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let workers = (0..count.max(1))
            .map(|idx| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("opal-worker-{idx}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock().expect("worker queue poisoned");
        if queue.shutdown {
            return;
        }
        queue.jobs.push_back(Box::new(job));
        drop(queue);
        self.shared.cond.notify_one();
    }

    /// Blocks until the queue is empty and no worker is mid-job.
    pub fn wait_idle(&self) {
        let mut queue = self.shared.queue.lock().expect("worker queue poisoned");
        while !queue.jobs.is_empty() || queue.active > 0 {
            queue = self.shared.cond.wait(queue).expect("worker queue poisoned");
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock().expect("worker queue poisoned");
            queue.shutdown = true;
        }
        self.shared.cond.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().expect("worker queue poisoned");
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    queue.active += 1;
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                queue = shared.cond.wait(queue).expect("worker queue poisoned");
            }
        };

        job();

        let mut queue = shared.queue.lock().expect("worker queue poisoned");
        queue.active -= 1;
        let idle = queue.jobs.is_empty() && queue.active == 0;
        drop(queue);
        if idle {
            shared.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_every_submitted_job() {
        let pool = WorkerPool::with_workers(3);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..128 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 128);
    }

    #[test]
    fn single_worker_preserves_fifo_order() {
        let pool = WorkerPool::with_workers(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let order = order.clone();
            pool.submit(move || {
                order.lock().unwrap().push(i);
            });
        }
        pool.wait_idle();
        let seen = order.lock().unwrap().clone();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn drop_joins_workers() {
        let pool = WorkerPool::with_workers(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
