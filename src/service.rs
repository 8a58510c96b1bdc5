//! The worker pool: fixed-size thread pool, per-weight ready queues, the
//! deviation-minimising fairness dispatch, and the idle barrier. See
//! `spec.md` §4.2.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::thread::JoinHandle;

use crate::error::GroveError;
use crate::task::{
    current_task_handle, require_current_task, TaskBuilder, TaskHandle, TaskId, TaskInner,
};
use crate::weight::{Weight, WEIGHT_COUNT};

pub(crate) struct ServiceQueues {
    ready: [VecDeque<Arc<TaskInner>>; WEIGHT_COUNT],
    worker_list: VecDeque<(Weight, Arc<TaskInner>)>,
    num_active_workers: [u32; WEIGHT_COUNT],
    overload_worker_limit: [u32; WEIGHT_COUNT],
    num_working_tasks: u32,
    shutting_down: bool,
    tasks: HashMap<TaskId, Arc<TaskInner>>,
}

/// State shared between `Service`, every worker thread, and every live
/// `TaskInner`. Deliberately holds no `JoinHandle`s, so worker threads can
/// keep a strong `Arc` to it for their whole lifetime without creating a
/// reference cycle against the `Service` that joins them.
pub(crate) struct ServiceShared {
    queues: StdMutex<ServiceQueues>,
    workers_cv: Condvar,
    done_cv: Condvar,
    num_threads: usize,
}

impl ServiceShared {
    fn dispatch_ready_tasks(&self, queues: &mut ServiceQueues) -> usize {
        let mut moved = 0usize;
        loop {
            let overloaded = queues.num_working_tasks >= self.num_threads as u32;
            let eligible: Vec<Weight> = Weight::ALL
                .into_iter()
                .filter(|w| {
                    let idx = w.index();
                    !queues.ready[idx].is_empty()
                        && (!overloaded
                            || queues.num_active_workers[idx] < queues.overload_worker_limit[idx])
                })
                .collect();
            if eligible.is_empty() {
                break;
            }

            // Pick the weight whose tentative total deviation (after
            // hypothetically dispatching one more of it) is smallest,
            // ties broken by ladder order (Light < Middle < Heavy).
            let mut best = eligible[0];
            let mut best_total = f64::INFINITY;
            for &candidate in &eligible {
                let mut total = 0.0;
                for &w in &eligible {
                    let idx = w.index();
                    let active = f64::from(queues.num_active_workers[idx]);
                    let limit = f64::from(queues.overload_worker_limit[idx].max(1));
                    let active_after = if w == candidate { active + 1.0 } else { active };
                    total += (1.0 - active_after / limit).abs();
                }
                if total < best_total {
                    best_total = total;
                    best = candidate;
                }
            }

            let idx = best.index();
            let task = queues.ready[idx]
                .pop_front()
                .expect("weight was found eligible, so its ready queue is non-empty");
            queues.num_active_workers[idx] += 1;
            queues.num_working_tasks += 1;
            queues.worker_list.push_back((best, task));
            moved += 1;
        }
        moved
    }

    pub(crate) fn add_to_queue(&self, weight: Weight, task: Arc<TaskInner>) {
        let notified = {
            let mut queues = self.queues.lock().unwrap();
            if queues.shutting_down {
                tracing::debug!("dropping task enqueued after shutdown began");
                return;
            }
            queues.ready[weight.index()].push_back(task);
            self.dispatch_ready_tasks(&mut queues)
        };
        for _ in 0..notified {
            self.workers_cv.notify_one();
        }
    }

    pub(crate) fn insert_keepalive(&self, id: TaskId, task: Arc<TaskInner>) {
        self.queues.lock().unwrap().tasks.insert(id, task);
    }

    pub(crate) fn remove_keepalive(&self, id: TaskId) {
        let mut queues = self.queues.lock().unwrap();
        queues.tasks.remove(&id);
        if queues.num_working_tasks == 0 && queues.worker_list.is_empty() {
            self.done_cv.notify_all();
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.queues.lock().unwrap().shutting_down
    }
}

fn overload_limits(num_threads: usize) -> [u32; WEIGHT_COUNT] {
    // overloadWorkerLimit[w] = max(1, floor(numThreads * (3 - w) / 4)):
    // Light gets the largest share of the pool under overload, Heavy the
    // smallest.
    let n = num_threads as u32;
    Weight::ALL.map(|w| (n * (3 - w.index() as u32) / 4).max(1))
}

fn run_worker(shared: Arc<ServiceShared>, index: usize) {
    let _span = tracing::debug_span!("grove-worker", index).entered();
    let mut queues = shared.queues.lock().unwrap();
    loop {
        let notified = shared.dispatch_ready_tasks(&mut queues);

        if queues.worker_list.is_empty() {
            if queues.num_working_tasks == 0 {
                shared.done_cv.notify_all();
            }
            if queues.shutting_down {
                break;
            }
            queues = shared.workers_cv.wait(queues).unwrap();
            continue;
        }

        for _ in 0..notified.saturating_sub(1) {
            shared.workers_cv.notify_one();
        }

        let (dispatch_weight, task) = queues
            .worker_list
            .pop_front()
            .expect("worker_list checked non-empty above");
        drop(queues);

        task.exec(dispatch_weight);

        queues = shared.queues.lock().unwrap();
        queues.num_active_workers[dispatch_weight.index()] -= 1;
        queues.num_working_tasks -= 1;
    }
}

/// Configures and constructs a [`Service`].
#[derive(Debug, Clone)]
pub struct ServiceBuilder {
    num_threads: usize,
}

impl ServiceBuilder {
    /// Start a builder targeting `num_threads` worker threads.
    #[must_use]
    pub fn new(num_threads: usize) -> Self {
        Self { num_threads }
    }

    /// Build and start the worker pool.
    #[must_use]
    pub fn build(self) -> Service {
        Service::new(self.num_threads)
    }
}

/// The scheduler: a fixed pool of worker threads draining three
/// weight-ordered ready queues. Construct with [`Service::new`], submit
/// root-level work with [`Service::topmost_task`] or [`Service::task`], and
/// call [`Service::wait_until_everything_is_done`] to block until every
/// submitted tree has finished.
///
/// Not `Clone`: a `Service` owns its worker threads outright and joins them
/// on drop, mirroring the single-owner lifetime of the scheduler it wraps.
/// Code running *inside* a task that wants to spawn more work reaches the
/// pool through [`Service::child_task`] and [`Service::current_task`]
/// instead of capturing a handle.
pub struct Service {
    shared: Arc<ServiceShared>,
    workers: Vec<JoinHandle<()>>,
}

impl Service {
    /// Start the pool. `num_threads` is the sizing parameter from which
    /// both the overload threshold and the per-weight worker shares are
    /// derived; the pool itself runs `num_threads * 3` OS threads. Passing
    /// `0` auto-detects available parallelism. Clamped to at least 1.
    #[must_use]
    pub fn new(num_threads: usize) -> Self {
        let num_threads = if num_threads == 0 {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        } else {
            num_threads
        };
        let overload_worker_limit = overload_limits(num_threads);
        let num_workers = num_threads * 3;

        let shared = Arc::new(ServiceShared {
            queues: StdMutex::new(ServiceQueues {
                ready: Default::default(),
                worker_list: VecDeque::new(),
                num_active_workers: [0; WEIGHT_COUNT],
                overload_worker_limit,
                num_working_tasks: 0,
                shutting_down: false,
                tasks: HashMap::new(),
            }),
            workers_cv: Condvar::new(),
            done_cv: Condvar::new(),
            num_threads,
        });

        let workers = (0..num_workers)
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("grove-worker-{index}"))
                    .spawn(move || run_worker(shared, index))
                    .expect("failed to spawn grove worker thread")
            })
            .collect();

        Service { shared, workers }
    }

    /// Give internal collaborators (`Mutex`) a handle to the same shared
    /// scheduler state this `Service` owns.
    pub(crate) fn shared_handle(&self) -> Arc<ServiceShared> {
        Arc::clone(&self.shared)
    }

    /// The sizing parameter passed to [`Service::new`] (after auto-detect),
    /// from which the overload threshold and per-weight shares are derived.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.shared.num_threads
    }

    /// Number of OS worker threads actually running (`num_threads() * 3`).
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Whether the service has begun (or finished) shutting down.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// Submit a root-level task with no parent.
    #[must_use]
    pub fn topmost_task(
        &self,
        weight: Weight,
        f: impl FnOnce() + Send + 'static,
    ) -> TaskBuilder {
        TaskBuilder::new(Arc::clone(&self.shared), None, weight, Box::new(f))
    }

    /// Submit a task, auto-parenting to whatever task is currently running
    /// on this thread; if none is, behaves exactly like
    /// [`Service::topmost_task`].
    #[must_use]
    pub fn task(&self, weight: Weight, f: impl FnOnce() + Send + 'static) -> TaskBuilder {
        match current_task_handle() {
            Some(parent) => {
                TaskBuilder::new(Arc::clone(&self.shared), Some(parent.inner), weight, Box::new(f))
            }
            None => self.topmost_task(weight, f),
        }
    }

    /// Submit a task parented to the task currently running on this
    /// thread. Must be called from inside a running task's closure.
    ///
    /// # Errors
    ///
    /// Returns [`GroveError::NoCurrentTask`] if this thread is not
    /// currently executing a task.
    pub fn child_task(
        weight: Weight,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<TaskBuilder, GroveError> {
        let parent = require_current_task()?;
        let shared = Arc::clone(&parent.shared);
        Ok(TaskBuilder::new(shared, Some(parent), weight, Box::new(f)))
    }

    /// The task currently running on this thread, if any.
    #[must_use]
    pub fn current_task() -> Option<TaskHandle> {
        current_task_handle()
    }

    /// Block until every submitted tree has reached `Done` and the pool is
    /// idle. Safe to call concurrently with more submissions (spurious
    /// wakeups just re-check the predicate).
    pub fn wait_until_everything_is_done(&self) {
        let queues = self.shared.queues.lock().unwrap();
        let _guard = self
            .shared
            .done_cv
            .wait_while(queues, |q| {
                !q.tasks.is_empty() || q.num_working_tasks > 0 || !q.worker_list.is_empty()
            })
            .unwrap();
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("num_threads", &self.shared.num_threads)
            .finish()
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        {
            let mut queues = self.shared.queues.lock().unwrap();
            queues.shutting_down = true;
        }
        self.shared.workers_cv.notify_all();

        for handle in self.workers.drain(..) {
            if let Err(err) = handle.join() {
                tracing::error!("grove worker thread panicked during shutdown: {:?}", err);
            }
        }

        // Drain anything still queued-but-not-started: drop the
        // keepalive without firing any callback, matching the contract
        // that only tasks which actually ran (or were explicitly
        // interrupt-cascaded) fire `interrupted`/`finished`.
        let mut queues = self.shared.queues.lock().unwrap();
        queues.tasks.clear();
        for q in &mut queues.ready {
            q.clear();
        }
        queues.worker_list.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    #[serial_test::serial]
    fn weight_fairness_does_not_starve_any_class() {
        let service = Service::new(3);
        let counts = Arc::new([
            AtomicUsize::new(0),
            AtomicUsize::new(0),
            AtomicUsize::new(0),
        ]);

        for _ in 0..30 {
            for &(weight, idx) in &[(Weight::Light, 0), (Weight::Middle, 1), (Weight::Heavy, 2)] {
                let counts = counts.clone();
                service
                    .topmost_task(weight, move || {
                        counts[idx].fetch_add(1, Ordering::SeqCst);
                    })
                    .start().unwrap();
            }
        }

        service.wait_until_everything_is_done();

        for c in counts.iter() {
            assert_eq!(c.load(Ordering::SeqCst), 30);
        }
    }

    #[test]
    #[serial_test::serial]
    fn idle_barrier_waits_for_nested_children() {
        let service = Service::new(4);
        let order = Arc::new(StdMutex::new(Vec::new()));

        let o = order.clone();
        service
            .topmost_task(Weight::Light, move || {
                let o2 = o.clone();
                Service::child_task(Weight::Middle, move || {
                    o2.lock().unwrap().push("child");
                })
                .unwrap()
                .start().unwrap();
                o.lock().unwrap().push("parent");
            })
            .start().unwrap();

        service.wait_until_everything_is_done();

        let order = order.lock().unwrap();
        assert_eq!(order.len(), 2);
        assert!(order.contains(&"parent"));
        assert!(order.contains(&"child"));
    }
}
