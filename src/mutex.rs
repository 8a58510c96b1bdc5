//! Shared/exclusive admission queue atop the task engine. See `spec.md`
//! §4.3: batches shared readers, serialises writers, never lets a new
//! reader overtake a writer already queued.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex as StdMutex};

use crate::error::GroveError;
use crate::service::{Service, ServiceShared};
use crate::task::{current_task_handle, require_current_task, TaskBuilder, TaskInner};
use crate::weight::Weight;

struct QueuedTask {
    task: Arc<TaskInner>,
    parent: Option<Arc<TaskInner>>,
    weight: Weight,
    wants_shared: bool,
}

struct MutexState {
    queue: VecDeque<QueuedTask>,
    shared_in_progress: bool,
    num_to_be_finished: u32,
}

pub(crate) struct MutexInner {
    service: Arc<ServiceShared>,
    state: StdMutex<MutexState>,
    destroy_cv: Condvar,
}

impl MutexInner {
    /// Admission policy (§4.3): admit immediately if idle, or if the
    /// requester is a reader joining an in-progress reader batch with
    /// nobody already queued behind it; otherwise queue.
    ///
    /// The parent's child-slot is reserved (`notify_deferred_task`) at
    /// queue time regardless of whether admission happens now or later, so
    /// the parent never observes "no children outstanding" prematurely.
    pub(crate) fn admit_or_queue(
        self: &Arc<Self>,
        task: Arc<TaskInner>,
        parent: Option<Arc<TaskInner>>,
        weight: Weight,
        wants_shared: bool,
    ) {
        task.attach_mutex(Arc::clone(self));

        let admitted = {
            let mut state = self.state.lock().unwrap();
            let can_start = state.num_to_be_finished == 0
                || (wants_shared && state.shared_in_progress && state.queue.is_empty());
            if can_start {
                state.num_to_be_finished += 1;
                state.shared_in_progress = wants_shared;
            } else {
                if let Some(parent) = &parent {
                    parent.notify_deferred_task();
                }
                state.queue.push_back(QueuedTask {
                    task: Arc::clone(&task),
                    parent: parent.clone(),
                    weight,
                    wants_shared,
                });
            }
            can_start
        };

        if admitted {
            match parent {
                Some(parent) => parent.add_child_task(weight, task),
                None => self.service.add_to_queue(weight, task),
            }
        }
    }

    /// Called by a task's completion protocol when it was admitted through
    /// this mutex. Decrements the holder count, then admits as many queued
    /// waiters as the policy allows, forwarding each straight into the
    /// scheduler — matching the source, this happens while still holding
    /// the mutex's own lock (Mutex-before-Task/Service is the declared
    /// ordering, so this is not a lock-inversion risk).
    pub(crate) fn task_finished(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            state.num_to_be_finished -= 1;

            loop {
                let can_start = match state.queue.front() {
                    Some(front) => {
                        state.num_to_be_finished == 0
                            || (front.wants_shared && state.shared_in_progress)
                    }
                    None => false,
                };
                if !can_start {
                    break;
                }
                let entry = state.queue.pop_front().expect("checked Some above");
                state.shared_in_progress = entry.wants_shared;
                state.num_to_be_finished += 1;

                match entry.parent {
                    Some(parent) => parent.add_deferred_task(entry.weight, entry.task),
                    None => self.service.add_to_queue(entry.weight, entry.task),
                }
            }
        }
        self.destroy_cv.notify_one();
    }
}

/// An ordered shared/exclusive admission queue layered on top of a
/// [`Service`]'s task engine: readers (`shared_*` entry points) batch
/// together; a writer (the plain entry points) runs alone, and is never
/// overtaken by a reader that arrives after it has queued.
///
/// Dropping a `Mutex` blocks until every task it admitted has finished.
pub struct Mutex {
    inner: Arc<MutexInner>,
}

impl Mutex {
    /// Attach a new mutex to `service`.
    #[must_use]
    pub fn new(service: &Service) -> Self {
        Mutex {
            inner: Arc::new(MutexInner {
                service: service.shared_handle(),
                state: StdMutex::new(MutexState {
                    queue: VecDeque::new(),
                    shared_in_progress: false,
                    num_to_be_finished: 0,
                }),
                destroy_cv: Condvar::new(),
            }),
        }
    }

    fn builder(
        &self,
        parent: Option<Arc<TaskInner>>,
        weight: Weight,
        f: impl FnOnce() + Send + 'static,
        wants_shared: bool,
    ) -> TaskBuilder {
        let shared = Arc::clone(&self.inner.service);
        TaskBuilder::new(shared, parent, weight, Box::new(f))
            .with_mutex_admission(Arc::clone(&self.inner), wants_shared)
    }

    /// Exclusive, root-level task: runs alone, no parent.
    #[must_use]
    pub fn root_task(&self, weight: Weight, f: impl FnOnce() + Send + 'static) -> TaskBuilder {
        self.builder(None, weight, f, false)
    }

    /// Exclusive task, auto-parented to whatever is currently running.
    #[must_use]
    pub fn task(&self, weight: Weight, f: impl FnOnce() + Send + 'static) -> TaskBuilder {
        self.builder(current_task_handle().map(|h| h.inner), weight, f, false)
    }

    /// Exclusive task parented to the currently running task.
    ///
    /// # Errors
    ///
    /// Returns [`GroveError::NoCurrentTask`] off a worker thread.
    pub fn child_task(
        &self,
        weight: Weight,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<TaskBuilder, GroveError> {
        Ok(self.builder(Some(require_current_task()?), weight, f, false))
    }

    /// Shared (reader) root-level task.
    #[must_use]
    pub fn shared_root_task(
        &self,
        weight: Weight,
        f: impl FnOnce() + Send + 'static,
    ) -> TaskBuilder {
        self.builder(None, weight, f, true)
    }

    /// Shared (reader) task, auto-parented to whatever is currently
    /// running.
    #[must_use]
    pub fn shared_task(&self, weight: Weight, f: impl FnOnce() + Send + 'static) -> TaskBuilder {
        self.builder(current_task_handle().map(|h| h.inner), weight, f, true)
    }

    /// Shared (reader) task parented to the currently running task.
    ///
    /// # Errors
    ///
    /// Returns [`GroveError::NoCurrentTask`] off a worker thread.
    pub fn shared_child_task(
        &self,
        weight: Weight,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<TaskBuilder, GroveError> {
        Ok(self.builder(Some(require_current_task()?), weight, f, true))
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Mutex")
            .field("num_to_be_finished", &state.num_to_be_finished)
            .field("queued", &state.queue.len())
            .field("shared_in_progress", &state.shared_in_progress)
            .finish()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().unwrap();
        while state.num_to_be_finished != 0 {
            state = self.inner.destroy_cv.wait(state).unwrap();
        }
    }
}
