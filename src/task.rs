//! Task lifecycle: creation, dispatch, interruption, and the completion
//! protocol that ties a tree of tasks together. See `spec.md` §3/§4.1.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use crate::callback::{CallbackKind, Callbacks, Thunk};
use crate::error::GroveError;
use crate::mutex::MutexInner;
use crate::service::ServiceShared;
use crate::weight::{Weight, WEIGHT_COUNT};

/// Stable identifier for a task, assigned at `start()` and never reused.
pub type TaskId = u64;

fn next_task_id() -> TaskId {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

thread_local! {
    /// The task this worker thread is currently executing, if any. Set
    /// before a closure runs, restored to the parent once it finishes — the
    /// mechanism behind auto-parenting and `Service::current_task`.
    static CURRENT_TASK: RefCell<Option<Weak<TaskInner>>> = const { RefCell::new(None) };
}

pub(crate) fn current_task_weak() -> Option<Weak<TaskInner>> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Created,
    Working,
    WaitForChildren,
    Done,
}

pub(crate) struct TaskState {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) work_fn: Option<Thunk>,
    pub(crate) callbacks: Callbacks,
    pub(crate) num_children_to_complete: u32,
    pub(crate) child_buffers: [VecDeque<Arc<TaskInner>>; WEIGHT_COUNT],
    pub(crate) mutex_link: Option<Arc<MutexInner>>,
}

/// The shared, heap-allocated task record. Never exposed directly; clients
/// see [`TaskHandle`] / [`WeakTaskHandle`].
///
/// This is the redesign called for in `spec.md` §9: there is no intrusive
/// `next` pointer and no raw self-pointer. The task's "self-keepalive" is a
/// strong `Arc` held in the owning [`crate::Service`]'s task table, inserted
/// at `start()` and removed once finalisation completes; `parent` is a
/// `Weak` reference, never an ownership edge, consistent with the data
/// model's invariant that a child never keeps its parent alive.
pub struct TaskInner {
    pub(crate) id: TaskId,
    pub(crate) weight: Weight,
    pub(crate) shared: Arc<ServiceShared>,
    pub(crate) parent: Option<Weak<TaskInner>>,
    pub(crate) self_weak: Weak<TaskInner>,
    pub(crate) interrupted: AtomicBool,
    pub(crate) state: StdMutex<TaskState>,
}

enum Action {
    AlreadyDone,
    FinalizeCreatedInterrupted,
    MarkerInterrupted {
        drained: Vec<Arc<TaskInner>>,
        finalize_now: bool,
    },
    MarkerDispatch { child: Arc<TaskInner>, requeue: bool },
    RunClosure(Thunk),
}

impl TaskInner {
    /// Cooperative interruption. Sticky: once set, `is_interrupted` never
    /// reports false again.
    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// True if this task or any ancestor has been interrupted. The result
    /// is memoised locally once observed true, since both this flag and
    /// the ancestor's are monotonic.
    pub(crate) fn is_interrupted(&self) -> bool {
        if self.interrupted.load(Ordering::Acquire) {
            return true;
        }
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            if parent.is_interrupted() {
                self.interrupted.store(true, Ordering::Release);
                return true;
            }
        }
        false
    }

    /// Attach a child already accounted for (`numChildrenToComplete`
    /// incremented here). Enqueues this task as the Service-ready-queue
    /// marker for `weight` the first time that weight's buffer goes from
    /// empty to non-empty.
    pub(crate) fn add_child_task(self: &Arc<Self>, weight: Weight, child: Arc<TaskInner>) {
        let needs_marker = {
            let mut guard = self.state.lock().unwrap();
            debug_assert!(matches!(
                guard.lifecycle,
                Lifecycle::Working | Lifecycle::WaitForChildren
            ));
            guard.num_children_to_complete += 1;
            Self::buffer_push(&mut guard, weight, child)
        };
        if needs_marker {
            self.shared.add_to_queue(weight, Arc::clone(self));
        }
    }

    /// Attach a child whose slot in `numChildrenToComplete` was already
    /// reserved by an earlier `notify_deferred_task` call (the mutex
    /// deferred-admission path — see `spec.md` §4.1 "Deferred children").
    pub(crate) fn add_deferred_task(self: &Arc<Self>, weight: Weight, child: Arc<TaskInner>) {
        let needs_marker = {
            let mut guard = self.state.lock().unwrap();
            Self::buffer_push(&mut guard, weight, child)
        };
        if needs_marker {
            self.shared.add_to_queue(weight, Arc::clone(self));
        }
    }

    /// Reserve a child slot without attaching a child yet — used when a
    /// mutex holds a child back from its buffer so the parent cannot
    /// prematurely observe zero outstanding children.
    pub(crate) fn notify_deferred_task(&self) {
        let mut guard = self.state.lock().unwrap();
        debug_assert!(matches!(
            guard.lifecycle,
            Lifecycle::Working | Lifecycle::WaitForChildren
        ));
        guard.num_children_to_complete += 1;
    }

    fn buffer_push(guard: &mut TaskState, weight: Weight, child: Arc<TaskInner>) -> bool {
        let idx = weight.index();
        let was_empty = guard.child_buffers[idx].is_empty();
        guard.child_buffers[idx].push_back(child);
        was_empty
    }

    /// Set (or chain) the mutex this task was admitted through, so
    /// finalisation can notify it.
    pub(crate) fn attach_mutex(&self, mutex: Arc<MutexInner>) {
        self.state.lock().unwrap().mutex_link = Some(mutex);
    }

    /// Run this task, or — if it is already past `Created` — act as the
    /// marker that shepherds one of its buffered children onto a worker.
    /// `dispatch_weight` is the weight of the ready queue this entry was
    /// popped from (not necessarily `self.weight`, when acting as marker).
    pub(crate) fn exec(self: &Arc<Self>, dispatch_weight: Weight) {
        let action = {
            let mut guard = self.state.lock().unwrap();
            match guard.lifecycle {
                Lifecycle::Done => Action::AlreadyDone,
                Lifecycle::Created => {
                    if self.is_interrupted() {
                        Action::FinalizeCreatedInterrupted
                    } else {
                        guard.lifecycle = Lifecycle::Working;
                        let work_fn = guard
                            .work_fn
                            .take()
                            .expect("Created task always carries a work_fn");
                        Action::RunClosure(work_fn)
                    }
                }
                Lifecycle::Working | Lifecycle::WaitForChildren => {
                    if self.is_interrupted() {
                        let drained = Self::take_buffered_children(&mut guard);
                        let finalize_now = guard.lifecycle == Lifecycle::WaitForChildren
                            && guard.num_children_to_complete == 0;
                        Action::MarkerInterrupted {
                            drained,
                            finalize_now,
                        }
                    } else {
                        let idx = dispatch_weight.index();
                        let child = guard.child_buffers[idx]
                            .pop_front()
                            .expect("marker implies a non-empty buffer for its own weight");
                        let requeue = !guard.child_buffers[idx].is_empty();
                        Action::MarkerDispatch { child, requeue }
                    }
                }
            }
        };

        match action {
            Action::AlreadyDone => {
                // A stray marker for a weight this task already finished
                // dispatching through another marker's cascade. Harmless.
                tracing::trace!(task_id = self.id, "ignoring marker pop on a finished task");
            }
            Action::FinalizeCreatedInterrupted => self.finalize(),
            Action::MarkerInterrupted {
                drained,
                finalize_now,
            } => {
                // `drained`'s children are force-finished here, with the
                // parent's `TaskState` lock already released (it was only
                // held long enough to move them out of their buffers and
                // adjust the counter) — `force_interrupt_finalize` re-enters
                // the Service and, for mutex-admitted children, a Mutex, so
                // it must never run while a Task lock is held (§5).
                for child in drained {
                    child.force_interrupt_finalize();
                }
                if finalize_now {
                    self.finalize();
                }
            }
            Action::MarkerDispatch { child, requeue } => {
                if requeue {
                    self.shared.add_to_queue(dispatch_weight, Arc::clone(self));
                }
                child.exec(dispatch_weight);
            }
            Action::RunClosure(work_fn) => self.run_closure(work_fn),
        }
    }

    fn run_closure(self: &Arc<Self>, work_fn: Thunk) {
        CURRENT_TASK.with(|c| *c.borrow_mut() = Some(self.self_weak.clone()));
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(work_fn));
        CURRENT_TASK.with(|c| *c.borrow_mut() = self.parent.clone());

        if let Err(payload) = outcome {
            tracing::error!(
                task_id = self.id,
                "task closure panicked, finalising as interrupted"
            );
            drop(payload);
            self.interrupt();
        }

        let done = {
            let mut guard = self.state.lock().unwrap();
            guard.lifecycle = Lifecycle::WaitForChildren;
            guard.num_children_to_complete == 0
        };
        if done {
            self.finalize();
        }
    }

    /// Interrupt cascade over not-yet-started children (§4.1): move every
    /// child still sitting in a weight buffer out into a plain `Vec` and
    /// walk the counter down to match, all under the lock already held by
    /// `exec`. Pure bookkeeping — no callbacks fire and no other lock is
    /// touched here. The caller force-finishes each returned child only
    /// after releasing the parent's `TaskState` lock (§5: a Task lock must
    /// never be held while re-entering the Service or a Mutex).
    fn take_buffered_children(guard: &mut TaskState) -> Vec<Arc<TaskInner>> {
        let mut drained = Vec::new();
        for buf in &mut guard.child_buffers {
            drained.extend(buf.drain(..));
        }
        guard.num_children_to_complete -= drained.len() as u32;
        drained
    }

    /// Finalise a child that is cascading to Done without ever having run,
    /// because its parent was interrupted while the child still sat in a
    /// buffer. Does not touch the parent's counter — `take_buffered_children`
    /// already walked it down under the parent's lock before this runs, with
    /// that lock released; this method's own Service/Mutex re-entry is what
    /// the release makes safe.
    fn force_interrupt_finalize(self: &Arc<Self>) {
        let (mut callbacks, mutex_link) = {
            let mut guard = self.state.lock().unwrap();
            debug_assert_eq!(guard.lifecycle, Lifecycle::Created);
            guard.lifecycle = Lifecycle::Done;
            (std::mem::take(&mut guard.callbacks), guard.mutex_link.take())
        };
        self.interrupted.store(true, Ordering::Release);

        callbacks.fire(CallbackKind::Interrupted);
        callbacks.fire(CallbackKind::Finished);

        if let Some(mutex) = mutex_link {
            mutex.task_finished();
        }

        self.shared.remove_keepalive(self.id);
    }

    /// The completion protocol (§4.1 "Completion protocol"): runs exactly
    /// once per task, transitioning it to `Done`, firing its callbacks,
    /// notifying its mutex and parent, and dropping its self-keepalive.
    fn finalize(self: &Arc<Self>) {
        {
            let mut guard = self.state.lock().unwrap();
            debug_assert!(guard.lifecycle != Lifecycle::Done);
            guard.lifecycle = Lifecycle::Done;
        }

        CURRENT_TASK.with(|c| *c.borrow_mut() = self.parent.clone());

        let interrupted = self.is_interrupted();

        let (mut callbacks, mutex_link) = {
            let mut guard = self.state.lock().unwrap();
            (
                std::mem::take(&mut guard.callbacks),
                guard.mutex_link.take(),
            )
        };

        if interrupted {
            if callbacks.has_interrupted_handler() {
                callbacks.fire(CallbackKind::Interrupted);
            } else if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
                parent.interrupt();
            }
        } else {
            callbacks.fire(CallbackKind::Succeeded);
        }
        callbacks.fire(CallbackKind::Finished);

        if let Some(mutex) = mutex_link {
            mutex.task_finished();
        }

        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.notify_child_finished();
        }

        self.shared.remove_keepalive(self.id);
    }

    /// A child notifying its parent that it has reached `Done`. If the
    /// parent is waiting on children and this was the last one, the
    /// parent finalises too.
    fn notify_child_finished(self: &Arc<Self>) {
        let should_finalize = {
            let mut guard = self.state.lock().unwrap();
            debug_assert!(guard.lifecycle != Lifecycle::Created);
            debug_assert!(guard.num_children_to_complete > 0);
            guard.num_children_to_complete -= 1;
            guard.lifecycle == Lifecycle::WaitForChildren && guard.num_children_to_complete == 0
        };
        if should_finalize {
            self.finalize();
        }
    }
}

/// A strong, owning reference to a running or queued task. Returned from
/// [`TaskBuilder::start`]. Dropping it does not cancel or free the task —
/// the task's self-keepalive (held by the owning `Service`) keeps it alive
/// until its final callback fires; this handle is purely for observing and
/// interrupting it.
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) inner: Arc<TaskInner>,
}

impl TaskHandle {
    /// This task's stable id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// This task's weight class.
    #[must_use]
    pub fn weight(&self) -> Weight {
        self.inner.weight
    }

    /// Request cooperative interruption. Idempotent, non-blocking; the
    /// task's closure must poll [`TaskHandle::is_interrupted`] to actually
    /// stop.
    pub fn interrupt(&self) {
        self.inner.interrupt();
    }

    /// Whether this task or any ancestor has been interrupted.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.inner.is_interrupted()
    }

    /// A non-owning reference to the same task.
    #[must_use]
    pub fn downgrade(&self) -> WeakTaskHandle {
        WeakTaskHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("weight", &self.inner.weight)
            .finish()
    }
}

/// A non-owning reference to a task, for callers that must not keep it
/// alive on their own (e.g. a parent link).
#[derive(Clone, Debug)]
pub struct WeakTaskHandle {
    pub(crate) inner: Weak<TaskInner>,
}

impl WeakTaskHandle {
    /// Attempt to obtain a strong [`TaskHandle`], if the task hasn't
    /// finished (and been removed from the owning service's keepalive
    /// table) yet.
    #[must_use]
    pub fn upgrade(&self) -> Option<TaskHandle> {
        self.inner.upgrade().map(|inner| TaskHandle { inner })
    }
}

/// Fluent builder for a not-yet-started task, returned by
/// [`crate::Service::topmost_task`], [`crate::Service::task`],
/// [`crate::Service::child_task`], and their `Mutex` counterparts.
pub struct TaskBuilder {
    shared: Arc<ServiceShared>,
    parent: Option<Arc<TaskInner>>,
    weight: Weight,
    work_fn: Thunk,
    callbacks: Callbacks,
    mutex_admission: Option<(Arc<MutexInner>, bool)>,
}

impl TaskBuilder {
    pub(crate) fn new(
        shared: Arc<ServiceShared>,
        parent: Option<Arc<TaskInner>>,
        weight: Weight,
        work_fn: Thunk,
    ) -> Self {
        Self {
            shared,
            parent,
            weight,
            work_fn,
            callbacks: Callbacks::default(),
            mutex_admission: None,
        }
    }

    pub(crate) fn with_mutex_admission(mut self, mutex: Arc<MutexInner>, shared: bool) -> Self {
        self.mutex_admission = Some((mutex, shared));
        self
    }

    /// Register a thunk to run if the task completes without being
    /// interrupted. Chainable: each call appends another thunk.
    #[must_use]
    pub fn succeeded(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.callbacks.push(CallbackKind::Succeeded, Box::new(f));
        self
    }

    /// Register a thunk to run if the task ends interrupted instead of
    /// succeeding. Chainable.
    #[must_use]
    pub fn interrupted(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.callbacks.push(CallbackKind::Interrupted, Box::new(f));
        self
    }

    /// Register a thunk that always runs once, after `succeeded` or
    /// `interrupted`. Chainable.
    #[must_use]
    pub fn finished(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.callbacks.push(CallbackKind::Finished, Box::new(f));
        self
    }

    /// Submit the task for execution. At-most-once by construction — the
    /// builder is consumed.
    ///
    /// # Errors
    ///
    /// Returns [`GroveError::ServiceShuttingDown`] if the owning `Service`
    /// has already begun shutting down; the task is not created.
    pub fn start(self) -> Result<TaskHandle, GroveError> {
        let TaskBuilder {
            shared,
            parent,
            weight,
            work_fn,
            callbacks,
            mutex_admission,
        } = self;

        if shared.is_shutting_down() {
            return Err(GroveError::ServiceShuttingDown);
        }

        let id = next_task_id();
        let parent_weak = parent.as_ref().map(Arc::downgrade);

        let task = Arc::new_cyclic(|self_weak| TaskInner {
            id,
            weight,
            shared: Arc::clone(&shared),
            parent: parent_weak,
            self_weak: self_weak.clone(),
            interrupted: AtomicBool::new(false),
            state: StdMutex::new(TaskState {
                lifecycle: Lifecycle::Created,
                work_fn: Some(work_fn),
                callbacks,
                num_children_to_complete: 0,
                child_buffers: Default::default(),
                mutex_link: None,
            }),
        });

        shared.insert_keepalive(id, Arc::clone(&task));

        match mutex_admission {
            Some((mutex, wants_shared)) => {
                mutex.admit_or_queue(Arc::clone(&task), parent, weight, wants_shared);
            }
            None => match parent {
                Some(parent) => parent.add_child_task(weight, Arc::clone(&task)),
                None => shared.add_to_queue(weight, Arc::clone(&task)),
            },
        }

        Ok(TaskHandle { inner: task })
    }
}

impl std::fmt::Debug for TaskBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskBuilder")
            .field("weight", &self.weight)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

/// Resolve the current worker's running task, if any, as an owning handle —
/// used for auto-parenting (`Service::task`) and `Service::child_task`.
pub(crate) fn current_task_handle() -> Option<TaskHandle> {
    current_task_weak().and_then(|weak| weak.upgrade()).map(|inner| TaskHandle { inner })
}

/// Resolve the current worker's running task as the `Arc` needed to attach
/// a child. Returns [`GroveError::NoCurrentTask`] if called off a worker.
pub(crate) fn require_current_task() -> Result<Arc<TaskInner>, GroveError> {
    current_task_weak()
        .and_then(|weak| weak.upgrade())
        .ok_or(GroveError::NoCurrentTask)
}
