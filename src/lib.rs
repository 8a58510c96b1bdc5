//! `grove` is a hierarchical task scheduler for in-process parallelism.
//!
//! Clients submit work as closures grouped into parent/child trees. A fixed
//! pool of worker threads runs them while preserving tree-level lifecycle
//! semantics: a parent is only "done" once every descendant is done,
//! interruption is cooperative and cascades down a subtree, and a three-tier
//! weight ladder (`Light` / `Middle` / `Heavy`) keeps the pool fair under
//! overload. [`Mutex`] is a companion shared/exclusive lock that queues
//! admission atop the same task engine.
//!
//! The three cooperating pieces are [`Service`] (worker pool, per-weight
//! ready queues, idle barrier), the task lifecycle reached through
//! [`TaskBuilder`] and observed through [`TaskHandle`] (created, running,
//! waiting for children, done) and [`Mutex`] (reader/writer admission).
//!
//! ```no_run
//! use grove::{Service, Weight};
//!
//! let service = Service::new(4);
//! service
//!     .topmost_task(Weight::Light, || println!("hello from a task"))
//!     .succeeded(|| println!("done"))
//!     .start().unwrap();
//! service.wait_until_everything_is_done();
//! ```

mod callback;
mod error;
mod mutex;
mod service;
mod task;
mod weight;

pub use callback::Callbacks;
pub use error::GroveError;
pub use mutex::Mutex;
pub use service::{Service, ServiceBuilder};
pub use task::{TaskBuilder, TaskHandle, TaskId, WeakTaskHandle};
pub use weight::{Weight, WEIGHT_COUNT};
