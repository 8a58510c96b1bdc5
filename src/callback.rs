//! The callback bundle a task carries: up to three optional, chainable
//! thunks fired at most once each, per `spec.md` §2/§4.1.

/// A boxed, one-shot, thread-mobile thunk.
pub type Thunk = Box<dyn FnOnce() + Send + 'static>;

/// Which slot a callback was registered against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackKind {
    /// Fires when the task's closure ran to completion without interruption.
    Succeeded,
    /// Fires when the task ended interrupted, instead of `Succeeded`.
    Interrupted,
    /// Always fires once, after `Succeeded` or `Interrupted`.
    Finished,
}

/// Holds the three callback slots for one task. Each slot is a chain of
/// thunks appended in registration order — the dynamic/chaining form from
/// `spec.md` — and the typed builder form (`TaskBuilder::succeeded` etc.)
/// is just sugar for appending a single thunk.
#[derive(Default)]
pub struct Callbacks {
    succeeded: Vec<Thunk>,
    interrupted: Vec<Thunk>,
    finished: Vec<Thunk>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("succeeded", &self.succeeded.len())
            .field("interrupted", &self.interrupted.len())
            .field("finished", &self.finished.len())
            .finish()
    }
}

impl Callbacks {
    /// Append a thunk to the given slot.
    pub fn push(&mut self, kind: CallbackKind, thunk: Thunk) {
        match kind {
            CallbackKind::Succeeded => self.succeeded.push(thunk),
            CallbackKind::Interrupted => self.interrupted.push(thunk),
            CallbackKind::Finished => self.finished.push(thunk),
        }
    }

    /// Whether the `interrupted` slot has at least one registered thunk.
    /// Used by the completion protocol to decide whether an interrupted
    /// task traps its own interruption or propagates it to its parent.
    #[must_use]
    pub fn has_interrupted_handler(&self) -> bool {
        !self.interrupted.is_empty()
    }

    /// Run every thunk registered for `kind`, in registration order.
    pub fn fire(&mut self, kind: CallbackKind) {
        let chain = match kind {
            CallbackKind::Succeeded => std::mem::take(&mut self.succeeded),
            CallbackKind::Interrupted => std::mem::take(&mut self.interrupted),
            CallbackKind::Finished => std::mem::take(&mut self.finished),
        };
        for thunk in chain {
            thunk();
        }
    }
}
