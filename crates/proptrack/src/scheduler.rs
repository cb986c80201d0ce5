#![forbid(unsafe_code)]

//! Microtask-coalesced update scheduling.
//!
//! [`request_update`] arranges for an instance's update hooks to run once,
//! after the current synchronous work, no matter how many times it is called
//! before that. Deferred work lives in a [`MicrotaskQueue`] that the embedder
//! drains between synchronous work units via
//! [`Runtime::run_microtasks`](crate::Runtime::run_microtasks).
//!
//! # Coalescing Rules
//!
//! - An instance holds at most one flush token. While it is held, further
//!   requests are no-ops.
//! - The scheduled task releases the token **before** running the hooks, so a
//!   request made from inside a hook schedules a new, separate cycle.
//! - An instance whose type lineage has no update hook ignores requests.
//!
//! # Hook Composition
//!
//! [`on_update`] appends a hook to a type. An instance runs the hooks of its
//! whole lineage, root ancestor first, each type's hooks in installation
//! order.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::error::{ReactiveError, Result};
use crate::hierarchy::TypeKey;
use crate::instance::Instance;
use crate::runtime::{Runtime, Value};

/// Hook run when an instance's scheduled update fires.
pub type UpdateHook<V> = Rc<dyn Fn(&Instance<V>) -> Result<()>>;

type Microtask = Box<dyn FnOnce() -> Result<()>>;

// ---------------------------------------------------------------------------
// MicrotaskQueue
// ---------------------------------------------------------------------------

/// FIFO of deferred tasks.
///
/// Cloning yields a handle to the same queue.
#[derive(Clone, Default)]
pub struct MicrotaskQueue {
    tasks: Rc<RefCell<VecDeque<Microtask>>>,
}

impl fmt::Debug for MicrotaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicrotaskQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl MicrotaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, task: impl FnOnce() -> Result<()> + 'static) {
        self.tasks.borrow_mut().push_back(Box::new(task));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Run the oldest task, if any.
    pub fn run_next(&self) -> Option<Result<()>> {
        let task = self.tasks.borrow_mut().pop_front()?;
        Some(task())
    }

    /// Run tasks until the queue is empty, `limit` tasks have run with more
    /// still queued, or a task fails.
    pub fn drain(&self, limit: Option<usize>) -> Result<usize> {
        let mut ran = 0usize;
        loop {
            if let Some(limit) = limit
                && ran >= limit
                && !self.is_empty()
            {
                return Err(ReactiveError::DrainLimitExceeded { limit });
            }
            let Some(result) = self.run_next() else {
                break;
            };
            ran += 1;
            result?;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(message = "scheduler.drain", ran);

        Ok(ran)
    }
}

// ---------------------------------------------------------------------------
// Update hooks
// ---------------------------------------------------------------------------

/// Append an update hook to `ty`.
pub fn on_update<V: Value>(
    runtime: &Runtime<V>,
    ty: TypeKey,
    hook: impl Fn(&Instance<V>) -> Result<()> + 'static,
) -> Result<()> {
    runtime.with_tables_mut(ty, |tables| tables.update_hooks.push(Rc::new(hook)))
}

/// Hooks run for instances of `ty`, in invocation order.
#[must_use]
pub fn update_hooks<V: Value>(runtime: &Runtime<V>, ty: TypeKey) -> Vec<UpdateHook<V>> {
    runtime.root_first(ty, |tables, out| {
        out.extend(tables.update_hooks.iter().cloned());
    })
}

/// Whether instances of `ty` have anything to run on update.
#[must_use]
pub fn has_update_hook<V: Value>(runtime: &Runtime<V>, ty: TypeKey) -> bool {
    runtime
        .most_specific(ty, |tables| (!tables.update_hooks.is_empty()).then_some(()))
        .is_some()
}

/// Schedule one deferred run of the instance's update hooks.
pub fn request_update<V: Value>(instance: &Instance<V>) {
    let runtime = instance.runtime();
    if !has_update_hook(runtime, instance.type_key()) {
        #[cfg(feature = "tracing")]
        tracing::trace!(message = "scheduler.dormant", instance = %instance.id());
        return;
    }
    if !instance.acquire_update_token() {
        #[cfg(feature = "tracing")]
        tracing::trace!(message = "scheduler.coalesced", instance = %instance.id());
        return;
    }

    #[cfg(feature = "tracing")]
    tracing::trace!(message = "scheduler.scheduled", instance = %instance.id());

    let target = instance.clone();
    runtime.queue().enqueue(move || {
        target.release_update_token();
        run_update_hooks(&target)
    });
}

/// Run the instance's update hooks now, stopping at the first error.
pub fn run_update_hooks<V: Value>(instance: &Instance<V>) -> Result<()> {
    for hook in update_hooks(instance.runtime(), instance.type_key()) {
        hook(instance)?;
    }
    Ok(())
}
