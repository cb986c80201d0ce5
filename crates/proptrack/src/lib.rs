#![forbid(unsafe_code)]

//! Property-change tracking and batched update scheduling.
//!
//! This crate lets declared types observe writes to their properties and
//! react to them once per turn instead of once per write:
//!
//! - [`observe_property`]: wraps a property with an intercepting get/set
//!   pair that reports every assignment.
//! - [`on_property_change`]: batches writes per instance and delivers each
//!   property's net change to its callback chain after the next microtask
//!   boundary, skipping changes the property's detector rejects.
//! - [`request_update`] / [`on_update`]: coalesce any number of update
//!   requests for an instance into one deferred run of its update hooks.
//! - [`Pipeline`]: an isolated batching namespace delivering a whole
//!   [`ChangeSet`] per cycle, several of which may watch the same property.
//! - [`OncePerHierarchy`] / [`OncePerKeyPerHierarchy`]: install something at
//!   most once per inheritance chain.
//!
//! # Architecture
//!
//! Everything hangs off a [`Runtime<V>`], a single-threaded `Rc` handle that
//! owns the type hierarchy, the per-type tables and the [`MicrotaskQueue`].
//! The embedder drains the queue with [`Runtime::run_microtasks`] between
//! synchronous work units; that call is the only point at which batched
//! work runs.
//!
//! # Invariants
//!
//! 1. Within one cycle a change record keeps the value before the first
//!    write as `old_value` and the value after the last write as
//!    `new_value`.
//! 2. An instance has at most one flush scheduled at any time.
//! 3. Callback chains run ancestor callbacks first, then in registration
//!    order.
//! 4. A once-per-hierarchy operation applied to a type is never applied
//!    again to that type or its descendants.

/// Name of an observed property.
pub type PropertyKey = &'static str;

pub mod change;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod instance;
pub mod observe;
pub mod pipeline;
pub mod runtime;
pub mod scheduler;

pub use change::{
    ChangeCallback, ChangeDetector, ChangeRecord, ChangeSet, callback_chain, change_detector,
    flush, has_changed, on_property_change, record_pending_change, register_change_callback,
    register_change_detector,
};
pub use config::RuntimeConfig;
pub use error::{ReactiveError, Result};
pub use hierarchy::{
    Hierarchy, OncePerHierarchy, OncePerKeyPerHierarchy, OperationId, OperationRegistry, TypeKey,
};
pub use instance::{Instance, InstanceId, PendingKey};
pub use observe::{Accessor, observe_property};
pub use pipeline::{Pipeline, PipelineCallback, PipelineConfig};
pub use runtime::{Runtime, Value};
pub use scheduler::{MicrotaskQueue, UpdateHook, on_update, request_update, run_update_hooks};

/// Everything an embedding usually needs.
pub mod prelude {
    pub use crate::{
        Accessor, ChangeRecord, ChangeSet, Instance, Pipeline, PipelineConfig, PropertyKey,
        ReactiveError, Result, Runtime, RuntimeConfig, TypeKey, on_property_change, on_update,
        register_change_detector, request_update,
    };
}
