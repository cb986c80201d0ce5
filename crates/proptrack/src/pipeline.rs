#![forbid(unsafe_code)]

//! Update pipelines: independent batching namespaces.
//!
//! A [`Pipeline`] owns one pending-storage key and one update callback.
//! Properties registered with it record their writes into the pipeline's own
//! pending map on each instance, so several pipelines can watch the same
//! property and each receives its own [`ChangeSet`].
//!
//! # Design
//!
//! - Property registration is once per (type lineage, property) through
//!   [`OncePerKeyPerHierarchy`]; repeated registrations return the accessor
//!   installed the first time.
//! - The delivering update hook is installed once per lineage through
//!   [`OncePerHierarchy`]. It detaches the pipeline's map before calling the
//!   callback, so writes made by the callback open a fresh cycle.
//! - By default the callback sees the raw map, including records whose old
//!   and new values are equal. With [`PipelineConfig::detect_changes`] the
//!   pipeline sits on top of the change engine and only detector-approved
//!   records reach its map.
//!
//! # Failure Modes
//!
//! - **Callback error**: propagated out of the microtask drain. The map for
//!   that cycle is already detached and is dropped.
//! - **Registration on an unknown type**: [`ReactiveError::UnknownType`].

use std::fmt;
use std::rc::Rc;

use crate::PropertyKey;
use crate::change::{ChangeSet, on_property_change};
use crate::error::{ReactiveError, Result};
use crate::hierarchy::{OncePerHierarchy, OncePerKeyPerHierarchy, TypeKey};
use crate::instance::{Instance, PendingKey};
use crate::observe::{Accessor, observe_property};
use crate::runtime::{Runtime, Value};
use crate::scheduler::{self, on_update};

/// Receives an instance and the changes batched for it in one cycle.
pub type PipelineCallback<V> = Rc<dyn Fn(&Instance<V>, &ChangeSet<V>) -> Result<()>>;

/// Pipeline construction options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineConfig {
    /// Filter records through the registered change detectors before they
    /// reach the pipeline.
    /// Default: false (raw maps).
    pub detect_changes: bool,
}

impl PipelineConfig {
    #[must_use]
    pub fn with_detect_changes(mut self, detect: bool) -> Self {
        self.detect_changes = detect;
        self
    }
}

struct PipelineInner<V> {
    runtime: Runtime<V>,
    key: PendingKey,
    config: PipelineConfig,
    install_hook: OncePerHierarchy<Runtime<V>, Result<()>>,
    register: OncePerKeyPerHierarchy<PropertyKey, Runtime<V>, Result<Accessor<V>>>,
}

/// Handle to an update pipeline. Clones share the same namespace.
pub struct Pipeline<V> {
    inner: Rc<PipelineInner<V>>,
}

impl<V> Clone for Pipeline<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for Pipeline<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("key", &self.inner.key)
            .field("config", &self.inner.config)
            .field("properties", &self.inner.register.key_count())
            .finish()
    }
}

impl<V: Value> Pipeline<V> {
    pub(crate) fn new(
        runtime: Runtime<V>,
        config: PipelineConfig,
        callback: PipelineCallback<V>,
    ) -> Self {
        let key = runtime.allocate_pending_key();
        let operations = runtime.operations();

        let install_hook = OncePerHierarchy::with_fallback(
            operations,
            move |ty, runtime: Runtime<V>| {
                let callback = Rc::clone(&callback);
                on_update(&runtime, ty, move |instance| deliver(instance, key, &callback))
            },
            |_, _| Ok(()),
        );

        let register = OncePerKeyPerHierarchy::new(
            operations,
            move |ty, property: &PropertyKey, runtime: Runtime<V>| {
                if config.detect_changes {
                    register_filtered(&runtime, ty, *property, key)
                } else {
                    register_raw(&runtime, ty, *property, key)
                }
            },
            |ty, property: &PropertyKey, runtime: Runtime<V>| {
                runtime
                    .property_accessor(ty, *property)
                    .ok_or(ReactiveError::MissingAccessor {
                        property: *property,
                    })
            },
        );

        #[cfg(feature = "tracing")]
        tracing::debug!(
            message = "pipeline.created",
            key = key.raw(),
            detect_changes = config.detect_changes,
        );

        Self {
            inner: Rc::new(PipelineInner {
                runtime,
                key,
                config,
                install_hook,
                register,
            }),
        }
    }

    /// Pending-storage key owned by this pipeline.
    #[must_use]
    pub fn key(&self) -> PendingKey {
        self.inner.key
    }

    #[must_use]
    pub fn config(&self) -> PipelineConfig {
        self.inner.config
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime<V> {
        &self.inner.runtime
    }

    /// Track `property` on `ty` (and its descendants) in this pipeline.
    ///
    /// Idempotent per lineage: later calls return the accessor installed by
    /// the first one.
    pub fn register_property(&self, ty: TypeKey, property: PropertyKey) -> Result<Accessor<V>> {
        let runtime = &self.inner.runtime;
        runtime.ensure_type(ty)?;
        let accessor = self
            .inner
            .register
            .call(runtime.hierarchy(), ty, property, runtime.clone())?;
        self.ensure_hook(ty)?;
        Ok(accessor)
    }

    /// Schedule a delivery for `instance` even if nothing changed; the
    /// callback then receives an empty set.
    pub fn request_update(&self, instance: &Instance<V>) -> Result<()> {
        self.ensure_hook(instance.type_key())?;
        instance.begin_pending(self.inner.key);
        scheduler::request_update(instance);
        Ok(())
    }

    /// Snapshot of what this pipeline has batched for `instance`.
    #[must_use]
    pub fn pending(&self, instance: &Instance<V>) -> Option<ChangeSet<V>> {
        instance.pending_changes(self.inner.key)
    }

    fn ensure_hook(&self, ty: TypeKey) -> Result<()> {
        let runtime = &self.inner.runtime;
        self.inner
            .install_hook
            .call(runtime.hierarchy(), ty, runtime.clone())
    }
}

fn deliver<V: Value>(
    instance: &Instance<V>,
    key: PendingKey,
    callback: &PipelineCallback<V>,
) -> Result<()> {
    let Some(changes) = instance.take_pending(key) else {
        return Ok(());
    };

    #[cfg(feature = "tracing")]
    tracing::debug!(
        message = "pipeline.deliver",
        instance = %instance.id(),
        key = key.raw(),
        changes = changes.len(),
    );

    callback(instance, &changes)
}

fn register_raw<V: Value>(
    runtime: &Runtime<V>,
    ty: TypeKey,
    property: PropertyKey,
    key: PendingKey,
) -> Result<Accessor<V>> {
    let accessor = observe_property(runtime, ty, property, move |instance, old, new| {
        instance.record_pending(key, property, old, new);
        scheduler::request_update(instance);
    });
    runtime.define_property(ty, property, accessor.clone())?;
    Ok(accessor)
}

fn register_filtered<V: Value>(
    runtime: &Runtime<V>,
    ty: TypeKey,
    property: PropertyKey,
    key: PendingKey,
) -> Result<Accessor<V>> {
    on_property_change(runtime, ty, property, move |instance, record| {
        instance.insert_pending(key, property, record.clone());
        scheduler::request_update(instance);
        Ok(())
    })
}
