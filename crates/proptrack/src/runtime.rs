#![forbid(unsafe_code)]

//! The shared runtime: type tables, operation ids, and the microtask queue.
//!
//! # Design
//!
//! [`Runtime<V>`] is a cheap, cloneable handle (`Rc` inside) to everything
//! that is shared between instances of one embedding:
//!
//! - the declared [`Hierarchy`] and the [`OperationRegistry`] used to build
//!   once-per-hierarchy wrappers;
//! - per-type tables: field defaults, installed accessors, change detectors,
//!   change-callback chains, and update hooks;
//! - the [`MicrotaskQueue`] drained by [`Runtime::run_microtasks`].
//!
//! Per-type lookups walk the lineage explicitly. "Most specific" lookups
//! (accessors, detectors, field defaults) start at the type itself;
//! "composed" lookups (callback chains, update hooks) run root ancestor
//! first.
//!
//! # Invariants
//!
//! 1. Table borrows are released before any returned closure is invoked.
//! 2. Slot, pending and instance ids are never reused within a runtime.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;

use crate::PropertyKey;
use crate::change::{self, ChangeCallback, ChangeDetector, ChangeSet};
use crate::config::RuntimeConfig;
use crate::error::{ReactiveError, Result};
use crate::hierarchy::{Hierarchy, OncePerHierarchy, OperationRegistry, TypeKey};
use crate::instance::{Instance, InstanceId, PendingKey, SlotKey};
use crate::observe::Accessor;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::scheduler::{MicrotaskQueue, UpdateHook};

/// Property values handled by a runtime.
///
/// `V::default()` stands for "no value yet".
pub trait Value: Clone + PartialEq + Default + fmt::Debug + 'static {}

impl<T: Clone + PartialEq + Default + fmt::Debug + 'static> Value for T {}

/// Everything registered against one declared type.
pub(crate) struct TypeTables<V> {
    pub(crate) fields: AHashMap<PropertyKey, V>,
    pub(crate) accessors: AHashMap<PropertyKey, Accessor<V>>,
    pub(crate) detectors: AHashMap<PropertyKey, ChangeDetector<V>>,
    pub(crate) callbacks: AHashMap<PropertyKey, Vec<ChangeCallback<V>>>,
    pub(crate) update_hooks: Vec<UpdateHook<V>>,
}

impl<V> Default for TypeTables<V> {
    fn default() -> Self {
        Self {
            fields: AHashMap::new(),
            accessors: AHashMap::new(),
            detectors: AHashMap::new(),
            callbacks: AHashMap::new(),
            update_hooks: Vec::new(),
        }
    }
}

struct RuntimeShared<V> {
    config: RuntimeConfig,
    hierarchy: Hierarchy,
    operations: OperationRegistry,
    tables: RefCell<AHashMap<TypeKey, TypeTables<V>>>,
    queue: MicrotaskQueue,
    next_instance: Cell<u64>,
    next_slot: Cell<u64>,
    next_pending: Cell<u32>,
    changeable: OncePerHierarchy<Runtime<V>, Result<()>>,
}

/// Handle to a property-tracking runtime.
///
/// Cloning a `Runtime` creates a new handle to the **same** state.
pub struct Runtime<V> {
    shared: Rc<RuntimeShared<V>>,
}

impl<V> Clone for Runtime<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<V> fmt::Debug for Runtime<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.shared.config)
            .field("types", &self.shared.hierarchy.len())
            .field("operations", &self.shared.operations.allocated())
            .field("queued_microtasks", &self.shared.queue.len())
            .finish()
    }
}

impl<V: Value> Default for Runtime<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Value> Runtime<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    #[must_use]
    pub fn with_config(config: RuntimeConfig) -> Self {
        let operations = OperationRegistry::new();
        let changeable = change::changeable_installer(&operations);
        Self {
            shared: Rc::new(RuntimeShared {
                config,
                hierarchy: Hierarchy::new(),
                operations,
                tables: RefCell::new(AHashMap::new()),
                queue: MicrotaskQueue::new(),
                next_instance: Cell::new(1),
                next_slot: Cell::new(0),
                next_pending: Cell::new(PendingKey::ENGINE.raw() + 1),
                changeable,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn hierarchy(&self) -> &Hierarchy {
        &self.shared.hierarchy
    }

    /// Registry to build custom [`OncePerHierarchy`] wrappers from.
    #[must_use]
    pub fn operations(&self) -> &OperationRegistry {
        &self.shared.operations
    }

    #[must_use]
    pub fn queue(&self) -> &MicrotaskQueue {
        &self.shared.queue
    }

    /// Whether both handles refer to the same runtime.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.shared, &b.shared)
    }

    // ── Types and instances ──────────────────────────────────────────

    /// Declare a type, optionally deriving from `parent`.
    pub fn define_type(&self, name: &str, parent: Option<TypeKey>) -> Result<TypeKey> {
        self.shared.hierarchy.define(name, parent)
    }

    /// Declare the static initial value of a plain field.
    pub fn declare_field(&self, ty: TypeKey, property: PropertyKey, default: V) -> Result<()> {
        self.with_tables_mut(ty, |tables| {
            tables.fields.insert(property, default);
        })
    }

    /// Most specific declared default for `property`.
    #[must_use]
    pub fn field_default(&self, ty: TypeKey, property: PropertyKey) -> Option<V> {
        self.most_specific(ty, |tables| tables.fields.get(property).cloned())
    }

    /// Create a tracked instance of `ty`.
    pub fn instantiate(&self, ty: TypeKey) -> Result<Instance<V>> {
        self.ensure_type(ty)?;
        let id = self.shared.next_instance.get();
        self.shared.next_instance.set(id + 1);
        Ok(Instance::new(InstanceId::new(id), ty, self.clone()))
    }

    // ── Accessors ────────────────────────────────────────────────────

    /// Install `accessor` for `property` on `ty`, shadowing any inherited one.
    pub fn define_property(
        &self,
        ty: TypeKey,
        property: PropertyKey,
        accessor: Accessor<V>,
    ) -> Result<()> {
        self.with_tables_mut(ty, |tables| {
            tables.accessors.insert(property, accessor);
        })
    }

    /// Accessor in effect for `property` on `ty` (own or inherited).
    #[must_use]
    pub fn property_accessor(&self, ty: TypeKey, property: PropertyKey) -> Option<Accessor<V>> {
        self.most_specific(ty, |tables| tables.accessors.get(property).cloned())
    }

    // ── Scheduling ───────────────────────────────────────────────────

    /// Drain the microtask queue, including tasks queued while draining.
    ///
    /// Returns the number of tasks run. A failing task stops the drain;
    /// later tasks stay queued.
    pub fn run_microtasks(&self) -> Result<usize> {
        self.shared.queue.drain(self.shared.config.max_drain_tasks)
    }

    #[must_use]
    pub fn pending_microtasks(&self) -> usize {
        self.shared.queue.len()
    }

    // ── Pipelines ────────────────────────────────────────────────────

    /// Create an isolated batching namespace delivering raw change maps.
    pub fn create_pipeline(
        &self,
        update_callback: impl Fn(&Instance<V>, &ChangeSet<V>) -> Result<()> + 'static,
    ) -> Pipeline<V> {
        self.create_pipeline_with(PipelineConfig::default(), update_callback)
    }

    pub fn create_pipeline_with(
        &self,
        config: PipelineConfig,
        update_callback: impl Fn(&Instance<V>, &ChangeSet<V>) -> Result<()> + 'static,
    ) -> Pipeline<V> {
        Pipeline::new(self.clone(), config, Rc::new(update_callback))
    }

    // ── Crate-internal plumbing ──────────────────────────────────────

    pub(crate) fn ensure_type(&self, ty: TypeKey) -> Result<()> {
        if self.shared.hierarchy.contains(ty) {
            Ok(())
        } else {
            Err(ReactiveError::UnknownType(ty))
        }
    }

    pub(crate) fn allocate_slot(&self) -> SlotKey {
        let id = self.shared.next_slot.get();
        self.shared.next_slot.set(id + 1);
        SlotKey::new(id)
    }

    pub(crate) fn allocate_pending_key(&self) -> PendingKey {
        let id = self.shared.next_pending.get();
        self.shared.next_pending.set(id + 1);
        PendingKey::new(id)
    }

    /// Install the change engine's flush hook once per lineage.
    pub(crate) fn make_changeable(&self, ty: TypeKey) -> Result<()> {
        self.shared
            .changeable
            .call(&self.shared.hierarchy, ty, self.clone())
    }

    pub(crate) fn with_tables_mut<R>(
        &self,
        ty: TypeKey,
        f: impl FnOnce(&mut TypeTables<V>) -> R,
    ) -> Result<R> {
        self.ensure_type(ty)?;
        let mut tables = self.shared.tables.borrow_mut();
        Ok(f(tables.entry(ty).or_default()))
    }

    /// First hit walking from `ty` towards the root.
    pub(crate) fn most_specific<T>(
        &self,
        ty: TypeKey,
        mut f: impl FnMut(&TypeTables<V>) -> Option<T>,
    ) -> Option<T> {
        let lineage = self.shared.hierarchy.lineage(ty);
        let tables = self.shared.tables.borrow();
        lineage
            .iter()
            .filter_map(|key| tables.get(key))
            .find_map(|entry| f(entry))
    }

    /// Concatenation over the lineage, root ancestor first.
    pub(crate) fn root_first<T>(
        &self,
        ty: TypeKey,
        mut f: impl FnMut(&TypeTables<V>, &mut Vec<T>),
    ) -> Vec<T> {
        let lineage = self.shared.hierarchy.lineage(ty);
        let tables = self.shared.tables.borrow();
        let mut out = Vec::new();
        for key in lineage.iter().rev() {
            if let Some(entry) = tables.get(key) {
                f(entry, &mut out);
            }
        }
        out
    }
}
