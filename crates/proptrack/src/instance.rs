#![forbid(unsafe_code)]

//! Tracked instances and their private side tables.
//!
//! An [`Instance`] is created from a declared type by
//! [`Runtime::instantiate`]. Besides plain field storage it owns:
//!
//! - private observer slots, one per wrapped property ([`SlotKey`]);
//! - pending change maps, one per batching namespace ([`PendingKey`]);
//! - the pending-flush token consulted by the update scheduler.
//!
//! All of these die with the instance. Cloning an `Instance` creates a new
//! handle to the **same** object.
//!
//! # Invariants
//!
//! 1. No `RefCell` borrow of an instance table is held while user code
//!    (accessors, callbacks, hooks) runs.
//! 2. A pending map keeps the `old_value` of the first write per property
//!    until it is taken.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;

use crate::PropertyKey;
use crate::change::{ChangeRecord, ChangeSet};
use crate::hierarchy::TypeKey;
use crate::runtime::{Runtime, Value};

/// Identity of a tracked instance, unique within its runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance#{}", self.0)
    }
}

/// Key of a private observer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey(u64);

impl SlotKey {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Key of a pending change map on an instance.
///
/// The change engine owns [`PendingKey::ENGINE`]; every pipeline draws its
/// own key from the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingKey(u32);

impl PendingKey {
    /// Namespace of the change engine.
    pub const ENGINE: Self = Self(0);

    pub(crate) const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

struct InstanceInner<V> {
    id: InstanceId,
    ty: TypeKey,
    runtime: Runtime<V>,
    fields: RefCell<AHashMap<PropertyKey, V>>,
    slots: RefCell<AHashMap<SlotKey, V>>,
    pending: RefCell<AHashMap<PendingKey, ChangeSet<V>>>,
    update_token: Cell<bool>,
}

/// An object participating in property observation.
pub struct Instance<V> {
    inner: Rc<InstanceInner<V>>,
}

impl<V> Clone for Instance<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<V: Value> fmt::Debug for Instance<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.inner.id)
            .field("ty", &self.inner.ty)
            .field("fields", &self.inner.fields.borrow())
            .field("update_requested", &self.inner.update_token.get())
            .finish()
    }
}

impl<V: Value> Instance<V> {
    pub(crate) fn new(id: InstanceId, ty: TypeKey, runtime: Runtime<V>) -> Self {
        Self {
            inner: Rc::new(InstanceInner {
                id,
                ty,
                runtime,
                fields: RefCell::new(AHashMap::new()),
                slots: RefCell::new(AHashMap::new()),
                pending: RefCell::new(AHashMap::new()),
                update_token: Cell::new(false),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> InstanceId {
        self.inner.id
    }

    #[must_use]
    pub fn type_key(&self) -> TypeKey {
        self.inner.ty
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime<V> {
        &self.inner.runtime
    }

    /// Whether both handles refer to the same instance.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    // ── Property access ──────────────────────────────────────────────

    /// Read `property`, going through the installed accessor if any.
    #[must_use]
    pub fn get(&self, property: PropertyKey) -> V {
        match self.inner.runtime.property_accessor(self.inner.ty, property) {
            Some(accessor) => accessor.get(self),
            None => self.read_field(property),
        }
    }

    /// Assign `property`, going through the installed accessor if any.
    pub fn set(&self, property: PropertyKey, value: V) {
        match self.inner.runtime.property_accessor(self.inner.ty, property) {
            Some(accessor) => accessor.set(self, value),
            None => self.write_field(property, value),
        }
    }

    /// Plain field value, falling back to the declared default.
    #[must_use]
    pub fn read_field(&self, property: PropertyKey) -> V {
        if let Some(value) = self.inner.fields.borrow().get(property) {
            return value.clone();
        }
        self.inner
            .runtime
            .field_default(self.inner.ty, property)
            .unwrap_or_default()
    }

    /// Write plain field storage, bypassing accessors.
    pub fn write_field(&self, property: PropertyKey, value: V) {
        self.inner.fields.borrow_mut().insert(property, value);
    }

    pub(crate) fn read_slot(&self, slot: SlotKey) -> Option<V> {
        self.inner.slots.borrow().get(&slot).cloned()
    }

    pub(crate) fn write_slot(&self, slot: SlotKey, value: V) {
        self.inner.slots.borrow_mut().insert(slot, value);
    }

    // ── Pending change maps ──────────────────────────────────────────

    /// Snapshot of the pending map under `key`.
    #[must_use]
    pub fn pending_changes(&self, key: PendingKey) -> Option<ChangeSet<V>> {
        self.inner.pending.borrow().get(&key).cloned()
    }

    /// Whether a pending map exists under `key` (possibly empty).
    #[must_use]
    pub fn has_pending(&self, key: PendingKey) -> bool {
        self.inner.pending.borrow().contains_key(&key)
    }

    /// Record a write under `key`. Returns `true` when this opened a new
    /// pending map.
    pub(crate) fn record_pending(
        &self,
        key: PendingKey,
        property: PropertyKey,
        old_value: V,
        new_value: V,
    ) -> bool {
        let mut pending = self.inner.pending.borrow_mut();
        match pending.get_mut(&key) {
            Some(changes) => {
                changes.record(property, old_value, new_value);
                false
            }
            None => {
                let mut changes = ChangeSet::new();
                changes.record(property, old_value, new_value);
                pending.insert(key, changes);
                true
            }
        }
    }

    /// Store `record` as-is under `key`, replacing any earlier record.
    pub(crate) fn insert_pending(
        &self,
        key: PendingKey,
        property: PropertyKey,
        record: ChangeRecord<V>,
    ) {
        self.inner
            .pending
            .borrow_mut()
            .entry(key)
            .or_default()
            .insert(property, record);
    }

    /// Make sure a (possibly empty) pending map exists under `key`.
    pub(crate) fn begin_pending(&self, key: PendingKey) {
        self.inner.pending.borrow_mut().entry(key).or_default();
    }

    /// Detach the pending map under `key`.
    pub(crate) fn take_pending(&self, key: PendingKey) -> Option<ChangeSet<V>> {
        self.inner.pending.borrow_mut().remove(&key)
    }

    // ── Flush token ──────────────────────────────────────────────────

    /// Whether a flush is scheduled and has not started yet.
    #[must_use]
    pub fn update_requested(&self) -> bool {
        self.inner.update_token.get()
    }

    /// Take the flush token. Returns `false` if it was already held.
    pub(crate) fn acquire_update_token(&self) -> bool {
        !self.inner.update_token.replace(true)
    }

    pub(crate) fn release_update_token(&self) {
        self.inner.update_token.set(false);
    }
}
