#![forbid(unsafe_code)]

//! Change records, change detection, and per-property callback chains.
//!
//! # Design
//!
//! Writes to observed properties are accumulated per instance in a pending
//! [`ChangeSet`]. Every write asks the scheduler for an update, which
//! coalesces into one flush per turn; [`flush`] later detaches the set and, for every
//! property whose detector reports a real change, runs that property's
//! callback chain.
//!
//! Detectors are registered per (type, property); the most specific one along
//! the lineage wins, and [`has_changed`] (`old != new`) applies when none is
//! registered. Callback chains compose along the lineage: ancestor callbacks
//! run before descendant ones, and within one type in registration order.
//! Registrations only ever append.
//!
//! # Invariants
//!
//! 1. `old_value` of a pending record is the value before the first write of
//!    the cycle; `new_value` is the value after the last write.
//! 2. Records are delivered in the order their property first became pending.
//! 3. The pending set is detached before any detector or callback runs, so
//!    writes made during a flush open a fresh cycle.
//!
//! # Failure Modes
//!
//! - **Callback error**: returned from [`flush`] immediately. Records already
//!   delivered stay consumed; the rest of the detached set is dropped.
//! - **No callbacks for an approved record**: a broken registration
//!   invariant, reported as [`ReactiveError::MissingCallbackChain`] unless
//!   `strict_callback_chains` is disabled.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::PropertyKey;
use crate::error::{ReactiveError, Result};
use crate::hierarchy::{OncePerHierarchy, OperationRegistry, TypeKey};
use crate::instance::{Instance, PendingKey};
use crate::observe::{Accessor, observe_property};
use crate::runtime::{Runtime, Value};
use crate::scheduler::{on_update, request_update};

/// Decides whether a recorded delta is a real change.
pub type ChangeDetector<V> = Rc<dyn Fn(&V, &V) -> bool>;

/// Invoked with the instance and the delivered record.
pub type ChangeCallback<V> = Rc<dyn Fn(&Instance<V>, &ChangeRecord<V>) -> Result<()>>;

/// Pending delta for one property within one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord<V> {
    pub old_value: V,
    pub new_value: V,
}

impl<V> ChangeRecord<V> {
    #[must_use]
    pub const fn new(old_value: V, new_value: V) -> Self {
        Self {
            old_value,
            new_value,
        }
    }
}

/// Insertion-ordered map from property to its pending record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet<V> {
    records: IndexMap<PropertyKey, ChangeRecord<V>>,
}

impl<V> Default for ChangeSet<V> {
    fn default() -> Self {
        Self {
            records: IndexMap::new(),
        }
    }
}

impl<V> ChangeSet<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn get(&self, property: PropertyKey) -> Option<&ChangeRecord<V>> {
        self.records.get(property)
    }

    #[must_use]
    pub fn contains(&self, property: PropertyKey) -> bool {
        self.records.contains_key(property)
    }

    /// Fold one write into the set. The first write of a property fixes its
    /// `old_value`; later writes only move `new_value`.
    ///
    /// Returns `true` if the property was not pending before.
    pub fn record(&mut self, property: PropertyKey, old_value: V, new_value: V) -> bool {
        match self.records.get_mut(property) {
            Some(record) => {
                record.new_value = new_value;
                false
            }
            None => {
                self.records
                    .insert(property, ChangeRecord::new(old_value, new_value));
                true
            }
        }
    }

    /// Store `record` verbatim, keeping the property's original position.
    pub fn insert(&mut self, property: PropertyKey, record: ChangeRecord<V>) {
        self.records.insert(property, record);
    }

    pub fn iter(&self) -> impl Iterator<Item = (PropertyKey, &ChangeRecord<V>)> {
        self.records.iter().map(|(property, record)| (*property, record))
    }

    pub fn properties(&self) -> impl Iterator<Item = PropertyKey> + '_ {
        self.records.keys().copied()
    }
}

impl<V> FromIterator<(PropertyKey, ChangeRecord<V>)> for ChangeSet<V> {
    fn from_iter<I: IntoIterator<Item = (PropertyKey, ChangeRecord<V>)>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

impl<V> IntoIterator for ChangeSet<V> {
    type Item = (PropertyKey, ChangeRecord<V>);
    type IntoIter = indexmap::map::IntoIter<PropertyKey, ChangeRecord<V>>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Default detector: strict inequality.
#[must_use]
pub fn has_changed<V: PartialEq>(old_value: &V, new_value: &V) -> bool {
    old_value != new_value
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register the detector used for `property` on `ty` and its descendants.
pub fn register_change_detector<V: Value>(
    runtime: &Runtime<V>,
    ty: TypeKey,
    property: PropertyKey,
    detector: impl Fn(&V, &V) -> bool + 'static,
) -> Result<()> {
    runtime.with_tables_mut(ty, |tables| {
        tables.detectors.insert(property, Rc::new(detector));
    })
}

/// Detector in effect for `property` on `ty`.
#[must_use]
pub fn change_detector<V: Value>(
    runtime: &Runtime<V>,
    ty: TypeKey,
    property: PropertyKey,
) -> ChangeDetector<V> {
    runtime
        .most_specific(ty, |tables| tables.detectors.get(property).cloned())
        .unwrap_or_else(default_detector::<V>)
}

fn default_detector<V: Value>() -> ChangeDetector<V> {
    Rc::new(has_changed::<V>)
}

/// Append `callback` to the chain for `property` on `ty`.
///
/// Registering the same callback twice makes it run twice.
pub fn register_change_callback<V: Value>(
    runtime: &Runtime<V>,
    ty: TypeKey,
    property: PropertyKey,
    callback: impl Fn(&Instance<V>, &ChangeRecord<V>) -> Result<()> + 'static,
) -> Result<()> {
    runtime.with_tables_mut(ty, |tables| {
        tables
            .callbacks
            .entry(property)
            .or_default()
            .push(Rc::new(callback));
    })
}

/// Callbacks run for `property` on instances of `ty`, in invocation order.
#[must_use]
pub fn callback_chain<V: Value>(
    runtime: &Runtime<V>,
    ty: TypeKey,
    property: PropertyKey,
) -> Vec<ChangeCallback<V>> {
    runtime.root_first(ty, |tables, out| {
        if let Some(chain) = tables.callbacks.get(property) {
            out.extend(chain.iter().cloned());
        }
    })
}

/// Observe `property` on `ty` and deliver its batched changes to `callback`.
///
/// Installs the flush hook once per lineage, appends `callback` to the
/// property's chain, wraps the property so writes are recorded, and installs
/// the resulting accessor on `ty`.
pub fn on_property_change<V: Value>(
    runtime: &Runtime<V>,
    ty: TypeKey,
    property: PropertyKey,
    callback: impl Fn(&Instance<V>, &ChangeRecord<V>) -> Result<()> + 'static,
) -> Result<Accessor<V>> {
    runtime.ensure_type(ty)?;
    runtime.make_changeable(ty)?;
    register_change_callback(runtime, ty, property, callback)?;
    let accessor = observe_property(runtime, ty, property, move |instance, old, new| {
        record_pending_change(instance, property, old, new);
    });
    runtime.define_property(ty, property, accessor.clone())?;
    Ok(accessor)
}

pub(crate) fn changeable_installer<V: Value>(
    operations: &OperationRegistry,
) -> OncePerHierarchy<Runtime<V>, Result<()>> {
    OncePerHierarchy::with_fallback(
        operations,
        |ty, runtime: Runtime<V>| on_update(&runtime, ty, flush::<V>),
        |_, _| Ok(()),
    )
}

// ---------------------------------------------------------------------------
// Recording and flushing
// ---------------------------------------------------------------------------

/// Fold a write into the instance's pending set and request an update.
///
/// The request is made even when the set was already open: a set left
/// behind by a cycle whose earlier hook failed gets rescheduled by the next
/// write.
pub fn record_pending_change<V: Value>(
    instance: &Instance<V>,
    property: PropertyKey,
    old_value: V,
    new_value: V,
) {
    instance.record_pending(PendingKey::ENGINE, property, old_value, new_value);
    request_update(instance);
}

/// Deliver the instance's pending changes. No-op if nothing is pending.
pub fn flush<V: Value>(instance: &Instance<V>) -> Result<()> {
    let Some(changes) = instance.take_pending(PendingKey::ENGINE) else {
        return Ok(());
    };
    let runtime = instance.runtime();
    let ty = instance.type_key();

    #[cfg(feature = "tracing")]
    let mut delivered = 0usize;

    for (property, record) in changes.iter() {
        let detector = change_detector(runtime, ty, property);
        if !detector(&record.old_value, &record.new_value) {
            continue;
        }
        let chain = callback_chain(runtime, ty, property);
        if chain.is_empty() {
            if runtime.config().strict_callback_chains {
                return Err(ReactiveError::MissingCallbackChain { property });
            }
            continue;
        }
        for callback in &chain {
            callback(instance, record)?;
        }
        #[cfg(feature = "tracing")]
        {
            delivered += 1;
        }
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(
        message = "change.flush",
        instance = %instance.id(),
        pending = changes.len(),
        delivered,
    );

    Ok(())
}
