#![forbid(unsafe_code)]

//! Property observation: intercepting get/set pairs.
//!
//! [`observe_property`] turns a property into an [`Accessor`] whose setter
//! reports every assignment as `(instance, old, new)`. When the property
//! already has an accessor on the type or one of its ancestors, the new
//! accessor delegates storage to it, so independent observation layers stack
//! on the same property. Otherwise the value lives in a fresh private slot on
//! each instance, seeded with the property's declared default.
//!
//! No filtering happens here: the callback fires on every assignment, even
//! when the value does not change.

use std::fmt;
use std::rc::Rc;

use crate::PropertyKey;
use crate::hierarchy::TypeKey;
use crate::instance::Instance;
use crate::runtime::{Runtime, Value};

type Getter<V> = Rc<dyn Fn(&Instance<V>) -> V>;
type Setter<V> = Rc<dyn Fn(&Instance<V>, V)>;

/// A get/set pair installed for one property.
///
/// Cloning shares the underlying closures; [`Accessor::ptr_eq`] compares
/// them.
pub struct Accessor<V> {
    get: Getter<V>,
    set: Setter<V>,
}

impl<V> Clone for Accessor<V> {
    fn clone(&self) -> Self {
        Self {
            get: Rc::clone(&self.get),
            set: Rc::clone(&self.set),
        }
    }
}

impl<V> fmt::Debug for Accessor<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor")
            .field("get", &Rc::as_ptr(&self.get).cast::<()>())
            .field("set", &Rc::as_ptr(&self.set).cast::<()>())
            .finish()
    }
}

impl<V: Value> Accessor<V> {
    pub fn new(
        get: impl Fn(&Instance<V>) -> V + 'static,
        set: impl Fn(&Instance<V>, V) + 'static,
    ) -> Self {
        Self {
            get: Rc::new(get),
            set: Rc::new(set),
        }
    }

    #[must_use]
    pub fn get(&self, instance: &Instance<V>) -> V {
        (self.get)(instance)
    }

    pub fn set(&self, instance: &Instance<V>, value: V) {
        (self.set)(instance, value)
    }

    /// Whether both accessors share the same getter and setter.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.get, &b.get) && Rc::ptr_eq(&a.set, &b.set)
    }
}

/// Wrap `property` on `ty` so every assignment calls `on_set(instance, old,
/// new)` after the value is stored.
///
/// The returned accessor is not installed; pass it to
/// [`Runtime::define_property`].
pub fn observe_property<V: Value>(
    runtime: &Runtime<V>,
    ty: TypeKey,
    property: PropertyKey,
    on_set: impl Fn(&Instance<V>, V, V) + 'static,
) -> Accessor<V> {
    let (get, set): (Getter<V>, Setter<V>) = match runtime.property_accessor(ty, property) {
        Some(existing) => (existing.get, existing.set),
        None => {
            let slot = runtime.allocate_slot();
            let baseline = runtime.field_default(ty, property).unwrap_or_default();
            (
                Rc::new(move |instance: &Instance<V>| {
                    instance.read_slot(slot).unwrap_or_else(|| baseline.clone())
                }),
                Rc::new(move |instance: &Instance<V>, value: V| instance.write_slot(slot, value)),
            )
        }
    };

    Accessor {
        get: Rc::clone(&get),
        set: Rc::new(move |instance: &Instance<V>, value: V| {
            let old_value = get(instance);
            set(instance, value.clone());
            on_set(instance, old_value, value);
        }),
    }
}
