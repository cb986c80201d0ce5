#![forbid(unsafe_code)]

//! Explicit type hierarchy and "once per hierarchy" registration.
//!
//! Types are declared up front with an optional parent, forming a
//! single-inheritance forest stored in an arena indexed by [`TypeKey`].
//! Every type carries the set of installation operations that have been
//! applied to it. An operation counts as applied to a type when the type
//! itself or any of its ancestors holds the operation's [`OperationId`].
//!
//! [`OncePerHierarchy`] wraps an installation operation so that re-applying
//! it to a subtype of an already-installed type runs the fallback instead.
//! [`OncePerKeyPerHierarchy`] tracks the same guarantee independently per key
//! (typically per property name).
//!
//! # Invariants
//!
//! 1. Operation ids handed out by one [`OperationRegistry`] are unique and
//!    never reused. Ids are `u64`, so exhaustion needs 2^64 allocations.
//! 2. `try_apply(ty, op)` returns `true` at most once per lineage: after it
//!    succeeds for `ty`, it fails for `ty` and every descendant of `ty`.
//! 3. Applied-operation sets only grow.
//! 4. A hierarchy holds at most `u32::MAX + 1` types; defining more fails
//!    with [`ReactiveError::TypeLimitExceeded`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::error::{ReactiveError, Result};

/// Identifier of a declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey(u32);

impl TypeKey {
    /// Arena index of this type.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

/// Identifier of one once-per-hierarchy installation operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// A type and its ancestors, most specific first.
pub type Lineage = SmallVec<[TypeKey; 8]>;

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

/// Hands out process-unique [`OperationId`]s.
///
/// Cloning yields a handle to the same counter.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    next: Rc<Cell<u64>>,
}

impl OperationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh operation id.
    pub fn allocate(&self) -> OperationId {
        let id = self.next.get();
        self.next.set(id + 1);
        OperationId(id)
    }

    /// Number of ids allocated so far.
    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.next.get()
    }
}

// ---------------------------------------------------------------------------
// Hierarchy
// ---------------------------------------------------------------------------

fn type_key_for_index(index: usize) -> Result<TypeKey> {
    u32::try_from(index)
        .map(TypeKey)
        .map_err(|_| ReactiveError::TypeLimitExceeded {
            limit: u64::from(u32::MAX) + 1,
        })
}

/// Sorted set of applied operation ids. Sparse in practice, so a small
/// inline array with binary search beats a bitmap.
#[derive(Debug, Clone, Default)]
struct OperationSet {
    ids: SmallVec<[OperationId; 4]>,
}

impl OperationSet {
    fn insert(&mut self, id: OperationId) -> bool {
        match self.ids.binary_search(&id) {
            Ok(_) => false,
            Err(pos) => {
                self.ids.insert(pos, id);
                true
            }
        }
    }

    fn contains(&self, id: OperationId) -> bool {
        self.ids.binary_search(&id).is_ok()
    }
}

#[derive(Debug)]
struct TypeNode {
    name: Rc<str>,
    parent: Option<TypeKey>,
    applied: OperationSet,
}

/// Arena of declared types.
///
/// Cloning a `Hierarchy` creates a new handle to the **same** arena.
#[derive(Debug, Clone, Default)]
pub struct Hierarchy {
    nodes: Rc<RefCell<Vec<TypeNode>>>,
}

impl Hierarchy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a type, optionally deriving from `parent`.
    pub fn define(&self, name: &str, parent: Option<TypeKey>) -> Result<TypeKey> {
        let mut nodes = self.nodes.borrow_mut();
        if let Some(parent) = parent
            && parent.0 as usize >= nodes.len()
        {
            return Err(ReactiveError::UnknownType(parent));
        }
        let key = type_key_for_index(nodes.len())?;
        nodes.push(TypeNode {
            name: Rc::from(name),
            parent,
            applied: OperationSet::default(),
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(message = "hierarchy.define", ty = %key, name, parent = ?parent);

        Ok(key)
    }

    /// Whether `ty` was declared in this hierarchy.
    #[must_use]
    pub fn contains(&self, ty: TypeKey) -> bool {
        (ty.0 as usize) < self.nodes.borrow().len()
    }

    /// Number of declared types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn name(&self, ty: TypeKey) -> Option<Rc<str>> {
        self.nodes
            .borrow()
            .get(ty.0 as usize)
            .map(|node| Rc::clone(&node.name))
    }

    #[must_use]
    pub fn parent(&self, ty: TypeKey) -> Option<TypeKey> {
        self.nodes
            .borrow()
            .get(ty.0 as usize)
            .and_then(|node| node.parent)
    }

    /// `ty` followed by its ancestors up to the root. Empty for unknown keys.
    #[must_use]
    pub fn lineage(&self, ty: TypeKey) -> Lineage {
        let nodes = self.nodes.borrow();
        let mut lineage = Lineage::new();
        let mut cursor = Some(ty);
        while let Some(key) = cursor {
            let Some(node) = nodes.get(key.0 as usize) else {
                break;
            };
            lineage.push(key);
            cursor = node.parent;
        }
        lineage
    }

    /// Whether `ty` is `ancestor` or derives from it.
    #[must_use]
    pub fn is_subtype_of(&self, ty: TypeKey, ancestor: TypeKey) -> bool {
        self.lineage(ty).contains(&ancestor)
    }

    /// Whether `op` was applied to `ty` or one of its ancestors.
    #[must_use]
    pub fn has_applied(&self, ty: TypeKey, op: OperationId) -> bool {
        let nodes = self.nodes.borrow();
        let mut cursor = Some(ty);
        while let Some(key) = cursor {
            let Some(node) = nodes.get(key.0 as usize) else {
                return false;
            };
            if node.applied.contains(op) {
                return true;
            }
            cursor = node.parent;
        }
        false
    }

    /// Mark `op` as applied to `ty` unless the lineage already carries it.
    ///
    /// Returns `true` when the caller should run the operation.
    pub fn try_apply(&self, ty: TypeKey, op: OperationId) -> bool {
        if !self.contains(ty) || self.has_applied(ty, op) {
            return false;
        }
        self.nodes.borrow_mut()[ty.0 as usize].applied.insert(op);

        #[cfg(feature = "tracing")]
        tracing::debug!(message = "hierarchy.apply", ty = %ty, op = op.raw());

        true
    }
}

// ---------------------------------------------------------------------------
// OncePerHierarchy
// ---------------------------------------------------------------------------

type Operation<A, R> = Rc<dyn Fn(TypeKey, A) -> R>;
type KeyedOperation<K, A, R> = Rc<dyn Fn(TypeKey, &K, A) -> R>;

/// An installation operation that runs at most once per type lineage.
pub struct OncePerHierarchy<A, R = ()> {
    id: OperationId,
    operation: Operation<A, R>,
    fallback: Operation<A, R>,
}

impl<A: 'static, R: Default + 'static> OncePerHierarchy<A, R> {
    /// Wrap `operation`; redundant applications return `R::default()`.
    pub fn new(
        registry: &OperationRegistry,
        operation: impl Fn(TypeKey, A) -> R + 'static,
    ) -> Self {
        Self::with_fallback(registry, operation, |_, _| R::default())
    }
}

impl<A, R> OncePerHierarchy<A, R> {
    /// Wrap `operation`, running `fallback` on redundant applications.
    pub fn with_fallback(
        registry: &OperationRegistry,
        operation: impl Fn(TypeKey, A) -> R + 'static,
        fallback: impl Fn(TypeKey, A) -> R + 'static,
    ) -> Self {
        Self {
            id: registry.allocate(),
            operation: Rc::new(operation),
            fallback: Rc::new(fallback),
        }
    }

    #[must_use]
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Apply to `ty`.
    pub fn call(&self, hierarchy: &Hierarchy, ty: TypeKey, args: A) -> R {
        if hierarchy.try_apply(ty, self.id) {
            (self.operation)(ty, args)
        } else {
            (self.fallback)(ty, args)
        }
    }
}

impl<A, R> Clone for OncePerHierarchy<A, R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            operation: Rc::clone(&self.operation),
            fallback: Rc::clone(&self.fallback),
        }
    }
}

impl<A, R> fmt::Debug for OncePerHierarchy<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OncePerHierarchy")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// [`OncePerHierarchy`] tracked independently for every distinct key.
///
/// The id for a key is allocated on first use and memoized.
pub struct OncePerKeyPerHierarchy<K, A, R = ()> {
    registry: OperationRegistry,
    ids: RefCell<AHashMap<K, OperationId>>,
    operation: KeyedOperation<K, A, R>,
    fallback: KeyedOperation<K, A, R>,
}

impl<K, A, R> OncePerKeyPerHierarchy<K, A, R>
where
    K: Eq + Hash + Clone,
{
    pub fn new(
        registry: &OperationRegistry,
        operation: impl Fn(TypeKey, &K, A) -> R + 'static,
        fallback: impl Fn(TypeKey, &K, A) -> R + 'static,
    ) -> Self {
        Self {
            registry: registry.clone(),
            ids: RefCell::new(AHashMap::new()),
            operation: Rc::new(operation),
            fallback: Rc::new(fallback),
        }
    }

    /// Apply to `ty` under `key`.
    pub fn call(&self, hierarchy: &Hierarchy, ty: TypeKey, key: K, args: A) -> R {
        let id = self.id_for(&key);
        if hierarchy.try_apply(ty, id) {
            (self.operation)(ty, &key, args)
        } else {
            (self.fallback)(ty, &key, args)
        }
    }

    /// Operation id tracking `key`, allocating one on first sight.
    pub fn id_for(&self, key: &K) -> OperationId {
        if let Some(&id) = self.ids.borrow().get(key) {
            return id;
        }
        let id = self.registry.allocate();
        self.ids.borrow_mut().insert(key.clone(), id);
        id
    }

    /// Number of distinct keys seen so far.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.ids.borrow().len()
    }
}

impl<K, A, R> fmt::Debug for OncePerKeyPerHierarchy<K, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OncePerKeyPerHierarchy")
            .field("keys", &self.ids.borrow().len())
            .finish_non_exhaustive()
    }
}
