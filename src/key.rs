//! Query identity.

use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dyn_hash::DynHash;

/// The value behind a [`QueryKey`].
///
/// Any hashable, comparable and printable value that can cross threads is an
/// identity. Identities of unrelated types share one registry, so they are
/// stored as trait objects and compared through [`Any`].
pub trait Identity: DynHash + Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    /// True only for an identity of the same concrete type with an equal
    /// value.
    fn same_as(&self, other: &dyn Identity) -> bool;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> Identity for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn same_as(&self, other: &dyn Identity) -> bool {
        other.as_any().downcast_ref::<T>() == Some(self)
    }
}

dyn_hash::hash_trait_object!(Identity);

/// Marker value used by [`QueryKey::of_type`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct TypeIdentity(&'static str);

impl Debug for TypeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(short_type_name(self.0))
    }
}

/// Marker value used by [`QueryKey::named`].
#[derive(Clone, PartialEq, Eq, Hash)]
struct Name(Cow<'static, str>);

impl Debug for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Identity of a query inside a [`FiberCache`](crate::FiberCache).
///
/// Two keys are equal when they were built from the same kind of identity and
/// the identity values compare equal. Equal keys always resolve to the same
/// fiber, so they must denote the same producer.
///
/// - [`QueryKey::of_type`] keys by Rust type identity. Every fn item and every
///   closure has its own type, which makes this the function-identity key.
/// - [`QueryKey::new`] keys by a query value (the value is its own key).
/// - [`QueryKey::named`] keys by a string, a convenience layered on top.
#[derive(Clone)]
pub struct QueryKey {
    kind: TypeId,
    identity: Arc<dyn Identity>,
}

impl QueryKey {
    /// Key a query by its value.
    pub fn new<K: Identity>(value: K) -> Self {
        Self {
            kind: TypeId::of::<K>(),
            identity: Arc::new(value),
        }
    }

    /// Key a query by the identity of the type `F`.
    pub fn of_type<F: ?Sized + 'static>() -> Self {
        Self {
            kind: TypeId::of::<F>(),
            identity: Arc::new(TypeIdentity(std::any::type_name::<F>())),
        }
    }

    /// Key a query by name.
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: TypeId::of::<Name>(),
            identity: Arc::new(Name(name.into())),
        }
    }

    /// The identity as printed in errors and traces.
    pub fn debug_repr(&self) -> String {
        format!("{:?}", self.identity)
    }

    /// The query value this key was built from, if it is a `K`.
    pub fn downcast<K: 'static>(&self) -> Option<&K> {
        self.identity.as_any().downcast_ref()
    }
}

impl Debug for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.identity)
    }
}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.identity.hash(state);
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.identity.same_as(&*other.identity)
    }
}

impl Eq for QueryKey {}

/// Strip module paths from a type name, keeping generic arguments readable.
fn short_type_name(full: &str) -> &str {
    let end = full.find('<').unwrap_or(full.len());
    match full[..end].rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}
