//! Lazily loaded relationships between models.
//!
//! A relation is loaded through whatever [`LoadRelated`] adapter the
//! connection holds for the target model, on first access only. The loaded
//! value is memoized until the relation is reset (a setter on the foreign
//! key does that for `BelongsTo`).

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use serde_json::Value;

use super::{key_value, Model};
use crate::adapter::{Connection, LoadRelated};
use crate::error::DataError;

/// Implemented by relation holders so generated accessors can name the
/// related model type.
pub trait Relation {
    type Target: Model;
}

/// A single related parent, looked up by a foreign key attribute.
///
/// The parent is boxed so a model can belong to its own type.
pub struct BelongsTo<P> {
    loaded: Option<Option<Box<P>>>,
}

impl<P: Model> Relation for BelongsTo<P> {
    type Target = P;
}

impl<P> Default for BelongsTo<P> {
    fn default() -> Self {
        BelongsTo { loaded: None }
    }
}

impl<P: Clone> Clone for BelongsTo<P> {
    fn clone(&self) -> Self {
        BelongsTo {
            loaded: self.loaded.clone(),
        }
    }
}

impl<P> fmt::Debug for BelongsTo<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.loaded {
            None => "unloaded",
            Some(None) => "absent",
            Some(Some(_)) => "loaded",
        };
        f.debug_tuple("BelongsTo").field(&state).finish()
    }
}

impl<P: Model> BelongsTo<P> {
    /// Load the parent for an optional foreign key. A null key yields `None`
    /// without touching storage.
    pub fn load(&mut self, conn: &Connection, key: Option<Value>) -> Result<Option<&P>, DataError> {
        if self.loaded.is_none() {
            let parent = match key {
                Some(key) => conn.adapter::<dyn LoadRelated<P>>()?.load_by_key(&key)?,
                None => None,
            };
            self.loaded = Some(parent.map(Box::new));
        }
        Ok(self.loaded.as_ref().and_then(|parent| parent.as_deref()))
    }

    /// Load the parent for a required foreign key.
    pub fn load_required(&mut self, conn: &Connection, key: Value) -> Result<&P, DataError> {
        let missing = DataError::NotFound {
            collection: P::collection().to_string(),
            key: key.to_string(),
        };
        match self.load(conn, Some(key))? {
            Some(parent) => Ok(parent),
            None => Err(missing),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Forget the memoized parent.
    pub fn reset(&mut self) {
        self.loaded = None;
    }
}

/// The children of one owner, looked up by the child's foreign key.
pub struct HasMany<C> {
    loaded: Option<Children<C>>,
}

impl<C: Model> Relation for HasMany<C> {
    type Target = C;
}

impl<C> Default for HasMany<C> {
    fn default() -> Self {
        HasMany { loaded: None }
    }
}

impl<C> Clone for HasMany<C> {
    fn clone(&self) -> Self {
        HasMany {
            loaded: self.loaded.clone(),
        }
    }
}

impl<C> fmt::Debug for HasMany<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.loaded {
            Some(children) => f.debug_tuple("HasMany").field(children).finish(),
            None => f.debug_tuple("HasMany").field(&"unloaded").finish(),
        }
    }
}

impl<C: Model> HasMany<C> {
    /// Load (once) every child whose `child_key` attribute equals `owner`.
    pub fn load(
        &mut self,
        conn: &Connection,
        child_key: &'static str,
        owner: Value,
        order_by: Option<&'static str>,
    ) -> Result<Children<C>, DataError> {
        if let Some(children) = &self.loaded {
            return Ok(children.clone());
        }
        let items = conn
            .adapter::<dyn LoadRelated<C>>()?
            .load_by_field(child_key, &owner, order_by)?;
        let children = Children::attach(items);
        self.loaded = Some(children.clone());
        Ok(children)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn reset(&mut self) {
        self.loaded = None;
    }

    /// Visit loaded children in order. Unloaded relations have nothing to
    /// visit.
    pub fn visit_loaded(
        &self,
        visit: &mut dyn FnMut(&mut dyn super::GraphNode) -> Result<(), DataError>,
    ) -> Result<(), DataError> {
        match &self.loaded {
            Some(children) => children.visit(visit),
            None => Ok(()),
        }
    }
}

/// A loaded child collection, shared between the owning model and every
/// handle returned by its accessor.
pub struct Children<C> {
    inner: Arc<ChildrenInner<C>>,
}

struct ChildrenInner<C> {
    items: RwLock<Vec<C>>,
}

impl<C> Clone for Children<C> {
    fn clone(&self) -> Self {
        Children {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> fmt::Debug for Children<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .inner
            .items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("Children").field("len", &len).finish()
    }
}

impl<C: Model> Children<C> {
    pub(crate) fn attach(items: Vec<C>) -> Self {
        let inner = Arc::new(ChildrenInner {
            items: RwLock::new(Vec::with_capacity(items.len())),
        });
        let weak: Weak<ChildrenInner<C>> = Arc::downgrade(&inner);
        let owner: Weak<dyn Detach + Send + Sync> = weak;
        let linked = items
            .into_iter()
            .map(|mut item| {
                item.set_parent_link(ParentLink {
                    owner: Some(owner.clone()),
                });
                item
            })
            .collect();
        *inner.items.write().unwrap_or_else(PoisonError::into_inner) = linked;
        Children { inner }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Snapshot of the current members. Copies stay linked to this
    /// collection, so deleting one removes it here.
    pub fn to_vec(&self) -> Vec<C> {
        self.read().clone()
    }

    pub fn get(&self, index: usize) -> Option<C> {
        self.read().get(index).cloned()
    }

    pub fn contains_key(&self, key: &C::Key) -> bool {
        self.read().iter().any(|c| c.key() == key)
    }

    /// Mutate one member in place, e.g. before a graph save.
    pub fn update<R>(&self, index: usize, change: impl FnOnce(&mut C) -> R) -> Option<R> {
        let mut items = self.inner.items.write().unwrap_or_else(PoisonError::into_inner);
        items.get_mut(index).map(change)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<C>> {
        self.inner.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn visit(
        &self,
        visit: &mut dyn FnMut(&mut dyn super::GraphNode) -> Result<(), DataError>,
    ) -> Result<(), DataError> {
        let mut items = self.inner.items.write().unwrap_or_else(PoisonError::into_inner);
        for item in items.iter_mut() {
            visit(item)?;
        }
        Ok(())
    }
}

/// Removal of a member from a loaded collection by stored key.
pub(crate) trait Detach {
    fn detach(&self, key: &Value) -> bool;
}

impl<C: Model> Detach for ChildrenInner<C> {
    fn detach(&self, key: &Value) -> bool {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        let before = items.len();
        items.retain(|item| match key_value::<C>(item.key()) {
            Ok(stored) => &stored != key,
            Err(_) => true,
        });
        items.len() != before
    }
}

/// Back-reference from a model to the loaded collection it came from.
///
/// Models fetched directly (not through a relation) carry an unattached
/// link.
#[derive(Clone, Default)]
pub struct ParentLink {
    owner: Option<Weak<dyn Detach + Send + Sync>>,
}

impl ParentLink {
    /// Whether the owning collection is still alive.
    pub fn is_attached(&self) -> bool {
        self.owner
            .as_ref()
            .map_or(false, |owner| owner.strong_count() > 0)
    }

    /// Remove the model with `key` from the owning collection, if any.
    pub(crate) fn detach(&self, key: &Value) -> bool {
        match self.owner.as_ref().and_then(Weak::upgrade) {
            Some(owner) => owner.detach(key),
            None => false,
        }
    }
}

impl fmt::Debug for ParentLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParentLink")
            .field("attached", &self.is_attached())
            .finish()
    }
}
