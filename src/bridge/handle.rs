//! Handle liveness table.
//!
//! Scripts never hold native objects directly. They hold a [`HandleId`], and
//! every dereference goes through [`HandleTable::resolve`]. When the daemon
//! drops the native object it revokes the id; later dereferences fail with
//! [`Error::HandleExpired`].
//!
//! Each entry also counts live script references (userdata objects). A
//! revoked entry stays in the table until those references are collected,
//! then [`HandleTable::sweep`] removes it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::convert::TypeTag;
use crate::error::{Error, Result};

/// Opaque identifier of a native object exposed to scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

struct Entry {
    tag: TypeTag,
    object: Option<Arc<dyn Any + Send + Sync>>,
    script_refs: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<u64, Entry>,
    next_id: u64,
}

/// Table of native objects reachable from scripts.
#[derive(Default)]
pub struct HandleTable {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("Handle table mutex poisoned");
        f.debug_struct("HandleTable")
            .field("entries", &inner.entries.len())
            .field("next_id", &inner.next_id)
            .finish()
    }
}

impl HandleTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live native object and return its id.
    pub fn insert<T: Any + Send + Sync>(&self, tag: TypeTag, object: Arc<T>) -> HandleId {
        let mut inner = self.inner.lock().expect("Handle table mutex poisoned");
        inner.next_id += 1;
        let id = inner.next_id;
        let object: Arc<dyn Any + Send + Sync> = object;
        inner.entries.insert(
            id,
            Entry {
                tag,
                object: Some(object),
                script_refs: 0,
            },
        );
        log::debug!("Registered handle {} ({})", id, tag.name());
        HandleId(id)
    }

    /// Look up a live object of type `T`.
    pub fn resolve<T: Any + Send + Sync>(&self, id: HandleId) -> Result<Arc<T>> {
        let object = {
            let inner = self.inner.lock().expect("Handle table mutex poisoned");
            inner
                .entries
                .get(&id.0)
                .and_then(|e| e.object.clone())
                .ok_or(Error::HandleExpired(id.0))?
        };
        object.downcast::<T>().map_err(|_wrong| {
            Error::BridgeConversion(format!(
                "handle {} is not a {}",
                id.0,
                std::any::type_name::<T>()
            ))
        })
    }

    /// Type tag of a live handle.
    pub fn tag(&self, id: HandleId) -> Result<TypeTag> {
        let inner = self.inner.lock().expect("Handle table mutex poisoned");
        match inner.entries.get(&id.0) {
            Some(entry) if entry.object.is_some() => Ok(entry.tag),
            _ => Err(Error::HandleExpired(id.0)),
        }
    }

    /// Whether the native object behind `id` still exists.
    pub fn is_alive(&self, id: HandleId) -> bool {
        let inner = self.inner.lock().expect("Handle table mutex poisoned");
        inner
            .entries
            .get(&id.0)
            .is_some_and(|e| e.object.is_some())
    }

    /// Record a new script-side reference. Fails for revoked handles.
    pub fn acquire(&self, id: HandleId) -> Result<()> {
        let mut inner = self.inner.lock().expect("Handle table mutex poisoned");
        match inner.entries.get_mut(&id.0) {
            Some(entry) if entry.object.is_some() => {
                entry.script_refs += 1;
                Ok(())
            }
            _ => Err(Error::HandleExpired(id.0)),
        }
    }

    /// Drop one script-side reference. Unknown ids are ignored.
    pub fn release(&self, id: HandleId) {
        let mut inner = self.inner.lock().expect("Handle table mutex poisoned");
        if let Some(entry) = inner.entries.get_mut(&id.0) {
            entry.script_refs = entry.script_refs.saturating_sub(1);
        }
    }

    /// Number of live script references to `id`.
    pub fn script_refs(&self, id: HandleId) -> usize {
        let inner = self.inner.lock().expect("Handle table mutex poisoned");
        inner.entries.get(&id.0).map_or(0, |e| e.script_refs)
    }

    /// Free the native object behind `id`.
    ///
    /// Returns false if the id was unknown or already revoked.
    pub fn revoke(&self, id: HandleId) -> bool {
        let mut inner = self.inner.lock().expect("Handle table mutex poisoned");
        match inner.entries.get_mut(&id.0) {
            Some(entry) if entry.object.is_some() => {
                entry.object = None;
                log::debug!("Revoked handle {}", id.0);
                true
            }
            _ => false,
        }
    }

    /// Revoke every handle. Used at shutdown.
    pub fn revoke_all(&self) {
        let mut inner = self.inner.lock().expect("Handle table mutex poisoned");
        for entry in inner.entries.values_mut() {
            entry.object = None;
        }
    }

    /// Remove revoked entries that no script still references.
    ///
    /// Returns how many entries were removed.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock().expect("Handle table mutex poisoned");
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, e| e.object.is_some() || e.script_refs > 0);
        before - inner.entries.len()
    }

    /// Number of entries, revoked ones included.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("Handle table mutex poisoned")
            .entries
            .len()
    }

    /// True when the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A counted script-side reference to a handle.
///
/// Creating one increments the entry's reference count; dropping it
/// decrements it. Userdata objects own exactly one of these.
pub struct HandleRef {
    id: HandleId,
    table: Arc<HandleTable>,
}

impl std::fmt::Debug for HandleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRef").field("id", &self.id).finish()
    }
}

impl HandleRef {
    /// Take a reference to `id`. Fails if the handle is already revoked.
    pub fn new(table: &Arc<HandleTable>, id: HandleId) -> Result<Self> {
        table.acquire(id)?;
        Ok(Self {
            id,
            table: Arc::clone(table),
        })
    }

    /// The referenced id.
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Resolve to the native object.
    pub fn resolve<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        self.table.resolve(self.id)
    }
}

impl Drop for HandleRef {
    fn drop(&mut self) {
        self.table.release(self.id);
    }
}
