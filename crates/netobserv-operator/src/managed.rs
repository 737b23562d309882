//! Registry of objects owned by one component
//!
//! Objects are registered once, when the component reconciler is built, and
//! addressed afterwards through the returned [`Handle`]. Each reconcile
//! starts with [`ManagedObjects::fetch_all`], after which
//! [`ManagedObjects::exists`] tells whether the object is deployed.
//!
//! Owner references do not cross namespaces, so moving the operator
//! namespace requires deleting the objects left in the previous one
//! explicitly ([`ManagedObjects::cleanup_namespace`]).

use crate::error::Result;
use crate::store::{from_dynamic, ObjectKey, ObjectKind, ObjectStore};
use kube::api::DynamicObject;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Handle on a registered object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

#[derive(Debug, Clone)]
struct Entry {
    kind: ObjectKind,
    name: String,
    object: Option<DynamicObject>,
}

#[derive(Debug, Clone)]
pub struct ManagedObjects {
    namespace: String,
    entries: Vec<Entry>,
}

impl ManagedObjects {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: Vec::new(),
        }
    }

    /// Register an object; two registrations of the same kind and name are
    /// still tracked independently
    pub fn register(&mut self, kind: ObjectKind, name: impl Into<String>) -> Handle {
        self.entries.push(Entry {
            kind,
            name: name.into(),
            object: None,
        });
        Handle(self.entries.len() - 1)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Switch namespace; fetched objects are forgotten
    pub fn set_namespace(&mut self, namespace: &str) {
        if self.namespace != namespace {
            self.namespace = namespace.to_string();
            for entry in &mut self.entries {
                entry.object = None;
            }
        }
    }

    pub fn key(&self, handle: Handle) -> ObjectKey {
        let entry = &self.entries[handle.0];
        ObjectKey::new(entry.kind, &self.namespace, &entry.name)
    }

    /// Fetch every registered object from the current namespace
    ///
    /// Missing objects are flagged, any other error aborts.
    pub async fn fetch_all(
        &mut self,
        store: &dyn ObjectStore,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut fetched = Vec::new();
        let mut not_found = Vec::new();
        for i in 0..self.entries.len() {
            let key = self.key(Handle(i));
            let object = store.get(&key, cancel).await.inspect_err(|e| {
                error!(object = %key, error = %e, "Failed to fetch managed object");
            })?;
            match object {
                Some(_) => fetched.push(key.to_string()),
                None => not_found.push(key.to_string()),
            }
            self.entries[i].object = object;
        }
        if !fetched.is_empty() {
            info!(objects = %fetched.join(", "), "Fetched managed objects");
        }
        if !not_found.is_empty() {
            info!(objects = %not_found.join(", "), "Managed objects not deployed");
        }
        Ok(())
    }

    /// True when the last fetch found the object
    pub fn exists(&self, handle: Handle) -> bool {
        self.entries
            .get(handle.0)
            .is_some_and(|e| e.object.is_some())
    }

    pub fn get(&self, handle: Handle) -> Option<&DynamicObject> {
        self.entries.get(handle.0).and_then(|e| e.object.as_ref())
    }

    pub fn get_typed<K: DeserializeOwned>(&self, handle: Handle) -> Result<Option<K>> {
        self.get(handle).map(from_dynamic).transpose()
    }

    /// Record the object returned by a write
    pub fn set(&mut self, handle: Handle, object: Option<DynamicObject>) {
        if let Some(entry) = self.entries.get_mut(handle.0) {
            entry.object = object;
        }
    }

    /// Best-effort deletion of every namespaced object from `namespace`
    pub async fn cleanup_namespace(
        &self,
        store: &dyn ObjectStore,
        namespace: &str,
        cancel: &CancellationToken,
    ) {
        for entry in self.entries.iter().filter(|e| e.kind.is_namespaced()) {
            let key = ObjectKey::new(entry.kind, namespace, &entry.name);
            info!(object = %key, "Deleting object from previous namespace");
            if let Err(e) = store.delete(&key, cancel).await {
                if !e.is_not_found() {
                    error!(object = %key, error = %e, "Failed to delete old object");
                }
            }
        }
    }

    /// Best-effort deletion of a fetched object
    pub async fn try_delete(
        &mut self,
        store: &dyn ObjectStore,
        handle: Handle,
        cancel: &CancellationToken,
    ) {
        if !self.exists(handle) {
            return;
        }
        let key = self.key(handle);
        info!(object = %key, "Deleting object");
        match store.delete(&key, cancel).await {
            Ok(()) => self.set(handle, None),
            Err(e) if e.is_not_found() => self.set(handle, None),
            Err(e) => error!(object = %key, error = %e, "Failed to delete object"),
        }
    }

    /// Best-effort deletion of every fetched object
    pub async fn try_delete_all(&mut self, store: &dyn ObjectStore, cancel: &CancellationToken) {
        for i in 0..self.entries.len() {
            self.try_delete(store, Handle(i), cancel).await;
        }
    }
}
