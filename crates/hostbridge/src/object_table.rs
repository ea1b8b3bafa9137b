//! Handle table for host objects exposed to the backend.
//!
//! Handle 0 is the root context, bound at construction and never released.
//! Other handles count up from 1 and are never reused, even after release.
//! Lookup by referent is a linear identity scan; the table only holds objects
//! that actually crossed the boundary.

use crate::error::BridgeError;
use crate::host::{HostRef, same_object};

pub const ROOT_HANDLE: u32 = 0;

#[derive(Debug)]
struct Entry {
    handle: u32,
    referent: HostRef,
    display_name: Option<String>,
}

#[derive(Debug)]
pub struct ObjectTable {
    /// Sorted by handle: allocation only ever appends.
    entries: Vec<Entry>,
    next_handle: u32,
}

impl ObjectTable {
    pub fn new(root: HostRef, root_name: impl Into<String>) -> Self {
        Self {
            entries: vec![Entry {
                handle: ROOT_HANDLE,
                referent: root,
                display_name: Some(root_name.into()),
            }],
            next_handle: ROOT_HANDLE + 1,
        }
    }

    /// Existing handle for `referent`, or a freshly allocated one.
    pub fn get_handle(&mut self, referent: &HostRef) -> u32 {
        if let Some(handle) = self.find(referent) {
            return handle;
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        tracing::trace!(handle, "Allocated object handle");
        self.entries.push(Entry {
            handle,
            referent: referent.clone(),
            display_name: None,
        });
        handle
    }

    /// Handle for `referent` without allocating.
    pub fn find(&self, referent: &HostRef) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| same_object(&e.referent, referent))
            .map(|e| e.handle)
    }

    pub fn resolve(&self, handle: u32) -> Result<HostRef, BridgeError> {
        self.entry(handle)
            .map(|e| e.referent.clone())
            .ok_or(BridgeError::ObjectHandleUnknown(handle))
    }

    /// Drop the entry. The root is never released; unknown handles are a no-op.
    pub fn release(&mut self, handle: u32) -> bool {
        if handle == ROOT_HANDLE {
            return false;
        }
        match self.entries.binary_search_by_key(&handle, |e| e.handle) {
            Ok(idx) => {
                self.entries.remove(idx);
                tracing::trace!(handle, "Released object handle");
                true
            }
            Err(_) => false,
        }
    }

    pub fn display_name(&self, handle: u32) -> Option<&str> {
        self.entry(handle).and_then(|e| e.display_name.as_deref())
    }

    /// Attach a display name, allocating a handle if needed.
    pub fn set_display_name(&mut self, referent: &HostRef, name: impl Into<String>) -> u32 {
        let handle = self.get_handle(referent);
        if let Some(idx) = self.index_of(handle) {
            self.entries[idx].display_name = Some(name.into());
        }
        handle
    }

    pub fn root(&self) -> HostRef {
        self.entries[0].referent.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn index_of(&self, handle: u32) -> Option<usize> {
        self.entries
            .binary_search_by_key(&handle, |e| e.handle)
            .ok()
    }

    fn entry(&self, handle: u32) -> Option<&Entry> {
        self.index_of(handle).map(|idx| &self.entries[idx])
    }
}
