//! Registry of open partition resources.
//!
//! Whoever opens a partition may register its location here.  When the
//! underlying resource disappears out of band (a file is deleted, a remote
//! mount goes away), [`ResourceRegistry::invalidate`] flags every
//! registration for that location; holders poll
//! [`Registration::is_invalidated`] and drop their handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::debug;

/// One registered resource.
#[derive(Debug)]
pub struct Registration {
    id: u64,
    uri: String,
    invalidated: AtomicBool,
}

impl Registration {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }
}

pub trait ResourceRegistry: Send + Sync {
    /// Registers an open resource at `uri`.
    fn register(&self, uri: &str) -> Arc<Registration>;

    /// Removes `registration`.  Unknown registrations are ignored.
    fn unregister(&self, registration: &Registration);

    /// Flags every registration for `uri` as invalid and removes it.
    /// Returns the number of registrations affected.
    fn invalidate(&self, uri: &str) -> usize;
}

/// A [`ResourceRegistry`] guarded by a mutex, usable from any thread.
#[derive(Debug, Default)]
pub struct SharedRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Arc<Registration>>>,
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide registry.
    pub fn global() -> Arc<SharedRegistry> {
        static GLOBAL: OnceLock<Arc<SharedRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(SharedRegistry::new())).clone()
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResourceRegistry for SharedRegistry {
    fn register(&self, uri: &str) -> Arc<Registration> {
        let registration = Arc::new(Registration {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            uri: uri.to_owned(),
            invalidated: AtomicBool::new(false),
        });
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(registration.id, registration.clone());
        registration
    }

    fn unregister(&self, registration: &Registration) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&registration.id);
    }

    fn invalidate(&self, uri: &str) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut count = 0;
        entries.retain(|_, registration| {
            if registration.uri == uri {
                registration.invalidated.store(true, Ordering::Release);
                count += 1;
                false
            } else {
                true
            }
        });
        if count > 0 {
            debug!("invalidated {count} registration(s) for {uri}");
        }
        count
    }
}
