//! Shared backend client handles.
//!
//! Every component reaches the backend through one [`SharedClients`]. When the
//! retry wrapper or the tag manager reinitializes a client, the new handle is
//! swapped in place and every holder picks it up on its next call.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use crate::providers::{BackendError, ComputeApi, SearchApi, TaggingApi};

/// Builds fresh backend clients.
pub trait ClientFactory: Send + Sync {
    /// Create a compute client.
    ///
    /// # Errors
    /// Returns error if the underlying HTTP client cannot be built.
    fn compute(&self) -> Result<Arc<dyn ComputeApi>, BackendError>;

    /// Create a tagging client.
    ///
    /// # Errors
    /// Returns error if the underlying HTTP client cannot be built.
    fn tagging(&self) -> Result<Arc<dyn TaggingApi>, BackendError>;

    /// Create a search client.
    ///
    /// # Errors
    /// Returns error if the underlying HTTP client cannot be built.
    fn search(&self) -> Result<Arc<dyn SearchApi>, BackendError>;
}

struct Handles {
    compute: Arc<dyn ComputeApi>,
    tagging: Arc<dyn TaggingApi>,
    search: Arc<dyn SearchApi>,
}

/// Backend client handles with in-place reinitialization.
pub struct SharedClients {
    factory: Arc<dyn ClientFactory>,
    handles: RwLock<Handles>,
}

impl SharedClients {
    /// Build the initial set of clients.
    ///
    /// # Errors
    /// Returns error if any client cannot be built.
    pub fn new(factory: Arc<dyn ClientFactory>) -> Result<Self, BackendError> {
        let handles = Handles {
            compute: factory.compute()?,
            tagging: factory.tagging()?,
            search: factory.search()?,
        };
        Ok(Self {
            factory,
            handles: RwLock::new(handles),
        })
    }

    #[must_use]
    pub fn compute(&self) -> Arc<dyn ComputeApi> {
        Arc::clone(&self.read().compute)
    }

    #[must_use]
    pub fn tagging(&self) -> Arc<dyn TaggingApi> {
        Arc::clone(&self.read().tagging)
    }

    #[must_use]
    pub fn search(&self) -> Arc<dyn SearchApi> {
        Arc::clone(&self.read().search)
    }

    /// Replace every client.
    ///
    /// # Errors
    /// Returns error if a client cannot be built; the old handles stay in
    /// place in that case.
    pub fn reinit(&self) -> Result<(), BackendError> {
        info!("Reinitializing backend clients");
        let handles = Handles {
            compute: self.factory.compute()?,
            tagging: self.factory.tagging()?,
            search: self.factory.search()?,
        };
        *self.write() = handles;
        Ok(())
    }

    /// Replace the tagging client only.
    ///
    /// # Errors
    /// Returns error if the client cannot be built.
    pub fn reinit_tagging(&self) -> Result<(), BackendError> {
        info!("Reinitializing tagging client");
        let tagging = self.factory.tagging()?;
        self.write().tagging = tagging;
        Ok(())
    }

    /// Replace the search client only.
    ///
    /// # Errors
    /// Returns error if the client cannot be built.
    pub fn reinit_search(&self) -> Result<(), BackendError> {
        info!("Reinitializing search client");
        let search = self.factory.search()?;
        self.write().search = search;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Handles> {
        self.handles.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Handles> {
        self.handles.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SharedClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedClients").finish_non_exhaustive()
    }
}
