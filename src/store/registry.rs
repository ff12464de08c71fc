//! Per-tenant store registry.
//!
//! Each tenant namespace is its own database file under the data root. The
//! registry opens handles lazily and caches them so every caller shares one
//! connection per namespace.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::DatabaseError;
use crate::store::{LibSqlStore, Store};
use crate::tenant::validate_schema_name;

/// Lazily-opened, cached store handles keyed by namespace name.
pub struct StoreRegistry {
    data_root: PathBuf,
    stores: Mutex<HashMap<String, Arc<dyn Store>>>,
}

impl StoreRegistry {
    pub fn new(data_root: PathBuf) -> Self {
        Self {
            data_root,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Path of a namespace's database file.
    pub fn namespace_path(&self, schema_name: &str) -> PathBuf {
        self.data_root.join(format!("{schema_name}.db"))
    }

    /// Get (or open) the store for a tenant namespace.
    ///
    /// The namespace file must already exist — provisioning creates it from
    /// the template. Opening skips migrations; schema comes from the clone.
    pub async fn store_for(&self, schema_name: &str) -> Result<Arc<dyn Store>, DatabaseError> {
        // Names become file paths; anything outside the schema-name pattern
        // (including `_template` and traversal attempts) is not a namespace.
        if validate_schema_name(schema_name).is_err() {
            return Err(DatabaseError::NotFound {
                entity: "namespace".into(),
                id: schema_name.into(),
            });
        }

        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(schema_name) {
            return Ok(Arc::clone(store));
        }

        let path = self.namespace_path(schema_name);
        if !path.exists() {
            return Err(DatabaseError::NotFound {
                entity: "namespace".into(),
                id: schema_name.into(),
            });
        }

        let store: Arc<dyn Store> = Arc::new(LibSqlStore::open_existing(&path).await?);
        stores.insert(schema_name.to_string(), Arc::clone(&store));
        debug!(namespace = %schema_name, "Namespace store cached");
        Ok(store)
    }

    /// Drop a cached handle (namespace deleted or about to be).
    pub async fn evict(&self, schema_name: &str) {
        self.stores.lock().await.remove(schema_name);
    }
}
