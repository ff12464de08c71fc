//! Tenant schema provisioner.
//!
//! Each tenant namespace is its own database file under the data root. New
//! namespaces are cloned from a `_template` namespace whose definitions come
//! from the canonical database's `sqlite_master` (carrying constraints and
//! defaults), minus internal and control-plane tables.
//!
//! Schema names are interpolated into paths and DDL, so every entry point
//! validates them against a strict pattern before touching anything.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use libsql::Connection;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, TenantError};
use crate::model::{AgentStatus, Tenant, TenantStatus};
use crate::store::migrations::INTERNAL_TABLES;
use crate::store::{Store, StoreRegistry};

/// Namespace every new tenant is cloned from.
pub const TEMPLATE_SCHEMA: &str = "_template";

/// Canonical-only tables that never appear in a tenant namespace.
const CONTROL_TABLES: &[&str] = &["tenants"];

static SCHEMA_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z][a-z0-9_]*$").unwrap());

/// Reject anything that is not a safe schema name, before any DDL runs.
pub fn validate_schema_name(schema_name: &str) -> Result<(), TenantError> {
    if SCHEMA_NAME_RE.is_match(schema_name) {
        Ok(())
    } else {
        Err(TenantError::InvalidSchemaName(schema_name.to_string()))
    }
}

pub struct SchemaProvisioner {
    data_root: PathBuf,
    canonical: Arc<dyn Store>,
    stores: Arc<StoreRegistry>,
}

impl SchemaProvisioner {
    pub fn new(data_root: PathBuf, canonical: Arc<dyn Store>, stores: Arc<StoreRegistry>) -> Self {
        Self {
            data_root,
            canonical,
            stores,
        }
    }

    fn namespace_path(&self, schema_name: &str) -> PathBuf {
        self.data_root.join(format!("{schema_name}.db"))
    }

    fn canonical_path(&self) -> PathBuf {
        self.data_root.join("canonical.db")
    }

    /// Create the template namespace from the canonical definitions. No-op
    /// when it already exists.
    pub async fn ensure_template(&self) -> Result<(), TenantError> {
        let template = self.namespace_path(TEMPLATE_SCHEMA);
        if template.exists() {
            return Ok(());
        }

        info!("Creating template namespace");
        if let Err(e) = self.clone_namespace(&self.canonical_path(), &template).await {
            remove_namespace_files(&template);
            return Err(e);
        }
        Ok(())
    }

    /// Create a tenant namespace as a clone of the template.
    ///
    /// Any mid-clone failure drops the whole namespace before returning, so
    /// a tenant either exists completely or not at all.
    pub async fn provision(&self, schema_name: &str) -> Result<(), TenantError> {
        validate_schema_name(schema_name)?;
        self.ensure_template().await?;

        let path = self.namespace_path(schema_name);
        if path.exists() {
            return Err(TenantError::ProvisionFailed {
                schema: schema_name.to_string(),
                reason: "namespace already exists".to_string(),
            });
        }

        if let Err(e) = self
            .clone_namespace(&self.namespace_path(TEMPLATE_SCHEMA), &path)
            .await
        {
            warn!(schema = %schema_name, error = %e, "Provisioning failed, dropping namespace");
            remove_namespace_files(&path);
            return Err(TenantError::ProvisionFailed {
                schema: schema_name.to_string(),
                reason: e.to_string(),
            });
        }
        info!(schema = %schema_name, "Namespace provisioned");
        Ok(())
    }

    /// Remove a namespace unconditionally.
    pub async fn drop_schema(&self, schema_name: &str) -> Result<(), TenantError> {
        validate_schema_name(schema_name)?;
        self.stores.evict(schema_name).await;
        remove_namespace_files(&self.namespace_path(schema_name));
        info!(schema = %schema_name, "Namespace dropped");
        Ok(())
    }

    /// Provision a complete tenant: canonical row + namespace, activated on
    /// success, fully rolled back on failure.
    pub async fn provision_tenant(&self, name: &str) -> Result<Tenant, TenantError> {
        let mut tenant = Tenant::from_name(name);
        validate_schema_name(&tenant.schema_name)?;

        if self.canonical.get_tenant(&tenant.schema_name).await?.is_some() {
            return Err(TenantError::ProvisionFailed {
                schema: tenant.schema_name,
                reason: "tenant already exists".to_string(),
            });
        }

        self.canonical.create_tenant(&tenant).await?;
        if let Err(e) = self.provision(&tenant.schema_name).await {
            let _ = self.canonical.delete_tenant(&tenant.schema_name).await;
            return Err(e);
        }
        self.canonical
            .set_tenant_status(&tenant.schema_name, TenantStatus::Active)
            .await?;
        tenant.status = TenantStatus::Active;
        info!(slug = %tenant.slug, schema = %tenant.schema_name, "Tenant provisioned");
        Ok(tenant)
    }

    /// Drop a tenant after verifying none of its agents is running.
    pub async fn drop_tenant(&self, schema_name: &str) -> Result<(), TenantError> {
        validate_schema_name(schema_name)?;
        let tenant = self
            .canonical
            .get_tenant(schema_name)
            .await?
            .ok_or_else(|| TenantError::NotFound(schema_name.to_string()))?;

        let store = self
            .stores
            .store_for(schema_name)
            .await
            .map_err(TenantError::Database)?;
        let running = store
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| a.status == AgentStatus::Running)
            .count();
        if running > 0 {
            return Err(TenantError::AgentsRunning {
                schema: schema_name.to_string(),
                count: running,
            });
        }

        self.canonical
            .set_tenant_status(schema_name, TenantStatus::Deleting)
            .await?;
        self.drop_schema(schema_name).await?;
        self.canonical.delete_tenant(schema_name).await?;
        info!(slug = %tenant.slug, schema = %schema_name, "Tenant dropped");
        Ok(())
    }

    /// Create `dst` and replay every clonable definition from `src` into it.
    /// The destination file is created first; callers remove it on failure.
    async fn clone_namespace(&self, src: &Path, dst: &Path) -> Result<(), TenantError> {
        let dst_conn = open_conn(dst).await?;
        let src_conn = open_conn(src).await?;

        let definitions = clonable_definitions(&src_conn).await?;
        for (name, sql) in &definitions {
            dst_conn.execute(sql, ()).await.map_err(|e| {
                TenantError::Database(DatabaseError::Query(format!(
                    "cloning {name} failed: {e}"
                )))
            })?;
        }
        debug!(src = %src.display(), dst = %dst.display(), objects = definitions.len(), "Namespace cloned");
        Ok(())
    }
}

async fn open_conn(path: &Path) -> Result<Connection, TenantError> {
    let db = libsql::Builder::new_local(path)
        .build()
        .await
        .map_err(|e| TenantError::Database(DatabaseError::Connection(e.to_string())))?;
    db.connect()
        .map_err(|e| TenantError::Database(DatabaseError::Connection(e.to_string())))
}

/// Table and index definitions worth cloning: everything except SQLite
/// internals, migration tracking, and control-plane tables (indexes follow
/// their table via `tbl_name`).
async fn clonable_definitions(conn: &Connection) -> Result<Vec<(String, String)>, TenantError> {
    let mut rows = conn
        .query(
            "SELECT name, tbl_name, sql FROM sqlite_master \
             WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%' \
             ORDER BY rowid",
            (),
        )
        .await
        .map_err(|e| TenantError::Database(DatabaseError::Query(e.to_string())))?;

    let mut definitions = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| TenantError::Database(DatabaseError::Query(e.to_string())))?
    {
        let name: String = row
            .get(0)
            .map_err(|e| TenantError::Database(DatabaseError::Query(e.to_string())))?;
        let tbl_name: String = row.get(1).unwrap_or_default();
        let sql: String = row
            .get(2)
            .map_err(|e| TenantError::Database(DatabaseError::Query(e.to_string())))?;

        if INTERNAL_TABLES.contains(&tbl_name.as_str())
            || CONTROL_TABLES.contains(&tbl_name.as_str())
        {
            continue;
        }
        definitions.push((name, sql));
    }
    Ok(definitions)
}

/// Remove a namespace's database file plus its WAL sidecars.
fn remove_namespace_files(path: &Path) {
    let _ = std::fs::remove_file(path);
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(sidecar));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlStore;
    use std::io::Write;

    struct Fixture {
        dir: tempfile::TempDir,
        provisioner: SchemaProvisioner,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let canonical: Arc<dyn Store> = Arc::new(
            LibSqlStore::open(&dir.path().join("canonical.db"))
                .await
                .unwrap(),
        );
        let stores = Arc::new(StoreRegistry::new(dir.path().to_path_buf()));
        Fixture {
            provisioner: SchemaProvisioner::new(dir.path().to_path_buf(), canonical, stores),
            dir,
        }
    }

    async fn table_names(path: &Path) -> Vec<String> {
        let conn = open_conn(path).await.unwrap();
        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name",
                (),
            )
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            names.push(row.get::<String>(0).unwrap());
        }
        names
    }

    #[test]
    fn schema_name_validation() {
        assert!(validate_schema_name("tenant_acme_corp").is_ok());
        assert!(validate_schema_name("a1_2").is_ok());
        assert!(validate_schema_name("Tenant_Acme").is_err());
        assert!(validate_schema_name("1tenant").is_err());
        assert!(validate_schema_name("tenant-acme").is_err());
        assert!(validate_schema_name("tenant; DROP TABLE tasks").is_err());
        assert!(validate_schema_name("").is_err());
    }

    #[tokio::test]
    async fn provision_clones_exactly_the_template_tables() {
        let fx = fixture().await;
        fx.provisioner.provision("tenant_acme").await.unwrap();

        let names = table_names(&fx.dir.path().join("tenant_acme.db")).await;
        // No _migrations (internal) and no tenants (control-plane)
        assert_eq!(names, vec!["agents", "messages", "tasks", "workflow_steps"]);

        let template = table_names(&fx.dir.path().join("_template.db")).await;
        assert_eq!(template, names);
    }

    #[tokio::test]
    async fn provision_rejects_invalid_names_before_any_ddl() {
        let fx = fixture().await;
        let err = fx.provisioner.provision("Tenant_ACME").await.unwrap_err();
        assert!(matches!(err, TenantError::InvalidSchemaName(_)));
        assert!(!fx.dir.path().join("Tenant_ACME.db").exists());
        // Not even the template was created
        assert!(!fx.dir.path().join("_template.db").exists());
    }

    #[tokio::test]
    async fn mid_clone_failure_leaves_zero_trace() {
        let fx = fixture().await;
        // A template that is not a database makes the clone fail after the
        // namespace file was created
        let template = fx.dir.path().join("_template.db");
        std::fs::File::create(&template)
            .unwrap()
            .write_all(b"this is not a database")
            .unwrap();

        let err = fx.provisioner.provision("tenant_doomed").await.unwrap_err();
        assert!(matches!(err, TenantError::ProvisionFailed { .. }));
        assert!(!fx.dir.path().join("tenant_doomed.db").exists());
    }

    #[tokio::test]
    async fn provision_twice_is_rejected() {
        let fx = fixture().await;
        fx.provisioner.provision("tenant_acme").await.unwrap();
        let err = fx.provisioner.provision("tenant_acme").await.unwrap_err();
        assert!(matches!(err, TenantError::ProvisionFailed { .. }));
    }

    #[tokio::test]
    async fn provision_tenant_round_trip() {
        let fx = fixture().await;
        let tenant = fx.provisioner.provision_tenant("Acme Corp").await.unwrap();
        assert_eq!(tenant.slug, "acme-corp");
        assert_eq!(tenant.schema_name, "tenant_acme_corp");
        assert_eq!(tenant.status, TenantStatus::Active);
        assert!(fx.dir.path().join("tenant_acme_corp.db").exists());

        fx.provisioner.drop_tenant("tenant_acme_corp").await.unwrap();
        assert!(!fx.dir.path().join("tenant_acme_corp.db").exists());
        let err = fx
            .provisioner
            .drop_tenant("tenant_acme_corp")
            .await
            .unwrap_err();
        assert!(matches!(err, TenantError::NotFound(_)));
    }

    #[tokio::test]
    async fn drop_tenant_refuses_while_agents_run() {
        let fx = fixture().await;
        let tenant = fx.provisioner.provision_tenant("Busy Co").await.unwrap();

        let store = LibSqlStore::open_existing(&fx.dir.path().join(format!(
            "{}.db",
            tenant.schema_name
        )))
        .await
        .unwrap();
        let agent = crate::model::Agent::new("sable", "Sable", std::env::temp_dir());
        store.create_agent(&agent).await.unwrap();
        store
            .set_agent_state("sable", AgentStatus::Running, None)
            .await
            .unwrap();

        let err = fx
            .provisioner
            .drop_tenant(&tenant.schema_name)
            .await
            .unwrap_err();
        assert!(matches!(err, TenantError::AgentsRunning { count: 1, .. }));
        assert!(fx
            .dir
            .path()
            .join(format!("{}.db", tenant.schema_name))
            .exists());
    }
}
