//! Persistence — backend-agnostic `Store` trait, libsql backend, and the
//! per-tenant store registry.

mod libsql_backend;
pub mod migrations;
mod registry;
mod traits;

pub use libsql_backend::LibSqlStore;
pub use registry::StoreRegistry;
pub use traits::Store;
