//! External collaborator wrappers: the object store, the granule-index
//! client, and the permission client. None of these hold job state — they
//! are narrow trait-shaped facades the orchestrator calls out to.

pub mod granule_index;
pub mod object_store;
pub mod permission;

pub use granule_index::{GranuleIndexClient, GranuleQuery, GranuleQueryResult, HttpGranuleIndexClient};
pub use object_store::{LocalFsObjectStore, ObjectStore, S3ObjectStore};
pub use permission::{HttpPermissionClient, PermissionClient};
