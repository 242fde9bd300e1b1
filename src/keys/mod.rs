// API Key Management
//
// Key records and balances (store), scope resolution (scopes), parent/child
// relations (hierarchy), rotation schedules (rotation) and key groups
// (groups). The store is the single owner of ApiKeyRecord mutation; every
// other subsystem reads through it or mutates credits via its operations.

pub mod groups;
pub mod hierarchy;
pub mod rotation;
pub mod scopes;
pub mod store;

pub use groups::{KeyGroup, KeyGroupManager};
pub use hierarchy::{HierarchyConfig, KeyHierarchyManager, KeyRelation};
pub use rotation::{KeyRotationScheduler, RotationPolicy, RotationSchedule};
pub use scopes::{KeyScopeManager, ScopeConfig, ToolAccess};
pub use store::{ApiKeyRecord, CreateKeyOptions, KeyStore, KeyStoreConfig, QuotaCounters};
