//! Catalog entities.

mod assignment;
mod capability;
mod loadable;
mod migration;
mod policy;
mod role;

pub use assignment::{Edge, EdgeTable, Grant, Subject};
pub use capability::{
    union_endpoints, Capability, CapabilityAction, CapabilityKey, CapabilitySet, CapabilityType,
    Endpoint, HttpMethod,
};
pub use loadable::{LoadablePermission, LoadableRole};
pub use migration::{MigrationError, MigrationErrorType, MigrationJob, MigrationStatus};
pub use policy::{
    DecisionStrategy, ExternalPolicy, Logic, Policy, PolicyKind, PolicyType, RolePolicy, RoleRef,
    TimePolicy, UserPolicy,
};
pub use role::{Role, RoleType};
