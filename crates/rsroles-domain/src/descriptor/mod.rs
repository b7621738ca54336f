//! Module descriptors and the descriptor merger.
//!
//! Modules announce their permissions and the endpoints each permission
//! protects. The merger folds these declarations into catalog records:
//!
//! 1. **Capabilities**: one per `(resource, action)` key, endpoints unioned
//! 2. **Capability-set descriptors**: one per permission set, members named by key
//!
//! Member ids are resolved later, against the catalog, by the catalog service.

mod action;
mod event;
mod merger;

pub use action::{parse_permission, permission_aliases, ParsedPermission};
pub use event::{
    EndpointDescriptor, ModuleEvent, ModuleEventType, ModuleType, PermissionDescriptor,
    ResourceDescriptor,
};
pub use merger::{CapabilitySetDescriptor, DescriptorMerger, MergeResult, SetMember};
