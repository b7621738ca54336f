//! rsroles-domain: Capability catalog model and descriptor merging
//!
//! This crate contains the pure (I/O free) part of the capability catalog:
//! - Catalog model: capabilities, capability sets, roles, policies, assignments
//! - Permission-name parsing into `(resource, action)` keys
//! - Descriptor merger that folds module registrations into catalog records
//! - Deterministic naming of objects mirrored to the authorization server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               rsroles-domain                 │
//! ├─────────────────────────────────────────────┤
//! │  model/      - Catalog entities             │
//! │  descriptor/ - Module events & merger       │
//! │  naming.rs   - External object names        │
//! └─────────────────────────────────────────────┘
//! ```

pub mod descriptor;
pub mod error;
pub mod model;
pub mod naming;

// Re-export commonly used types at the crate root
pub use descriptor::{DescriptorMerger, MergeResult};
pub use error::{DomainError, DomainResult};
