//! rsroles-server: Catalog services and authorization-server synchronization
//!
//! This crate keeps the capability catalog and the external authorization
//! server consistent:
//! - Module events applied to the catalog
//! - Dual-written roles, policies and scope permissions
//! - Assignment of capabilities and capability sets to roles and users
//! - Background reconciliation of loadable roles
//! - Migration jobs and duplicate collapsing
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               rsroles-server                 │
//! ├─────────────────────────────────────────────┤
//! │  app.rs        - Service wiring             │
//! │  services/     - Catalog services           │
//! │  sync/         - Dual-write building blocks │
//! │    coordinator.rs - Compensated writes      │
//! │    batch.rs       - Bounded fan-out         │
//! │    retrier.rs     - Backoff retries         │
//! │    rewriter.rs    - Duplicate collapsing    │
//! │  authz/        - Authorization-server API   │
//! │  events.rs     - Catalog change events      │
//! │  config.rs     - Configuration management   │
//! └─────────────────────────────────────────────┘
//! ```

pub mod app;
pub mod authz;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod observability;
pub mod services;
pub mod sync;
pub mod transaction;

// Re-exports for convenience
pub use app::SyncServices;
pub use config::{ConfigLoadError, ServiceConfig};
pub use context::ExecutionContext;
pub use error::{ServiceError, ServiceResult};
pub use events::{CatalogChange, CatalogEvent, CatalogEventBus};
