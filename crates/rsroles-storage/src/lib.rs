//! rsroles-storage: Catalog store abstraction layer
//!
//! This crate provides the relational system-of-record interface for the
//! capability catalog, including:
//! - `CatalogStore` trait for catalog, assignment-graph and migration records
//! - In-memory implementation for testing and embedded use
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              rsroles-storage                 │
//! ├─────────────────────────────────────────────┤
//! │  traits.rs   - CatalogStore definition      │
//! │  memory.rs   - In-memory implementation     │
//! │  error.rs    - StorageError                 │
//! └─────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod memory;
pub mod traits;

// Re-export commonly used types
pub use error::{StorageError, StorageResult};
pub use memory::MemoryCatalogStore;
pub use traits::CatalogStore;
