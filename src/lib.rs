//! # persona: personalization key-value and dataset store
//!
//! persona keeps small string values under plain, versioned and per-user
//! versioned keys, and manages structured "dataset" documents. Data lives in
//! one of two interchangeable backends:
//!
//! - **Elasticsearch**: records and datasets share one index; supports
//!   filter queries over documents
//! - **etcd**: flat namespaced keys; key-value operations only
//!
//! The backend is chosen once at startup by [`storage::open_engine`] and
//! shared as an `Arc<dyn StorageEngine>`.
//!
//! # Usage
//!
//! ```bash
//! persona --config persona.toml init-index
//! persona --config persona.toml set --version v1 theme dark
//! persona --config persona.toml export app-1 > app-1.json
//! ```

pub mod config;
pub mod context;
pub mod service;
pub mod storage;

pub use config::{Config, ConfigError};
pub use context::RequestContext;
pub use service::{PersonaService, ServiceError};
pub use storage::{
    open_engine, DocumentStore, KeyValueStore, StorageEngine, StorageError, StorageResult,
};
