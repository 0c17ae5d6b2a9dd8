//! Remote API boundary for FieldSync.
//!
//! The engine talks to the server only through [`RemoteApi`]. Production
//! builds plug an HTTP client in behind it; [`MemoryRemote`] is an
//! in-process fake server used by tests and the CLI demo.

pub mod api;
pub mod error;
pub mod memory;

pub use api::{
    DatedResponse, DeletedRecords, ListQuery, Page, PageMeta, RemoteApi, RemoteRecord, Scope,
};
pub use error::{ApiError, ApiResult};
pub use memory::MemoryRemote;
