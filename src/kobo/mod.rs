//! Kobo Sync Module
//!
//! Keeps a reader's position in step between Kobo e-readers and the web
//! reader. Devices push partial, independently timestamped reading states;
//! the server merges them field by field, mirrors progress into the web
//! reader's cursor, derives a read status, and answers state requests from a
//! chain of fallbacks when no device-authored record exists.
//!
//! # Layout
//!
//! - [`timestamp`]: parsing and canonical formatting of device timestamps
//! - [`merge`]: per-field last-writer-wins merge
//! - [`status`]: read-status derivation with an anti-echo debounce
//! - [`bridge`]: device bookmark <-> web reader progress
//! - [`service`]: the save / get / delete entry points
//! - [`store`], [`repository`]: persistence seams and their SQL
//! - [`notifier`]: outbound progress notifications
//!
//! # Usage
//!
//! ```rust,ignore
//! use bibliotek::kobo;
//!
//! for (name, sql) in kobo::migrations() {
//!     // Run migration...
//! }
//!
//! let app = Router::new()
//!     .nest("/kobo", kobo::routes())
//!     .with_state(app_state);
//! ```

pub mod bridge;
pub mod clock;
mod handler;
pub mod merge;
pub mod notifier;
pub mod repository;
mod routes;
pub mod service;
pub mod status;
pub mod store;
pub mod timestamp;

pub use routes::routes;
pub use service::{SyncOptions, SyncService};

/// Schema for reading states and progress. Runs after the core schema,
/// which owns `users`.
pub fn migrations() -> &'static [(&'static str, &'static str)] {
    &[("kobo_001_schema.sql", include_str!("migrations/001_schema.sql"))]
}
