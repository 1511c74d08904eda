//! # Directory Mapping Framework
//!
//! Protocol-agnostic building blocks for reading and writing directory
//! records.
//!
//! ## Crate Organization
//!
//! - [`error`] - Error taxonomy with transient/permanent classification
//! - [`ids`] - Type-safe identifiers
//! - [`operation`] - Attribute values, canonical entries, search parameters, filters
//! - [`diff`] - Change detection between a record and its snapshot
//! - [`cursor`] - Iteration over a loaded result set
//! - [`cache`] - Result cache keyed by search or by DN
//! - [`config`] - Configuration trait and shared settings
//!
//! ## Example
//!
//! ```
//! use dirmap::prelude::*;
//!
//! let data = AttributeSet::new().with("mail", "a@x.com");
//! let snapshot = AttributeSet::new().with("mail", "old@x.com");
//! let changes = recursive_diff(&data, &snapshot);
//! assert_eq!(changes.get_string("mail"), Some("a@x.com"));
//! ```

pub mod cache;
pub mod config;
pub mod cursor;
pub mod diff;
pub mod error;
pub mod ids;
pub mod operation;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cache::{CacheKey, CacheStore, CachedValue, MokaCacheStore, ResultCache};
    pub use crate::config::{CacheSettings, ConnectionSettings, DirectoryConfig};
    pub use crate::cursor::{Cursor, RecordCursor};
    pub use crate::diff::recursive_diff;
    pub use crate::error::{DirectoryError, DirectoryResult};
    pub use crate::ids::SessionId;
    pub use crate::operation::{
        AttributeSet, AttributeValue, CanonicalEntry, DerefPolicy, Filter, Rdn, SearchParams,
        SearchScope, DN_ATTRIBUTE, MATCH_ALL_FILTER,
    };
}

// Re-export async_trait for store and transport implementors
pub use async_trait::async_trait;
