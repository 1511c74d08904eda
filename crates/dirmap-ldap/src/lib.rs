//! # LDAP Directory Mapping
//!
//! Search sessions, entry normalization and change-tracking records over
//! LDAP directories.
//!
//! ## Features
//!
//! - Lazy search sessions with a cursor over the result set
//! - Result caching keyed by search parameters or by DN
//! - Normalization of multi-valued wire entries into canonical records
//! - Records that write back only the fields that changed
//! - An in-process transport for tests and offline use
//!
//! ## Example
//!
//! ```ignore
//! use dirmap::prelude::*;
//! use dirmap_ldap::{FindOptions, LdapConfig, Mapper, SearchSession};
//! use std::time::Duration;
//!
//! let config = LdapConfig::new(
//!     "ldap.example.com",
//!     "dc=example,dc=com",
//!     "cn=admin,dc=example,dc=com",
//! )
//! .with_password("secret");
//!
//! let cache = ResultCache::from_settings(&config.cache);
//! let session = SearchSession::connect(&config, cache).await?.into_shared();
//!
//! let people = Mapper::new(session, "ou=people,dc=example,dc=com");
//! let mut alice = people
//!     .find(Some("(cn=Alice)"), &FindOptions::new().with_limit(1), Duration::from_secs(60))
//!     .await
//!     .remove(0);
//! alice.set("mail", "alice@example.com");
//! alice.update().await?;
//! ```

pub mod config;
pub mod mapper;
pub mod memory;
pub mod normalize;
pub mod raw;
pub mod session;
pub mod transport;

// Re-exports
pub use config::{LdapConfig, SearchDefaults};
pub use mapper::{FindOptions, LoadHook, Mapper};
pub use memory::{MemoryTransport, RecordedWrite};
pub use normalize::{normalize, normalize_all};
pub use raw::{RawEntry, RawItem, RawValue};
pub use session::{LastError, SearchSession, SessionState, SharedSession};
pub use transport::{DirectoryTransport, LdapTransport, SessionOption};
