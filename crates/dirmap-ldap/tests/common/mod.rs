//! Integration test helpers for dirmap-ldap.
//!
//! Provides a seeded in-memory directory, session builders and a cache
//! store that is always down.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use dirmap::prelude::*;
use dirmap_ldap::{Mapper, MemoryTransport, SearchSession, SharedSession};

static INIT: Once = Once::new();

pub const PEOPLE: &str = "ou=people,dc=example,dc=com";
pub const GROUPS: &str = "ou=groups,dc=example,dc=com";
pub const ALICE: &str = "cn=Alice,ou=people,dc=example,dc=com";
pub const BOB: &str = "cn=Bob,ou=people,dc=example,dc=com";
pub const CAROL: &str = "cn=Carol,ou=people,dc=example,dc=com";

/// TTL long enough to outlive any test.
pub const TTL: Duration = Duration::from_secs(300);

/// Initialize logging for tests (once).
pub fn init_test_logging() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
        }
    });
}

/// A small directory: two organizational units, three people, one group.
pub fn seeded_directory() -> MemoryTransport {
    init_test_logging();

    MemoryTransport::new("memory://ldap.example.com")
        .with_entry("dc=example,dc=com", &[("dc", &["example"])])
        .with_entry(PEOPLE, &[("ou", &["people"])])
        .with_entry(GROUPS, &[("ou", &["groups"])])
        .with_entry(
            ALICE,
            &[
                ("cn", &["Alice"]),
                ("sn", &["Smith"]),
                ("mail", &["alice@example.com", "a.smith@example.com"]),
                ("objectClass", &["top", "person"]),
            ],
        )
        .with_entry(
            BOB,
            &[
                ("cn", &["Bob"]),
                ("sn", &["Jones"]),
                ("mail", &["bob@example.com"]),
                ("objectClass", &["top", "person"]),
            ],
        )
        .with_entry(
            CAROL,
            &[
                ("cn", &["Carol"]),
                ("sn", &["Smith"]),
                ("objectClass", &["top", "person"]),
            ],
        )
        .with_entry(
            "cn=admins,ou=groups,dc=example,dc=com",
            &[("cn", &["admins"]), ("member", &[ALICE])],
        )
        .with_credentials("cn=admin,dc=example,dc=com", "secret")
}

/// A shared session over `transport` with an in-process cache.
pub fn cached_session(transport: &MemoryTransport) -> SharedSession {
    let cache = ResultCache::from_settings(&CacheSettings::default());
    SearchSession::new(transport.clone(), cache).into_shared()
}

/// A shared session over `transport` with caching switched off.
pub fn uncached_session(transport: &MemoryTransport) -> SharedSession {
    SearchSession::new(transport.clone(), ResultCache::disabled()).into_shared()
}

/// A shared session whose cache service refuses every call.
pub fn unreachable_cache_session(transport: &MemoryTransport) -> SharedSession {
    let cache = ResultCache::new(Arc::new(UnreachableStore));
    SearchSession::new(transport.clone(), cache).into_shared()
}

/// A mapper over the people subtree.
pub fn people(session: &SharedSession) -> Mapper {
    Mapper::new(session.clone(), PEOPLE)
}

/// Cache store that is always down.
pub struct UnreachableStore;

#[async_trait]
impl CacheStore for UnreachableStore {
    async fn exists(&self, _key: &str) -> DirectoryResult<bool> {
        Err(DirectoryError::cache_unavailable("connection refused"))
    }

    async fn get(&self, _key: &str) -> DirectoryResult<Option<CachedValue>> {
        Err(DirectoryError::cache_unavailable("connection refused"))
    }

    async fn set(&self, _key: &str, _value: CachedValue, _ttl: Duration) -> DirectoryResult<()> {
        Err(DirectoryError::cache_unavailable("connection refused"))
    }

    async fn clear(&self, _key: &str) -> DirectoryResult<()> {
        Err(DirectoryError::cache_unavailable("connection refused"))
    }

    async fn reset(&self) -> DirectoryResult<()> {
        Err(DirectoryError::cache_unavailable("connection refused"))
    }
}
