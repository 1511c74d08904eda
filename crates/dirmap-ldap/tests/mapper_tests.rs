//! Integration tests for change-tracking records.
//!
//! These tests cover finding and counting records, writing back only
//! changed fields, structural writes, filtered erase and the interaction
//! between record writes and the shared result cache.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use dirmap::prelude::*;
use dirmap_ldap::{FindOptions, Mapper, RawValue};

async fn find_one(mapper: &Mapper, filter: &str) -> Mapper {
    mapper
        .find(Some(filter), &FindOptions::new().with_limit(1), Duration::ZERO)
        .await
        .into_iter()
        .next()
        .unwrap_or_else(|| panic!("no record matches {filter}"))
}

// =============================================================================
// Query Tests
// =============================================================================

#[tokio::test]
async fn test_find_returns_normalized_records() {
    let directory = seeded_directory();
    let session = uncached_session(&directory);

    let alice = find_one(&people(&session), "(cn=Alice)").await;

    assert_eq!(alice.dn(), Some(ALICE));
    assert_eq!(alice.get("sn").unwrap().as_string(), Some("Smith"));
    assert_eq!(
        alice.get("mail").unwrap().as_strings(),
        vec!["alice@example.com", "a.smith@example.com"]
    );
    assert!(!alice.is_dirty());
    assert_eq!(alice.cast().get_string("dn"), Some(ALICE));
}

#[tokio::test]
async fn test_find_nothing() {
    let directory = seeded_directory();
    let session = uncached_session(&directory);

    let found = people(&session)
        .find(Some("(cn=Nobody)"), &FindOptions::new(), TTL)
        .await;
    assert!(found.is_empty());
}

#[tokio::test]
async fn test_count_and_scope() {
    let directory = seeded_directory();
    let session = uncached_session(&directory);
    let mapper = people(&session);

    assert_eq!(mapper.count(None, &FindOptions::new(), TTL).await, 4);
    assert_eq!(
        mapper
            .count(
                None,
                &FindOptions::new().with_scope(SearchScope::OneLevel),
                TTL
            )
            .await,
        3
    );
    assert_eq!(
        mapper
            .count(Some("(sn=Smith)"), &FindOptions::new(), TTL)
            .await,
        2
    );
}

#[tokio::test]
async fn test_second_find_is_served_from_cache() {
    let directory = seeded_directory();
    let session = cached_session(&directory);
    let mapper = people(&session);

    let first = mapper.find(Some("(sn=Smith)"), &FindOptions::new(), TTL).await;
    let second = mapper.find(Some("(sn=Smith)"), &FindOptions::new(), TTL).await;

    assert_eq!(first.len(), 2);
    assert_eq!(
        first.iter().map(Mapper::cast).collect::<Vec<_>>(),
        second.iter().map(Mapper::cast).collect::<Vec<_>>()
    );
    assert_eq!(directory.search_count(), 1);
}

#[tokio::test]
async fn test_zero_ttl_find_goes_to_directory() {
    let directory = seeded_directory();
    let session = cached_session(&directory);
    let mapper = people(&session);

    mapper.find(Some("(sn=Smith)"), &FindOptions::new(), Duration::ZERO).await;
    mapper.find(Some("(sn=Smith)"), &FindOptions::new(), Duration::ZERO).await;
    assert_eq!(directory.search_count(), 2);
}

#[tokio::test]
async fn test_unreachable_cache_still_finds() {
    let directory = seeded_directory();
    let session = unreachable_cache_session(&directory);
    let mapper = people(&session);

    let found = mapper.find(Some("(sn=Smith)"), &FindOptions::new(), TTL).await;
    assert_eq!(found.len(), 2);

    let mut bob = find_one(&mapper, "(cn=Bob)").await;
    bob.set("sn", "Brown");
    bob.update().await.unwrap();
    assert_eq!(directory.values(BOB, "sn"), Some(vec!["Brown".to_string()]));
}

#[tokio::test]
async fn test_load_hook_sees_each_record() {
    let directory = seeded_directory();
    let session = uncached_session(&directory);
    let loads = Arc::new(AtomicUsize::new(0));
    let counter = loads.clone();

    let mapper = people(&session).on_load(move |record| {
        counter.fetch_add(1, Ordering::SeqCst);
        let name = record
            .get("cn")
            .ok()
            .and_then(AttributeValue::as_string)
            .map(str::to_uppercase);
        if let Some(name) = name {
            record.set("displayName", name);
        }
    });

    let found = mapper
        .find(Some("(objectClass=person)"), &FindOptions::new(), TTL)
        .await;
    assert_eq!(loads.load(Ordering::SeqCst), 3);
    assert_eq!(
        found[0].get("displayName").unwrap().as_string(),
        Some("ALICE")
    );
}

// =============================================================================
// Change Tracking Tests
// =============================================================================

#[tokio::test]
async fn test_update_writes_only_changed_fields() {
    let directory = seeded_directory();
    let session = uncached_session(&directory);
    let mut alice = find_one(&people(&session), "(cn=Alice)").await;

    alice.set("sn", "Smith");
    alice.set("title", "Engineer");
    alice.set("mail", vec!["alice@example.com"]);
    alice.update().await.unwrap();

    let writes = directory.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].op, "modify");
    assert_eq!(writes[0].dn, ALICE);
    assert_eq!(
        writes[0].attributes,
        AttributeSet::new()
            .with("title", "Engineer")
            .with("mail", vec!["alice@example.com"])
    );
    assert_eq!(
        directory.values(ALICE, "mail"),
        Some(vec!["alice@example.com".to_string()])
    );
}

#[tokio::test]
async fn test_resync_is_idempotent() {
    let directory = seeded_directory();
    let session = uncached_session(&directory);
    let mut bob = find_one(&people(&session), "(cn=Bob)").await;

    bob.set("title", "Manager");
    bob.update().await.unwrap();
    bob.update().await.unwrap();

    assert_eq!(directory.writes().len(), 1);
}

#[tokio::test]
async fn test_cleared_field_stays_in_directory() {
    let directory = seeded_directory();
    let session = uncached_session(&directory);
    let mut bob = find_one(&people(&session), "(cn=Bob)").await;

    bob.clear("mail");
    bob.update().await.unwrap();
    assert!(directory.writes().is_empty());
    assert!(directory.values(BOB, "mail").is_some());

    bob.set("mail", AttributeValue::Null);
    bob.update().await.unwrap();
    assert!(directory.values(BOB, "mail").is_none());
}

#[tokio::test]
async fn test_update_invalidates_only_its_record() {
    let directory = seeded_directory();
    let session = cached_session(&directory);
    let mapper = people(&session);

    let before = mapper.find(Some("(cn=Bob)"), &FindOptions::new(), TTL).await;
    session.lock().await.get_entry(BOB, TTL).await;
    assert_eq!(directory.search_count(), 2);

    let mut bob = before[0].clone();
    bob.set("mail", "robert@example.com");
    bob.update().await.unwrap();

    let fresh = session.lock().await.get_entry(BOB, TTL).await.unwrap();
    assert_eq!(fresh.attributes.get_string("mail"), Some("robert@example.com"));
    assert_eq!(directory.search_count(), 3);

    let stale = mapper.find(Some("(cn=Bob)"), &FindOptions::new(), TTL).await;
    assert_eq!(directory.search_count(), 3);
    assert_eq!(
        stale[0].get("mail").unwrap().as_string(),
        Some("bob@example.com")
    );
}

#[tokio::test]
async fn test_binary_field_is_written_verbatim() {
    let directory = seeded_directory();
    let session = uncached_session(&directory);
    let mut alice = find_one(&people(&session), "(cn=Alice)").await;
    let photo = vec![0xff, 0xd8, 0xff, 0xe0];

    alice.set("jpegPhoto", AttributeValue::Binary(photo.clone()));
    alice.update().await.unwrap();
    assert_eq!(
        directory.raw_values(ALICE, "jpegPhoto"),
        Some(vec![RawValue::Binary(photo.clone())])
    );

    let reread = find_one(&people(&session), "(cn=Alice)").await;
    assert_eq!(
        reread.get("jpegPhoto").unwrap(),
        &AttributeValue::Binary(photo)
    );
}

#[tokio::test]
async fn test_nested_map_field_fails_update() {
    let directory = seeded_directory();
    let session = uncached_session(&directory);
    let mut bob = find_one(&people(&session), "(cn=Bob)").await;
    let address: std::collections::BTreeMap<String, AttributeValue> =
        [("city".to_string(), AttributeValue::from("Oslo"))]
            .into_iter()
            .collect();

    bob.set("title", "Manager");
    bob.set("postalAddress", AttributeValue::Object(address));
    let err = bob.update().await.unwrap_err();

    assert!(matches!(err, DirectoryError::InvalidData { .. }));
    assert!(err.to_string().contains("postalAddress"));
    assert!(directory.writes().is_empty());
    assert!(directory.values(BOB, "title").is_none());
}

#[tokio::test]
async fn test_failed_update_propagates_and_advances_snapshot() {
    let directory = seeded_directory();
    let session = uncached_session(&directory);
    let mut bob = find_one(&people(&session), "(cn=Bob)").await;

    bob.set("title", "Manager");
    directory.fail_next(53, "unwilling to perform");
    let err = bob.update().await.unwrap_err();
    assert_eq!(err.result_code(), Some(53));
    assert!(err.is_permanent());

    // The snapshot moved on, so the lost change is not resent.
    assert!(bob.get_changes().is_empty());
    bob.update().await.unwrap();
    assert!(directory.writes().is_empty());
    assert!(directory.values(BOB, "title").is_none());

    let reread = find_one(&people(&session), "(cn=Bob)").await;
    assert!(!reread.exists("title"));
}

#[tokio::test]
async fn test_failed_insert_propagates_and_keeps_changes() {
    let directory = seeded_directory();
    let session = uncached_session(&directory);
    let dave_dn = "cn=Dave,ou=people,dc=example,dc=com";

    let mut dave = people(&session);
    dave.set("dn", dave_dn);
    dave.set("cn", "Dave");
    directory.fail_next(53, "unwilling to perform");

    let err = dave.insert().await.unwrap_err();
    assert_eq!(err.result_code(), Some(53));
    assert!(dave.is_dirty());
    assert!(!directory.contains(dave_dn));

    dave.insert().await.unwrap();
    assert!(directory.contains(dave_dn));
    assert_eq!(directory.writes().len(), 1);
}

// =============================================================================
// Structural Write Tests
// =============================================================================

#[tokio::test]
async fn test_insert_creates_record_and_flushes_cache() {
    let directory = seeded_directory();
    let session = cached_session(&directory);
    let mapper = people(&session);

    assert_eq!(mapper.count(None, &FindOptions::new(), TTL).await, 4);

    let mut dave = people(&session);
    dave.set("dn", "cn=Dave,ou=people,dc=example,dc=com");
    dave.set("cn", "Dave");
    dave.set("objectClass", vec!["top", "person"]);
    assert!(dave.is_dirty());
    dave.insert().await.unwrap();
    assert!(!dave.is_dirty());

    assert_eq!(mapper.count(None, &FindOptions::new(), TTL).await, 5);
    assert_eq!(directory.search_count(), 2);

    let err = dave.insert().await.unwrap_err();
    assert!(matches!(err, DirectoryError::ObjectAlreadyExists { .. }));
}

#[tokio::test]
async fn test_rename_and_move() {
    let directory = seeded_directory();
    let session = uncached_session(&directory);
    let mut carol = find_one(&people(&session), "(cn=Carol)").await;

    carol.rename(&Rdn::new("cn", "Caroline"), true).await.unwrap();
    assert_eq!(carol.dn(), Some("cn=Caroline,ou=people,dc=example,dc=com"));
    assert!(!directory.contains(CAROL));

    carol.move_to(GROUPS).await.unwrap();
    assert_eq!(carol.dn(), Some("cn=Caroline,ou=groups,dc=example,dc=com"));
    assert!(directory.contains("cn=Caroline,ou=groups,dc=example,dc=com"));

    carol.set("title", "Moved");
    carol.update().await.unwrap();
    assert_eq!(
        directory.values("cn=Caroline,ou=groups,dc=example,dc=com", "title"),
        Some(vec!["Moved".to_string()])
    );
}

// =============================================================================
// Erase Tests
// =============================================================================

#[tokio::test]
async fn test_erase_self() {
    let directory = seeded_directory();
    let session = uncached_session(&directory);
    let mut bob = find_one(&people(&session), "(cn=Bob)").await;

    assert_eq!(bob.erase(None).await.unwrap(), 1);
    assert!(!directory.contains(BOB));
    assert!(bob.dn().is_none());
}

#[tokio::test]
async fn test_erase_by_filter() {
    let directory = seeded_directory();
    let session = uncached_session(&directory);
    let mut mapper = people(&session);

    assert_eq!(mapper.erase(Some("(sn=Smith)")).await.unwrap(), 2);
    assert!(!directory.contains(ALICE));
    assert!(!directory.contains(CAROL));
    assert!(directory.contains(BOB));

    assert_eq!(mapper.erase(Some("(sn=Smith)")).await.unwrap(), 0);
}

#[tokio::test]
async fn test_erase_reports_partial_failure() {
    let directory = seeded_directory();
    let session = uncached_session(&directory);
    let mut root = Mapper::new(session.clone(), "dc=example,dc=com");

    let err = root
        .erase(Some("(|(ou=groups)(cn=Bob))"))
        .await
        .unwrap_err();

    match err {
        DirectoryError::EraseIncomplete { erased, failed } => {
            assert_eq!(erased, 1);
            assert_eq!(failed, vec![GROUPS.to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!directory.contains(BOB));
    assert!(directory.contains(GROUPS));
}

#[tokio::test]
async fn test_erase_while_iterating() {
    let directory = seeded_directory();
    let session = uncached_session(&directory);
    let mut mapper = people(&session);

    let loaded = mapper
        .load(Some("(objectClass=person)"), &FindOptions::new(), TTL)
        .await;
    assert_eq!(loaded, 3);
    assert_eq!(mapper.dn(), Some(ALICE));

    mapper.erase(None).await.unwrap();
    assert_eq!(mapper.dn(), Some(BOB));
    assert_eq!(mapper.loaded(), 2);
}
